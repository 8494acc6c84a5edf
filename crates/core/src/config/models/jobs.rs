use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 任务注册表条目, 按任务类型配置
///
/// ```toml
/// [jobs.scraping]
/// kind = "http"
/// endpoint = "http://collector:8000/jobs/scrape"
///
/// [jobs.cleanup]
/// kind = "command"
/// program = "/usr/local/bin/cleanup"
/// args = ["--days", "30"]
///
/// [jobs.processing_pipeline]
/// kind = "pipeline"
/// max_workers = 2
/// steps = [
///   { name = "scrape", job = "scraping" },
///   { name = "cluster", job = "clustering", depends_on = ["scrape"] },
/// ]
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobSpec {
    /// 调用协作方的HTTP接口, 响应体作为作业摘要
    Http {
        endpoint: String,
        #[serde(default = "default_http_method")]
        method: String,
        #[serde(default)]
        body: Option<Value>,
        #[serde(default)]
        headers: HashMap<String, String>,
        #[serde(default)]
        timeout_seconds: Option<u64>,
    },
    /// 启动子进程, 超时被中止时子进程随之被杀掉
    Command {
        program: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: HashMap<String, String>,
        #[serde(default)]
        working_dir: Option<String>,
        #[serde(default)]
        timeout_seconds: Option<u64>,
    },
    /// 通过并行作业执行器扇出到其他已注册的作业
    Pipeline {
        #[serde(default = "default_pipeline_workers")]
        max_workers: usize,
        steps: Vec<PipelineStepSpec>,
        #[serde(default)]
        timeout_seconds: Option<u64>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PipelineStepSpec {
    pub name: String,
    /// 被引用作业的任务类型
    pub job: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
}

fn default_http_method() -> String {
    "POST".to_string()
}

fn default_pipeline_workers() -> usize {
    4
}

impl JobSpec {
    pub fn kind(&self) -> &'static str {
        match self {
            JobSpec::Http { .. } => "http",
            JobSpec::Command { .. } => "command",
            JobSpec::Pipeline { .. } => "pipeline",
        }
    }

    pub fn timeout_seconds(&self) -> Option<u64> {
        match self {
            JobSpec::Http { timeout_seconds, .. }
            | JobSpec::Command { timeout_seconds, .. }
            | JobSpec::Pipeline { timeout_seconds, .. } => *timeout_seconds,
        }
    }

    /// 只检查条目自身的形状; 流水线步骤之间的引用在执行时检查,
    /// 接线错误只会挂起对应任务而不会阻止进程启动
    pub fn validate(&self, task_type: &str) -> anyhow::Result<()> {
        match self {
            JobSpec::Http { endpoint, method, .. } => {
                if endpoint.is_empty() {
                    return Err(anyhow::anyhow!("作业 {task_type} 的endpoint不能为空"));
                }
                let valid_methods = ["GET", "POST", "PUT", "PATCH", "DELETE"];
                if !valid_methods.contains(&method.to_uppercase().as_str()) {
                    return Err(anyhow::anyhow!(
                        "作业 {task_type} 的HTTP方法无效: {method}，支持的方法: {:?}",
                        valid_methods
                    ));
                }
            }
            JobSpec::Command { program, .. } => {
                if program.is_empty() {
                    return Err(anyhow::anyhow!("作业 {task_type} 的program不能为空"));
                }
            }
            JobSpec::Pipeline {
                max_workers, steps, ..
            } => {
                if *max_workers == 0 {
                    return Err(anyhow::anyhow!("作业 {task_type} 的max_workers必须大于0"));
                }
                if steps.is_empty() {
                    return Err(anyhow::anyhow!("作业 {task_type} 至少需要一个步骤"));
                }
            }
        }

        if self.timeout_seconds() == Some(0) {
            return Err(anyhow::anyhow!("作业 {task_type} 的超时时间必须大于0"));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_job_kinds() {
        let jobs: HashMap<String, JobSpec> = toml::from_str(
            r#"
            [scraping]
            kind = "http"
            endpoint = "http://collector/jobs/scrape"
            timeout_seconds = 900

            [cleanup]
            kind = "command"
            program = "echo"
            args = ["done"]

            [pipeline]
            kind = "pipeline"
            steps = [
                { name = "a", job = "scraping" },
                { name = "b", job = "cleanup", depends_on = ["a"] },
            ]
            "#,
        )
        .unwrap();

        match &jobs["scraping"] {
            JobSpec::Http { method, timeout_seconds, .. } => {
                assert_eq!(method, "POST");
                assert_eq!(*timeout_seconds, Some(900));
            }
            other => panic!("unexpected job spec: {other:?}"),
        }
        assert_eq!(jobs["cleanup"].kind(), "command");
        match &jobs["pipeline"] {
            JobSpec::Pipeline { max_workers, steps, .. } => {
                assert_eq!(*max_workers, 4);
                assert_eq!(steps[1].depends_on, vec!["a".to_string()]);
            }
            other => panic!("unexpected job spec: {other:?}"),
        }
        for (task_type, spec) in &jobs {
            assert!(spec.validate(task_type).is_ok());
        }
    }

    #[test]
    fn test_invalid_specs() {
        let spec = JobSpec::Pipeline {
            max_workers: 2,
            steps: vec![],
            timeout_seconds: None,
        };
        assert!(spec.validate("p").is_err());

        let spec = JobSpec::Http {
            endpoint: "http://x".to_string(),
            method: "TRACE".to_string(),
            body: None,
            headers: HashMap::new(),
            timeout_seconds: None,
        };
        assert!(spec.validate("h").is_err());
    }
}
