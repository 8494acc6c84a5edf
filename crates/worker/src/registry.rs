//! 任务注册表: 任务类型 → 作业函数
//!
//! 注册表在进程启动时构建, 之后只读。未注册的任务类型不会被执行,
//! Worker 会把对应任务挂起。

use std::collections::HashMap;
use std::sync::Arc;

use cronpool_core::{JobFunction, JobSpec, TimeoutsConfig};
use cronpool_infrastructure::MetricsCollector;
use tracing::{info, warn};

use crate::executors::{CommandJob, HttpJob, MisconfiguredJob};
use crate::parallel_executor::JobConfig;
use crate::pipeline::PipelineJob;

/// 注册表中的一个条目
#[derive(Clone)]
pub struct RegisteredJob {
    pub task_type: String,
    pub function: Arc<dyn JobFunction>,
    /// 作业自身配置的超时, 由超时守卫结合覆盖配置解析
    pub timeout_seconds: Option<u64>,
}

impl std::fmt::Debug for RegisteredJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredJob")
            .field("task_type", &self.task_type)
            .field("kind", &self.function.kind())
            .field("timeout_seconds", &self.timeout_seconds)
            .finish()
    }
}

#[derive(Debug, Clone, Default)]
pub struct TaskRegistry {
    jobs: HashMap<String, RegisteredJob>,
}

impl TaskRegistry {
    pub fn builder() -> TaskRegistryBuilder {
        TaskRegistryBuilder::default()
    }

    /// 按 `[jobs.*]` 配置构建注册表
    ///
    /// 无法构建的条目 (HTTP方法无效、流水线引用了不存在的作业等) 仍然注册,
    /// 但执行时返回配置错误。
    pub fn from_config(
        jobs: &HashMap<String, JobSpec>,
        timeouts: &TimeoutsConfig,
        client: reqwest::Client,
        metrics: Option<Arc<MetricsCollector>>,
    ) -> Self {
        let mut builder = Self::builder();

        // 先注册叶子作业, 流水线步骤要引用它们
        for (task_type, spec) in jobs {
            let function: Arc<dyn JobFunction> = match spec {
                JobSpec::Http {
                    endpoint,
                    method,
                    body,
                    headers,
                    ..
                } => match HttpJob::new(client.clone(), endpoint.clone(), method) {
                    Ok(job) => Arc::new(
                        job.with_body(body.clone())
                            .with_headers(headers.clone()),
                    ),
                    Err(e) => Arc::new(MisconfiguredJob::new(format!("{task_type}: {e}"))),
                },
                JobSpec::Command {
                    program,
                    args,
                    env,
                    working_dir,
                    ..
                } => Arc::new(
                    CommandJob::new(program.clone())
                        .args(args.clone())
                        .env(env.clone())
                        .working_dir(working_dir.clone()),
                ),
                JobSpec::Pipeline { .. } => continue,
            };
            info!("注册作业 {} (类型: {})", task_type, spec.kind());
            builder = builder.register(task_type.clone(), function, spec.timeout_seconds());
        }

        let leaves = builder.jobs.clone();
        for (task_type, spec) in jobs {
            let JobSpec::Pipeline {
                max_workers,
                steps,
                timeout_seconds,
            } = spec
            else {
                continue;
            };

            let mut configs = Vec::with_capacity(steps.len());
            let mut problem = None;
            for step in steps {
                match leaves.get(&step.job) {
                    Some(leaf) => {
                        let timeout = timeouts
                            .resolve(&step.job, step.timeout_seconds.or(leaf.timeout_seconds));
                        configs.push(
                            JobConfig::new(step.name.clone(), leaf.function.clone())
                                .timeout(timeout)
                                .dependencies(step.depends_on.iter().cloned()),
                        );
                    }
                    None if jobs.contains_key(&step.job) => {
                        problem = Some(format!(
                            "流水线 {task_type} 的步骤 {} 引用了流水线 {}，不支持嵌套",
                            step.name, step.job
                        ));
                        break;
                    }
                    None => {
                        problem = Some(format!(
                            "流水线 {task_type} 的步骤 {} 引用了未注册的作业 {}",
                            step.name, step.job
                        ));
                        break;
                    }
                }
            }

            let function: Arc<dyn JobFunction> = match problem {
                Some(message) => Arc::new(MisconfiguredJob::new(message)),
                None => {
                    let mut pipeline = PipelineJob::new(*max_workers, configs);
                    if let Some(metrics) = &metrics {
                        pipeline = pipeline.with_metrics(metrics.clone());
                    }
                    Arc::new(pipeline)
                }
            };
            info!("注册流水线 {} ({} 个步骤)", task_type, steps.len());
            builder = builder.register(task_type.clone(), function, *timeout_seconds);
        }

        builder.build()
    }

    pub fn get(&self, task_type: &str) -> Option<&RegisteredJob> {
        self.jobs.get(task_type)
    }

    pub fn contains(&self, task_type: &str) -> bool {
        self.jobs.contains_key(task_type)
    }

    pub fn task_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.jobs.keys().cloned().collect();
        types.sort();
        types
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

#[derive(Default)]
pub struct TaskRegistryBuilder {
    jobs: HashMap<String, RegisteredJob>,
}

impl TaskRegistryBuilder {
    /// 同名任务类型后注册的覆盖先注册的
    pub fn register(
        mut self,
        task_type: impl Into<String>,
        function: Arc<dyn JobFunction>,
        timeout_seconds: Option<u64>,
    ) -> Self {
        let task_type = task_type.into();
        let entry = RegisteredJob {
            task_type: task_type.clone(),
            function,
            timeout_seconds,
        };
        if self.jobs.insert(task_type.clone(), entry).is_some() {
            warn!("任务类型 {} 被重复注册，使用后注册的作业", task_type);
        }
        self
    }

    pub fn build(self) -> TaskRegistry {
        TaskRegistry { jobs: self.jobs }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cronpool_core::{PipelineStepSpec, SchedulerError};
    use std::time::Duration;

    fn command(program: &str, timeout_seconds: Option<u64>) -> JobSpec {
        JobSpec::Command {
            program: program.to_string(),
            args: vec![],
            env: HashMap::new(),
            working_dir: None,
            timeout_seconds,
        }
    }

    fn step(name: &str, job: &str, depends_on: &[&str]) -> PipelineStepSpec {
        PipelineStepSpec {
            name: name.to_string(),
            job: job.to_string(),
            depends_on: depends_on.iter().map(|d| d.to_string()).collect(),
            timeout_seconds: None,
        }
    }

    fn build(jobs: HashMap<String, JobSpec>) -> TaskRegistry {
        TaskRegistry::from_config(&jobs, &TimeoutsConfig::default(), reqwest::Client::new(), None)
    }

    #[test]
    fn test_builder_registers_jobs() {
        let registry = TaskRegistry::builder()
            .register("cleanup", Arc::new(CommandJob::new("true")), Some(30))
            .build();

        assert!(registry.contains("cleanup"));
        assert!(!registry.contains("scraping"));
        assert_eq!(registry.get("cleanup").unwrap().timeout_seconds, Some(30));
        assert_eq!(registry.task_types(), vec!["cleanup".to_string()]);
    }

    #[test]
    fn test_pipeline_steps_resolve_timeouts() {
        let mut jobs = HashMap::new();
        jobs.insert("scraping".to_string(), command("true", None));
        jobs.insert("clustering".to_string(), command("true", Some(45)));
        jobs.insert(
            "processing".to_string(),
            JobSpec::Pipeline {
                max_workers: 2,
                steps: vec![
                    step("scrape", "scraping", &[]),
                    step("cluster", "clustering", &["scrape"]),
                ],
                timeout_seconds: Some(3600),
            },
        );

        let registry = build(jobs);
        assert_eq!(registry.len(), 3);
        let pipeline = registry.get("processing").unwrap();
        assert_eq!(pipeline.function.kind(), "pipeline");
        assert_eq!(pipeline.timeout_seconds, Some(3600));
    }

    #[tokio::test]
    async fn test_pipeline_with_unknown_job_is_misconfigured() {
        let mut jobs = HashMap::new();
        jobs.insert(
            "processing".to_string(),
            JobSpec::Pipeline {
                max_workers: 2,
                steps: vec![step("scrape", "scraping", &[])],
                timeout_seconds: None,
            },
        );

        let registry = build(jobs);
        let entry = registry.get("processing").unwrap();
        let err = entry.function.run().await.unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidJobConfig(ref m) if m.contains("scraping")));
    }

    #[tokio::test]
    async fn test_nested_pipeline_is_misconfigured() {
        let mut jobs = HashMap::new();
        jobs.insert("cleanup".to_string(), command("true", None));
        jobs.insert(
            "inner".to_string(),
            JobSpec::Pipeline {
                max_workers: 1,
                steps: vec![step("clean", "cleanup", &[])],
                timeout_seconds: None,
            },
        );
        jobs.insert(
            "outer".to_string(),
            JobSpec::Pipeline {
                max_workers: 1,
                steps: vec![step("nested", "inner", &[])],
                timeout_seconds: None,
            },
        );

        let registry = build(jobs);
        let err = registry.get("outer").unwrap().function.run().await.unwrap_err();
        assert!(err.is_configuration_error());
        assert!(err.to_string().contains("嵌套"));
        assert_eq!(registry.get("inner").unwrap().function.kind(), "pipeline");
    }

    #[tokio::test]
    async fn test_invalid_http_method_is_misconfigured() {
        let mut jobs = HashMap::new();
        jobs.insert(
            "scraping".to_string(),
            JobSpec::Http {
                endpoint: "http://127.0.0.1:9/scrape".to_string(),
                method: "NOT A METHOD".to_string(),
                body: None,
                headers: HashMap::new(),
                timeout_seconds: None,
            },
        );

        let registry = build(jobs);
        let entry = registry.get("scraping").unwrap();
        assert_eq!(entry.function.kind(), "misconfigured");
        let err = tokio::time::timeout(Duration::from_secs(1), entry.function.run())
            .await
            .unwrap()
            .unwrap_err();
        assert!(err.is_configuration_error());
    }
}
