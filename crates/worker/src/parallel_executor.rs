//! 并行作业执行器
//!
//! 在依赖关系和并发上限的约束下运行一组作业, 每个作业有各自的超时。
//! 某个作业失败时, 依赖它的作业 (包括间接依赖) 不会运行并直接记为失败,
//! 与之无关的作业照常执行。

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use cronpool_core::{JobFunction, JobSummary, SchedulerError, SchedulerResult};
use cronpool_infrastructure::{run_with_timeout, GuardOutcome, MetricsCollector};
use futures::stream::{FuturesUnordered, StreamExt};
use tracing::{debug, info, warn};

/// 一个待执行的作业
#[derive(Clone)]
pub struct JobConfig {
    pub name: String,
    pub function: Arc<dyn JobFunction>,
    pub timeout: Option<Duration>,
    pub dependencies: Vec<String>,
}

impl JobConfig {
    pub fn new(name: impl Into<String>, function: Arc<dyn JobFunction>) -> Self {
        Self {
            name: name.into(),
            function,
            timeout: None,
            dependencies: Vec::new(),
        }
    }

    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn depends_on(mut self, dependency: impl Into<String>) -> Self {
        self.dependencies.push(dependency.into());
        self
    }

    pub fn dependencies<I, S>(mut self, dependencies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies
            .extend(dependencies.into_iter().map(Into::into));
        self
    }
}

impl std::fmt::Debug for JobConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobConfig")
            .field("name", &self.name)
            .field("kind", &self.function.kind())
            .field("timeout", &self.timeout)
            .field("dependencies", &self.dependencies)
            .finish()
    }
}

/// 单个作业的结果, `executed = false` 表示因依赖失败而未运行
#[derive(Debug, Clone)]
pub struct JobResult {
    pub name: String,
    pub success: bool,
    pub duration: Duration,
    pub error: Option<String>,
    pub timed_out: bool,
    pub result: Option<JobSummary>,
    pub executed: bool,
}

impl JobResult {
    fn from_outcome(name: String, outcome: GuardOutcome<JobSummary>) -> Self {
        let duration = outcome.duration();
        match outcome {
            GuardOutcome::Completed { value, .. } => Self {
                name,
                success: true,
                duration,
                error: None,
                timed_out: false,
                result: Some(value),
                executed: true,
            },
            GuardOutcome::Failed { error, .. } => Self {
                name,
                success: false,
                duration,
                error: Some(error.to_string()),
                timed_out: false,
                result: None,
                executed: true,
            },
            GuardOutcome::TimedOut { timeout, .. } => Self {
                name,
                success: false,
                duration,
                error: Some(format!("作业超时 (超时时间: {}秒)", timeout.as_secs())),
                timed_out: true,
                result: None,
                executed: true,
            },
        }
    }

    fn skipped(name: String, failed_dependency: &str) -> Self {
        Self {
            name,
            success: false,
            duration: Duration::ZERO,
            error: Some(format!("依赖作业 {failed_dependency} 失败，未执行")),
            timed_out: false,
            result: None,
            executed: false,
        }
    }
}

pub struct ParallelJobExecutor {
    max_workers: usize,
    jobs: Vec<JobConfig>,
    metrics: Option<Arc<MetricsCollector>>,
}

impl ParallelJobExecutor {
    /// `max_workers` 为0时按1处理
    pub fn new(max_workers: usize) -> Self {
        Self {
            max_workers: max_workers.max(1),
            jobs: Vec::new(),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// 添加作业, 名称重复时拒绝
    pub fn add_job(&mut self, job: JobConfig) -> SchedulerResult<()> {
        if self.jobs.iter().any(|existing| existing.name == job.name) {
            return Err(SchedulerError::InvalidJobConfig(format!(
                "作业名称重复: {}",
                job.name
            )));
        }
        self.jobs.push(job);
        Ok(())
    }

    fn validate_dependencies(&self) -> SchedulerResult<()> {
        let names: HashSet<&str> = self.jobs.iter().map(|j| j.name.as_str()).collect();
        for job in &self.jobs {
            if let Some(unknown) = job
                .dependencies
                .iter()
                .find(|dep| !names.contains(dep.as_str()))
            {
                return Err(SchedulerError::InvalidJobConfig(format!(
                    "作业 {} 依赖未知的作业 {}",
                    job.name, unknown
                )));
            }
        }
        Ok(())
    }

    /// 执行全部作业并返回按名称索引的结果
    ///
    /// 没有作业可以运行且仍有作业未完成时返回 [`SchedulerError::DependencyDeadlock`]。
    pub async fn execute_all(&self) -> SchedulerResult<HashMap<String, JobResult>> {
        self.validate_dependencies()?;

        let mut pending: Vec<&JobConfig> = self.jobs.iter().collect();
        let mut completed: HashSet<String> = HashSet::new();
        let mut failed: HashSet<String> = HashSet::new();
        let mut results: HashMap<String, JobResult> = HashMap::new();
        let mut running = FuturesUnordered::new();

        info!(
            "开始并行执行 {} 个作业 (最大并发: {})",
            self.jobs.len(),
            self.max_workers
        );

        loop {
            // 依赖失败的作业直接记为失败, 直到不再有变化
            loop {
                let blocked: Vec<(String, String)> = pending
                    .iter()
                    .filter_map(|job| {
                        job.dependencies
                            .iter()
                            .find(|dep| failed.contains(dep.as_str()))
                            .map(|dep| (job.name.clone(), dep.clone()))
                    })
                    .collect();
                if blocked.is_empty() {
                    break;
                }
                for (name, dep) in blocked {
                    warn!("作业 {} 的依赖 {} 失败，跳过执行", name, dep);
                    pending.retain(|job| job.name != name);
                    failed.insert(name.clone());
                    results.insert(name.clone(), JobResult::skipped(name, &dep));
                }
            }

            if pending.is_empty() && running.is_empty() {
                break;
            }

            let capacity = self.max_workers.saturating_sub(running.len());
            let ready: Vec<&JobConfig> = pending
                .iter()
                .filter(|job| job.dependencies.iter().all(|dep| completed.contains(dep)))
                .take(capacity)
                .copied()
                .collect();

            for job in ready {
                pending.retain(|p| p.name != job.name);
                debug!("提交作业 {}", job.name);

                let name = job.name.clone();
                let function = job.function.clone();
                let timeout = job.timeout;
                running.push(async move {
                    let outcome =
                        run_with_timeout(&name, async move { function.run().await }, timeout).await;
                    (name, outcome)
                });
            }

            if running.is_empty() {
                let mut names: Vec<String> = pending.iter().map(|job| job.name.clone()).collect();
                names.sort();
                return Err(SchedulerError::DependencyDeadlock { pending: names });
            }

            if let Some((name, outcome)) = running.next().await {
                let result = JobResult::from_outcome(name.clone(), outcome);
                if let Some(metrics) = &self.metrics {
                    metrics.record_pipeline_step(
                        &name,
                        result.success,
                        result.duration.as_secs_f64(),
                    );
                }
                if result.success {
                    debug!("作业 {} 完成，耗时 {:?}", name, result.duration);
                    completed.insert(name.clone());
                } else {
                    warn!("作业 {} 失败: {:?}", name, result.error);
                    failed.insert(name.clone());
                }
                results.insert(name, result);
            }
        }

        info!(
            "并行执行结束: 成功 {} 个, 失败 {} 个",
            completed.len(),
            failed.len()
        );
        Ok(results)
    }
}
