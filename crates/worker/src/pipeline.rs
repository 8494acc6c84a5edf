//! 流水线作业: 一个任务类型扇出为多个有依赖关系的步骤

use std::sync::Arc;

use async_trait::async_trait;
use cronpool_core::{JobFunction, JobSummary, SchedulerError, SchedulerResult};
use cronpool_infrastructure::MetricsCollector;
use serde_json::{json, Map, Value};
use tracing::{info, warn};

use crate::parallel_executor::{JobConfig, ParallelJobExecutor};

pub struct PipelineJob {
    max_workers: usize,
    steps: Vec<JobConfig>,
    metrics: Option<Arc<MetricsCollector>>,
}

impl PipelineJob {
    pub fn new(max_workers: usize, steps: Vec<JobConfig>) -> Self {
        Self {
            max_workers,
            steps,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn steps(&self) -> &[JobConfig] {
        &self.steps
    }
}

#[async_trait]
impl JobFunction for PipelineJob {
    fn kind(&self) -> &str {
        "pipeline"
    }

    /// 任一步骤失败 (含因依赖失败未运行) 时整个作业失败
    async fn run(&self) -> SchedulerResult<JobSummary> {
        let mut executor = ParallelJobExecutor::new(self.max_workers);
        if let Some(metrics) = &self.metrics {
            executor = executor.with_metrics(metrics.clone());
        }
        for step in &self.steps {
            executor.add_job(step.clone())?;
        }

        let results = executor.execute_all().await?;

        let mut failed: Vec<String> = Vec::new();
        let mut details = Map::new();
        for step in &self.steps {
            let Some(result) = results.get(&step.name) else {
                continue;
            };
            if !result.success {
                failed.push(format!(
                    "{}: {}",
                    step.name,
                    result.error.as_deref().unwrap_or("未知错误")
                ));
            }
            details.insert(
                step.name.clone(),
                json!({
                    "success": result.success,
                    "executed": result.executed,
                    "timed_out": result.timed_out,
                    "duration_seconds": result.duration.as_secs_f64(),
                    "result": result.result.as_ref().map(JobSummary::describe),
                }),
            );
        }

        if !failed.is_empty() {
            warn!("流水线有 {} 个步骤失败", failed.len());
            return Err(SchedulerError::TaskExecution(format!(
                "流水线步骤失败: {}",
                failed.join("; ")
            )));
        }

        info!("流水线 {} 个步骤全部完成", self.steps.len());
        Ok(JobSummary(json!({
            "processed": self.steps.len(),
            "steps": Value::Object(details),
        })))
    }
}
