use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use cronpool_core::{
    ClaimedTask, ExecutionOutcome, ReleaseReport, ScheduleStore, SchedulerError, SchedulerResult,
    WorkerConfig,
};
use cronpool_infrastructure::{GuardOutcome, MetricsCollector, TimeoutGuard, TimeoutUtils};
use futures::future::BoxFuture;
use rand::Rng;
use tokio::sync::broadcast;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

use crate::registry::TaskRegistry;

/// 单次存储调用的截止时间
const STORAGE_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// 存储重试的最大退避
const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

/// 一次成功执行循环的记录
#[derive(Debug, Clone)]
pub struct IterationReport {
    pub task_type: String,
    pub lease_id: i64,
    pub outcome: ExecutionOutcome,
    pub release: ReleaseReport,
    pub suspended: bool,
}

#[derive(Debug, Clone)]
pub enum PollResult {
    /// 没有可认领的任务
    Idle,
    Executed(IterationReport),
}

pub struct WorkerServiceBuilder {
    store: Arc<dyn ScheduleStore>,
    registry: Arc<TaskRegistry>,
    config: WorkerConfig,
    guard: TimeoutGuard,
    metrics: Option<Arc<MetricsCollector>>,
}

impl WorkerServiceBuilder {
    pub fn new(
        store: Arc<dyn ScheduleStore>,
        registry: Arc<TaskRegistry>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            store,
            registry,
            config,
            guard: TimeoutGuard::default(),
            metrics: None,
        }
    }

    pub fn timeout_guard(mut self, guard: TimeoutGuard) -> Self {
        self.guard = guard;
        self
    }

    pub fn metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn build(self) -> WorkerService {
        WorkerService {
            store: self.store,
            registry: self.registry,
            config: self.config,
            guard: self.guard,
            metrics: self.metrics,
        }
    }
}

/// Worker 服务
///
/// 循环: 认领一个到期任务, 在超时守卫下执行并定期续约, 释放租约并记录结果,
/// 必要时挂起任务。同时在后台定期回收其他 Worker 遗留的过期租约。
pub struct WorkerService {
    store: Arc<dyn ScheduleStore>,
    registry: Arc<TaskRegistry>,
    config: WorkerConfig,
    guard: TimeoutGuard,
    metrics: Option<Arc<MetricsCollector>>,
}

impl WorkerService {
    pub fn builder(
        store: Arc<dyn ScheduleStore>,
        registry: Arc<TaskRegistry>,
        config: WorkerConfig,
    ) -> WorkerServiceBuilder {
        WorkerServiceBuilder::new(store, registry, config)
    }

    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    pub fn supported_task_types(&self) -> Vec<String> {
        self.registry.task_types()
    }

    /// 运行 Worker 直到收到关闭信号
    ///
    /// 空闲时才等待关闭信号, 正在执行的作业会先完成并释放租约。
    /// 存储重试耗尽时返回错误。
    pub async fn run(self: Arc<Self>, mut shutdown_rx: broadcast::Receiver<()>) -> SchedulerResult<()> {
        info!(
            "Worker {} 启动，已注册任务类型: {:?}",
            self.config.worker_id,
            self.registry.task_types()
        );

        let reclaimer = tokio::spawn(self.clone().reclaim_loop(shutdown_rx.resubscribe()));

        let result = loop {
            match shutdown_rx.try_recv() {
                Err(broadcast::error::TryRecvError::Empty) => {}
                _ => {
                    info!("收到关闭信号，Worker停止认领任务");
                    break Ok(());
                }
            }

            match self.poll_once().await {
                Ok(PollResult::Executed(report)) => {
                    debug!(
                        "任务 {} 执行结束: {}",
                        report.task_type,
                        report.outcome.kind.as_str()
                    );
                }
                Ok(PollResult::Idle) => {
                    tokio::select! {
                        _ = sleep(self.config.poll_interval()) => {}
                        _ = shutdown_rx.recv() => {
                            info!("收到关闭信号，Worker停止认领任务");
                            break Ok(());
                        }
                    }
                }
                Err(e) => {
                    error!("存储持续不可用，Worker退出: {}", e);
                    break Err(e);
                }
            }
        };

        match result {
            Ok(()) => {
                if let Err(e) = reclaimer.await {
                    warn!("租约回收任务异常结束: {}", e);
                }
                info!("Worker {} 已停止", self.config.worker_id);
            }
            Err(_) => reclaimer.abort(),
        }

        result
    }

    /// 认领并执行至多一个任务
    #[instrument(skip(self), fields(worker_id = %self.config.worker_id))]
    pub async fn poll_once(&self) -> SchedulerResult<PollResult> {
        let worker_id = self.config.worker_id.as_str();
        let lease_ttl = self.config.lease_ttl();

        let claimed = self
            .with_storage_retry("claim_due_task", || {
                self.store.claim_due_task(worker_id, lease_ttl)
            })
            .await?;

        let Some(claimed) = claimed else {
            if let Some(metrics) = &self.metrics {
                metrics.record_idle_poll();
            }
            return Ok(PollResult::Idle);
        };

        let task_type = claimed.definition.task_type.clone();
        info!("认领任务 {} (租约 {})", task_type, claimed.lease.id);
        if let Some(metrics) = &self.metrics {
            metrics.record_claim(&task_type);
        }

        let outcome = self.execute_claimed(&claimed).await;
        if let Some(metrics) = &self.metrics {
            metrics.record_execution(
                &task_type,
                outcome.kind.as_str(),
                outcome.execution_time_seconds(),
            );
        }

        let lease = &claimed.lease;
        let release = self
            .with_storage_retry("release_task", || self.store.release_task(lease, &outcome))
            .await?;

        if !release.released {
            warn!(
                "任务 {} 的租约 {} 已被回收，执行结果未记录",
                task_type, lease.id
            );
        }

        let suspended = self.suspend_if_needed(&claimed, &outcome, release).await?;

        Ok(PollResult::Executed(IterationReport {
            task_type,
            lease_id: lease.id,
            outcome,
            release,
            suspended,
        }))
    }

    /// 回收过期租约一次, 返回回收数量
    pub async fn reclaim_once(&self) -> SchedulerResult<usize> {
        let reclaimed = TimeoutUtils::storage(
            self.store.reclaim_stale_leases(self.config.lease_ttl()),
            STORAGE_CALL_TIMEOUT,
            "reclaim_stale_leases",
        )
        .await?;

        for item in &reclaimed {
            warn!(
                "回收过期租约 {} (任务 {}, Worker {})",
                item.lease.id, item.task_type, item.lease.worker_id
            );
        }
        if let Some(metrics) = &self.metrics {
            metrics.record_reclaimed(reclaimed.len());
        }
        Ok(reclaimed.len())
    }

    async fn reclaim_loop(self: Arc<Self>, mut shutdown_rx: broadcast::Receiver<()>) {
        let mut ticker = interval(self.config.reclaim_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.reclaim_once().await {
                        warn!("回收过期租约失败: {}", e);
                    }
                }
                _ = shutdown_rx.recv() => {
                    debug!("租约回收任务退出");
                    break;
                }
            }
        }
    }

    async fn execute_claimed(&self, claimed: &ClaimedTask) -> ExecutionOutcome {
        let task_type = claimed.definition.task_type.as_str();
        let Some(job) = self.registry.get(task_type) else {
            error!("任务类型 {} 未注册，任务将被挂起", task_type);
            return ExecutionOutcome::configuration_error(format!("未注册的任务类型: {task_type}"));
        };

        let function = job.function.clone();
        let guarded = self
            .guard
            .run(task_type, job.timeout_seconds, async move { function.run().await });
        tokio::pin!(guarded);

        let mut heartbeat = interval(self.config.heartbeat_interval());
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // 第一次 tick 立即返回, 认领时已经写过心跳
        heartbeat.tick().await;

        // 续约与作业并行推进, 续约卡住不会推迟超时判定
        let mut in_flight: Option<BoxFuture<'_, ()>> = None;
        let outcome = loop {
            tokio::select! {
                outcome = &mut guarded => break outcome,
                _ = heartbeat.tick(), if in_flight.is_none() => {
                    in_flight = Some(Box::pin(self.send_heartbeat(claimed)));
                }
                _ = async {
                    if let Some(pending) = in_flight.as_mut() {
                        pending.await;
                    }
                }, if in_flight.is_some() => {
                    in_flight = None;
                }
            }
        };

        outcome_from_guard(outcome)
    }

    async fn send_heartbeat(&self, claimed: &ClaimedTask) {
        let result = TimeoutUtils::storage(
            self.store.heartbeat(&claimed.lease),
            STORAGE_CALL_TIMEOUT,
            "heartbeat",
        )
        .await;

        match result {
            Ok(true) => debug!("租约 {} 续约成功", claimed.lease.id),
            Ok(false) => warn!(
                "任务 {} 的租约 {} 已失效，作业继续运行但结果不会被记录",
                claimed.definition.task_type, claimed.lease.id
            ),
            Err(e) => warn!("租约 {} 续约失败: {}", claimed.lease.id, e),
        }
    }

    async fn suspend_if_needed(
        &self,
        claimed: &ClaimedTask,
        outcome: &ExecutionOutcome,
        release: ReleaseReport,
    ) -> SchedulerResult<bool> {
        let max_failures = self.config.max_consecutive_failures;
        let reason = if outcome.configuration_error {
            outcome
                .error_message
                .clone()
                .unwrap_or_else(|| "配置错误".to_string())
        } else if max_failures > 0 && release.fail_count >= max_failures as i32 {
            format!("连续失败 {} 次，自动暂停", release.fail_count)
        } else {
            return Ok(false);
        };

        let task_id = claimed.definition.id;
        let task_type = claimed.definition.task_type.as_str();
        warn!("挂起任务 {}: {}", task_type, reason);

        match self
            .with_storage_retry("suspend", || self.store.suspend(task_id, &reason))
            .await
        {
            Ok(()) => {
                if let Some(metrics) = &self.metrics {
                    metrics.record_suspension(task_type);
                }
                Ok(true)
            }
            Err(e) if e.is_storage_error() => Err(e),
            Err(e) => {
                warn!("挂起任务 {} 失败: {}", task_type, e);
                Ok(false)
            }
        }
    }

    /// 存储错误按指数退避加随机抖动重试, 其他错误直接返回
    async fn with_storage_retry<T, F, Fut>(&self, operation: &str, mut call: F) -> SchedulerResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = SchedulerResult<T>>,
    {
        let attempts = self.config.storage_retry_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            match TimeoutUtils::storage(call(), STORAGE_CALL_TIMEOUT, operation).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_storage_error() && attempt < attempts => {
                    let delay = retry_delay(self.config.storage_retry_base_delay(), attempt);
                    warn!(
                        "存储操作 {} 失败 (第 {}/{} 次)，{:?} 后重试: {}",
                        operation, attempt, attempts, delay, e
                    );
                    sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

fn retry_delay(base: Duration, attempt: u32) -> Duration {
    let exponential = base
        .saturating_mul(1u32 << attempt.saturating_sub(1).min(16))
        .min(MAX_RETRY_DELAY);
    let jitter_ms = (exponential.as_millis() as u64 / 4).max(1);
    exponential + Duration::from_millis(rand::rng().random_range(0..jitter_ms))
}

fn outcome_from_guard(outcome: GuardOutcome<cronpool_core::JobSummary>) -> ExecutionOutcome {
    match outcome {
        GuardOutcome::Completed { value, duration } => {
            ExecutionOutcome::completed(value.describe(), duration)
        }
        GuardOutcome::Failed { error, duration } => ExecutionOutcome {
            configuration_error: error.is_configuration_error(),
            ..ExecutionOutcome::failed(error.to_string(), duration)
        },
        GuardOutcome::TimedOut { timeout, duration } => {
            ExecutionOutcome::timed_out(timeout, duration)
        }
    }
}

/// 在当前进程中执行一次作业, 不经过认领和租约, 供运维命令使用
pub async fn run_job_locally(
    registry: &TaskRegistry,
    guard: &TimeoutGuard,
    task_type: &str,
) -> SchedulerResult<ExecutionOutcome> {
    let job = registry
        .get(task_type)
        .ok_or_else(|| SchedulerError::UnknownTaskType(task_type.to_string()))?;

    info!("本地执行任务 {}", task_type);
    let function = job.function.clone();
    let outcome = guard
        .run(task_type, job.timeout_seconds, async move { function.run().await })
        .await;
    Ok(outcome_from_guard(outcome))
}

#[cfg(test)]
mod tests {
    use super::*;
    use cronpool_core::{JobSummary, OutcomeKind};
    use crate::executors::FnJob;

    #[test]
    fn test_retry_delay_grows_and_caps() {
        let base = Duration::from_millis(100);
        let first = retry_delay(base, 1);
        assert!(first >= base && first < base + Duration::from_millis(26));

        let third = retry_delay(base, 3);
        assert!(third >= Duration::from_millis(400));

        let huge = retry_delay(base, 40);
        assert!(huge >= MAX_RETRY_DELAY);
        assert!(huge <= MAX_RETRY_DELAY + MAX_RETRY_DELAY / 4);
    }

    #[test]
    fn test_outcome_mapping() {
        let completed = outcome_from_guard(GuardOutcome::Completed {
            value: JobSummary::from(serde_json::json!({ "processed": 7 })),
            duration: Duration::from_millis(5),
        });
        assert_eq!(completed.result.as_deref(), Some("7"));

        let failed = outcome_from_guard(GuardOutcome::Failed {
            error: SchedulerError::InvalidJobConfig("bad".to_string()),
            duration: Duration::from_millis(5),
        });
        assert_eq!(failed.kind, OutcomeKind::Failed);
        assert!(failed.configuration_error);
        assert_eq!(failed.duration, Duration::from_millis(5));

        let timed_out = outcome_from_guard(GuardOutcome::TimedOut {
            timeout: Duration::from_secs(1),
            duration: Duration::from_secs(1),
        });
        assert_eq!(timed_out.kind, OutcomeKind::TimedOut);
    }

    #[tokio::test]
    async fn test_run_job_locally() {
        let registry = TaskRegistry::builder()
            .register(
                "reports",
                Arc::new(FnJob::new("reports", || async {
                    Ok(JobSummary::from(serde_json::json!({ "generated": 3 })))
                })),
                None,
            )
            .build();
        let guard = TimeoutGuard::default();

        let outcome = run_job_locally(&registry, &guard, "reports").await.unwrap();
        assert!(outcome.is_success());
        assert_eq!(outcome.result.as_deref(), Some("3"));

        let err = run_job_locally(&registry, &guard, "missing").await.unwrap_err();
        assert!(matches!(err, SchedulerError::UnknownTaskType(_)));
    }
}
