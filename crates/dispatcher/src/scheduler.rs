use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

use cronpool_core::{
    Clock, ScheduleAdmin, ScheduleStats, ScheduleStore, SchedulerConfig, SchedulerResult,
    SystemClock, TaskDefinition,
};
use cronpool_infrastructure::MetricsCollector;

use crate::cron_utils::CronScheduler;

/// 一次调度扫描的统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub examined: usize,
    pub advanced: usize,
    pub suspended: usize,
}

/// 计算任务新的 `next_run_at`, 值不变时返回 `None`
///
/// - 未设置: 取 `last_run_at` (从未运行则取 `now`) 之后的下一次触发
/// - 当前触发已被认领: 取 `next_run_at` 之后的下一次触发,
///   若它已经过去, 错过的触发合并为 `(last_run_at, now]` 内最晚的一次
/// - 其余情况 (已到期等待认领或尚未到期) 保持不变
pub fn plan_next_run(
    definition: &TaskDefinition,
    now: DateTime<Utc>,
) -> SchedulerResult<Option<DateTime<Utc>>> {
    let cron = CronScheduler::new(&definition.schedule_pattern)?;

    let planned = match definition.next_run_at {
        None => cron.next_occurrence(definition.last_run_at.unwrap_or(now)),
        Some(next_run_at) if definition.occurrence_claimed() => {
            match cron.next_occurrence(next_run_at) {
                Some(candidate) if candidate <= now => {
                    let last_run_at = definition.last_run_at.unwrap_or(next_run_at);
                    cron.latest_occurrence_between(Some(last_run_at), now)
                        .or_else(|| cron.next_occurrence(last_run_at))
                }
                other => other,
            }
        }
        Some(_) => None,
    };

    Ok(planned.filter(|planned| Some(*planned) != definition.next_run_at))
}

/// 调度进程: 周期性地为活跃任务重新计算 `next_run_at`, 本身不执行任何作业
pub struct TaskScheduler {
    store: Arc<dyn ScheduleStore>,
    admin: Option<Arc<dyn ScheduleAdmin>>,
    clock: Arc<dyn Clock>,
    metrics: Arc<MetricsCollector>,
    config: SchedulerConfig,
    lease_ttl: Duration,
}

impl TaskScheduler {
    pub fn new(store: Arc<dyn ScheduleStore>, config: SchedulerConfig) -> Self {
        Self {
            store,
            admin: None,
            clock: Arc::new(SystemClock),
            metrics: Arc::new(MetricsCollector::new()),
            config,
            lease_ttl: Duration::from_secs(1800),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// 提供运维视图后会周期性输出调度统计
    pub fn with_admin(mut self, admin: Arc<dyn ScheduleAdmin>) -> Self {
        self.admin = Some(admin);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = metrics;
        self
    }

    /// 统计有效租约时使用的TTL, 与Worker配置保持一致
    pub fn with_lease_ttl(mut self, lease_ttl: Duration) -> Self {
        self.lease_ttl = lease_ttl;
        self
    }

    /// 扫描全部活跃任务并推进调度时间
    #[instrument(skip(self))]
    pub async fn tick(&self) -> SchedulerResult<TickReport> {
        let started = Instant::now();
        let now = self.clock.now();
        let definitions = self.store.list_active().await?;
        let mut report = TickReport {
            examined: definitions.len(),
            ..TickReport::default()
        };

        for definition in &definitions {
            match plan_next_run(definition, now) {
                Ok(Some(next_run_at)) => {
                    match self.store.advance_schedule(definition.id, next_run_at).await {
                        Ok(()) => {
                            debug!(
                                "任务 {} 下次运行时间: {}",
                                definition.task_type,
                                next_run_at.format("%Y-%m-%d %H:%M:%S UTC")
                            );
                            report.advanced += 1;
                        }
                        Err(e) => error!("更新任务 {} 的调度时间失败: {}", definition.task_type, e),
                    }
                }
                Ok(None) => {}
                Err(e) if e.is_configuration_error() => {
                    warn!(
                        "任务 {} 的调度表达式 '{}' 无效, 挂起任务: {}",
                        definition.task_type, definition.schedule_pattern, e
                    );
                    match self.store.suspend(definition.id, &e.to_string()).await {
                        Ok(()) => {
                            self.metrics.record_suspension(&definition.task_type);
                            report.suspended += 1;
                        }
                        Err(suspend_error) => {
                            error!("挂起任务 {} 失败: {}", definition.task_type, suspend_error)
                        }
                    }
                }
                Err(e) => error!("计算任务 {} 的调度时间失败: {}", definition.task_type, e),
            }
        }

        self.metrics.record_scheduler_tick(
            report.advanced,
            report.suspended,
            started.elapsed().as_secs_f64(),
        );
        if report.advanced > 0 || report.suspended > 0 {
            info!(
                "调度扫描完成: 检查 {} 个任务, 推进 {} 个, 挂起 {} 个",
                report.examined, report.advanced, report.suspended
            );
        }
        Ok(report)
    }

    /// 输出调度统计, 没有运维视图时返回 `None`
    pub async fn log_stats(&self) -> SchedulerResult<Option<ScheduleStats>> {
        let Some(admin) = &self.admin else {
            return Ok(None);
        };

        let stats = admin.stats(self.lease_ttl).await?;
        self.metrics
            .update_schedule_gauges(stats.due_tasks, stats.locked_tasks, stats.failing_tasks);

        info!(
            "调度统计: 共 {} 个任务, 活跃 {}, 暂停 {}, 到期 {}, 运行中 {} (租约 {}), 失败 {}",
            stats.total_tasks,
            stats.active_tasks,
            stats.paused_tasks,
            stats.due_tasks,
            stats.locked_tasks,
            stats.held_leases,
            stats.failing_tasks
        );
        for upcoming in &stats.upcoming {
            if let Some(next_run_at) = upcoming.next_run_at {
                info!(
                    "  即将运行: {} @ {}",
                    upcoming.task_type,
                    next_run_at.format("%Y-%m-%d %H:%M:%S UTC")
                );
            }
        }
        Ok(Some(stats))
    }

    /// 运行调度循环直到收到关闭信号
    pub async fn run(&self, mut shutdown_rx: broadcast::Receiver<()>) -> SchedulerResult<()> {
        info!(
            "调度器启动, 扫描间隔 {:?}, 统计间隔 {:?}",
            self.config.tick_interval(),
            self.config.stats_interval()
        );

        let mut tick_interval = interval(self.config.tick_interval());
        tick_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut stats_interval = interval(self.config.stats_interval());
        stats_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = tick_interval.tick() => {
                    if let Err(e) = self.tick().await {
                        error!("调度扫描失败: {}", e);
                    }
                }
                _ = stats_interval.tick() => {
                    if let Err(e) = self.log_stats().await {
                        warn!("获取调度统计失败: {}", e);
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("调度器收到停止信号");
                    break;
                }
            }
        }

        Ok(())
    }
}
