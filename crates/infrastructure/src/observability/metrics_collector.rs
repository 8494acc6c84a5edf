//! Metrics collector for the scheduler and worker processes
//!
//! 没有安装导出器时, `metrics` 的宏是空操作, 采集器可以随处使用。

use metrics::{counter, gauge, histogram, Counter, Histogram};
use tracing::debug;

/// Metrics collector for the scheduler and worker processes
pub struct MetricsCollector {
    idle_polls_total: Counter,
    claims_total: Counter,
    reclaimed_leases_total: Counter,
    scheduler_ticks_total: Counter,
    scheduler_tick_duration: Histogram,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            idle_polls_total: counter!("cronpool_idle_polls_total"),
            claims_total: counter!("cronpool_claims_total"),
            reclaimed_leases_total: counter!("cronpool_reclaimed_leases_total"),
            scheduler_ticks_total: counter!("cronpool_scheduler_ticks_total"),
            scheduler_tick_duration: histogram!("cronpool_scheduler_tick_duration_seconds"),
        }
    }

    /// 轮询没有认领到任务
    pub fn record_idle_poll(&self) {
        self.idle_polls_total.increment(1);
    }

    pub fn record_claim(&self, task_type: &str) {
        self.claims_total.increment(1);
        counter!("cronpool_task_claims_total", "task_type" => task_type.to_string()).increment(1);
    }

    /// 记录一次执行结果, `outcome` 为 completed / failed / timed_out
    pub fn record_execution(&self, task_type: &str, outcome: &str, duration_seconds: f64) {
        counter!(
            "cronpool_task_executions_total",
            "task_type" => task_type.to_string(),
            "outcome" => outcome.to_string()
        )
        .increment(1);
        histogram!(
            "cronpool_task_execution_duration_seconds",
            "task_type" => task_type.to_string()
        )
        .record(duration_seconds);

        debug!(
            task_type = task_type,
            outcome = outcome,
            duration_seconds = duration_seconds,
            "记录任务执行指标"
        );
    }

    pub fn record_suspension(&self, task_type: &str) {
        counter!("cronpool_task_suspensions_total", "task_type" => task_type.to_string())
            .increment(1);
    }

    pub fn record_reclaimed(&self, count: usize) {
        self.reclaimed_leases_total.increment(count as u64);
    }

    pub fn record_scheduler_tick(&self, advanced: usize, suspended: usize, duration_seconds: f64) {
        self.scheduler_ticks_total.increment(1);
        self.scheduler_tick_duration.record(duration_seconds);
        counter!("cronpool_schedules_advanced_total").increment(advanced as u64);
        counter!("cronpool_schedules_suspended_total").increment(suspended as u64);
    }

    /// 存储统计快照
    pub fn update_schedule_gauges(&self, due: i64, locked: i64, failing: i64) {
        gauge!("cronpool_due_tasks").set(due as f64);
        gauge!("cronpool_locked_tasks").set(locked as f64);
        gauge!("cronpool_failing_tasks").set(failing as f64);
    }

    pub fn record_pipeline_step(&self, step: &str, success: bool, duration_seconds: f64) {
        let outcome = if success { "completed" } else { "failed" };
        counter!(
            "cronpool_pipeline_steps_total",
            "step" => step.to_string(),
            "outcome" => outcome
        )
        .increment(1);
        histogram!("cronpool_pipeline_step_duration_seconds").record(duration_seconds);
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_without_exporter_is_noop() {
        let metrics = MetricsCollector::new();
        metrics.record_idle_poll();
        metrics.record_claim("scraping");
        metrics.record_execution("scraping", "completed", 1.5);
        metrics.record_reclaimed(2);
        metrics.record_scheduler_tick(3, 0, 0.01);
        metrics.update_schedule_gauges(1, 1, 0);
        metrics.record_pipeline_step("scrape", true, 0.2);
        metrics.record_suspension("scraping");
    }
}
