use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::{
    ClaimedTask, ExecutionLogEntry, ExecutionOutcome, NewTaskDefinition, ReclaimedLease,
    ReleaseReport, ScheduleStats, TaskDefinition, TaskLease, TaskStatus,
};
use crate::SchedulerResult;

/// 调度存储: 调度器与 Worker 共享的唯一事实来源
///
/// 所有会修改共享状态的操作都必须是单条原子语句或单个事务。
/// 认领竞争失败不是错误, 返回 `Ok(None)`。
#[async_trait]
pub trait ScheduleStore: Send + Sync {
    /// 所有 `status = active` 的任务定义
    async fn list_active(&self) -> SchedulerResult<Vec<TaskDefinition>>;

    /// 幂等地写入 `next_run_at`
    async fn advance_schedule(&self, task_id: i64, next_run_at: DateTime<Utc>)
        -> SchedulerResult<()>;

    /// 原子地认领一个到期且未达并发上限的任务
    async fn claim_due_task(
        &self,
        worker_id: &str,
        lease_ttl: Duration,
    ) -> SchedulerResult<Option<ClaimedTask>>;

    /// 续约, 返回租约是否仍然被持有
    async fn heartbeat(&self, lease: &TaskLease) -> SchedulerResult<bool>;

    /// 释放租约并记录执行结果; 租约已被回收时不做任何修改
    async fn release_task(
        &self,
        lease: &TaskLease,
        outcome: &ExecutionOutcome,
    ) -> SchedulerResult<ReleaseReport>;

    /// 回收超过TTL未续约的租约, 每个租约恰好产生一条失败日志
    async fn reclaim_stale_leases(&self, lease_ttl: Duration)
        -> SchedulerResult<Vec<ReclaimedLease>>;

    /// 挂起任务: `status = paused`, `last_status = failed`
    async fn suspend(&self, task_id: i64, reason: &str) -> SchedulerResult<()>;
}

/// 运维操作
#[async_trait]
pub trait ScheduleAdmin: Send + Sync {
    async fn upsert_definition(&self, definition: &NewTaskDefinition)
        -> SchedulerResult<TaskDefinition>;

    async fn list_definitions(&self) -> SchedulerResult<Vec<TaskDefinition>>;

    async fn get_definition(&self, task_type: &str) -> SchedulerResult<Option<TaskDefinition>>;

    /// 暂停或恢复; 恢复时清空 `next_run_at` 让调度器重新计算
    async fn set_status(&self, task_type: &str, status: TaskStatus) -> SchedulerResult<()>;

    /// 立即到期: 清除所有租约, `next_run_at` 设为当前时间
    async fn force_due(&self, task_type: &str) -> SchedulerResult<()>;

    /// 清除任务的全部租约, 进行中的日志记为失败, 返回清除数量
    async fn unlock(&self, task_type: &str) -> SchedulerResult<u64>;

    /// 清零失败计数, `task_type` 为空时作用于所有任务
    async fn reset_failures(&self, task_type: Option<&str>) -> SchedulerResult<u64>;

    async fn set_max_concurrent_runs(&self, task_type: &str, max: i32) -> SchedulerResult<()>;

    async fn recent_logs(
        &self,
        task_type: Option<&str>,
        limit: i64,
    ) -> SchedulerResult<Vec<ExecutionLogEntry>>;

    /// 删除早于 `older_than` 且已结束的日志
    async fn purge_logs(&self, older_than: DateTime<Utc>) -> SchedulerResult<u64>;

    async fn stats(&self, lease_ttl: Duration) -> SchedulerResult<ScheduleStats>;

    /// 记录一次本地手动执行, `last_status = test`
    async fn record_test_run(
        &self,
        task_type: &str,
        worker_id: &str,
        outcome: &ExecutionOutcome,
    ) -> SchedulerResult<()>;
}
