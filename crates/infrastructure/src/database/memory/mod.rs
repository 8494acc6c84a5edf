//! 内存调度存储
//!
//! 单进程内共享, 用于测试和 `memory://` 演示模式。所有操作在同一把锁内完成,
//! 语义与 SQL 后端保持一致。

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cronpool_core::{
    lease_cutoff, lease_expired_message, ClaimedTask, Clock, ExecutionLogEntry, ExecutionOutcome,
    LastStatus, LogStatus, NewTaskDefinition, ReclaimedLease, ReleaseReport, ScheduleAdmin,
    ScheduleStats, ScheduleStore, SchedulerError, SchedulerResult, SystemClock, TaskDefinition,
    TaskLease, TaskStatus,
};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Default)]
struct StoreState {
    definitions: BTreeMap<i64, TaskDefinition>,
    leases: BTreeMap<i64, TaskLease>,
    logs: BTreeMap<i64, ExecutionLogEntry>,
    next_definition_id: i64,
    next_lease_id: i64,
    next_log_id: i64,
}

impl StoreState {
    fn live_leases(&self, task_id: i64, cutoff: DateTime<Utc>) -> usize {
        self.leases
            .values()
            .filter(|l| l.task_id == task_id && l.heartbeat_at >= cutoff)
            .count()
    }

    fn definition_by_type_mut(&mut self, task_type: &str) -> SchedulerResult<&mut TaskDefinition> {
        self.definitions
            .values_mut()
            .find(|d| d.task_type == task_type)
            .ok_or_else(|| SchedulerError::TaskNotFound {
                task_type: task_type.to_string(),
            })
    }

    /// 用剩余租约中最近的一个刷新 `locked_at/locked_by`
    fn refresh_lock_display(&mut self, task_id: i64) {
        let latest = self
            .leases
            .values()
            .filter(|l| l.task_id == task_id)
            .max_by_key(|l| (l.locked_at, l.id))
            .map(|l| (l.locked_at, l.worker_id.clone()));

        if let Some(def) = self.definitions.get_mut(&task_id) {
            match latest {
                Some((locked_at, worker_id)) => {
                    def.locked_at = Some(locked_at);
                    def.locked_by = Some(worker_id);
                }
                None => {
                    def.locked_at = None;
                    def.locked_by = None;
                }
            }
        }
    }

    fn finish_log(
        &mut self,
        log_id: i64,
        status: LogStatus,
        finished_at: DateTime<Utc>,
        result: Option<String>,
        error_message: Option<String>,
        execution_time_seconds: Option<f64>,
    ) {
        if let Some(entry) = self.logs.get_mut(&log_id) {
            entry.status = status;
            entry.finished_at = Some(finished_at);
            entry.execution_time_seconds = execution_time_seconds.or_else(|| {
                Some((finished_at - entry.started_at).num_milliseconds() as f64 / 1000.0)
            });
            entry.result = result;
            entry.error_message = error_message;
        }
    }

    /// 删除任务的全部租约并把对应的进行中日志记为失败
    fn drop_leases(&mut self, task_id: i64, now: DateTime<Utc>, reason: &str) -> u64 {
        let lease_ids: Vec<i64> = self
            .leases
            .values()
            .filter(|l| l.task_id == task_id)
            .map(|l| l.id)
            .collect();

        for lease_id in &lease_ids {
            if let Some(lease) = self.leases.remove(lease_id) {
                self.finish_log(
                    lease.log_id,
                    LogStatus::Failed,
                    now,
                    None,
                    Some(reason.to_string()),
                    None,
                );
            }
        }
        self.refresh_lock_display(task_id);
        lease_ids.len() as u64
    }
}

pub struct InMemoryScheduleStore {
    state: Mutex<StoreState>,
    clock: Arc<dyn Clock>,
}

impl InMemoryScheduleStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(StoreState {
                next_definition_id: 1,
                next_lease_id: 1,
                next_log_id: 1,
                ..StoreState::default()
            }),
            clock,
        }
    }

    /// 当前持有的全部租约 (测试和诊断用)
    pub async fn leases(&self) -> Vec<TaskLease> {
        self.state.lock().await.leases.values().cloned().collect()
    }

    /// 某任务的全部执行日志, 按创建顺序
    pub async fn logs_for(&self, task_id: i64) -> Vec<ExecutionLogEntry> {
        self.state
            .lock()
            .await
            .logs
            .values()
            .filter(|e| e.task_id == task_id)
            .cloned()
            .collect()
    }
}

impl Default for InMemoryScheduleStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ScheduleStore for InMemoryScheduleStore {
    async fn list_active(&self) -> SchedulerResult<Vec<TaskDefinition>> {
        let state = self.state.lock().await;
        Ok(state
            .definitions
            .values()
            .filter(|d| d.is_active())
            .cloned()
            .collect())
    }

    #[instrument(skip(self), fields(task_id = %task_id))]
    async fn advance_schedule(
        &self,
        task_id: i64,
        next_run_at: DateTime<Utc>,
    ) -> SchedulerResult<()> {
        let mut state = self.state.lock().await;
        let def = state
            .definitions
            .get_mut(&task_id)
            .ok_or(SchedulerError::TaskIdNotFound { id: task_id })?;
        def.next_run_at = Some(next_run_at);
        debug!("任务 {} 下次运行时间更新为 {}", def.task_type, next_run_at);
        Ok(())
    }

    #[instrument(skip(self), fields(worker_id = %worker_id))]
    async fn claim_due_task(
        &self,
        worker_id: &str,
        lease_ttl: Duration,
    ) -> SchedulerResult<Option<ClaimedTask>> {
        let now = self.clock.now();
        let cutoff = lease_cutoff(now, lease_ttl);
        let mut state = self.state.lock().await;

        let mut candidates: Vec<&TaskDefinition> = state
            .definitions
            .values()
            .filter(|d| d.is_due(now))
            .filter(|d| state.live_leases(d.id, cutoff) < d.max_concurrent_runs.max(0) as usize)
            .collect();
        candidates.sort_by_key(|d| {
            (
                d.execution_order.is_none(),
                d.execution_order,
                d.next_run_at,
                d.id,
            )
        });

        let Some(task_id) = candidates.first().map(|d| d.id) else {
            return Ok(None);
        };

        let log_id = state.next_log_id;
        state.next_log_id += 1;
        let lease_id = state.next_lease_id;
        state.next_lease_id += 1;

        let task_type = state
            .definitions
            .get(&task_id)
            .map(|d| d.task_type.clone())
            .unwrap_or_default();
        state.logs.insert(
            log_id,
            ExecutionLogEntry {
                id: log_id,
                task_id,
                task_type,
                status: LogStatus::Running,
                started_at: now,
                finished_at: None,
                execution_time_seconds: None,
                result: None,
                error_message: None,
                locked_by: Some(worker_id.to_string()),
            },
        );

        let lease = TaskLease {
            id: lease_id,
            task_id,
            worker_id: worker_id.to_string(),
            locked_at: now,
            heartbeat_at: now,
            log_id,
        };
        state.leases.insert(lease_id, lease.clone());

        let def = state
            .definitions
            .get_mut(&task_id)
            .ok_or(SchedulerError::TaskIdNotFound { id: task_id })?;
        def.locked_at = Some(now);
        def.locked_by = Some(worker_id.to_string());
        def.last_status = LastStatus::Running;
        def.last_run_at = Some(now);

        debug!("Worker {} 认领任务 {}", worker_id, def.task_type);
        Ok(Some(ClaimedTask {
            lease,
            definition: def.clone(),
        }))
    }

    async fn heartbeat(&self, lease: &TaskLease) -> SchedulerResult<bool> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        match state.leases.get_mut(&lease.id) {
            Some(held) => {
                held.heartbeat_at = now;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    #[instrument(skip(self, lease, outcome), fields(lease_id = %lease.id, task_id = %lease.task_id))]
    async fn release_task(
        &self,
        lease: &TaskLease,
        outcome: &ExecutionOutcome,
    ) -> SchedulerResult<ReleaseReport> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;

        if state.leases.remove(&lease.id).is_none() {
            let fail_count = state
                .definitions
                .get(&lease.task_id)
                .map(|d| d.fail_count)
                .unwrap_or_default();
            warn!("租约 {} 已被回收，忽略本次释放", lease.id);
            return Ok(ReleaseReport {
                released: false,
                fail_count,
            });
        }

        state.finish_log(
            lease.log_id,
            outcome.log_status(),
            now,
            outcome.result.clone(),
            outcome.error_message.clone(),
            Some(outcome.execution_time_seconds()),
        );
        state.refresh_lock_display(lease.task_id);

        let def = state
            .definitions
            .get_mut(&lease.task_id)
            .ok_or(SchedulerError::TaskIdNotFound { id: lease.task_id })?;
        def.last_status = outcome.last_status();
        def.fail_count = if outcome.is_success() {
            0
        } else {
            def.fail_count + 1
        };

        Ok(ReleaseReport {
            released: true,
            fail_count: def.fail_count,
        })
    }

    #[instrument(skip(self))]
    async fn reclaim_stale_leases(
        &self,
        lease_ttl: Duration,
    ) -> SchedulerResult<Vec<ReclaimedLease>> {
        let now = self.clock.now();
        let cutoff = lease_cutoff(now, lease_ttl);
        let mut state = self.state.lock().await;

        let stale: Vec<TaskLease> = state
            .leases
            .values()
            .filter(|l| l.heartbeat_at < cutoff)
            .cloned()
            .collect();

        let mut reclaimed = Vec::with_capacity(stale.len());
        for lease in stale {
            state.leases.remove(&lease.id);
            state.finish_log(
                lease.log_id,
                LogStatus::Failed,
                now,
                None,
                Some(lease_expired_message(
                    &lease.worker_id,
                    lease.locked_at,
                    lease_ttl.as_secs(),
                )),
                None,
            );
            state.refresh_lock_display(lease.task_id);

            let task_type = match state.definitions.get_mut(&lease.task_id) {
                Some(def) => {
                    def.fail_count += 1;
                    def.last_status = LastStatus::Failed;
                    def.task_type.clone()
                }
                None => String::new(),
            };
            info!("回收过期租约 {} (任务 {}, Worker {})", lease.id, task_type, lease.worker_id);
            reclaimed.push(ReclaimedLease { lease, task_type });
        }

        Ok(reclaimed)
    }

    async fn suspend(&self, task_id: i64, reason: &str) -> SchedulerResult<()> {
        let mut state = self.state.lock().await;
        let def = state
            .definitions
            .get_mut(&task_id)
            .ok_or(SchedulerError::TaskIdNotFound { id: task_id })?;
        def.status = TaskStatus::Paused;
        def.last_status = LastStatus::Failed;
        warn!("任务 {} 已挂起: {}", def.task_type, reason);
        Ok(())
    }
}

#[async_trait]
impl ScheduleAdmin for InMemoryScheduleStore {
    async fn upsert_definition(
        &self,
        definition: &NewTaskDefinition,
    ) -> SchedulerResult<TaskDefinition> {
        definition.validate()?;
        let mut state = self.state.lock().await;

        if let Ok(existing) = state.definition_by_type_mut(&definition.task_type) {
            existing.schedule_pattern = definition.schedule_pattern.clone();
            existing.status = definition.status;
            existing.max_concurrent_runs = definition.max_concurrent_runs;
            existing.execution_order = definition.execution_order;
            existing.next_run_at = None;
            return Ok(existing.clone());
        }

        let id = state.next_definition_id;
        state.next_definition_id += 1;
        let def = TaskDefinition {
            id,
            task_type: definition.task_type.clone(),
            schedule_pattern: definition.schedule_pattern.clone(),
            status: definition.status,
            max_concurrent_runs: definition.max_concurrent_runs,
            execution_order: definition.execution_order,
            next_run_at: None,
            locked_at: None,
            locked_by: None,
            fail_count: 0,
            last_status: LastStatus::Ready,
            last_run_at: None,
        };
        state.definitions.insert(id, def.clone());
        Ok(def)
    }

    async fn list_definitions(&self) -> SchedulerResult<Vec<TaskDefinition>> {
        let state = self.state.lock().await;
        let mut defs: Vec<TaskDefinition> = state.definitions.values().cloned().collect();
        defs.sort_by(|a, b| a.task_type.cmp(&b.task_type));
        Ok(defs)
    }

    async fn get_definition(&self, task_type: &str) -> SchedulerResult<Option<TaskDefinition>> {
        let state = self.state.lock().await;
        Ok(state
            .definitions
            .values()
            .find(|d| d.task_type == task_type)
            .cloned())
    }

    async fn set_status(&self, task_type: &str, status: TaskStatus) -> SchedulerResult<()> {
        let mut state = self.state.lock().await;
        let def = state.definition_by_type_mut(task_type)?;
        def.status = status;
        if status == TaskStatus::Active {
            def.fail_count = 0;
            def.last_status = LastStatus::Ready;
        }
        Ok(())
    }

    async fn force_due(&self, task_type: &str) -> SchedulerResult<()> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let task_id = state.definition_by_type_mut(task_type)?.id;
        state.drop_leases(task_id, now, "运维强制运行，租约被清除");
        let def = state.definition_by_type_mut(task_type)?;
        def.next_run_at = Some(now);
        def.last_status = LastStatus::Ready;
        Ok(())
    }

    async fn unlock(&self, task_type: &str) -> SchedulerResult<u64> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let task_id = state.definition_by_type_mut(task_type)?.id;
        let dropped = state.drop_leases(task_id, now, "运维手动解锁");
        state.definition_by_type_mut(task_type)?.last_status = LastStatus::Ready;
        Ok(dropped)
    }

    async fn reset_failures(&self, task_type: Option<&str>) -> SchedulerResult<u64> {
        let mut state = self.state.lock().await;
        let mut reset = 0;
        for def in state.definitions.values_mut() {
            let selected = match task_type {
                Some(t) => def.task_type == t,
                None => def.fail_count > 0,
            };
            if selected {
                def.fail_count = 0;
                def.last_status = LastStatus::Ready;
                def.status = TaskStatus::Active;
                reset += 1;
            }
        }
        if let (Some(t), 0) = (task_type, reset) {
            return Err(SchedulerError::TaskNotFound {
                task_type: t.to_string(),
            });
        }
        Ok(reset)
    }

    async fn set_max_concurrent_runs(&self, task_type: &str, max: i32) -> SchedulerResult<()> {
        if max < 1 {
            return Err(SchedulerError::Configuration(format!(
                "最大并发数必须大于等于1, 当前为 {max}"
            )));
        }
        let mut state = self.state.lock().await;
        state.definition_by_type_mut(task_type)?.max_concurrent_runs = max;
        Ok(())
    }

    async fn recent_logs(
        &self,
        task_type: Option<&str>,
        limit: i64,
    ) -> SchedulerResult<Vec<ExecutionLogEntry>> {
        let state = self.state.lock().await;
        let mut logs: Vec<ExecutionLogEntry> = state
            .logs
            .values()
            .filter(|e| task_type.map_or(true, |t| e.task_type == t))
            .cloned()
            .collect();
        logs.sort_by(|a, b| b.started_at.cmp(&a.started_at).then(b.id.cmp(&a.id)));
        logs.truncate(limit.max(0) as usize);
        Ok(logs)
    }

    async fn purge_logs(&self, older_than: DateTime<Utc>) -> SchedulerResult<u64> {
        let mut state = self.state.lock().await;
        let before = state.logs.len();
        state
            .logs
            .retain(|_, e| !(e.status.is_finished() && e.started_at < older_than));
        Ok((before - state.logs.len()) as u64)
    }

    async fn stats(&self, lease_ttl: Duration) -> SchedulerResult<ScheduleStats> {
        let now = self.clock.now();
        let cutoff = lease_cutoff(now, lease_ttl);
        let state = self.state.lock().await;

        let mut stats = ScheduleStats::default();
        for def in state.definitions.values() {
            stats.total_tasks += 1;
            match def.status {
                TaskStatus::Active => stats.active_tasks += 1,
                TaskStatus::Paused => stats.paused_tasks += 1,
            }
            if def.is_due(now) {
                stats.due_tasks += 1;
            }
            if state.live_leases(def.id, cutoff) > 0 {
                stats.locked_tasks += 1;
            }
            if def.fail_count > 0 {
                stats.failing_tasks += 1;
            }
        }
        stats.held_leases = state
            .leases
            .values()
            .filter(|l| l.heartbeat_at >= cutoff)
            .count() as i64;

        let mut upcoming: Vec<TaskDefinition> = state
            .definitions
            .values()
            .filter(|d| d.is_active() && d.next_run_at.is_some())
            .cloned()
            .collect();
        upcoming.sort_by_key(|d| (d.next_run_at, d.id));
        upcoming.truncate(5);
        stats.upcoming = upcoming;

        Ok(stats)
    }

    async fn record_test_run(
        &self,
        task_type: &str,
        worker_id: &str,
        outcome: &ExecutionOutcome,
    ) -> SchedulerResult<()> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let task_id = state.definition_by_type_mut(task_type)?.id;

        let log_id = state.next_log_id;
        state.next_log_id += 1;
        let started_at = now
            - chrono::Duration::from_std(outcome.duration).unwrap_or(chrono::Duration::zero());
        state.logs.insert(
            log_id,
            ExecutionLogEntry {
                id: log_id,
                task_id,
                task_type: task_type.to_string(),
                status: outcome.log_status(),
                started_at,
                finished_at: Some(now),
                execution_time_seconds: Some(outcome.execution_time_seconds()),
                result: outcome.result.clone(),
                error_message: outcome.error_message.clone(),
                locked_by: Some(worker_id.to_string()),
            },
        );

        state.definition_by_type_mut(task_type)?.last_status = LastStatus::Test;
        Ok(())
    }
}
