use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::impl_text_enum;
use crate::errors::SchedulerError;

/// 任务定义及其运行时状态
///
/// 每个任务类型一行, 由调度存储持久化, 所有进程共享。
///
/// - `schedule_pattern`: 5段 cron 表达式, 也接受带秒字段的 6/7 段表达式
/// - `max_concurrent_runs`: 同一任务类型同时持有的租约上限 (>= 1)
/// - `execution_order`: 可选的排序提示, 值小的优先, 未设置的排在最后
/// - `locked_at`/`locked_by`: 最近一次仍然有效的认领, 仅用于展示
/// - `fail_count`: 连续失败次数, 成功后清零
/// - `last_run_at`: 最近一次执行的开始时间
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskDefinition {
    pub id: i64,
    pub task_type: String,
    pub schedule_pattern: String,
    pub status: TaskStatus,
    pub max_concurrent_runs: i32,
    pub execution_order: Option<i32>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub locked_at: Option<DateTime<Utc>>,
    pub locked_by: Option<String>,
    pub fail_count: i32,
    pub last_status: LastStatus,
    pub last_run_at: Option<DateTime<Utc>>,
}

impl TaskDefinition {
    pub fn is_active(&self) -> bool {
        matches!(self.status, TaskStatus::Active)
    }

    /// `next_run_at` 对应的这次触发是否已经被认领过
    pub fn occurrence_claimed(&self) -> bool {
        match (self.next_run_at, self.last_run_at) {
            (Some(next), Some(last)) => last >= next,
            _ => false,
        }
    }

    /// 是否到期: 活跃、`next_run_at` 已过且本次触发尚未被认领
    ///
    /// 并发上限由存储层按租约计数判断, 这里不考虑。
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.is_active()
            && self.next_run_at.is_some_and(|next| next <= now)
            && !self.occurrence_claimed()
    }
}

/// 任务定义状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Active,
    Paused,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Active => "active",
            TaskStatus::Paused => "paused",
        }
    }
}

impl FromStr for TaskStatus {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(TaskStatus::Active),
            "paused" => Ok(TaskStatus::Paused),
            other => Err(SchedulerError::Serialization(format!(
                "无效的任务状态: {other}"
            ))),
        }
    }
}

impl_text_enum!(TaskStatus);

/// 最近一次执行的状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum LastStatus {
    Ready,
    Running,
    Completed,
    Failed,
    /// 由运维命令在本地手动执行过一次
    Test,
}

impl LastStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LastStatus::Ready => "ready",
            LastStatus::Running => "running",
            LastStatus::Completed => "completed",
            LastStatus::Failed => "failed",
            LastStatus::Test => "test",
        }
    }
}

impl FromStr for LastStatus {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ready" => Ok(LastStatus::Ready),
            "running" => Ok(LastStatus::Running),
            "completed" => Ok(LastStatus::Completed),
            "failed" => Ok(LastStatus::Failed),
            "test" => Ok(LastStatus::Test),
            other => Err(SchedulerError::Serialization(format!(
                "无效的执行状态: {other}"
            ))),
        }
    }
}

impl_text_enum!(LastStatus);

/// 新建或更新任务定义的请求
///
/// 按 `task_type` 做 upsert: 已存在时更新调度表达式等配置并清空 `next_run_at`,
/// 由调度器按新表达式重新计算; 运行时状态 (租约、失败计数) 保持不变。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewTaskDefinition {
    pub task_type: String,
    pub schedule_pattern: String,
    pub status: TaskStatus,
    pub max_concurrent_runs: i32,
    pub execution_order: Option<i32>,
}

impl NewTaskDefinition {
    pub fn new(task_type: impl Into<String>, schedule_pattern: impl Into<String>) -> Self {
        Self {
            task_type: task_type.into(),
            schedule_pattern: schedule_pattern.into(),
            status: TaskStatus::Active,
            max_concurrent_runs: 1,
            execution_order: None,
        }
    }

    pub fn max_concurrent_runs(mut self, max: i32) -> Self {
        self.max_concurrent_runs = max;
        self
    }

    pub fn execution_order(mut self, order: i32) -> Self {
        self.execution_order = Some(order);
        self
    }

    pub fn paused(mut self) -> Self {
        self.status = TaskStatus::Paused;
        self
    }

    /// 校验与 cron 无关的字段, cron 表达式由调度模块校验
    pub fn validate(&self) -> crate::SchedulerResult<()> {
        if self.task_type.trim().is_empty() {
            return Err(SchedulerError::Configuration("任务类型不能为空".to_string()));
        }
        if self.schedule_pattern.trim().is_empty() {
            return Err(SchedulerError::Configuration(format!(
                "任务 {} 的调度表达式不能为空",
                self.task_type
            )));
        }
        if self.max_concurrent_runs < 1 {
            return Err(SchedulerError::Configuration(format!(
                "任务 {} 的最大并发数必须大于等于1, 当前为 {}",
                self.task_type, self.max_concurrent_runs
            )));
        }
        Ok(())
    }
}

/// 一个被持有的并发槽位
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskLease {
    pub id: i64,
    pub task_id: i64,
    pub worker_id: String,
    pub locked_at: DateTime<Utc>,
    pub heartbeat_at: DateTime<Utc>,
    /// 认领时创建的执行日志
    pub log_id: i64,
}

/// 认领结果: 租约加上认领后的任务定义
#[derive(Debug, Clone)]
pub struct ClaimedTask {
    pub lease: TaskLease,
    pub definition: TaskDefinition,
}

/// 释放租约的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReleaseReport {
    /// 租约已被回收时为 false, 此时存储没有任何改动
    pub released: bool,
    pub fail_count: i32,
}

/// 被回收的过期租约
#[derive(Debug, Clone)]
pub struct ReclaimedLease {
    pub lease: TaskLease,
    pub task_type: String,
}

/// 运维统计
#[derive(Debug, Clone, Default, Serialize)]
pub struct ScheduleStats {
    pub total_tasks: i64,
    pub active_tasks: i64,
    pub paused_tasks: i64,
    pub due_tasks: i64,
    /// 至少持有一个有效租约的任务数
    pub locked_tasks: i64,
    pub held_leases: i64,
    /// `fail_count > 0` 的任务数
    pub failing_tasks: i64,
    pub upcoming: Vec<TaskDefinition>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn definition() -> TaskDefinition {
        TaskDefinition {
            id: 1,
            task_type: "scraping".to_string(),
            schedule_pattern: "*/10 * * * *".to_string(),
            status: TaskStatus::Active,
            max_concurrent_runs: 1,
            execution_order: None,
            next_run_at: None,
            locked_at: None,
            locked_by: None,
            fail_count: 0,
            last_status: LastStatus::Ready,
            last_run_at: None,
        }
    }

    #[test]
    fn test_is_due() {
        let at = |m| Utc.with_ymd_and_hms(2024, 1, 1, 0, m, 0).unwrap();
        let mut def = definition();
        assert!(!def.is_due(at(0)));

        def.next_run_at = Some(at(0));
        assert!(def.is_due(at(0)));
        assert!(!def.is_due(at(0) - chrono::Duration::seconds(1)));

        def.last_run_at = Some(at(0));
        assert!(def.occurrence_claimed());
        assert!(!def.is_due(at(5)));

        def.next_run_at = Some(at(10));
        assert!(!def.occurrence_claimed());
        assert!(def.is_due(at(10)));

        def.status = TaskStatus::Paused;
        assert!(!def.is_due(at(10)));
    }

    #[test]
    fn test_status_round_trip() {
        for status in [TaskStatus::Active, TaskStatus::Paused] {
            assert_eq!(status.as_str().parse::<TaskStatus>().unwrap(), status);
        }
        assert_eq!("test".parse::<LastStatus>().unwrap(), LastStatus::Test);
        assert!("ACTIVE".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn test_new_definition_validation() {
        assert!(NewTaskDefinition::new("scraping", "*/10 * * * *").validate().is_ok());
        assert!(NewTaskDefinition::new(" ", "* * * * *").validate().is_err());
        assert!(NewTaskDefinition::new("scraping", "").validate().is_err());
        assert!(NewTaskDefinition::new("scraping", "* * * * *")
            .max_concurrent_runs(0)
            .validate()
            .is_err());
    }
}
