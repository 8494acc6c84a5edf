use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::impl_text_enum;
use crate::errors::SchedulerError;

/// 执行日志, 认领时创建 (`running`), 释放或回收时补全
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionLogEntry {
    pub id: i64,
    pub task_id: i64,
    pub task_type: String,
    pub status: LogStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub execution_time_seconds: Option<f64>,
    pub result: Option<String>,
    pub error_message: Option<String>,
    pub locked_by: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum LogStatus {
    Running,
    Completed,
    Failed,
    Timeout,
}

impl LogStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogStatus::Running => "running",
            LogStatus::Completed => "completed",
            LogStatus::Failed => "failed",
            LogStatus::Timeout => "timeout",
        }
    }

    pub fn is_finished(&self) -> bool {
        !matches!(self, LogStatus::Running)
    }
}

impl FromStr for LogStatus {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(LogStatus::Running),
            "completed" => Ok(LogStatus::Completed),
            "failed" => Ok(LogStatus::Failed),
            "timeout" => Ok(LogStatus::Timeout),
            other => Err(SchedulerError::Serialization(format!(
                "无效的日志状态: {other}"
            ))),
        }
    }
}

impl_text_enum!(LogStatus);

/// 回收过期租约时写入日志的错误信息
pub fn lease_expired_message(worker_id: &str, locked_at: DateTime<Utc>, ttl_seconds: u64) -> String {
    format!(
        "lease expired: worker {worker_id} 自 {} 起持有租约, 超过 {ttl_seconds} 秒未续约",
        locked_at.to_rfc3339()
    )
}
