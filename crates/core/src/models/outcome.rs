use std::time::Duration;

use serde::Serialize;

use super::{LastStatus, LogStatus};

/// 一次执行的最终结果种类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    Completed,
    Failed,
    TimedOut,
}

impl OutcomeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutcomeKind::Completed => "completed",
            OutcomeKind::Failed => "failed",
            OutcomeKind::TimedOut => "timed_out",
        }
    }
}

/// Worker 交给存储层的执行结果
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionOutcome {
    pub kind: OutcomeKind,
    pub result: Option<String>,
    pub error_message: Option<String>,
    pub duration: Duration,
    /// 配置错误 (未注册的任务类型、错误的作业编排等), 任务会被挂起
    pub configuration_error: bool,
}

impl ExecutionOutcome {
    pub fn completed(result: impl Into<String>, duration: Duration) -> Self {
        Self {
            kind: OutcomeKind::Completed,
            result: Some(result.into()),
            error_message: None,
            duration,
            configuration_error: false,
        }
    }

    pub fn failed(error: impl Into<String>, duration: Duration) -> Self {
        Self {
            kind: OutcomeKind::Failed,
            result: None,
            error_message: Some(error.into()),
            duration,
            configuration_error: false,
        }
    }

    pub fn timed_out(timeout: Duration, duration: Duration) -> Self {
        Self {
            kind: OutcomeKind::TimedOut,
            result: None,
            error_message: Some(format!("执行超时 (超过 {} 秒)", timeout.as_secs())),
            duration,
            configuration_error: false,
        }
    }

    pub fn configuration_error(error: impl Into<String>) -> Self {
        Self {
            configuration_error: true,
            ..Self::failed(error, Duration::ZERO)
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.kind, OutcomeKind::Completed)
    }

    pub fn log_status(&self) -> LogStatus {
        match self.kind {
            OutcomeKind::Completed => LogStatus::Completed,
            OutcomeKind::Failed => LogStatus::Failed,
            OutcomeKind::TimedOut => LogStatus::Timeout,
        }
    }

    /// 超时在任务定义上同样记为失败
    pub fn last_status(&self) -> LastStatus {
        if self.is_success() {
            LastStatus::Completed
        } else {
            LastStatus::Failed
        }
    }

    pub fn execution_time_seconds(&self) -> f64 {
        self.duration.as_secs_f64()
    }
}
