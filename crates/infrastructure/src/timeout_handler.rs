//! 超时守卫
//!
//! 作业在独立的 tokio 任务上运行, 调用方用 `tokio::time::timeout` 等待其句柄,
//! 到期后中止该任务。调用方最迟在截止时间收回控制权。
//! 守卫自身被丢弃 (外层守卫超时) 时同样中止作业, 嵌套的作业随外层一起结束。

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use cronpool_core::{SchedulerError, SchedulerResult, TimeoutsConfig};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::timeout;
use tracing::{error, instrument, warn};

/// 受守卫执行的结果
#[derive(Debug)]
pub enum GuardOutcome<T> {
    Completed { value: T, duration: Duration },
    Failed { error: SchedulerError, duration: Duration },
    TimedOut { timeout: Duration, duration: Duration },
}

impl<T> GuardOutcome<T> {
    pub fn duration(&self) -> Duration {
        match self {
            GuardOutcome::Completed { duration, .. }
            | GuardOutcome::Failed { duration, .. }
            | GuardOutcome::TimedOut { duration, .. } => *duration,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, GuardOutcome::Completed { .. })
    }

    pub fn is_timed_out(&self) -> bool {
        matches!(self, GuardOutcome::TimedOut { .. })
    }
}

/// 被丢弃时中止任务的句柄
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Future for AbortOnDrop<T> {
    type Output = Result<T, JoinError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.0).poll(cx)
    }
}

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// 在独立任务上运行 `job`, `limit` 为 `None` 时不设截止时间
///
/// 作业 panic 或被取消都归为失败。
#[instrument(skip(job), fields(job = %name))]
pub async fn run_with_timeout<F, T>(name: &str, job: F, limit: Option<Duration>) -> GuardOutcome<T>
where
    F: Future<Output = SchedulerResult<T>> + Send + 'static,
    T: Send + 'static,
{
    let started = Instant::now();
    let mut handle = AbortOnDrop(tokio::spawn(job));

    let joined = match limit {
        Some(limit) => match timeout(limit, &mut handle).await {
            Ok(joined) => joined,
            Err(_) => {
                drop(handle);
                error!("作业 '{}' 超时 (超时时间: {:?})，已中止", name, limit);
                return GuardOutcome::TimedOut {
                    timeout: limit,
                    duration: started.elapsed(),
                };
            }
        },
        None => handle.await,
    };

    let duration = started.elapsed();
    match joined {
        Ok(Ok(value)) => GuardOutcome::Completed { value, duration },
        Ok(Err(error)) => GuardOutcome::Failed { error, duration },
        Err(join_error) => {
            let message = if join_error.is_panic() {
                format!("作业 '{name}' 发生panic")
            } else {
                format!("作业 '{name}' 被取消")
            };
            warn!("{}", message);
            GuardOutcome::Failed {
                error: SchedulerError::TaskExecution(message),
                duration,
            }
        }
    }
}

/// 带超时策略的守卫
#[derive(Debug, Clone, Default)]
pub struct TimeoutGuard {
    config: TimeoutsConfig,
}

impl TimeoutGuard {
    pub fn new(config: TimeoutsConfig) -> Self {
        Self { config }
    }

    /// 关闭所有截止时间, 用于本地调试
    pub fn disabled() -> Self {
        Self::new(TimeoutsConfig {
            enabled: false,
            ..TimeoutsConfig::default()
        })
    }

    pub fn config(&self) -> &TimeoutsConfig {
        &self.config
    }

    pub fn timeout_for(&self, task_type: &str, job_default: Option<u64>) -> Option<Duration> {
        self.config.resolve(task_type, job_default)
    }

    /// 按任务类型解析超时后执行
    pub async fn run<F, T>(&self, task_type: &str, job_default: Option<u64>, job: F) -> GuardOutcome<T>
    where
        F: Future<Output = SchedulerResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        let limit = self.timeout_for(task_type, job_default);
        run_with_timeout(task_type, job, limit).await
    }
}

/// 存储调用的超时工具
pub struct TimeoutUtils;

impl TimeoutUtils {
    /// 超时按存储错误处理, 调用方会退避重试
    #[instrument(skip(operation, operation_name))]
    pub async fn storage<F, T>(
        operation: F,
        timeout_duration: Duration,
        operation_name: &str,
    ) -> SchedulerResult<T>
    where
        F: Future<Output = SchedulerResult<T>>,
    {
        match timeout(timeout_duration, operation).await {
            Ok(result) => result,
            Err(_) => {
                let error_msg =
                    format!("存储操作 '{operation_name}' 超时 (超时时间: {timeout_duration:?})");
                error!("{}", error_msg);
                Err(SchedulerError::DatabaseOperation(error_msg))
            }
        }
    }
}
