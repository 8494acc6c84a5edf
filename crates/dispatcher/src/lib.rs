//! 调度进程
//!
//! 只负责根据 cron 表达式推进 `next_run_at`, 作业的认领和执行由 Worker 完成。

pub mod cron_utils;
pub mod scheduler;

pub use cron_utils::{next_occurrence, CronScheduler};
pub use scheduler::{plan_next_run, TaskScheduler, TickReport};
