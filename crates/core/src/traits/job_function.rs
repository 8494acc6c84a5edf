use async_trait::async_trait;

use crate::models::JobSummary;
use crate::SchedulerResult;

/// 作业函数: 某个任务类型对应的协作方调用
///
/// 返回 `Err` 或带 `error` 字段的摘要都视为失败。
#[async_trait]
pub trait JobFunction: Send + Sync {
    /// 作业种类描述, 用于日志
    fn kind(&self) -> &str;

    async fn run(&self) -> SchedulerResult<JobSummary>;
}

