use anyhow::Result;
use cronpool::app::AppMode;
use cronpool::common::run_cli;

#[tokio::main]
async fn main() -> Result<()> {
    run_cli(
        "cronpool-scheduler",
        "分布式定时任务调度系统 - 调度器",
        Some("按cron表达式推进每个任务的下次运行时间，不执行任何作业"),
        Vec::new(),
        AppMode::Scheduler,
        "调度器",
    )
    .await
}
