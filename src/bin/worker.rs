use anyhow::Result;
use clap::Arg;
use cronpool::app::AppMode;
use cronpool::common::run_cli;

#[tokio::main]
async fn main() -> Result<()> {
    let custom_args = vec![Arg::new("worker-id")
        .short('w')
        .long("worker-id")
        .value_name("ID")
        .help("Worker节点唯一标识符 (默认 主机名-进程号)")];

    run_cli(
        "cronpool-worker",
        "分布式定时任务调度系统 - Worker",
        Some("认领到期任务并在超时守卫下执行，同一时刻只执行一个任务"),
        custom_args,
        AppMode::Worker,
        "Worker",
    )
    .await
}
