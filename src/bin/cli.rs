use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use cronpool::app::mask_database_url;
use cronpool_core::{
    AppConfig, ExecutionLogEntry, NewTaskDefinition, ScheduleAdmin, TaskDefinition, TaskStatus,
};
use cronpool_dispatcher::CronScheduler;
use cronpool_infrastructure::{DatabaseManager, TimeoutGuard};
use cronpool_worker::{run_job_locally, TaskRegistry};
use tracing_subscriber::EnvFilter;

/// 运维命令行工具, 直接操作共享存储
#[derive(Parser, Debug)]
#[command(name = "cronpool-cli")]
#[command(version)]
#[command(about = "分布式定时任务调度系统 - 运维命令行工具")]
struct CliApp {
    #[command(subcommand)]
    command: Commands,

    /// 配置文件路径
    #[arg(short, long)]
    config: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// 新建或更新任务定义
    #[command(alias = "update")]
    Add {
        /// 任务类型
        task_type: String,
        /// cron表达式, 例如 "*/10 * * * *"
        schedule: String,
        /// 最大并发数
        #[arg(short, long, default_value_t = 1)]
        max_concurrent: i32,
        /// 排序提示, 小的优先
        #[arg(short, long)]
        order: Option<i32>,
        /// 以暂停状态创建
        #[arg(long)]
        paused: bool,
    },
    /// 列出所有任务定义
    List,
    /// 查看任务定义详情
    Show { task_type: String },
    /// 暂停任务
    Pause { task_type: String },
    /// 恢复任务, 同时清零失败计数
    Resume { task_type: String },
    /// 立即运行: 清除租约并设为到期
    Run { task_type: String },
    /// 清除任务的所有租约
    Unlock { task_type: String },
    /// 清零失败计数, 不指定任务时作用于全部任务
    Reset { task_type: Option<String> },
    /// 设置最大并发数
    Concurrency { task_type: String, max: i32 },
    /// 最近的执行日志
    Logs {
        #[arg(short, long)]
        task_type: Option<String>,
        #[arg(short, long, default_value_t = 20)]
        limit: i64,
    },
    /// 删除过期的执行日志
    Cleanup {
        /// 保留天数
        #[arg(short, long, default_value_t = 30)]
        days: i64,
    },
    /// 调度统计
    Stats,
    /// 在本进程执行一次作业, 结果记为 test
    RunOnce { task_type: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let cli = CliApp::parse();
    let config = AppConfig::load(cli.config.as_deref()).context("加载配置失败")?;

    let database = DatabaseManager::connect(&config.database)
        .await
        .with_context(|| format!("连接数据库失败: {}", mask_database_url(&config.database.url)))?;
    let admin = database.store_handles().admin;

    let result = execute(cli.command, &config, admin).await;
    database.close().await;
    result
}

async fn execute(command: Commands, config: &AppConfig, admin: Arc<dyn ScheduleAdmin>) -> Result<()> {
    match command {
        Commands::Add {
            task_type,
            schedule,
            max_concurrent,
            order,
            paused,
        } => {
            CronScheduler::validate_cron_expression(&schedule)?;
            let mut definition =
                NewTaskDefinition::new(task_type, schedule).max_concurrent_runs(max_concurrent);
            if let Some(order) = order {
                definition = definition.execution_order(order);
            }
            if paused {
                definition = definition.paused();
            }
            let saved = admin.upsert_definition(&definition).await?;
            println!("任务已保存: {} ({})", saved.task_type, saved.schedule_pattern);
            if !config.jobs.contains_key(&saved.task_type) {
                println!("注意: 配置中没有 {} 对应的作业，Worker认领后会挂起该任务", saved.task_type);
            }
        }
        Commands::List => {
            let definitions = admin.list_definitions().await?;
            print_definitions_table(&definitions);
        }
        Commands::Show { task_type } => {
            let definition = admin
                .get_definition(&task_type)
                .await?
                .ok_or_else(|| anyhow::anyhow!("任务定义未找到: {task_type}"))?;
            print_definition_details(&definition);
        }
        Commands::Pause { task_type } => {
            admin.set_status(&task_type, TaskStatus::Paused).await?;
            println!("任务已暂停: {task_type}");
        }
        Commands::Resume { task_type } => {
            admin.set_status(&task_type, TaskStatus::Active).await?;
            println!("任务已恢复: {task_type}");
        }
        Commands::Run { task_type } => {
            admin.force_due(&task_type).await?;
            println!("任务已设为立即运行: {task_type}");
        }
        Commands::Unlock { task_type } => {
            let cleared = admin.unlock(&task_type).await?;
            println!("已清除 {task_type} 的 {cleared} 个租约");
        }
        Commands::Reset { task_type } => {
            let count = admin.reset_failures(task_type.as_deref()).await?;
            println!("已清零 {count} 个任务的失败计数");
        }
        Commands::Concurrency { task_type, max } => {
            admin.set_max_concurrent_runs(&task_type, max).await?;
            println!("{task_type} 的最大并发数已设为 {max}");
        }
        Commands::Logs { task_type, limit } => {
            let logs = admin.recent_logs(task_type.as_deref(), limit).await?;
            print_logs_table(&logs);
        }
        Commands::Cleanup { days } => {
            let cutoff = purge_cutoff(Utc::now(), days)?;
            let deleted = admin.purge_logs(cutoff).await?;
            println!("已删除 {deleted} 条早于 {} 的执行日志", cutoff.format("%Y-%m-%d %H:%M:%S UTC"));
        }
        Commands::Stats => {
            let stats = admin.stats(config.worker.lease_ttl()).await?;
            println!("任务总数: {}", stats.total_tasks);
            println!("  活跃: {}", stats.active_tasks);
            println!("  暂停: {}", stats.paused_tasks);
            println!("  到期: {}", stats.due_tasks);
            println!("  运行中: {} (租约 {})", stats.locked_tasks, stats.held_leases);
            println!("  失败: {}", stats.failing_tasks);
            if !stats.upcoming.is_empty() {
                println!("即将运行:");
                for task in &stats.upcoming {
                    println!("  {:<30} {}", task.task_type, format_time(task.next_run_at));
                }
            }
        }
        Commands::RunOnce { task_type } => {
            admin
                .get_definition(&task_type)
                .await?
                .ok_or_else(|| anyhow::anyhow!("任务定义未找到: {task_type}"))?;

            let client = reqwest::Client::builder()
                .build()
                .context("创建HTTP客户端失败")?;
            let registry = TaskRegistry::from_config(&config.jobs, &config.timeouts, client, None);
            let guard = TimeoutGuard::new(config.timeouts.clone());

            let outcome = run_job_locally(&registry, &guard, &task_type).await?;
            let worker_id = format!("cli-{}", config.worker.worker_id);
            admin.record_test_run(&task_type, &worker_id, &outcome).await?;

            println!(
                "{} 执行结束: {} (耗时 {:.2}秒)",
                task_type,
                outcome.kind.as_str(),
                outcome.execution_time_seconds()
            );
            if let Some(result) = &outcome.result {
                println!("结果: {result}");
            }
            if let Some(error) = &outcome.error_message {
                println!("错误: {error}");
            }
            if !outcome.is_success() {
                return Err(anyhow::anyhow!("作业 {task_type} 执行失败"));
            }
        }
    }
    Ok(())
}

/// 日志清理的截止时间, 保留天数超出时间范围时报错
fn purge_cutoff(now: chrono::DateTime<Utc>, days: i64) -> Result<chrono::DateTime<Utc>> {
    if days < 0 {
        return Err(anyhow::anyhow!("保留天数不能为负数: {days}"));
    }
    chrono::TimeDelta::try_days(days)
        .and_then(|retention| now.checked_sub_signed(retention))
        .ok_or_else(|| anyhow::anyhow!("保留天数超出范围: {days}"))
}

fn format_time(at: Option<chrono::DateTime<Utc>>) -> String {
    at.map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "-".to_string())
}

fn print_definitions_table(definitions: &[TaskDefinition]) {
    println!(
        "{:<28} {:<16} {:<8} {:<6} {:<10} {:<20} {:<6}",
        "任务类型", "调度", "状态", "并发", "最近状态", "下次运行", "失败"
    );
    println!("{}", "-".repeat(100));
    for def in definitions {
        println!(
            "{:<28} {:<16} {:<8} {:<6} {:<10} {:<20} {:<6}",
            def.task_type,
            def.schedule_pattern,
            def.status.as_str(),
            def.max_concurrent_runs,
            def.last_status.as_str(),
            format_time(def.next_run_at),
            def.fail_count
        );
    }
    println!("共 {} 个任务", definitions.len());
}

fn print_definition_details(def: &TaskDefinition) {
    println!("任务类型: {}", def.task_type);
    println!("调度表达式: {}", def.schedule_pattern);
    println!("状态: {}", def.status.as_str());
    println!("最大并发数: {}", def.max_concurrent_runs);
    println!(
        "排序: {}",
        def.execution_order
            .map(|o| o.to_string())
            .unwrap_or_else(|| "-".to_string())
    );
    println!("下次运行: {}", format_time(def.next_run_at));
    println!("最近运行: {}", format_time(def.last_run_at));
    println!("最近状态: {}", def.last_status.as_str());
    println!("连续失败: {}", def.fail_count);
    if let Some(locked_by) = &def.locked_by {
        println!("锁定者: {} @ {}", locked_by, format_time(def.locked_at));
    }
}

fn print_logs_table(logs: &[ExecutionLogEntry]) {
    println!(
        "{:<8} {:<28} {:<10} {:<20} {:<10} {}",
        "ID", "任务类型", "状态", "开始时间", "耗时(秒)", "结果/错误"
    );
    println!("{}", "-".repeat(100));
    for log in logs {
        let detail = log
            .error_message
            .as_deref()
            .or(log.result.as_deref())
            .unwrap_or("");
        println!(
            "{:<8} {:<28} {:<10} {:<20} {:<10} {}",
            log.id,
            log.task_type,
            log.status.as_str(),
            log.started_at.format("%Y-%m-%d %H:%M:%S"),
            log.execution_time_seconds
                .map(|s| format!("{s:.2}"))
                .unwrap_or_else(|| "-".to_string()),
            detail.chars().take(80).collect::<String>()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_purge_cutoff() {
        let now = Utc.with_ymd_and_hms(2024, 3, 31, 12, 0, 0).unwrap();
        assert_eq!(
            purge_cutoff(now, 30).unwrap(),
            Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
        );
        assert_eq!(purge_cutoff(now, 0).unwrap(), now);
        assert!(purge_cutoff(now, -1).is_err());
        assert!(purge_cutoff(now, i64::MAX).is_err());
        assert!(purge_cutoff(now, 100_000_000).is_err());
    }
}
