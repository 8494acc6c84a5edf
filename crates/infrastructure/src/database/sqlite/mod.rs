pub mod sqlite_schedule_store;

pub use sqlite_schedule_store::SqliteScheduleStore;

use std::str::FromStr;
use std::time::Duration;

use cronpool_core::{DatabaseConfig, SchedulerResult};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::debug;

/// 按配置创建SQLite连接池, 开启外键约束和WAL模式
pub async fn connect_pool(config: &DatabaseConfig) -> SchedulerResult<SqlitePool> {
    debug!("连接SQLite数据库: {}", config.url);

    let connect_options = SqliteConnectOptions::from_str(&config.url)?
        .create_if_missing(true)
        .foreign_keys(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(config.connection_timeout_seconds));

    let pool = SqlitePoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(Duration::from_secs(config.connection_timeout_seconds))
        .idle_timeout(Duration::from_secs(config.idle_timeout_seconds))
        .connect_with(connect_options)
        .await?;

    Ok(pool)
}
