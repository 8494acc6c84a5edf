pub mod postgres_schedule_store;

pub use postgres_schedule_store::PostgresScheduleStore;

use std::time::Duration;

use cronpool_core::{DatabaseConfig, SchedulerResult};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::debug;

/// 按配置创建PostgreSQL连接池
pub async fn connect_pool(config: &DatabaseConfig) -> SchedulerResult<PgPool> {
    debug!("连接PostgreSQL数据库");

    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(Duration::from_secs(config.connection_timeout_seconds))
        .idle_timeout(Duration::from_secs(config.idle_timeout_seconds))
        .max_lifetime(Duration::from_secs(1800)) // 30分钟默认生命周期
        .connect(&config.url)
        .await?;

    Ok(pool)
}
