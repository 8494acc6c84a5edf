use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cronpool_core::{
    lease_cutoff, lease_expired_message, ClaimedTask, Clock, ExecutionLogEntry, ExecutionOutcome,
    LastStatus, NewTaskDefinition, ReclaimedLease, ReleaseReport, ScheduleAdmin,
    ScheduleStats, ScheduleStore, SchedulerError, SchedulerResult, SystemClock, TaskDefinition,
    TaskLease, TaskStatus,
};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};
use tracing::{debug, error, info, instrument, warn};

const DEFINITION_COLUMNS: &str = "id, task_type, schedule_pattern, status, max_concurrent_runs, \
     execution_order, next_run_at, locked_at, locked_by, fail_count, last_status, last_run_at";

const LEASE_COLUMNS: &str = "id, task_id, worker_id, locked_at, heartbeat_at, log_id";

const LOG_COLUMNS: &str = "l.id, l.task_id, t.task_type, l.status, l.started_at, l.finished_at, \
     l.execution_time_seconds, l.result, l.error_message, l.locked_by";

/// 选出一个可认领的任务: 到期、本次触发未被认领、有效租约数低于上限
const CLAIM_CANDIDATE_SQL: &str = r#"
    SELECT t.id FROM scheduled_tasks t
    WHERE t.status = 'active'
      AND t.next_run_at IS NOT NULL
      AND t.next_run_at <= ?1
      AND (t.last_run_at IS NULL OR t.last_run_at < t.next_run_at)
      AND (
          SELECT COUNT(*) FROM scheduled_task_leases l
          WHERE l.task_id = t.id AND l.heartbeat_at >= ?2
      ) < t.max_concurrent_runs
    ORDER BY CASE WHEN t.execution_order IS NULL THEN 1 ELSE 0 END,
             t.execution_order, t.next_run_at, t.id
    LIMIT 1
"#;

/// 用剩余租约中最近的一个刷新任务上的 `locked_at/locked_by`
const REFRESH_LOCK_SQL: &str = r#"
    UPDATE scheduled_tasks SET
        locked_at = (SELECT locked_at FROM scheduled_task_leases
                     WHERE task_id = ?1 ORDER BY locked_at DESC, id DESC LIMIT 1),
        locked_by = (SELECT worker_id FROM scheduled_task_leases
                     WHERE task_id = ?1 ORDER BY locked_at DESC, id DESC LIMIT 1)
    WHERE id = ?1
"#;

/// SQLite 调度存储
///
/// 认领在 `BEGIN IMMEDIATE` 事务中完成, 同一数据库文件上的写者互斥。
pub struct SqliteScheduleStore {
    pool: SqlitePool,
    clock: Arc<dyn Clock>,
}

impl SqliteScheduleStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self::with_clock(pool, Arc::new(SystemClock))
    }

    pub fn with_clock(pool: SqlitePool, clock: Arc<dyn Clock>) -> Self {
        Self { pool, clock }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// 运行数据库迁移
    pub async fn run_migrations(&self) -> SchedulerResult<()> {
        debug!("Running SQLite schedule store migrations");

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS scheduled_tasks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                task_type TEXT NOT NULL UNIQUE,
                schedule_pattern TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'active',
                max_concurrent_runs INTEGER NOT NULL DEFAULT 1 CHECK (max_concurrent_runs >= 1),
                execution_order INTEGER,
                next_run_at DATETIME,
                locked_at DATETIME,
                locked_by TEXT,
                fail_count INTEGER NOT NULL DEFAULT 0,
                last_status TEXT NOT NULL DEFAULT 'ready',
                last_run_at DATETIME
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS scheduled_task_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                task_id INTEGER NOT NULL,
                status TEXT NOT NULL,
                started_at DATETIME NOT NULL,
                finished_at DATETIME,
                execution_time_seconds REAL,
                result TEXT,
                error_message TEXT,
                locked_by TEXT,
                FOREIGN KEY (task_id) REFERENCES scheduled_tasks(id) ON DELETE CASCADE
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS scheduled_task_leases (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                task_id INTEGER NOT NULL,
                worker_id TEXT NOT NULL,
                locked_at DATETIME NOT NULL,
                heartbeat_at DATETIME NOT NULL,
                log_id INTEGER NOT NULL,
                FOREIGN KEY (task_id) REFERENCES scheduled_tasks(id) ON DELETE CASCADE
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        let indexes = [
            "CREATE INDEX IF NOT EXISTS idx_scheduled_tasks_due ON scheduled_tasks(status, next_run_at)",
            "CREATE INDEX IF NOT EXISTS idx_task_logs_task_started ON scheduled_task_logs(task_id, started_at)",
            "CREATE INDEX IF NOT EXISTS idx_task_logs_started ON scheduled_task_logs(started_at)",
            "CREATE INDEX IF NOT EXISTS idx_task_leases_task ON scheduled_task_leases(task_id, heartbeat_at)",
        ];
        for index_sql in indexes {
            sqlx::query(index_sql).execute(&self.pool).await?;
        }

        debug!("SQLite schedule store migrations completed");
        Ok(())
    }

    fn row_to_definition(row: &SqliteRow) -> SchedulerResult<TaskDefinition> {
        Ok(TaskDefinition {
            id: row.try_get("id")?,
            task_type: row.try_get("task_type")?,
            schedule_pattern: row.try_get("schedule_pattern")?,
            status: row.try_get("status")?,
            max_concurrent_runs: row.try_get("max_concurrent_runs")?,
            execution_order: row.try_get("execution_order")?,
            next_run_at: row.try_get("next_run_at")?,
            locked_at: row.try_get("locked_at")?,
            locked_by: row.try_get("locked_by")?,
            fail_count: row.try_get("fail_count")?,
            last_status: row.try_get("last_status")?,
            last_run_at: row.try_get("last_run_at")?,
        })
    }

    fn row_to_lease(row: &SqliteRow) -> SchedulerResult<TaskLease> {
        Ok(TaskLease {
            id: row.try_get("id")?,
            task_id: row.try_get("task_id")?,
            worker_id: row.try_get("worker_id")?,
            locked_at: row.try_get("locked_at")?,
            heartbeat_at: row.try_get("heartbeat_at")?,
            log_id: row.try_get("log_id")?,
        })
    }

    fn row_to_log(row: &SqliteRow) -> SchedulerResult<ExecutionLogEntry> {
        Ok(ExecutionLogEntry {
            id: row.try_get("id")?,
            task_id: row.try_get("task_id")?,
            task_type: row.try_get("task_type")?,
            status: row.try_get("status")?,
            started_at: row.try_get("started_at")?,
            finished_at: row.try_get("finished_at")?,
            execution_time_seconds: row.try_get("execution_time_seconds")?,
            result: row.try_get("result")?,
            error_message: row.try_get("error_message")?,
            locked_by: row.try_get("locked_by")?,
        })
    }

    /// 在独占事务中运行 `op`
    ///
    /// 事务对象在 future 被丢弃 (例如外层超时) 时自动回滚, 连接归还连接池时不会残留未结束的事务。
    async fn with_immediate_transaction<T, F>(&self, op: F) -> SchedulerResult<T>
    where
        F: for<'c> FnOnce(
            &'c mut SqliteConnection,
        ) -> futures::future::BoxFuture<'c, SchedulerResult<T>>,
    {
        let mut tx = self.pool.begin_with("BEGIN IMMEDIATE").await?;

        match op(&mut *tx).await {
            Ok(value) => {
                tx.commit().await?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback_error) = tx.rollback().await {
                    error!("回滚事务失败: {}", rollback_error);
                }
                Err(e)
            }
        }
    }

    async fn task_id_by_type(
        conn: &mut SqliteConnection,
        task_type: &str,
    ) -> SchedulerResult<i64> {
        sqlx::query_scalar("SELECT id FROM scheduled_tasks WHERE task_type = ?1")
            .bind(task_type)
            .fetch_optional(&mut *conn)
            .await?
            .ok_or_else(|| SchedulerError::TaskNotFound {
                task_type: task_type.to_string(),
            })
    }

    /// 删除任务的全部租约, 对应的进行中日志记为失败
    async fn drop_leases(
        conn: &mut SqliteConnection,
        task_id: i64,
        now: DateTime<Utc>,
        reason: &str,
    ) -> SchedulerResult<u64> {
        sqlx::query(
            r#"
            UPDATE scheduled_task_logs
            SET status = 'failed', finished_at = ?2, error_message = ?3
            WHERE id IN (SELECT log_id FROM scheduled_task_leases WHERE task_id = ?1)
              AND status = 'running'
            "#,
        )
        .bind(task_id)
        .bind(now)
        .bind(reason)
        .execute(&mut *conn)
        .await?;

        let dropped = sqlx::query("DELETE FROM scheduled_task_leases WHERE task_id = ?1")
            .bind(task_id)
            .execute(&mut *conn)
            .await?
            .rows_affected();

        sqlx::query(REFRESH_LOCK_SQL)
            .bind(task_id)
            .execute(&mut *conn)
            .await?;

        Ok(dropped)
    }
}

async fn claim_in_transaction(
    conn: &mut SqliteConnection,
    worker_id: &str,
    now: DateTime<Utc>,
    cutoff: DateTime<Utc>,
) -> SchedulerResult<Option<ClaimedTask>> {
    let candidate: Option<i64> = sqlx::query_scalar(CLAIM_CANDIDATE_SQL)
        .bind(now)
        .bind(cutoff)
        .fetch_optional(&mut *conn)
        .await?;

    let Some(task_id) = candidate else {
        return Ok(None);
    };

    let log_id: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO scheduled_task_logs (task_id, status, started_at, locked_by)
        VALUES (?1, 'running', ?2, ?3)
        RETURNING id
        "#,
    )
    .bind(task_id)
    .bind(now)
    .bind(worker_id)
    .fetch_one(&mut *conn)
    .await?;

    let lease_row = sqlx::query(&format!(
        "INSERT INTO scheduled_task_leases (task_id, worker_id, locked_at, heartbeat_at, log_id) \
         VALUES (?1, ?2, ?3, ?3, ?4) RETURNING {LEASE_COLUMNS}"
    ))
    .bind(task_id)
    .bind(worker_id)
    .bind(now)
    .bind(log_id)
    .fetch_one(&mut *conn)
    .await?;
    let lease = SqliteScheduleStore::row_to_lease(&lease_row)?;

    sqlx::query(
        r#"
        UPDATE scheduled_tasks
        SET locked_at = ?1, locked_by = ?2, last_status = 'running', last_run_at = ?1
        WHERE id = ?3
        "#,
    )
    .bind(now)
    .bind(worker_id)
    .bind(task_id)
    .execute(&mut *conn)
    .await?;

    let row = sqlx::query(&format!(
        "SELECT {DEFINITION_COLUMNS} FROM scheduled_tasks WHERE id = ?1"
    ))
    .bind(task_id)
    .fetch_one(&mut *conn)
    .await?;
    let definition = SqliteScheduleStore::row_to_definition(&row)?;

    Ok(Some(ClaimedTask { lease, definition }))
}

async fn release_in_transaction(
    conn: &mut SqliteConnection,
    lease: &TaskLease,
    outcome: &ExecutionOutcome,
    now: DateTime<Utc>,
) -> SchedulerResult<ReleaseReport> {
    let deleted = sqlx::query("DELETE FROM scheduled_task_leases WHERE id = ?1")
        .bind(lease.id)
        .execute(&mut *conn)
        .await?
        .rows_affected();

    if deleted == 0 {
        let fail_count: Option<i32> =
            sqlx::query_scalar("SELECT fail_count FROM scheduled_tasks WHERE id = ?1")
                .bind(lease.task_id)
                .fetch_optional(&mut *conn)
                .await?;
        return Ok(ReleaseReport {
            released: false,
            fail_count: fail_count.unwrap_or_default(),
        });
    }

    sqlx::query(
        r#"
        UPDATE scheduled_task_logs
        SET status = ?2, finished_at = ?3, execution_time_seconds = ?4,
            result = ?5, error_message = ?6
        WHERE id = ?1
        "#,
    )
    .bind(lease.log_id)
    .bind(outcome.log_status())
    .bind(now)
    .bind(outcome.execution_time_seconds())
    .bind(outcome.result.as_deref())
    .bind(outcome.error_message.as_deref())
    .execute(&mut *conn)
    .await?;

    sqlx::query(REFRESH_LOCK_SQL)
        .bind(lease.task_id)
        .execute(&mut *conn)
        .await?;

    let fail_count: i32 = sqlx::query_scalar(
        r#"
        UPDATE scheduled_tasks
        SET last_status = ?2,
            fail_count = CASE WHEN ?3 THEN 0 ELSE fail_count + 1 END
        WHERE id = ?1
        RETURNING fail_count
        "#,
    )
    .bind(lease.task_id)
    .bind(outcome.last_status())
    .bind(outcome.is_success())
    .fetch_one(&mut *conn)
    .await?;

    Ok(ReleaseReport {
        released: true,
        fail_count,
    })
}

async fn reclaim_in_transaction(
    conn: &mut SqliteConnection,
    now: DateTime<Utc>,
    cutoff: DateTime<Utc>,
    ttl_seconds: u64,
) -> SchedulerResult<Vec<ReclaimedLease>> {
    let rows = sqlx::query(&format!(
        "SELECT {LEASE_COLUMNS} FROM scheduled_task_leases WHERE heartbeat_at < ?1 ORDER BY id"
    ))
    .bind(cutoff)
    .fetch_all(&mut *conn)
    .await?;

    let mut reclaimed = Vec::with_capacity(rows.len());
    for row in rows {
        let lease = SqliteScheduleStore::row_to_lease(&row)?;

        sqlx::query("DELETE FROM scheduled_task_leases WHERE id = ?1")
            .bind(lease.id)
            .execute(&mut *conn)
            .await?;

        sqlx::query(
            r#"
            UPDATE scheduled_task_logs
            SET status = 'failed', finished_at = ?2, error_message = ?3
            WHERE id = ?1
            "#,
        )
        .bind(lease.log_id)
        .bind(now)
        .bind(lease_expired_message(&lease.worker_id, lease.locked_at, ttl_seconds))
        .execute(&mut *conn)
        .await?;

        sqlx::query(REFRESH_LOCK_SQL)
            .bind(lease.task_id)
            .execute(&mut *conn)
            .await?;

        let task_type: String = sqlx::query_scalar(
            r#"
            UPDATE scheduled_tasks
            SET fail_count = fail_count + 1, last_status = 'failed'
            WHERE id = ?1
            RETURNING task_type
            "#,
        )
        .bind(lease.task_id)
        .fetch_optional(&mut *conn)
        .await?
        .unwrap_or_default();

        info!("回收过期租约 {} (任务 {}, Worker {})", lease.id, task_type, lease.worker_id);
        reclaimed.push(ReclaimedLease { lease, task_type });
    }

    Ok(reclaimed)
}

#[async_trait]
impl ScheduleStore for SqliteScheduleStore {
    #[instrument(skip(self))]
    async fn list_active(&self) -> SchedulerResult<Vec<TaskDefinition>> {
        let rows = sqlx::query(&format!(
            "SELECT {DEFINITION_COLUMNS} FROM scheduled_tasks WHERE status = 'active' ORDER BY id"
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_definition).collect()
    }

    #[instrument(skip(self), fields(task_id = %task_id))]
    async fn advance_schedule(
        &self,
        task_id: i64,
        next_run_at: DateTime<Utc>,
    ) -> SchedulerResult<()> {
        let result = sqlx::query("UPDATE scheduled_tasks SET next_run_at = ?1 WHERE id = ?2")
            .bind(next_run_at)
            .bind(task_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(SchedulerError::TaskIdNotFound { id: task_id });
        }
        Ok(())
    }

    #[instrument(skip(self), fields(worker_id = %worker_id))]
    async fn claim_due_task(
        &self,
        worker_id: &str,
        lease_ttl: Duration,
    ) -> SchedulerResult<Option<ClaimedTask>> {
        let now = self.clock.now();
        let cutoff = lease_cutoff(now, lease_ttl);
        let worker_id = worker_id.to_string();

        let claimed = self
            .with_immediate_transaction(move |conn| {
                Box::pin(async move { claim_in_transaction(conn, &worker_id, now, cutoff).await })
            })
            .await?;

        if let Some(claimed) = &claimed {
            debug!(
                "认领任务 {} (租约 {})",
                claimed.definition.task_type, claimed.lease.id
            );
        }
        Ok(claimed)
    }

    async fn heartbeat(&self, lease: &TaskLease) -> SchedulerResult<bool> {
        let result = sqlx::query("UPDATE scheduled_task_leases SET heartbeat_at = ?1 WHERE id = ?2")
            .bind(self.clock.now())
            .bind(lease.id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self, lease, outcome), fields(lease_id = %lease.id, task_id = %lease.task_id))]
    async fn release_task(
        &self,
        lease: &TaskLease,
        outcome: &ExecutionOutcome,
    ) -> SchedulerResult<ReleaseReport> {
        let now = self.clock.now();
        let lease = lease.clone();
        let outcome = outcome.clone();

        let report = self
            .with_immediate_transaction(move |conn| {
                Box::pin(async move { release_in_transaction(conn, &lease, &outcome, now).await })
            })
            .await?;

        if !report.released {
            warn!("租约已被回收，忽略本次释放");
        }
        Ok(report)
    }

    #[instrument(skip(self))]
    async fn reclaim_stale_leases(
        &self,
        lease_ttl: Duration,
    ) -> SchedulerResult<Vec<ReclaimedLease>> {
        let now = self.clock.now();
        let cutoff = lease_cutoff(now, lease_ttl);
        let ttl_seconds = lease_ttl.as_secs();

        self.with_immediate_transaction(move |conn| {
            Box::pin(async move { reclaim_in_transaction(conn, now, cutoff, ttl_seconds).await })
        })
        .await
    }

    #[instrument(skip(self), fields(task_id = %task_id))]
    async fn suspend(&self, task_id: i64, reason: &str) -> SchedulerResult<()> {
        let result = sqlx::query(
            "UPDATE scheduled_tasks SET status = 'paused', last_status = 'failed' WHERE id = ?1",
        )
        .bind(task_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(SchedulerError::TaskIdNotFound { id: task_id });
        }
        warn!("任务 {} 已挂起: {}", task_id, reason);
        Ok(())
    }
}

#[async_trait]
impl ScheduleAdmin for SqliteScheduleStore {
    #[instrument(skip(self, definition), fields(task_type = %definition.task_type))]
    async fn upsert_definition(
        &self,
        definition: &NewTaskDefinition,
    ) -> SchedulerResult<TaskDefinition> {
        definition.validate()?;

        let row = sqlx::query(&format!(
            r#"
            INSERT INTO scheduled_tasks (task_type, schedule_pattern, status, max_concurrent_runs, execution_order)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT (task_type) DO UPDATE SET
                schedule_pattern = excluded.schedule_pattern,
                status = excluded.status,
                max_concurrent_runs = excluded.max_concurrent_runs,
                execution_order = excluded.execution_order,
                next_run_at = NULL
            RETURNING {DEFINITION_COLUMNS}
            "#
        ))
        .bind(&definition.task_type)
        .bind(&definition.schedule_pattern)
        .bind(definition.status)
        .bind(definition.max_concurrent_runs)
        .bind(definition.execution_order)
        .fetch_one(&self.pool)
        .await?;

        Self::row_to_definition(&row)
    }

    async fn list_definitions(&self) -> SchedulerResult<Vec<TaskDefinition>> {
        let rows = sqlx::query(&format!(
            "SELECT {DEFINITION_COLUMNS} FROM scheduled_tasks ORDER BY task_type"
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_definition).collect()
    }

    async fn get_definition(&self, task_type: &str) -> SchedulerResult<Option<TaskDefinition>> {
        let row = sqlx::query(&format!(
            "SELECT {DEFINITION_COLUMNS} FROM scheduled_tasks WHERE task_type = ?1"
        ))
        .bind(task_type)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_definition).transpose()
    }

    async fn set_status(&self, task_type: &str, status: TaskStatus) -> SchedulerResult<()> {
        let result = match status {
            TaskStatus::Active => {
                sqlx::query(
                    "UPDATE scheduled_tasks SET status = 'active', fail_count = 0, last_status = 'ready' WHERE task_type = ?1",
                )
                .bind(task_type)
                .execute(&self.pool)
                .await?
            }
            TaskStatus::Paused => {
                sqlx::query("UPDATE scheduled_tasks SET status = 'paused' WHERE task_type = ?1")
                    .bind(task_type)
                    .execute(&self.pool)
                    .await?
            }
        };

        if result.rows_affected() == 0 {
            return Err(SchedulerError::TaskNotFound {
                task_type: task_type.to_string(),
            });
        }
        Ok(())
    }

    async fn force_due(&self, task_type: &str) -> SchedulerResult<()> {
        let now = self.clock.now();
        let task_type = task_type.to_string();

        self.with_immediate_transaction(move |conn| {
            Box::pin(async move {
                let task_id = Self::task_id_by_type(conn, &task_type).await?;
                Self::drop_leases(conn, task_id, now, "运维强制运行，租约被清除").await?;
                sqlx::query(
                    "UPDATE scheduled_tasks SET next_run_at = ?1, last_status = 'ready' WHERE id = ?2",
                )
                .bind(now)
                .bind(task_id)
                .execute(&mut *conn)
                .await?;
                Ok(())
            })
        })
        .await
    }

    async fn unlock(&self, task_type: &str) -> SchedulerResult<u64> {
        let now = self.clock.now();
        let task_type = task_type.to_string();

        self.with_immediate_transaction(move |conn| {
            Box::pin(async move {
                let task_id = Self::task_id_by_type(conn, &task_type).await?;
                let dropped = Self::drop_leases(conn, task_id, now, "运维手动解锁").await?;
                sqlx::query("UPDATE scheduled_tasks SET last_status = 'ready' WHERE id = ?1")
                    .bind(task_id)
                    .execute(&mut *conn)
                    .await?;
                Ok(dropped)
            })
        })
        .await
    }

    async fn reset_failures(&self, task_type: Option<&str>) -> SchedulerResult<u64> {
        let result = match task_type {
            Some(task_type) => {
                let result = sqlx::query(
                    "UPDATE scheduled_tasks SET fail_count = 0, last_status = 'ready', status = 'active' WHERE task_type = ?1",
                )
                .bind(task_type)
                .execute(&self.pool)
                .await?;
                if result.rows_affected() == 0 {
                    return Err(SchedulerError::TaskNotFound {
                        task_type: task_type.to_string(),
                    });
                }
                result
            }
            None => {
                sqlx::query(
                    "UPDATE scheduled_tasks SET fail_count = 0, last_status = 'ready', status = 'active' WHERE fail_count > 0",
                )
                .execute(&self.pool)
                .await?
            }
        };
        Ok(result.rows_affected())
    }

    async fn set_max_concurrent_runs(&self, task_type: &str, max: i32) -> SchedulerResult<()> {
        if max < 1 {
            return Err(SchedulerError::Configuration(format!(
                "最大并发数必须大于等于1, 当前为 {max}"
            )));
        }

        let result =
            sqlx::query("UPDATE scheduled_tasks SET max_concurrent_runs = ?1 WHERE task_type = ?2")
                .bind(max)
                .bind(task_type)
                .execute(&self.pool)
                .await?;

        if result.rows_affected() == 0 {
            return Err(SchedulerError::TaskNotFound {
                task_type: task_type.to_string(),
            });
        }
        Ok(())
    }

    async fn recent_logs(
        &self,
        task_type: Option<&str>,
        limit: i64,
    ) -> SchedulerResult<Vec<ExecutionLogEntry>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {LOG_COLUMNS}
            FROM scheduled_task_logs l
            JOIN scheduled_tasks t ON t.id = l.task_id
            WHERE ?1 IS NULL OR t.task_type = ?1
            ORDER BY l.started_at DESC, l.id DESC
            LIMIT ?2
            "#
        ))
        .bind(task_type)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_log).collect()
    }

    async fn purge_logs(&self, older_than: DateTime<Utc>) -> SchedulerResult<u64> {
        let result = sqlx::query(
            "DELETE FROM scheduled_task_logs WHERE started_at < ?1 AND status <> 'running'",
        )
        .bind(older_than)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn stats(&self, lease_ttl: Duration) -> SchedulerResult<ScheduleStats> {
        let now = self.clock.now();
        let cutoff = lease_cutoff(now, lease_ttl);

        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) AS total_tasks,
                COALESCE(SUM(CASE WHEN status = 'active' THEN 1 ELSE 0 END), 0) AS active_tasks,
                COALESCE(SUM(CASE WHEN status = 'paused' THEN 1 ELSE 0 END), 0) AS paused_tasks,
                COALESCE(SUM(CASE WHEN status = 'active' AND next_run_at IS NOT NULL AND next_run_at <= ?1
                          AND (last_run_at IS NULL OR last_run_at < next_run_at) THEN 1 ELSE 0 END), 0) AS due_tasks,
                COALESCE(SUM(CASE WHEN fail_count > 0 THEN 1 ELSE 0 END), 0) AS failing_tasks,
                (SELECT COUNT(DISTINCT task_id) FROM scheduled_task_leases WHERE heartbeat_at >= ?2) AS locked_tasks,
                (SELECT COUNT(*) FROM scheduled_task_leases WHERE heartbeat_at >= ?2) AS held_leases
            FROM scheduled_tasks
            "#,
        )
        .bind(now)
        .bind(cutoff)
        .fetch_one(&self.pool)
        .await?;

        let upcoming = sqlx::query(&format!(
            r#"
            SELECT {DEFINITION_COLUMNS} FROM scheduled_tasks
            WHERE status = 'active' AND next_run_at IS NOT NULL
            ORDER BY next_run_at, id
            LIMIT 5
            "#
        ))
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(Self::row_to_definition)
        .collect::<SchedulerResult<Vec<_>>>()?;

        Ok(ScheduleStats {
            total_tasks: row.try_get("total_tasks")?,
            active_tasks: row.try_get("active_tasks")?,
            paused_tasks: row.try_get("paused_tasks")?,
            due_tasks: row.try_get("due_tasks")?,
            locked_tasks: row.try_get("locked_tasks")?,
            held_leases: row.try_get("held_leases")?,
            failing_tasks: row.try_get("failing_tasks")?,
            upcoming,
        })
    }

    async fn record_test_run(
        &self,
        task_type: &str,
        worker_id: &str,
        outcome: &ExecutionOutcome,
    ) -> SchedulerResult<()> {
        let now = self.clock.now();
        let started_at =
            now - chrono::Duration::from_std(outcome.duration).unwrap_or(chrono::Duration::zero());
        let task_type = task_type.to_string();
        let worker_id = worker_id.to_string();
        let outcome = outcome.clone();

        self.with_immediate_transaction(move |conn| {
            Box::pin(async move {
                let task_id = Self::task_id_by_type(conn, &task_type).await?;
                sqlx::query(
                    r#"
                    INSERT INTO scheduled_task_logs
                        (task_id, status, started_at, finished_at, execution_time_seconds, result, error_message, locked_by)
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                    "#,
                )
                .bind(task_id)
                .bind(outcome.log_status())
                .bind(started_at)
                .bind(now)
                .bind(outcome.execution_time_seconds())
                .bind(outcome.result.as_deref())
                .bind(outcome.error_message.as_deref())
                .bind(&worker_id)
                .execute(&mut *conn)
                .await?;

                sqlx::query("UPDATE scheduled_tasks SET last_status = ?1 WHERE id = ?2")
                    .bind(LastStatus::Test)
                    .bind(task_id)
                    .execute(&mut *conn)
                    .await?;
                Ok(())
            })
        })
        .await
    }
}
