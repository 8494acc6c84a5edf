//! 各存储后端共用的行为场景, 每个后端的测试文件用自己的存储实例调用这些函数

#![allow(dead_code)]

use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use cronpool_core::{
    Clock, ExecutionOutcome, LastStatus, LogStatus, ManualClock, NewTaskDefinition, TaskStatus,
};
use cronpool_infrastructure::StoreHandles;

pub const LEASE_TTL: Duration = Duration::from_secs(1800);

pub fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap()
}

pub fn minutes(n: i64) -> chrono::Duration {
    chrono::Duration::minutes(n)
}

/// 创建任务并把下次运行时间设为 `due_at`
pub async fn create_due_task(
    handles: &StoreHandles,
    definition: NewTaskDefinition,
    due_at: DateTime<Utc>,
) -> i64 {
    let created = handles.admin.upsert_definition(&definition).await.unwrap();
    handles
        .store
        .advance_schedule(created.id, due_at)
        .await
        .unwrap();
    created.id
}

pub async fn claim_follows_execution_order(handles: StoreHandles, clock: ManualClock) {
    let now = clock.now();
    create_due_task(&handles, NewTaskDefinition::new("unordered", "*/5 * * * *"), now - minutes(30)).await;
    create_due_task(
        &handles,
        NewTaskDefinition::new("second", "*/5 * * * *").execution_order(2),
        now - minutes(1),
    )
    .await;
    create_due_task(
        &handles,
        NewTaskDefinition::new("first", "*/5 * * * *").execution_order(1),
        now - minutes(1),
    )
    .await;
    handles
        .admin
        .upsert_definition(&NewTaskDefinition::new("later", "*/5 * * * *"))
        .await
        .unwrap();

    let mut claimed = Vec::new();
    while let Some(task) = handles.store.claim_due_task("w1", LEASE_TTL).await.unwrap() {
        claimed.push(task.definition.task_type.clone());
    }

    // 未设置下次运行时间的任务不会被认领
    assert_eq!(claimed, vec!["first", "second", "unordered"]);
}

pub async fn claim_marks_definition_and_opens_log(handles: StoreHandles, clock: ManualClock) {
    let now = clock.now();
    let id = create_due_task(&handles, NewTaskDefinition::new("reports", "0 * * * *"), now).await;

    let claimed = handles
        .store
        .claim_due_task("worker-a", LEASE_TTL)
        .await
        .unwrap()
        .expect("task should be claimable");

    assert_eq!(claimed.lease.task_id, id);
    assert_eq!(claimed.lease.worker_id, "worker-a");
    assert_eq!(claimed.definition.last_status, LastStatus::Running);
    assert_eq!(claimed.definition.last_run_at, Some(now));
    assert_eq!(claimed.definition.locked_by.as_deref(), Some("worker-a"));

    let logs = handles.admin.recent_logs(Some("reports"), 10).await.unwrap();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].id, claimed.lease.log_id);
    assert_eq!(logs[0].status, LogStatus::Running);
    assert_eq!(logs[0].locked_by.as_deref(), Some("worker-a"));

    // 同一次触发不能被认领两次
    assert!(handles
        .store
        .claim_due_task("worker-b", LEASE_TTL)
        .await
        .unwrap()
        .is_none());
}

pub async fn concurrency_ceiling_is_respected(handles: StoreHandles, clock: ManualClock) {
    let start = clock.now();
    let id = create_due_task(&handles, NewTaskDefinition::new("scraping", "*/5 * * * *"), start).await;

    let first = handles
        .store
        .claim_due_task("w1", LEASE_TTL)
        .await
        .unwrap()
        .unwrap();

    // 下一次触发已到期, 但唯一的并发槽仍被占用
    clock.advance(minutes(5));
    handles
        .store
        .advance_schedule(id, start + minutes(5))
        .await
        .unwrap();
    assert!(handles
        .store
        .claim_due_task("w2", LEASE_TTL)
        .await
        .unwrap()
        .is_none());

    handles
        .admin
        .set_max_concurrent_runs("scraping", 2)
        .await
        .unwrap();
    let second = handles
        .store
        .claim_due_task("w2", LEASE_TTL)
        .await
        .unwrap()
        .unwrap();
    assert_ne!(first.lease.id, second.lease.id);

    let stats = handles.admin.stats(LEASE_TTL).await.unwrap();
    assert_eq!(stats.locked_tasks, 1);
    assert_eq!(stats.held_leases, 2);

    let report = handles
        .store
        .release_task(&second.lease, &ExecutionOutcome::completed("ok", Duration::from_secs(1)))
        .await
        .unwrap();
    assert!(report.released);

    let definition = handles.admin.get_definition("scraping").await.unwrap().unwrap();
    assert_eq!(definition.locked_by.as_deref(), Some("w1"));
    assert_eq!(definition.locked_at, Some(first.lease.locked_at));

    assert!(handles
        .admin
        .set_max_concurrent_runs("scraping", 0)
        .await
        .is_err());
}

pub async fn release_tracks_failures(handles: StoreHandles, clock: ManualClock) {
    let id = create_due_task(&handles, NewTaskDefinition::new("images", "0 * * * *"), clock.now()).await;

    let claimed = handles
        .store
        .claim_due_task("w1", LEASE_TTL)
        .await
        .unwrap()
        .unwrap();
    let report = handles
        .store
        .release_task(
            &claimed.lease,
            &ExecutionOutcome::failed("upstream 502", Duration::from_secs(3)),
        )
        .await
        .unwrap();
    assert!(report.released);
    assert_eq!(report.fail_count, 1);

    let definition = handles.admin.get_definition("images").await.unwrap().unwrap();
    assert_eq!(definition.last_status, LastStatus::Failed);
    assert!(definition.locked_by.is_none());

    let logs = handles.admin.recent_logs(Some("images"), 10).await.unwrap();
    assert_eq!(logs[0].status, LogStatus::Failed);
    assert_eq!(logs[0].error_message.as_deref(), Some("upstream 502"));
    assert!(logs[0].finished_at.is_some());

    // 重复释放同一租约不产生任何效果
    let again = handles
        .store
        .release_task(&claimed.lease, &ExecutionOutcome::completed("ok", Duration::ZERO))
        .await
        .unwrap();
    assert!(!again.released);
    assert_eq!(again.fail_count, 1);

    clock.advance(minutes(10));
    handles
        .store
        .advance_schedule(id, clock.now())
        .await
        .unwrap();
    let claimed = handles
        .store
        .claim_due_task("w1", LEASE_TTL)
        .await
        .unwrap()
        .unwrap();
    let report = handles
        .store
        .release_task(
            &claimed.lease,
            &ExecutionOutcome::completed(r#"{"processed":3}"#, Duration::from_secs(2)),
        )
        .await
        .unwrap();
    assert_eq!(report.fail_count, 0);

    let definition = handles.admin.get_definition("images").await.unwrap().unwrap();
    assert_eq!(definition.last_status, LastStatus::Completed);
}

pub async fn stale_leases_are_reclaimed_once(handles: StoreHandles, clock: ManualClock) {
    create_due_task(&handles, NewTaskDefinition::new("video", "0 * * * *"), clock.now()).await;
    let claimed = handles
        .store
        .claim_due_task("crashed-worker", LEASE_TTL)
        .await
        .unwrap()
        .unwrap();

    clock.advance(minutes(20));
    assert!(handles.store.heartbeat(&claimed.lease).await.unwrap());
    clock.advance(minutes(20));
    assert!(handles
        .store
        .reclaim_stale_leases(LEASE_TTL)
        .await
        .unwrap()
        .is_empty());

    clock.advance(minutes(31));
    let reclaimed = handles.store.reclaim_stale_leases(LEASE_TTL).await.unwrap();
    assert_eq!(reclaimed.len(), 1);
    assert_eq!(reclaimed[0].task_type, "video");
    assert_eq!(reclaimed[0].lease.id, claimed.lease.id);

    assert!(handles
        .store
        .reclaim_stale_leases(LEASE_TTL)
        .await
        .unwrap()
        .is_empty());
    assert!(!handles.store.heartbeat(&claimed.lease).await.unwrap());

    let logs = handles.admin.recent_logs(Some("video"), 10).await.unwrap();
    let failed: Vec<_> = logs.iter().filter(|l| l.status == LogStatus::Failed).collect();
    assert_eq!(failed.len(), 1);
    assert!(failed[0]
        .error_message
        .as_deref()
        .unwrap_or_default()
        .starts_with("lease expired"));

    let definition = handles.admin.get_definition("video").await.unwrap().unwrap();
    assert_eq!(definition.fail_count, 1);
    assert_eq!(definition.last_status, LastStatus::Failed);
    assert!(definition.locked_by.is_none());

    // 迟到的释放被忽略
    let report = handles
        .store
        .release_task(&claimed.lease, &ExecutionOutcome::completed("late", Duration::ZERO))
        .await
        .unwrap();
    assert!(!report.released);
}

pub async fn suspend_and_resume(handles: StoreHandles, clock: ManualClock) {
    let id = create_due_task(&handles, NewTaskDefinition::new("audio", "0 * * * *"), clock.now()).await;
    let claimed = handles
        .store
        .claim_due_task("w1", LEASE_TTL)
        .await
        .unwrap()
        .unwrap();
    handles
        .store
        .release_task(&claimed.lease, &ExecutionOutcome::configuration_error("未注册的任务类型"))
        .await
        .unwrap();
    handles.store.suspend(id, "未注册的任务类型").await.unwrap();

    assert!(handles.store.list_active().await.unwrap().is_empty());
    let definition = handles.admin.get_definition("audio").await.unwrap().unwrap();
    assert_eq!(definition.status, TaskStatus::Paused);
    let next_run_at = definition.next_run_at;

    handles
        .admin
        .set_status("audio", TaskStatus::Active)
        .await
        .unwrap();
    let definition = handles.admin.get_definition("audio").await.unwrap().unwrap();
    assert_eq!(definition.status, TaskStatus::Active);
    assert_eq!(definition.fail_count, 0);
    assert_eq!(definition.last_status, LastStatus::Ready);
    assert_eq!(definition.next_run_at, next_run_at);

    assert!(handles.store.suspend(9_999, "missing").await.is_err());
    assert!(handles
        .admin
        .set_status("missing", TaskStatus::Paused)
        .await
        .is_err());
}

pub async fn admin_overrides(handles: StoreHandles, clock: ManualClock) {
    let start = clock.now();
    create_due_task(&handles, NewTaskDefinition::new("publishing", "0 * * * *"), start).await;
    handles
        .store
        .claim_due_task("w1", LEASE_TTL)
        .await
        .unwrap()
        .unwrap();

    clock.advance(minutes(1));
    handles.admin.force_due("publishing").await.unwrap();
    let definition = handles.admin.get_definition("publishing").await.unwrap().unwrap();
    assert_eq!(definition.next_run_at, Some(clock.now()));
    assert_eq!(definition.last_status, LastStatus::Ready);
    assert!(definition.locked_by.is_none());

    let forced = handles
        .store
        .claim_due_task("w2", LEASE_TTL)
        .await
        .unwrap()
        .expect("forced task should be claimable");
    assert_eq!(forced.definition.task_type, "publishing");

    assert_eq!(handles.admin.unlock("publishing").await.unwrap(), 1);
    assert_eq!(handles.admin.unlock("publishing").await.unwrap(), 0);
    assert!(handles.admin.unlock("missing").await.is_err());

    let logs = handles.admin.recent_logs(Some("publishing"), 10).await.unwrap();
    assert_eq!(logs.len(), 2);
    assert!(logs.iter().all(|l| l.status == LogStatus::Failed));

    // upsert 保留运行时状态, 只清空下次运行时间
    let updated = handles
        .admin
        .upsert_definition(&NewTaskDefinition::new("publishing", "30 * * * *").max_concurrent_runs(3))
        .await
        .unwrap();
    assert_eq!(updated.schedule_pattern, "30 * * * *");
    assert_eq!(updated.max_concurrent_runs, 3);
    assert!(updated.next_run_at.is_none());
    assert_eq!(updated.last_run_at, Some(clock.now()));
    assert_eq!(handles.admin.list_definitions().await.unwrap().len(), 1);
}

pub async fn reset_failures_scopes(handles: StoreHandles, clock: ManualClock) {
    for task_type in ["broadcast", "clustering"] {
        create_due_task(&handles, NewTaskDefinition::new(task_type, "0 * * * *"), clock.now()).await;
        let claimed = handles
            .store
            .claim_due_task("w1", LEASE_TTL)
            .await
            .unwrap()
            .unwrap();
        handles
            .store
            .release_task(&claimed.lease, &ExecutionOutcome::failed("boom", Duration::ZERO))
            .await
            .unwrap();
    }
    handles
        .admin
        .upsert_definition(&NewTaskDefinition::new("healthy", "0 * * * *"))
        .await
        .unwrap();

    assert_eq!(handles.admin.reset_failures(Some("broadcast")).await.unwrap(), 1);
    assert_eq!(handles.admin.stats(LEASE_TTL).await.unwrap().failing_tasks, 1);
    assert_eq!(handles.admin.reset_failures(None).await.unwrap(), 1);
    assert_eq!(handles.admin.reset_failures(None).await.unwrap(), 0);
    assert!(handles.admin.reset_failures(Some("missing")).await.is_err());
}

pub async fn logs_are_purged_and_test_runs_recorded(handles: StoreHandles, clock: ManualClock) {
    create_due_task(&handles, NewTaskDefinition::new("social_media", "0 * * * *"), clock.now()).await;
    let claimed = handles
        .store
        .claim_due_task("w1", LEASE_TTL)
        .await
        .unwrap()
        .unwrap();
    handles
        .store
        .release_task(&claimed.lease, &ExecutionOutcome::completed("ok", Duration::ZERO))
        .await
        .unwrap();

    clock.advance(chrono::Duration::days(40));
    handles
        .admin
        .record_test_run(
            "social_media",
            "cli",
            &ExecutionOutcome::completed("manual", Duration::from_secs(2)),
        )
        .await
        .unwrap();

    let definition = handles.admin.get_definition("social_media").await.unwrap().unwrap();
    assert_eq!(definition.last_status, LastStatus::Test);

    let purged = handles
        .admin
        .purge_logs(clock.now() - chrono::Duration::days(30))
        .await
        .unwrap();
    assert_eq!(purged, 1);

    let logs = handles.admin.recent_logs(None, 10).await.unwrap();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].result.as_deref(), Some("manual"));
    assert_eq!(logs[0].locked_by.as_deref(), Some("cli"));

    assert!(handles
        .admin
        .record_test_run("missing", "cli", &ExecutionOutcome::completed("x", Duration::ZERO))
        .await
        .is_err());
}

pub async fn stats_report_upcoming(handles: StoreHandles, clock: ManualClock) {
    let now = clock.now();
    for (i, task_type) in ["a", "b", "c", "d", "e", "f"].iter().enumerate() {
        create_due_task(
            &handles,
            NewTaskDefinition::new(*task_type, "0 * * * *"),
            now + minutes(i as i64 - 1),
        )
        .await;
    }
    handles
        .admin
        .upsert_definition(&NewTaskDefinition::new("paused", "0 * * * *").paused())
        .await
        .unwrap();

    let stats = handles.admin.stats(LEASE_TTL).await.unwrap();
    assert_eq!(stats.total_tasks, 7);
    assert_eq!(stats.active_tasks, 6);
    assert_eq!(stats.paused_tasks, 1);
    assert_eq!(stats.due_tasks, 2);
    assert_eq!(stats.locked_tasks, 0);
    assert_eq!(stats.upcoming.len(), 5);
    assert_eq!(stats.upcoming[0].task_type, "a");
}

/// 依次运行全部场景, 每个场景使用独立的存储
pub async fn run_all<F, Fut>(mut fresh: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = (StoreHandles, ManualClock)>,
{
    let (h, c) = fresh().await;
    claim_follows_execution_order(h, c).await;
    let (h, c) = fresh().await;
    claim_marks_definition_and_opens_log(h, c).await;
    let (h, c) = fresh().await;
    concurrency_ceiling_is_respected(h, c).await;
    let (h, c) = fresh().await;
    release_tracks_failures(h, c).await;
    let (h, c) = fresh().await;
    stale_leases_are_reclaimed_once(h, c).await;
    let (h, c) = fresh().await;
    suspend_and_resume(h, c).await;
    let (h, c) = fresh().await;
    admin_overrides(h, c).await;
    let (h, c) = fresh().await;
    reset_failures_scopes(h, c).await;
    let (h, c) = fresh().await;
    logs_are_purged_and_test_runs_recorded(h, c).await;
    let (h, c) = fresh().await;
    stats_report_upcoming(h, c).await;
}
