use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use cronpool_core::{
    Clock, ExecutionOutcome, ManualClock, NewTaskDefinition, ScheduleAdmin, ScheduleStore,
    SchedulerConfig, TaskStatus,
};
use cronpool_dispatcher::{TaskScheduler, TickReport};
use cronpool_infrastructure::InMemoryScheduleStore;

const LEASE_TTL: Duration = Duration::from_secs(1800);

fn at(h: u32, m: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, h, m, 0).unwrap()
}

fn setup(start: DateTime<Utc>) -> (Arc<InMemoryScheduleStore>, ManualClock, TaskScheduler) {
    let clock = ManualClock::new(start);
    let store = Arc::new(InMemoryScheduleStore::with_clock(Arc::new(clock.clone())));
    let scheduler = TaskScheduler::new(store.clone(), SchedulerConfig::default())
        .with_clock(Arc::new(clock.clone()))
        .with_admin(store.clone())
        .with_lease_ttl(LEASE_TTL);
    (store, clock, scheduler)
}

#[tokio::test]
async fn test_scraping_scenario_second_worker_gets_nothing() {
    let (store, clock, scheduler) = setup(at(23, 55));
    store
        .upsert_definition(&NewTaskDefinition::new("scraping", "*/10 * * * *"))
        .await
        .unwrap();

    // 首次扫描把下次运行时间设为 00:00
    scheduler.tick().await.unwrap();
    let def = store.get_definition("scraping").await.unwrap().unwrap();
    let midnight = Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap();
    assert_eq!(def.next_run_at, Some(midnight));

    clock.set(midnight);
    let claimed = store
        .claim_due_task("worker-1", LEASE_TTL)
        .await
        .unwrap()
        .expect("worker-1 claims the 00:00 occurrence");

    let report = scheduler.tick().await.unwrap();
    assert_eq!(report.advanced, 1);
    let def = store.get_definition("scraping").await.unwrap().unwrap();
    assert_eq!(def.next_run_at, Some(midnight + chrono::Duration::minutes(10)));

    clock.set(midnight + chrono::Duration::minutes(5));
    assert!(store
        .claim_due_task("worker-2", LEASE_TTL)
        .await
        .unwrap()
        .is_none());

    store
        .release_task(
            &claimed.lease,
            &ExecutionOutcome::completed("ok", Duration::from_secs(30)),
        )
        .await
        .unwrap();

    clock.set(midnight + chrono::Duration::minutes(10));
    assert!(store
        .claim_due_task("worker-2", LEASE_TTL)
        .await
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn test_tick_is_idempotent() {
    let (store, _clock, scheduler) = setup(at(0, 3));
    store
        .upsert_definition(&NewTaskDefinition::new("reports", "0 * * * *"))
        .await
        .unwrap();

    let first = scheduler.tick().await.unwrap();
    assert_eq!(
        first,
        TickReport {
            examined: 1,
            advanced: 1,
            suspended: 0
        }
    );

    let second = scheduler.tick().await.unwrap();
    assert_eq!(second.advanced, 0);
    let def = store.get_definition("reports").await.unwrap().unwrap();
    assert_eq!(def.next_run_at, Some(at(1, 0)));
}

#[tokio::test]
async fn test_missed_runs_coalesce_into_one_catch_up() {
    let (store, clock, scheduler) = setup(at(0, 0));
    let def = store
        .upsert_definition(&NewTaskDefinition::new("clustering", "*/10 * * * *"))
        .await
        .unwrap();
    store.advance_schedule(def.id, at(0, 0)).await.unwrap();
    store.claim_due_task("w1", LEASE_TTL).await.unwrap().unwrap();

    // 调度器停机近一小时
    clock.set(at(0, 57));
    scheduler.tick().await.unwrap();

    let def = store.get_definition("clustering").await.unwrap().unwrap();
    assert_eq!(def.next_run_at, Some(at(0, 50)));
    assert!(def.is_due(clock.now()));
}

#[tokio::test]
async fn test_malformed_cron_suspends_task() {
    let (store, _clock, scheduler) = setup(at(0, 0));
    store
        .upsert_definition(&NewTaskDefinition::new("broken", "not a cron"))
        .await
        .unwrap();
    store
        .upsert_definition(&NewTaskDefinition::new("healthy", "*/5 * * * *"))
        .await
        .unwrap();

    let report = scheduler.tick().await.unwrap();
    assert_eq!(report.examined, 2);
    assert_eq!(report.advanced, 1);
    assert_eq!(report.suspended, 1);

    let broken = store.get_definition("broken").await.unwrap().unwrap();
    assert_eq!(broken.status, TaskStatus::Paused);

    // 挂起后不再出现在后续扫描中
    let report = scheduler.tick().await.unwrap();
    assert_eq!(report.examined, 1);
    assert_eq!(report.suspended, 0);
}

#[tokio::test]
async fn test_log_stats_reports_upcoming() {
    let (store, _clock, scheduler) = setup(at(0, 0));
    store
        .upsert_definition(&NewTaskDefinition::new("video", "30 * * * *"))
        .await
        .unwrap();
    scheduler.tick().await.unwrap();

    let stats = scheduler.log_stats().await.unwrap().unwrap();
    assert_eq!(stats.total_tasks, 1);
    assert_eq!(stats.upcoming.len(), 1);
    assert_eq!(stats.upcoming[0].next_run_at, Some(at(0, 30)));

    let without_admin = TaskScheduler::new(store.clone(), SchedulerConfig::default());
    assert!(without_admin.log_stats().await.unwrap().is_none());
}

#[tokio::test]
async fn test_run_stops_on_shutdown() {
    let (store, _clock, scheduler) = setup(at(0, 0));
    store
        .upsert_definition(&NewTaskDefinition::new("audio", "*/5 * * * *"))
        .await
        .unwrap();

    let (tx, rx) = tokio::sync::broadcast::channel(1);
    let handle = tokio::spawn(async move { scheduler.run(rx).await });

    tokio::time::sleep(Duration::from_millis(50)).await;
    tx.send(()).unwrap();
    handle.await.unwrap().unwrap();

    let def = store.get_definition("audio").await.unwrap().unwrap();
    assert!(def.next_run_at.is_some());
}
