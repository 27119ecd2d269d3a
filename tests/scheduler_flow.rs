//! End-to-end scheduling behavior against a mock driver and scripted
//! crawlers: dispatch ordering, per-site head-of-line isolation, the timeout
//! watchdog, token-bucket deferral and the login-required recovery path.

use std::sync::Arc;
use std::time::Duration;

use tokio_test::assert_ok;

use bookdelta::application::{CrawlService, PoolConfig, RateConfig, SchedulerConfig, SessionPool};
use bookdelta::domain::clock::Clock;
use bookdelta::domain::collaborators::{CrawlError, CrawlerRegistry, SiteCrawler};
use bookdelta::domain::constants::sites;
use bookdelta::domain::events::PoolEvent;
use bookdelta::domain::repositories::TaskStore;
use bookdelta::domain::task::{TaskId, TaskKind, TaskStatus};
use bookdelta::test_support::{FakeClock, HangingCrawler, MockDriver, ScriptedCrawler, memory_task_store};

struct Harness {
    service: CrawlService,
    pool: SessionPool,
    store: Arc<dyn TaskStore>,
    clock: Arc<FakeClock>,
}

async fn start_engine(
    pool_size: usize,
    task_timeout_secs: u64,
    crawlers: Vec<(&str, Arc<dyn SiteCrawler>)>,
) -> Harness {
    let clock = Arc::new(FakeClock::default());
    let driver = Arc::new(MockDriver::new());
    let pool = SessionPool::new(
        driver,
        clock.clone(),
        PoolConfig {
            size: pool_size,
            ..PoolConfig::default()
        },
        RateConfig::default(),
    );
    pool.warm_up().await;

    let store: Arc<dyn TaskStore> = Arc::new(memory_task_store(clock.clone()).await);
    let mut registry = CrawlerRegistry::new();
    for (site, crawler) in crawlers {
        registry.register(site, crawler);
    }

    let service = CrawlService::start(
        pool.clone(),
        Arc::clone(&store),
        Arc::new(registry),
        SchedulerConfig {
            tick_ms: 20,
            task_timeout_secs,
        },
        clock.clone(),
    );

    Harness {
        service,
        pool,
        store,
        clock,
    }
}

async fn wait_for_status(store: &Arc<dyn TaskStore>, id: &TaskId, expected: TaskStatus) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let task = store.fetch_by_id(id).await.unwrap().unwrap();
        if task.status == expected {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!(
                "task {id} never reached {expected}, still {} ({:?})",
                task.status, task.error_message
            );
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

fn isbn_of(kind: &TaskKind) -> String {
    match kind {
        TaskKind::SalesHistory { isbn, .. } | TaskKind::PriceLookup { isbn } => isbn.clone(),
        TaskKind::ShopListing { shop_id, .. } => shop_id.clone(),
    }
}

#[tokio::test]
async fn test_priority_then_fifo_dispatch_order() {
    let crawler = Arc::new(ScriptedCrawler::ok());
    let harness = start_engine(1, 300, vec![(sites::KONGFUZI, crawler.clone())]).await;

    // Priorities [1, 5, 1] submitted in that order: the high-priority task
    // runs first, the equal-priority pair keeps insertion order.
    let first = harness.service.submit_sales_history("isbn-1", 30, 1).await.unwrap();
    let second = harness.service.submit_sales_history("isbn-2", 30, 5).await.unwrap();
    let third = harness.service.submit_sales_history("isbn-3", 30, 1).await.unwrap();

    for id in [&first, &second, &third] {
        wait_for_status(&harness.store, id, TaskStatus::Completed).await;
    }

    let order: Vec<String> = crawler.executed().iter().map(isbn_of).collect();
    assert_eq!(order, vec!["isbn-2", "isbn-1", "isbn-3"]);
    harness.service.shutdown().await;
}

#[tokio::test]
async fn test_blocked_site_does_not_hold_back_other_sites() {
    let kongfuzi = Arc::new(ScriptedCrawler::ok());
    let duozhuayu = Arc::new(ScriptedCrawler::ok());
    let harness = start_engine(
        1,
        300,
        vec![
            (sites::KONGFUZI, kongfuzi.clone()),
            (sites::DUOZHUAYU, duozhuayu.clone()),
        ],
    )
    .await;

    // Penalize the only session for kongfuzi before submitting anything.
    let session_id = harness.pool.session_ids().remove(0);
    harness
        .pool
        .record_rate_limited(&session_id, sites::KONGFUZI, "throttled");

    let blocked = harness.service.submit_sales_history("isbn-a", 30, 9).await.unwrap();
    let unrelated = harness.service.submit_price_lookup("isbn-b", 1).await.unwrap();

    // The lower-priority task for the available site completes while the
    // higher-priority one is still pending behind the penalty.
    wait_for_status(&harness.store, &unrelated, TaskStatus::Completed).await;
    let blocked_task = harness.store.fetch_by_id(&blocked).await.unwrap().unwrap();
    assert_eq!(blocked_task.status, TaskStatus::Pending);
    assert!(kongfuzi.executed().is_empty());
    harness.service.shutdown().await;
}

#[tokio::test]
async fn test_watchdog_force_fails_hung_task_and_frees_session() {
    let harness = start_engine(
        1,
        1,
        vec![(sites::KONGFUZI, Arc::new(HangingCrawler) as Arc<dyn SiteCrawler>)],
    )
    .await;

    let task_id = harness.service.submit_sales_history("isbn-hung", 30, 5).await.unwrap();
    wait_for_status(&harness.store, &task_id, TaskStatus::Failed).await;

    let task = harness.store.fetch_by_id(&task_id).await.unwrap().unwrap();
    assert!(task.error_message.unwrap().contains("timed out"));

    // The session came back to the idle set even though the job never
    // returned.
    let status = harness.pool.status();
    assert_eq!(status.size_busy, 0);
    assert_eq!(status.size_idle, 1);
    assert_eq!(harness.service.stats().timed_out, 1);
    harness.service.shutdown().await;
}

#[tokio::test]
async fn test_token_bucket_defers_eleventh_call() {
    let crawler = Arc::new(ScriptedCrawler::ok());
    let harness = start_engine(1, 300, vec![(sites::KONGFUZI, crawler.clone())]).await;

    let mut ids = Vec::new();
    for n in 0..11 {
        ids.push(
            harness
                .service
                .submit_sales_history(&format!("isbn-{n}"), 30, 5)
                .await
                .unwrap(),
        );
    }

    // The bucket admits exactly its capacity (10 per window); the 11th call
    // is deferred, not executed and not errored.
    for id in &ids[..10] {
        wait_for_status(&harness.store, id, TaskStatus::Completed).await;
    }
    tokio::time::sleep(Duration::from_millis(200)).await;
    let eleventh = harness.store.fetch_by_id(&ids[10]).await.unwrap().unwrap();
    assert_eq!(eleventh.status, TaskStatus::Pending);
    assert_eq!(crawler.executed().len(), 10);
    harness.service.shutdown().await;
}

#[tokio::test]
async fn test_login_required_surfaces_and_recovers_via_clearance() {
    let crawler = Arc::new(ScriptedCrawler::with_script(vec![Err(
        CrawlError::LoginRequired("LOGIN_REQUIRED: session expired".to_string()),
    )]));
    let harness = start_engine(1, 300, vec![(sites::KONGFUZI, crawler.clone())]).await;
    let mut events = harness.service.subscribe_events();

    let failed = harness.service.submit_sales_history("isbn-1", 30, 5).await.unwrap();
    wait_for_status(&harness.store, &failed, TaskStatus::Failed).await;

    // The universal login-required condition is raised for the operator.
    let event = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await.unwrap() {
                PoolEvent::AllSessionsLoginRequired { site, .. } => break site,
                _ => continue,
            }
        }
    })
    .await
    .expect("no AllSessionsLoginRequired event");
    assert_eq!(event, sites::KONGFUZI);

    // Time alone never clears it: a follow-up task stays pending.
    let stuck = harness.service.submit_sales_history("isbn-2", 30, 5).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    let stuck_task = harness.store.fetch_by_id(&stuck).await.unwrap().unwrap();
    assert_eq!(stuck_task.status, TaskStatus::Pending);

    // Operator clearance brings the site back.
    let session_id = harness.pool.session_ids().remove(0);
    harness
        .service
        .clear_login_required(&session_id, sites::KONGFUZI)
        .unwrap();
    wait_for_status(&harness.store, &stuck, TaskStatus::Completed).await;
    harness.service.shutdown().await;
}

#[tokio::test]
async fn test_pending_task_can_be_cancelled_before_dispatch() {
    let crawler = Arc::new(ScriptedCrawler::ok());
    let harness = start_engine(1, 300, vec![(sites::KONGFUZI, crawler.clone())]).await;

    // Block the site so the task cannot be dispatched underneath us.
    let session_id = harness.pool.session_ids().remove(0);
    harness
        .pool
        .record_rate_limited(&session_id, sites::KONGFUZI, "throttled");

    let task_id = harness.service.submit_sales_history("isbn-1", 30, 5).await.unwrap();
    assert!(tokio_test::assert_ok!(harness.service.cancel(&task_id).await));

    // Unblock; the cancelled task must never run.
    let until = harness.clock.now() + chrono::Duration::hours(1);
    harness.clock.set(until);
    tokio::time::sleep(Duration::from_millis(200)).await;

    let task = harness.store.fetch_by_id(&task_id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Cancelled);
    assert!(crawler.executed().is_empty());
    harness.service.shutdown().await;
}

#[tokio::test]
async fn test_queue_status_and_stats_reflect_work() {
    let crawler = Arc::new(ScriptedCrawler::with_script(vec![
        Ok(serde_json::json!({"records": 1})),
        Err(CrawlError::Failed("selector drifted".to_string())),
    ]));
    let harness = start_engine(1, 300, vec![(sites::KONGFUZI, crawler)]).await;

    let ok = harness.service.submit_sales_history("isbn-1", 30, 9).await.unwrap();
    let bad = harness.service.submit_sales_history("isbn-2", 30, 1).await.unwrap();
    wait_for_status(&harness.store, &ok, TaskStatus::Completed).await;
    wait_for_status(&harness.store, &bad, TaskStatus::Failed).await;

    let queue = harness.service.queue_status().await.unwrap();
    let kongfuzi = &queue.per_site[sites::KONGFUZI];
    assert_eq!(kongfuzi.get(&TaskStatus::Completed), Some(&1));
    assert_eq!(kongfuzi.get(&TaskStatus::Failed), Some(&1));
    assert_eq!(queue.recent.len(), 2);

    let stats = harness.service.stats();
    assert_eq!(stats.dispatched, 2);
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.failed, 1);

    // Re-queue the failure; the scripted crawler now succeeds.
    assert_eq!(harness.service.retry_failed(Some(sites::KONGFUZI)).await.unwrap(), 1);
    wait_for_status(&harness.store, &bad, TaskStatus::Completed).await;
    harness.service.shutdown().await;
}
