//! Integration tests for the event queue claim.
//!
//! Require a migrated PostgreSQL reachable at `DATABASE_URL`:
//! `cargo test -p outpost-db -- --ignored`

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use chrono::Utc;
use outpost_db::test_fixtures::{unique_name, TestDatabase};
use outpost_db::{fetch_batch, requeue, Event, EventFetcher, RetryPolicy};

fn event(name: &str, priority: i32) -> Event {
    Event::new(name, HashMap::from([("id".to_string(), priority.to_string())]))
        .with_priority(priority)
}

#[tokio::test]
#[ignore]
async fn test_claims_highest_priority_first() {
    let test_db = TestDatabase::new().await;
    let name = unique_name("priority");

    for priority in [1, 5, 3] {
        test_db.db.events.enqueue(&event(&name, priority)).await.unwrap();
    }

    let fetcher = EventFetcher::new(vec![name.clone()]);
    let mut order = Vec::new();
    loop {
        let mut tx = test_db.pool.begin().await.unwrap();
        let events = fetcher.fetch(&mut tx).await.unwrap();
        tx.commit().await.unwrap();
        if events.is_empty() {
            break;
        }
        order.extend(events.iter().map(|e| e.priority));
    }

    assert_eq!(order, vec![5, 3, 1]);
}

#[tokio::test]
#[ignore]
async fn test_single_fetch_returns_batch_in_priority_order() {
    let test_db = TestDatabase::new().await;
    let name = unique_name("batch_order");

    for priority in [1, 5, 3] {
        test_db.db.events.enqueue(&event(&name, priority)).await.unwrap();
    }

    let mut tx = test_db.pool.begin().await.unwrap();
    let events = fetch_batch(&mut tx, &[name.clone()], 3, &RetryPolicy::default())
        .await
        .unwrap();
    tx.commit().await.unwrap();

    let priorities: Vec<i32> = events.iter().map(|e| e.priority).collect();
    assert_eq!(priorities, vec![5, 3, 1]);
    assert_eq!(test_db.db.events.pending_count(&[name]).await.unwrap(), 0);
}

#[tokio::test]
#[ignore]
async fn test_concurrent_fetchers_never_share_an_event() {
    let test_db = TestDatabase::new().await;
    let name = unique_name("no_double_claim");

    for i in 0..40 {
        test_db.db.events.enqueue(&event(&name, i % 4)).await.unwrap();
    }

    let mut handles = Vec::new();
    for _ in 0..4 {
        let pool = test_db.pool.clone();
        let name = name.clone();
        handles.push(tokio::spawn(async move {
            let fetcher = EventFetcher::new(vec![name]).with_batch_size(3);
            let mut claimed = Vec::new();
            loop {
                let mut tx = pool.begin().await.unwrap();
                let events = fetcher.fetch(&mut tx).await.unwrap();
                // Hold the lock for a moment so the others must skip.
                tokio::time::sleep(Duration::from_millis(5)).await;
                tx.commit().await.unwrap();
                if events.is_empty() {
                    break;
                }
                claimed.extend(events.into_iter().map(|e| e.id));
            }
            claimed
        }));
    }

    let mut all = Vec::new();
    for handle in handles {
        all.extend(handle.await.unwrap());
    }
    let unique: HashSet<_> = all.iter().collect();
    assert_eq!(all.len(), 40);
    assert_eq!(unique.len(), 40);
}

#[tokio::test]
#[ignore]
async fn test_rollback_returns_event_to_queue() {
    let test_db = TestDatabase::new().await;
    let name = unique_name("rollback");
    let id = test_db.db.events.enqueue(&event(&name, 0)).await.unwrap();

    let fetcher = EventFetcher::new(vec![name.clone()]);
    let mut tx = test_db.pool.begin().await.unwrap();
    assert_eq!(fetcher.fetch(&mut tx).await.unwrap().len(), 1);
    tx.rollback().await.unwrap();

    assert!(test_db.db.events.get(id).await.unwrap().is_some());
}

#[tokio::test]
#[ignore]
async fn test_failed_event_reclaimed_only_after_backoff() {
    let test_db = TestDatabase::new().await;
    let name = unique_name("backoff");
    let id = test_db.db.events.enqueue(&event(&name, 0)).await.unwrap();
    test_db.db.events.record_failure(id, "boom").await.unwrap();

    let stored = test_db.db.events.get(id).await.unwrap().unwrap();
    assert_eq!(stored.attempts, 1);
    assert_eq!(stored.error.as_deref(), Some("boom"));

    let slow = EventFetcher::new(vec![name.clone()]);
    let mut tx = test_db.pool.begin().await.unwrap();
    assert!(slow.fetch(&mut tx).await.unwrap().is_empty());
    tx.rollback().await.unwrap();

    // One second base delay: 1 * 1^5 = 1s after the failure.
    tokio::time::sleep(Duration::from_millis(1200)).await;
    let fast = slow
        .clone()
        .with_policy(RetryPolicy::default().with_base_delay(Duration::from_secs(1)));
    let mut tx = test_db.pool.begin().await.unwrap();
    let events = fast.fetch(&mut tx).await.unwrap();
    tx.commit().await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].id, id);
}

#[tokio::test]
#[ignore]
async fn test_exhausted_event_never_claimed() {
    let test_db = TestDatabase::new().await;
    let name = unique_name("exhausted");
    let id = test_db.db.events.enqueue(&event(&name, 0)).await.unwrap();
    for _ in 0..4 {
        test_db.db.events.record_failure(id, "still failing").await.unwrap();
    }

    let policy = RetryPolicy::default().with_base_delay(Duration::ZERO);
    let mut tx = test_db.pool.begin().await.unwrap();
    let events = fetch_batch(&mut tx, &[name.clone()], 10, &policy).await.unwrap();
    tx.rollback().await.unwrap();
    assert!(events.is_empty());

    let exhausted = test_db.db.events.list_exhausted(&policy, 1000).await.unwrap();
    assert!(exhausted.iter().any(|e| e.id == id));
}

#[tokio::test]
#[ignore]
async fn test_requeue_restores_failed_batch_members() {
    let test_db = TestDatabase::new().await;
    let name = unique_name("requeue");
    test_db.db.events.enqueue(&event(&name, 0)).await.unwrap();

    let fetcher = EventFetcher::new(vec![name.clone()]);
    let mut tx = test_db.pool.begin().await.unwrap();
    let mut events = fetcher.fetch(&mut tx).await.unwrap();
    assert_eq!(events.len(), 1);
    events[0].mark_failed("upstream down", Utc::now());
    requeue(&mut tx, &events).await.unwrap();
    tx.commit().await.unwrap();

    let stored = test_db.db.events.get(events[0].id).await.unwrap().unwrap();
    assert_eq!(stored.attempts, 1);
    assert_eq!(stored.error.as_deref(), Some("upstream down"));
    assert!(stored.last_attempt.is_some());
    assert_eq!(
        test_db.db.events.pending_count(&[name]).await.unwrap(),
        1
    );
}
