//! Durable queue behaviour: ordering, leases, retries, sweeping, durability.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{TimeDelta, TimeZone, Utc};
use tally::error::Error;
use tally::model::{Event, FailureReason, State};
use tally::queue::{DurableQueue, QueueConfig};

const LEASE: Duration = Duration::from_secs(30);

fn event(path: &str) -> Event {
    Event {
        site_id: "s1".to_string(),
        event_type: "pageview".to_string(),
        path: path.to_string(),
        user_id: None,
        timestamp: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
    }
}

/// Retries become leasable immediately so tests do not sleep.
fn test_queue(retry_limit: u32) -> DurableQueue {
    DurableQueue::in_memory(QueueConfig {
        retry_limit,
        retry_backoff: Duration::ZERO,
        ..QueueConfig::default()
    })
    .unwrap()
}

#[test]
fn enqueue_then_lease_returns_the_same_event() {
    let queue = test_queue(5);
    let sent = event("/home");
    let id = queue.enqueue(&sent).unwrap();

    let lease = queue.lease("w1", LEASE).unwrap().unwrap();
    assert_eq!(lease.id(), id);
    assert_eq!(lease.event(), &sent);
    assert_eq!(lease.attempt(), 1);
    assert_eq!(lease.item.state, State::Leased);
    assert_eq!(lease.item.lease_owner.as_deref(), Some("w1"));
    assert!(lease.expires_at().unwrap() > Utc::now());
}

#[test]
fn lease_on_empty_queue_returns_none() {
    let queue = test_queue(5);
    assert!(queue.lease("w1", LEASE).unwrap().is_none());
}

#[test]
fn items_are_leased_oldest_first() {
    let queue = test_queue(5);
    let ids: Vec<_> = ["/a", "/b", "/c"]
        .iter()
        .map(|p| queue.enqueue(&event(p)).unwrap())
        .collect();
    assert!(ids.windows(2).all(|w| w[0] < w[1]));

    let leased: Vec<_> = (0..3)
        .map(|_| queue.lease("w1", LEASE).unwrap().unwrap().id())
        .collect();
    assert_eq!(leased, ids);
}

#[test]
fn acknowledge_marks_done() {
    let queue = test_queue(5);
    let id = queue.enqueue(&event("/home")).unwrap();
    let lease = queue.lease("w1", LEASE).unwrap().unwrap();

    queue.acknowledge(&lease).unwrap();

    let item = queue.get(id).unwrap();
    assert_eq!(item.state, State::Done);
    assert!(item.lease_owner.is_none());
    assert!(queue.lease("w1", LEASE).unwrap().is_none());
}

#[test]
fn concurrent_leases_never_share_an_item() {
    let queue = test_queue(5);
    for n in 0..200 {
        queue.enqueue(&event(&format!("/p{n}"))).unwrap();
    }

    let seen = Arc::new(Mutex::new(Vec::new()));
    let handles: Vec<_> = (0..8)
        .map(|w| {
            let queue = queue.clone();
            let seen = Arc::clone(&seen);
            std::thread::spawn(move || {
                let worker = format!("w{w}");
                while let Some(lease) = queue.lease(&worker, LEASE).unwrap() {
                    seen.lock().unwrap().push(lease.id());
                    queue.acknowledge(&lease).unwrap();
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    let seen = seen.lock().unwrap();
    let unique: HashSet<_> = seen.iter().collect();
    assert_eq!(seen.len(), 200);
    assert_eq!(unique.len(), 200);
    assert_eq!(queue.counts().unwrap().done, 200);
}

#[test]
fn retryable_failure_requeues_until_limit() {
    let queue = test_queue(3);
    let id = queue.enqueue(&event("/home")).unwrap();
    let reason = FailureReason::StorageError("connection reset".to_string());

    for attempt in 1..=2 {
        let lease = queue.lease("w1", LEASE).unwrap().unwrap();
        assert_eq!(lease.attempt(), attempt);
        assert_eq!(queue.report_failure(&lease, &reason).unwrap(), State::Pending);
    }

    let lease = queue.lease("w1", LEASE).unwrap().unwrap();
    assert_eq!(lease.attempt(), 3);
    assert_eq!(queue.report_failure(&lease, &reason).unwrap(), State::Failed);

    let item = queue.get(id).unwrap();
    assert_eq!(item.state, State::Failed);
    assert_eq!(item.attempt_count, 3);
    assert!(item.last_error.unwrap().contains("connection reset"));
    assert!(queue.lease("w1", LEASE).unwrap().is_none());
}

#[test]
fn permanent_failure_skips_remaining_attempts() {
    let queue = test_queue(5);
    let id = queue.enqueue(&event("/home")).unwrap();
    let lease = queue.lease("w1", LEASE).unwrap().unwrap();

    let state = queue
        .report_failure(&lease, &FailureReason::Permanent("value too long".to_string()))
        .unwrap();

    assert_eq!(state, State::Failed);
    assert_eq!(queue.get(id).unwrap().attempt_count, 1);
}

#[test]
fn retry_backoff_delays_the_next_lease() {
    let queue = DurableQueue::in_memory(QueueConfig {
        retry_backoff: Duration::from_secs(60),
        ..QueueConfig::default()
    })
    .unwrap();
    let id = queue.enqueue(&event("/home")).unwrap();
    let lease = queue.lease("w1", LEASE).unwrap().unwrap();

    queue
        .report_failure(&lease, &FailureReason::StorageError("timeout".to_string()))
        .unwrap();

    let item = queue.get(id).unwrap();
    assert_eq!(item.state, State::Pending);
    assert!(item.available_at > Utc::now() + TimeDelta::seconds(50));
    assert!(queue.lease("w1", LEASE).unwrap().is_none());
}

#[test]
fn expired_lease_is_reclaimed_by_sweep() {
    let queue = test_queue(5);
    let id = queue.enqueue(&event("/home")).unwrap();
    let first = queue.lease("w1", Duration::from_millis(1)).unwrap().unwrap();

    let report = queue
        .sweep_expired_leases_at(Utc::now() + TimeDelta::seconds(1))
        .unwrap();
    assert_eq!(report.requeued, 1);
    assert_eq!(queue.get(id).unwrap().state, State::Pending);

    let second = queue.lease("w2", LEASE).unwrap().unwrap();
    assert_eq!(second.id(), id);
    assert_eq!(second.attempt(), 2);

    // The first worker woke up late: its lease no longer counts.
    assert!(matches!(
        queue.acknowledge(&first),
        Err(Error::LeaseExpired { .. })
    ));
    assert!(matches!(
        queue.report_failure(&first, &FailureReason::StorageError("late".into())),
        Err(Error::LeaseExpired { .. })
    ));
    assert_eq!(queue.get(id).unwrap().state, State::Leased);

    queue.acknowledge(&second).unwrap();
    assert_eq!(queue.get(id).unwrap().state, State::Done);
}

#[test]
fn sweep_leaves_live_leases_alone() {
    let queue = test_queue(5);
    queue.enqueue(&event("/home")).unwrap();
    queue.lease("w1", LEASE).unwrap().unwrap();

    let report = queue.sweep_expired_leases().unwrap();
    assert_eq!(report.total(), 0);
    assert_eq!(queue.counts().unwrap().leased, 1);
}

#[test]
fn sweep_fails_items_out_of_attempts() {
    let queue = test_queue(1);
    let id = queue.enqueue(&event("/home")).unwrap();
    queue.lease("w1", Duration::from_millis(1)).unwrap().unwrap();

    let report = queue
        .sweep_expired_leases_at(Utc::now() + TimeDelta::seconds(1))
        .unwrap();

    assert_eq!(report.failed, 1);
    let item = queue.get(id).unwrap();
    assert_eq!(item.state, State::Failed);
    assert_eq!(item.last_error.as_deref(), Some("lease expired"));
}

#[test]
fn extend_lease_pushes_expiry() {
    let queue = test_queue(5);
    queue.enqueue(&event("/home")).unwrap();
    let mut lease = queue.lease("w1", Duration::from_secs(1)).unwrap().unwrap();

    queue.extend_lease(&mut lease, Duration::from_secs(120)).unwrap();

    let report = queue
        .sweep_expired_leases_at(Utc::now() + TimeDelta::seconds(60))
        .unwrap();
    assert_eq!(report.total(), 0);
    assert!(lease.expires_at().unwrap() > Utc::now() + TimeDelta::seconds(100));
}

#[test]
fn lease_duration_past_the_calendar_is_an_error() {
    let queue = test_queue(5);
    let id = queue.enqueue(&event("/home")).unwrap();

    assert!(queue.lease("w1", Duration::from_secs(10_000_000_000_000)).is_err());
    assert!(queue.lease("w1", Duration::MAX).is_err());

    let item = queue.get(id).unwrap();
    assert_eq!(item.state, State::Pending);
    assert_eq!(item.attempt_count, 0);
}

#[test]
fn extend_past_the_calendar_keeps_the_old_expiry() {
    let queue = test_queue(5);
    queue.enqueue(&event("/home")).unwrap();
    let mut lease = queue.lease("w1", LEASE).unwrap().unwrap();
    let expires_at = lease.expires_at();

    assert!(
        queue
            .extend_lease(&mut lease, Duration::from_secs(10_000_000_000_000))
            .is_err()
    );
    assert_eq!(lease.expires_at(), expires_at);
    assert_eq!(queue.get(lease.id()).unwrap().lease_expires_at, expires_at);
}

#[test]
fn operator_can_retry_failed_items() {
    let queue = test_queue(1);
    let id = queue.enqueue(&event("/home")).unwrap();
    let lease = queue.lease("w1", LEASE).unwrap().unwrap();
    queue
        .report_failure(&lease, &FailureReason::StorageError("down".into()))
        .unwrap();
    assert_eq!(queue.list(State::Failed, 10).unwrap().len(), 1);

    let item = queue.retry_failed(id).unwrap();
    assert_eq!(item.state, State::Pending);
    assert_eq!(item.attempt_count, 1);
    assert_eq!(item.retry_base, 1);

    let lease = queue.lease("w1", LEASE).unwrap().unwrap();
    assert_eq!(lease.attempt(), 2);
}

#[test]
fn operator_retry_keeps_counting_attempts_with_a_fresh_budget() {
    let queue = test_queue(2);
    let id = queue.enqueue(&event("/home")).unwrap();
    let down = FailureReason::StorageError("down".into());

    for expected in [State::Pending, State::Failed] {
        let lease = queue.lease("w1", LEASE).unwrap().unwrap();
        assert_eq!(queue.report_failure(&lease, &down).unwrap(), expected);
    }
    let before = queue.get(id).unwrap().attempt_count;
    assert_eq!(before, 2);

    let item = queue.retry_failed(id).unwrap();
    assert!(item.attempt_count >= before);

    // Two more attempts are allowed after the requeue, then it fails again.
    let lease = queue.lease("w1", LEASE).unwrap().unwrap();
    assert_eq!(lease.attempt(), 3);
    assert_eq!(queue.report_failure(&lease, &down).unwrap(), State::Pending);
    let lease = queue.lease("w1", LEASE).unwrap().unwrap();
    assert_eq!(lease.attempt(), 4);
    assert_eq!(queue.report_failure(&lease, &down).unwrap(), State::Failed);

    let item = queue.get(id).unwrap();
    assert_eq!(item.attempt_count, 4);
    assert_eq!(item.retry_base, 2);
}

#[test]
fn sweep_uses_the_budget_restored_by_operator_retry() {
    let queue = test_queue(1);
    let id = queue.enqueue(&event("/home")).unwrap();
    let lease = queue.lease("w1", LEASE).unwrap().unwrap();
    queue
        .report_failure(&lease, &FailureReason::StorageError("down".into()))
        .unwrap();
    queue.retry_failed(id).unwrap();

    queue.lease("crashed", Duration::from_millis(1)).unwrap().unwrap();
    let report = queue
        .sweep_expired_leases_at(Utc::now() + TimeDelta::seconds(1))
        .unwrap();

    assert_eq!(report.failed, 1);
    let item = queue.get(id).unwrap();
    assert_eq!(item.state, State::Failed);
    assert_eq!(item.attempt_count, 2);
}

#[test]
fn retry_rejects_items_that_are_not_failed() {
    let queue = test_queue(5);
    let id = queue.enqueue(&event("/home")).unwrap();

    assert!(matches!(
        queue.retry_failed(id),
        Err(Error::InvalidTransition {
            from: State::Pending,
            to: State::Pending,
            ..
        })
    ));
}

#[test]
fn purge_removes_only_old_done_items() {
    let queue = test_queue(5);
    queue.enqueue(&event("/a")).unwrap();
    let pending = queue.enqueue(&event("/b")).unwrap();
    let lease = queue.lease("w1", LEASE).unwrap().unwrap();
    queue.acknowledge(&lease).unwrap();

    assert_eq!(queue.purge_done(Utc::now() - TimeDelta::hours(1)).unwrap(), 0);
    assert_eq!(queue.purge_done(Utc::now() + TimeDelta::seconds(1)).unwrap(), 1);

    let counts = queue.counts().unwrap();
    assert_eq!(counts.done, 0);
    assert_eq!(counts.pending, 1);
    assert_eq!(queue.get(pending).unwrap().state, State::Pending);
}

#[test]
fn counts_track_every_state() {
    let queue = test_queue(1);
    for p in ["/a", "/b", "/c", "/d"] {
        queue.enqueue(&event(p)).unwrap();
    }
    let done = queue.lease("w1", LEASE).unwrap().unwrap();
    queue.acknowledge(&done).unwrap();
    let failed = queue.lease("w1", LEASE).unwrap().unwrap();
    queue
        .report_failure(&failed, &FailureReason::Permanent("bad".into()))
        .unwrap();
    queue.lease("w1", LEASE).unwrap().unwrap();

    let counts = queue.counts().unwrap();
    assert_eq!(counts.pending, 1);
    assert_eq!(counts.leased, 1);
    assert_eq!(counts.done, 1);
    assert_eq!(counts.failed, 1);
}

#[test]
fn enqueued_items_survive_reopen() {
    let dir = std::env::temp_dir().join(format!("tally-queue-{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("queue.db");

    let id = {
        let queue = DurableQueue::open(&path, QueueConfig::default()).unwrap();
        let id = queue.enqueue(&event("/home")).unwrap();
        // Leased but never settled: the process "crashes" here.
        queue.lease("w1", Duration::from_millis(1)).unwrap().unwrap();
        id
    };

    let queue = DurableQueue::open(&path, QueueConfig::default()).unwrap();
    let item = queue.get(id).unwrap();
    assert_eq!(item.state, State::Leased);
    assert_eq!(item.payload, event("/home"));

    queue
        .sweep_expired_leases_at(Utc::now() + TimeDelta::seconds(1))
        .unwrap();
    let lease = queue.lease("w2", LEASE).unwrap().unwrap();
    assert_eq!(lease.id(), id);

    drop(queue);
    std::fs::remove_dir_all(&dir).ok();
}

#[tokio::test]
async fn async_calls_wait_for_a_locked_database_off_the_runtime_thread() {
    let dir = std::env::temp_dir().join(format!("tally-queue-{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("queue.db");
    let queue = DurableQueue::open(&path, QueueConfig::default()).unwrap();

    // Another process holds the write lock.
    let blocker = rusqlite::Connection::open(&path).unwrap();
    blocker.execute_batch("BEGIN IMMEDIATE").unwrap();

    let task = {
        let queue = queue.clone();
        tokio::spawn(async move { queue.enqueue_async(event("/home")).await })
    };

    let started = std::time::Instant::now();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(
        started.elapsed() < Duration::from_secs(1),
        "runtime thread stalled for {:?}",
        started.elapsed()
    );

    blocker.execute_batch("ROLLBACK").unwrap();
    let id = task.await.unwrap().unwrap();
    assert_eq!(queue.counts_async().await.unwrap().pending, 1);
    assert_eq!(queue.get(id).unwrap().state, State::Pending);

    drop(blocker);
    drop(queue);
    std::fs::remove_dir_all(&dir).ok();
}
