//! HTTP surface, driven through the router without a socket.

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode, header};
use serde_json::{Value, json};
use tally::engine::{WorkerConfig, WorkerPool};
use tally::http::{AppState, router};
use tally::ingest::IngestService;
use tally::queue::{DurableQueue, QueueConfig};
use tally::reporting::ReportingService;
use tally::store::MemoryEventStore;
use tower::ServiceExt as _;

struct Harness {
    app: Router,
    queue: DurableQueue,
    store: Arc<MemoryEventStore>,
}

fn harness_with(queue: DurableQueue) -> Harness {
    let store = Arc::new(MemoryEventStore::new());
    let app = router(AppState {
        ingest: IngestService::new(queue.clone()),
        reporting: ReportingService::new(store.clone()),
        queue: queue.clone(),
    });
    Harness { app, queue, store }
}

fn harness() -> Harness {
    harness_with(DurableQueue::in_memory(QueueConfig::default()).unwrap())
}

async fn post_event(app: &Router, body: impl Into<Body>) -> (StatusCode, Value, Option<String>) {
    let request = Request::builder()
        .method("POST")
        .uri("/event")
        .header(header::CONTENT_TYPE, "application/json")
        .body(body.into())
        .unwrap();
    send(app, request).await
}

async fn get(app: &Router, uri: &str) -> (StatusCode, Value, Option<String>) {
    let request = Request::builder().uri(uri).body(Body::empty()).unwrap();
    send(app, request).await
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value, Option<String>) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let retry_after = response
        .headers()
        .get(header::RETRY_AFTER)
        .map(|v| v.to_str().unwrap().to_string());
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, body, retry_after)
}

fn home_event() -> String {
    json!({
        "site_id": "s1",
        "event_type": "pageview",
        "path": "/home",
        "user_id": "u1",
        "timestamp": "2024-01-01T00:00:00Z"
    })
    .to_string()
}

#[tokio::test]
async fn valid_event_is_accepted_and_queued() {
    let h = harness();

    let (status, body, _) = post_event(&h.app, home_event()).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "status": "ok" }));
    assert_eq!(h.queue.counts().unwrap().pending, 1);
}

#[tokio::test]
async fn null_user_is_accepted() {
    let h = harness();
    let body = json!({
        "site_id": "s1",
        "event_type": "pageview",
        "path": "/home",
        "user_id": null,
        "timestamp": "2024-01-01T00:00:00Z"
    });

    let (status, _, _) = post_event(&h.app, body.to_string()).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn missing_field_is_rejected_with_its_name() {
    let h = harness();
    let body = json!({ "event_type": "pageview", "path": "/home", "timestamp": "2024-01-01" });

    let (status, body, retry_after) = post_event(&h.app, body.to_string()).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("site_id"));
    assert!(retry_after.is_none());
    assert_eq!(h.queue.counts().unwrap().pending, 0);
}

#[tokio::test]
async fn bad_timestamp_is_rejected() {
    let h = harness();
    let body = json!({
        "site_id": "s1",
        "event_type": "pageview",
        "path": "/home",
        "timestamp": "last tuesday"
    });

    let (status, body, _) = post_event(&h.app, body.to_string()).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("timestamp"));
}

#[tokio::test]
async fn empty_path_is_rejected_with_its_name() {
    let h = harness();
    let body = json!({
        "site_id": "s1",
        "event_type": "pageview",
        "path": "",
        "timestamp": "2024-01-01T00:00:00Z"
    });

    let (status, body, _) = post_event(&h.app, body.to_string()).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("path"));
    assert_eq!(h.queue.counts().unwrap().pending, 0);
}

#[tokio::test]
async fn unknown_fields_are_rejected() {
    let h = harness();
    let body = json!({
        "site_id": "s1",
        "event_type": "pageview",
        "path": "/home",
        "timestamp": "2024-01-01T00:00:00Z",
        "referrer": "https://example.com"
    });

    let (status, body, _) = post_event(&h.app, body.to_string()).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("referrer"));
    assert_eq!(h.queue.counts().unwrap().pending, 0);
}

#[tokio::test]
async fn malformed_json_is_a_bad_request() {
    let h = harness();

    let (status, body, _) = post_event(&h.app, "{\"site_id\": ").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].is_string());

    let (status, _, _) = post_event(&h.app, json!({ "site_id": 7 }).to_string()).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn unavailable_queue_asks_client_to_retry() {
    let dir = std::env::temp_dir().join(format!("tally-http-{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("queue.db");
    let h = harness_with(DurableQueue::open(&path, QueueConfig::default()).unwrap());

    // Another process holds the write lock past the busy timeout.
    let blocker = rusqlite::Connection::open(&path).unwrap();
    blocker.execute_batch("BEGIN IMMEDIATE;").unwrap();

    let (status, body, retry_after) = post_event(&h.app, home_event()).await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert!(body["error"].is_string());
    assert!(retry_after.is_some());

    blocker.execute_batch("ROLLBACK;").unwrap();
    drop(blocker);
    std::fs::remove_dir_all(&dir).ok();
}

#[tokio::test]
async fn stats_require_site_id() {
    let h = harness();

    let (status, body, _) = get(&h.app, "/stats").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body, json!({ "error": "site_id required" }));

    let (status, _, _) = get(&h.app, "/stats?site_id=").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn stats_reject_bad_date() {
    let h = harness();
    let (status, body, _) = get(&h.app, "/stats?site_id=s1&date=01-01-2024").await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("date"));
}

#[tokio::test]
async fn stats_reflect_delivered_events() {
    let h = harness_with(
        DurableQueue::in_memory(QueueConfig {
            retry_backoff: Duration::ZERO,
            ..QueueConfig::default()
        })
        .unwrap(),
    );
    for (path, user) in [("/home", "u1"), ("/home", "u2"), ("/about", "u1")] {
        let body = json!({
            "site_id": "s1",
            "event_type": "pageview",
            "path": path,
            "user_id": user,
            "timestamp": "2024-01-01T12:00:00Z"
        });
        let (status, _, _) = post_event(&h.app, body.to_string()).await;
        assert_eq!(status, StatusCode::OK);
    }

    let pool = WorkerPool::new(h.queue.clone(), h.store.clone(), WorkerConfig::default());
    for _ in 0..3 {
        pool.process_next("w1").await.unwrap();
    }

    let (status, body, _) = get(&h.app, "/stats?site_id=s1&date=2024-01-01").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["site_id"], "s1");
    assert_eq!(body["total_views"], 3);
    assert_eq!(body["unique_users"], 2);
    assert_eq!(
        body["top_paths"],
        json!([{ "path": "/home", "views": 2 }, { "path": "/about", "views": 1 }])
    );

    let (_, body, _) = get(&h.app, "/stats?site_id=s1&date=2024-01-02").await;
    assert_eq!(body["total_views"], 0);
    assert_eq!(body["top_paths"], json!([]));
}

#[tokio::test]
async fn health_and_queue_counts() {
    let h = harness();
    post_event(&h.app, home_event()).await;

    let (status, body, _) = get(&h.app, "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");

    let (status, body, _) = get(&h.app, "/queue").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body,
        json!({ "pending": 1, "leased": 0, "done": 0, "failed": 0 })
    );
}
