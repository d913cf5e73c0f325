//! Event fan-out worker against a stand-in coordinator.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::State;
use axum::http::{HeaderMap, Method, Uri};
use axum::routing::any;
use axum::Router;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use arras_node::http::{spawn_event_worker, EventQueue, EventSenderConfig, NodeEvent};

#[derive(Debug, Clone)]
struct Recorded {
    method: String,
    path: String,
    headers: Vec<(String, String)>,
}

type RequestLog = Arc<Mutex<Vec<Recorded>>>;

async fn record(
    State(log): State<RequestLog>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
) -> &'static str {
    let headers = headers
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or_default().to_owned()))
        .collect();
    log.lock().unwrap().push(Recorded {
        method: method.to_string(),
        path: uri.path().to_owned(),
        headers,
    });
    "{}"
}

/// Start a coordinator stand-in that 200s everything and records it.
async fn start_coordinator() -> (String, RequestLog) {
    let log: RequestLog = Arc::new(Mutex::new(Vec::new()));
    let app = Router::new()
        .route("/*path", any(record))
        .with_state(Arc::clone(&log));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}"), log)
}

async fn wait_for_requests(log: &RequestLog, count: usize) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while log.lock().unwrap().len() < count {
        assert!(
            tokio::time::Instant::now() < deadline,
            "coordinator did not receive {count} requests: {:?}",
            log.lock().unwrap()
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

fn header<'a>(recorded: &'a Recorded, name: &str) -> Option<&'a str> {
    recorded
        .headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

#[tokio::test]
async fn events_translate_into_coordinator_requests_in_order() {
    let (base_url, log) = start_coordinator().await;
    let queue = EventQueue::new();
    spawn_event_worker(
        Arc::clone(&queue),
        reqwest::Client::new(),
        EventSenderConfig {
            coordinator_url: base_url,
            pre_delete_delay: Duration::from_millis(5),
        },
        CancellationToken::new(),
    );

    let session_id = Uuid::new_v4();
    let computation_id = Uuid::new_v4();
    queue.push(NodeEvent::ComputationReady {
        session_id,
        computation_id,
    });
    queue.push(NodeEvent::ComputationTerminated {
        session_id,
        computation_id,
        reason: "renderer exited normally (code 0)".into(),
    });
    queue.push(NodeEvent::SessionExpired {
        session_id,
        reason: String::new(),
    });

    wait_for_requests(&log, 3).await;
    let requests = log.lock().unwrap().clone();

    assert_eq!(requests[0].method, "PUT");
    assert_eq!(
        requests[0].path,
        format!("/sessions/{session_id}/hosts/{computation_id}")
    );

    assert_eq!(requests[1].method, "DELETE");
    assert_eq!(
        requests[1].path,
        format!("/sessions/{session_id}/computations/{computation_id}")
    );
    assert_eq!(
        header(&requests[1], "X-Host-Delete-Reason"),
        Some("renderer exited normally (code 0)")
    );

    assert_eq!(requests[2].method, "DELETE");
    assert_eq!(requests[2].path, format!("/sessions/{session_id}"));
    assert_eq!(
        header(&requests[2], "X-Arras-Event-Type"),
        Some("sessionExpired")
    );
    // an empty reason falls back to the event type
    assert_eq!(
        header(&requests[2], "X-Session-Delete-Reason"),
        Some("sessionExpired")
    );
}

#[tokio::test]
async fn client_disconnect_reason_reaches_the_delete_header() {
    let (base_url, log) = start_coordinator().await;
    let queue = EventQueue::new();
    spawn_event_worker(
        Arc::clone(&queue),
        reqwest::Client::new(),
        EventSenderConfig {
            coordinator_url: base_url,
            pre_delete_delay: Duration::from_millis(5),
        },
        CancellationToken::new(),
    );

    let session_id = Uuid::new_v4();
    queue.push(NodeEvent::SessionClientDisconnected {
        session_id,
        reason: "clientDroppedConnection".into(),
    });

    wait_for_requests(&log, 1).await;
    let requests = log.lock().unwrap().clone();
    assert_eq!(
        header(&requests[0], "X-Arras-Event-Type"),
        Some("sessionClientDisconnected")
    );
    assert_eq!(
        header(&requests[0], "X-Session-Delete-Reason"),
        Some("clientDroppedConnection")
    );
}

#[tokio::test]
async fn shutdown_with_error_triggers_local_shutdown_only() {
    let (base_url, log) = start_coordinator().await;
    let queue = EventQueue::new();
    let stop = CancellationToken::new();
    spawn_event_worker(
        Arc::clone(&queue),
        reqwest::Client::new(),
        EventSenderConfig {
            coordinator_url: base_url,
            pre_delete_delay: Duration::from_millis(5),
        },
        stop.clone(),
    );

    queue.push(NodeEvent::ShutdownWithError {
        reason: "Lost router connection".into(),
    });

    tokio::time::timeout(Duration::from_secs(2), stop.cancelled())
        .await
        .expect("shutdownWithError must cancel the stop token");
    // no coordinator request corresponds to this event
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(log.lock().unwrap().is_empty());
}

#[tokio::test]
async fn queued_events_survive_until_the_worker_drains_them() {
    let (base_url, log) = start_coordinator().await;
    let queue = EventQueue::new();

    // events pushed before the worker starts must not be lost
    let session_id = Uuid::new_v4();
    for _ in 0..3 {
        queue.push(NodeEvent::ComputationReady {
            session_id,
            computation_id: Uuid::new_v4(),
        });
    }
    spawn_event_worker(
        Arc::clone(&queue),
        reqwest::Client::new(),
        EventSenderConfig {
            coordinator_url: base_url,
            pre_delete_delay: Duration::from_millis(5),
        },
        CancellationToken::new(),
    );

    wait_for_requests(&log, 3).await;
    assert!(queue.wait_until_empty(Duration::from_secs(1)).await);
}
