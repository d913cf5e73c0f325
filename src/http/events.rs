//! Event fan-out to the coordinator.
//!
//! The router, the supervisor, and the session manager all produce events;
//! they land on a single FIFO queue so producers never wait on HTTP. One
//! background worker pops events and translates each into a coordinator
//! request. Events are delivered in enqueue order; once the queue is shut
//! down every undelivered event is logged exactly once.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// An event destined for the coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeEvent {
    ComputationReady {
        session_id: Uuid,
        computation_id: Uuid,
    },
    ComputationTerminated {
        session_id: Uuid,
        computation_id: Uuid,
        reason: String,
    },
    SessionClientDisconnected {
        session_id: Uuid,
        reason: String,
    },
    SessionOperationFailed {
        session_id: Uuid,
        reason: String,
    },
    SessionExpired {
        session_id: Uuid,
        reason: String,
    },
    ShutdownWithError {
        reason: String,
    },
}

impl NodeEvent {
    /// Wire name of the event, sent in `X-Arras-Event-Type`.
    #[must_use]
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::ComputationReady { .. } => "computationReady",
            Self::ComputationTerminated { .. } => "computationTerminated",
            Self::SessionClientDisconnected { .. } => "sessionClientDisconnected",
            Self::SessionOperationFailed { .. } => "sessionOperationFailed",
            Self::SessionExpired { .. } => "sessionExpired",
            Self::ShutdownWithError { .. } => "shutdownWithError",
        }
    }
}

/// FIFO queue feeding the send-events worker.
#[derive(Default)]
pub struct EventQueue {
    queue: Mutex<VecDeque<NodeEvent>>,
    pushed: Notify,
    emptied: Notify,
    shut_down: AtomicBool,
}

impl EventQueue {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Enqueue an event. After shutdown the event is logged as
    /// undelivered instead.
    pub fn push(&self, event: NodeEvent) {
        if self.shut_down.load(Ordering::Acquire) {
            warn!(event_type = event.event_type(), ?event,
                "event undelivered: queue is shut down");
            return;
        }
        self.queue
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push_back(event);
        self.pushed.notify_one();
    }

    /// Pop the next event, waiting until one arrives.
    /// Returns `None` once the queue is shut down.
    pub async fn pop(&self) -> Option<NodeEvent> {
        loop {
            let notified = self.pushed.notified();
            {
                let mut queue = self
                    .queue
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                if let Some(event) = queue.pop_front() {
                    if queue.is_empty() {
                        self.emptied.notify_waiters();
                    }
                    return Some(event);
                }
                if self.shut_down.load(Ordering::Acquire) {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Block until the queue is empty or the timeout fires.
    /// Returns false on timeout.
    pub async fn wait_until_empty(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.emptied.notified();
            if self
                .queue
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .is_empty()
            {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return false;
            }
        }
    }

    /// Stop accepting events, log anything still queued, wake the worker.
    pub fn shutdown(&self) {
        self.shut_down.store(true, Ordering::Release);
        let remaining: Vec<NodeEvent> = self
            .queue
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .drain(..)
            .collect();
        for event in remaining {
            warn!(event_type = event.event_type(), ?event,
                "event undelivered: queue is shut down");
        }
        self.emptied.notify_waiters();
        self.pushed.notify_waiters();
    }
}

/// Configuration for the send-events worker.
pub struct EventSenderConfig {
    /// Coordinator base URL, e.g. `http://coord:8087/coordinator/1`.
    pub coordinator_url: String,
    /// Delay before session/computation DELETEs, covering a race against a
    /// just-completed create in the coordinator.
    pub pre_delete_delay: Duration,
}

/// Spawn the worker that drains the queue into coordinator requests.
///
/// `stop_running` is cancelled when a `shutdownWithError` event asks for a
/// local orderly shutdown.
pub fn spawn_event_worker(
    queue: Arc<EventQueue>,
    client: reqwest::Client,
    config: EventSenderConfig,
    stop_running: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = queue.pop().await {
            send_event(&client, &config, &event, &stop_running).await;
        }
        debug!("send-events worker exiting");
    })
}

async fn send_event(
    client: &reqwest::Client,
    config: &EventSenderConfig,
    event: &NodeEvent,
    stop_running: &CancellationToken,
) {
    debug!(event_type = event.event_type(), "sending event");
    match event {
        NodeEvent::ComputationReady {
            session_id,
            computation_id,
        } => {
            let url = format!(
                "{}/sessions/{session_id}/hosts/{computation_id}",
                config.coordinator_url
            );
            let result = client
                .put(&url)
                .json(&serde_json::json!({ "status": "ready" }))
                .send()
                .await;
            check_response("PUT", &url, *session_id, result);
        }

        NodeEvent::ComputationTerminated {
            session_id,
            computation_id,
            reason,
        } => {
            tokio::time::sleep(config.pre_delete_delay).await;
            let url = format!(
                "{}/sessions/{session_id}/computations/{computation_id}",
                config.coordinator_url
            );
            let result = client
                .delete(&url)
                .header("X-Host-Delete-Reason", sanitize_header(reason))
                .send()
                .await;
            check_response("DELETE", &url, *session_id, result);
        }

        NodeEvent::SessionClientDisconnected { session_id, reason }
        | NodeEvent::SessionOperationFailed { session_id, reason }
        | NodeEvent::SessionExpired { session_id, reason } => {
            tokio::time::sleep(config.pre_delete_delay).await;
            let url = format!("{}/sessions/{session_id}", config.coordinator_url);
            let delete_reason = if reason.is_empty() {
                event.event_type().to_owned()
            } else {
                reason.clone()
            };
            let result = client
                .delete(&url)
                .header("X-Arras-Event-Type", event.event_type())
                .header("X-Session-Delete-Reason", sanitize_header(&delete_reason))
                .send()
                .await;
            check_response("DELETE", &url, *session_id, result);
        }

        NodeEvent::ShutdownWithError { reason } => {
            error!(reason = reason.as_str(), "shutting node down on error event");
            stop_running.cancel();
        }
    }
}

fn check_response(
    method: &str,
    url: &str,
    session_id: Uuid,
    result: reqwest::Result<reqwest::Response>,
) {
    match result {
        Ok(response) if response.status().is_success() => {}
        Ok(response) => {
            warn!(session_id = %session_id, method, url, status = %response.status(),
                "coordinator returned unexpected response");
        }
        Err(err) => {
            warn!(session_id = %session_id, method, url, %err,
                "failed to deliver event to coordinator");
        }
    }
}

/// Header values cannot contain newlines.
fn sanitize_header(raw: &str) -> String {
    raw.replace('\n', "\\n").replace('\r', "")
}
