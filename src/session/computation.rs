//! One computation process owned by a session.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tracing::{error, warn};
use uuid::Uuid;

use crate::http::events::{EventQueue, NodeEvent};
use crate::protocol::messages::ExecutorHeartbeat;
use crate::session::controller::RouterController;
use crate::supervisor::{
    ExitKind, ExitObserver, ExitStatus, ProcessHandle, ProcessState, SpawnArgs,
};
use crate::{NodeError, Result};

#[derive(Default)]
struct PerfStats {
    last_heartbeat: Option<ExecutorHeartbeat>,
    cpu_usage_5_secs_max: f32,
    cpu_usage_60_secs_max: f32,
    memory_usage_bytes_max: u64,
    last_sent_secs: i64,
    last_sent_micros: i64,
    last_received_secs: i64,
    last_received_micros: i64,
}

/// A supervised computation with its signalling and perf state.
pub struct Computation {
    process: Arc<ProcessHandle>,
    controller: Arc<RouterController>,
    events: Arc<EventQueue>,
    sent_go: AtomicBool,
    termination_expected: AtomicBool,
    stats: Mutex<PerfStats>,
    last_activity_secs: AtomicI64,
}

impl Computation {
    #[must_use]
    pub fn new(
        process: Arc<ProcessHandle>,
        controller: Arc<RouterController>,
        events: Arc<EventQueue>,
    ) -> Self {
        Self {
            process,
            controller,
            events,
            sent_go: AtomicBool::new(false),
            termination_expected: AtomicBool::new(false),
            stats: Mutex::new(PerfStats::default()),
            last_activity_secs: AtomicI64::new(chrono::Utc::now().timestamp()),
        }
    }

    #[must_use]
    pub fn id(&self) -> Uuid {
        self.process.id()
    }

    #[must_use]
    pub fn session_id(&self) -> Uuid {
        self.process.session_id()
    }

    #[must_use]
    pub fn name(&self) -> &str {
        self.process.name()
    }

    /// Launch the child process.
    ///
    /// # Errors
    ///
    /// `NodeError::Process` when the spawn fails.
    pub fn start(self: &Arc<Self>, spawn_args: SpawnArgs) -> Result<()> {
        let observer: Arc<dyn ExitObserver> = self.clone();
        self.process.spawn(spawn_args, Some(observer)).map_err(|err| {
            error!(session_id = %self.session_id(), name = %self.name(), %err,
                "failed to spawn computation process");
            NodeError::Process(format!("cannot start computation {}", self.name()))
        })?;
        self.termination_expected.store(false, Ordering::Release);
        self.touch();
        Ok(())
    }

    /// Begin an expected termination (soft, with the grace window).
    pub fn shutdown(&self) {
        self.termination_expected.store(true, Ordering::Release);
        self.process.terminate(true);
    }

    /// Deliver a session signal to this computation.
    ///
    /// The first `run` becomes a `go` control message; repeats become
    /// `update` so the computation sees only additions to its rules.
    pub fn signal(&self, signal_data: &Value) {
        let status = signal_data
            .get("status")
            .and_then(Value::as_str)
            .unwrap_or_default();
        if status != "run" || self.process.state() != ProcessState::Spawned {
            return;
        }
        if self.sent_go.swap(true, Ordering::AcqRel) {
            self.controller
                .send_control(self.id(), self.session_id(), "update", Some(signal_data));
        } else {
            self.controller
                .send_control(self.id(), self.session_id(), "go", Some(signal_data));
        }
    }

    /// Wait until the child exits, bounded. Returns false on timeout.
    pub async fn wait_until_shutdown(&self, deadline: tokio::time::Instant) -> bool {
        self.process.wait_until_exit(deadline).await
    }

    /// Fold a heartbeat into the rolling stats.
    pub fn on_heartbeat(&self, heartbeat: &ExecutorHeartbeat) {
        let mut stats = self.lock_stats();
        if heartbeat.cpu_usage_5_secs_current > stats.cpu_usage_5_secs_max {
            stats.cpu_usage_5_secs_max = heartbeat.cpu_usage_5_secs_current;
        }
        if heartbeat.cpu_usage_60_secs_current > stats.cpu_usage_60_secs_max {
            stats.cpu_usage_60_secs_max = heartbeat.cpu_usage_60_secs_current;
        }
        if heartbeat.memory_usage_bytes_current > stats.memory_usage_bytes_max {
            stats.memory_usage_bytes_max = heartbeat.memory_usage_bytes_current;
        }
        if heartbeat.sent_messages_5_sec > 0 {
            stats.last_sent_secs = heartbeat.transmit_secs;
            stats.last_sent_micros = heartbeat.transmit_micro_secs;
            self.last_activity_secs
                .store(heartbeat.transmit_secs, Ordering::Release);
        }
        if heartbeat.received_messages_5_sec > 0 {
            stats.last_received_secs = heartbeat.transmit_secs;
            stats.last_received_micros = heartbeat.transmit_micro_secs;
            self.last_activity_secs
                .store(heartbeat.transmit_secs, Ordering::Release);
        }
        stats.last_heartbeat = Some(heartbeat.clone());
    }

    #[must_use]
    pub fn last_activity_secs(&self) -> i64 {
        self.last_activity_secs.load(Ordering::Acquire)
    }

    /// Status object for the control plane.
    #[must_use]
    pub fn status(&self) -> Value {
        let sent_go = self.sent_go.load(Ordering::Acquire);
        let expected = self.termination_expected.load(Ordering::Acquire);
        match self.process.state() {
            ProcessState::NotSpawned => serde_json::json!({ "state": "NotStarted" }),
            ProcessState::Spawned => {
                let state = if sent_go { "Running" } else { "Starting" };
                serde_json::json!({ "state": state })
            }
            ProcessState::Terminating => serde_json::json!({ "state": "Stopping" }),
            ProcessState::Exited(exit) => match exit.kind {
                ExitKind::Exit => serde_json::json!({
                    "state": "Stopped",
                    "stoppedReason": exit.describe(expected),
                    "exitType": "Exit",
                    "exitCode": exit.status,
                }),
                ExitKind::Signal => serde_json::json!({
                    "state": "Stopped",
                    "stoppedReason": exit.describe(expected),
                    "exitType": "Signal",
                    "signal": exit.status,
                }),
                ExitKind::Internal => serde_json::json!({
                    "state": "LaunchError",
                    "stoppedReason": exit.describe(expected),
                }),
            },
        }
    }

    /// Performance object for the control plane.
    #[must_use]
    pub fn performance(&self) -> Value {
        let stats = self.lock_stats();
        let heartbeat = stats.last_heartbeat.clone().unwrap_or_default();
        serde_json::json!({
            "memoryUsageBytesMax": stats.memory_usage_bytes_max,
            "memoryUsageBytesCurrent": heartbeat.memory_usage_bytes_current,
            "cpuUsage5Secs": heartbeat.cpu_usage_5_secs_current,
            "cpuUsage5SecsMax": stats.cpu_usage_5_secs_max,
            "cpuUsage60Secs": heartbeat.cpu_usage_60_secs_current,
            "cpuUsage60SecsMax": stats.cpu_usage_60_secs_max,
            "cpuUsageTotalSecs": heartbeat.cpu_usage_total_secs,
            "hyperthreaded": heartbeat.hyperthreaded,
            "sentMessagesCount5Secs": heartbeat.sent_messages_5_sec,
            "sentMessagesCount60Secs": heartbeat.sent_messages_60_sec,
            "sentMessagesCountTotal": heartbeat.sent_messages_total,
            "receivedMessagesCount5Secs": heartbeat.received_messages_5_sec,
            "receivedMessagesCount60Secs": heartbeat.received_messages_60_sec,
            "receivedMessagesCountTotal": heartbeat.received_messages_total,
            "lastHeartbeatTime": time_string(heartbeat.transmit_secs, heartbeat.transmit_micro_secs),
            "lastSentMessagesTime": time_string(stats.last_sent_secs, stats.last_sent_micros),
            "lastReceivedMessagesTime": time_string(stats.last_received_secs, stats.last_received_micros),
        })
    }

    fn touch(&self) {
        self.last_activity_secs
            .store(chrono::Utc::now().timestamp(), Ordering::Release);
    }

    fn lock_stats(&self) -> std::sync::MutexGuard<'_, PerfStats> {
        self.stats
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl ExitObserver for Computation {
    /// Exit callback from the supervisor. The reason string distinguishes
    /// expected termination (session tearing down) from unexpected.
    fn on_exit(&self, id: Uuid, session_id: Uuid, status: ExitStatus) {
        let expected = self.termination_expected.load(Ordering::Acquire);
        if !expected {
            warn!(session_id = %session_id, computation = %id, name = %self.name(),
                reason = %status.describe(false), "computation exited unexpectedly");
        }
        self.events.push(NodeEvent::ComputationTerminated {
            session_id,
            computation_id: id,
            reason: format!("{} {}", self.name(), status.describe(expected)),
        });
    }
}

fn time_string(secs: i64, micros: i64) -> String {
    if secs == 0 && micros == 0 {
        return String::new();
    }
    use chrono::TimeZone;
    match chrono::Local.timestamp_opt(secs, 0) {
        chrono::LocalResult::Single(t) => {
            format!("{},{:03}", t.format("%Y-%m-%d %H:%M:%S"), micros / 1000)
        }
        _ => String::new(),
    }
}
