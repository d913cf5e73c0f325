//! One session's state machine and operations.
//!
//! Operations (create/modify via `async_update_config`, delete, shutdown)
//! run on their own task and are mutually exclusive: a session is Free,
//! Busy, or Defunct, and a state-changing call on a Busy or Defunct
//! session fails immediately with a conflict; callers are never queued.
//! The node answers the coordinator promptly, and the coordinator tracks
//! completion through the notifications the operation emits.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use uuid::Uuid;

use super::computation::Computation;
use super::config::{ComputationConfig, SessionConfig};
use super::controller::RouterController;
use crate::config::ComputationDefaults;
use crate::http::events::{EventQueue, NodeEvent};
use crate::supervisor::ProcessManager;
use crate::{NodeError, Result};

/// Time to wait for running processes to terminate before giving up.
pub const WAIT_FOR_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Free,
    Busy,
    Defunct,
}

impl SessionState {
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Free => "Free",
            Self::Busy => "Busy",
            Self::Defunct => "Defunct",
        }
    }
}

struct StateCell {
    state: SessionState,
    shutting_down: bool,
    delete_reason: String,
}

/// A session and the computations it owns on this host.
pub struct Session {
    id: Uuid,
    node_id: Uuid,
    defaults: ComputationDefaults,
    process_manager: Arc<ProcessManager>,
    controller: Arc<RouterController>,
    events: Arc<EventQueue>,
    state: Mutex<StateCell>,
    operation_complete: Notify,
    computations: Mutex<HashMap<Uuid, Arc<Computation>>>,
    log_level: AtomicI32,
    last_activity_secs: AtomicI64,
    expiration: Mutex<Option<CancellationToken>>,
}

impl Session {
    #[must_use]
    pub fn new(
        id: Uuid,
        node_id: Uuid,
        defaults: ComputationDefaults,
        process_manager: Arc<ProcessManager>,
        controller: Arc<RouterController>,
        events: Arc<EventQueue>,
    ) -> Arc<Self> {
        let log_level = defaults.log_level;
        Arc::new(Self {
            id,
            node_id,
            defaults,
            process_manager,
            controller,
            events,
            state: Mutex::new(StateCell {
                state: SessionState::Free,
                shutting_down: false,
                delete_reason: "Not Deleted".into(),
            }),
            operation_complete: Notify::new(),
            computations: Mutex::new(HashMap::new()),
            log_level: AtomicI32::new(log_level),
            last_activity_secs: AtomicI64::new(chrono::Utc::now().timestamp()),
            expiration: Mutex::new(None),
        })
    }

    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.lock_state().state
    }

    /// Anything but Defunct.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state() != SessionState::Defunct
    }

    #[must_use]
    pub fn delete_reason(&self) -> String {
        self.lock_state().delete_reason.clone()
    }

    #[must_use]
    pub fn get_computation(&self, id: Uuid) -> Option<Arc<Computation>> {
        if id.is_nil() {
            return None;
        }
        self.lock_computations().get(&id).cloned()
    }

    /// Status object: session state plus per-computation status.
    #[must_use]
    pub fn get_status(&self) -> Value {
        let mut comps = serde_json::Map::new();
        for computation in self.lock_computations().values() {
            comps.insert(computation.name().to_owned(), computation.status());
        }
        serde_json::json!({
            "state": self.state().name(),
            "computations": comps,
        })
    }

    /// Performance object: per-computation rolling counters.
    #[must_use]
    pub fn get_performance_stats(&self) -> Value {
        let mut comps = serde_json::Map::new();
        for computation in self.lock_computations().values() {
            comps.insert(computation.name().to_owned(), computation.performance());
        }
        serde_json::json!({ "computations": comps })
    }

    /// Most recent activity, optionally folding in computation heartbeats.
    #[must_use]
    pub fn last_activity_secs(&self, include_computations: bool) -> i64 {
        let mut latest = self.last_activity_secs.load(Ordering::Acquire);
        if include_computations {
            for computation in self.lock_computations().values() {
                latest = latest.max(computation.last_activity_secs());
            }
        }
        latest
    }

    // ── Signals ─────────────────────────────────────────────────────────

    /// Deliver a signal (`run` or `engineReady`) to the session.
    ///
    /// # Errors
    ///
    /// `NodeError::Conflict` while an operation is in flight or the
    /// session is defunct.
    pub fn signal(&self, signal_data: &Value) -> Result<()> {
        self.check_is_free()?;
        let status = signal_data
            .get("status")
            .and_then(Value::as_str)
            .unwrap_or_default();
        debug!(session_id = %self.id, status, "session signal");

        match status {
            "run" => {
                // "run" goes to every computation; it may also carry new
                // client routing for the router
                for computation in self.lock_computations().values() {
                    computation.signal(signal_data);
                }
                if signal_data.get("routing").is_some_and(|r| !r.is_null()) {
                    self.controller.update_session(self.id, signal_data);
                }
            }
            "engineReady" => self.controller.signal_engine_ready(self.id),
            _ => {
                warn!(session_id = %self.id, signal = %signal_data,
                    "unknown signal received");
            }
        }
        self.touch();
        Ok(())
    }

    // ── Operations ──────────────────────────────────────────────────────

    /// Start an asynchronous create/modify operation.
    ///
    /// # Errors
    ///
    /// `NodeError::BadRequest` on an id mismatch, `NodeError::Conflict`
    /// when the session is busy or defunct, `NodeError::Session` when it
    /// is shutting down.
    pub fn async_update_config(self: &Arc<Self>, config: Arc<SessionConfig>) -> Result<()> {
        if self.id != config.session_id() {
            return Err(NodeError::BadRequest(
                "config session id did not match session object".into(),
            ));
        }
        if self.node_id != config.node_id() {
            return Err(NodeError::BadRequest(
                "config node id did not match session object".into(),
            ));
        }
        self.begin_operation("modified")?;

        let session = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(err) = session.apply_new_config(&config).await {
                session.events.push(NodeEvent::SessionOperationFailed {
                    session_id: session.id,
                    reason: err.to_string(),
                });
                error!(session_id = %session.id, %err, "session operation failed");
            }
            let mut state = session.lock_state();
            if state.state == SessionState::Busy {
                state.state = SessionState::Free;
            }
            drop(state);
            session.operation_complete.notify_waiters();
        });
        Ok(())
    }

    /// Start an asynchronous delete operation.
    ///
    /// # Errors
    ///
    /// `NodeError::Conflict` when busy or already defunct,
    /// `NodeError::Session` when shutting down.
    pub fn async_delete(self: &Arc<Self>, reason: &str) -> Result<()> {
        self.begin_operation("deleted")?;
        let deadline = tokio::time::Instant::now() + WAIT_FOR_SHUTDOWN_TIMEOUT;
        let session = Arc::clone(self);
        let reason = reason.to_owned();
        tokio::spawn(async move {
            session.delete_proc(&reason, deadline).await;
        });
        Ok(())
    }

    /// Synchronous shutdown, used when the node itself is going down.
    ///
    /// Waits for any in-flight operation, then stops every computation.
    ///
    /// # Errors
    ///
    /// `NodeError::Session` when an in-flight operation does not finish
    /// within the shutdown window.
    pub async fn sync_shutdown(self: &Arc<Self>, reason: &str) -> Result<()> {
        debug!(session_id = %self.id, "shutting down session");
        let deadline = tokio::time::Instant::now() + WAIT_FOR_SHUTDOWN_TIMEOUT;

        // block new operations, then wait out the current one
        loop {
            let notified = self.operation_complete.notified();
            {
                let mut state = self.lock_state();
                state.shutting_down = true;
                if state.state != SessionState::Busy {
                    break;
                }
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(NodeError::Session("session shutdown took too long".into()));
            }
        }

        self.delete_proc(reason, deadline).await;
        debug!(session_id = %self.id, "have shut down session");
        Ok(())
    }

    fn begin_operation(&self, verb: &str) -> Result<()> {
        let mut state = self.lock_state();
        if state.shutting_down {
            return Err(NodeError::Session("session is shutting down".into()));
        }
        match state.state {
            SessionState::Busy => Err(NodeError::Conflict(format!(
                "session is busy and cannot be {verb}"
            ))),
            SessionState::Defunct => Err(NodeError::Conflict(format!(
                "session is defunct and cannot be {verb}"
            ))),
            SessionState::Free => {
                state.state = SessionState::Busy;
                drop(state);
                self.touch();
                Ok(())
            }
        }
    }

    fn check_is_free(&self) -> Result<()> {
        match self.lock_state().state {
            SessionState::Busy => Err(NodeError::Conflict("session is busy".into())),
            SessionState::Defunct => Err(NodeError::Conflict("session is defunct".into())),
            SessionState::Free => Ok(()),
        }
    }

    async fn delete_proc(self: &Arc<Self>, reason: &str, deadline: tokio::time::Instant) {
        let computations: Vec<Arc<Computation>> =
            self.lock_computations().values().cloned().collect();

        for computation in &computations {
            computation.shutdown();
        }
        for computation in &computations {
            if !computation.wait_until_shutdown(deadline).await {
                error!(session_id = %self.id, name = %computation.name(),
                    computation = %computation.id(), "cannot stop computation");
            }
        }

        self.controller.shutdown_session(self.id, reason);

        {
            let mut state = self.lock_state();
            state.state = SessionState::Defunct;
            state.delete_reason = reason.to_owned();
        }
        self.stop_expiration();
        self.operation_complete.notify_waiters();
    }

    /// Apply a new configuration: stop computations that fell out of the
    /// set, then start the ones that appeared. Existing computations are
    /// untouched.
    async fn apply_new_config(self: &Arc<Self>, config: &SessionConfig) -> Result<()> {
        self.log_level.store(
            config.log_level().unwrap_or(self.defaults.log_level),
            Ordering::Release,
        );

        let (removed, added) = self.config_delta(config);

        for computation in &removed {
            computation.shutdown();
        }
        // wait for removed computations to exit so their resources are
        // free for the new ones
        let deadline = tokio::time::Instant::now() + WAIT_FOR_SHUTDOWN_TIMEOUT;
        for computation in &removed {
            if !computation.wait_until_shutdown(deadline).await {
                error!(session_id = %self.id, name = %computation.name(),
                    computation = %computation.id(), "cannot stop computation");
                return Err(NodeError::Session(
                    "computations did not shutdown within timeout".into(),
                ));
            }
        }
        {
            let mut computations = self.lock_computations();
            for computation in &removed {
                computations.remove(&computation.id());
                self.process_manager.remove_process(computation.id());
            }
        }

        for (comp_id, comp_name) in added {
            self.start_new_computation(comp_id, &comp_name, config)
                .await?;
        }
        Ok(())
    }

    /// Existing computations absent from the new config, and new
    /// computations not running yet.
    fn config_delta(&self, config: &SessionConfig) -> (Vec<Arc<Computation>>, Vec<(Uuid, String)>) {
        let computations = self.lock_computations();
        let removed = computations
            .iter()
            .filter(|(id, _)| !config.computations().contains_key(id))
            .map(|(_, comp)| Arc::clone(comp))
            .collect();
        let added = config
            .computations()
            .iter()
            .filter(|(id, _)| !computations.contains_key(id))
            .map(|(id, name)| (*id, name.clone()))
            .collect();
        (removed, added)
    }

    async fn start_new_computation(
        self: &Arc<Self>,
        comp_id: Uuid,
        comp_name: &str,
        config: &SessionConfig,
    ) -> Result<()> {
        debug!(session_id = %self.id, computation = %comp_id, name = comp_name,
            "launching computation");

        let definition = config.definition(comp_name);
        if definition.is_null() {
            error!(session_id = %self.id, name = comp_name,
                "cannot start computation: definition not present in config");
            return Err(NodeError::Session(format!(
                "missing definition for {comp_name}"
            )));
        }

        let context_name = ComputationConfig::fetch_context_name(definition);
        let context = if context_name.is_empty() {
            &Value::Null
        } else {
            config.context(&context_name)
        };
        if !context_name.is_empty() && context.is_null() {
            error!(session_id = %self.id, name = comp_name, context = %context_name,
                "cannot start computation: named context does not exist");
            return Err(NodeError::Session(format!(
                "missing named context for {comp_name}"
            )));
        }

        let mut comp_config = ComputationConfig::new(comp_id, self.node_id, self.id, comp_name);
        comp_config.set_definition(
            definition,
            context,
            self.log_level.load(Ordering::Acquire),
            &self.defaults,
            self.process_manager.pool_mb(),
        );
        comp_config.add_routing(config.routing());
        comp_config
            .apply_packaging(definition, context, &self.defaults)
            .await?;
        comp_config.write_exec_config_file()?;

        let process = self
            .process_manager
            .add_process(comp_id, comp_name, self.id);
        let computation = Arc::new(Computation::new(
            process,
            Arc::clone(&self.controller),
            Arc::clone(&self.events),
        ));
        computation.start(comp_config.into_spawn_args())?;

        self.lock_computations().insert(comp_id, computation);
        Ok(())
    }

    // ── Client-connect expiration ───────────────────────────────────────

    /// Arm the entry-node expiration: unless a client connects within
    /// `window`, emit a `sessionExpired` event. Arrival of the client
    /// cancels the deadline via [`Self::stop_expiration`].
    pub fn set_expiration(self: &Arc<Self>, window: Duration, message: &str) {
        self.stop_expiration();
        let token = CancellationToken::new();
        *self
            .expiration
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(token.clone());

        let session = Arc::clone(self);
        let message = message.to_owned();
        tokio::spawn(async move {
            tokio::select! {
                () = token.cancelled() => {}
                () = tokio::time::sleep(window) => {
                    warn!(session_id = %session.id, message = %message, "session expired");
                    session.events.push(NodeEvent::SessionExpired {
                        session_id: session.id,
                        reason: message,
                    });
                }
            }
        });
    }

    /// Cancel any pending expiration without terminating the session.
    pub fn stop_expiration(&self) {
        if let Some(token) = self
            .expiration
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take()
        {
            token.cancel();
        }
    }

    fn touch(&self) {
        self.last_activity_secs
            .store(chrono::Utc::now().timestamp(), Ordering::Release);
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, StateCell> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn lock_computations(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, Arc<Computation>>> {
        self.computations
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}
