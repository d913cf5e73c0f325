//! The container of all sessions on this host.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::computation::Computation;
use super::config::SessionConfig;
use super::controller::RouterController;
use super::session::Session;
use crate::config::ComputationDefaults;
use crate::http::events::EventQueue;
use crate::supervisor::ProcessManager;
use crate::{NodeError, Result};

/// All sessions on this host, keyed by session id.
///
/// Defunct sessions linger for late status queries; their ids become
/// reusable, so a create for an id whose previous session is defunct
/// replaces the old record.
pub struct Sessions {
    node_id: Uuid,
    defaults: ComputationDefaults,
    process_manager: Arc<ProcessManager>,
    controller: Arc<RouterController>,
    events: Arc<EventQueue>,
    sessions: Mutex<HashMap<Uuid, Arc<Session>>>,
    closed: AtomicBool,
    start_time_secs: i64,
}

impl Sessions {
    #[must_use]
    pub fn new(
        node_id: Uuid,
        defaults: ComputationDefaults,
        process_manager: Arc<ProcessManager>,
        controller: Arc<RouterController>,
        events: Arc<EventQueue>,
    ) -> Arc<Self> {
        let sessions = Arc::new(Self {
            node_id,
            defaults,
            process_manager,
            controller,
            events,
            sessions: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
            start_time_secs: chrono::Utc::now().timestamp(),
        });
        sessions.controller.attach_sessions(&sessions);
        sessions
    }

    #[must_use]
    pub fn controller(&self) -> &Arc<RouterController> {
        &self.controller
    }

    /// Refuse new and modified sessions from now on.
    pub fn set_closed(&self, closed: bool) {
        self.closed.store(closed, Ordering::Release);
    }

    #[must_use]
    pub fn get_session(&self, id: Uuid) -> Option<Arc<Session>> {
        self.lock().get(&id).cloned()
    }

    #[must_use]
    pub fn get_computation(&self, session_id: Uuid, id: Uuid) -> Option<Arc<Computation>> {
        self.get_session(session_id)
            .and_then(|session| session.get_computation(id))
    }

    /// Ids of all non-defunct sessions.
    #[must_use]
    pub fn active_session_ids(&self) -> Vec<Uuid> {
        self.lock()
            .values()
            .filter(|s| s.is_active())
            .map(|s| s.id())
            .collect()
    }

    /// Status object for one session.
    ///
    /// # Errors
    ///
    /// `NodeError::NotFound` for an unknown id.
    pub fn get_status(&self, session_id: Uuid) -> Result<Value> {
        self.get_session(session_id)
            .map(|s| s.get_status())
            .ok_or_else(|| NodeError::NotFound("session does not exist".into()))
    }

    /// Performance object for one session.
    ///
    /// # Errors
    ///
    /// `NodeError::NotFound` for an unknown id.
    pub fn get_performance(&self, session_id: Uuid) -> Result<Value> {
        self.get_session(session_id)
            .map(|s| s.get_performance_stats())
            .ok_or_else(|| NodeError::NotFound("session does not exist".into()))
    }

    /// Deliver a `run`/`engineReady` signal.
    ///
    /// # Errors
    ///
    /// `NodeError::NotFound` for an unknown id, `NodeError::Conflict`
    /// while the session is busy.
    pub fn signal_session(&self, session_id: Uuid, signal_data: &Value) -> Result<()> {
        self.get_session(session_id)
            .ok_or_else(|| NodeError::NotFound("session does not exist".into()))?
            .signal(signal_data)
    }

    /// Create a session from a definition and start spawning its
    /// computations.
    ///
    /// Registration with the router completes before this returns; the
    /// spawns continue on the session's operation task, reporting
    /// failures as `sessionOperationFailed` events without rolling back
    /// already-started siblings.
    ///
    /// # Errors
    ///
    /// `NodeError::Conflict` when the node is closed or the session
    /// already exists; `NodeError::Session` when the router does not
    /// acknowledge the routing data.
    pub async fn create_session(self: &Arc<Self>, definition: Value) -> Result<Value> {
        if self.closed.load(Ordering::Acquire) {
            return Err(NodeError::Conflict(
                "node is closed : cannot accept new sessions".into(),
            ));
        }

        let config = Arc::new(SessionConfig::parse(definition, self.node_id)?);
        let id = config.session_id();
        info!(session_id = %id, "creating session");

        let session = {
            let mut sessions = self.lock();
            if let Some(existing) = sessions.get(&id) {
                if existing.is_active() {
                    return Err(NodeError::Conflict("session already exists".into()));
                }
                // defunct record from an earlier life of this id
                sessions.remove(&id);
            }
            let session = Session::new(
                id,
                self.node_id,
                self.defaults.clone(),
                Arc::clone(&self.process_manager),
                Arc::clone(&self.controller),
                Arc::clone(&self.events),
            );
            sessions.insert(id, Arc::clone(&session));
            session
        };

        if let Err(err) = self
            .controller
            .initialize_session(id, config.routing())
            .await
        {
            self.lock().remove(&id);
            warn!(session_id = %id, %err, "failed to initialize session with router");
            return Err(NodeError::Internal(
                "failed to initialize session with node router".into(),
            ));
        }

        if config.is_entry_node() {
            debug!(session_id = %id, "this node is session entry node");
            // only sessions whose client never shows up in reasonable
            // time expire; the client connecting interrupts the deadline
            session.set_expiration(
                std::time::Duration::from_secs(self.defaults.client_connection_timeout_secs),
                "Client failed to connect",
            );
        }

        debug!(session_id = %id, "about to spawn computations");
        if let Err(err) = session.async_update_config(Arc::clone(&config)) {
            self.lock().remove(&id);
            return Err(err);
        }
        Ok(config.response().clone())
    }

    /// Modify an existing session toward a new definition.
    ///
    /// # Errors
    ///
    /// `NodeError::NotFound` for an unknown id, `NodeError::Conflict`
    /// when the node is closed or the session is busy.
    pub fn modify_session(&self, definition: Value) -> Result<Value> {
        if self.closed.load(Ordering::Acquire) {
            return Err(NodeError::Conflict(
                "node is closed : cannot modify sessions".into(),
            ));
        }
        let config = Arc::new(SessionConfig::parse(definition, self.node_id)?);
        let id = config.session_id();
        info!(session_id = %id, "modifying session");
        let session = self
            .get_session(id)
            .ok_or_else(|| NodeError::NotFound("session doesn't exist".into()))?;
        session.async_update_config(Arc::clone(&config))?;
        Ok(config.response().clone())
    }

    /// Delete a session; `reason` is arbitrary text used for logging and
    /// the client's stopped status.
    ///
    /// The record stays in the map, marked Defunct, for late status
    /// queries.
    ///
    /// # Errors
    ///
    /// `NodeError::NotFound` for an unknown id, `NodeError::Conflict`
    /// while an operation is in flight.
    pub fn delete_session(&self, id: Uuid, reason: &str) -> Result<()> {
        let session = self
            .get_session(id)
            .ok_or_else(|| NodeError::NotFound("session doesn't exist".into()))?;
        info!(session_id = %id, reason, "deleting session");
        session.async_delete(reason)
    }

    /// Most recent activity across all sessions.
    #[must_use]
    pub fn last_activity_secs(&self, include_computations: bool) -> i64 {
        self.lock()
            .values()
            .map(|s| s.last_activity_secs(include_computations))
            .max()
            .unwrap_or(0)
    }

    /// Idle timings for the status endpoint.
    #[must_use]
    pub fn get_idle_status(&self) -> Value {
        let now = chrono::Utc::now().timestamp();
        let mut most_recent = self.start_time_secs;
        let mut entries = Vec::new();
        for session in self.lock().values() {
            let activity = session.last_activity_secs(true);
            most_recent = most_recent.max(activity);
            entries.push(serde_json::json!({
                "id": session.id().to_string(),
                "idletime": now - activity,
            }));
        }
        serde_json::json!({
            "sessions": entries,
            "idletime": now - most_recent,
        })
    }

    /// Shut down every session sequentially, so terminations don't pile
    /// up, and refuse anything new.
    pub async fn shutdown_all(&self, reason: &str) {
        debug!("shutting down all sessions");
        self.set_closed(true);
        let sessions: Vec<Arc<Session>> = self.lock().values().cloned().collect();
        for session in sessions {
            if let Err(err) = session.sync_shutdown(reason).await {
                warn!(session_id = %session.id(), %err, "failed to shutdown session");
            }
        }
        debug!("have shut down all sessions");
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, Arc<Session>>> {
        self.sessions
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}
