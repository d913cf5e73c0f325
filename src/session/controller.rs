//! Agent-side control channel to the router.
//!
//! One Unix-domain connection, registered as the CONTROL peer. Outbound
//! messages (routing data, control commands, client kicks) go through a
//! queue so callers never block on the socket; inbound messages from the
//! router are dispatched here: routing acknowledgements wake waiting
//! session operations, computation status and client status become
//! coordinator events, and heartbeats update per-computation stats.
//!
//! Loss of this connection is fatal for the node: it surfaces as a
//! `shutdownWithError` event that triggers an orderly shutdown.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::UnixStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::http::events::{EventQueue, NodeEvent};
use crate::protocol::messages::{
    ClientConnectionStatusMessage, ControlMessage, RoutingAction, SessionRoutingDataMessage,
};
use crate::protocol::transport::{BoxedRead, BoxedWrite};
use crate::protocol::{
    registration, Address, Connection, Content, Envelope, FrameCodec, PeerClass, Registration,
    SocketStream,
};
use crate::session::manager::Sessions;
use crate::{NodeError, Result};

/// Bound on the router acknowledging new session routing data.
pub const ROUTER_ACK_TIMEOUT: Duration = Duration::from_secs(10);

/// Bound on the router reporting its message port after connect.
const ROUTER_PORT_TIMEOUT: Duration = Duration::from_secs(10);

/// The agent's control-plane link to the router.
pub struct RouterController {
    node_id: Uuid,
    events: Arc<EventQueue>,
    send_tx: mpsc::UnboundedSender<Envelope>,
    port_tx: watch::Sender<u16>,
    acks: Mutex<HashMap<Uuid, oneshot::Sender<()>>>,
    sessions: Mutex<Weak<Sessions>>,
    exiting: AtomicBool,
    cancel: CancellationToken,
}

impl RouterController {
    /// Connect to the router's IPC socket and register as CONTROL.
    ///
    /// Blocks until the router reports its message port, bounded by 10 s.
    ///
    /// # Errors
    ///
    /// `NodeError::Transport` when the connection or handshake fails.
    pub async fn connect(
        node_id: Uuid,
        ipc_path: &Path,
        events: Arc<EventQueue>,
        cancel: CancellationToken,
    ) -> Result<Arc<Self>> {
        let stream = UnixStream::connect(ipc_path)
            .await
            .map_err(|err| NodeError::Transport(format!("cannot connect to router: {err}")))?;
        let mut stream = SocketStream::Unix(stream);

        let mut reg = Registration::new(PeerClass::Control);
        reg.node_id = node_id;
        registration::write_registration(&mut stream, &reg).await?;

        let Connection { reader, writer } = Connection::new(stream);
        let (send_tx, send_rx) = mpsc::unbounded_channel();
        let (port_tx, mut port_rx) = watch::channel(0u16);

        let controller = Arc::new(Self {
            node_id,
            events,
            send_tx,
            port_tx,
            acks: Mutex::new(HashMap::new()),
            sessions: Mutex::new(Weak::new()),
            exiting: AtomicBool::new(false),
            cancel,
        });

        tokio::spawn(Arc::clone(&controller).writer_task(writer, send_rx));
        tokio::spawn(Arc::clone(&controller).reader_task(reader));

        // the node cannot register until it knows the router's message port
        let wait_port = async {
            while *port_rx.borrow() == 0 {
                port_rx
                    .changed()
                    .await
                    .map_err(|_| NodeError::Transport("router connection closed".into()))?;
            }
            Ok::<(), NodeError>(())
        };
        tokio::time::timeout(ROUTER_PORT_TIMEOUT, wait_port)
            .await
            .map_err(|_| {
                NodeError::Transport(
                    "did not receive message port from router within timeout".into(),
                )
            })??;

        Ok(controller)
    }

    /// Late-bind the session container; needed for heartbeat and client
    /// connection dispatch.
    pub fn attach_sessions(&self, sessions: &Arc<Sessions>) {
        *self
            .sessions
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Arc::downgrade(sessions);
    }

    /// TCP port the router listens on for cross-host messages.
    #[must_use]
    pub fn router_port(&self) -> u16 {
        *self.port_tx.subscribe().borrow()
    }

    /// Mark the controller as exiting so connection loss is not an error.
    pub fn stop(&self) {
        self.exiting.store(true, Ordering::Release);
        self.cancel.cancel();
    }

    // ── Outbound ────────────────────────────────────────────────────────

    /// Register a session's routing data with the router and block for
    /// the acknowledgement, bounded by [`ROUTER_ACK_TIMEOUT`].
    ///
    /// # Errors
    ///
    /// `NodeError::Session` when the router does not acknowledge in time.
    pub async fn initialize_session(&self, session_id: Uuid, routing: &Value) -> Result<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.acks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(session_id, ack_tx);

        self.send_routing(RoutingAction::Initialize, session_id, routing.to_string());

        match tokio::time::timeout(ROUTER_ACK_TIMEOUT, ack_rx).await {
            Ok(Ok(())) => Ok(()),
            _ => {
                self.acks
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner)
                    .remove(&session_id);
                Err(NodeError::Session(
                    "router did not acknowledge session routing data".into(),
                ))
            }
        }
    }

    /// Push updated routing (client addresser rules) for a running session.
    pub fn update_session(&self, session_id: Uuid, signal_data: &Value) {
        let routing = signal_data.get("routing").cloned().unwrap_or(Value::Null);
        self.send_routing(RoutingAction::Update, session_id, routing.to_string());
    }

    /// Ask the router to drop routing data and disconnect the client.
    pub fn shutdown_session(&self, session_id: Uuid, reason: &str) {
        self.kick_client(session_id, reason, reason);
        self.send_routing(RoutingAction::Delete, session_id, String::new());
    }

    /// Ask the router to disconnect a session's client.
    ///
    /// Used on session delete, but also when a client connects to a
    /// defunct or unknown session; connection-just-after-deletion is
    /// arranged to look like deletion-just-after-connection, with the
    /// difference visible only in `disconnectReason`.
    pub fn kick_client(&self, session_id: Uuid, disconnect_reason: &str, stopped_reason: &str) {
        let status = serde_json::json!({
            "disconnectReason": disconnect_reason,
            "execStatus": "stopped",
            "execStoppedReason": stopped_reason,
        });
        self.send(Envelope::from_content(Content::ClientConnectionStatus(
            ClientConnectionStatusMessage {
                session_id,
                reason: disconnect_reason.to_owned(),
                session_status: status.to_string(),
            },
        )));
    }

    /// Send a control command (`go`, `update`, `stop`) to a computation.
    pub fn send_control(
        &self,
        computation_id: Uuid,
        session_id: Uuid,
        command: &str,
        data: Option<&Value>,
    ) {
        debug!(session_id = %session_id, computation = %computation_id, command,
            "sending control to computation");
        let envelope = Envelope::from_content(Content::Control(ControlMessage {
            command: command.to_owned(),
            data: data.map(Value::to_string).unwrap_or_default(),
        }))
        .with_to(vec![Address::new(session_id, self.node_id, computation_id)]);
        self.send(envelope);
    }

    /// Tell the session's client that the engine is ready.
    pub fn signal_engine_ready(&self, session_id: Uuid) {
        let envelope = Envelope::from_content(Content::EngineReady)
            .with_to(vec![Address::client(session_id)]);
        self.send(envelope);
    }

    fn send_routing(&self, action: RoutingAction, session_id: Uuid, routing_data: String) {
        self.send(Envelope::from_content(Content::RoutingData(
            SessionRoutingDataMessage {
                action,
                session_id,
                routing_data,
            },
        )));
    }

    fn send(&self, envelope: Envelope) {
        if self.send_tx.send(envelope).is_err() {
            warn!("router control channel closed; message dropped");
        }
    }

    // ── Inbound ─────────────────────────────────────────────────────────

    async fn writer_task(
        self: Arc<Self>,
        mut writer: FramedWrite<BoxedWrite, FrameCodec>,
        mut send_rx: mpsc::UnboundedReceiver<Envelope>,
    ) {
        loop {
            tokio::select! {
                biased;

                () = self.cancel.cancelled() => break,

                envelope = send_rx.recv() => {
                    let Some(envelope) = envelope else { break };
                    if let Err(err) = writer.send(envelope).await {
                        warn!(%err, "write to router failed");
                        self.connection_lost();
                        break;
                    }
                }
            }
        }
    }

    async fn reader_task(self: Arc<Self>, mut reader: FramedRead<BoxedRead, FrameCodec>) {
        loop {
            tokio::select! {
                biased;

                () = self.cancel.cancelled() => break,

                item = reader.next() => {
                    match item {
                        None => {
                            self.connection_lost();
                            break;
                        }
                        Some(Err(err)) => {
                            warn!(%err, "error reading from router");
                            self.connection_lost();
                            break;
                        }
                        Some(Ok(mut envelope)) => {
                            if let Err(err) = envelope.deserialize_content() {
                                warn!(%err, "malformed message from router");
                                continue;
                            }
                            self.handle_message(&envelope);
                        }
                    }
                }
            }
        }
    }

    fn connection_lost(&self) {
        if self.exiting.swap(true, Ordering::AcqRel) {
            return;
        }
        error!("lost router connection");
        self.events.push(NodeEvent::ShutdownWithError {
            reason: "Lost router connection".into(),
        });
    }

    fn handle_message(self: &Arc<Self>, envelope: &Envelope) {
        debug!(message = %envelope.describe(), "received from router");
        match envelope.content() {
            Some(Content::RouterInfo(info)) => {
                let _ = self.port_tx.send(info.message_port);
            }

            Some(Content::RoutingData(msg)) => {
                if msg.action == RoutingAction::Acknowledge {
                    let ack = self
                        .acks
                        .lock()
                        .unwrap_or_else(std::sync::PoisonError::into_inner)
                        .remove(&msg.session_id);
                    if let Some(ack) = ack {
                        let _ = ack.send(());
                    }
                } else {
                    error!(session_id = %msg.session_id, action = ?msg.action,
                        "expected routing acknowledge from router");
                }
            }

            Some(Content::ComputationStatus(msg)) => {
                // the status is nominally always "ready"; don't guess at
                // anything else
                if msg.status == "ready" || msg.status.is_empty() {
                    self.events.push(NodeEvent::ComputationReady {
                        session_id: msg.session_id,
                        computation_id: msg.computation_id,
                    });
                } else {
                    warn!(session_id = %msg.session_id, status = %msg.status,
                        "ignoring computation status with unexpected value");
                }
            }

            Some(Content::ClientConnectionStatus(msg)) => {
                self.handle_client_status(msg);
            }

            Some(Content::Heartbeat(heartbeat)) => {
                let from = envelope.metadata.from;
                if let Some(sessions) = self.sessions() {
                    if let Some(computation) =
                        sessions.get_computation(from.session, from.computation)
                    {
                        computation.on_heartbeat(heartbeat);
                    }
                }
            }

            _ => {
                warn!(class_id = %envelope.class_id, "unexpected message from router");
            }
        }
    }

    fn handle_client_status(self: &Arc<Self>, msg: &ClientConnectionStatusMessage) {
        if msg.reason == "connected" {
            debug!(session_id = %msg.session_id, "client has connected to session");
            let session = self.sessions().and_then(|s| s.get_session(msg.session_id));
            match session {
                Some(session) if session.is_active() => {
                    // entry-node sessions expire when no client connects in
                    // time; the client is here now
                    session.stop_expiration();
                }
                Some(session) => {
                    self.kick_client(msg.session_id, "sessionDeleted", &session.delete_reason());
                }
                None => {
                    self.kick_client(msg.session_id, "unknownSession", "unknownSession");
                }
            }
        } else {
            // client went away; the coordinator usually deletes the session
            self.events.push(NodeEvent::SessionClientDisconnected {
                session_id: msg.session_id,
                reason: msg.reason.clone(),
            });
        }
    }

    fn sessions(&self) -> Option<Arc<Sessions>> {
        self.sessions
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .upgrade()
    }
}
