//! Router core: accept loops, the new-connection filter chain, per-peer
//! send/receive tasks, and routing decisions.
//!
//! The router never unwinds on a peer failure: the failing peer is flagged
//! and destroyed on the accept loop's next sweep. Only loss of the agent's
//! control connection shuts the router down.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{FutureExt, SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream, UnixListener};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::peer::Peer;
use super::peers::PeerRegistry;
use super::routing::{RoutingTable, SessionRoutingData};
use crate::protocol::messages::{
    ClientConnectionStatusMessage, ComputationStatusMessage, ExecutorHeartbeat, RouterInfoMessage,
    RoutingAction, SessionStatusMessage, CONTROL_ID, EXECUTOR_HEARTBEAT_ID,
};
use crate::protocol::transport::{BoxedRead, BoxedWrite};
use crate::protocol::{
    registration, Address, Connection, Content, Envelope, FrameCodec, PeerClass, Registration,
    SocketStream,
};
use crate::{NodeError, Result};

/// Accept loop wakes at least this often to sweep destroyed peers.
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Peers accepted per listener in one loop round.
const ACCEPT_BATCH: usize = 32;

/// Bound on flushing a kicked client's queue before disconnecting it.
const KICK_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Bound on dialing a remote node.
const NODE_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// The in-host message router.
pub struct NodeRouter {
    node_id: Uuid,
    message_port: u16,
    registry: PeerRegistry,
    routing: RoutingTable,
    /// Serializes node-peer creation so simultaneous dial/accept cannot
    /// produce two records for one node.
    node_connect_lock: Mutex<()>,
    control_tx: mpsc::UnboundedSender<Envelope>,
    control_rx: Mutex<Option<mpsc::UnboundedReceiver<Envelope>>>,
    destroy_tx: mpsc::UnboundedSender<Arc<Peer>>,
    destroy_rx: Mutex<Option<mpsc::UnboundedReceiver<Arc<Peer>>>>,
    cancel: CancellationToken,
}

impl NodeRouter {
    /// Bind both listeners and start the router tasks.
    ///
    /// `tcp_port` 0 lets the OS pick; the chosen port is reported to the
    /// agent in a router-info message when it connects.
    ///
    /// # Errors
    ///
    /// `NodeError::Io` when a listener cannot be bound.
    pub async fn start(node_id: Uuid, tcp_port: u16, ipc_path: &Path) -> Result<Arc<Self>> {
        let tcp = TcpListener::bind(("0.0.0.0", tcp_port)).await?;
        let message_port = tcp.local_addr()?.port();

        // the socket file must not pre-exist, and computations expect 0700
        let _ = std::fs::remove_file(ipc_path);
        let unix = UnixListener::bind(ipc_path)?;
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(ipc_path, std::fs::Permissions::from_mode(0o700))?;
        }

        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (destroy_tx, destroy_rx) = mpsc::unbounded_channel();
        let router = Arc::new(Self {
            node_id,
            message_port,
            registry: PeerRegistry::new(),
            routing: RoutingTable::new(),
            node_connect_lock: Mutex::new(()),
            control_tx,
            control_rx: Mutex::new(Some(control_rx)),
            destroy_tx,
            destroy_rx: Mutex::new(Some(destroy_rx)),
            cancel: CancellationToken::new(),
        });

        info!(node_id = %node_id, port = message_port, ipc = %ipc_path.display(),
            "router listening");

        tokio::spawn(Arc::clone(&router).accept_loop(tcp, unix));
        tokio::spawn(Arc::clone(&router).control_pump());
        Ok(router)
    }

    #[must_use]
    pub fn node_id(&self) -> Uuid {
        self.node_id
    }

    #[must_use]
    pub fn message_port(&self) -> u16 {
        self.message_port
    }

    #[must_use]
    pub fn registry(&self) -> &PeerRegistry {
        &self.registry
    }

    #[must_use]
    pub fn routing_table(&self) -> &RoutingTable {
        &self.routing
    }

    /// Request an orderly router exit.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Resolves when the router has shut down.
    pub async fn wait(&self) {
        self.cancel.cancelled().await;
    }

    // ── Accept loop ─────────────────────────────────────────────────────

    async fn accept_loop(self: Arc<Self>, tcp: TcpListener, unix: UnixListener) {
        let mut destroy_rx = self
            .destroy_rx
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take()
            .expect("accept loop started twice");
        let mut tick = tokio::time::interval(ACCEPT_POLL_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            // destroy any peers which have disconnected or been kicked
            while let Ok(peer) = destroy_rx.try_recv() {
                self.destroy_peer(&peer);
            }

            tokio::select! {
                biased;

                () = self.cancel.cancelled() => {
                    info!("router accept loop shutting down");
                    break;
                }

                _ = tick.tick() => {}

                accepted = tcp.accept() => {
                    match accepted {
                        Ok((stream, addr)) => {
                            debug!(%addr, "inbound tcp connection");
                            self.clone().spawn_negotiation(SocketStream::Tcp(stream));
                            self.batch_accept_tcp(&tcp);
                        }
                        Err(err) => warn!(%err, "tcp accept failed"),
                    }
                }

                accepted = unix.accept() => {
                    match accepted {
                        Ok((stream, _)) => {
                            debug!("inbound ipc connection");
                            self.clone().spawn_negotiation(SocketStream::Unix(stream));
                            self.batch_accept_unix(&unix);
                        }
                        Err(err) => warn!(%err, "ipc accept failed"),
                    }
                }
            }
        }
    }

    fn batch_accept_tcp(self: &Arc<Self>, listener: &TcpListener) {
        for _ in 1..ACCEPT_BATCH {
            match listener.accept().now_or_never() {
                Some(Ok((stream, _))) => {
                    self.clone().spawn_negotiation(SocketStream::Tcp(stream));
                }
                _ => break,
            }
        }
    }

    fn batch_accept_unix(self: &Arc<Self>, listener: &UnixListener) {
        for _ in 1..ACCEPT_BATCH {
            match listener.accept().now_or_never() {
                Some(Ok((stream, _))) => {
                    self.clone().spawn_negotiation(SocketStream::Unix(stream));
                }
                _ => break,
            }
        }
    }

    fn destroy_peer(&self, peer: &Arc<Peer>) {
        peer.shutdown();
        if let Some((class, id)) = self.registry.destroy(peer) {
            debug!(class = class.name(), %id, "destroyed peer");
        }
        if peer.class == PeerClass::Client {
            // drop anything still stashed for a client that never came back
            self.registry.clear_stashed(peer.session_id);
        }
    }

    // ── New-connection filter chain ─────────────────────────────────────

    fn spawn_negotiation(self: Arc<Self>, stream: SocketStream) {
        tokio::spawn(async move {
            let mut stream = stream;
            let reg = match registration::read_registration(&mut stream).await {
                Ok(reg) => reg,
                Err(err) => {
                    error!(%err, "refusing connection: bad registration");
                    return;
                }
            };
            match reg.class {
                PeerClass::Client => self.filter_client(&reg, stream),
                PeerClass::Node => self.filter_node(&reg, stream),
                PeerClass::Executor => self.filter_executor(&reg, stream),
                PeerClass::Control => self.filter_control(&reg, stream),
            }
        });
    }

    fn filter_client(self: &Arc<Self>, reg: &Registration, stream: SocketStream) {
        let session_id = reg.session_id;
        if self.registry.find_client(session_id).is_some() {
            error!(session_id = %session_id,
                "refusing client connection because one already exists for the session");
            return;
        }

        let routing = self.routing.get(session_id);
        if routing.is_none() {
            // unless something is terribly wrong this is a client connecting
            // after the session has already shut down. Allow the connection
            // so the shutdown status can be sent back; with no routing data,
            // incoming messages from the client are ignored.
            debug!(session_id = %session_id, "client for unknown session accepted temporarily");
        } else {
            debug!(session_id = %session_id, "handshake succeeded for client");
        }

        let peer = Arc::new(Peer::new(PeerClass::Client, session_id, session_id, None));
        self.registry.track_client(session_id, Arc::clone(&peer));
        self.notify_control(Content::ClientConnectionStatus(ClientConnectionStatusMessage {
            session_id,
            reason: "connected".into(),
            session_status: String::new(),
        }));
        self.start_io(peer, Connection::new(stream), routing);
    }

    fn filter_node(self: &Arc<Self>, reg: &Registration, stream: SocketStream) {
        let peer_node = reg.node_id;
        debug!(peer_node = %peer_node, "registration received from node peer");

        // Simultaneous dials between two nodes are resolved by forcing the
        // final connection to run from the greater node id to the lesser:
        // a greater node refuses a lesser node's inbound (and dials back if
        // it has not already), while a lesser node accepts a greater
        // node's inbound, attaching it to any record it already created.
        let guard = self
            .node_connect_lock
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        match self.registry.find_node(peer_node) {
            None => {
                if peer_node < self.node_id {
                    if let Some(info) = self.routing.find_node_info(peer_node) {
                        debug!(peer_node = %peer_node,
                            "rejecting node connection from lesser id; creating reciprocal");
                        let peer = Arc::new(Peer::new(
                            PeerClass::Node,
                            peer_node,
                            Uuid::nil(),
                            Some(info),
                        ));
                        self.registry.track_node(peer_node, Arc::clone(&peer));
                        drop(guard);
                        self.clone().spawn_node_connect(peer);
                    } else {
                        error!(peer_node = %peer_node, "unexpected node connection");
                    }
                } else {
                    debug!(peer_node = %peer_node, "accepting node connection from greater id");
                    let peer =
                        Arc::new(Peer::new(PeerClass::Node, peer_node, Uuid::nil(), None));
                    self.registry.track_node(peer_node, Arc::clone(&peer));
                    drop(guard);
                    self.start_io(peer, Connection::new(stream), None);
                }
            }
            Some(peer) => {
                if peer_node < self.node_id {
                    debug!(peer_node = %peer_node,
                        "rejecting node connection from lesser id; reciprocal already in progress");
                } else {
                    debug!(peer_node = %peer_node,
                        "accepting node connection from greater id into existing record");
                    drop(guard);
                    self.start_io(peer, Connection::new(stream), None);
                }
            }
        }
    }

    fn filter_executor(self: &Arc<Self>, reg: &Registration, stream: SocketStream) {
        let Some(routing) = self.routing.get(reg.session_id) else {
            error!(session_id = %reg.session_id, computation = %reg.computation_id,
                "refusing computation connection: no routing data for session");
            return;
        };
        debug!(session_id = %reg.session_id, computation = %reg.computation_id,
            "registration received from computation");

        self.notify_control(Content::ComputationStatus(ComputationStatusMessage {
            session_id: reg.session_id,
            computation_id: reg.computation_id,
            status: "ready".into(),
        }));

        let peer = Arc::new(Peer::new(
            PeerClass::Executor,
            reg.computation_id,
            reg.session_id,
            None,
        ));
        self.registry
            .track_computation(reg.computation_id, Arc::clone(&peer));
        self.start_io(peer, Connection::new(stream), Some(routing));
    }

    fn filter_control(self: &Arc<Self>, reg: &Registration, stream: SocketStream) {
        let peer = Arc::new(Peer::new(PeerClass::Control, reg.node_id, Uuid::nil(), None));
        if let Err(err) = self.registry.set_control(Arc::clone(&peer)) {
            error!(%err, "refusing control connection");
            return;
        }
        debug!("handshake succeeded for agent control connection");

        // tell the agent which TCP port carries cross-host messages
        peer.queue_envelope(Envelope::from_content(Content::RouterInfo(
            RouterInfoMessage {
                message_port: self.message_port,
            },
        )));
        self.start_io(peer, Connection::new(stream), None);
    }

    // ── Per-peer I/O tasks ──────────────────────────────────────────────

    fn start_io(
        self: &Arc<Self>,
        peer: Arc<Peer>,
        connection: Connection,
        routing: Option<Arc<SessionRoutingData>>,
    ) {
        let Some(send_rx) = peer.take_send_rx() else {
            warn!(peer = %peer.describe(),
                "dropping socket: peer already has an active transport");
            return;
        };
        let Connection { reader, writer } = connection;

        tokio::spawn(send_task(
            Arc::clone(self),
            Arc::clone(&peer),
            writer,
            send_rx,
        ));

        // a client for an unknown session is send-only: there is no routing
        // data, so inbound messages cannot be addressed
        if peer.class == PeerClass::Client && routing.is_none() {
            return;
        }
        tokio::spawn(recv_task(Arc::clone(self), peer, reader, routing));
    }

    fn spawn_node_connect(self: Arc<Self>, peer: Arc<Peer>) {
        tokio::spawn(async move {
            let info = match &peer.node_info {
                Some(info) => info.clone(),
                None => {
                    error!(peer = %peer.describe(), "node peer created without dial info");
                    self.flag_destroy(&peer);
                    return;
                }
            };

            let connect = async {
                let stream = tokio::time::timeout(
                    NODE_CONNECT_TIMEOUT,
                    TcpStream::connect((info.ip.as_str(), info.port)),
                )
                .await
                .map_err(|_| NodeError::Transport("node connect timed out".into()))?
                .map_err(|err| NodeError::Transport(format!("node connect failed: {err}")))?;

                let mut stream = SocketStream::Tcp(stream);
                let mut reg = Registration::new(PeerClass::Node);
                reg.node_id = self.node_id;
                registration::write_registration(&mut stream, &reg).await?;
                Ok::<SocketStream, NodeError>(stream)
            };

            match connect.await {
                Ok(stream) => {
                    if self.node_id > peer.id {
                        // this node is greater, so the connection is kept
                        self.start_io(peer, Connection::new(stream), None);
                    } else {
                        // lesser side: the dial only pokes the greater node,
                        // which will connect back and attach the real socket
                        debug!(peer_node = %peer.id,
                            "awaiting reciprocal connection from greater node");
                    }
                }
                Err(err) => {
                    error!(peer_node = %peer.id, %err, "error connecting to remote node");
                    self.flag_destroy(&peer);
                }
            }
        });
    }

    // ── Dispatch and routing ────────────────────────────────────────────

    fn on_envelope(
        self: &Arc<Self>,
        peer: &Arc<Peer>,
        mut envelope: Envelope,
        cached_routing: Option<&Arc<SessionRoutingData>>,
    ) {
        if peer.class == PeerClass::Control {
            // agent-to-router control queue, pumped by its own task
            if self.control_tx.send(envelope).is_err() {
                warn!("control queue closed; dropping agent message");
            }
            return;
        }

        if envelope.class_id == CONTROL_ID {
            // control messages are not routed
            if peer.class == PeerClass::Client {
                if let Some(Content::Control(control)) = envelope.content() {
                    if control.command == "disconnect" {
                        self.notify_client_disconnected(peer.session_id, "clientShutdown");
                    }
                }
            } else if envelope.to().len() == 1
                && envelope.to()[0].computation.is_nil()
                && envelope.to()[0].node == self.node_id
            {
                error!(peer = %peer.describe(), session_id = %peer.session_id,
                    "unexpected control message");
            }
            return;
        }

        if envelope.class_id == EXECUTOR_HEARTBEAT_ID {
            // heartbeats are not routed, and only come from computations
            if peer.class == PeerClass::Executor {
                self.forward_heartbeat(peer, &envelope);
            }
            return;
        }

        let routing = match peer.class {
            PeerClass::Node => {
                // can't use cached routing information, get it per session
                let session_id = envelope.first_to().map(|a| a.session);
                match session_id.and_then(|sid| self.routing.get(sid)) {
                    Some(routing) => routing,
                    None => {
                        warn!(peer = %peer.describe(),
                            session_id = ?session_id.map(|s| s.to_string()),
                            "received message for unknown session");
                        return;
                    }
                }
            }
            _ => match cached_routing {
                Some(routing) => Arc::clone(routing),
                None => return,
            },
        };

        if peer.class == PeerClass::Client {
            if let Err(err) = routing.address_client_envelope(&mut envelope) {
                error!(session_id = %peer.session_id, %err, "cannot address client message");
                return;
            }
        }

        self.route_message(&envelope, &routing);
    }

    /// Route an envelope to its destinations within one session.
    pub fn route_message(self: &Arc<Self>, envelope: &Envelope, routing: &Arc<SessionRoutingData>) {
        let session_id = routing.session_id();
        let (to_client, ipc_lists, mut node_lists) =
            split_destinations(self.node_id, envelope.to());

        if to_client {
            if routing.is_entry_node() {
                // client is local to this node; stash when not yet connected
                match self.registry.find_client(session_id) {
                    Some(client) => client.queue_envelope(envelope.clone()),
                    None => self.registry.stash(session_id, envelope.clone()),
                }
            } else {
                // forward toward the session's entry node
                node_lists
                    .entry(routing.node_map().entry_node_id())
                    .or_default()
                    .push(Address::client(session_id));
            }
        }

        for computation_id in ipc_lists.into_keys() {
            match self.registry.find_computation(computation_id) {
                Some(dest) => dest.queue_envelope(envelope.clone()),
                None => error!(session_id = %session_id, computation = %computation_id,
                    "could not find endpoint for local computation"),
            }
        }

        for (node_id, addresses) in node_lists {
            match self.find_or_connect_node(node_id, routing) {
                Some(dest) => dest.queue_envelope_to(envelope, addresses),
                None => error!(node_id = %node_id,
                    "could not find destination node for message"),
            }
        }
    }

    fn find_or_connect_node(
        self: &Arc<Self>,
        node_id: Uuid,
        routing: &Arc<SessionRoutingData>,
    ) -> Option<Arc<Peer>> {
        if let Some(peer) = self.registry.find_node(node_id) {
            return Some(peer);
        }

        // re-check under the lock so a concurrent accept cannot double-create
        let guard = self
            .node_connect_lock
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(peer) = self.registry.find_node(node_id) {
            return Some(peer);
        }
        let info = routing.node_map().node_info(node_id)?;
        debug!(from = %self.node_id, to = %node_id, "connecting to node");
        let peer = Arc::new(Peer::new(PeerClass::Node, node_id, Uuid::nil(), Some(info)));
        self.registry.track_node(node_id, Arc::clone(&peer));
        drop(guard);
        self.clone().spawn_node_connect(Arc::clone(&peer));
        Some(peer)
    }

    fn forward_heartbeat(self: &Arc<Self>, peer: &Arc<Peer>, envelope: &Envelope) {
        // add a from address, because the computation doesn't
        let mut forward = envelope.clone();
        forward.metadata.from = Address::new(peer.session_id, self.node_id, peer.id);
        self.notify_control_envelope(forward);

        if let Some(Content::Heartbeat(heartbeat)) = envelope.content() {
            if peer.stats_due(heartbeat.transmit_secs) {
                log_stats(peer, heartbeat);
            }
        }
    }

    // ── Agent-to-router control queue ───────────────────────────────────

    async fn control_pump(self: Arc<Self>) {
        let mut rx = self
            .control_rx
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take()
            .expect("control pump started twice");

        loop {
            tokio::select! {
                biased;

                () = self.cancel.cancelled() => break,

                envelope = rx.recv() => {
                    match envelope {
                        None => break,
                        Some(envelope) => self.handle_control(envelope).await,
                    }
                }
            }
        }
    }

    async fn handle_control(self: &Arc<Self>, envelope: Envelope) {
        match envelope.content() {
            Some(Content::ClientConnectionStatus(msg)) => {
                debug!(session_id = %msg.session_id, reason = %msg.reason,
                    "received client status notification");
                // "connected" only ever flows router-to-agent; anything else
                // here is a request to kick the client
                if msg.reason != "connected" {
                    self.kick_client(msg.session_id, &msg.reason, &msg.session_status)
                        .await;
                }
            }
            Some(Content::RoutingData(msg)) => match msg.action {
                RoutingAction::Initialize => {
                    if self.routing.get(msg.session_id).is_none() {
                        match serde_json::from_str(&msg.routing_data)
                            .map_err(NodeError::from)
                            .and_then(|obj: serde_json::Value| {
                                SessionRoutingData::new(msg.session_id, self.node_id, &obj)
                            }) {
                            Ok(data) => self.routing.add(data),
                            Err(err) => {
                                error!(session_id = %msg.session_id, %err,
                                    "rejecting malformed session routing data");
                                return;
                            }
                        }
                    }
                    // acknowledge so the agent can release the session create
                    self.notify_control(Content::RoutingData(
                        crate::protocol::messages::SessionRoutingDataMessage {
                            action: RoutingAction::Acknowledge,
                            session_id: msg.session_id,
                            routing_data: String::new(),
                        },
                    ));
                }
                RoutingAction::Update => {
                    if let Some(data) = self.routing.get(msg.session_id) {
                        match serde_json::from_str::<serde_json::Value>(&msg.routing_data) {
                            Ok(obj) => data.update(&obj),
                            Err(err) => warn!(session_id = %msg.session_id, %err,
                                "ignoring malformed routing update"),
                        }
                    }
                }
                RoutingAction::Delete => self.routing.delete(msg.session_id),
                RoutingAction::Acknowledge => {
                    warn!(session_id = %msg.session_id,
                        "unexpected routing acknowledge from agent");
                }
            },
            Some(Content::Control(_) | Content::EngineReady) => {
                // pre-addressed by the agent; just route it
                let session_id = envelope.first_to().map(|a| a.session);
                if let Some(routing) = session_id.and_then(|sid| self.routing.get(sid)) {
                    self.route_message(&envelope, &routing);
                }
            }
            _ => {
                warn!(class_id = %envelope.class_id, "unexpected message on control queue");
            }
        }
    }

    /// Disconnect a session's client, delivering a final status first.
    pub async fn kick_client(self: &Arc<Self>, session_id: Uuid, reason: &str, status_json: &str) {
        debug!(session_id = %session_id, reason, "disconnecting client");
        match self.registry.find_client(session_id) {
            Some(client) => {
                let status = Envelope::from_content(Content::SessionStatus(
                    SessionStatusMessage {
                        status: status_json.to_owned(),
                    },
                ))
                .with_to(vec![Address::client(session_id)]);
                client.queue_envelope(status);

                // give the final status a chance to flush, but don't wait long
                if !client.drain(KICK_DRAIN_TIMEOUT).await {
                    warn!(session_id = %session_id,
                        "client queue did not drain before disconnect");
                }
                self.flag_destroy(&client);
            }
            None => {
                debug!(session_id = %session_id, "there was no client to disconnect");
                self.registry.clear_stashed(session_id);
            }
        }
    }

    // ── Peer failure handling ───────────────────────────────────────────

    fn disconnect(self: &Arc<Self>, peer: &Arc<Peer>) {
        match peer.class {
            PeerClass::Client => {
                debug!(session_id = %peer.session_id, "client disconnected");
                self.notify_client_disconnected(peer.session_id, "clientDroppedConnection");
            }
            PeerClass::Control => {
                error!("agent control connection lost; shutting down router");
                self.cancel.cancel();
            }
            _ => {}
        }
        self.flag_destroy(peer);
    }

    fn flag_destroy(&self, peer: &Arc<Peer>) {
        if peer.flag_for_destruction() {
            let _ = self.destroy_tx.send(Arc::clone(peer));
        }
    }

    fn notify_client_disconnected(self: &Arc<Self>, session_id: Uuid, reason: &str) {
        self.notify_control(Content::ClientConnectionStatus(
            ClientConnectionStatusMessage {
                session_id,
                reason: reason.to_owned(),
                session_status: String::new(),
            },
        ));
    }

    fn notify_control(&self, content: Content) {
        self.notify_control_envelope(Envelope::from_content(content));
    }

    fn notify_control_envelope(&self, envelope: Envelope) {
        match self.registry.control() {
            Some(control) => control.queue_envelope(envelope),
            None => debug!("agent not connected; dropping notification"),
        }
    }
}

// ── Worker tasks ────────────────────────────────────────────────────────

async fn send_task(
    router: Arc<NodeRouter>,
    peer: Arc<Peer>,
    mut writer: FramedWrite<BoxedWrite, FrameCodec>,
    mut send_rx: mpsc::UnboundedReceiver<Envelope>,
) {
    let cancel = peer.cancellation();
    loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => break,

            envelope = send_rx.recv() => {
                let Some(envelope) = envelope else { break };
                let result = writer.send(envelope).await;
                peer.mark_sent();
                if let Err(err) = result {
                    warn!(peer = %peer.describe(), session_id = %peer.session_id, %err,
                        "connection failed during message send");
                    router.disconnect(&peer);
                    break;
                }
            }
        }
    }
}

async fn recv_task(
    router: Arc<NodeRouter>,
    peer: Arc<Peer>,
    mut reader: FramedRead<BoxedRead, FrameCodec>,
    routing: Option<Arc<SessionRoutingData>>,
) {
    let cancel = peer.cancellation();
    loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => break,

            item = reader.next() => {
                match item {
                    None => {
                        // disconnect, reset and close all happen during a
                        // normal node shutdown, so not an error
                        warn!(peer = %peer.describe(), session_id = %peer.session_id,
                            "peer disconnected");
                        router.disconnect(&peer);
                        break;
                    }
                    Some(Err(err)) => {
                        match err {
                            NodeError::Protocol(ref msg) => {
                                error!(peer = %peer.describe(),
                                    session_id = %peer.session_id,
                                    error = msg.as_str(),
                                    "protocol violation while receiving message");
                            }
                            _ => {
                                warn!(peer = %peer.describe(),
                                    session_id = %peer.session_id, %err,
                                    "error receiving message");
                            }
                        }
                        router.disconnect(&peer);
                        break;
                    }
                    Some(Ok(mut envelope)) => {
                        let eager = Content::is_eager(envelope.class_id)
                            || peer.class == PeerClass::Control;
                        if eager {
                            if let Err(err) = envelope.deserialize_content() {
                                error!(peer = %peer.describe(),
                                    session_id = %peer.session_id, %err,
                                    "malformed control payload");
                                router.disconnect(&peer);
                                break;
                            }
                        }
                        router.on_envelope(&peer, envelope, routing.as_ref());
                    }
                }
            }
        }
    }
}

/// Routing decision helper: split a destination list into the client flag,
/// local computations (by computation id) and remote nodes (by node id).
#[must_use]
pub fn split_destinations(
    local_node: Uuid,
    to: &[Address],
) -> (
    bool,
    HashMap<Uuid, Vec<Address>>,
    HashMap<Uuid, Vec<Address>>,
) {
    let mut to_client = false;
    let mut ipc_lists: HashMap<Uuid, Vec<Address>> = HashMap::new();
    let mut node_lists: HashMap<Uuid, Vec<Address>> = HashMap::new();

    for address in to {
        if address.node.is_nil() {
            // no node id means it's for the client
            to_client = true;
        } else if address.node == local_node && !address.computation.is_nil() {
            ipc_lists
                .entry(address.computation)
                .or_default()
                .push(*address);
        } else if address.node != local_node {
            node_lists.entry(address.node).or_default().push(*address);
        }
    }

    (to_client, ipc_lists, node_lists)
}

fn log_stats(peer: &Arc<Peer>, heartbeat: &ExecutorHeartbeat) {
    info!(
        target: "stats",
        session_id = %peer.session_id,
        computation = %peer.id,
        threads = heartbeat.threads,
        hyperthreaded = heartbeat.hyperthreaded,
        cpu_usage_5_sec = heartbeat.cpu_usage_5_secs_current,
        cpu_usage_60_sec = heartbeat.cpu_usage_60_secs_current,
        cpu_usage_total = heartbeat.cpu_usage_total_secs,
        memory_usage_bytes = heartbeat.memory_usage_bytes_current,
        sent_messages_5_sec = heartbeat.sent_messages_5_sec,
        sent_messages_60_sec = heartbeat.sent_messages_60_sec,
        sent_messages_total = heartbeat.sent_messages_total,
        received_messages_5_sec = heartbeat.received_messages_5_sec,
        received_messages_60_sec = heartbeat.received_messages_60_sec,
        received_messages_total = heartbeat.received_messages_total,
        status = %heartbeat.status,
        "computation stats",
    );
}
