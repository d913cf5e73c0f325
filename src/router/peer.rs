//! One connected peer: identity, send queue, cancellation.
//!
//! A peer owns one transport connection and a send queue. The router's
//! core spawns one send task and one receive task per peer once a
//! registered socket is attached; node peers that this host initiates are
//! created without a transport and attach one after the outbound
//! handshake settles.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use super::routing::NodeInfo;
use crate::protocol::{Address, Envelope, PeerClass};

/// Interval between per-computation stats log lines.
pub const STATS_INTERVAL_SECS: i64 = 30;

/// A tracked peer connection.
pub struct Peer {
    pub class: PeerClass,
    /// Identity within the class: session id for clients, node id for
    /// nodes, computation id for executors.
    pub id: Uuid,
    /// Session the peer belongs to; nil for node and control peers.
    pub session_id: Uuid,
    /// Dial target for node peers this host initiates.
    pub node_info: Option<NodeInfo>,
    send_tx: mpsc::UnboundedSender<Envelope>,
    send_rx: Mutex<Option<mpsc::UnboundedReceiver<Envelope>>>,
    queued: AtomicUsize,
    shutdown: AtomicBool,
    flagged: AtomicBool,
    cancel: CancellationToken,
    /// Next wall-clock second at which to emit a stats line (executors).
    next_stats_secs: AtomicI64,
}

impl Peer {
    #[must_use]
    pub fn new(class: PeerClass, id: Uuid, session_id: Uuid, node_info: Option<NodeInfo>) -> Self {
        let (send_tx, send_rx) = mpsc::unbounded_channel();
        let peer = Self {
            class,
            id,
            session_id,
            node_info,
            send_tx,
            send_rx: Mutex::new(Some(send_rx)),
            queued: AtomicUsize::new(0),
            shutdown: AtomicBool::new(false),
            flagged: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            next_stats_secs: AtomicI64::new(0),
        };
        if class == PeerClass::Executor {
            peer.init_stats_time();
        }
        peer
    }

    /// Queue an envelope for the send task.
    ///
    /// After shutdown the message is dropped with a debug log; callers
    /// never crash on a closing peer.
    pub fn queue_envelope(&self, envelope: Envelope) {
        if self.shutdown.load(Ordering::Acquire) {
            debug!(peer = %self.describe(),
                "message undelivered due to endpoint shutdown: {}", envelope.describe());
            return;
        }
        self.queued.fetch_add(1, Ordering::AcqRel);
        if self.send_tx.send(envelope).is_err() {
            self.queued.fetch_sub(1, Ordering::AcqRel);
            debug!(peer = %self.describe(), "message undelivered: send queue closed");
        }
    }

    /// Queue a copy of an envelope with a reduced destination list.
    pub fn queue_envelope_to(&self, envelope: &Envelope, to: Vec<Address>) {
        self.queue_envelope(envelope.readdressed(to));
    }

    /// Take the receive side of the send queue. The send task owns it;
    /// `None` once a transport has already been attached.
    pub fn take_send_rx(&self) -> Option<mpsc::UnboundedReceiver<Envelope>> {
        self.send_rx
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take()
    }

    pub(crate) fn mark_sent(&self) {
        self.queued.fetch_sub(1, Ordering::AcqRel);
    }

    /// Wait until the send queue is empty. Returns false on timeout.
    pub async fn drain(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while self.queued.load(Ordering::Acquire) > 0 {
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        true
    }

    /// Stop accepting sends and unblock both I/O tasks.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.cancel.cancel();
    }

    /// Request destruction on the accept loop's next sweep.
    ///
    /// Returns true the first time, so a peer is only queued once.
    pub fn flag_for_destruction(&self) -> bool {
        !self.flagged.swap(true, Ordering::AcqRel)
    }

    #[must_use]
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Human-readable identity for logs.
    #[must_use]
    pub fn describe(&self) -> String {
        match self.class {
            PeerClass::Client => "client".to_owned(),
            PeerClass::Node => format!("node({})", self.id),
            PeerClass::Executor => format!("computation({})", self.id),
            PeerClass::Control => "control".to_owned(),
        }
    }

    /// Seed the stats clock to now plus 0-31 s, spreading stats lines
    /// across computations. The computation id already has random bytes,
    /// so xor them rather than calling an RNG.
    fn init_stats_time(&self) {
        let hash = self.id.as_bytes().iter().fold(0u8, |acc, b| acc ^ b);
        let now = chrono::Utc::now().timestamp();
        self.next_stats_secs
            .store(now + i64::from(hash & 0x1f), Ordering::Release);
    }

    /// Whether a stats line is due for a heartbeat sent at `transmit_secs`,
    /// advancing the clock when it is.
    pub fn stats_due(&self, transmit_secs: i64) -> bool {
        let next = self.next_stats_secs.load(Ordering::Acquire);
        if transmit_secs < next {
            return false;
        }
        let now = chrono::Utc::now().timestamp();
        self.next_stats_secs
            .store(now + STATS_INTERVAL_SECS, Ordering::Release);
        true
    }
}
