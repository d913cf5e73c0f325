//! Thread-safe storage of active peers.
//!
//! The registry protects the integrity of the tables; tracked peers are
//! `Arc`-shared, so a lookup stays usable after the peer is removed and
//! in-flight routing never races destruction.
//!
//! The stash holds envelopes addressed to a session's client before the
//! client has connected. `track_client` drains the stash into the new
//! peer's queue under the registry lock, so no concurrent enqueue can
//! interleave with stashing.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use uuid::Uuid;

use super::peer::Peer;
use crate::protocol::{Envelope, PeerClass};
use crate::{NodeError, Result};

#[derive(Default)]
struct Tables {
    clients: HashMap<Uuid, Arc<Peer>>,
    nodes: HashMap<Uuid, Arc<Peer>>,
    computations: HashMap<Uuid, Arc<Peer>>,
    control: Option<Arc<Peer>>,
    stash: HashMap<Uuid, Vec<Envelope>>,
}

/// Indexed maps of active peers by class.
#[derive(Default)]
pub struct PeerRegistry {
    tables: Mutex<Tables>,
}

impl PeerRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a client peer, delivering any stashed envelopes in order.
    pub fn track_client(&self, session_id: Uuid, peer: Arc<Peer>) {
        let mut tables = self.lock();
        if let Some(stashed) = tables.stash.remove(&session_id) {
            for envelope in stashed {
                peer.queue_envelope(envelope);
            }
        }
        tables.clients.insert(session_id, peer);
    }

    pub fn track_node(&self, node_id: Uuid, peer: Arc<Peer>) {
        self.lock().nodes.insert(node_id, peer);
    }

    pub fn track_computation(&self, computation_id: Uuid, peer: Arc<Peer>) {
        self.lock().computations.insert(computation_id, peer);
    }

    /// Install the singleton control peer.
    ///
    /// # Errors
    ///
    /// `NodeError::Conflict` when a control connection already exists.
    pub fn set_control(&self, peer: Arc<Peer>) -> Result<()> {
        let mut tables = self.lock();
        if tables.control.is_some() {
            return Err(NodeError::Conflict(
                "refusing control connection because one already exists".into(),
            ));
        }
        tables.control = Some(peer);
        Ok(())
    }

    #[must_use]
    pub fn find_client(&self, session_id: Uuid) -> Option<Arc<Peer>> {
        self.lock().clients.get(&session_id).cloned()
    }

    #[must_use]
    pub fn find_node(&self, node_id: Uuid) -> Option<Arc<Peer>> {
        self.lock().nodes.get(&node_id).cloned()
    }

    #[must_use]
    pub fn find_computation(&self, computation_id: Uuid) -> Option<Arc<Peer>> {
        self.lock().computations.get(&computation_id).cloned()
    }

    #[must_use]
    pub fn control(&self) -> Option<Arc<Peer>> {
        self.lock().control.clone()
    }

    /// Queue an envelope for a session's client, stashing it when the
    /// client has not connected yet.
    pub fn stash(&self, session_id: Uuid, envelope: Envelope) {
        let mut tables = self.lock();
        // check again for the client while locked, and either queue or stash
        if let Some(client) = tables.clients.get(&session_id) {
            client.queue_envelope(envelope);
        } else {
            tables.stash.entry(session_id).or_default().push(envelope);
        }
    }

    /// Drop stashed envelopes for a client that never connected.
    pub fn clear_stashed(&self, session_id: Uuid) {
        self.lock().stash.remove(&session_id);
    }

    /// Remove a peer from whichever table holds it.
    ///
    /// Returns the class and identity that were removed, or `None` when
    /// the peer was already gone. The caller owns deciding that the peer
    /// is no longer needed.
    pub fn destroy(&self, peer: &Arc<Peer>) -> Option<(PeerClass, Uuid)> {
        let mut tables = self.lock();
        if let Some(id) = remove_by_ptr(&mut tables.clients, peer) {
            return Some((PeerClass::Client, id));
        }
        if let Some(id) = remove_by_ptr(&mut tables.nodes, peer) {
            return Some((PeerClass::Node, id));
        }
        if let Some(id) = remove_by_ptr(&mut tables.computations, peer) {
            return Some((PeerClass::Executor, id));
        }
        if let Some(control) = &tables.control {
            if Arc::ptr_eq(control, peer) {
                let id = control.id;
                tables.control = None;
                return Some((PeerClass::Control, id));
            }
        }
        None
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Tables> {
        self.tables
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

fn remove_by_ptr(table: &mut HashMap<Uuid, Arc<Peer>>, peer: &Arc<Peer>) -> Option<Uuid> {
    let id = table
        .iter()
        .find(|(_, candidate)| Arc::ptr_eq(candidate, peer))
        .map(|(id, _)| *id)?;
    table.remove(&id);
    Some(id)
}
