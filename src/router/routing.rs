//! Per-session routing data and the router's routing table.
//!
//! Each session carries a node map (node id to network endpoint, plus the
//! identity of the entry node) and, on the entry node only, a client
//! addresser. The routing table keeps a strong handle during session setup
//! and only a weak one afterwards, so the record is reclaimed once the last
//! in-flight routing user releases it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use serde_json::Value;
use tracing::warn;
use uuid::Uuid;

use super::addresser::ClientAddresser;
use crate::protocol::Envelope;
use crate::{NodeError, Result};

/// Network endpoint for one node of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfo {
    pub node_id: Uuid,
    pub hostname: String,
    pub ip: String,
    pub port: u16,
}

/// Host information for every node used by a session.
///
/// The map may gain nodes while the session runs, but an existing entry
/// never changes and neither does the entry node.
#[derive(Debug)]
pub struct SessionNodeMap {
    entry_node: Uuid,
    map: Mutex<HashMap<Uuid, NodeInfo>>,
}

impl SessionNodeMap {
    /// Parse the `nodes` object of a session's routing data.
    ///
    /// # Errors
    ///
    /// `NodeError::BadRequest` when the object is missing or malformed.
    pub fn from_routing(session_id: Uuid, routing: &Value) -> Result<Self> {
        let nodes = routing[session_id.to_string()]
            .get("nodes")
            .and_then(Value::as_object)
            .ok_or_else(|| {
                NodeError::BadRequest("routing data has no nodes object".into())
            })?;

        let mut map = HashMap::new();
        let mut entry_node = Uuid::nil();
        for (id_str, info) in nodes {
            let node_id = Uuid::parse_str(id_str).map_err(|_| {
                NodeError::BadRequest(format!("invalid node id '{id_str}' in routing data"))
            })?;
            map.insert(node_id, parse_node_info(node_id, info)?);
            if info.get("entry").and_then(Value::as_bool).unwrap_or(false) {
                entry_node = node_id;
            }
        }

        Ok(Self {
            entry_node,
            map: Mutex::new(map),
        })
    }

    /// Add nodes from an updated routing object. Existing entries are
    /// never modified; a changed entry is ignored.
    pub fn update(&self, session_id: Uuid, routing: &Value) {
        let Some(nodes) = routing[session_id.to_string()]
            .get("nodes")
            .and_then(Value::as_object)
        else {
            return;
        };
        let mut map = self.map.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        for (id_str, info) in nodes {
            let Ok(node_id) = Uuid::parse_str(id_str) else {
                continue;
            };
            if map.contains_key(&node_id) {
                continue;
            }
            match parse_node_info(node_id, info) {
                Ok(parsed) => {
                    map.insert(node_id, parsed);
                }
                Err(err) => {
                    warn!(session_id = %session_id, node_id = %node_id, %err,
                        "ignoring malformed node entry in routing update");
                }
            }
        }
    }

    #[must_use]
    pub fn entry_node_id(&self) -> Uuid {
        self.entry_node
    }

    /// Endpoint for a node id, if this session knows it.
    #[must_use]
    pub fn node_info(&self, node_id: Uuid) -> Option<NodeInfo> {
        self.map
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(&node_id)
            .cloned()
    }
}

fn parse_node_info(node_id: Uuid, info: &Value) -> Result<NodeInfo> {
    let port = info
        .get("tcp")
        .and_then(Value::as_u64)
        .ok_or_else(|| NodeError::BadRequest(format!("node {node_id} has no tcp port")))?;
    Ok(NodeInfo {
        node_id,
        hostname: info
            .get("host")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned(),
        ip: info
            .get("ip")
            .and_then(Value::as_str)
            .ok_or_else(|| NodeError::BadRequest(format!("node {node_id} has no ip")))?
            .to_owned(),
        port: u16::try_from(port)
            .map_err(|_| NodeError::BadRequest(format!("node {node_id} tcp port out of range")))?,
    })
}

/// Routing information the router holds for one session.
#[derive(Debug)]
pub struct SessionRoutingData {
    session_id: Uuid,
    node_id: Uuid,
    node_map: SessionNodeMap,
    /// Present only on the session's entry node.
    client_addresser: Mutex<Option<ClientAddresser>>,
}

impl SessionRoutingData {
    /// Build from the routing object delivered at session initialization.
    ///
    /// # Errors
    ///
    /// `NodeError::BadRequest` when the routing object is malformed.
    pub fn new(session_id: Uuid, node_id: Uuid, routing: &Value) -> Result<Arc<Self>> {
        let node_map = SessionNodeMap::from_routing(session_id, routing)?;
        let addresser = if node_map.entry_node_id() == node_id {
            Some(ClientAddresser::from_routing(session_id, routing))
        } else {
            None
        };
        Ok(Arc::new(Self {
            session_id,
            node_id,
            node_map,
            client_addresser: Mutex::new(addresser),
        }))
    }

    #[must_use]
    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    #[must_use]
    pub fn node_id(&self) -> Uuid {
        self.node_id
    }

    #[must_use]
    pub fn node_map(&self) -> &SessionNodeMap {
        &self.node_map
    }

    /// Whether this host owns the session's client connection.
    #[must_use]
    pub fn is_entry_node(&self) -> bool {
        self.client_addresser
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .is_some()
    }

    /// Rewrite a client-originated envelope's destination list.
    ///
    /// Pings are broadcast to every computation regardless of rules.
    ///
    /// # Errors
    ///
    /// `NodeError::Internal` when called off the entry node.
    pub fn address_client_envelope(&self, envelope: &mut Envelope) -> Result<()> {
        let guard = self
            .client_addresser
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let addresser = guard.as_ref().ok_or_else(|| {
            NodeError::Internal("client envelope received off the entry node".into())
        })?;
        if envelope.class_id == crate::protocol::messages::PING_ID {
            addresser.address_to_all(envelope);
        } else {
            addresser.address(envelope);
        }
        Ok(())
    }

    /// Merge updated addresser rules and any new nodes.
    ///
    /// Rule updates are monotonic: computations and accepted message names
    /// are only ever added.
    pub fn update(&self, routing: &Value) {
        self.node_map.update(self.session_id, routing);
        let mut guard = self
            .client_addresser
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(addresser) = guard.as_mut() {
            addresser.merge_rules(routing);
        }
    }
}

#[derive(Default)]
struct Tables {
    strong: HashMap<Uuid, Arc<SessionRoutingData>>,
    weak: HashMap<Uuid, Weak<SessionRoutingData>>,
}

/// Thread-safe access to per-session routing data.
///
/// A record is added with both a strong and a weak handle. `release` drops
/// the strong handle so memory reclaims once in-flight routing users are
/// done; `delete` drops both. Stale weak entries linger harmlessly until
/// deleted.
#[derive(Default)]
pub struct RoutingTable {
    tables: Mutex<Tables>,
}

impl RoutingTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Promote the weak handle for a session, if the record is still alive.
    #[must_use]
    pub fn get(&self, session_id: Uuid) -> Option<Arc<SessionRoutingData>> {
        self.tables
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .weak
            .get(&session_id)
            .and_then(Weak::upgrade)
    }

    /// Insert a record, keeping it alive until [`Self::release`].
    pub fn add(&self, data: Arc<SessionRoutingData>) {
        let mut tables = self
            .tables
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        tables.weak.insert(data.session_id(), Arc::downgrade(&data));
        tables.strong.insert(data.session_id(), data);
    }

    /// Drop the strong handle, leaving the weak one for in-flight paths.
    pub fn release(&self, session_id: Uuid) {
        self.tables
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .strong
            .remove(&session_id);
    }

    /// Drop both handles.
    pub fn delete(&self, session_id: Uuid) {
        let mut tables = self
            .tables
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        tables.strong.remove(&session_id);
        if let Some(weak) = tables.weak.remove(&session_id) {
            if weak.upgrade().is_some() {
                warn!(session_id = %session_id,
                    "deleting session routing data while still in use");
            }
        }
    }

    /// Scan all sessions for the first that knows the given node.
    #[must_use]
    pub fn find_node_info(&self, node_id: Uuid) -> Option<NodeInfo> {
        let tables = self
            .tables
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        for weak in tables.weak.values() {
            if let Some(data) = weak.upgrade() {
                if let Some(info) = data.node_map().node_info(node_id) {
                    return Some(info);
                }
            }
        }
        None
    }
}
