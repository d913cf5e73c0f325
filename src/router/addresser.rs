//! Client message addressing.
//!
//! Messages from a session's client usually arrive with an empty
//! destination list; the entry node rewrites it into concrete computation
//! addresses using per-computation filter rules keyed by message routing
//! name. Rules come from the `messageFilter` object of the session's
//! routing data:
//!
//! ```json
//! { "renderer": ["RenderSetupMessage", "CameraMessage"], "merge": "*" }
//! ```
//!
//! A computation absent from the filter object, or mapped to `"*"`,
//! accepts every message name. Rule updates only ever add computations or
//! accepted names.

use std::collections::{HashMap, HashSet};

use serde_json::Value;
use uuid::Uuid;

use crate::protocol::{Address, Envelope};

/// Per-computation accept rule.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Filter {
    All,
    Names(HashSet<String>),
}

/// Rewrites client-originated destination lists for one session.
#[derive(Debug)]
pub struct ClientAddresser {
    session_id: Uuid,
    /// Computation name to its full address, in definition order.
    computations: Vec<(String, Address)>,
    filters: HashMap<String, Filter>,
}

impl ClientAddresser {
    /// Build from a session's routing object.
    #[must_use]
    pub fn from_routing(session_id: Uuid, routing: &Value) -> Self {
        let mut addresser = Self {
            session_id,
            computations: Vec::new(),
            filters: HashMap::new(),
        };
        addresser.merge_rules(routing);
        addresser
    }

    /// Merge computations and filter rules from a routing object.
    ///
    /// Additions only: existing computations keep their address and
    /// accepted names are extended, never removed.
    pub fn merge_rules(&mut self, routing: &Value) {
        if let Some(comps) = routing[self.session_id.to_string()]
            .get("computations")
            .and_then(Value::as_object)
        {
            for (name, info) in comps {
                if self.computations.iter().any(|(n, _)| n == name) {
                    continue;
                }
                let node = info
                    .get("nodeId")
                    .and_then(Value::as_str)
                    .and_then(|s| Uuid::parse_str(s).ok());
                let comp = info
                    .get("compId")
                    .and_then(Value::as_str)
                    .and_then(|s| Uuid::parse_str(s).ok());
                if let (Some(node), Some(computation)) = (node, comp) {
                    self.computations.push((
                        name.clone(),
                        Address::new(self.session_id, node, computation),
                    ));
                }
            }
        }

        if let Some(rules) = routing.get("messageFilter").and_then(Value::as_object) {
            for (name, rule) in rules {
                match rule {
                    Value::Array(names) => {
                        let entry = self
                            .filters
                            .entry(name.clone())
                            .or_insert_with(|| Filter::Names(HashSet::new()));
                        if let Filter::Names(accepted) = entry {
                            accepted.extend(
                                names
                                    .iter()
                                    .filter_map(Value::as_str)
                                    .map(str::to_owned),
                            );
                        }
                    }
                    Value::String(s) if s == "*" => {
                        self.filters.insert(name.clone(), Filter::All);
                    }
                    _ => {}
                }
            }
        }
    }

    /// Rewrite the destination list to the computations accepting this
    /// envelope's routing name.
    pub fn address(&self, envelope: &mut Envelope) {
        let routing_name = envelope.metadata.routing_name.clone();
        envelope.metadata.to = self
            .computations
            .iter()
            .filter(|(name, _)| self.accepts(name, &routing_name))
            .map(|(_, addr)| *addr)
            .collect();
    }

    /// Rewrite the destination list to every computation in the session.
    pub fn address_to_all(&self, envelope: &mut Envelope) {
        envelope.metadata.to = self.computations.iter().map(|(_, addr)| *addr).collect();
    }

    fn accepts(&self, computation: &str, routing_name: &str) -> bool {
        match self.filters.get(computation) {
            None | Some(Filter::All) => true,
            Some(Filter::Names(accepted)) => accepted.contains(routing_name),
        }
    }
}
