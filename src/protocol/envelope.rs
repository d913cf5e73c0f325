//! Addressed message envelopes.
//!
//! An envelope pairs a content class id with a metadata record (from
//! address, ordered destination list, routing name) and a payload. The
//! payload stays opaque unless the class is one the router or agent must
//! understand; [`Envelope::deserialize_content`] upgrades it in place.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::messages::Content;
use crate::{NodeError, Result};

/// A message address: `(session, node, computation)`, any field nullable.
///
/// A nil node denotes the session's external client. A nil computation with
/// `node == self` denotes the agent itself.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Address {
    pub session: Uuid,
    pub node: Uuid,
    pub computation: Uuid,
}

impl Address {
    #[must_use]
    pub fn new(session: Uuid, node: Uuid, computation: Uuid) -> Self {
        Self {
            session,
            node,
            computation,
        }
    }

    /// Address of the session's external client.
    #[must_use]
    pub fn client(session: Uuid) -> Self {
        Self {
            session,
            node: Uuid::nil(),
            computation: Uuid::nil(),
        }
    }

    /// Whether this address targets the external client.
    #[must_use]
    pub fn is_client(&self) -> bool {
        self.node.is_nil()
    }
}

/// Envelope metadata: source, ordered destinations, routing name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Metadata {
    pub from: Address,
    pub to: Vec<Address>,
    /// Message name matched against addresser filter rules.
    pub routing_name: String,
}

/// Envelope payload: absent, opaque bytes, or deserialized content.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Empty,
    Opaque(Bytes),
    Content(Content),
}

/// An addressed frame carrying a message payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub class_id: Uuid,
    /// Content version tag carried on the wire.
    pub version: u16,
    pub metadata: Metadata,
    payload: Payload,
}

impl Envelope {
    /// Envelope around a typed control-plane payload.
    #[must_use]
    pub fn from_content(content: Content) -> Self {
        Self {
            class_id: content.class_id(),
            version: 0,
            metadata: Metadata {
                routing_name: content.routing_name().into(),
                ..Metadata::default()
            },
            payload: Payload::Content(content),
        }
    }

    /// Envelope around opaque application bytes.
    #[must_use]
    pub fn opaque(class_id: Uuid, version: u16, metadata: Metadata, payload: Bytes) -> Self {
        let payload = if payload.is_empty() {
            Payload::Empty
        } else {
            Payload::Opaque(payload)
        };
        Self {
            class_id,
            version,
            metadata,
            payload,
        }
    }

    /// Builder: set the destination list.
    #[must_use]
    pub fn with_to(mut self, to: Vec<Address>) -> Self {
        self.metadata.to = to;
        self
    }

    /// A copy of this envelope with a reduced destination list.
    #[must_use]
    pub fn readdressed(&self, to: Vec<Address>) -> Self {
        let mut env = self.clone();
        env.metadata.to = to;
        env
    }

    #[must_use]
    pub fn to(&self) -> &[Address] {
        &self.metadata.to
    }

    /// First destination, if any.
    #[must_use]
    pub fn first_to(&self) -> Option<&Address> {
        self.metadata.to.first()
    }

    /// Deserialized content, when the payload has been upgraded.
    #[must_use]
    pub fn content(&self) -> Option<&Content> {
        match &self.payload {
            Payload::Content(content) => Some(content),
            _ => None,
        }
    }

    /// Upgrade an opaque payload to typed content in place.
    ///
    /// No-op when already deserialized or when the class is unknown.
    ///
    /// # Errors
    ///
    /// `NodeError::Protocol` when the payload of a known class is malformed.
    pub fn deserialize_content(&mut self) -> Result<()> {
        let raw = match &self.payload {
            Payload::Opaque(raw) => raw.clone(),
            Payload::Empty => Bytes::new(),
            Payload::Content(_) => return Ok(()),
        };
        if let Some(content) = Content::decode(self.class_id, &raw)? {
            self.payload = Payload::Content(content);
        }
        Ok(())
    }

    /// Serialize the payload for the wire.
    ///
    /// # Errors
    ///
    /// `NodeError::Internal` when content serialization fails.
    pub fn payload_bytes(&self) -> Result<Bytes> {
        match &self.payload {
            Payload::Empty => Ok(Bytes::new()),
            Payload::Opaque(raw) => Ok(raw.clone()),
            Payload::Content(content) => content.encode_payload(),
        }
    }

    /// Drop the payload to release memory once no longer needed.
    pub fn clear(&mut self) {
        self.payload = Payload::Empty;
    }

    /// One-line description for logs.
    #[must_use]
    pub fn describe(&self) -> String {
        let name = if self.metadata.routing_name.is_empty() {
            self.class_id.to_string()
        } else {
            self.metadata.routing_name.clone()
        };
        format!("{name} to {} destination(s)", self.metadata.to.len())
    }

    /// Serialize metadata for the wire.
    pub(crate) fn metadata_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(&self.metadata)
            .map_err(|err| NodeError::Internal(format!("metadata serialization failed: {err}")))
    }

    /// Parse wire metadata.
    pub(crate) fn metadata_from_bytes(raw: &[u8]) -> Result<Metadata> {
        serde_json::from_slice(raw)
            .map_err(|err| NodeError::Protocol(format!("malformed envelope metadata: {err}")))
    }
}
