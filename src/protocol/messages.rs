//! Control-plane content classes.
//!
//! Each class has a stable UUID tag carried in the frame header. These are
//! the only payloads the router and agent ever deserialize; everything else
//! is forwarded as opaque bytes. Payload encoding is single-object JSON.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{NodeError, Result};

/// `go`/`update`/`stop`/`disconnect` commands to computations and clients.
pub const CONTROL_ID: Uuid = Uuid::from_u128(0x92b9_9e94_d32a_4a34_9b38_77fe_15a9_6b81);
/// Periodic performance stats from a computation.
pub const EXECUTOR_HEARTBEAT_ID: Uuid = Uuid::from_u128(0x5c5f_7a0e_6a84_4b84_9d3b_2a8a_5f3d_7c11);
/// Reply to a client ping.
pub const PONG_ID: Uuid = Uuid::from_u128(0x7b2f_3c44_91e1_4a8e_8f07_3cfe_ec58_c7d2);
/// Client ping, broadcast to every computation regardless of filters.
pub const PING_ID: Uuid = Uuid::from_u128(0x64a0_a6a7_36c1_4bfc_8d93_0a39_a4f4_d0c5);
/// Session engine is ready; delivered to the client.
pub const ENGINE_READY_ID: Uuid = Uuid::from_u128(0xe7c3_1a84_5efa_4a37_9e23_6ce5_4d4b_2f19);
/// Session status document pushed to a client before disconnect.
pub const SESSION_STATUS_ID: Uuid = Uuid::from_u128(0xa2c6_f00a_9a6c_41de_9efd_aa4a_5d62_4b0b);
/// Per-session routing data exchange between agent and router.
pub const SESSION_ROUTING_DATA_ID: Uuid = Uuid::from_u128(0x83ba_0cb8_5af8_4ee1_8b6e_d0ca_33de_ee41);
/// Computation lifecycle status from the router to the agent.
pub const COMPUTATION_STATUS_ID: Uuid = Uuid::from_u128(0x3499_f3aa_422c_4ed2_8789_5380_5231_c8b5);
/// Client connect/disconnect notifications, both directions.
pub const CLIENT_CONNECTION_STATUS_ID: Uuid =
    Uuid::from_u128(0x0d66_b113_49a7_4d81_bb93_925b_9440_ed4c);
/// Router startup info (message port) sent to the control peer.
pub const ROUTER_INFO_ID: Uuid = Uuid::from_u128(0x4b08_de9e_da0c_4cc4_a069_0d6f_55d0_7d22);

/// Action field of a [`SessionRoutingDataMessage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RoutingAction {
    /// Create routing data at session startup.
    Initialize,
    /// Update routing data for a running session.
    Update,
    /// Free routing data (`routing_data` unused).
    Delete,
    /// Acknowledge receipt of routing data (router to agent).
    Acknowledge,
}

/// Command to a computation (`go`, `update`, `stop`) or client (`disconnect`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlMessage {
    pub command: String,
    /// JSON document carried with the command; empty when not needed.
    #[serde(default)]
    pub data: String,
}

/// Rolling performance counters sent by a computation every few seconds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExecutorHeartbeat {
    pub transmit_secs: i64,
    pub transmit_micro_secs: i64,
    pub threads: u32,
    pub hyperthreaded: bool,
    pub cpu_usage_5_secs_current: f32,
    pub cpu_usage_60_secs_current: f32,
    pub cpu_usage_total_secs: f64,
    pub memory_usage_bytes_current: u64,
    pub sent_messages_5_sec: u64,
    pub sent_messages_60_sec: u64,
    pub sent_messages_total: u64,
    pub received_messages_5_sec: u64,
    pub received_messages_60_sec: u64,
    pub received_messages_total: u64,
    pub status: String,
}

/// Session status document sent to a client just before disconnect.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatusMessage {
    /// JSON document describing the stopped session.
    pub status: String,
}

/// Per-session routing data exchange between the agent and the router.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRoutingDataMessage {
    pub action: RoutingAction,
    pub session_id: Uuid,
    /// Routing object rendered as a JSON string; empty for
    /// `Delete`/`Acknowledge`.
    #[serde(default)]
    pub routing_data: String,
}

/// Computation lifecycle status from the router to the agent.
///
/// The status string is nominally always `ready`; anything else is ignored
/// with a warning rather than guessed at.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComputationStatusMessage {
    pub session_id: Uuid,
    pub computation_id: Uuid,
    #[serde(default)]
    pub status: String,
}

/// Client connect/disconnect notification.
///
/// Reasons: `connected`, `clientShutdown`, `clientDroppedConnection`,
/// `clientConnectionTimeout`, plus agent-originated kick reasons.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientConnectionStatusMessage {
    pub session_id: Uuid,
    pub reason: String,
    /// Session status JSON forwarded to the client on a kick.
    #[serde(default)]
    pub session_status: String,
}

/// Router startup info sent back over a fresh control connection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouterInfoMessage {
    /// TCP port the router listens on for cross-host messages.
    pub message_port: u16,
}

/// A deserialized control-plane payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Content {
    Control(ControlMessage),
    Heartbeat(ExecutorHeartbeat),
    Ping,
    Pong,
    EngineReady,
    SessionStatus(SessionStatusMessage),
    RoutingData(SessionRoutingDataMessage),
    ComputationStatus(ComputationStatusMessage),
    ClientConnectionStatus(ClientConnectionStatusMessage),
    RouterInfo(RouterInfoMessage),
}

impl Content {
    /// Stable class id for the frame header.
    #[must_use]
    pub fn class_id(&self) -> Uuid {
        match self {
            Self::Control(_) => CONTROL_ID,
            Self::Heartbeat(_) => EXECUTOR_HEARTBEAT_ID,
            Self::Ping => PING_ID,
            Self::Pong => PONG_ID,
            Self::EngineReady => ENGINE_READY_ID,
            Self::SessionStatus(_) => SESSION_STATUS_ID,
            Self::RoutingData(_) => SESSION_ROUTING_DATA_ID,
            Self::ComputationStatus(_) => COMPUTATION_STATUS_ID,
            Self::ClientConnectionStatus(_) => CLIENT_CONNECTION_STATUS_ID,
            Self::RouterInfo(_) => ROUTER_INFO_ID,
        }
    }

    /// Routing name used by addresser filter rules.
    #[must_use]
    pub fn routing_name(&self) -> &'static str {
        match self {
            Self::Control(_) => "ControlMessage",
            Self::Heartbeat(_) => "ExecutorHeartbeat",
            Self::Ping => "PingMessage",
            Self::Pong => "PongMessage",
            Self::EngineReady => "EngineReadyMessage",
            Self::SessionStatus(_) => "SessionStatusMessage",
            Self::RoutingData(_) => "SessionRoutingDataMessage",
            Self::ComputationStatus(_) => "ComputationStatusMessage",
            Self::ClientConnectionStatus(_) => "ClientConnectionStatusMessage",
            Self::RouterInfo(_) => "RouterInfoMessage",
        }
    }

    /// Serialize the payload for the wire.
    ///
    /// # Errors
    ///
    /// `NodeError::Internal` when JSON serialization fails.
    pub fn encode_payload(&self) -> Result<Bytes> {
        let raw = match self {
            Self::Ping | Self::Pong | Self::EngineReady => Ok(Vec::new()),
            Self::Control(m) => serde_json::to_vec(m),
            Self::Heartbeat(m) => serde_json::to_vec(m),
            Self::SessionStatus(m) => serde_json::to_vec(m),
            Self::RoutingData(m) => serde_json::to_vec(m),
            Self::ComputationStatus(m) => serde_json::to_vec(m),
            Self::ClientConnectionStatus(m) => serde_json::to_vec(m),
            Self::RouterInfo(m) => serde_json::to_vec(m),
        }
        .map_err(|err| NodeError::Internal(format!("payload serialization failed: {err}")))?;
        Ok(Bytes::from(raw))
    }

    /// Deserialize a payload for a known class id.
    ///
    /// Returns `Ok(None)` for an unknown class (opaque application data).
    ///
    /// # Errors
    ///
    /// `NodeError::Protocol` when the payload of a known class is malformed.
    pub fn decode(class_id: Uuid, payload: &[u8]) -> Result<Option<Self>> {
        fn parse<T: for<'de> Deserialize<'de>>(payload: &[u8], what: &str) -> Result<T> {
            serde_json::from_slice(payload)
                .map_err(|err| NodeError::Protocol(format!("malformed {what} payload: {err}")))
        }

        let content = match class_id {
            CONTROL_ID => Self::Control(parse(payload, "control")?),
            EXECUTOR_HEARTBEAT_ID => Self::Heartbeat(parse(payload, "heartbeat")?),
            PING_ID => Self::Ping,
            PONG_ID => Self::Pong,
            ENGINE_READY_ID => Self::EngineReady,
            SESSION_STATUS_ID => Self::SessionStatus(parse(payload, "session status")?),
            SESSION_ROUTING_DATA_ID => Self::RoutingData(parse(payload, "routing data")?),
            COMPUTATION_STATUS_ID => {
                Self::ComputationStatus(parse(payload, "computation status")?)
            }
            CLIENT_CONNECTION_STATUS_ID => {
                Self::ClientConnectionStatus(parse(payload, "client connection status")?)
            }
            ROUTER_INFO_ID => Self::RouterInfo(parse(payload, "router info")?),
            _ => return Ok(None),
        };
        Ok(Some(content))
    }

    /// Whether a class must always be deserialized on receive.
    #[must_use]
    pub fn is_eager(class_id: Uuid) -> bool {
        matches!(class_id, CONTROL_ID | EXECUTOR_HEARTBEAT_ID | PONG_ID)
    }
}
