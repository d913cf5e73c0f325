//! Error types shared across the agent and router.

use std::fmt::{Display, Formatter};

/// Shared result type.
pub type Result<T> = std::result::Result<T, NodeError>;

/// Node error enumeration covering all domain failure modes.
#[derive(Debug)]
pub enum NodeError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// Malformed request body, unknown id, or invalid tag combination.
    BadRequest(String),
    /// Requested entity does not exist.
    NotFound(String),
    /// Session busy, node closed, or a concurrent update is running.
    Conflict(String),
    /// Peer transport failure (connect, frame read/write, handshake).
    Transport(String),
    /// Wire protocol violation (bad magic, version mismatch, bad frame).
    Protocol(String),
    /// Session lifecycle failure.
    Session(String),
    /// Child process spawn or control failure.
    Process(String),
    /// Service discovery or orchestrator HTTP failure.
    Service(String),
    /// Local queue or channel was shut down.
    Shutdown(String),
    /// Internal invariant violation.
    Internal(String),
    /// File-system or I/O operation failure.
    Io(String),
}

impl NodeError {
    /// HTTP status used when this error surfaces through the control plane.
    #[must_use]
    pub fn http_status(&self) -> u16 {
        match self {
            Self::Config(_) | Self::BadRequest(_) => 400,
            Self::NotFound(_) => 404,
            Self::Conflict(_) => 409,
            _ => 500,
        }
    }
}

impl Display for NodeError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::BadRequest(msg) => write!(f, "bad request: {msg}"),
            Self::NotFound(msg) => write!(f, "not found: {msg}"),
            Self::Conflict(msg) => write!(f, "conflict: {msg}"),
            Self::Transport(msg) => write!(f, "transport: {msg}"),
            Self::Protocol(msg) => write!(f, "protocol: {msg}"),
            Self::Session(msg) => write!(f, "session: {msg}"),
            Self::Process(msg) => write!(f, "process: {msg}"),
            Self::Service(msg) => write!(f, "service: {msg}"),
            Self::Shutdown(msg) => write!(f, "shutdown: {msg}"),
            Self::Internal(msg) => write!(f, "internal: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
        }
    }
}

impl std::error::Error for NodeError {}

impl From<std::io::Error> for NodeError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for NodeError {
    fn from(err: serde_json::Error) -> Self {
        Self::BadRequest(format!("invalid json: {err}"))
    }
}

impl From<toml::de::Error> for NodeError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<reqwest::Error> for NodeError {
    fn from(err: reqwest::Error) -> Self {
        Self::Service(err.to_string())
    }
}
