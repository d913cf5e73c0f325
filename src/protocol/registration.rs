//! Connection registration handshake.
//!
//! Both sides of a peer connection exchange a fixed-width registration
//! record before any frames. The record identifies the peer class and
//! carries the ids the router needs to index the peer:
//!
//! ```text
//! magic(4) api_major(2) api_minor(2) api_patch(2) class(1)
//! node_id(16) session_id(16) computation_id(16)
//! ```
//!
//! All integers are little-endian. A connector that sends the wrong magic
//! or a mismatched major version is refused with a logged reason.

use std::time::Duration;

use bytes::{Buf, BufMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use uuid::Uuid;

use crate::{NodeError, Result};

/// Magic bytes leading every registration record.
pub const MAGIC: u32 = 0x4152_5253;

/// Messaging API version advertised in the registration record.
pub const API_VERSION: (u16, u16, u16) = (4, 0, 0);

/// Serialized size of a registration record.
pub const REGISTRATION_BYTES: usize = 59;

/// No response within this window is a failed connection.
pub const REGISTRATION_TIMEOUT: Duration = Duration::from_secs(5);

/// Peer classes a connector may register as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PeerClass {
    /// External client of a session.
    Client = 1,
    /// Router on another host.
    Node = 2,
    /// Local computation process.
    Executor = 3,
    /// The agent's control-plane connection.
    Control = 4,
}

impl PeerClass {
    fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(Self::Client),
            2 => Some(Self::Node),
            3 => Some(Self::Executor),
            4 => Some(Self::Control),
            _ => None,
        }
    }

    /// Human-readable class name used in logs.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Client => "client",
            Self::Node => "node",
            Self::Executor => "computation",
            Self::Control => "control",
        }
    }
}

/// Fixed-width registration record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub api_major: u16,
    pub api_minor: u16,
    pub api_patch: u16,
    pub class: PeerClass,
    pub node_id: Uuid,
    pub session_id: Uuid,
    pub computation_id: Uuid,
}

impl Registration {
    /// New record for the given class at the current API version.
    #[must_use]
    pub fn new(class: PeerClass) -> Self {
        Self {
            api_major: API_VERSION.0,
            api_minor: API_VERSION.1,
            api_patch: API_VERSION.2,
            class,
            node_id: Uuid::nil(),
            session_id: Uuid::nil(),
            computation_id: Uuid::nil(),
        }
    }

    /// Encode into the fixed wire layout.
    #[must_use]
    pub fn encode(&self) -> [u8; REGISTRATION_BYTES] {
        let mut buf = [0u8; REGISTRATION_BYTES];
        let mut cursor = &mut buf[..];
        cursor.put_u32_le(MAGIC);
        cursor.put_u16_le(self.api_major);
        cursor.put_u16_le(self.api_minor);
        cursor.put_u16_le(self.api_patch);
        cursor.put_u8(self.class as u8);
        cursor.put_slice(self.node_id.as_bytes());
        cursor.put_slice(self.session_id.as_bytes());
        cursor.put_slice(self.computation_id.as_bytes());
        buf
    }

    /// Decode the fixed wire layout, validating magic and major version.
    ///
    /// # Errors
    ///
    /// `NodeError::Protocol` on bad magic, version mismatch, or an unknown
    /// peer class.
    pub fn decode(raw: &[u8; REGISTRATION_BYTES]) -> Result<Self> {
        let mut cursor = &raw[..];
        let magic = cursor.get_u32_le();
        if magic != MAGIC {
            return Err(NodeError::Protocol(format!(
                "invalid registration block (magic {magic:#010x}): \
                 someone may be attempting an unsupported connection type"
            )));
        }
        let api_major = cursor.get_u16_le();
        if api_major != API_VERSION.0 {
            return Err(NodeError::Protocol(format!(
                "messaging API version mismatch: found major version {api_major}, require {}",
                API_VERSION.0
            )));
        }
        let api_minor = cursor.get_u16_le();
        let api_patch = cursor.get_u16_le();
        let class = PeerClass::from_u8(cursor.get_u8())
            .ok_or_else(|| NodeError::Protocol("unknown peer class in registration".into()))?;

        let mut id = [0u8; 16];
        cursor.copy_to_slice(&mut id);
        let node_id = Uuid::from_bytes(id);
        cursor.copy_to_slice(&mut id);
        let session_id = Uuid::from_bytes(id);
        cursor.copy_to_slice(&mut id);
        let computation_id = Uuid::from_bytes(id);

        Ok(Self {
            api_major,
            api_minor,
            api_patch,
            class,
            node_id,
            session_id,
            computation_id,
        })
    }
}

/// Read one registration record, bounded by [`REGISTRATION_TIMEOUT`].
///
/// # Errors
///
/// `NodeError::Transport` on timeout or short read, `NodeError::Protocol`
/// on an invalid record.
pub async fn read_registration<R>(reader: &mut R) -> Result<Registration>
where
    R: AsyncRead + Unpin,
{
    let mut raw = [0u8; REGISTRATION_BYTES];
    tokio::time::timeout(REGISTRATION_TIMEOUT, reader.read_exact(&mut raw))
        .await
        .map_err(|_| NodeError::Transport("timed out waiting for registration".into()))?
        .map_err(|err| NodeError::Transport(format!("registration read failed: {err}")))?;
    Registration::decode(&raw)
}

/// Write one registration record.
///
/// # Errors
///
/// `NodeError::Transport` when the write fails.
pub async fn write_registration<W>(writer: &mut W, registration: &Registration) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer
        .write_all(&registration.encode())
        .await
        .map_err(|err| NodeError::Transport(format!("registration write failed: {err}")))?;
    writer
        .flush()
        .await
        .map_err(|err| NodeError::Transport(format!("registration flush failed: {err}")))?;
    Ok(())
}
