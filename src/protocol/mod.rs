//! Wire protocol shared by the agent, the router, and computations.
//!
//! A connection starts with a fixed-width [`registration`] record, then
//! carries length-prefixed frames ([`codec`]) holding addressed message
//! [`envelope`]s. Control-plane payloads are the typed content classes in
//! [`messages`]; application payloads stay opaque bytes end to end.

pub mod codec;
pub mod envelope;
pub mod messages;
pub mod registration;
pub mod transport;

pub use codec::{FrameCodec, MAX_FRAME_BYTES};
pub use envelope::{Address, Envelope, Metadata};
pub use messages::Content;
pub use registration::{PeerClass, Registration, API_VERSION, REGISTRATION_TIMEOUT};
pub use transport::{Connection, SocketStream};
