//! In-host message router.
//!
//! Runs as a sibling process of the agent (`arras-node-router`),
//! multiplexing the length-prefixed message protocol across four peer
//! classes: session clients, routers on peer nodes, local computations
//! over the IPC socket, and the agent's control connection.

pub mod addresser;
pub mod core;
pub mod peer;
pub mod peers;
pub mod routing;

pub use addresser::ClientAddresser;
pub use core::{split_destinations, NodeRouter};
pub use peer::Peer;
pub use peers::PeerRegistry;
pub use routing::{NodeInfo, RoutingTable, SessionNodeMap, SessionRoutingData};
