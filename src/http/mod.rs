//! Agent HTTP control plane: endpoints, ban list, and the event fan-out
//! queue to the coordinator.

pub mod banlist;
pub mod events;
pub mod server;

pub use banlist::BanList;
pub use events::{spawn_event_worker, EventQueue, EventSenderConfig, NodeEvent};
pub use server::{build_router, HttpState, NODE_API_VERSION};
