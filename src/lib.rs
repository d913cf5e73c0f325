#![forbid(unsafe_code)]

//! `arras-node`: per-host worker agent and message router for an Arras
//! compute cluster.
//!
//! The agent binary (`arras-node`) registers the host with service
//! discovery and the coordinator, accepts session commands over HTTP, and
//! supervises computation child processes. It launches the router binary
//! (`arras-node-router`) as a sibling process, which shuttles message
//! envelopes between the session's client, local computations, and peer
//! nodes.

pub mod config;
pub mod discovery;
pub mod errors;
pub mod http;
pub mod node;
pub mod preemption;
pub mod protocol;
pub mod router;
pub mod session;
pub mod supervisor;

pub use errors::{NodeError, Result};
