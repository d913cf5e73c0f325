//! Peer registry: tracking, destruction, and the client stash.

use std::sync::Arc;

use bytes::Bytes;
use uuid::Uuid;

use arras_node::protocol::{Envelope, Metadata, PeerClass};
use arras_node::router::{Peer, PeerRegistry};

fn envelope_named(name: &str) -> Envelope {
    Envelope::opaque(
        Uuid::new_v4(),
        0,
        Metadata {
            routing_name: name.into(),
            ..Metadata::default()
        },
        Bytes::from_static(b"x"),
    )
}

#[test]
fn lookup_returns_the_tracked_peer() {
    let registry = PeerRegistry::new();
    let session = Uuid::new_v4();
    let node = Uuid::new_v4();
    let comp = Uuid::new_v4();

    let client = Arc::new(Peer::new(PeerClass::Client, session, session, None));
    let node_peer = Arc::new(Peer::new(PeerClass::Node, node, Uuid::nil(), None));
    let executor = Arc::new(Peer::new(PeerClass::Executor, comp, session, None));

    registry.track_client(session, Arc::clone(&client));
    registry.track_node(node, Arc::clone(&node_peer));
    registry.track_computation(comp, Arc::clone(&executor));

    assert!(Arc::ptr_eq(&registry.find_client(session).unwrap(), &client));
    assert!(Arc::ptr_eq(&registry.find_node(node).unwrap(), &node_peer));
    assert!(Arc::ptr_eq(
        &registry.find_computation(comp).unwrap(),
        &executor
    ));
}

#[test]
fn destroy_removes_exactly_that_peer() {
    let registry = PeerRegistry::new();
    let session = Uuid::new_v4();
    let client = Arc::new(Peer::new(PeerClass::Client, session, session, None));
    registry.track_client(session, Arc::clone(&client));

    let removed = registry.destroy(&client).expect("peer must be found");
    assert_eq!(removed, (PeerClass::Client, session));
    assert!(registry.find_client(session).is_none());
    assert!(registry.destroy(&client).is_none(), "second destroy is a no-op");
}

#[test]
fn second_control_connection_is_refused() {
    let registry = PeerRegistry::new();
    let first = Arc::new(Peer::new(PeerClass::Control, Uuid::new_v4(), Uuid::nil(), None));
    let second = Arc::new(Peer::new(PeerClass::Control, Uuid::new_v4(), Uuid::nil(), None));

    registry.set_control(first).expect("first control connects");
    assert!(registry.set_control(second).is_err());
}

#[tokio::test]
async fn stashed_envelopes_drain_in_order_when_the_client_arrives() {
    let registry = PeerRegistry::new();
    let session = Uuid::new_v4();

    registry.stash(session, envelope_named("first"));
    registry.stash(session, envelope_named("second"));

    let client = Arc::new(Peer::new(PeerClass::Client, session, session, None));
    registry.track_client(session, Arc::clone(&client));

    let mut rx = client.take_send_rx().expect("queue receiver available");
    assert_eq!(rx.try_recv().unwrap().metadata.routing_name, "first");
    assert_eq!(rx.try_recv().unwrap().metadata.routing_name, "second");
    assert!(rx.try_recv().is_err(), "nothing else was stashed");
}

#[tokio::test]
async fn stash_delivers_directly_once_the_client_is_tracked() {
    let registry = PeerRegistry::new();
    let session = Uuid::new_v4();
    let client = Arc::new(Peer::new(PeerClass::Client, session, session, None));
    registry.track_client(session, Arc::clone(&client));

    registry.stash(session, envelope_named("direct"));

    let mut rx = client.take_send_rx().expect("queue receiver available");
    assert_eq!(rx.try_recv().unwrap().metadata.routing_name, "direct");
}

#[tokio::test]
async fn cleared_stash_is_not_delivered() {
    let registry = PeerRegistry::new();
    let session = Uuid::new_v4();

    registry.stash(session, envelope_named("doomed"));
    registry.clear_stashed(session);

    let client = Arc::new(Peer::new(PeerClass::Client, session, session, None));
    registry.track_client(session, Arc::clone(&client));

    let mut rx = client.take_send_rx().expect("queue receiver available");
    assert!(rx.try_recv().is_err());
}
