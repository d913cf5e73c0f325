//! Destination splitting and envelope payload laziness.

use bytes::Bytes;
use uuid::Uuid;

use arras_node::protocol::messages::{ControlMessage, CONTROL_ID};
use arras_node::protocol::{Address, Content, Envelope, Metadata};
use arras_node::router::split_destinations;

#[test]
fn destinations_split_into_client_local_and_remote() {
    let local = Uuid::new_v4();
    let remote_a = Uuid::new_v4();
    let remote_b = Uuid::new_v4();
    let session = Uuid::new_v4();
    let comp_local = Uuid::new_v4();

    let to = vec![
        Address::client(session),
        Address::new(session, local, comp_local),
        Address::new(session, remote_a, Uuid::new_v4()),
        Address::new(session, remote_a, Uuid::new_v4()),
        Address::new(session, remote_b, Uuid::new_v4()),
    ];

    let (to_client, ipc, nodes) = split_destinations(local, &to);

    assert!(to_client);
    assert_eq!(ipc.len(), 1);
    assert!(ipc.contains_key(&comp_local));
    assert_eq!(nodes.len(), 2);
    assert_eq!(nodes[&remote_a].len(), 2);
    assert_eq!(nodes[&remote_b].len(), 1);
}

#[test]
fn agent_address_is_neither_client_nor_computation() {
    let local = Uuid::new_v4();
    let session = Uuid::new_v4();

    // node == self with a nil computation addresses the agent itself
    let to = vec![Address::new(session, local, Uuid::nil())];
    let (to_client, ipc, nodes) = split_destinations(local, &to);

    assert!(!to_client);
    assert!(ipc.is_empty());
    assert!(nodes.is_empty());
}

#[test]
fn known_class_payload_deserializes_in_place() {
    let payload = serde_json::to_vec(&ControlMessage {
        command: "go".into(),
        data: String::new(),
    })
    .unwrap();
    let mut envelope = Envelope::opaque(
        CONTROL_ID,
        0,
        Metadata::default(),
        Bytes::from(payload),
    );

    assert!(envelope.content().is_none(), "payload starts opaque");
    envelope.deserialize_content().expect("control must parse");
    match envelope.content() {
        Some(Content::Control(control)) => assert_eq!(control.command, "go"),
        other => panic!("expected control content, got {other:?}"),
    }
}

#[test]
fn unknown_class_payload_stays_opaque() {
    let mut envelope = Envelope::opaque(
        Uuid::new_v4(),
        0,
        Metadata::default(),
        Bytes::from_static(b"application data"),
    );
    envelope.deserialize_content().expect("unknown class is fine");
    assert!(envelope.content().is_none());
    assert_eq!(
        envelope.payload_bytes().unwrap(),
        Bytes::from_static(b"application data")
    );
}

#[test]
fn clear_releases_the_payload() {
    let mut envelope = Envelope::opaque(
        Uuid::new_v4(),
        0,
        Metadata::default(),
        Bytes::from_static(b"big payload"),
    );
    envelope.clear();
    assert!(envelope.payload_bytes().unwrap().is_empty());
}

#[test]
fn malformed_control_payload_is_a_protocol_error() {
    let mut envelope = Envelope::opaque(
        CONTROL_ID,
        0,
        Metadata::default(),
        Bytes::from_static(b"not json"),
    );
    assert!(envelope.deserialize_content().is_err());
}
