//! Client addresser: filter rules, ping broadcast, monotonic merges.

use bytes::Bytes;
use uuid::Uuid;

use arras_node::protocol::messages::PING_ID;
use arras_node::protocol::{Envelope, Metadata};
use arras_node::router::ClientAddresser;

fn routing(session: Uuid, comps: &[(&str, Uuid, Uuid)], filter: serde_json::Value) -> serde_json::Value {
    let mut computations = serde_json::Map::new();
    for (name, node, comp) in comps {
        computations.insert(
            (*name).to_owned(),
            serde_json::json!({ "nodeId": node.to_string(), "compId": comp.to_string() }),
        );
    }
    let mut root = serde_json::Map::new();
    root.insert(
        session.to_string(),
        serde_json::json!({ "computations": computations }),
    );
    root.insert("messageFilter".into(), filter);
    serde_json::Value::Object(root)
}

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
fn filter_rules_select_matching_computations() {
    let session = Uuid::new_v4();
    let node = Uuid::new_v4();
    let render = Uuid::new_v4();
    let merge = Uuid::new_v4();
    let addresser = ClientAddresser::from_routing(
        session,
        &routing(
            session,
            &[("render", node, render), ("merge", node, merge)],
            serde_json::json!({ "render": ["CameraMessage"], "merge": [] }),
        ),
    );

    let mut envelope = envelope_named("CameraMessage");
    addresser.address(&mut envelope);

    assert_eq!(envelope.to().len(), 1);
    assert_eq!(envelope.to()[0].computation, render);
    assert_eq!(envelope.to()[0].session, session);
}

#[test]
fn computation_without_rules_accepts_everything() {
    let session = Uuid::new_v4();
    let node = Uuid::new_v4();
    let comp = Uuid::new_v4();
    let addresser = ClientAddresser::from_routing(
        session,
        &routing(session, &[("solo", node, comp)], serde_json::json!({})),
    );

    let mut envelope = envelope_named("AnythingAtAll");
    addresser.address(&mut envelope);
    assert_eq!(envelope.to().len(), 1);
}

#[test]
fn ping_goes_to_every_computation_regardless_of_rules() {
    let session = Uuid::new_v4();
    let node = Uuid::new_v4();
    let a = Uuid::new_v4();
    let b = Uuid::new_v4();
    let addresser = ClientAddresser::from_routing(
        session,
        &routing(
            session,
            &[("a", node, a), ("b", node, b)],
            serde_json::json!({ "a": [], "b": [] }),
        ),
    );

    let mut ping = Envelope::opaque(PING_ID, 0, Metadata::default(), Bytes::new());
    addresser.address_to_all(&mut ping);
    assert_eq!(ping.to().len(), 2);
}

#[test]
fn merging_rules_only_ever_adds() {
    let session = Uuid::new_v4();
    let node = Uuid::new_v4();
    let comp = Uuid::new_v4();
    let mut addresser = ClientAddresser::from_routing(
        session,
        &routing(
            session,
            &[("render", node, comp)],
            serde_json::json!({ "render": ["CameraMessage"] }),
        ),
    );

    // second run signal carries an extra accepted name; the original
    // name must survive
    addresser.merge_rules(&routing(
        session,
        &[("render", node, comp)],
        serde_json::json!({ "render": ["LightMessage"] }),
    ));

    for name in ["CameraMessage", "LightMessage"] {
        let mut envelope = envelope_named(name);
        addresser.address(&mut envelope);
        assert_eq!(envelope.to().len(), 1, "{name} must be accepted");
    }

    let mut other = envelope_named("OtherMessage");
    addresser.address(&mut other);
    assert!(other.to().is_empty());
}
