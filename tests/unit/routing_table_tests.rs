//! Routing table: strong/weak handles and node lookup.

use uuid::Uuid;

use arras_node::router::{RoutingTable, SessionRoutingData};

fn routing_json(session: Uuid, nodes: &[(Uuid, &str, u16, bool)]) -> serde_json::Value {
    let mut node_map = serde_json::Map::new();
    for (id, ip, port, entry) in nodes {
        node_map.insert(
            id.to_string(),
            serde_json::json!({
                "host": "host-a",
                "ip": ip,
                "tcp": port,
                "entry": entry,
            }),
        );
    }
    let mut root = serde_json::Map::new();
    root.insert(
        session.to_string(),
        serde_json::json!({ "nodes": node_map, "computations": {} }),
    );
    serde_json::Value::Object(root)
}

#[test]
fn added_data_is_retrievable_until_deleted() {
    let table = RoutingTable::new();
    let session = Uuid::new_v4();
    let node = Uuid::new_v4();
    let data =
        SessionRoutingData::new(session, node, &routing_json(session, &[(node, "10.0.0.5", 9001, true)]))
            .expect("routing data parses");

    table.add(data);
    assert!(table.get(session).is_some());

    table.delete(session);
    assert!(table.get(session).is_none());
}

#[test]
fn release_keeps_data_alive_for_inflight_users() {
    let table = RoutingTable::new();
    let session = Uuid::new_v4();
    let node = Uuid::new_v4();
    let data =
        SessionRoutingData::new(session, node, &routing_json(session, &[(node, "10.0.0.5", 9001, true)]))
            .unwrap();
    table.add(data);

    // an in-flight routing path holds a promoted reference
    let inflight = table.get(session).expect("promotable before release");
    table.release(session);
    assert!(
        table.get(session).is_some(),
        "weak handle must promote while a user holds the data"
    );

    drop(inflight);
    assert!(
        table.get(session).is_none(),
        "data must reclaim once the last user is gone"
    );
}

#[test]
fn entry_node_flag_follows_the_nodes_object() {
    let session = Uuid::new_v4();
    let entry = Uuid::new_v4();
    let other = Uuid::new_v4();
    let routing = routing_json(
        session,
        &[(entry, "10.0.0.5", 9001, true), (other, "10.0.0.6", 9001, false)],
    );

    let on_entry = SessionRoutingData::new(session, entry, &routing).unwrap();
    assert!(on_entry.is_entry_node());
    assert_eq!(on_entry.node_map().entry_node_id(), entry);

    let off_entry = SessionRoutingData::new(session, other, &routing).unwrap();
    assert!(!off_entry.is_entry_node());
    assert_eq!(off_entry.node_map().entry_node_id(), entry);
}

#[test]
fn find_node_info_scans_sessions() {
    let table = RoutingTable::new();
    let session = Uuid::new_v4();
    let local = Uuid::new_v4();
    let remote = Uuid::new_v4();
    let data = SessionRoutingData::new(
        session,
        local,
        &routing_json(
            session,
            &[(local, "10.0.0.5", 9001, true), (remote, "10.0.0.6", 9002, false)],
        ),
    )
    .unwrap();
    table.add(data);

    let info = table.find_node_info(remote).expect("remote node known");
    assert_eq!(info.ip, "10.0.0.6");
    assert_eq!(info.port, 9002);
    assert!(table.find_node_info(Uuid::new_v4()).is_none());
}

#[test]
fn node_map_updates_add_but_never_change() {
    let session = Uuid::new_v4();
    let local = Uuid::new_v4();
    let late = Uuid::new_v4();
    let data = SessionRoutingData::new(
        session,
        local,
        &routing_json(session, &[(local, "10.0.0.5", 9001, true)]),
    )
    .unwrap();

    // update carries a new node and a conflicting rewrite of the old one
    data.update(&routing_json(
        session,
        &[(local, "99.99.99.99", 1, true), (late, "10.0.0.7", 9003, false)],
    ));

    let original = data.node_map().node_info(local).unwrap();
    assert_eq!(original.ip, "10.0.0.5", "existing entries never change");
    let added = data.node_map().node_info(late).unwrap();
    assert_eq!(added.ip, "10.0.0.7");
}
