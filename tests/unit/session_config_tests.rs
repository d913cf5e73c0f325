//! Session definition parsing.

use uuid::Uuid;

use arras_node::session::SessionConfig;

fn definition(session: Uuid, node: Uuid, other_node: Uuid) -> serde_json::Value {
    let comp_here = Uuid::new_v4();
    let comp_there = Uuid::new_v4();
    let mut root = serde_json::Map::new();
    root.insert(
        node.to_string(),
        serde_json::json!({
            "config": {
                "sessionId": session.to_string(),
                "logLevel": 4,
                "contexts": {
                    "gl": { "packaging_system": "none", "environment": { "CTX_VAR": "1" } }
                },
                "computations": {
                    "renderer": {
                        "requirements": {
                            "resources": { "memoryMB": 4096, "cores": 2 },
                            "context": "gl"
                        },
                        "workingDirectory": "/var/tmp",
                        "environment": { "MY_VAR": "yes" }
                    }
                }
            }
        }),
    );
    let mut routing_session = serde_json::Map::new();
    let mut nodes = serde_json::Map::new();
    nodes.insert(
        node.to_string(),
        serde_json::json!({ "host": "a", "ip": "10.0.0.1", "tcp": 9001, "entry": true }),
    );
    nodes.insert(
        other_node.to_string(),
        serde_json::json!({ "host": "b", "ip": "10.0.0.2", "tcp": 9001 }),
    );
    routing_session.insert("nodes".into(), serde_json::Value::Object(nodes));
    routing_session.insert(
        "computations".into(),
        serde_json::json!({
            "renderer": { "nodeId": node.to_string(), "compId": comp_here.to_string() },
            "merge": { "nodeId": other_node.to_string(), "compId": comp_there.to_string() },
        }),
    );
    routing_session.insert(
        "clientData".into(),
        serde_json::json!({ "userInfo": { "name": "artist" } }),
    );
    let mut routing = serde_json::Map::new();
    routing.insert(session.to_string(), serde_json::Value::Object(routing_session));
    root.insert("routing".into(), serde_json::Value::Object(routing));
    serde_json::Value::Object(root)
}

#[test]
fn parses_ids_and_filters_computations_to_this_node() {
    let session = Uuid::new_v4();
    let node = Uuid::new_v4();
    let other = Uuid::new_v4();

    let config = SessionConfig::parse(definition(session, node, other), node)
        .expect("definition must parse");

    assert_eq!(config.session_id(), session);
    assert_eq!(config.node_id(), node);
    assert_eq!(config.log_level(), Some(4));
    assert!(config.is_entry_node());

    // only the renderer runs here; merge belongs to the other node
    assert_eq!(config.computations().len(), 1);
    assert!(config
        .computations()
        .values()
        .any(|name| name.as_str() == "renderer"));
}

#[test]
fn response_lists_only_local_computations() {
    let session = Uuid::new_v4();
    let node = Uuid::new_v4();
    let other = Uuid::new_v4();
    let config = SessionConfig::parse(definition(session, node, other), node).unwrap();

    let response = config.response();
    let renderer = &response["renderer"];
    assert_eq!(renderer["nodeId"], node.to_string());
    assert_eq!(renderer["compId"], renderer["hostId"]);
    assert!(response.get("merge").is_none());
}

#[test]
fn definition_and_context_are_reachable_by_name() {
    let session = Uuid::new_v4();
    let node = Uuid::new_v4();
    let config = SessionConfig::parse(definition(session, node, Uuid::new_v4()), node).unwrap();

    assert_eq!(
        config.definition("renderer")["workingDirectory"],
        "/var/tmp"
    );
    assert_eq!(config.context("gl")["environment"]["CTX_VAR"], "1");
    assert!(config.context("missing").is_null());
}

#[test]
fn non_entry_node_parses_without_entry_flag() {
    let session = Uuid::new_v4();
    let node = Uuid::new_v4();
    let other = Uuid::new_v4();
    // parse from the other node's perspective: it hosts "merge"
    let mut desc = definition(session, node, other);
    let node_config = desc[node.to_string()].clone();
    desc[other.to_string()] = node_config;
    desc[other.to_string()]["config"]["computations"] = serde_json::json!({
        "merge": { "requirements": { "resources": { "memoryMB": 1024 } } }
    });

    let config = SessionConfig::parse(desc, other).expect("definition must parse");
    assert!(!config.is_entry_node());
    assert_eq!(config.computations().len(), 1);
}

#[test]
fn missing_pieces_are_rejected() {
    let session = Uuid::new_v4();
    let node = Uuid::new_v4();

    // no config object for this node
    let err = SessionConfig::parse(serde_json::json!({ "routing": {} }), node)
        .expect_err("must reject");
    assert!(err.to_string().contains("no config object"));

    // config present but no routing
    let mut desc = definition(session, node, Uuid::new_v4());
    desc.as_object_mut().unwrap().remove("routing");
    assert!(SessionConfig::parse(desc, node).is_err());
}
