//! End-to-end router flows over real sockets: control handshake, session
//! initialization, computation registration, client stash-and-deliver,
//! addressing, and the node-to-node tie-break.

use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpStream, UnixStream};
use uuid::Uuid;

use arras_node::protocol::messages::{
    RoutingAction, SessionRoutingDataMessage,
};
use arras_node::protocol::registration::write_registration;
use arras_node::protocol::{
    Address, Connection, Content, Envelope, Metadata, PeerClass, Registration, SocketStream,
};
use arras_node::router::NodeRouter;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

async fn connect_unix(path: &std::path::Path, reg: &Registration) -> Connection {
    let stream = UnixStream::connect(path).await.expect("ipc connect");
    let mut stream = SocketStream::Unix(stream);
    write_registration(&mut stream, reg).await.expect("register");
    Connection::new(stream)
}

async fn connect_tcp(port: u16, reg: &Registration) -> Connection {
    let stream = TcpStream::connect(("127.0.0.1", port))
        .await
        .expect("tcp connect");
    let mut stream = SocketStream::Tcp(stream);
    write_registration(&mut stream, reg).await.expect("register");
    Connection::new(stream)
}

async fn recv(connection: &mut Connection) -> Envelope {
    let mut envelope = tokio::time::timeout(RECV_TIMEOUT, connection.reader.next())
        .await
        .expect("read timed out")
        .expect("stream closed")
        .expect("frame error");
    envelope.deserialize_content().expect("payload parses");
    envelope
}

async fn send(connection: &mut Connection, envelope: Envelope) {
    connection.writer.send(envelope).await.expect("write");
}

/// Routing object for one session spanning `nodes`, with `computations`
/// placed by name and an accept-all message filter.
fn routing_json(
    session: Uuid,
    nodes: &[(Uuid, u16, bool)],
    computations: &[(&str, Uuid, Uuid)],
) -> serde_json::Value {
    let mut node_map = serde_json::Map::new();
    for (id, port, entry) in nodes {
        node_map.insert(
            id.to_string(),
            serde_json::json!({ "host": "localhost", "ip": "127.0.0.1", "tcp": port, "entry": entry }),
        );
    }
    let mut comp_map = serde_json::Map::new();
    for (name, node, comp) in computations {
        comp_map.insert(
            (*name).to_owned(),
            serde_json::json!({ "nodeId": node.to_string(), "compId": comp.to_string() }),
        );
    }
    let mut root = serde_json::Map::new();
    root.insert(
        session.to_string(),
        serde_json::json!({ "nodes": node_map, "computations": comp_map }),
    );
    root.insert("messageFilter".into(), serde_json::json!({}));
    serde_json::Value::Object(root)
}

async fn initialize_session(
    control: &mut Connection,
    session: Uuid,
    routing: &serde_json::Value,
) {
    send(
        control,
        Envelope::from_content(Content::RoutingData(SessionRoutingDataMessage {
            action: RoutingAction::Initialize,
            session_id: session,
            routing_data: routing.to_string(),
        })),
    )
    .await;
    let ack = recv(control).await;
    match ack.content() {
        Some(Content::RoutingData(msg)) => {
            assert_eq!(msg.action, RoutingAction::Acknowledge);
            assert_eq!(msg.session_id, session);
        }
        other => panic!("expected routing acknowledge, got {other:?}"),
    }
}

fn app_envelope(from: Address, to: Vec<Address>, routing_name: &str) -> Envelope {
    Envelope::opaque(
        Uuid::new_v4(),
        0,
        Metadata {
            from,
            to,
            routing_name: routing_name.into(),
        },
        Bytes::from_static(b"frame data"),
    )
}

#[tokio::test]
async fn control_receives_router_info_then_session_ack() {
    let dir = tempfile::tempdir().unwrap();
    let ipc = dir.path().join("router.sock");
    let node_id = Uuid::new_v4();
    let router = NodeRouter::start(node_id, 0, &ipc).await.expect("router starts");

    let mut reg = Registration::new(PeerClass::Control);
    reg.node_id = node_id;
    let mut control = connect_unix(&ipc, &reg).await;

    // first message on a fresh control connection is the router's port
    let info = recv(&mut control).await;
    match info.content() {
        Some(Content::RouterInfo(msg)) => {
            assert_eq!(msg.message_port, router.message_port());
        }
        other => panic!("expected router info, got {other:?}"),
    }

    let session = Uuid::new_v4();
    let routing = routing_json(session, &[(node_id, router.message_port(), true)], &[]);
    initialize_session(&mut control, session, &routing).await;
    assert!(router.routing_table().get(session).is_some());

    router.shutdown();
}

#[tokio::test]
async fn executor_client_and_stash_flow() {
    let dir = tempfile::tempdir().unwrap();
    let ipc = dir.path().join("router.sock");
    let node_id = Uuid::new_v4();
    let session = Uuid::new_v4();
    let comp = Uuid::new_v4();
    let router = NodeRouter::start(node_id, 0, &ipc).await.unwrap();

    let mut control_reg = Registration::new(PeerClass::Control);
    control_reg.node_id = node_id;
    let mut control = connect_unix(&ipc, &control_reg).await;
    recv(&mut control).await; // router info

    let routing = routing_json(
        session,
        &[(node_id, router.message_port(), true)],
        &[("renderer", node_id, comp)],
    );
    initialize_session(&mut control, session, &routing).await;

    // computation registers over the IPC socket
    let mut exec_reg = Registration::new(PeerClass::Executor);
    exec_reg.node_id = node_id;
    exec_reg.session_id = session;
    exec_reg.computation_id = comp;
    let mut executor = connect_unix(&ipc, &exec_reg).await;

    // the agent hears the computation is ready
    let ready = recv(&mut control).await;
    match ready.content() {
        Some(Content::ComputationStatus(msg)) => {
            assert_eq!(msg.computation_id, comp);
            assert_eq!(msg.status, "ready");
        }
        other => panic!("expected computation status, got {other:?}"),
    }

    // sent before the client connects: must be stashed, not dropped
    send(
        &mut executor,
        app_envelope(
            Address::new(session, node_id, comp),
            vec![Address::client(session)],
            "StatusUpdate",
        ),
    )
    .await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut client_reg = Registration::new(PeerClass::Client);
    client_reg.session_id = session;
    let mut client = connect_tcp(router.message_port(), &client_reg).await;

    let connected = recv(&mut control).await;
    match connected.content() {
        Some(Content::ClientConnectionStatus(msg)) => {
            assert_eq!(msg.session_id, session);
            assert_eq!(msg.reason, "connected");
        }
        other => panic!("expected connection status, got {other:?}"),
    }

    // the stashed envelope arrives as the client's first frame
    let stashed = recv(&mut client).await;
    assert_eq!(stashed.metadata.routing_name, "StatusUpdate");
    assert_eq!(stashed.payload_bytes().unwrap(), Bytes::from_static(b"frame data"));

    // a client message with no destinations is addressed by the filter
    // rules and lands on the computation
    send(
        &mut client,
        app_envelope(Address::client(session), Vec::new(), "RenderSetup"),
    )
    .await;
    let delivered = recv(&mut executor).await;
    assert_eq!(delivered.metadata.routing_name, "RenderSetup");
    assert_eq!(delivered.to().len(), 1);
    assert_eq!(delivered.to()[0].computation, comp);
    assert_eq!(delivered.to()[0].node, node_id);

    router.shutdown();
}

#[tokio::test]
async fn node_tie_break_settles_on_one_connection() {
    let dir = tempfile::tempdir().unwrap();
    // deterministic ids: node B is the greater, so B must end up the
    // initiator no matter who dials first
    let node_a = Uuid::from_u128(1);
    let node_b = Uuid::from_u128(2);
    let session = Uuid::new_v4();
    let comp_a = Uuid::new_v4();
    let comp_b = Uuid::new_v4();

    let ipc_a = dir.path().join("a.sock");
    let ipc_b = dir.path().join("b.sock");
    let router_a = NodeRouter::start(node_a, 0, &ipc_a).await.unwrap();
    let router_b = NodeRouter::start(node_b, 0, &ipc_b).await.unwrap();

    let mut reg_a = Registration::new(PeerClass::Control);
    reg_a.node_id = node_a;
    let mut control_a = connect_unix(&ipc_a, &reg_a).await;
    recv(&mut control_a).await; // router info
    let mut reg_b = Registration::new(PeerClass::Control);
    reg_b.node_id = node_b;
    let mut control_b = connect_unix(&ipc_b, &reg_b).await;
    recv(&mut control_b).await;

    let routing = routing_json(
        session,
        &[
            (node_a, router_a.message_port(), true),
            (node_b, router_b.message_port(), false),
        ],
        &[("front", node_a, comp_a), ("back", node_b, comp_b)],
    );
    initialize_session(&mut control_a, session, &routing).await;
    initialize_session(&mut control_b, session, &routing).await;

    let mut exec_reg_a = Registration::new(PeerClass::Executor);
    exec_reg_a.node_id = node_a;
    exec_reg_a.session_id = session;
    exec_reg_a.computation_id = comp_a;
    let mut executor_a = connect_unix(&ipc_a, &exec_reg_a).await;
    recv(&mut control_a).await; // ready

    let mut exec_reg_b = Registration::new(PeerClass::Executor);
    exec_reg_b.node_id = node_b;
    exec_reg_b.session_id = session;
    exec_reg_b.computation_id = comp_b;
    let mut executor_b = connect_unix(&ipc_b, &exec_reg_b).await;
    recv(&mut control_b).await; // ready

    // the lesser node dials first; the greater node must refuse the
    // inbound and connect back, and the message must still arrive
    send(
        &mut executor_a,
        app_envelope(
            Address::new(session, node_a, comp_a),
            vec![Address::new(session, node_b, comp_b)],
            "CrossHost",
        ),
    )
    .await;
    let arrived = recv(&mut executor_b).await;
    assert_eq!(arrived.metadata.routing_name, "CrossHost");
    assert_eq!(arrived.to()[0].computation, comp_b);

    // the reverse direction reuses the settled connection
    send(
        &mut executor_b,
        app_envelope(
            Address::new(session, node_b, comp_b),
            vec![Address::new(session, node_a, comp_a)],
            "CrossHostReply",
        ),
    )
    .await;
    let replied = recv(&mut executor_a).await;
    assert_eq!(replied.metadata.routing_name, "CrossHostReply");

    // exactly one peer record for the other node on both sides
    assert!(router_a.registry().find_node(node_b).is_some());
    assert!(router_b.registry().find_node(node_a).is_some());

    // a data envelope for a session the receiving node never heard of is
    // dropped with a warning; the node connection survives, so a
    // follow-up envelope still arrives
    send(
        &mut executor_a,
        app_envelope(
            Address::new(session, node_a, comp_a),
            vec![Address::new(Uuid::new_v4(), node_b, Uuid::new_v4())],
            "Lost",
        ),
    )
    .await;
    send(
        &mut executor_a,
        app_envelope(
            Address::new(session, node_a, comp_a),
            vec![Address::new(session, node_b, comp_b)],
            "StillAlive",
        ),
    )
    .await;
    let alive = recv(&mut executor_b).await;
    assert_eq!(alive.metadata.routing_name, "StillAlive");

    router_a.shutdown();
    router_b.shutdown();
}
