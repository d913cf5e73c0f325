//! Registration record encoding and validation.

use uuid::Uuid;

use arras_node::protocol::registration::{Registration, REGISTRATION_BYTES};
use arras_node::protocol::{PeerClass, API_VERSION};

#[test]
fn encode_then_decode_round_trips() {
    let mut reg = Registration::new(PeerClass::Executor);
    reg.node_id = Uuid::new_v4();
    reg.session_id = Uuid::new_v4();
    reg.computation_id = Uuid::new_v4();

    let raw = reg.encode();
    let decoded = Registration::decode(&raw).expect("valid record must decode");
    assert_eq!(decoded, reg);
}

#[test]
fn record_is_fixed_width() {
    let raw = Registration::new(PeerClass::Client).encode();
    assert_eq!(raw.len(), REGISTRATION_BYTES);
}

#[test]
fn wrong_magic_is_refused() {
    let mut raw = Registration::new(PeerClass::Client).encode();
    raw[0] ^= 0xff;

    let err = Registration::decode(&raw).expect_err("bad magic must fail");
    assert!(
        err.to_string().contains("unsupported connection type"),
        "unexpected error: {err}"
    );
}

#[test]
fn major_version_mismatch_is_refused() {
    let mut reg = Registration::new(PeerClass::Node);
    reg.api_major = API_VERSION.0 + 1;

    let err = Registration::decode(&reg.encode()).expect_err("version mismatch must fail");
    assert!(
        err.to_string().contains("version mismatch"),
        "unexpected error: {err}"
    );
}

#[test]
fn minor_and_patch_versions_do_not_block() {
    let mut reg = Registration::new(PeerClass::Node);
    reg.api_minor = API_VERSION.1 + 7;
    reg.api_patch = API_VERSION.2 + 3;

    assert!(Registration::decode(&reg.encode()).is_ok());
}

#[test]
fn unknown_peer_class_is_refused() {
    let mut raw = Registration::new(PeerClass::Control).encode();
    // class byte sits after magic and the three version fields
    raw[10] = 0xee;
    assert!(Registration::decode(&raw).is_err());
}
