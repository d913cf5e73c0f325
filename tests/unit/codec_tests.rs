//! Frame codec: round trips, partial buffering, bad lengths.

use bytes::{BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use uuid::Uuid;

use arras_node::protocol::{Address, Envelope, FrameCodec, Metadata};

fn sample_envelope() -> Envelope {
    let session = Uuid::new_v4();
    let metadata = Metadata {
        from: Address::new(session, Uuid::new_v4(), Uuid::new_v4()),
        to: vec![Address::client(session)],
        routing_name: "TestMessage".into(),
    };
    Envelope::opaque(
        Uuid::new_v4(),
        2,
        metadata,
        Bytes::from_static(b"payload bytes"),
    )
}

#[test]
fn encode_then_decode_preserves_envelope() {
    let mut codec = FrameCodec::new();
    let envelope = sample_envelope();

    let mut buf = BytesMut::new();
    codec
        .encode(envelope.clone(), &mut buf)
        .expect("encode must succeed");

    let decoded = codec
        .decode(&mut buf)
        .expect("decode must succeed")
        .expect("a full frame must be present");

    assert_eq!(decoded.class_id, envelope.class_id);
    assert_eq!(decoded.version, envelope.version);
    assert_eq!(decoded.metadata, envelope.metadata);
    assert_eq!(
        decoded.payload_bytes().unwrap(),
        envelope.payload_bytes().unwrap()
    );
    assert!(buf.is_empty(), "decode must consume the whole frame");
}

#[test]
fn partial_frame_is_buffered_until_complete() {
    let mut codec = FrameCodec::new();
    let mut full = BytesMut::new();
    codec
        .encode(sample_envelope(), &mut full)
        .expect("encode must succeed");

    // feed all but the last byte
    let mut buf = BytesMut::from(&full[..full.len() - 1]);
    assert!(
        codec.decode(&mut buf).expect("no error on partial").is_none(),
        "incomplete frame must not decode"
    );

    buf.put_u8(full[full.len() - 1]);
    assert!(
        codec.decode(&mut buf).expect("decode must succeed").is_some(),
        "completed frame must decode"
    );
}

#[test]
fn two_frames_in_one_buffer_decode_separately() {
    let mut codec = FrameCodec::new();
    let mut buf = BytesMut::new();
    codec.encode(sample_envelope(), &mut buf).unwrap();
    codec.encode(sample_envelope(), &mut buf).unwrap();

    assert!(codec.decode(&mut buf).unwrap().is_some());
    assert!(codec.decode(&mut buf).unwrap().is_some());
    assert!(codec.decode(&mut buf).unwrap().is_none());
}

#[test]
fn undersized_length_prefix_is_a_protocol_error() {
    let mut codec = FrameCodec::new();
    let mut buf = BytesMut::new();
    // total_len smaller than the fixed header can never be valid
    buf.put_u32_le(4);
    buf.put_slice(&[0u8; 8]);

    let err = codec.decode(&mut buf).expect_err("must reject bad length");
    assert!(err.to_string().contains("invalid frame length"));
}

#[test]
fn mismatched_section_lengths_are_a_protocol_error() {
    let mut codec = FrameCodec::new();
    let mut good = BytesMut::new();
    codec.encode(sample_envelope(), &mut good).unwrap();

    // corrupt the payload length field (offset: 4 len + 16 class + 2 version + 4 metadata_len)
    let offset = 4 + 16 + 2 + 4;
    let mut bad = BytesMut::from(&good[..]);
    bad[offset] ^= 0xff;

    assert!(codec.decode(&mut bad).is_err());
}
