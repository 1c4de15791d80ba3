//! Gateway-facing properties that don't need a live socket: the frame codec
//! round-trip (plain and AES-ECB+base64-wrapped) and the session `userId`
//! invariant from the core spec ("empty before Bind, non-empty after,
//! until UnBind").

use nodemesh::gateway::frame::FrameCodec;
use nodemesh::gateway::session::{InMemorySessionStore, Session};

#[test]
fn plain_frame_round_trips_topic_and_payload() {
    let codec = FrameCodec::plain();
    let frame = codec.encode("Room/Join", b"{\"id\":42}").unwrap();

    // first two bytes are the little-endian total length prefix
    let total_len = u16::from_le_bytes([frame[0], frame[1]]) as usize;
    assert_eq!(total_len, frame.len() - 2);

    let (topic, payload) = codec.decode_body(&frame[2..]).unwrap();
    assert_eq!(topic, "Room/Join");
    assert_eq!(payload, b"{\"id\":42}");
}

#[test]
fn encrypted_frame_round_trips_through_aes_ecb_and_base64() {
    let key = *b"0123456789abcdef";
    let codec = FrameCodec::new(Some(key));
    let frame = codec.encode("chat/send", b"hello world").unwrap();

    let (topic, payload) = codec.decode_body(&frame[2..]).unwrap();
    assert_eq!(topic, "chat/send");
    assert_eq!(payload, b"hello world");
}

#[test]
fn empty_topic_and_payload_round_trip_as_a_keep_alive_shaped_frame() {
    let codec = FrameCodec::plain();
    let frame = codec.encode("", b"").unwrap();
    let (topic, payload) = codec.decode_body(&frame[2..]).unwrap();
    assert_eq!(topic, "");
    assert!(payload.is_empty());
}

#[test]
fn topic_longer_than_u16_is_rejected_at_encode_time() {
    let codec = FrameCodec::plain();
    let oversized_topic = "x".repeat(u16::MAX as usize + 1);
    assert!(codec.encode(&oversized_topic, b"").is_err());
}

#[tokio::test]
async fn session_user_id_is_empty_until_bind_and_clears_on_unbind() {
    let store = InMemorySessionStore::new();
    let session = Session::new("127.0.0.1", "tcp", "gateway@i-1");

    assert_eq!(session.user_id().await, "");
    assert!(!session.is_bound().await);

    session.bind("user-42", store.as_ref()).await.unwrap();
    assert_eq!(session.user_id().await, "user-42");
    assert!(session.is_bound().await);

    session.unbind().await;
    assert_eq!(session.user_id().await, "");
    assert!(!session.is_bound().await);
}

#[tokio::test]
async fn bind_merges_prior_settings_from_the_store_without_clobbering_fresh_writes() {
    let store = InMemorySessionStore::new();
    store
        .save("user-7", &[("theme".to_string(), "dark".to_string())].into_iter().collect())
        .await
        .unwrap();

    let session = Session::new("127.0.0.1", "tcp", "gateway@i-1");
    session.set("locale", "en", store.as_ref()).await.unwrap();
    let merged = session.bind("user-7", store.as_ref()).await.unwrap();

    assert_eq!(merged.get("theme").map(String::as_str), Some("dark"));
    assert_eq!(merged.get("locale").map(String::as_str), Some("en"));
}
