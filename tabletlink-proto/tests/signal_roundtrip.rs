use k9::assert_equal;
use tabletlink_proto::signal::{IceCandidate, SignalKind, SignalingEnvelope};

#[test]
fn test_login_serialization() {
    let original = SignalingEnvelope::login("P1");

    let json = serde_json::to_string(&original).unwrap();
    assert_equal!(json, r#"{"type":"login_notify","id":"P1"}"#);
    let decoded: SignalingEnvelope = serde_json::from_str(&json).unwrap();

    assert_equal!(decoded, original);
}

#[test]
fn test_offer_serialization() {
    let original = SignalingEnvelope::offer("P2", "v=0\r\no=- 1 2 IN IP4 127.0.0.1\r\n");

    let json = serde_json::to_string(&original).unwrap();
    let decoded: SignalingEnvelope = serde_json::from_str(&json).unwrap();

    assert_equal!(decoded.kind, SignalKind::Offer);
    assert_equal!(decoded.target.as_deref(), Some("P2"));
    assert_equal!(decoded, original);
}

#[test]
fn test_answer_targets_host() {
    let answer = SignalingEnvelope::answer("P1", "answer-sdp");
    assert_equal!(answer.target.as_deref(), Some("host"));
    assert_equal!(answer.id.as_deref(), Some("P1"));
    assert_equal!(answer.sender(), Some("P1"));
}

#[test]
fn test_candidate_uses_wire_field_names() {
    let original = SignalingEnvelope::candidate(
        "host",
        Some("P1".to_string()),
        IceCandidate {
            candidate: "candidate:1 1 udp 2122260223 192.168.1.5 54321 typ host".to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
        },
    );

    let value = serde_json::to_value(&original).unwrap();
    assert_equal!(value["type"], "candidate");
    assert_equal!(value["sdpMid"], "0");
    assert_equal!(value["sdpMLineIndex"], 0);

    let decoded: SignalingEnvelope = serde_json::from_value(value).unwrap();
    assert_equal!(decoded.ice_candidate(), original.ice_candidate());
}

#[test]
fn test_empty_strings_decode_as_absent() {
    // Shape produced by clients that serialize every field.
    let json = r#"{"type":"answer","id":"P1","from":"","target":"host","sdp":"x","candidate":"","sdpMid":"","sdpMLineIndex":0}"#;
    let decoded: SignalingEnvelope = serde_json::from_str(json).unwrap();

    assert_equal!(decoded.from, None);
    assert_equal!(decoded.candidate, None);
    assert_equal!(decoded.sdp_mid, None);
    assert_equal!(decoded.sdp_mline_index, Some(0));
    assert_equal!(decoded.ice_candidate(), None);
}

#[test]
fn test_sender_prefers_relay_stamp() {
    let mut envelope = SignalingEnvelope::answer("P2", "sdp");
    envelope.from = Some("P1".to_string());
    assert_equal!(envelope.sender(), Some("P1"));
}

#[test]
fn test_unknown_type_is_rejected() {
    let json = r#"{"type":"bye","id":"P1"}"#;
    assert!(serde_json::from_str::<SignalingEnvelope>(json).is_err());
}
