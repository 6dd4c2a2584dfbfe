use super::*;
use crate::value::Value;

#[test]
fn requests_roundtrip_through_json() {
    let mut key_vals = BTreeMap::new();
    let _ = key_vals.insert(
        "adj:node-a".to_owned(),
        Value::new(2, "node-a", b"payload".to_vec(), 30_000),
    );

    let request = KvRequest::KeySet(KeySetParams {
        key_vals,
        expired_keys: vec!["prefix:node-c".to_owned()],
        solicit_response: true,
        node_ids: Some(vec!["node-b".to_owned()]),
        flood_root_id: Some("node-a".to_owned()),
    });

    let encoded = serde_json::to_vec(&request).expect("encode");
    let decoded: KvRequest = serde_json::from_slice(&encoded).expect("decode");
    assert_eq!(request, decoded);
}

#[test]
fn request_without_id_marks_fire_and_forget() {
    let message = WireMessage::Request {
        id: None,
        request: KvRequest::PeerDump,
    };

    let encoded = serde_json::to_string(&message).expect("encode");
    assert!(!encoded.contains("\"id\""));

    let decoded: WireMessage = serde_json::from_str(&encoded).expect("decode");
    assert_eq!(message, decoded);
}

#[test]
fn error_response_is_distinguishable() {
    let response = KvResponse::Error("missing params".to_owned());
    let encoded = serde_json::to_vec(&response).expect("encode");
    let decoded: KvResponse = serde_json::from_slice(&encoded).expect("decode");
    assert!(matches!(decoded, KvResponse::Error(reason) if reason == "missing params"));
}
