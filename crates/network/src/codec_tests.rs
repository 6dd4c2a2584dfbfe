use futures_util::StreamExt;
use meridian_primitives::{KvRequest, WireMessage};
use tokio_test::io::Builder;
use tokio_util::codec::FramedRead;

use super::*;

#[test]
fn encoding_then_decoding_preserves_frames() {
    let request = WireMessage::Request {
        id: Some(1),
        request: KvRequest::PeerDump,
    };
    let hello = WireMessage::Hello {
        node_id: "node-a".to_owned(),
        connect_id: "node-a::node-b::1".to_owned(),
    };

    let mut buffer = BytesMut::new();
    let mut codec = JsonCodec::<WireMessage>::new();
    codec.encode(request.clone(), &mut buffer).expect("encode request");
    codec.encode(hello.clone(), &mut buffer).expect("encode hello");

    let decoded = codec.decode(&mut buffer).expect("decode");
    assert_eq!(decoded, Some(request));

    let decoded = codec.decode(&mut buffer).expect("decode");
    assert_eq!(decoded, Some(hello));

    assert_eq!(codec.decode(&mut buffer).expect("decode"), None);
}

#[test]
fn partial_frame_yields_nothing() {
    let message = WireMessage::Request {
        id: None,
        request: KvRequest::FloodTopoGet,
    };

    let mut buffer = BytesMut::new();
    let mut codec = JsonCodec::<WireMessage>::new();
    codec.encode(message, &mut buffer).expect("encode");

    let total = buffer.len();
    let mut partial = buffer.split_to(total - 1);
    assert_eq!(codec.decode(&mut partial).expect("decode"), None);
}

#[tokio::test]
async fn frames_stream_off_a_socket() {
    let first = WireMessage::Request {
        id: Some(7),
        request: KvRequest::CountersGet,
    };
    let second = WireMessage::Request {
        id: None,
        request: KvRequest::PeerDump,
    };

    let mut buffer = BytesMut::new();
    let mut codec = JsonCodec::<WireMessage>::new();
    codec.encode(first.clone(), &mut buffer).expect("encode");
    codec.encode(second.clone(), &mut buffer).expect("encode");

    let mut stream = Builder::new().read(&buffer.freeze()).build();
    let mut framed = FramedRead::new(&mut stream, JsonCodec::<WireMessage>::new());

    assert_eq!(framed.next().await.expect("first").expect("ok"), first);
    assert_eq!(framed.next().await.expect("second").expect("ok"), second);
    assert!(framed.next().await.is_none());
}
