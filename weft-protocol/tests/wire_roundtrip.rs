//! Exercises the frame envelope, method catalog, and content properties
//! together against a single simulated byte stream, the way a connection's
//! receiver loop would see them arrive back to back.

use bytes::{Bytes, BytesMut};

use weft_protocol::catalog::{decode_args, encode_args, find_method, ArgValue, CLASS_CONNECTION};
use weft_protocol::properties::{decode_properties, encode_properties, BASIC_PROPERTIES};
use weft_protocol::{BodyFrame, Frame, FrameKind, HeaderFrame, MethodFrame};

#[test]
fn publish_sequence_decodes_across_three_frame_kinds() {
    // A publisher's wire traffic for one message: a Basic.Publish method
    // frame (reusing connection.open's shortstr/shortstr/bit shape as a
    // stand-in schema, since `basic` methods aren't in this catalog),
    // followed by a content header and a single body chunk.
    let descriptor = find_method(CLASS_CONNECTION, 40).unwrap();
    let method_args = encode_args(
        descriptor.args,
        &[ArgValue::ShortStr("/".to_string()), ArgValue::ShortStr(String::new()), ArgValue::Bit(false)],
    )
    .unwrap();
    let method_frame = MethodFrame { channel: 1, class_id: CLASS_CONNECTION, method_id: 40, args: method_args.freeze() };

    let mut props: Vec<Option<ArgValue>> = vec![None; BASIC_PROPERTIES.len()];
    props[0] = Some(ArgValue::ShortStr("application/json".to_string()));
    props[3] = Some(ArgValue::Octet(2));
    let (flags, encoded_props) = encode_properties(BASIC_PROPERTIES, &props);
    let body = Bytes::from_static(b"{\"ok\":true}");
    let header_frame = HeaderFrame { channel: 1, class_id: CLASS_CONNECTION, body_size: body.len() as u64, property_flags: flags, properties: encoded_props };

    let body_frame = BodyFrame { channel: 1, payload: body.clone() };

    let mut wire = BytesMut::new();
    wire.extend_from_slice(&method_frame.encode().encode());
    wire.extend_from_slice(&header_frame.encode().encode());
    wire.extend_from_slice(&body_frame.encode().encode());
    let mut cursor = wire.freeze();

    let f1 = Frame::decode(&mut cursor).unwrap();
    assert_eq!(f1.kind, FrameKind::Method);
    let decoded_method = MethodFrame::try_from(f1).unwrap();
    let decoded_args = decode_args(descriptor.args, &mut decoded_method.args.clone()).unwrap();
    assert_eq!(decoded_args[0], ArgValue::ShortStr("/".to_string()));

    let f2 = Frame::decode(&mut cursor).unwrap();
    assert_eq!(f2.kind, FrameKind::Header);
    let decoded_header = HeaderFrame::try_from(f2).unwrap();
    assert_eq!(decoded_header.body_size, body.len() as u64);
    let decoded_props = decode_properties(BASIC_PROPERTIES, decoded_header.property_flags, &mut decoded_header.properties.clone()).unwrap();
    assert_eq!(decoded_props[0], Some(ArgValue::ShortStr("application/json".to_string())));
    assert_eq!(decoded_props[3], Some(ArgValue::Octet(2)));

    let f3 = Frame::decode(&mut cursor).unwrap();
    assert_eq!(f3.kind, FrameKind::Body);
    let decoded_body = BodyFrame::try_from(f3).unwrap();
    assert_eq!(decoded_body.payload, body);

    assert!(cursor.is_empty());
}

#[test]
fn decoding_stops_cleanly_at_a_truncated_trailing_frame() {
    let descriptor = find_method(CLASS_CONNECTION, 51).unwrap();
    let args = encode_args(descriptor.args, &[]).unwrap();
    let full = MethodFrame { channel: 0, class_id: CLASS_CONNECTION, method_id: 51, args: args.freeze() }.encode().encode();

    let mut wire = BytesMut::new();
    wire.extend_from_slice(&full);
    wire.extend_from_slice(&full[..full.len() - 2]); // a second frame, cut short

    let mut cursor = wire.freeze();
    let first = Frame::decode(&mut cursor).unwrap();
    assert_eq!(first.kind, FrameKind::Method);

    assert_eq!(Frame::decode(&mut cursor), Err(weft_protocol::ProtocolError::Truncated));
}
