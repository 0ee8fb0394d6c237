//! Content header properties: the ordered, flag-selected property list
//! carried by a Header frame's payload (see `crate::frame::HeaderFrame`).
//!
//! The property-flags mechanism is generic wire structure, so it is
//! implemented once here and instantiated with the real AMQP 0-9-1 `basic`
//! class's 14 standard properties — the only content property list defined
//! by the protocol, and the natural concrete case for exercising the header
//! codec end to end (see `DESIGN.md`).

use bytes::{Bytes, BytesMut};

use crate::catalog::{ArgSchema, ArgType, ArgValue};
use crate::error::ProtocolError;
use crate::value::{read_short_str, read_u16, read_u64, read_u8, write_short_str, write_u16, write_u64, write_u8};

macro_rules! prop {
    ($name:expr, $kind:ident) => {
        ArgSchema { name: $name, kind: ArgType::$kind }
    };
}

/// The `basic` class's 14 standard content properties, in flag-bit order
/// (the first entry is selected by the highest-order flag bit).
pub static BASIC_PROPERTIES: &[ArgSchema] = &[
    prop!("content-type", ShortStr),
    prop!("content-encoding", ShortStr),
    prop!("headers", Table),
    prop!("delivery-mode", Octet),
    prop!("priority", Octet),
    prop!("correlation-id", ShortStr),
    prop!("reply-to", ShortStr),
    prop!("expiration", ShortStr),
    prop!("message-id", ShortStr),
    prop!("timestamp", Timestamp),
    prop!("type", ShortStr),
    prop!("user-id", ShortStr),
    prop!("app-id", ShortStr),
    prop!("cluster-id", ShortStr),
];

/// Encode a sparse set of properties against a schema, returning the
/// property-flags bitmap and the serialized property values in schema order.
///
/// `schema` must have at most 15 entries: the flags word reserves bit 0 as a
/// continuation marker for a second flags word, which none of this crate's
/// property lists need.
pub fn encode_properties(schema: &[ArgSchema], props: &[Option<ArgValue>]) -> (u16, Bytes) {
    assert_eq!(schema.len(), props.len(), "property count does not match schema");
    assert!(schema.len() <= 15, "property list too long for a single flags word");

    let mut flags: u16 = 0;
    let mut out = BytesMut::new();
    for (i, (arg, value)) in schema.iter().zip(props).enumerate() {
        let Some(value) = value else { continue };
        flags |= 1 << (15 - i);
        match (arg.kind, value) {
            (ArgType::Octet, ArgValue::Octet(v)) => write_u8(&mut out, *v),
            (ArgType::Short, ArgValue::Short(v)) => write_u16(&mut out, *v),
            (ArgType::ShortStr, ArgValue::ShortStr(s)) => {
                write_short_str(&mut out, s).expect("property value must fit in a short string")
            }
            (ArgType::Table, ArgValue::Table(t)) => out.extend_from_slice(&crate::value::encode_field_table(t)),
            (ArgType::Timestamp, ArgValue::Timestamp(v)) => write_u64(&mut out, *v),
            (kind, value) => panic!("property '{}' expects {kind:?}, got {value:?}", arg.name),
        }
    }
    (flags, out.freeze())
}

/// Decode a property list given its flags word, consuming exactly the bytes
/// the present properties occupy.
pub fn decode_properties(
    schema: &[ArgSchema],
    flags: u16,
    buf: &mut Bytes,
) -> Result<Vec<Option<ArgValue>>, ProtocolError> {
    assert!(schema.len() <= 15, "property list too long for a single flags word");

    let mut props = Vec::with_capacity(schema.len());
    for (i, arg) in schema.iter().enumerate() {
        if flags & (1 << (15 - i)) == 0 {
            props.push(None);
            continue;
        }
        let value = match arg.kind {
            ArgType::Octet => ArgValue::Octet(read_u8(buf)?),
            ArgType::Short => ArgValue::Short(read_u16(buf)?),
            ArgType::ShortStr => ArgValue::ShortStr(read_short_str(buf)?),
            ArgType::Table => ArgValue::Table(crate::value::decode_field_table(buf)?),
            ArgType::Timestamp => ArgValue::Timestamp(read_u64(buf)?),
            other => panic!("property schema has unsupported type {other:?}"),
        };
        props.push(Some(value));
    }
    Ok(props)
}
