//! The static method catalog: per-(class, method) argument schemas, used to
//! drive generic parsing/construction of method payloads instead of a
//! generated enum-per-method union type.
//!
//! Argument schemas are cross-checked against the real AMQP 0-9-1 wire
//! format (`amq-protocol`/`lapin` reference sources), not invented.

use std::sync::LazyLock;

use bytes::{Bytes, BytesMut};

use crate::error::ProtocolError;
use crate::value::{
    read_short_str, read_u16, read_u32, read_u64, write_long_str, write_short_str, write_u16,
    write_u32, write_u64, BitReader, BitWriter, FieldTable,
};

pub const CLASS_CONNECTION: u16 = 10;
pub const CLASS_CHANNEL: u16 = 20;

/// The wire type of a single method argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgType {
    Bit,
    Octet,
    Short,
    Long,
    LongLong,
    ShortStr,
    LongStr,
    Table,
    Timestamp,
}

/// A decoded (or to-be-encoded) method argument value.
#[derive(Debug, Clone, PartialEq)]
pub enum ArgValue {
    Bit(bool),
    Octet(u8),
    Short(u16),
    Long(u32),
    LongLong(u64),
    ShortStr(String),
    LongStr(Bytes),
    Table(FieldTable),
    Timestamp(u64),
}

impl ArgValue {
    fn type_name(&self) -> &'static str {
        match self {
            ArgValue::Bit(_) => "bit",
            ArgValue::Octet(_) => "octet",
            ArgValue::Short(_) => "short",
            ArgValue::Long(_) => "long",
            ArgValue::LongLong(_) => "longlong",
            ArgValue::ShortStr(_) => "shortstr",
            ArgValue::LongStr(_) => "longstr",
            ArgValue::Table(_) => "table",
            ArgValue::Timestamp(_) => "timestamp",
        }
    }
}

/// A single named argument in a method's schema.
#[derive(Debug, Clone, Copy)]
pub struct ArgSchema {
    pub name: &'static str,
    pub kind: ArgType,
}

/// A method's id, name, and ordered argument schema.
#[derive(Debug, Clone, Copy)]
pub struct MethodDescriptor {
    pub method_id: u16,
    pub name: &'static str,
    pub args: &'static [ArgSchema],
}

/// A class's id, name, and the methods it defines.
#[derive(Debug, Clone, Copy)]
pub struct ClassDescriptor {
    pub class_id: u16,
    pub name: &'static str,
    pub methods: &'static [MethodDescriptor],
}

macro_rules! arg {
    ($name:expr, $kind:ident) => {
        ArgSchema { name: $name, kind: ArgType::$kind }
    };
}

static CONNECTION_START_ARGS: &[ArgSchema] = &[
    arg!("version-major", Octet),
    arg!("version-minor", Octet),
    arg!("server-properties", Table),
    arg!("mechanisms", LongStr),
    arg!("locales", LongStr),
];

static CONNECTION_START_OK_ARGS: &[ArgSchema] = &[
    arg!("client-properties", Table),
    arg!("mechanism", ShortStr),
    arg!("response", LongStr),
    arg!("locale", ShortStr),
];

static CONNECTION_TUNE_ARGS: &[ArgSchema] =
    &[arg!("channel-max", Short), arg!("frame-max", Long), arg!("heartbeat", Short)];

static CONNECTION_TUNE_OK_ARGS: &[ArgSchema] = CONNECTION_TUNE_ARGS;

static CONNECTION_OPEN_ARGS: &[ArgSchema] =
    &[arg!("virtual-host", ShortStr), arg!("capabilities", ShortStr), arg!("insist", Bit)];

static CONNECTION_OPEN_OK_ARGS: &[ArgSchema] = &[arg!("known-hosts", ShortStr)];

static CONNECTION_CLOSE_ARGS: &[ArgSchema] = &[
    arg!("reply-code", Short),
    arg!("reply-text", ShortStr),
    arg!("class-id", Short),
    arg!("method-id", Short),
];

static CONNECTION_CLOSE_OK_ARGS: &[ArgSchema] = &[];

static CONNECTION_METHODS: &[MethodDescriptor] = &[
    MethodDescriptor { method_id: 10, name: "start", args: CONNECTION_START_ARGS },
    MethodDescriptor { method_id: 11, name: "start-ok", args: CONNECTION_START_OK_ARGS },
    MethodDescriptor { method_id: 30, name: "tune", args: CONNECTION_TUNE_ARGS },
    MethodDescriptor { method_id: 31, name: "tune-ok", args: CONNECTION_TUNE_OK_ARGS },
    MethodDescriptor { method_id: 40, name: "open", args: CONNECTION_OPEN_ARGS },
    MethodDescriptor { method_id: 41, name: "open-ok", args: CONNECTION_OPEN_OK_ARGS },
    MethodDescriptor { method_id: 50, name: "close", args: CONNECTION_CLOSE_ARGS },
    MethodDescriptor { method_id: 51, name: "close-ok", args: CONNECTION_CLOSE_OK_ARGS },
];

static CHANNEL_OPEN_ARGS: &[ArgSchema] = &[arg!("reserved-1", ShortStr)];
static CHANNEL_OPEN_OK_ARGS: &[ArgSchema] = &[arg!("reserved-1", LongStr)];
static CHANNEL_FLOW_ARGS: &[ArgSchema] = &[arg!("active", Bit)];
static CHANNEL_FLOW_OK_ARGS: &[ArgSchema] = &[arg!("active", Bit)];
static CHANNEL_CLOSE_ARGS: &[ArgSchema] = CONNECTION_CLOSE_ARGS;
static CHANNEL_CLOSE_OK_ARGS: &[ArgSchema] = &[];

static CHANNEL_METHODS: &[MethodDescriptor] = &[
    MethodDescriptor { method_id: 10, name: "open", args: CHANNEL_OPEN_ARGS },
    MethodDescriptor { method_id: 11, name: "open-ok", args: CHANNEL_OPEN_OK_ARGS },
    MethodDescriptor { method_id: 20, name: "flow", args: CHANNEL_FLOW_ARGS },
    MethodDescriptor { method_id: 21, name: "flow-ok", args: CHANNEL_FLOW_OK_ARGS },
    MethodDescriptor { method_id: 40, name: "close", args: CHANNEL_CLOSE_ARGS },
    MethodDescriptor { method_id: 41, name: "close-ok", args: CHANNEL_CLOSE_OK_ARGS },
];

static CLASSES: LazyLock<Vec<ClassDescriptor>> = LazyLock::new(|| {
    vec![
        ClassDescriptor { class_id: CLASS_CONNECTION, name: "connection", methods: CONNECTION_METHODS },
        ClassDescriptor { class_id: CLASS_CHANNEL, name: "channel", methods: CHANNEL_METHODS },
    ]
});

pub fn find_class(class_id: u16) -> Result<&'static ClassDescriptor, ProtocolError> {
    CLASSES.iter().find(|c| c.class_id == class_id).ok_or(ProtocolError::UnknownClass(class_id))
}

pub fn find_method(class_id: u16, method_id: u16) -> Result<&'static MethodDescriptor, ProtocolError> {
    let class = find_class(class_id)?;
    class
        .methods
        .iter()
        .find(|m| m.method_id == method_id)
        .ok_or(ProtocolError::UnknownMethod { class_id, method_id })
}

/// Encode a sequence of argument values against a method's schema.
///
/// `values` must be the same length and variant-for-variant shape as
/// `schema` — this is an internal encoding contract enforced by the call
/// sites in `weft::connection`/`weft::channel`, not untrusted input, so a
/// mismatch panics rather than returning a recoverable error.
pub fn encode_args(schema: &[ArgSchema], values: &[ArgValue]) -> Result<BytesMut, ProtocolError> {
    assert_eq!(schema.len(), values.len(), "argument count does not match method schema");
    let mut out = BytesMut::new();
    let mut bits = BitWriter::new();
    for (arg, value) in schema.iter().zip(values) {
        if !matches!(arg.kind, ArgType::Bit) {
            bits.flush(&mut out);
        }
        match (arg.kind, value) {
            (ArgType::Bit, ArgValue::Bit(b)) => bits.push(&mut out, *b),
            (ArgType::Octet, ArgValue::Octet(v)) => out.extend_from_slice(&[*v]),
            (ArgType::Short, ArgValue::Short(v)) => write_u16(&mut out, *v),
            (ArgType::Long, ArgValue::Long(v)) => write_u32(&mut out, *v),
            (ArgType::LongLong, ArgValue::LongLong(v)) => write_u64(&mut out, *v),
            (ArgType::ShortStr, ArgValue::ShortStr(s)) => write_short_str(&mut out, s)?,
            (ArgType::LongStr, ArgValue::LongStr(b)) => write_long_str(&mut out, b),
            (ArgType::Table, ArgValue::Table(t)) => {
                out.extend_from_slice(&crate::value::encode_field_table(t))
            }
            (ArgType::Timestamp, ArgValue::Timestamp(v)) => write_u64(&mut out, *v),
            (kind, value) => panic!(
                "argument '{}' expects {kind:?}, got value of kind {}",
                arg.name,
                value.type_name()
            ),
        }
    }
    bits.flush(&mut out);
    Ok(out)
}

/// Decode a sequence of argument values against a method's schema.
pub fn decode_args(schema: &[ArgSchema], buf: &mut Bytes) -> Result<Vec<ArgValue>, ProtocolError> {
    let mut values = Vec::with_capacity(schema.len());
    let mut bits = BitReader::new();
    for arg in schema {
        if !matches!(arg.kind, ArgType::Bit) {
            bits.reset();
        }
        let value = match arg.kind {
            ArgType::Bit => ArgValue::Bit(bits.pull(buf)?),
            ArgType::Octet => ArgValue::Octet(crate::value::read_u8(buf)?),
            ArgType::Short => ArgValue::Short(read_u16(buf)?),
            ArgType::Long => ArgValue::Long(read_u32(buf)?),
            ArgType::LongLong => ArgValue::LongLong(read_u64(buf)?),
            ArgType::ShortStr => ArgValue::ShortStr(read_short_str(buf)?),
            ArgType::LongStr => ArgValue::LongStr(crate::value::read_long_str(buf)?),
            ArgType::Table => ArgValue::Table(crate::value::decode_field_table(buf)?),
            ArgType::Timestamp => ArgValue::Timestamp(read_u64(buf)?),
        };
        values.push(value);
    }
    Ok(values)
}
