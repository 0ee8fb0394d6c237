//! Wire types, frame codec, and method catalog for an AMQP 0-9-1 client.
//!
//! This crate is pure codec: no sockets, no async runtime. Everything here
//! operates on in-memory buffers so it can be unit-tested (and fuzzed) in
//! isolation from the connection/channel state machine in the `weft` crate.

pub mod catalog;
pub mod error;
pub mod frame;
pub mod properties;
pub mod value;

pub use catalog::{ArgSchema, ArgType, ArgValue, ClassDescriptor, MethodDescriptor, CLASS_CHANNEL, CLASS_CONNECTION};
pub use error::ProtocolError;
pub use frame::{BodyFrame, Frame, FrameKind, HeaderFrame, HeartbeatFrame, MethodFrame, FRAME_END, PROTOCOL_HEADER};
pub use value::{BitReader, BitWriter, Decimal, FieldArray, FieldTable, FieldValue};
