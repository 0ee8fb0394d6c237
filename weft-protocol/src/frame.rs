//! The generic frame envelope and the four typed frames it carries.
//!
//! Wire layout: `type:u8 | channel:u16 | size:u32 | payload[size] | frame-end:u8=0xCE`.
//! Grounded in the real AMQP 0-9-1 frame grammar (cross-checked against the
//! `amq-protocol` nom parser in the reference pack).

use bytes::{Bytes, BytesMut};

use crate::error::ProtocolError;
use crate::value::{read_u16, read_u32, read_u64, write_u16, write_u32, write_u64};

/// The protocol header a client sends as the very first bytes on a new
/// connection, before any framed traffic: `"AMQP" 0x00 0x00 0x09 0x01`.
pub const PROTOCOL_HEADER: [u8; 8] = [b'A', b'M', b'Q', b'P', 0x00, 0x00, 0x09, 0x01];

/// Sentinel octet every frame must end with.
pub const FRAME_END: u8 = 0xCE;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    Method,
    Header,
    Body,
    Heartbeat,
}

impl FrameKind {
    fn as_u8(self) -> u8 {
        match self {
            FrameKind::Method => 1,
            FrameKind::Header => 2,
            FrameKind::Body => 3,
            FrameKind::Heartbeat => 8,
        }
    }

    fn name(self) -> &'static str {
        match self {
            FrameKind::Method => "method",
            FrameKind::Header => "header",
            FrameKind::Body => "body",
            FrameKind::Heartbeat => "heartbeat",
        }
    }
}

impl TryFrom<u8> for FrameKind {
    type Error = ProtocolError;

    fn try_from(b: u8) -> Result<Self, Self::Error> {
        match b {
            1 => Ok(FrameKind::Method),
            2 => Ok(FrameKind::Header),
            3 => Ok(FrameKind::Body),
            8 => Ok(FrameKind::Heartbeat),
            other => Err(ProtocolError::UnknownFrameType(other)),
        }
    }
}

/// The generic frame envelope: a kind, a channel id, and an opaque payload.
/// Decoding/encoding the envelope never looks inside the payload — that's
/// the typed frames' job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    pub channel: u16,
    pub payload: Bytes,
}

impl Frame {
    pub fn encode(&self) -> BytesMut {
        let mut out = BytesMut::with_capacity(self.payload.len() + 11);
        out.extend_from_slice(&[self.kind.as_u8()]);
        write_u16(&mut out, self.channel);
        write_u32(&mut out, self.payload.len() as u32);
        out.extend_from_slice(&self.payload);
        out.extend_from_slice(&[FRAME_END]);
        out
    }

    pub fn decode(buf: &mut Bytes) -> Result<Frame, ProtocolError> {
        use crate::value::read_u8;

        let kind = FrameKind::try_from(read_u8(buf)?)?;
        let channel = read_u16(buf)?;
        let size = read_u32(buf)? as usize;
        if buf.len() < size + 1 {
            return Err(ProtocolError::Truncated);
        }
        let payload = buf.split_to(size);
        let end = read_u8(buf)?;
        if end != FRAME_END {
            return Err(ProtocolError::BadFrameEnd(end));
        }
        Ok(Frame { kind, channel, payload })
    }
}

/// A parsed Method frame: `class:u16 | method:u16 | args…`. The argument
/// bytes are left undecoded here — the catalog turns them into typed
/// [`crate::catalog::ArgValue`]s once the (class, method) schema is known.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodFrame {
    pub channel: u16,
    pub class_id: u16,
    pub method_id: u16,
    pub args: Bytes,
}

impl MethodFrame {
    pub fn encode(&self) -> Frame {
        let mut payload = BytesMut::with_capacity(self.args.len() + 4);
        write_u16(&mut payload, self.class_id);
        write_u16(&mut payload, self.method_id);
        payload.extend_from_slice(&self.args);
        Frame { kind: FrameKind::Method, channel: self.channel, payload: payload.freeze() }
    }
}

impl TryFrom<Frame> for MethodFrame {
    type Error = ProtocolError;

    fn try_from(frame: Frame) -> Result<Self, Self::Error> {
        if frame.kind != FrameKind::Method {
            return Err(ProtocolError::FrameKindMismatch { expected: "method", found: frame.kind.name() });
        }
        let mut body = frame.payload;
        let class_id = read_u16(&mut body)?;
        let method_id = read_u16(&mut body)?;
        Ok(MethodFrame { channel: frame.channel, class_id, method_id, args: body })
    }
}

/// A parsed Header frame: `class:u16 | weight:u16=0 | body-size:u64 |
/// property-flags:u16 | properties…`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderFrame {
    pub channel: u16,
    pub class_id: u16,
    pub body_size: u64,
    pub property_flags: u16,
    pub properties: Bytes,
}

impl HeaderFrame {
    pub fn encode(&self) -> Frame {
        let mut payload = BytesMut::with_capacity(self.properties.len() + 14);
        write_u16(&mut payload, self.class_id);
        write_u16(&mut payload, 0); // weight, always zero
        write_u64(&mut payload, self.body_size);
        write_u16(&mut payload, self.property_flags);
        payload.extend_from_slice(&self.properties);
        Frame { kind: FrameKind::Header, channel: self.channel, payload: payload.freeze() }
    }
}

impl TryFrom<Frame> for HeaderFrame {
    type Error = ProtocolError;

    fn try_from(frame: Frame) -> Result<Self, Self::Error> {
        if frame.kind != FrameKind::Header {
            return Err(ProtocolError::FrameKindMismatch { expected: "header", found: frame.kind.name() });
        }
        let mut body = frame.payload;
        let class_id = read_u16(&mut body)?;
        let _weight = read_u16(&mut body)?;
        let body_size = read_u64(&mut body)?;
        let property_flags = read_u16(&mut body)?;
        Ok(HeaderFrame { channel: frame.channel, class_id, body_size, property_flags, properties: body })
    }
}

/// A parsed Body frame: raw opaque bytes, no further structure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BodyFrame {
    pub channel: u16,
    pub payload: Bytes,
}

impl BodyFrame {
    pub fn encode(&self) -> Frame {
        Frame { kind: FrameKind::Body, channel: self.channel, payload: self.payload.clone() }
    }
}

impl TryFrom<Frame> for BodyFrame {
    type Error = ProtocolError;

    fn try_from(frame: Frame) -> Result<Self, Self::Error> {
        if frame.kind != FrameKind::Body {
            return Err(ProtocolError::FrameKindMismatch { expected: "body", found: frame.kind.name() });
        }
        Ok(BodyFrame { channel: frame.channel, payload: frame.payload })
    }
}

/// A parsed Heartbeat frame: always on channel 0, no payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatFrame;

impl HeartbeatFrame {
    pub fn encode(&self) -> Frame {
        Frame { kind: FrameKind::Heartbeat, channel: 0, payload: Bytes::new() }
    }
}

impl TryFrom<Frame> for HeartbeatFrame {
    type Error = ProtocolError;

    fn try_from(frame: Frame) -> Result<Self, Self::Error> {
        if frame.kind != FrameKind::Heartbeat {
            return Err(ProtocolError::FrameKindMismatch { expected: "heartbeat", found: frame.kind.name() });
        }
        Ok(HeartbeatFrame)
    }
}
