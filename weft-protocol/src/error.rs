//! Wire-level faults: malformed frames, unknown tags, short reads.
//!
//! Mirrors the teacher crate's hand-rolled error style (manual `Display` and
//! `std::error::Error` impls, no derive macro) rather than pulling in a
//! derive-based error crate for a handful of variants.

use std::fmt;

/// A fault in the wire format itself. Any occurrence of this terminates the
/// connection: the byte stream can no longer be trusted to be framed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Frame ended with a sentinel other than `0xCE`.
    BadFrameEnd(u8),
    /// Frame type byte did not match any of {1, 2, 3, 8}.
    UnknownFrameType(u8),
    /// A typed-frame conversion was attempted against a `Frame` of the wrong
    /// kind (e.g. `MethodFrame::try_from` on a `Body` frame).
    FrameKindMismatch { expected: &'static str, found: &'static str },
    /// Field-value tag byte did not match any entry in the type-tag alphabet.
    UnknownTypeTag(u8),
    /// (class, method) pair has no entry in the static catalog.
    UnknownMethod { class_id: u16, method_id: u16 },
    /// Class id has no entry in the static catalog.
    UnknownClass(u16),
    /// Buffer ran out while a field, string, or table was still being read.
    Truncated,
    /// A `ShortStr` payload exceeded the 255-byte limit on write.
    ShortStrTooLong(usize),
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::BadFrameEnd(b) => {
                write!(f, "bad frame-end sentinel: expected 0xCE, got {b:#04x}")
            }
            ProtocolError::UnknownFrameType(b) => write!(f, "unknown frame type: {b}"),
            ProtocolError::FrameKindMismatch { expected, found } => {
                write!(f, "expected a {expected} frame, found {found}")
            }
            ProtocolError::UnknownTypeTag(b) => {
                write!(f, "unknown field-value type tag: {:?}", *b as char)
            }
            ProtocolError::UnknownMethod { class_id, method_id } => {
                write!(f, "unknown method ({class_id}, {method_id})")
            }
            ProtocolError::UnknownClass(class_id) => write!(f, "unknown class id {class_id}"),
            ProtocolError::Truncated => write!(f, "buffer ended before frame was fully read"),
            ProtocolError::ShortStrTooLong(len) => {
                write!(f, "short string of {len} bytes exceeds the 255-byte limit")
            }
        }
    }
}

impl std::error::Error for ProtocolError {}
