//! The caller-facing error type and the reason a connection or channel
//! closed.
//!
//! Two-tier: [`weft_protocol::ProtocolError`] covers wire-level faults,
//! `Error` wraps that plus transport I/O failures and client misuse. A
//! background task never returns its failure synchronously to a caller —
//! see `connection.rs` — it stores a [`CloseReason`] and moves the
//! connection/channel to `Closing`/`Closed` instead.

use std::fmt;

use weft_protocol::ProtocolError;

#[derive(Debug)]
pub enum Error {
    /// A wire-level fault surfaced while parsing or building a frame.
    Protocol(ProtocolError),
    /// The transport's read/write/connect failed.
    Io(std::io::Error),
    /// Misuse of the client API: an unknown channel id, no free channel id
    /// left under `channel_max`, a handshake that never completed in time.
    Client(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Protocol(e) => write!(f, "protocol error: {e}"),
            Error::Io(e) => write!(f, "transport error: {e}"),
            Error::Client(msg) => write!(f, "client error: {msg}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Protocol(e) => Some(e),
            Error::Io(e) => Some(e),
            Error::Client(_) => None,
        }
    }
}

impl From<ProtocolError> for Error {
    fn from(e: ProtocolError) -> Self {
        Error::Protocol(e)
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

/// Why a connection or channel entered `Closing`/`Closed`, whether the
/// close was initiated locally or by the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    pub reply_code: u16,
    pub reply_text: String,
    pub class_id: u16,
    pub method_id: u16,
}

impl CloseReason {
    pub fn normal() -> Self {
        CloseReason { reply_code: 200, reply_text: "normal shutdown".to_string(), class_id: 0, method_id: 0 }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "closed: {} (code {}, offending method ({}, {}))",
            self.reply_text, self.reply_code, self.class_id, self.method_id
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_error_display_contains_offending_value() {
        let err = Error::from(ProtocolError::UnknownFrameType(42));
        assert!(err.to_string().contains("42"));
    }

    #[test]
    fn client_error_display_contains_message() {
        let err = Error::Client("no free channel id".to_string());
        assert!(err.to_string().contains("no free channel id"));
    }

    #[test]
    fn close_reason_display_contains_code_and_text() {
        let reason = CloseReason { reply_code: 504, reply_text: "channel error".to_string(), class_id: 20, method_id: 40 };
        let s = reason.to_string();
        assert!(s.contains("504"));
        assert!(s.contains("channel error"));
    }
}
