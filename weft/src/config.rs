//! The single configuration surface for a connection. No environment or
//! file-based config layer: this is a library, configured by its embedder.

use std::time::Duration;

use weft_protocol::FieldTable;

#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub virtual_host: String,
    pub host: String,
    pub port: u16,
    pub channel_max: u16,
    pub frame_max: u32,
    pub heartbeat: u16,
    pub connect_timeout: Duration,
    pub client_properties: FieldTable,
    /// Preferred locale to request in `Connection.StartOk`. `None` means
    /// take whichever locale the server lists first in `Connection.Start`.
    pub preferred_locale: Option<String>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            virtual_host: "/".to_string(),
            host: "localhost".to_string(),
            port: 5672,
            channel_max: 256,
            frame_max: 0,
            heartbeat: 0,
            connect_timeout: Duration::from_secs(5),
            client_properties: FieldTable::new(),
            preferred_locale: None,
        }
    }
}

/// The Tune/TuneOk negotiation rule applied to `channel_max`, `frame_max`,
/// and `heartbeat` alike: zero means "defer to whatever the other side
/// wants"; if both sides want something nonzero, take the smaller value.
pub fn negotiate_u16(mine: u16, theirs: u16) -> u16 {
    match (mine, theirs) {
        (0, t) => t,
        (m, 0) => m,
        (m, t) => m.min(t),
    }
}

pub fn negotiate_u32(mine: u32, theirs: u32) -> u32 {
    match (mine, theirs) {
        (0, t) => t,
        (m, 0) => m,
        (m, t) => m.min(t),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_conventional_amqp_values() {
        let cfg = ConnectionConfig::default();
        assert_eq!(cfg.virtual_host, "/");
        assert_eq!(cfg.port, 5672);
        assert_eq!(cfg.channel_max, 256);
        assert_eq!(cfg.frame_max, 0);
        assert_eq!(cfg.heartbeat, 0);
    }

    #[test]
    fn negotiate_takes_nonzero_minimum() {
        assert_eq!(negotiate_u16(60, 30), 30);
        assert_eq!(negotiate_u16(0, 30), 30);
        assert_eq!(negotiate_u16(60, 0), 60);
        assert_eq!(negotiate_u16(0, 0), 0);
    }

    #[test]
    fn negotiate_u32_takes_nonzero_minimum() {
        assert_eq!(negotiate_u32(131_072, 4096), 4096);
        assert_eq!(negotiate_u32(0, 4096), 4096);
    }
}
