//! Authentication providers: a mechanism name paired with a function that
//! turns the server's Start properties into a StartOk response blob. The
//! core only ships the two conventional SASL mechanisms; anything else is
//! supplied by the embedding application.

use std::sync::Arc;

use bytes::Bytes;
use weft_protocol::FieldTable;

pub type AuthResponseFn = dyn Fn(&FieldTable) -> Bytes + Send + Sync;

#[derive(Clone)]
pub struct AuthProvider {
    pub mechanism: &'static str,
    respond: Arc<AuthResponseFn>,
}

impl AuthProvider {
    pub fn new(mechanism: &'static str, respond: impl Fn(&FieldTable) -> Bytes + Send + Sync + 'static) -> Self {
        AuthProvider { mechanism, respond: Arc::new(respond) }
    }

    pub fn response(&self, server_properties: &FieldTable) -> Bytes {
        (self.respond)(server_properties)
    }
}

impl std::fmt::Debug for AuthProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthProvider").field("mechanism", &self.mechanism).finish_non_exhaustive()
    }
}

/// SASL PLAIN: `\0username\0password`, ignoring the server's properties.
pub fn plain(username: impl Into<String>, password: impl Into<String>) -> AuthProvider {
    let username = username.into();
    let password = password.into();
    AuthProvider::new("PLAIN", move |_server_properties| {
        let mut buf = Vec::with_capacity(username.len() + password.len() + 2);
        buf.push(0u8);
        buf.extend_from_slice(username.as_bytes());
        buf.push(0u8);
        buf.extend_from_slice(password.as_bytes());
        Bytes::from(buf)
    })
}

/// AMQPLAIN: a `FieldTable` with `LOGIN`/`PASSWORD` entries, encoded as the
/// response blob. Some brokers accept this in place of PLAIN.
pub fn amqplain(username: impl Into<String>, password: impl Into<String>) -> AuthProvider {
    let username = username.into();
    let password = password.into();
    AuthProvider::new("AMQPLAIN", move |_server_properties| {
        let mut table = FieldTable::new();
        table.insert("LOGIN", weft_protocol::FieldValue::LongString(Bytes::from(username.clone())));
        table.insert("PASSWORD", weft_protocol::FieldValue::LongString(Bytes::from(password.clone())));
        weft_protocol::value::encode_field_table(&table).freeze()
    })
}
