//! An AMQP 0-9-1 client: the connection and channel concurrent state
//! machine built on top of `weft-protocol`'s wire codec.
//!
//! A [`Connection`] owns the transport and drives the handshake, a single
//! outbound send queue, and the frame-demultiplexing receiver loop. Each
//! [`Channel`] is a cheap handle into that machinery with its own
//! [`dispatch::HandlerTable`] and lifecycle [`State`].

pub mod auth;
pub mod channel;
pub mod config;
pub mod connection;
pub mod dispatch;
pub mod error;
pub mod state;
pub mod transport;

pub use auth::AuthProvider;
pub use channel::Channel;
pub use config::ConnectionConfig;
pub use connection::Connection;
pub use dispatch::{DispatchError, Handler, HandlerKey, HandlerTable};
pub use error::{CloseReason, Error};
pub use state::State;
pub use transport::{BoxFuture, IoTransport, Transport};
