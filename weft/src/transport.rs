//! The byte-stream abstraction the connection core consumes.
//!
//! `Transport` is object-safe by hand-boxing its futures rather than pulling
//! in `async-trait` — the crate has no other use for that dependency.
//! `IoTransport<S>` is the one concrete implementation shipped: a thin
//! wrapper around anything that is `AsyncRead + AsyncWrite`, mirroring the
//! teacher's `StreamTransport` (`Arc<Inner>` over a split reader/writer
//! guarded by async mutexes).

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex as AsyncMutex;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A duplex byte stream a `Connection` can read frames from and write
/// frames to. Implementors are responsible only for raw bytes; framing
/// lives in `weft_protocol::frame`.
pub trait Transport: Send + Sync {
    /// Write `bytes` in full.
    fn send(&self, bytes: Bytes) -> BoxFuture<'_, std::io::Result<()>>;

    /// Read at least one more byte into `buf`, returning the number of
    /// bytes read (`0` means the peer closed the stream).
    fn recv(&self, buf: &mut BytesMut) -> BoxFuture<'_, std::io::Result<usize>>;

    /// Shut down both halves. Idempotent.
    fn close(&self) -> BoxFuture<'_, std::io::Result<()>>;
}

struct IoTransportInner<S> {
    reader: AsyncMutex<tokio::io::ReadHalf<S>>,
    writer: AsyncMutex<tokio::io::WriteHalf<S>>,
}

/// A [`Transport`] over any split-able `AsyncRead + AsyncWrite` stream.
pub struct IoTransport<S> {
    inner: Arc<IoTransportInner<S>>,
}

impl<S> Clone for IoTransport<S> {
    fn clone(&self) -> Self {
        IoTransport { inner: Arc::clone(&self.inner) }
    }
}

impl<S: AsyncRead + AsyncWrite + Send + 'static> IoTransport<S> {
    pub fn new(stream: S) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        IoTransport {
            inner: Arc::new(IoTransportInner { reader: AsyncMutex::new(reader), writer: AsyncMutex::new(writer) }),
        }
    }
}

impl IoTransport<TcpStream> {
    pub async fn connect(host: &str, port: u16) -> std::io::Result<Self> {
        let stream = TcpStream::connect((host, port)).await?;
        stream.set_nodelay(true)?;
        Ok(IoTransport::new(stream))
    }
}

impl IoTransport<tokio::io::DuplexStream> {
    /// A pair of in-memory transports connected to each other, for tests
    /// that exercise the connection/channel state machine without a real
    /// socket.
    pub fn pair() -> (Self, Self) {
        let (a, b) = tokio::io::duplex(65536);
        (IoTransport::new(a), IoTransport::new(b))
    }
}

impl<S: AsyncRead + AsyncWrite + Send + 'static> Transport for IoTransport<S> {
    fn send(&self, bytes: Bytes) -> BoxFuture<'_, std::io::Result<()>> {
        Box::pin(async move {
            let mut writer = self.inner.writer.lock().await;
            writer.write_all(&bytes).await?;
            writer.flush().await
        })
    }

    fn recv(&self, buf: &mut BytesMut) -> BoxFuture<'_, std::io::Result<usize>> {
        Box::pin(async move {
            let mut reader = self.inner.reader.lock().await;
            let mut scratch = [0u8; 4096];
            let n = reader.read(&mut scratch).await?;
            buf.extend_from_slice(&scratch[..n]);
            Ok(n)
        })
    }

    fn close(&self) -> BoxFuture<'_, std::io::Result<()>> {
        Box::pin(async move {
            let mut writer = self.inner.writer.lock().await;
            writer.shutdown().await
        })
    }
}
