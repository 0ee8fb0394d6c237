//! A logical multiplex endpoint: channel 0 is the connection-control
//! channel, every other id is a caller-opened data channel. Each channel
//! owns a bounded receive queue and a handler table, and holds a
//! non-owning (`Weak`) back-reference to its connection to avoid an
//! ownership cycle between the two.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use weft_protocol::{ArgValue, Frame, CLASS_CHANNEL};

use crate::connection::{Connection, ConnectionInner};
use crate::dispatch::HandlerTable;
use crate::error::{CloseReason, Error};
use crate::state::{watch_channel, State};

/// Depth of a channel's inbound frame queue. Bounded so a slow consumer
/// applies backpressure to the connection's single demux loop rather than
/// growing without limit.
pub(crate) const CHANNEL_QUEUE_CAPACITY: usize = 64;

pub(crate) struct ChannelInner {
    id: u16,
    connection: Weak<ConnectionInner>,
    state_tx: tokio::sync::watch::Sender<State>,
    state_rx: tokio::sync::watch::Receiver<State>,
    flow: AtomicBool,
    handlers: Arc<HandlerTable>,
    close_reason: Mutex<Option<CloseReason>>,
    receiver_task: Mutex<Option<JoinHandle<()>>>,
}

/// A cheap-to-clone handle to a channel; all state lives behind the
/// `Arc<ChannelInner>` so clones observe the same channel.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

impl Channel {
    /// Construct a channel and spawn its receiver task, returning the
    /// handle plus the sender the connection's demux loop feeds frames
    /// into.
    pub(crate) fn spawn(id: u16, connection: Weak<ConnectionInner>) -> (Channel, mpsc::Sender<Frame>) {
        let (state_tx, state_rx) = watch_channel(State::Opening);
        let handlers = Arc::new(HandlerTable::new());
        let inner = Arc::new(ChannelInner {
            id,
            connection,
            state_tx,
            state_rx,
            flow: AtomicBool::new(true),
            handlers,
            close_reason: Mutex::new(None),
            receiver_task: Mutex::new(None),
        });
        let channel = Channel { inner: Arc::clone(&inner) };

        let (inbound_tx, mut inbound_rx) = mpsc::channel::<Frame>(CHANNEL_QUEUE_CAPACITY);
        let task_handlers = Arc::clone(&inner.handlers);
        let task_connection = inner.connection.clone();
        let task_channel = channel.clone();
        let task = tokio::spawn(async move {
            tracing::debug!(channel_id = id, "channel receiver task started");
            while let Some(frame) = inbound_rx.recv().await {
                if let Err(err) = task_handlers.dispatch(frame).await {
                    tracing::warn!(channel_id = id, %err, "channel handler error, tearing down");
                    if let Some(conn_inner) = task_connection.upgrade() {
                        let connection = Connection::from_inner(conn_inner);
                        if id == 0 {
                            connection.mark_closed_and_teardown();
                        } else {
                            connection.abrupt_close_channel(&task_channel);
                        }
                    }
                    break;
                }
            }
            tracing::debug!(channel_id = id, "channel receiver task stopped");
        });
        *inner.receiver_task.lock() = Some(task);

        (channel, inbound_tx)
    }

    pub fn id(&self) -> u16 {
        self.inner.id
    }

    pub fn state(&self) -> State {
        *self.inner.state_rx.borrow()
    }

    pub fn handlers(&self) -> &HandlerTable {
        &self.inner.handlers
    }

    pub fn is_flow_active(&self) -> bool {
        self.inner.flow.load(Ordering::Relaxed)
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.inner.close_reason.lock().clone()
    }

    pub(crate) fn set_state(&self, state: State) {
        let _ = self.inner.state_tx.send(state);
    }

    pub(crate) fn set_flow(&self, active: bool) {
        self.inner.flow.store(active, Ordering::Relaxed);
    }

    pub(crate) fn set_close_reason(&self, reason: CloseReason) {
        *self.inner.close_reason.lock() = Some(reason);
    }

    pub async fn wait_for_state(&self, target: State, timeout: std::time::Duration) -> Result<(), Error> {
        let mut rx = self.inner.state_rx.clone();
        if *rx.borrow() == target {
            return Ok(());
        }
        tokio::time::timeout(timeout, rx.wait_for(|s| *s == target))
            .await
            .map_err(|_| Error::Client(format!("timed out waiting for channel {} to reach {target:?}", self.inner.id)))?
            .map_err(|_| Error::Client("connection shut down while waiting for channel state".to_string()))?;
        Ok(())
    }

    fn connection(&self) -> Result<Connection, Error> {
        self.inner
            .connection
            .upgrade()
            .map(Connection::from_inner)
            .ok_or_else(|| Error::Client("connection has been dropped".to_string()))
    }

    /// Open this channel: sends `channel.open` and waits for `channel.open-ok`.
    pub async fn open(&self) -> Result<(), Error> {
        if self.inner.id == 0 {
            return Err(Error::Client("channel 0 opens implicitly with the connection".to_string()));
        }
        let connection = self.connection()?;
        let timeout = connection.config().connect_timeout;
        connection
            .send_method(self.inner.id, CLASS_CHANNEL, 10, vec![ArgValue::ShortStr(String::new())])
            .await?;
        self.wait_for_state(State::Open, timeout).await
    }

    /// Toggle flow control on this channel: sends `channel.flow`.
    pub async fn flow(&self, active: bool) -> Result<(), Error> {
        let connection = self.connection()?;
        connection.send_method(self.inner.id, CLASS_CHANNEL, 20, vec![ArgValue::Bit(active)]).await
    }

    /// Cooperatively close this channel: sends `channel.close` and waits
    /// for `channel.close-ok`.
    pub async fn close(&self, reason: CloseReason) -> Result<(), Error> {
        if self.inner.id == 0 {
            return Err(Error::Client("channel 0 closes together with the connection".to_string()));
        }
        self.set_state(State::Closing);
        let connection = self.connection()?;
        let timeout = connection.config().connect_timeout;
        connection
            .send_method(
                self.inner.id,
                CLASS_CHANNEL,
                40,
                vec![
                    ArgValue::Short(reason.reply_code),
                    ArgValue::ShortStr(reason.reply_text.clone()),
                    ArgValue::Short(reason.class_id),
                    ArgValue::Short(reason.method_id),
                ],
            )
            .await?;
        self.wait_for_state(State::Closed, timeout).await
    }

    /// Abort the channel's receiver task without exchanging any frames,
    /// used for abrupt teardown when the connection itself is going away.
    pub(crate) fn abort(&self) {
        if let Some(task) = self.inner.receiver_task.lock().take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn spawned_channel_starts_in_opening() {
        let (channel, _inbound_tx) = Channel::spawn(1, Weak::new());
        assert_eq!(channel.state(), State::Opening);
    }

    #[tokio::test]
    async fn wait_for_state_resolves_once_state_changes() {
        let (channel, _inbound_tx) = Channel::spawn(1, Weak::new());
        let waiter = channel.clone();
        let handle = tokio::spawn(async move { waiter.wait_for_state(State::Open, std::time::Duration::from_secs(1)).await });
        channel.set_state(State::Open);
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn open_on_channel_zero_is_rejected() {
        let (channel, _inbound_tx) = Channel::spawn(0, Weak::new());
        let err = channel.open().await.unwrap_err();
        assert!(matches!(err, Error::Client(_)));
    }

    #[tokio::test]
    async fn operations_fail_once_connection_is_dropped() {
        let (channel, _inbound_tx) = Channel::spawn(1, Weak::new());
        let err = channel.flow(true).await.unwrap_err();
        assert!(matches!(err, Error::Client(_)));
    }
}
