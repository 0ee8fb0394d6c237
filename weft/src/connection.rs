//! The connection core: owns the transport, the single outbound send
//! queue, the channel table, and the sender/receiver/heartbeater
//! background tasks. Drives the Start/Tune/Open handshake and the
//! cooperative/peer-initiated/abrupt close protocols.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use weft_protocol::catalog::find_method;
use weft_protocol::{ArgValue, FieldTable, Frame, PROTOCOL_HEADER, CLASS_CHANNEL, CLASS_CONNECTION};

use crate::auth::AuthProvider;
use crate::channel::Channel;
use crate::config::{negotiate_u16, negotiate_u32, ConnectionConfig};
use crate::dispatch::HandlerKey;
use crate::error::{CloseReason, Error};
use crate::state::{watch_channel, State};
use crate::transport::{BoxFuture, Transport};

/// Upper bound on how long a peer-initiated close waits for the queued
/// `CloseOk` to actually reach the transport before tearing down the
/// sender task out from under it.
const CLOSE_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, Default)]
struct Negotiated {
    channel_max: u16,
    frame_max: u32,
    heartbeat: u16,
}

pub(crate) struct ConnectionInner {
    config: ConnectionConfig,
    transport: Arc<dyn Transport>,
    outbound_tx: mpsc::UnboundedSender<Frame>,
    state_tx: tokio::sync::watch::Sender<State>,
    state_rx: tokio::sync::watch::Receiver<State>,
    channels: RwLock<HashMap<u16, Channel>>,
    inbound_senders: RwLock<HashMap<u16, mpsc::Sender<Frame>>>,
    negotiated: RwLock<Negotiated>,
    last_sent: Mutex<Instant>,
    last_received: Mutex<Instant>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    close_reason: Mutex<Option<CloseReason>>,
    outbound_pending: AtomicUsize,
}

/// A cheap-to-clone handle to a connection; all state lives behind the
/// `Arc<ConnectionInner>` so clones observe the same connection.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl Connection {
    pub(crate) fn from_inner(inner: Arc<ConnectionInner>) -> Self {
        Connection { inner }
    }

    /// Perform the protocol-header + Start/Tune/Open handshake over an
    /// already-connected transport, returning once the connection is Open.
    pub async fn connect(transport: Arc<dyn Transport>, config: ConnectionConfig, auth: AuthProvider) -> Result<Connection, Error> {
        transport.send(Bytes::copy_from_slice(&PROTOCOL_HEADER)).await?;

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel::<Frame>();
        let (state_tx, state_rx) = watch_channel(State::Opening);

        let inner = Arc::new_cyclic(|weak_self: &Weak<ConnectionInner>| {
            let (channel0, inbound_tx0) = Channel::spawn(0, weak_self.clone());
            let mut channels = HashMap::new();
            let mut inbound_senders = HashMap::new();
            channels.insert(0u16, channel0);
            inbound_senders.insert(0u16, inbound_tx0);

            ConnectionInner {
                config: config.clone(),
                transport: Arc::clone(&transport),
                outbound_tx,
                state_tx,
                state_rx,
                channels: RwLock::new(channels),
                inbound_senders: RwLock::new(inbound_senders),
                negotiated: RwLock::new(Negotiated::default()),
                last_sent: Mutex::new(Instant::now()),
                last_received: Mutex::new(Instant::now()),
                tasks: Mutex::new(Vec::new()),
                close_reason: Mutex::new(None),
                outbound_pending: AtomicUsize::new(0),
            }
        });

        let connection = Connection { inner: Arc::clone(&inner) };
        let channel0 = connection.inner.channels.read().get(&0).cloned().expect("channel 0 always exists");
        connection.install_connection_handlers(&channel0, auth);

        connection.spawn_sender_task(outbound_rx);
        connection.spawn_receiver_task();

        tokio::time::timeout(connection.inner.config.connect_timeout, {
            let mut rx = connection.inner.state_rx.clone();
            async move { rx.wait_for(|s| matches!(s, State::Open | State::Closed)).await.map(|s| *s) }
        })
        .await
        .map_err(|_| Error::Client("timed out waiting for connection handshake to complete".to_string()))?
        .map_err(|_| Error::Client("connection state watch closed during handshake".to_string()))?;

        if connection.state() != State::Open {
            return Err(Error::Client("connection closed during handshake".to_string()));
        }

        Ok(connection)
    }

    pub fn state(&self) -> State {
        *self.inner.state_rx.borrow()
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.inner.close_reason.lock().clone()
    }

    /// Channel 0, the always-present control channel.
    pub fn control_channel(&self) -> Channel {
        self.inner.channels.read().get(&0).cloned().expect("channel 0 always exists")
    }

    /// Open a new data channel, auto-assigning the lowest free id under
    /// `channel_max`.
    pub async fn open_channel(&self) -> Result<Channel, Error> {
        let channel_max = self.effective_channel_max();
        let id = {
            let channels = self.inner.channels.read();
            (1..=channel_max).find(|id| !channels.contains_key(id))
        }
        .ok_or_else(|| Error::Client("no free channel id under channel_max".to_string()))?;

        self.open_channel_with_id(id).await
    }

    /// Open a new data channel at a caller-chosen id, failing if that id is
    /// already in use or exceeds `channel_max`.
    pub async fn open_channel_with_id(&self, id: u16) -> Result<Channel, Error> {
        if id == 0 {
            return Err(Error::Client("channel 0 opens implicitly with the connection".to_string()));
        }
        let channel_max = self.effective_channel_max();
        if id > channel_max {
            return Err(Error::Client(format!("channel id {id} exceeds negotiated channel_max {channel_max}")));
        }
        if self.inner.channels.read().contains_key(&id) {
            return Err(Error::Client(format!("channel id {id} is already in use")));
        }

        let (channel, inbound_tx) = Channel::spawn(id, Arc::downgrade(&self.inner));
        self.install_channel_handlers(&channel);
        self.inner.channels.write().insert(id, channel.clone());
        self.inner.inbound_senders.write().insert(id, inbound_tx);

        channel.open().await?;
        Ok(channel)
    }

    fn effective_channel_max(&self) -> u16 {
        let negotiated = self.inner.negotiated.read();
        if negotiated.channel_max == 0 {
            self.inner.config.channel_max
        } else {
            negotiated.channel_max
        }
    }

    /// Remove a closed channel from the channel table, freeing its id for
    /// reuse by a later `open_channel`.
    pub(crate) fn remove_channel(&self, id: u16) {
        self.inner.channels.write().remove(&id);
        self.inner.inbound_senders.write().remove(&id);
    }

    /// Cooperatively close the connection: sends `connection.close`, waits
    /// for `connection.close-ok`, then tears down every background task.
    pub async fn close(&self, reason: CloseReason) -> Result<(), Error> {
        if self.state() == State::Closed {
            return Ok(());
        }
        let _ = self.inner.state_tx.send(State::Closing);
        self.send_method(
            0,
            CLASS_CONNECTION,
            50,
            vec![
                ArgValue::Short(reason.reply_code),
                ArgValue::ShortStr(reason.reply_text.clone()),
                ArgValue::Short(reason.class_id),
                ArgValue::Short(reason.method_id),
            ],
        )
        .await?;

        let mut rx = self.inner.state_rx.clone();
        tokio::time::timeout(self.inner.config.connect_timeout, rx.wait_for(|s| *s == State::Closed))
            .await
            .map_err(|_| Error::Client("timed out waiting for connection.close-ok".to_string()))?
            .map_err(|_| Error::Client("connection state watch closed".to_string()))?;
        Ok(())
    }

    pub(crate) async fn send_method(&self, channel: u16, class_id: u16, method_id: u16, args: Vec<ArgValue>) -> Result<(), Error> {
        let descriptor = find_method(class_id, method_id)?;
        let encoded = weft_protocol::catalog::encode_args(descriptor.args, &args)?;
        let mf = weft_protocol::MethodFrame { channel, class_id, method_id, args: encoded.freeze() };
        self.enqueue(mf.encode())
    }

    fn enqueue(&self, frame: Frame) -> Result<(), Error> {
        self.inner
            .outbound_tx
            .send(frame)
            .map_err(|_| Error::Client("connection send queue is closed".to_string()))?;
        self.inner.outbound_pending.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Wait, up to `timeout`, for every frame enqueued so far to actually
    /// reach the transport. Used before a peer-initiated close tears the
    /// sender task down, so a just-enqueued `CloseOk` isn't aborted out of
    /// the queue before it's written.
    async fn drain_outbound(&self, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        while self.inner.outbound_pending.load(Ordering::SeqCst) > 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    fn spawn_sender_task(&self, mut outbound_rx: mpsc::UnboundedReceiver<Frame>) {
        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(async move {
            tracing::debug!("sender task started");
            while let Some(frame) = outbound_rx.recv().await {
                let encoded = frame.encode().freeze();
                let result = inner.transport.send(encoded).await;
                inner.outbound_pending.fetch_sub(1, Ordering::SeqCst);
                if let Err(err) = result {
                    tracing::error!(%err, "sender task: transport write failed");
                    Connection::from_inner(Arc::clone(&inner)).mark_closed_and_teardown();
                    break;
                }
                *inner.last_sent.lock() = Instant::now();
            }
            tracing::debug!("sender task stopped");
        });
        self.inner.tasks.lock().push(task);
    }

    fn spawn_receiver_task(&self) {
        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(async move {
            tracing::debug!("receiver task started");
            let mut accumulated = BytesMut::new();
            loop {
                let mut chunk = BytesMut::new();
                let n = match inner.transport.recv(&mut chunk).await {
                    Ok(n) => n,
                    Err(err) => {
                        tracing::error!(%err, "receiver task: transport read failed");
                        Connection::from_inner(Arc::clone(&inner)).mark_closed_and_teardown();
                        break;
                    }
                };
                if n == 0 {
                    tracing::debug!("receiver task: transport reached eof");
                    Connection::from_inner(Arc::clone(&inner)).mark_closed_and_teardown();
                    break;
                }
                accumulated.extend_from_slice(&chunk);
                *inner.last_received.lock() = Instant::now();

                loop {
                    let mut cursor = accumulated.clone().freeze();
                    match Frame::decode(&mut cursor) {
                        Ok(frame) => {
                            let consumed = accumulated.len() - cursor.len();
                            accumulated.split_to(consumed);
                            route_frame(&inner, frame);
                        }
                        Err(weft_protocol::ProtocolError::Truncated) => break,
                        Err(err) => {
                            tracing::error!(%err, "receiver task: malformed frame, closing connection");
                            Connection::from_inner(Arc::clone(&inner)).mark_closed_and_teardown();
                            return;
                        }
                    }
                }
            }
        });
        self.inner.tasks.lock().push(task);
    }

    fn install_connection_handlers(&self, channel0: &Channel, auth: AuthProvider) {
        let handlers = channel0.handlers();

        let connection = self.clone();
        let auth_start = auth.clone();
        handlers.replace(
            HandlerKey::Method { class_id: CLASS_CONNECTION, method_id: 10 },
            move |frame: weft_protocol::Frame| -> BoxFuture<'static, Result<(), Error>> {
                let connection = connection.clone();
                let auth = auth_start.clone();
                Box::pin(async move {
                    let mf = weft_protocol::MethodFrame::try_from(frame)?;
                    let descriptor = find_method(CLASS_CONNECTION, 10)?;
                    let args = weft_protocol::catalog::decode_args(descriptor.args, &mut mf.args.clone())?;
                    let server_properties = match &args[2] {
                        ArgValue::Table(t) => t.clone(),
                        _ => FieldTable::new(),
                    };
                    let mechanisms = match &args[3] {
                        ArgValue::LongStr(b) => String::from_utf8_lossy(b).into_owned(),
                        _ => String::new(),
                    };
                    if !mechanisms.split(' ').any(|m| m == auth.mechanism) {
                        return Err(Error::Client(format!(
                            "server does not advertise requested auth mechanism {}: advertised {mechanisms}",
                            auth.mechanism
                        )));
                    }
                    let locales = match &args[4] {
                        ArgValue::LongStr(b) => String::from_utf8_lossy(b).into_owned(),
                        _ => String::new(),
                    };
                    let mut advertised_locales = locales.split(' ').filter(|l| !l.is_empty());
                    let preferred = connection.inner.config.preferred_locale.as_deref();
                    let locale = match preferred {
                        Some(want) if locales.split(' ').any(|l| l == want) => want.to_string(),
                        _ => advertised_locales.next().unwrap_or("en_US").to_string(),
                    };

                    let response = auth.response(&server_properties);
                    connection
                        .send_method(
                            0,
                            CLASS_CONNECTION,
                            11,
                            vec![
                                ArgValue::Table(connection.inner.config.client_properties.clone()),
                                ArgValue::ShortStr(auth.mechanism.to_string()),
                                ArgValue::LongStr(response),
                                ArgValue::ShortStr(locale),
                            ],
                        )
                        .await
                })
            },
        );

        let connection = self.clone();
        handlers.replace(
            HandlerKey::Method { class_id: CLASS_CONNECTION, method_id: 30 },
            move |frame: weft_protocol::Frame| -> BoxFuture<'static, Result<(), Error>> {
                let connection = connection.clone();
                Box::pin(async move {
                    let mf = weft_protocol::MethodFrame::try_from(frame)?;
                    let descriptor = find_method(CLASS_CONNECTION, 30)?;
                    let args = weft_protocol::catalog::decode_args(descriptor.args, &mut mf.args.clone())?;
                    let (server_channel_max, server_frame_max, server_heartbeat) = match (&args[0], &args[1], &args[2]) {
                        (ArgValue::Short(cm), ArgValue::Long(fm), ArgValue::Short(hb)) => (*cm, *fm, *hb),
                        _ => return Err(Error::Client("malformed connection.tune arguments".to_string())),
                    };
                    let negotiated = Negotiated {
                        channel_max: negotiate_u16(connection.inner.config.channel_max, server_channel_max),
                        frame_max: negotiate_u32(connection.inner.config.frame_max, server_frame_max),
                        heartbeat: negotiate_u16(connection.inner.config.heartbeat, server_heartbeat),
                    };
                    *connection.inner.negotiated.write() = negotiated;

                    connection
                        .send_method(
                            0,
                            CLASS_CONNECTION,
                            31,
                            vec![
                                ArgValue::Short(negotiated.channel_max),
                                ArgValue::Long(negotiated.frame_max),
                                ArgValue::Short(negotiated.heartbeat),
                            ],
                        )
                        .await?;

                    connection
                        .send_method(
                            0,
                            CLASS_CONNECTION,
                            40,
                            vec![
                                ArgValue::ShortStr(connection.inner.config.virtual_host.clone()),
                                ArgValue::ShortStr(String::new()),
                                ArgValue::Bit(false),
                            ],
                        )
                        .await
                })
            },
        );

        let connection = self.clone();
        let channel0_for_open_ok = channel0.clone();
        handlers.replace(
            HandlerKey::Method { class_id: CLASS_CONNECTION, method_id: 41 },
            move |_frame: weft_protocol::Frame| -> BoxFuture<'static, Result<(), Error>> {
                let connection = connection.clone();
                let channel0 = channel0_for_open_ok.clone();
                Box::pin(async move {
                    channel0.set_state(State::Open);
                    let _ = connection.inner.state_tx.send(State::Open);
                    connection.spawn_heartbeater_task();
                    Ok(())
                })
            },
        );

        let connection = self.clone();
        handlers.replace(
            HandlerKey::Method { class_id: CLASS_CONNECTION, method_id: 50 },
            move |frame: weft_protocol::Frame| -> BoxFuture<'static, Result<(), Error>> {
                let connection = connection.clone();
                Box::pin(async move {
                    let reason = decode_close_reason(frame)?;
                    *connection.inner.close_reason.lock() = Some(reason);
                    connection.send_method(0, CLASS_CONNECTION, 51, vec![]).await?;
                    connection.drain_outbound(CLOSE_DRAIN_TIMEOUT).await;
                    connection.mark_closed_and_teardown();
                    Ok(())
                })
            },
        );

        let connection = self.clone();
        handlers.replace(
            HandlerKey::Method { class_id: CLASS_CONNECTION, method_id: 51 },
            move |_frame: weft_protocol::Frame| -> BoxFuture<'static, Result<(), Error>> {
                let connection = connection.clone();
                Box::pin(async move {
                    connection.mark_closed_and_teardown();
                    Ok(())
                })
            },
        );
    }

    fn install_channel_handlers(&self, channel: &Channel) {
        let handlers = channel.handlers();

        let target = channel.clone();
        handlers.replace(
            HandlerKey::Method { class_id: CLASS_CHANNEL, method_id: 11 },
            move |_frame: weft_protocol::Frame| -> BoxFuture<'static, Result<(), Error>> {
                let target = target.clone();
                Box::pin(async move {
                    target.set_state(State::Open);
                    Ok(())
                })
            },
        );

        let target = channel.clone();
        handlers.replace(
            HandlerKey::Method { class_id: CLASS_CHANNEL, method_id: 21 },
            move |frame: weft_protocol::Frame| -> BoxFuture<'static, Result<(), Error>> {
                let target = target.clone();
                Box::pin(async move {
                    let mf = weft_protocol::MethodFrame::try_from(frame)?;
                    let descriptor = find_method(CLASS_CHANNEL, 21)?;
                    let args = weft_protocol::catalog::decode_args(descriptor.args, &mut mf.args.clone())?;
                    if let Some(ArgValue::Bit(active)) = args.first() {
                        target.set_flow(*active);
                    }
                    Ok(())
                })
            },
        );

        let target = channel.clone();
        let connection = self.clone();
        handlers.replace(
            HandlerKey::Method { class_id: CLASS_CHANNEL, method_id: 20 },
            move |frame: weft_protocol::Frame| -> BoxFuture<'static, Result<(), Error>> {
                let target = target.clone();
                let connection = connection.clone();
                Box::pin(async move {
                    let mf = weft_protocol::MethodFrame::try_from(frame)?;
                    let descriptor = find_method(CLASS_CHANNEL, 20)?;
                    let args = weft_protocol::catalog::decode_args(descriptor.args, &mut mf.args.clone())?;
                    let active = matches!(args.first(), Some(ArgValue::Bit(true)));
                    target.set_flow(active);
                    connection.send_method(target.id(), CLASS_CHANNEL, 21, vec![ArgValue::Bit(active)]).await
                })
            },
        );

        let target = channel.clone();
        let connection = self.clone();
        handlers.replace(
            HandlerKey::Method { class_id: CLASS_CHANNEL, method_id: 40 },
            move |frame: weft_protocol::Frame| -> BoxFuture<'static, Result<(), Error>> {
                let target = target.clone();
                let connection = connection.clone();
                Box::pin(async move {
                    let reason = decode_close_reason(frame)?;
                    target.set_close_reason(reason);
                    connection.send_method(target.id(), CLASS_CHANNEL, 41, vec![]).await?;
                    target.set_state(State::Closed);
                    target.handlers().clear();
                    target.abort();
                    connection.remove_channel(target.id());
                    Ok(())
                })
            },
        );

        let target = channel.clone();
        let connection = self.clone();
        handlers.replace(
            HandlerKey::Method { class_id: CLASS_CHANNEL, method_id: 41 },
            move |_frame: weft_protocol::Frame| -> BoxFuture<'static, Result<(), Error>> {
                let target = target.clone();
                let connection = connection.clone();
                Box::pin(async move {
                    target.set_state(State::Closed);
                    target.handlers().clear();
                    target.abort();
                    connection.remove_channel(target.id());
                    Ok(())
                })
            },
        );
    }

    fn spawn_heartbeater_task(&self) {
        let heartbeat = self.inner.negotiated.read().heartbeat;
        if heartbeat == 0 {
            return;
        }
        let connection = self.clone();
        let inner = Arc::clone(&self.inner);
        let interval = Duration::from_secs(heartbeat as u64);
        let task = tokio::spawn(async move {
            tracing::debug!(heartbeat_secs = heartbeat, "heartbeater task started");
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // first tick fires immediately
            loop {
                ticker.tick().await;
                if !matches!(*inner.state_rx.borrow(), State::Open) {
                    break;
                }

                let unseen_for = inner.last_received.lock().elapsed();
                if unseen_for >= interval * 2 {
                    tracing::warn!(heartbeat_secs = heartbeat, "no inbound activity for two intervals, tearing down");
                    connection.mark_closed_and_teardown();
                    break;
                }

                let idle_for = inner.last_sent.lock().elapsed();
                if idle_for >= interval {
                    let hb = weft_protocol::HeartbeatFrame;
                    if connection.enqueue(hb.encode()).is_err() {
                        break;
                    }
                }
            }
            tracing::debug!("heartbeater task stopped");
        });
        self.inner.tasks.lock().push(task);
    }

    /// Abrupt, handler-triggered teardown of a single non-zero channel:
    /// the same end state as a peer-initiated close, minus the CloseOk
    /// exchange.
    pub(crate) fn abrupt_close_channel(&self, channel: &Channel) {
        channel.set_state(State::Closed);
        channel.handlers().clear();
        channel.abort();
        self.remove_channel(channel.id());
    }

    /// Transition to `Closed` and abort every background task, the
    /// uncaught-handler-error path shared by the heartbeater's staleness
    /// check and a channel-0 handler failure.
    pub(crate) fn mark_closed_and_teardown(&self) {
        let _ = self.inner.state_tx.send(State::Closed);
        self.teardown();
    }

    pub(crate) fn teardown(&self) {
        for task in self.inner.tasks.lock().drain(..) {
            task.abort();
        }
        for channel in self.inner.channels.read().values() {
            channel.set_state(State::Closed);
            channel.handlers().clear();
            channel.abort();
        }
        self.inner.channels.write().clear();
        self.inner.inbound_senders.write().clear();
        let transport = Arc::clone(&self.inner.transport);
        tokio::spawn(async move {
            let _ = transport.close().await;
        });
    }
}

fn decode_close_reason(frame: weft_protocol::Frame) -> Result<CloseReason, Error> {
    let class_id = if frame.channel == 0 { CLASS_CONNECTION } else { CLASS_CHANNEL };
    let mf = weft_protocol::MethodFrame::try_from(frame)?;
    let descriptor = find_method(class_id, mf.method_id)?;
    let args = weft_protocol::catalog::decode_args(descriptor.args, &mut mf.args.clone())?;
    match (&args[0], &args[1], &args[2], &args[3]) {
        (ArgValue::Short(reply_code), ArgValue::ShortStr(reply_text), ArgValue::Short(offending_class), ArgValue::Short(offending_method)) => {
            Ok(CloseReason {
                reply_code: *reply_code,
                reply_text: reply_text.clone(),
                class_id: *offending_class,
                method_id: *offending_method,
            })
        }
        _ => Err(Error::Client("malformed close arguments".to_string())),
    }
}

fn route_frame(inner: &Arc<ConnectionInner>, frame: Frame) {
    let channel_id = frame.channel;
    let sender = inner.inbound_senders.read().get(&channel_id).cloned();
    match sender {
        Some(sender) => {
            if sender.try_send(frame).is_err() {
                tracing::warn!(channel_id, "channel inbound queue full or closed, dropping frame");
            }
        }
        None => {
            tracing::warn!(channel_id, frame_kind = ?frame.kind, "frame for unknown channel, dropping");
        }
    }
}
