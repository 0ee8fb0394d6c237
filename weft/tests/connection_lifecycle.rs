//! End-to-end exercises of the connection/channel state machine over a pair
//! of in-memory transports. One end is driven by `weft::Connection`; the
//! other is played by a small scripted "server" task that speaks just enough
//! of the wire protocol to drive the client through a scenario.

use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

use weft::{CloseReason, Connection, ConnectionConfig, IoTransport, State};
use weft_protocol::{ArgValue, FieldTable, Frame, MethodFrame, CLASS_CHANNEL, CLASS_CONNECTION, PROTOCOL_HEADER};

async fn read_protocol_header(server: &mut DuplexStream) {
    let mut buf = [0u8; 8];
    server.read_exact(&mut buf).await.unwrap();
    assert_eq!(buf, PROTOCOL_HEADER);
}

async fn read_frame(server: &mut DuplexStream) -> Frame {
    let mut accumulated = BytesMut::new();
    loop {
        let mut cursor = accumulated.clone().freeze();
        if let Ok(frame) = Frame::decode(&mut cursor) {
            return frame;
        }
        let mut scratch = [0u8; 4096];
        let n = server.read(&mut scratch).await.unwrap();
        assert!(n > 0, "server side closed while waiting for a frame");
        accumulated.extend_from_slice(&scratch[..n]);
    }
}

async fn read_method(server: &mut DuplexStream) -> MethodFrame {
    MethodFrame::try_from(read_frame(server).await).unwrap()
}

async fn send_method(server: &mut DuplexStream, channel: u16, class_id: u16, method_id: u16, args: Vec<ArgValue>) {
    let descriptor = weft_protocol::catalog::find_method(class_id, method_id).unwrap();
    let encoded = weft_protocol::catalog::encode_args(descriptor.args, &args).unwrap();
    let mf = MethodFrame { channel, class_id, method_id, args: encoded.freeze() };
    server.write_all(&mf.encode().encode()).await.unwrap();
    server.flush().await.unwrap();
}

/// Drives a duplex-stream peer through Start/Tune/Open. Both sides propose
/// `heartbeat: 0`, so no heartbeater task is spawned and no test here has
/// to account for one firing mid-scenario.
async fn run_handshake_server(mut server: DuplexStream) -> DuplexStream {
    read_protocol_header(&mut server).await;

    send_method(
        &mut server,
        0,
        CLASS_CONNECTION,
        10,
        vec![
            ArgValue::Octet(0),
            ArgValue::Octet(9),
            ArgValue::Table(FieldTable::new()),
            ArgValue::LongStr(Bytes::from_static(b"PLAIN")),
            ArgValue::LongStr(Bytes::from_static(b"en_US")),
        ],
    )
    .await;
    let start_ok = read_method(&mut server).await;
    assert_eq!((start_ok.class_id, start_ok.method_id), (CLASS_CONNECTION, 11));

    send_method(
        &mut server,
        0,
        CLASS_CONNECTION,
        30,
        vec![ArgValue::Short(2047), ArgValue::Long(131072), ArgValue::Short(0)],
    )
    .await;
    let tune_ok = read_method(&mut server).await;
    assert_eq!((tune_ok.class_id, tune_ok.method_id), (CLASS_CONNECTION, 31));

    let open = read_method(&mut server).await;
    assert_eq!((open.class_id, open.method_id), (CLASS_CONNECTION, 40));
    send_method(&mut server, 0, CLASS_CONNECTION, 41, vec![ArgValue::ShortStr(String::new())]).await;

    server
}

#[tokio::test]
async fn handshake_reaches_open() {
    let (client_stream, server_stream) = tokio::io::duplex(65536);
    let server = tokio::spawn(run_handshake_server(server_stream));

    let transport = std::sync::Arc::new(IoTransport::new(client_stream));
    let connection = Connection::connect(transport, ConnectionConfig::default(), weft::auth::plain("guest", "guest")).await.unwrap();

    assert_eq!(connection.state(), State::Open);
    server.await.unwrap();
}

#[tokio::test]
async fn channel_open_assigns_lowest_free_id_and_reuses_it_after_close() {
    let (client_stream, server_stream) = tokio::io::duplex(65536);
    let server_task = tokio::spawn(async move {
        let mut server = run_handshake_server(server_stream).await;
        for _ in 0..3 {
            let open = read_method(&mut server).await;
            assert_eq!((open.class_id, open.method_id), (CLASS_CHANNEL, 10));
            send_method(&mut server, open.channel, CLASS_CHANNEL, 11, vec![ArgValue::LongStr(Bytes::new())]).await;
        }
        let close = read_method(&mut server).await;
        assert_eq!((close.class_id, close.method_id), (CLASS_CHANNEL, 40));
        send_method(&mut server, close.channel, CLASS_CHANNEL, 41, vec![]).await;

        let reopen = read_method(&mut server).await;
        assert_eq!((reopen.class_id, reopen.method_id), (CLASS_CHANNEL, 10));
        send_method(&mut server, reopen.channel, CLASS_CHANNEL, 11, vec![ArgValue::LongStr(Bytes::new())]).await;
        server
    });

    let transport = std::sync::Arc::new(IoTransport::new(client_stream));
    let connection = Connection::connect(transport, ConnectionConfig::default(), weft::auth::plain("guest", "guest")).await.unwrap();

    let ch1 = connection.open_channel().await.unwrap();
    let ch2 = connection.open_channel().await.unwrap();
    let ch3 = connection.open_channel().await.unwrap();
    assert_eq!((ch1.id(), ch2.id(), ch3.id()), (1, 2, 3));

    ch2.close(CloseReason::normal()).await.unwrap();

    let ch2_again = connection.open_channel().await.unwrap();
    assert_eq!(ch2_again.id(), 2);

    server_task.await.unwrap();
}

#[tokio::test]
async fn handshake_fails_when_server_does_not_advertise_requested_mechanism() {
    let (client_stream, server_stream) = tokio::io::duplex(65536);
    let server_task = tokio::spawn(async move {
        let mut server = server_stream;
        read_protocol_header(&mut server).await;
        send_method(
            &mut server,
            0,
            CLASS_CONNECTION,
            10,
            vec![
                ArgValue::Octet(0),
                ArgValue::Octet(9),
                ArgValue::Table(FieldTable::new()),
                ArgValue::LongStr(Bytes::from_static(b"AMQPLAIN")),
                ArgValue::LongStr(Bytes::from_static(b"en_US")),
            ],
        )
        .await;
        server
    });

    let transport = std::sync::Arc::new(IoTransport::new(client_stream));
    // The mismatch is caught inside channel 0's receiver task, which — like
    // any handler failure — closes the connection rather than propagating
    // the error synchronously; `connect` only observes the resulting state.
    let err = Connection::connect(transport, ConnectionConfig::default(), weft::auth::plain("guest", "guest")).await.unwrap_err();
    assert!(matches!(err, weft::Error::Client(_)));

    server_task.await.unwrap();
}

#[tokio::test]
async fn channel_open_with_explicit_id_rejects_reuse_and_out_of_range() {
    let (client_stream, server_stream) = tokio::io::duplex(65536);
    let server_task = tokio::spawn(async move {
        let mut server = run_handshake_server(server_stream).await;
        let open = read_method(&mut server).await;
        assert_eq!((open.class_id, open.method_id), (CLASS_CHANNEL, 10));
        assert_eq!(open.channel, 5);
        send_method(&mut server, 5, CLASS_CHANNEL, 11, vec![ArgValue::LongStr(Bytes::new())]).await;
        server
    });

    let transport = std::sync::Arc::new(IoTransport::new(client_stream));
    let connection = Connection::connect(transport, ConnectionConfig::default(), weft::auth::plain("guest", "guest")).await.unwrap();

    let ch5 = connection.open_channel_with_id(5).await.unwrap();
    assert_eq!(ch5.id(), 5);

    let err = connection.open_channel_with_id(5).await.unwrap_err();
    assert!(matches!(err, weft::Error::Client(msg) if msg.contains("already in use")));

    let err = connection.open_channel_with_id(0).await.unwrap_err();
    assert!(matches!(err, weft::Error::Client(_)));

    server_task.await.unwrap();
}

#[tokio::test]
async fn cooperative_close_reaches_closed() {
    let (client_stream, server_stream) = tokio::io::duplex(65536);
    let server_task = tokio::spawn(async move {
        let mut server = run_handshake_server(server_stream).await;
        let close = read_method(&mut server).await;
        assert_eq!((close.class_id, close.method_id), (CLASS_CONNECTION, 50));
        send_method(&mut server, 0, CLASS_CONNECTION, 51, vec![]).await;
        server
    });

    let transport = std::sync::Arc::new(IoTransport::new(client_stream));
    let connection = Connection::connect(transport, ConnectionConfig::default(), weft::auth::plain("guest", "guest")).await.unwrap();

    connection.close(CloseReason::normal()).await.unwrap();
    assert_eq!(connection.state(), State::Closed);

    server_task.await.unwrap();
}

#[tokio::test]
async fn peer_initiated_close_is_acked_and_reaches_closed() {
    let (client_stream, server_stream) = tokio::io::duplex(65536);
    let server_task = tokio::spawn(async move {
        let mut server = run_handshake_server(server_stream).await;
        send_method(
            &mut server,
            0,
            CLASS_CONNECTION,
            50,
            vec![
                ArgValue::Short(320),
                ArgValue::ShortStr("broker shutting down".to_string()),
                ArgValue::Short(0),
                ArgValue::Short(0),
            ],
        )
        .await;
        let close_ok = read_method(&mut server).await;
        assert_eq!((close_ok.class_id, close_ok.method_id), (CLASS_CONNECTION, 51));
        server
    });

    let transport = std::sync::Arc::new(IoTransport::new(client_stream));
    let connection = Connection::connect(transport, ConnectionConfig::default(), weft::auth::plain("guest", "guest")).await.unwrap();

    tokio::time::timeout(Duration::from_secs(1), async {
        loop {
            if connection.state() == State::Closed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    let reason = connection.close_reason().unwrap();
    assert_eq!(reason.reply_code, 320);
    assert_eq!(reason.reply_text, "broker shutting down");

    server_task.await.unwrap();
}
