use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use signal_bus::wire::{ClientMessage, ServerMessage};
use signal_bus::{PeerId, RelayRow, SessionDescription, SignalingRecord};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use watch_party_relay::{RelayConfig, serve};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

const FRAME_TIMEOUT: Duration = Duration::from_secs(2);

async fn start_relay() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(serve(listener, RelayConfig::default()));
    addr
}

async fn open(addr: SocketAddr) -> Socket {
    let (socket, _) = connect_async(format!("ws://{addr}/ws"))
        .await
        .expect("connect");
    socket
}

async fn send(socket: &mut Socket, message: &ClientMessage) {
    let text = serde_json::to_string(message).expect("encode");
    socket.send(Message::Text(text)).await.expect("send");
}

async fn next_message(socket: &mut Socket) -> ServerMessage {
    loop {
        let frame = timeout(FRAME_TIMEOUT, socket.next())
            .await
            .expect("frame timed out")
            .expect("socket closed")
            .expect("frame");
        if let Message::Text(text) = frame {
            return serde_json::from_str(&text).expect("server message");
        }
    }
}

fn offer_row(from: &str, to: &str) -> RelayRow {
    RelayRow::from_record(
        &SignalingRecord::offer(
            PeerId::new(from),
            PeerId::new(to),
            SessionDescription::offer("v=0\r\n"),
        ),
        Some("watchparty"),
    )
    .expect("row")
}

#[tokio::test]
async fn appended_rows_reach_only_their_receiver() {
    let addr = start_relay().await;
    let mut bob = open(addr).await;
    let mut carol = open(addr).await;
    let mut alice = open(addr).await;

    for (socket, id) in [(&mut bob, "bob"), (&mut carol, "carol")] {
        send(socket, &ClientMessage::Subscribe { receiver_id: id.into() }).await;
        match next_message(socket).await {
            ServerMessage::Subscribed { receiver_id } => assert_eq!(receiver_id, id),
            other => panic!("expected subscribed, got {other:?}"),
        }
    }

    send(
        &mut alice,
        &ClientMessage::Append {
            request_id: 7,
            record: offer_row("alice", "bob"),
        },
    )
    .await;
    let appended_id = match next_message(&mut alice).await {
        ServerMessage::Appended { request_id, id } => {
            assert_eq!(request_id, 7);
            id
        }
        other => panic!("expected ack, got {other:?}"),
    };

    match next_message(&mut bob).await {
        ServerMessage::Insert { id, record } => {
            assert_eq!(id, appended_id);
            assert_eq!(record, offer_row("alice", "bob"));
        }
        other => panic!("expected insert, got {other:?}"),
    }

    send(&mut carol, &ClientMessage::Ping).await;
    assert!(matches!(next_message(&mut carol).await, ServerMessage::Pong));
}

#[tokio::test]
async fn invalid_frames_and_rows_are_reported() {
    let addr = start_relay().await;
    let mut socket = open(addr).await;

    socket
        .send(Message::Text("{\"type\":\"dance\"}".into()))
        .await
        .expect("send");
    assert!(matches!(
        next_message(&mut socket).await,
        ServerMessage::Error { request_id: None, .. }
    ));

    let mut row = offer_row("alice", "bob");
    row.signal_data = "{}".into();
    send(&mut socket, &ClientMessage::Append { request_id: 3, record: row }).await;
    assert!(matches!(
        next_message(&mut socket).await,
        ServerMessage::Error { request_id: Some(3), .. }
    ));
}

#[tokio::test]
async fn unsubscribed_receivers_get_nothing() {
    let addr = start_relay().await;
    let mut bob = open(addr).await;
    let mut alice = open(addr).await;

    send(&mut bob, &ClientMessage::Subscribe { receiver_id: "bob".into() }).await;
    next_message(&mut bob).await;
    send(&mut bob, &ClientMessage::Unsubscribe { receiver_id: "bob".into() }).await;
    send(&mut bob, &ClientMessage::Ping).await;
    assert!(matches!(next_message(&mut bob).await, ServerMessage::Pong));

    send(
        &mut alice,
        &ClientMessage::Append {
            request_id: 1,
            record: offer_row("alice", "bob"),
        },
    )
    .await;
    next_message(&mut alice).await;

    send(&mut bob, &ClientMessage::Ping).await;
    assert!(matches!(next_message(&mut bob).await, ServerMessage::Pong));
}

#[tokio::test]
async fn health_reports_counts() {
    let addr = start_relay().await;
    let mut alice = open(addr).await;
    send(
        &mut alice,
        &ClientMessage::Append {
            request_id: 1,
            record: offer_row("alice", "bob"),
        },
    )
    .await;
    next_message(&mut alice).await;

    let mut stream = TcpStream::connect(addr).await.expect("tcp");
    stream
        .write_all(b"GET /health HTTP/1.1\r\nHost: relay\r\nConnection: close\r\n\r\n")
        .await
        .expect("request");
    let mut response = String::new();
    timeout(FRAME_TIMEOUT, stream.read_to_string(&mut response))
        .await
        .expect("response timed out")
        .expect("read");
    assert!(response.starts_with("HTTP/1.1 200"));
    assert!(response.contains("\"status\":\"ok\""));
    assert!(response.contains("\"records\":1"));
}
