use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use signal_bus::{PeerId, SessionDescription, SignalKind, SignalingRecord, SignalingTransport};
use tokio::net::TcpListener;
use tokio::time::timeout;
use watch_party_core::negotiation::NegotiationState;
use watch_party_core::peer::mock::{MockCapture, MockConnector};
use watch_party_core::session::PeerSessionManager;
use watch_party_core::signaling::{RelayClient, RelayClientConfig};
use watch_party_core::SessionConfig;
use watch_party_relay::{RelayConfig, serve};

const RECV_TIMEOUT: Duration = Duration::from_secs(3);

async fn start_relay() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(serve(listener, RelayConfig::default()));
    addr
}

async fn client(addr: SocketAddr) -> RelayClient {
    RelayClient::connect(RelayClientConfig::new(format!("http://{addr}")))
        .await
        .expect("relay client")
}

#[tokio::test]
async fn records_round_trip_through_the_relay() {
    let addr = start_relay().await;
    let alice = client(addr).await;
    let bob = client(addr).await;

    let mut inbox = bob.subscribe(&PeerId::new("bob")).await.expect("subscribe");
    alice
        .send(SignalingRecord::offer(
            PeerId::new("alice"),
            PeerId::new("bob"),
            SessionDescription::offer("v=0\r\n"),
        ))
        .await
        .expect("send offer");
    alice
        .send(SignalingRecord::offer(
            PeerId::new("alice"),
            PeerId::new("carol"),
            SessionDescription::offer("v=0\r\n"),
        ))
        .await
        .expect("send to carol");
    alice
        .send(SignalingRecord::end(PeerId::new("alice"), PeerId::new("bob")))
        .await
        .expect("send end");

    let first = timeout(RECV_TIMEOUT, inbox.recv())
        .await
        .expect("offer timed out")
        .expect("subscription open");
    assert_eq!(first.kind, SignalKind::Offer);
    assert_eq!(first.description().map(|d| d.sdp.as_str()), Some("v=0\r\n"));

    let second = timeout(RECV_TIMEOUT, inbox.recv())
        .await
        .expect("end timed out")
        .expect("subscription open");
    assert_eq!(second.kind, SignalKind::End);
    assert_eq!(second.from, PeerId::new("alice"));
}

#[tokio::test]
async fn rejected_rows_surface_as_errors() {
    let addr = start_relay().await;
    let alice = client(addr).await;
    let result = alice
        .send(SignalingRecord::end(PeerId::new("alice"), PeerId::new("")))
        .await;
    assert!(matches!(result, Err(signal_bus::RelayError::Rejected(_))));
}

#[tokio::test]
async fn session_negotiates_over_a_live_relay() {
    let addr = start_relay().await;
    let alice_transport: Arc<dyn SignalingTransport> = Arc::new(client(addr).await);
    let bob = client(addr).await;
    let mut bob_inbox = bob.subscribe(&PeerId::new("bob")).await.expect("subscribe");

    let connector = Arc::new(MockConnector::new());
    let mut session = PeerSessionManager::new(
        SessionConfig::localhost(),
        PeerId::new("alice"),
        PeerId::new("bob"),
        alice_transport,
        connector.clone(),
        Arc::new(MockCapture::new()),
    );
    session.start().await.expect("start");

    let offer = timeout(RECV_TIMEOUT, bob_inbox.recv())
        .await
        .expect("offer timed out")
        .expect("subscription open");
    assert_eq!(offer.kind, SignalKind::Offer);

    bob.send(SignalingRecord::answer(
        PeerId::new("bob"),
        PeerId::new("alice"),
        SessionDescription::answer("v=0\r\n"),
    ))
    .await
    .expect("answer");

    let input = timeout(RECV_TIMEOUT, session.next_input())
        .await
        .expect("answer timed out");
    session.handle_input(input).await;
    assert_eq!(session.state(), NegotiationState::Negotiated);
    assert_eq!(connector.connection().remote_descriptions().len(), 1);
}
