use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use signal_bus::{
    IceCandidate, LocalRelay, PeerId, SessionDescription, SignalKind, SignalingRecord,
    SignalingTransport,
};
use tokio::time::timeout;
use watch_party_core::media::{CaptureConstraints, FacingMode};
use watch_party_core::negotiation::NegotiationState;
use watch_party_core::peer::mock::{MockCapture, MockConnector, MockPeerConnection};
use watch_party_core::peer::{
    ChannelOrigin, Connectivity, DataChannel, FrameOutcome, FrameSink, PeerEvent,
};
use watch_party_core::session::{EndReason, PeerSessionManager, SessionEvent, SessionStep};
use watch_party_core::{SessionConfig, WatchPartyError};

const STEP_TIMEOUT: Duration = Duration::from_secs(2);

fn alice() -> PeerId {
    PeerId::new("alice")
}

fn bob() -> PeerId {
    PeerId::new("bob")
}

struct Harness {
    relay: LocalRelay,
    connector: Arc<MockConnector>,
    capture: Arc<MockCapture>,
    session: PeerSessionManager,
}

impl Harness {
    fn new() -> Self {
        Self::with_capture(MockCapture::new())
    }

    fn with_capture(capture: MockCapture) -> Self {
        let relay = LocalRelay::new();
        let connector = Arc::new(MockConnector::new());
        let capture = Arc::new(capture);
        let session = PeerSessionManager::new(
            SessionConfig::localhost(),
            alice(),
            bob(),
            Arc::new(relay.clone()),
            connector.clone(),
            capture.clone(),
        );
        Self {
            relay,
            connector,
            capture,
            session,
        }
    }

    fn connection(&self) -> Arc<MockPeerConnection> {
        self.connector.connection()
    }

    async fn step(&mut self) -> SessionStep {
        let input = timeout(STEP_TIMEOUT, self.session.next_input())
            .await
            .expect("session input timed out");
        self.session.handle_input(input).await
    }

    async fn from_bob(&self, record: SignalingRecord) {
        self.relay.send(record).await.expect("relay send");
    }

    fn end_records_from_alice(&self) -> usize {
        self.relay
            .records_of_kind(SignalKind::End)
            .iter()
            .filter(|record| record.from == alice())
            .count()
    }
}

fn answer() -> SignalingRecord {
    SignalingRecord::answer(bob(), alice(), SessionDescription::answer("v=0\r\no=bob 1 0 IN IP4 127.0.0.1\r\n"))
}

fn candidate(n: u32) -> SignalingRecord {
    SignalingRecord::candidate(
        bob(),
        alice(),
        IceCandidate::new(format!("candidate:{n} 1 udp 2130706431 127.0.0.1 {} typ host", 50000 + n))
            .with_mid("0", 0),
    )
}

#[tokio::test]
async fn offer_answer_connect_and_open_channel() {
    let mut harness = Harness::new();
    harness.session.start().await.expect("start");
    assert_eq!(harness.session.state(), NegotiationState::AwaitingAnswer);

    let offers = harness.relay.records_of_kind(SignalKind::Offer);
    assert_eq!(offers.len(), 1);
    assert_eq!(offers[0].from, alice());
    assert_eq!(offers[0].to, bob());

    let connection = harness.connection();
    assert_eq!(connection.tracks().len(), 2);
    assert_eq!(connection.offers_created(), 1);
    let channels = connection.channels();
    assert_eq!(channels.len(), 1);
    assert_eq!(channels[0].label(), "watchPartySync");

    harness.from_bob(answer()).await;
    harness.step().await;
    assert_eq!(harness.session.state(), NegotiationState::Negotiated);
    assert_eq!(connection.remote_descriptions().len(), 1);

    connection.report_connectivity(Connectivity::Connected);
    harness.step().await;
    assert_eq!(harness.session.state(), NegotiationState::Connected);

    connection.open_local_channel().expect("local channel");
    match harness.step().await {
        SessionStep::ChannelOpen(channel) => assert!(channel.is_open()),
        other => panic!("expected open channel, got {other:?}"),
    }
}

#[tokio::test]
async fn candidates_ahead_of_answer_are_applied_after_it() {
    let mut harness = Harness::new();
    harness.session.start().await.expect("start");
    let connection = harness.connection();

    harness.from_bob(candidate(1)).await;
    harness.step().await;
    harness.from_bob(candidate(2)).await;
    harness.step().await;
    assert_eq!(harness.session.negotiation().pending_candidates(), 2);
    assert!(connection.applied_candidates().is_empty());

    harness.from_bob(answer()).await;
    harness.step().await;
    let applied = connection.applied_candidates();
    assert_eq!(applied.len(), 2);
    assert!(applied[0].candidate.starts_with("candidate:1 "));
    assert!(applied[1].candidate.starts_with("candidate:2 "));

    harness.from_bob(candidate(3)).await;
    harness.step().await;
    assert_eq!(connection.applied_candidates().len(), 3);
    assert_eq!(harness.session.negotiation().pending_candidates(), 0);
}

#[tokio::test]
async fn local_candidates_are_published_to_the_peer() {
    let mut harness = Harness::new();
    harness.session.start().await.expect("start");
    harness
        .connection()
        .emit(PeerEvent::LocalCandidate(IceCandidate::new(
            "candidate:9 1 udp 2130706431 127.0.0.1 40000 typ host",
        )));
    harness.step().await;

    let published = harness.relay.records_of_kind(SignalKind::Candidate);
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].from, alice());
    assert_eq!(published[0].to, bob());
}

#[tokio::test]
async fn local_end_releases_everything_once() {
    let mut harness = Harness::new();
    harness.session.start().await.expect("start");
    assert!(harness.capture.live_tracks() > 0);
    assert_eq!(harness.relay.subscriber_count(&alice()), 1);

    let reason = harness.session.terminate(EndReason::UserEnded).await;
    assert_eq!(reason, EndReason::UserEnded);
    let again = harness
        .session
        .terminate(EndReason::Failed("late".into()))
        .await;
    assert_eq!(again, EndReason::UserEnded);

    assert_eq!(harness.end_records_from_alice(), 1);
    assert_eq!(harness.capture.live_tracks(), 0);
    assert!(harness.connection().is_closed());
    assert!(!harness.session.has_connection());
    assert_eq!(harness.relay.subscriber_count(&alice()), 0);
    assert_eq!(harness.session.state(), NegotiationState::Failed);
}

#[tokio::test]
async fn peer_end_tears_down_the_session() {
    let mut harness = Harness::new();
    harness.session.start().await.expect("start");
    harness.from_bob(SignalingRecord::end(bob(), alice())).await;

    match harness.step().await {
        SessionStep::Ended(reason) => assert_eq!(reason, EndReason::PeerEnded),
        other => panic!("expected end, got {other:?}"),
    }
    assert_eq!(harness.capture.live_tracks(), 0);
    assert!(harness.connection().is_closed());
    assert_eq!(harness.end_records_from_alice(), 1);
}

#[tokio::test]
async fn lost_connectivity_fails_the_session() {
    let mut harness = Harness::new();
    harness.session.start().await.expect("start");
    harness.from_bob(answer()).await;
    harness.step().await;

    harness.connection().report_connectivity(Connectivity::Failed);
    match harness.step().await {
        SessionStep::Ended(EndReason::Failed(_)) => {}
        other => panic!("expected failure, got {other:?}"),
    }
    assert_eq!(harness.end_records_from_alice(), 1);
    assert_eq!(harness.capture.live_tracks(), 0);
}

#[tokio::test]
async fn denied_media_never_touches_the_relay() {
    let mut harness = Harness::with_capture(MockCapture::denied());
    let err = harness.session.start().await.expect_err("media denied");
    assert!(matches!(err, WatchPartyError::MediaAcquisition(_)));

    assert!(harness.relay.records().is_empty());
    assert_eq!(harness.relay.send_attempts(), 0);
    assert_eq!(harness.connector.connect_count(), 0);
    assert_eq!(harness.session.state(), NegotiationState::Failed);
}

#[tokio::test]
async fn relay_outage_during_offer_releases_media() {
    let mut harness = Harness::new();
    harness.relay.set_available(false);
    let err = harness.session.start().await.expect_err("relay offline");
    assert!(matches!(err, WatchPartyError::SignalingTransport(_)));

    assert_eq!(harness.capture.live_tracks(), 0);
    assert!(harness.connection().is_closed());
    // only the offer was attempted; no end for an unpublished offer
    assert_eq!(harness.relay.send_attempts(), 1);
}

#[tokio::test]
async fn remote_channel_wins_when_it_opens_first() {
    let mut harness = Harness::new();
    harness.session.start().await.expect("start");
    let connection = harness.connection();

    connection.announce_remote_channel("watchPartySync");
    harness.step().await;
    assert!(matches!(harness.step().await, SessionStep::ChannelOpen(_)));

    connection.open_local_channel();
    assert!(matches!(harness.step().await, SessionStep::Idle));

    connection.deliver_message(ChannelOrigin::Local, r#"{"action":"pause"}"#);
    assert!(matches!(harness.step().await, SessionStep::Idle));
    connection.deliver_message(ChannelOrigin::Remote, r#"{"action":"pause"}"#);
    assert!(matches!(harness.step().await, SessionStep::ChannelMessage(_)));
}

#[tokio::test]
async fn flipping_the_camera_swaps_only_video() {
    let mut harness = Harness::new();
    harness.session.start().await.expect("start");
    let original = harness.session.local_stream().cloned().expect("stream");

    let facing = harness.session.flip_camera().await.expect("flip");
    assert_eq!(facing, FacingMode::Environment);
    assert_eq!(
        harness.capture.requests().last().copied(),
        Some(CaptureConstraints::video_only(FacingMode::Environment))
    );
    assert_eq!(harness.connection().replaced_tracks().len(), 1);

    let old_video = original.video_track().expect("video");
    let old_audio = original.audio_track().expect("audio");
    assert!(!old_video.is_live());
    assert!(old_audio.is_live());

    let updated = harness.session.local_stream().expect("stream");
    assert!(updated.audio_track().expect("audio").same_track(old_audio));
    assert!(!updated.video_track().expect("video").same_track(old_video));
}

#[tokio::test]
async fn failed_flip_keeps_previous_facing() {
    let mut harness = Harness::new();
    harness.session.start().await.expect("start");
    harness.capture.set_denied(true);

    assert!(harness.session.flip_camera().await.is_err());
    assert_eq!(harness.session.facing(), FacingMode::User);
    assert!(harness.connection().replaced_tracks().is_empty());
}

#[tokio::test]
async fn failed_track_swap_releases_the_new_camera() {
    let mut harness = Harness::new();
    harness.session.start().await.expect("start");
    harness.connection().fail_replace_video();

    assert!(harness.session.flip_camera().await.is_err());
    assert_eq!(harness.session.facing(), FacingMode::User);
    let fresh = harness.capture.issued().last().cloned().expect("flip stream");
    assert_eq!(fresh.live_track_count(), 0);

    harness.session.terminate(EndReason::UserEnded).await;
    assert_eq!(harness.capture.live_tracks(), 0);
}

#[tokio::test]
async fn undeliverable_end_still_releases_everything() {
    let mut harness = Harness::new();
    harness.session.start().await.expect("start");
    let attempts = harness.relay.send_attempts();
    harness.relay.set_available(false);

    let reason = harness.session.terminate(EndReason::UserEnded).await;
    assert_eq!(reason, EndReason::UserEnded);
    assert_eq!(harness.relay.send_attempts(), attempts + 1);
    assert_eq!(harness.end_records_from_alice(), 0);
    assert_eq!(harness.capture.live_tracks(), 0);
    assert!(harness.connection().is_closed());
    assert_eq!(harness.relay.subscriber_count(&alice()), 0);
}

#[tokio::test]
async fn dropping_a_live_session_releases_media_and_connection() {
    let mut harness = Harness::new();
    harness.session.start().await.expect("start");
    let Harness {
        relay,
        connector,
        capture,
        session,
    } = harness;
    assert!(capture.live_tracks() > 0);
    drop(session);

    assert_eq!(capture.live_tracks(), 0);
    assert_eq!(relay.subscriber_count(&alice()), 0);
    let connection = connector.connection();
    timeout(STEP_TIMEOUT, async {
        while !connection.is_closed() || relay.records_of_kind(SignalKind::End).is_empty() {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("dropped session was not closed");
    assert_eq!(relay.records_of_kind(SignalKind::End).len(), 1);
}

#[tokio::test]
async fn dropping_an_ended_session_sends_nothing_more() {
    let mut harness = Harness::new();
    harness.session.start().await.expect("start");
    harness.session.terminate(EndReason::UserEnded).await;
    let attempts = harness.relay.send_attempts();
    let Harness { relay, session, .. } = harness;
    drop(session);
    tokio::task::yield_now().await;
    assert_eq!(relay.send_attempts(), attempts);
}

#[tokio::test]
async fn muted_tracks_send_no_frames() {
    let mut harness = Harness::new();
    let mut events = harness.session.subscribe_events();
    harness.session.start().await.expect("start");
    let sink: FrameSink = std::iter::from_fn(|| events.try_recv().ok())
        .find_map(|event| match event {
            SessionEvent::MediaReady(sink) => Some(sink),
            _ => None,
        })
        .expect("media ready event");
    let stream = harness.session.local_stream().cloned().expect("stream");
    let mic = stream.audio_track().cloned().expect("audio");
    let camera = stream.video_track().cloned().expect("video");
    let frame = Duration::from_millis(20);

    let outcome = sink
        .write(&mic, Bytes::from_static(b"opus"), frame)
        .await
        .expect("audio frame");
    assert_eq!(outcome, FrameOutcome::Written);

    assert_eq!(harness.session.toggle_audio(), Some(false));
    assert_eq!(harness.session.toggle_video(), Some(false));
    let outcome = harness
        .session
        .write_local_frame(&mic, Bytes::from_static(b"opus"), frame)
        .await
        .expect("muted frame");
    assert_eq!(outcome, FrameOutcome::Skipped);
    let outcome = sink
        .write(&camera, Bytes::from_static(b"vp8"), frame)
        .await
        .expect("camera-off frame");
    assert_eq!(outcome, FrameOutcome::Skipped);
    assert_eq!(harness.connection().frames_written().len(), 1);

    harness.session.terminate(EndReason::UserEnded).await;
    let outcome = sink
        .write(&mic, Bytes::from_static(b"opus"), frame)
        .await
        .expect("frame after end");
    assert_eq!(outcome, FrameOutcome::Ended);
}
