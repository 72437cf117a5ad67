//! Owns one watch-party call: local media, the peer connection, the relay
//! subscription and the negotiation state.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use signal_bus::{PeerId, RelayError, SignalingRecord, SignalingTransport, Subscription};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::error::{Result, WatchPartyError};
use crate::media::{CaptureConstraints, FacingMode, LocalStream, MediaCapture, MediaTrack, RemoteStream, TrackKind};
use crate::negotiation::{NegotiationSession, NegotiationState, RecordOutcome};
use crate::peer::{
    ChannelOrigin, DataChannel, FrameOutcome, FrameSink, PeerConnection, PeerConnector,
    PeerEvent, PeerEventStream,
};

const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndReason {
    UserEnded,
    PeerEnded,
    Failed(String),
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndReason::UserEnded => f.write_str("ended locally"),
            EndReason::PeerEnded => f.write_str("ended by peer"),
            EndReason::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

/// Published to the UI layer.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    StateChanged(NegotiationState),
    ChannelOpen(ChannelOrigin),
    RemoteStream(RemoteStream),
    LocalStreamChanged(LocalStream),
    /// Local tracks are attached; encoded frames can be fed through the sink.
    MediaReady(FrameSink),
    Ended(EndReason),
}

/// One thing the session is waiting on.
#[derive(Debug)]
pub enum SessionInput {
    Signal(Option<SignalingRecord>),
    Peer(Option<PeerEvent>),
}

/// Result of handling an input, for the owner of the sync protocol.
#[derive(Debug)]
pub enum SessionStep {
    Idle,
    ChannelOpen(Arc<dyn DataChannel>),
    ChannelMessage(String),
    ChannelClosed,
    Ended(EndReason),
}

pub struct PeerSessionManager {
    config: SessionConfig,
    transport: Arc<dyn SignalingTransport>,
    connector: Arc<dyn PeerConnector>,
    capture: Arc<dyn MediaCapture>,
    negotiation: NegotiationSession,
    connection: Option<Arc<dyn PeerConnection>>,
    subscription: Option<Subscription>,
    peer_events: Option<PeerEventStream>,
    local_stream: Option<LocalStream>,
    facing: FacingMode,
    local_channel: Option<Arc<dyn DataChannel>>,
    announced_channel: Option<Arc<dyn DataChannel>>,
    open_origin: Option<ChannelOrigin>,
    remote_stream: Option<RemoteStream>,
    events: broadcast::Sender<SessionEvent>,
    last_state: NegotiationState,
    end_attempted: bool,
    ended: Option<EndReason>,
}

impl PeerSessionManager {
    pub fn new(
        config: SessionConfig,
        local_peer: PeerId,
        remote_peer: PeerId,
        transport: Arc<dyn SignalingTransport>,
        connector: Arc<dyn PeerConnector>,
        capture: Arc<dyn MediaCapture>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let facing = config.initial_facing;
        Self {
            config,
            transport,
            connector,
            capture,
            negotiation: NegotiationSession::new(local_peer, remote_peer),
            connection: None,
            subscription: None,
            peer_events: None,
            local_stream: None,
            facing,
            local_channel: None,
            announced_channel: None,
            open_origin: None,
            remote_stream: None,
            events,
            last_state: NegotiationState::Idle,
            end_attempted: false,
            ended: None,
        }
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn state(&self) -> NegotiationState {
        self.negotiation.state()
    }

    pub fn negotiation(&self) -> &NegotiationSession {
        &self.negotiation
    }

    pub fn local_stream(&self) -> Option<&LocalStream> {
        self.local_stream.as_ref()
    }

    pub fn remote_stream(&self) -> Option<&RemoteStream> {
        self.remote_stream.as_ref()
    }

    pub fn facing(&self) -> FacingMode {
        self.facing
    }

    pub fn has_connection(&self) -> bool {
        self.connection.is_some()
    }

    pub fn end_reason(&self) -> Option<&EndReason> {
        self.ended.as_ref()
    }

    fn publish(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    fn publish_state(&mut self) {
        let state = self.negotiation.state();
        if state != self.last_state {
            self.last_state = state;
            self.publish(SessionEvent::StateChanged(state));
        }
    }

    /// Acquires media, opens the connection and publishes the offer.
    ///
    /// Any failure tears the session down before returning the error.
    pub async fn start(&mut self) -> Result<()> {
        self.negotiation.begin_offer()?;
        self.publish_state();
        match self.establish().await {
            Ok(()) => Ok(()),
            Err(err) => {
                warn!(peer = %self.negotiation.remote_peer(), error = %err, "watch party setup failed");
                self.terminate(EndReason::Failed(err.to_string())).await;
                Err(err)
            }
        }
    }

    async fn establish(&mut self) -> Result<()> {
        let stream = self
            .capture
            .acquire(CaptureConstraints::camera_and_microphone(self.facing))
            .await?;
        self.local_stream = Some(stream.clone());
        self.publish(SessionEvent::LocalStreamChanged(stream.clone()));

        let subscription = self
            .transport
            .subscribe(self.negotiation.local_peer())
            .await?;
        self.subscription = Some(subscription);

        let (tx, rx) = mpsc::unbounded_channel();
        self.peer_events = Some(rx);
        let connection = self.connector.connect(&self.config, tx).await?;
        self.connection = Some(connection.clone());

        for track in stream.tracks() {
            connection.add_track(track).await?;
        }
        self.publish(SessionEvent::MediaReady(FrameSink::new(connection.clone())));
        let channel = connection
            .create_data_channel(&self.config.data_channel_label)
            .await?;
        self.local_channel = Some(channel);

        let offer = connection.create_offer().await?;
        self.transport
            .send(SignalingRecord::offer(
                self.negotiation.local_peer().clone(),
                self.negotiation.remote_peer().clone(),
                offer,
            ))
            .await?;
        self.negotiation.offer_sent()?;
        self.publish_state();
        info!(
            local = %self.negotiation.local_peer(),
            remote = %self.negotiation.remote_peer(),
            "watch party offer published"
        );
        Ok(())
    }

    /// Waits for the next relay record or backend event.
    pub async fn next_input(&mut self) -> SessionInput {
        let subscription = self.subscription.as_mut();
        let peer_events = self.peer_events.as_mut();
        tokio::select! {
            record = next_record(subscription) => SessionInput::Signal(record),
            event = next_peer_event(peer_events) => SessionInput::Peer(event),
        }
    }

    /// Fatal errors end the session here; the step reports it.
    pub async fn handle_input(&mut self, input: SessionInput) -> SessionStep {
        if self.ended.is_some() {
            return SessionStep::Idle;
        }
        let result = match input {
            SessionInput::Signal(Some(record)) => self.handle_signal(record).await,
            SessionInput::Signal(None) => self.handle_subscription_closed(),
            SessionInput::Peer(Some(event)) => self.handle_peer_event(event).await,
            SessionInput::Peer(None) => {
                self.peer_events = None;
                Ok(SessionStep::Idle)
            }
        };
        match result {
            Ok(step) => step,
            Err(err) if err.is_fatal() => {
                let reason = self.terminate(EndReason::Failed(err.to_string())).await;
                SessionStep::Ended(reason)
            }
            Err(err) => {
                warn!(error = %err, "ignoring non-fatal session error");
                SessionStep::Idle
            }
        }
    }

    fn before_connected(&self) -> bool {
        !matches!(
            self.negotiation.state(),
            NegotiationState::Connected | NegotiationState::Failed
        )
    }

    fn handle_subscription_closed(&mut self) -> Result<SessionStep> {
        self.subscription = None;
        if self.before_connected() {
            return Err(WatchPartyError::SignalingTransport(RelayError::Closed));
        }
        debug!("relay subscription closed after connecting");
        Ok(SessionStep::Idle)
    }

    pub async fn handle_signal(&mut self, record: SignalingRecord) -> Result<SessionStep> {
        let Some(connection) = self.connection.clone() else {
            return Ok(SessionStep::Idle);
        };
        let outcome = self
            .negotiation
            .handle_record(&record, connection.as_ref())
            .await?;
        self.publish_state();
        match outcome {
            RecordOutcome::PeerEnded => {
                let reason = self.terminate(EndReason::PeerEnded).await;
                Ok(SessionStep::Ended(reason))
            }
            _ => Ok(SessionStep::Idle),
        }
    }

    pub async fn handle_peer_event(&mut self, event: PeerEvent) -> Result<SessionStep> {
        match event {
            PeerEvent::LocalCandidate(candidate) => {
                let record = SignalingRecord::candidate(
                    self.negotiation.local_peer().clone(),
                    self.negotiation.remote_peer().clone(),
                    candidate,
                );
                if let Err(err) = self.transport.send(record).await {
                    if self.before_connected() {
                        return Err(err.into());
                    }
                    warn!(error = %err, "failed to publish local ice candidate");
                }
                Ok(SessionStep::Idle)
            }
            PeerEvent::Connectivity(connectivity) => {
                let result = self.negotiation.on_connectivity(connectivity);
                self.publish_state();
                result.map(|_| SessionStep::Idle)
            }
            PeerEvent::RemoteTrack { stream_id, kind } => {
                let stream = match self.remote_stream.take() {
                    Some(mut stream) if stream.stream_id == stream_id => {
                        stream.has_video |= kind == TrackKind::Video;
                        stream
                    }
                    _ => RemoteStream {
                        stream_id,
                        has_video: kind == TrackKind::Video,
                    },
                };
                self.remote_stream = Some(stream.clone());
                self.publish(SessionEvent::RemoteStream(stream));
                self.negotiation.on_remote_media();
                self.publish_state();
                Ok(SessionStep::Idle)
            }
            PeerEvent::ChannelAnnounced(channel) => {
                if self.open_origin.is_none() {
                    self.announced_channel = Some(channel);
                } else {
                    debug!(label = channel.label(), "ignoring late remote data channel");
                }
                Ok(SessionStep::Idle)
            }
            PeerEvent::ChannelOpen(origin) => {
                if self.open_origin.is_some() {
                    debug!(?origin, "data channel already selected");
                    return Ok(SessionStep::Idle);
                }
                let channel = match origin {
                    ChannelOrigin::Local => self.local_channel.clone(),
                    ChannelOrigin::Remote => self.announced_channel.clone(),
                };
                let Some(channel) = channel else {
                    warn!(?origin, "open event for unknown data channel");
                    return Ok(SessionStep::Idle);
                };
                self.open_origin = Some(origin);
                self.negotiation.on_channel_open();
                self.publish_state();
                self.publish(SessionEvent::ChannelOpen(origin));
                info!(?origin, label = channel.label(), "data channel open");
                Ok(SessionStep::ChannelOpen(channel))
            }
            PeerEvent::ChannelMessage { origin, text } => {
                if self.open_origin == Some(origin) {
                    Ok(SessionStep::ChannelMessage(text))
                } else {
                    debug!(?origin, "message on unselected data channel");
                    Ok(SessionStep::Idle)
                }
            }
            PeerEvent::ChannelClosed(origin) => {
                if self.open_origin == Some(origin) {
                    info!(?origin, "data channel closed");
                    Ok(SessionStep::ChannelClosed)
                } else {
                    Ok(SessionStep::Idle)
                }
            }
        }
    }

    /// Hot-swaps the outgoing video. No-op without a connection.
    pub async fn replace_local_video_track(&self, track: &MediaTrack) -> Result<bool> {
        match &self.connection {
            Some(connection) => connection.replace_video_track(track).await,
            None => Ok(false),
        }
    }

    /// Feeds one encoded frame for a local track. Muted tracks are skipped.
    pub async fn write_local_frame(
        &self,
        track: &MediaTrack,
        data: Bytes,
        duration: Duration,
    ) -> Result<FrameOutcome> {
        match &self.connection {
            Some(connection) => connection.write_frame(track.id(), data, duration).await,
            None => Ok(FrameOutcome::Ended),
        }
    }

    /// Switches to the opposite camera. On failure the previous facing is
    /// restored and the error returned.
    pub async fn flip_camera(&mut self) -> Result<FacingMode> {
        let Some(stream) = self.local_stream.clone() else {
            return Ok(self.facing);
        };
        let previous = self.facing;
        self.facing = previous.flipped();
        match self.swap_camera(&stream, self.facing).await {
            Ok(updated) => {
                self.local_stream = Some(updated.clone());
                self.publish(SessionEvent::LocalStreamChanged(updated));
                info!(facing = ?self.facing, "camera switched");
                Ok(self.facing)
            }
            Err(err) => {
                self.facing = previous;
                warn!(error = %err, "could not switch camera");
                Err(err)
            }
        }
    }

    async fn swap_camera(&self, stream: &LocalStream, facing: FacingMode) -> Result<LocalStream> {
        if let Some(video) = stream.video_track() {
            video.stop();
        }
        let fresh = self
            .capture
            .acquire(CaptureConstraints::video_only(facing))
            .await?;
        let Some(video) = fresh.video_track().cloned() else {
            fresh.stop_all();
            return Err(WatchPartyError::MediaAcquisition(
                "capture returned no video track".into(),
            ));
        };
        if let Err(err) = self.replace_local_video_track(&video).await {
            fresh.stop_all();
            return Err(err);
        }
        Ok(stream.with_video(uuid::Uuid::new_v4().to_string(), video))
    }

    /// Returns the new `enabled` value, or `None` without an audio track.
    pub fn toggle_audio(&self) -> Option<bool> {
        self.local_stream
            .as_ref()
            .and_then(LocalStream::audio_track)
            .map(MediaTrack::toggle_enabled)
    }

    pub fn toggle_video(&self) -> Option<bool> {
        self.local_stream
            .as_ref()
            .and_then(LocalStream::video_track)
            .map(MediaTrack::toggle_enabled)
    }

    /// Stops media, closes the connection, sends a best-effort `end` and
    /// drops the relay subscription. Idempotent; returns the first reason.
    pub async fn terminate(&mut self, reason: EndReason) -> EndReason {
        if let Some(existing) = &self.ended {
            return existing.clone();
        }
        self.ended = Some(reason.clone());

        if let Some(stream) = &self.local_stream {
            stream.stop_all();
        }
        if let Some(connection) = self.connection.take() {
            if let Err(err) = connection.close().await {
                warn!(target = "webrtc", error = %err, "failed to close peer connection");
            }
        }
        self.local_channel = None;
        self.announced_channel = None;

        if self.negotiation.offer_published() && !self.end_attempted {
            self.end_attempted = true;
            let record = SignalingRecord::end(
                self.negotiation.local_peer().clone(),
                self.negotiation.remote_peer().clone(),
            );
            if let Err(err) = self.transport.send(record).await {
                warn!(error = %err, "failed to deliver end record");
            }
        }

        if let Some(subscription) = self.subscription.take() {
            subscription.unsubscribe();
        }
        self.peer_events = None;

        self.negotiation.fail();
        self.publish_state();
        self.publish(SessionEvent::Ended(reason.clone()));
        info!(peer = %self.negotiation.remote_peer(), %reason, "watch party ended");
        reason
    }
}

impl Drop for PeerSessionManager {
    fn drop(&mut self) {
        if self.ended.is_some() {
            return;
        }
        if let Some(stream) = &self.local_stream {
            stream.stop_all();
        }
        self.local_channel = None;
        self.announced_channel = None;
        if let Some(subscription) = self.subscription.take() {
            subscription.unsubscribe();
        }

        let connection = self.connection.take();
        let end = (self.negotiation.offer_published() && !self.end_attempted).then(|| {
            SignalingRecord::end(
                self.negotiation.local_peer().clone(),
                self.negotiation.remote_peer().clone(),
            )
        });
        if connection.is_none() && end.is_none() {
            return;
        }
        // Closing and the end record need a runtime; without one only media is released.
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("session dropped outside a runtime; peer connection left to the backend");
            return;
        };
        let transport = self.transport.clone();
        runtime.spawn(async move {
            if let Some(connection) = connection {
                if let Err(err) = connection.close().await {
                    warn!(target = "webrtc", error = %err, "failed to close dropped peer connection");
                }
            }
            if let Some(record) = end {
                if let Err(err) = transport.send(record).await {
                    warn!(error = %err, "failed to deliver end record for dropped session");
                }
            }
        });
        info!(peer = %self.negotiation.remote_peer(), "watch party session dropped without ending");
    }
}

async fn next_record(subscription: Option<&mut Subscription>) -> Option<SignalingRecord> {
    match subscription {
        Some(subscription) => subscription.recv().await,
        None => std::future::pending().await,
    }
}

async fn next_peer_event(events: Option<&mut PeerEventStream>) -> Option<PeerEvent> {
    match events {
        Some(events) => events.recv().await,
        None => std::future::pending().await,
    }
}
