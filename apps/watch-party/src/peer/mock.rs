//! In-memory peer backend and media capture for tests.
//!
//! The mock connection records every call made against it and lets a test
//! play the remote side by emitting backend events.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use signal_bus::{IceCandidate, SessionDescription};

use crate::config::SessionConfig;
use crate::error::{Result, WatchPartyError};
use crate::media::{CaptureConstraints, LocalStream, MediaCapture, MediaTrack, TrackKind};
use crate::peer::{
    ChannelOrigin, Connectivity, DataChannel, FrameOutcome, PeerConnection, PeerConnector,
    PeerEvent, PeerEventSink, gate_frame,
};

#[derive(Debug)]
pub struct MockDataChannel {
    label: String,
    open: AtomicBool,
    sent: Mutex<Vec<String>>,
}

impl MockDataChannel {
    pub fn new(label: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            label: label.into(),
            open: AtomicBool::new(false),
            sent: Mutex::new(Vec::new()),
        })
    }

    pub fn set_open(&self, open: bool) {
        self.open.store(open, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl DataChannel for MockDataChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn send_text(&self, text: String) -> Result<()> {
        if !self.is_open() {
            return Err(WatchPartyError::ChannelClosed);
        }
        self.sent.lock().push(text);
        Ok(())
    }
}

#[derive(Default)]
pub struct MockPeerConnection {
    events: Mutex<Option<PeerEventSink>>,
    tracks: Mutex<Vec<MediaTrack>>,
    channels: Mutex<Vec<Arc<MockDataChannel>>>,
    offers: AtomicUsize,
    remote_descriptions: Mutex<Vec<SessionDescription>>,
    applied: Mutex<Vec<IceCandidate>>,
    rejected: Mutex<HashSet<String>>,
    replaced: Mutex<Vec<MediaTrack>>,
    frames: Mutex<Vec<(String, usize)>>,
    closed: AtomicBool,
    fail_remote_description: AtomicBool,
    fail_replace_video: AtomicBool,
}

impl MockPeerConnection {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn attach(&self, sink: PeerEventSink) {
        *self.events.lock() = Some(sink);
    }

    /// Delivers a backend event as if the connection raised it.
    pub fn emit(&self, event: PeerEvent) -> bool {
        match self.events.lock().as_ref() {
            Some(sink) => sink.send(event).is_ok(),
            None => false,
        }
    }

    /// Opens the locally created channel and reports it.
    pub fn open_local_channel(&self) -> Option<Arc<MockDataChannel>> {
        let channel = self.channels.lock().first().cloned()?;
        channel.set_open(true);
        self.emit(PeerEvent::ChannelOpen(ChannelOrigin::Local));
        Some(channel)
    }

    /// Announces and opens a channel created by the remote peer.
    pub fn announce_remote_channel(&self, label: &str) -> Arc<MockDataChannel> {
        let channel = MockDataChannel::new(label);
        channel.set_open(true);
        self.emit(PeerEvent::ChannelAnnounced(channel.clone()));
        self.emit(PeerEvent::ChannelOpen(ChannelOrigin::Remote));
        channel
    }

    pub fn deliver_message(&self, origin: ChannelOrigin, text: impl Into<String>) -> bool {
        self.emit(PeerEvent::ChannelMessage {
            origin,
            text: text.into(),
        })
    }

    pub fn report_connectivity(&self, connectivity: Connectivity) -> bool {
        self.emit(PeerEvent::Connectivity(connectivity))
    }

    pub fn reject_candidate(&self, candidate: &str) {
        self.rejected.lock().insert(candidate.to_string());
    }

    pub fn fail_remote_description(&self) {
        self.fail_remote_description.store(true, Ordering::SeqCst);
    }

    pub fn fail_replace_video(&self) {
        self.fail_replace_video.store(true, Ordering::SeqCst);
    }

    /// `(track id, byte length)` of every frame that went out.
    pub fn frames_written(&self) -> Vec<(String, usize)> {
        self.frames.lock().clone()
    }

    pub fn tracks(&self) -> Vec<MediaTrack> {
        self.tracks.lock().clone()
    }

    pub fn channels(&self) -> Vec<Arc<MockDataChannel>> {
        self.channels.lock().clone()
    }

    pub fn offers_created(&self) -> usize {
        self.offers.load(Ordering::SeqCst)
    }

    pub fn remote_descriptions(&self) -> Vec<SessionDescription> {
        self.remote_descriptions.lock().clone()
    }

    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        self.applied.lock().clone()
    }

    pub fn replaced_tracks(&self) -> Vec<MediaTrack> {
        self.replaced.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PeerConnection for MockPeerConnection {
    async fn add_track(&self, track: &MediaTrack) -> Result<()> {
        self.tracks.lock().push(track.clone());
        Ok(())
    }

    async fn create_data_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>> {
        let channel = MockDataChannel::new(label);
        self.channels.lock().push(channel.clone());
        let channel: Arc<dyn DataChannel> = channel;
        Ok(channel)
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        let n = self.offers.fetch_add(1, Ordering::SeqCst);
        Ok(SessionDescription::offer(format!("v=0\r\no=mock {n} 0 IN IP4 127.0.0.1\r\n")))
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        if self.fail_remote_description.load(Ordering::SeqCst) {
            return Err(WatchPartyError::PeerConnection(
                "remote description rejected".into(),
            ));
        }
        self.remote_descriptions.lock().push(description);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        if self.rejected.lock().contains(&candidate.candidate) {
            return Err(WatchPartyError::IceApply(candidate.candidate));
        }
        self.applied.lock().push(candidate);
        Ok(())
    }

    async fn replace_video_track(&self, track: &MediaTrack) -> Result<bool> {
        if self.fail_replace_video.load(Ordering::SeqCst) {
            return Err(WatchPartyError::PeerConnection("replace track rejected".into()));
        }
        let has_sender = self
            .tracks
            .lock()
            .iter()
            .any(|t| t.kind() == TrackKind::Video);
        if has_sender {
            self.replaced.lock().push(track.clone());
        }
        Ok(has_sender)
    }

    async fn write_frame(
        &self,
        track_id: &str,
        data: Bytes,
        _duration: Duration,
    ) -> Result<FrameOutcome> {
        if self.is_closed() {
            return Ok(FrameOutcome::Ended);
        }
        let track = {
            let tracks = self.tracks.lock();
            let replaced = self.replaced.lock();
            tracks
                .iter()
                .chain(replaced.iter())
                .find(|t| t.id() == track_id)
                .cloned()
        };
        let outcome = gate_frame(track.as_ref());
        if outcome == FrameOutcome::Written {
            self.frames.lock().push((track_id.to_string(), data.len()));
        }
        Ok(outcome)
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        for channel in self.channels.lock().iter() {
            channel.set_open(false);
        }
        Ok(())
    }
}

/// Hands out one shared `MockPeerConnection`.
#[derive(Default)]
pub struct MockConnector {
    connection: Arc<MockPeerConnection>,
    fail: AtomicBool,
    connects: AtomicUsize,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connection(&self) -> Arc<MockPeerConnection> {
        self.connection.clone()
    }

    pub fn fail_connect(&self) {
        self.fail.store(true, Ordering::SeqCst);
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PeerConnector for MockConnector {
    async fn connect(
        &self,
        _config: &SessionConfig,
        events: PeerEventSink,
    ) -> Result<Arc<dyn PeerConnection>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(WatchPartyError::PeerConnection("mock connect failure".into()));
        }
        self.connection.attach(events);
        let connection: Arc<dyn PeerConnection> = self.connection.clone();
        Ok(connection)
    }
}

/// Capture that fabricates tracks, or refuses while denied.
#[derive(Default)]
pub struct MockCapture {
    denied: AtomicBool,
    requests: Mutex<Vec<CaptureConstraints>>,
    issued: Mutex<Vec<LocalStream>>,
}

impl MockCapture {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn denied() -> Self {
        let capture = Self::default();
        capture.set_denied(true);
        capture
    }

    pub fn set_denied(&self, denied: bool) {
        self.denied.store(denied, Ordering::SeqCst);
    }

    pub fn requests(&self) -> Vec<CaptureConstraints> {
        self.requests.lock().clone()
    }

    /// Every stream handed out so far.
    pub fn issued(&self) -> Vec<LocalStream> {
        self.issued.lock().clone()
    }

    /// Tracks from issued streams that have not been stopped.
    pub fn live_tracks(&self) -> usize {
        self.issued
            .lock()
            .iter()
            .map(LocalStream::live_track_count)
            .sum()
    }
}

#[async_trait]
impl MediaCapture for MockCapture {
    async fn acquire(&self, constraints: CaptureConstraints) -> Result<LocalStream> {
        let n = {
            let mut requests = self.requests.lock();
            requests.push(constraints);
            requests.len()
        };
        if self.denied.load(Ordering::SeqCst) {
            return Err(WatchPartyError::MediaAcquisition(
                "permission denied".into(),
            ));
        }
        let facing = format!("{:?}", constraints.facing).to_lowercase();
        let mut tracks = Vec::new();
        if constraints.video {
            tracks.push(MediaTrack::new(format!("{facing}-video-{n}"), TrackKind::Video));
        }
        if constraints.audio {
            tracks.push(MediaTrack::new(format!("audio-{n}"), TrackKind::Audio));
        }
        let stream = LocalStream::new(format!("stream-{n}"), tracks);
        self.issued.lock().push(stream.clone());
        Ok(stream)
    }
}
