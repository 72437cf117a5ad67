//! Seam between the session logic and the peer connection backend.
//!
//! `rtc` drives a real webrtc-rs connection; `mock` records calls for tests.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use signal_bus::{IceCandidate, SessionDescription};
use tokio::sync::mpsc;

use crate::config::SessionConfig;
use crate::error::Result;
use crate::media::{MediaTrack, TrackKind};

pub mod mock;
pub mod rtc;

pub type PeerEventSink = mpsc::UnboundedSender<PeerEvent>;
pub type PeerEventStream = mpsc::UnboundedReceiver<PeerEvent>;

#[async_trait]
pub trait PeerConnector: Send + Sync {
    /// Creates a connection that reports its callbacks into `events`.
    async fn connect(
        &self,
        config: &SessionConfig,
        events: PeerEventSink,
    ) -> Result<Arc<dyn PeerConnection>>;
}

#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn add_track(&self, track: &MediaTrack) -> Result<()>;

    async fn create_data_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>>;

    /// Creates an offer and applies it as the local description.
    async fn create_offer(&self) -> Result<SessionDescription>;

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    /// Swaps the outgoing video without renegotiation. Returns false when no
    /// video sender exists.
    async fn replace_video_track(&self, track: &MediaTrack) -> Result<bool>;

    /// Sends one encoded frame on the sender attached for `track_id`.
    /// Frames for a disabled track are dropped; a stopped or unknown track
    /// reports `Ended`.
    async fn write_frame(&self, track_id: &str, data: Bytes, duration: Duration)
    -> Result<FrameOutcome>;

    async fn close(&self) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    Written,
    /// Muted microphone or camera switched off.
    Skipped,
    /// The track is gone; the feeder should stop.
    Ended,
}

/// Whether a frame for `track` may leave the connection.
pub fn gate_frame(track: Option<&MediaTrack>) -> FrameOutcome {
    match track {
        Some(track) if !track.is_live() => FrameOutcome::Ended,
        Some(track) if !track.is_enabled() => FrameOutcome::Skipped,
        Some(_) => FrameOutcome::Written,
        None => FrameOutcome::Ended,
    }
}

/// Entry point for a capture pipeline to push encoded media into the call.
#[derive(Clone)]
pub struct FrameSink {
    connection: Arc<dyn PeerConnection>,
}

impl FrameSink {
    pub fn new(connection: Arc<dyn PeerConnection>) -> Self {
        Self { connection }
    }

    pub async fn write(
        &self,
        track: &MediaTrack,
        data: Bytes,
        duration: Duration,
    ) -> Result<FrameOutcome> {
        self.connection.write_frame(track.id(), data, duration).await
    }
}

impl fmt::Debug for FrameSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameSink").finish_non_exhaustive()
    }
}

#[async_trait]
pub trait DataChannel: Send + Sync + fmt::Debug {
    fn label(&self) -> &str;

    fn is_open(&self) -> bool;

    async fn send_text(&self, text: String) -> Result<()>;
}

/// Which side created the data channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelOrigin {
    Local,
    Remote,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectivity {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

impl Connectivity {
    pub fn is_connected(self) -> bool {
        matches!(self, Connectivity::Connected | Connectivity::Completed)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Connectivity::Failed | Connectivity::Closed)
    }
}

#[derive(Debug, Clone)]
pub enum PeerEvent {
    LocalCandidate(IceCandidate),
    Connectivity(Connectivity),
    RemoteTrack { stream_id: String, kind: TrackKind },
    ChannelAnnounced(Arc<dyn DataChannel>),
    ChannelOpen(ChannelOrigin),
    ChannelMessage { origin: ChannelOrigin, text: String },
    ChannelClosed(ChannelOrigin),
}
