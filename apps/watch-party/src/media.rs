use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackKind::Audio => f.write_str("audio"),
            TrackKind::Video => f.write_str("video"),
        }
    }
}

/// Shared handle to one captured track.
///
/// Clones refer to the same underlying track, so a toggle made through the
/// connection's copy is visible to the self-preview and vice versa.
#[derive(Clone)]
pub struct MediaTrack {
    inner: Arc<TrackInner>,
}

struct TrackInner {
    id: String,
    kind: TrackKind,
    enabled: AtomicBool,
    live: AtomicBool,
}

impl MediaTrack {
    pub fn new(id: impl Into<String>, kind: TrackKind) -> Self {
        Self {
            inner: Arc::new(TrackInner {
                id: id.into(),
                kind,
                enabled: AtomicBool::new(true),
                live: AtomicBool::new(true),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn kind(&self) -> TrackKind {
        self.inner.kind
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::SeqCst);
    }

    /// Flips `enabled` and returns the new value.
    pub fn toggle_enabled(&self) -> bool {
        !self.inner.enabled.fetch_xor(true, Ordering::SeqCst)
    }

    /// Ends the track. A stopped track never becomes live again.
    pub fn stop(&self) {
        self.inner.live.store(false, Ordering::SeqCst);
    }

    pub fn is_live(&self) -> bool {
        self.inner.live.load(Ordering::SeqCst)
    }

    pub fn same_track(&self, other: &MediaTrack) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for MediaTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaTrack")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("enabled", &self.is_enabled())
            .field("live", &self.is_live())
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct LocalStream {
    id: String,
    tracks: Vec<MediaTrack>,
}

impl LocalStream {
    pub fn new(id: impl Into<String>, tracks: Vec<MediaTrack>) -> Self {
        Self {
            id: id.into(),
            tracks,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tracks(&self) -> &[MediaTrack] {
        &self.tracks
    }

    pub fn audio_track(&self) -> Option<&MediaTrack> {
        self.tracks.iter().find(|t| t.kind() == TrackKind::Audio)
    }

    pub fn video_track(&self) -> Option<&MediaTrack> {
        self.tracks.iter().find(|t| t.kind() == TrackKind::Video)
    }

    pub fn stop_all(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }

    pub fn live_track_count(&self) -> usize {
        self.tracks.iter().filter(|t| t.is_live()).count()
    }

    /// New stream carrying `video` plus the audio tracks of this one.
    pub fn with_video(&self, id: impl Into<String>, video: MediaTrack) -> Self {
        let mut tracks = vec![video];
        tracks.extend(
            self.tracks
                .iter()
                .filter(|t| t.kind() == TrackKind::Audio)
                .cloned(),
        );
        Self::new(id, tracks)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FacingMode {
    #[default]
    User,
    Environment,
}

impl FacingMode {
    pub fn flipped(self) -> Self {
        match self {
            FacingMode::User => FacingMode::Environment,
            FacingMode::Environment => FacingMode::User,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureConstraints {
    pub facing: FacingMode,
    pub audio: bool,
    pub video: bool,
}

impl CaptureConstraints {
    pub fn camera_and_microphone(facing: FacingMode) -> Self {
        Self {
            facing,
            audio: true,
            video: true,
        }
    }

    pub fn video_only(facing: FacingMode) -> Self {
        Self {
            facing,
            audio: false,
            video: true,
        }
    }
}

/// Local camera/microphone access.
#[async_trait]
pub trait MediaCapture: Send + Sync {
    /// Fails with `WatchPartyError::MediaAcquisition` when permission is
    /// denied or no device matches.
    async fn acquire(&self, constraints: CaptureConstraints) -> Result<LocalStream>;
}

/// Opaque handle to the peer's media, handed to the rendering sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteStream {
    pub stream_id: String,
    /// False while only audio has arrived; the UI shows a placeholder.
    pub has_video: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_enabled_and_live_state() {
        let track = MediaTrack::new("mic", TrackKind::Audio);
        let preview = track.clone();
        assert!(!track.toggle_enabled());
        assert!(!preview.is_enabled());
        preview.stop();
        assert!(!track.is_live());
        assert!(track.same_track(&preview));
    }

    #[test]
    fn with_video_keeps_existing_audio() {
        let audio = MediaTrack::new("mic", TrackKind::Audio);
        let front = MediaTrack::new("front", TrackKind::Video);
        let stream = LocalStream::new("s1", vec![audio.clone(), front]);
        let back = MediaTrack::new("back", TrackKind::Video);
        let next = stream.with_video("s2", back.clone());
        assert!(next.audio_track().is_some_and(|t| t.same_track(&audio)));
        assert!(next.video_track().is_some_and(|t| t.same_track(&back)));
        assert_eq!(next.tracks().len(), 2);
    }

    #[test]
    fn stop_all_ends_every_track() {
        let stream = LocalStream::new(
            "s",
            vec![
                MediaTrack::new("mic", TrackKind::Audio),
                MediaTrack::new("cam", TrackKind::Video),
            ],
        );
        assert_eq!(stream.live_track_count(), 2);
        stream.stop_all();
        assert_eq!(stream.live_track_count(), 0);
    }
}
