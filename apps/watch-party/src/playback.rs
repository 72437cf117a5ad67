use std::fmt;
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaybackSource {
    /// Shareable with the peer.
    RemoteUrl(String),
    /// Only meaningful on this machine; never sent to the peer.
    LocalFile(PathBuf),
}

impl fmt::Display for PlaybackSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlaybackSource::RemoteUrl(url) => f.write_str(url),
            PlaybackSource::LocalFile(path) => write!(f, "file://{}", path.display()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlaybackState {
    pub current_time: f64,
    pub is_playing: bool,
    pub source: Option<PlaybackSource>,
    /// Unknown until the source's metadata has loaded.
    pub duration: Option<f64>,
}

/// The video element the sync protocol steers.
pub trait Player: Send {
    fn current_time(&self) -> f64;
    fn duration(&self) -> Option<f64>;
    fn is_playing(&self) -> bool;
    fn source(&self) -> Option<&PlaybackSource>;
    fn seek_to(&mut self, time: f64);
    fn play(&mut self);
    fn pause(&mut self);
    fn set_source(&mut self, source: PlaybackSource);
}

/// In-memory player with no decoding; the clock only moves through
/// `advance` or explicit seeks.
#[derive(Debug, Clone, Default)]
pub struct HeadlessPlayer {
    state: PlaybackState,
}

impl HeadlessPlayer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_duration(duration: f64) -> Self {
        let mut player = Self::new();
        player.set_duration(duration);
        player
    }

    pub fn state(&self) -> &PlaybackState {
        &self.state
    }

    pub fn set_duration(&mut self, duration: f64) {
        if duration.is_finite() && duration >= 0.0 {
            self.state.duration = Some(duration);
        }
    }

    /// Moves the clock forward while playing.
    pub fn advance(&mut self, seconds: f64) {
        if self.state.is_playing {
            let target = self.state.current_time + seconds;
            self.seek_to(target);
        }
    }
}

impl Player for HeadlessPlayer {
    fn current_time(&self) -> f64 {
        self.state.current_time
    }

    fn duration(&self) -> Option<f64> {
        self.state.duration
    }

    fn is_playing(&self) -> bool {
        self.state.is_playing
    }

    fn source(&self) -> Option<&PlaybackSource> {
        self.state.source.as_ref()
    }

    fn seek_to(&mut self, time: f64) {
        let mut time = time.max(0.0);
        if let Some(duration) = self.state.duration {
            time = time.min(duration);
        }
        self.state.current_time = time;
    }

    fn play(&mut self) {
        self.state.is_playing = true;
    }

    fn pause(&mut self) {
        self.state.is_playing = false;
    }

    fn set_source(&mut self, source: PlaybackSource) {
        self.state = PlaybackState {
            source: Some(source),
            ..PlaybackState::default()
        };
    }
}

/// `m:ss`, or `h:mm:ss` past the hour.
pub fn format_time(seconds: f64) -> String {
    let total = if seconds.is_finite() && seconds > 0.0 {
        seconds.floor() as u64
    } else {
        0
    };
    let (h, m, s) = (total / 3600, (total % 3600) / 60, total % 60);
    if h > 0 {
        format!("{h}:{m:02}:{s:02}")
    } else {
        format!("{m}:{s:02}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seek_clamps_to_known_duration() {
        let mut player = HeadlessPlayer::with_duration(100.0);
        player.seek_to(140.0);
        assert_eq!(player.current_time(), 100.0);
        player.seek_to(-3.0);
        assert_eq!(player.current_time(), 0.0);
    }

    #[test]
    fn new_source_resets_position_and_pauses() {
        let mut player = HeadlessPlayer::with_duration(50.0);
        player.seek_to(20.0);
        player.play();
        player.set_source(PlaybackSource::RemoteUrl("https://example.com/a.mp4".into()));
        assert_eq!(player.current_time(), 0.0);
        assert!(!player.is_playing());
        assert_eq!(player.duration(), None);
    }

    #[test]
    fn advance_only_while_playing() {
        let mut player = HeadlessPlayer::new();
        player.advance(5.0);
        assert_eq!(player.current_time(), 0.0);
        player.play();
        player.advance(5.0);
        assert_eq!(player.current_time(), 5.0);
    }

    #[test]
    fn formats_clock_times() {
        assert_eq!(format_time(0.0), "0:00");
        assert_eq!(format_time(65.9), "1:05");
        assert_eq!(format_time(3725.0), "1:02:05");
        assert_eq!(format_time(f64::NAN), "0:00");
    }
}
