use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use clap::{Args, Parser};
use party_telemetry::{LogConfig, LogLevel, Profile};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use watch_party_core::media::{CaptureConstraints, FacingMode, LocalStream, MediaCapture, MediaTrack, TrackKind};
use watch_party_core::peer::rtc::RtcConnector;
use watch_party_core::peer::{FrameOutcome, FrameSink};
use watch_party_core::playback::{HeadlessPlayer, format_time};
use watch_party_core::session::SessionEvent;
use watch_party_core::signaling::{RelayClient, RelayClientConfig};
use watch_party_core::sync::SyncEvent;
use watch_party_core::{
    Contact, PartyCommand, PartyEvent, PeerId, PeerSessionManager, SessionConfig,
    SessionConfigBuilder, SignalingTransport, WatchParty, WatchPartyError,
};

const LOG_PROFILE: Profile = Profile {
    targets: &["watch_party", "watch_party_core", "signal_bus"],
    env_prefix: "WATCH_PARTY",
};

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("❌ {err}");
        std::process::exit(1);
    }
}

#[derive(Parser, Debug)]
#[command(
    name = "watch-party",
    about = "🍿 Watch something together over a WebRTC call",
    author,
    version
)]
struct Cli {
    #[arg(
        long,
        env = "WATCH_PARTY_RELAY_URL",
        default_value = "http://127.0.0.1:8090",
        help = "Base URL of the signalling relay"
    )]
    relay_url: String,

    #[arg(long = "me", env = "WATCH_PARTY_USER_ID", help = "Your user id")]
    local_id: String,

    #[arg(long = "peer", env = "WATCH_PARTY_PEER_ID", help = "User id of the person to call")]
    remote_id: String,

    #[arg(
        long = "peer-name",
        env = "WATCH_PARTY_PEER_NAME",
        default_value = "peer",
        help = "Display name shown next to the peer's chat messages"
    )]
    remote_name: String,

    #[arg(long, help = "Skip STUN/TURN and gather host candidates only")]
    localhost_only: bool,

    #[arg(long, help = "Start with the rear-facing camera")]
    rear_camera: bool,

    #[command(flatten)]
    logging: LoggingArgs,
}

#[derive(Args, Debug, Clone)]
struct LoggingArgs {
    #[arg(
        long = "log-level",
        value_enum,
        env = "WATCH_PARTY_LOG_LEVEL",
        default_value_t = LogLevel::Warn,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    level: LogLevel,

    #[arg(
        long = "log-file",
        value_name = "PATH",
        env = "WATCH_PARTY_LOG_FILE",
        help = "Write structured logs to the specified file"
    )]
    file: Option<PathBuf>,
}

impl LoggingArgs {
    fn to_config(&self) -> LogConfig {
        LogConfig {
            level: self.level,
            file: self.file.clone(),
        }
    }
}

#[derive(Debug, Error)]
enum CliError {
    #[error("logging initialization failed: {0}")]
    Logging(#[from] party_telemetry::InitError),
    #[error("relay unavailable: {0}")]
    Relay(#[from] signal_bus::RelayError),
    #[error("{0}")]
    Party(#[from] WatchPartyError),
    #[error("party task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

async fn run() -> Result<(), CliError> {
    let cli = Cli::parse();
    let log_config = cli.logging.to_config();
    let _log_guard = party_telemetry::init(&LOG_PROFILE, &log_config)?;
    debug!(log_level = ?log_config.level, log_file = ?log_config.file, "logging configured");

    let base = if cli.localhost_only {
        SessionConfig::localhost()
    } else {
        SessionConfig::from_env()
    };
    let facing = if cli.rear_camera {
        FacingMode::Environment
    } else {
        FacingMode::User
    };
    let config = SessionConfigBuilder::from_config(base)
        .initial_facing(facing)
        .build();
    let mut relay_config = RelayClientConfig::new(cli.relay_url.clone());
    relay_config.call_mode = Some(config.call_mode.clone());
    let transport: Arc<dyn SignalingTransport> = Arc::new(RelayClient::connect(relay_config).await?);
    info!(relay = %cli.relay_url, "connected to relay");

    let contact = Contact::new(cli.remote_id.as_str(), cli.remote_name.clone());
    let session = PeerSessionManager::new(
        config,
        PeerId::new(cli.local_id.clone()),
        contact.id.clone(),
        transport,
        Arc::new(RtcConnector::new()),
        Arc::new(SyntheticCapture::default()),
    );
    let (party, handle) = WatchParty::new(session, contact.clone(), HeadlessPlayer::new());
    let mut events = handle.subscribe();
    let mut party_task = tokio::spawn(party.run());

    println!("📞 calling {} ({}); type /help for commands", contact.name, contact.id);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let mut local_stream: Option<LocalStream> = None;
    let mut feeders: Vec<JoinHandle<()>> = Vec::new();

    let report = loop {
        tokio::select! {
            finished = &mut party_task => break finished??,
            event = events.recv() => match event {
                Ok(event) => {
                    match &event {
                        PartyEvent::Session(SessionEvent::LocalStreamChanged(stream)) => {
                            local_stream = Some(stream.clone());
                        }
                        PartyEvent::Session(SessionEvent::MediaReady(sink)) => {
                            if let Some(mic) = local_stream.as_ref().and_then(LocalStream::audio_track) {
                                feeders.push(tokio::spawn(feed_silence(sink.clone(), mic.clone())));
                            }
                        }
                        _ => {}
                    }
                    print_event(&contact, &event);
                }
                Err(RecvError::Lagged(skipped)) => debug!(skipped, "event printer lagged"),
                Err(RecvError::Closed) => {}
            },
            line = lines.next_line(), if stdin_open => match line {
                Err(err) => {
                    warn!(error = %err, "stdin failed; ending the call");
                    stdin_open = false;
                    handle.send(PartyCommand::End);
                }
                Ok(None) => {
                    stdin_open = false;
                    handle.send(PartyCommand::End);
                }
                Ok(Some(line)) => match parse_command(&line) {
                    Input::Command(command) => {
                        handle.send(command);
                    }
                    Input::Help => print_help(),
                    Input::Nothing => {}
                    Input::Invalid(message) => println!("⚠️  {message}"),
                },
            },
        }
    };
    for feeder in feeders {
        feeder.abort();
    }

    println!(
        "👋 call {} ({} chat messages)",
        report.reason,
        report.chat.len()
    );
    Ok(())
}

#[derive(Debug, PartialEq)]
enum Input {
    Command(PartyCommand),
    Help,
    Nothing,
    Invalid(String),
}

fn parse_seconds(arg: Option<&str>, usage: &str) -> Result<f64, String> {
    arg.and_then(|value| value.trim().parse::<f64>().ok())
        .filter(|value| value.is_finite())
        .ok_or_else(|| format!("usage: {usage}"))
}

fn parse_command(line: &str) -> Input {
    let line = line.trim();
    if line.is_empty() {
        return Input::Nothing;
    }
    let Some(rest) = line.strip_prefix('/') else {
        return Input::Command(PartyCommand::Chat(line.to_string()));
    };
    let (name, arg) = match rest.split_once(char::is_whitespace) {
        Some((name, arg)) => (name, Some(arg.trim())),
        None => (rest, None),
    };
    let command = match name {
        "help" => return Input::Help,
        "play" => PartyCommand::Play,
        "pause" => PartyCommand::Pause,
        "toggle" => PartyCommand::TogglePlayback,
        "seek" => match parse_seconds(arg, "/seek <seconds>") {
            Ok(time) => PartyCommand::Seek(time),
            Err(message) => return Input::Invalid(message),
        },
        "skip" => match parse_seconds(arg, "/skip <seconds>") {
            Ok(delta) => PartyCommand::Skip(delta),
            Err(message) => return Input::Invalid(message),
        },
        "url" => match arg.filter(|url| !url.is_empty()) {
            Some(url) => PartyCommand::ShareUrl(url.to_string()),
            None => return Input::Invalid("usage: /url <address>".into()),
        },
        "file" => match arg.filter(|path| !path.is_empty()) {
            Some(path) => PartyCommand::OpenLocalFile(PathBuf::from(path)),
            None => return Input::Invalid("usage: /file <path>".into()),
        },
        "mute" => PartyCommand::ToggleAudio,
        "camera" => PartyCommand::ToggleVideo,
        "flip" => PartyCommand::FlipCamera,
        "end" | "quit" => PartyCommand::End,
        other => return Input::Invalid(format!("unknown command /{other}; try /help")),
    };
    Input::Command(command)
}

fn print_help() {
    println!(
        "commands: /play /pause /toggle /seek <s> /skip <s> /url <address> /file <path> /mute /camera /flip /end\n\
         anything else is sent as chat"
    );
}

fn print_event(contact: &Contact, event: &PartyEvent) {
    match event {
        PartyEvent::Session(SessionEvent::StateChanged(state)) => println!("· {state}"),
        PartyEvent::Session(SessionEvent::ChannelOpen(_)) => println!("🔗 sync channel open"),
        PartyEvent::Session(SessionEvent::RemoteStream(stream)) => {
            let video = if stream.has_video { "with video" } else { "audio only" };
            println!("🎥 receiving {} ({video})", contact.name);
        }
        PartyEvent::Session(SessionEvent::Ended(reason)) => println!("📴 {reason}"),
        PartyEvent::Session(SessionEvent::LocalStreamChanged(_) | SessionEvent::MediaReady(_)) => {}
        PartyEvent::Playback { time, playing } => {
            let icon = if *playing { "▶" } else { "⏸" };
            println!("{icon} {}", format_time(*time));
        }
        PartyEvent::SourceChanged(source) => println!("🎬 now watching {source}"),
        PartyEvent::SourcePickerVisible(_) => {}
        PartyEvent::Remote(SyncEvent::Played { time }) => {
            println!("▶ {} played at {}", contact.name, format_time(*time));
        }
        PartyEvent::Remote(SyncEvent::Paused) => println!("⏸ {} paused", contact.name),
        PartyEvent::Remote(SyncEvent::Seeked { time }) => {
            println!("⏩ {} jumped to {}", contact.name, format_time(*time));
        }
        PartyEvent::Remote(SyncEvent::SourceChanged { url }) => {
            println!("🎬 {} shared {url}", contact.name);
        }
        PartyEvent::Remote(SyncEvent::ChatReceived { text }) => {
            println!("{}: {text}", contact.name);
        }
        PartyEvent::ChatSent(entry) => println!("{}: {}", entry.sender, entry.text),
        PartyEvent::AudioEnabled(enabled) => {
            println!("{}", if *enabled { "🎙 unmuted" } else { "🔇 muted" });
        }
        PartyEvent::VideoEnabled(enabled) => {
            println!("{}", if *enabled { "📷 camera on" } else { "🚫 camera off" });
        }
        PartyEvent::CameraFlipped(facing) => println!("🔄 camera facing {facing:?}"),
        PartyEvent::Notice(message) => println!("⚠️  {message}"),
    }
}

const OPUS_SILENCE: [u8; 3] = [0xf8, 0xff, 0xfe];
const AUDIO_FRAME: Duration = Duration::from_millis(20);

/// Keeps the audio sender fed with Opus silence frames; placeholder tracks
/// have no encoder behind them.
async fn feed_silence(sink: FrameSink, mic: MediaTrack) {
    let mut ticker = tokio::time::interval(AUDIO_FRAME);
    loop {
        ticker.tick().await;
        match sink
            .write(&mic, Bytes::from_static(&OPUS_SILENCE), AUDIO_FRAME)
            .await
        {
            Ok(FrameOutcome::Ended) => break,
            Ok(_) => {}
            Err(err) => {
                debug!(error = %err, "audio feed stopped");
                break;
            }
        }
    }
}

/// Hands out placeholder tracks so the call can negotiate without devices.
#[derive(Debug, Default)]
struct SyntheticCapture {
    issued: AtomicU64,
}

#[async_trait]
impl MediaCapture for SyntheticCapture {
    async fn acquire(
        &self,
        constraints: CaptureConstraints,
    ) -> watch_party_core::Result<LocalStream> {
        let n = self.issued.fetch_add(1, Ordering::SeqCst);
        let mut tracks = Vec::new();
        if constraints.audio {
            tracks.push(MediaTrack::new(format!("synthetic-audio-{n}"), TrackKind::Audio));
        }
        if constraints.video {
            tracks.push(MediaTrack::new(
                format!("synthetic-{:?}-video-{n}", constraints.facing).to_lowercase(),
                TrackKind::Video,
            ));
        }
        Ok(LocalStream::new(format!("synthetic-stream-{n}"), tracks))
    }
}
