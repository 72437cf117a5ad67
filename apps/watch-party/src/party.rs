//! The watch-party event loop: UI commands in, party events out.

use std::path::PathBuf;

use signal_bus::PeerId;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info};

use crate::chat::{ChatEntry, ChatLog, ChatSender};
use crate::error::Result;
use crate::media::FacingMode;
use crate::negotiation::NegotiationState;
use crate::playback::{PlaybackSource, Player};
use crate::session::{EndReason, PeerSessionManager, SessionEvent, SessionStep};
use crate::sync::{SyncEvent, SyncProtocol};

const PARTY_EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Contact {
    pub id: PeerId,
    pub name: String,
}

impl Contact {
    pub fn new(id: impl Into<PeerId>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PartyCommand {
    Play,
    Pause,
    TogglePlayback,
    Seek(f64),
    /// Relative seek, clamped to the playable range.
    Skip(f64),
    ShareUrl(String),
    OpenLocalFile(PathBuf),
    Chat(String),
    ToggleAudio,
    ToggleVideo,
    FlipCamera,
    End,
}

#[derive(Debug, Clone)]
pub enum PartyEvent {
    Session(SessionEvent),
    Playback { time: f64, playing: bool },
    SourceChanged(PlaybackSource),
    SourcePickerVisible(bool),
    /// Applied from the peer.
    Remote(SyncEvent),
    ChatSent(ChatEntry),
    AudioEnabled(bool),
    VideoEnabled(bool),
    CameraFlipped(FacingMode),
    Notice(String),
}

/// Sends commands into a running party and subscribes to its events.
/// Dropping every handle ends the party.
#[derive(Debug, Clone)]
pub struct PartyHandle {
    commands: mpsc::UnboundedSender<PartyCommand>,
    events: broadcast::Sender<PartyEvent>,
}

impl PartyHandle {
    pub fn send(&self, command: PartyCommand) -> bool {
        self.commands.send(command).is_ok()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PartyEvent> {
        self.events.subscribe()
    }
}

#[derive(Debug)]
pub struct PartyReport<P> {
    pub reason: EndReason,
    pub final_state: NegotiationState,
    pub chat: ChatLog,
    pub player: P,
}

pub struct WatchParty<P: Player> {
    contact: Contact,
    session: PeerSessionManager,
    sync: SyncProtocol,
    chat: ChatLog,
    player: P,
    show_source_picker: bool,
    commands: mpsc::UnboundedReceiver<PartyCommand>,
    events: broadcast::Sender<PartyEvent>,
    session_events: broadcast::Receiver<SessionEvent>,
}

impl<P: Player> WatchParty<P> {
    pub fn new(session: PeerSessionManager, contact: Contact, player: P) -> (Self, PartyHandle) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(PARTY_EVENT_CAPACITY);
        let session_events = session.subscribe_events();
        let handle = PartyHandle {
            commands: command_tx,
            events: events.clone(),
        };
        let party = Self {
            contact,
            session,
            sync: SyncProtocol::new(),
            chat: ChatLog::new(),
            player,
            show_source_picker: true,
            commands: command_rx,
            events,
            session_events,
        };
        (party, handle)
    }

    fn emit(&self, event: PartyEvent) {
        let _ = self.events.send(event);
    }

    fn forward_session_events(&mut self) {
        while let Ok(event) = self.session_events.try_recv() {
            let _ = self.events.send(PartyEvent::Session(event));
        }
    }

    /// Starts the session and runs until it ends.
    pub async fn run(mut self) -> Result<PartyReport<P>> {
        let started = self.session.start().await;
        self.forward_session_events();
        started?;

        let reason = loop {
            let ended = tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => {
                        debug!("all party handles dropped");
                        Some(self.session.terminate(EndReason::UserEnded).await)
                    }
                },
                input = self.session.next_input() => {
                    let step = self.session.handle_input(input).await;
                    self.apply_step(step)
                }
            };
            self.forward_session_events();
            if let Some(reason) = ended {
                break reason;
            }
        };

        info!(peer = %self.contact.id, %reason, chat_messages = self.chat.len(), "watch party finished");
        Ok(PartyReport {
            reason,
            final_state: self.session.state(),
            chat: self.chat,
            player: self.player,
        })
    }

    fn emit_playback(&self) {
        self.emit(PartyEvent::Playback {
            time: self.player.current_time(),
            playing: self.player.is_playing(),
        });
    }

    fn hide_source_picker(&mut self) {
        if self.show_source_picker {
            self.show_source_picker = false;
            self.emit(PartyEvent::SourcePickerVisible(false));
        }
    }

    async fn set_playing(&mut self, playing: bool) {
        let time = self.player.current_time();
        if playing {
            self.player.play();
            self.sync.play(time).await;
        } else {
            self.player.pause();
            self.sync.pause(time).await;
        }
        self.emit_playback();
    }

    async fn handle_command(&mut self, command: PartyCommand) -> Option<EndReason> {
        match command {
            PartyCommand::Play => self.set_playing(true).await,
            PartyCommand::Pause => self.set_playing(false).await,
            PartyCommand::TogglePlayback => {
                let playing = self.player.is_playing();
                self.set_playing(!playing).await;
            }
            PartyCommand::Seek(time) => {
                self.player.seek_to(time);
                self.sync.seek(self.player.current_time()).await;
                self.emit_playback();
            }
            PartyCommand::Skip(delta) => {
                let target = skip_target(
                    self.player.current_time(),
                    delta,
                    self.player.duration(),
                );
                self.player.seek_to(target);
                self.sync.seek(self.player.current_time()).await;
                self.emit_playback();
            }
            PartyCommand::ShareUrl(url) => {
                let url = url.trim();
                if url.is_empty() {
                    return None;
                }
                let source = PlaybackSource::RemoteUrl(url.to_string());
                self.player.set_source(source.clone());
                self.sync.share_url(url).await;
                self.emit(PartyEvent::SourceChanged(source));
                self.hide_source_picker();
            }
            PartyCommand::OpenLocalFile(path) => {
                let source = PlaybackSource::LocalFile(path);
                self.player.set_source(source.clone());
                self.emit(PartyEvent::SourceChanged(source));
                self.hide_source_picker();
            }
            PartyCommand::Chat(text) => {
                let text = text.trim();
                if text.is_empty() {
                    return None;
                }
                let entry = self.chat.push(ChatSender::Me, text).clone();
                self.sync.chat(text).await;
                self.emit(PartyEvent::ChatSent(entry));
            }
            PartyCommand::ToggleAudio => {
                if let Some(enabled) = self.session.toggle_audio() {
                    self.emit(PartyEvent::AudioEnabled(enabled));
                }
            }
            PartyCommand::ToggleVideo => {
                if let Some(enabled) = self.session.toggle_video() {
                    self.emit(PartyEvent::VideoEnabled(enabled));
                }
            }
            PartyCommand::FlipCamera => match self.session.flip_camera().await {
                Ok(facing) => self.emit(PartyEvent::CameraFlipped(facing)),
                Err(_) => self.emit(PartyEvent::Notice("could not switch camera".into())),
            },
            PartyCommand::End => {
                return Some(self.session.terminate(EndReason::UserEnded).await);
            }
        }
        None
    }

    fn apply_step(&mut self, step: SessionStep) -> Option<EndReason> {
        match step {
            SessionStep::Idle => {}
            SessionStep::ChannelOpen(channel) => self.sync.attach_channel(channel),
            SessionStep::ChannelMessage(text) => {
                let event = self.sync.handle_inbound(
                    &text,
                    &mut self.player,
                    &mut self.chat,
                    &self.contact.name,
                )?;
                if matches!(event, SyncEvent::SourceChanged { .. }) {
                    self.hide_source_picker();
                }
                self.emit(PartyEvent::Remote(event));
            }
            SessionStep::ChannelClosed => self.sync.detach(),
            SessionStep::Ended(reason) => {
                self.sync.detach();
                return Some(reason);
            }
        }
        None
    }
}

/// Position after skipping `delta` seconds, kept within `[0, duration]`.
pub fn skip_target(current: f64, delta: f64, duration: Option<f64>) -> f64 {
    let target = current + delta;
    let upper = duration.unwrap_or(f64::INFINITY);
    target.min(upper).max(0.0)
}
