//! Playback and chat synchronisation over the session's data channel.
//!
//! Fire-and-forget: nothing is acknowledged, retried or queued. A message
//! sent while the channel is not open is dropped.

use std::sync::Arc;

use tracing::{debug, trace, warn};

use crate::chat::{ChatLog, ChatSender};
use crate::peer::DataChannel;
use crate::playback::{PlaybackSource, Player};

mod message;

pub use message::SyncMessage;

/// What an inbound message did locally, for the UI to react to.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    Played { time: f64 },
    Paused,
    Seeked { time: f64 },
    SourceChanged { url: String },
    ChatReceived { text: String },
}

#[derive(Debug, Default)]
pub struct SyncProtocol {
    channel: Option<Arc<dyn DataChannel>>,
}

impl SyncProtocol {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach_channel(&mut self, channel: Arc<dyn DataChannel>) {
        debug!(label = channel.label(), "sync channel attached");
        self.channel = Some(channel);
    }

    pub fn detach(&mut self) {
        self.channel = None;
    }

    pub fn is_open(&self) -> bool {
        self.channel.as_ref().is_some_and(|c| c.is_open())
    }

    /// Returns whether the message was handed to the channel.
    pub async fn send(&self, message: SyncMessage) -> bool {
        let Some(channel) = self.channel.as_ref().filter(|c| c.is_open()) else {
            trace!(action = message.action(), "channel not open; dropping sync message");
            return false;
        };
        let text = match message.encode() {
            Ok(text) => text,
            Err(err) => {
                warn!(action = message.action(), error = %err, "refusing to send sync message");
                return false;
            }
        };
        match channel.send_text(text).await {
            Ok(()) => true,
            Err(err) => {
                warn!(action = message.action(), error = %err, "failed to send sync message");
                false
            }
        }
    }

    pub async fn play(&self, time: f64) -> bool {
        self.send(SyncMessage::Play { time }).await
    }

    pub async fn pause(&self, time: f64) -> bool {
        self.send(SyncMessage::Pause { time: Some(time) }).await
    }

    pub async fn seek(&self, time: f64) -> bool {
        self.send(SyncMessage::Seek { time }).await
    }

    pub async fn share_url(&self, url: &str) -> bool {
        self.send(SyncMessage::SetSource {
            url: url.to_string(),
        })
        .await
    }

    pub async fn chat(&self, text: &str) -> bool {
        self.send(SyncMessage::Chat {
            text: text.to_string(),
        })
        .await
    }

    /// Applies one inbound frame to the local player and chat log.
    /// Malformed frames are logged and dropped.
    pub fn handle_inbound<P: Player + ?Sized>(
        &self,
        text: &str,
        player: &mut P,
        chat: &mut ChatLog,
        peer_name: &str,
    ) -> Option<SyncEvent> {
        let message = match SyncMessage::decode(text) {
            Ok(message) => message,
            Err(err) => {
                warn!(error = %err, frame_len = text.len(), "dropping malformed sync message");
                return None;
            }
        };
        debug!(action = message.action(), "inbound sync message");
        let event = match message {
            SyncMessage::Play { time } => {
                player.seek_to(time);
                player.play();
                SyncEvent::Played { time }
            }
            SyncMessage::Pause { .. } => {
                player.pause();
                SyncEvent::Paused
            }
            SyncMessage::Seek { time } => {
                player.seek_to(time);
                SyncEvent::Seeked { time }
            }
            SyncMessage::SetSource { url } => {
                player.set_source(PlaybackSource::RemoteUrl(url.clone()));
                SyncEvent::SourceChanged { url }
            }
            SyncMessage::Chat { text } => {
                chat.push(ChatSender::Peer(peer_name.to_string()), text.clone());
                SyncEvent::ChatReceived { text }
            }
        };
        Some(event)
    }
}
