use serde::{Deserialize, Serialize};

use crate::error::{Result, WatchPartyError};

/// One data channel message. Serialised as a JSON object with an `action`
/// tag: `play`, `pause`, `seek`, `url` or `chat`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum SyncMessage {
    Play {
        time: f64,
    },
    Pause {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        time: Option<f64>,
    },
    Seek {
        time: f64,
    },
    #[serde(rename = "url")]
    SetSource { url: String },
    Chat {
        #[serde(rename = "message")]
        text: String,
    },
}

impl SyncMessage {
    pub fn action(&self) -> &'static str {
        match self {
            SyncMessage::Play { .. } => "play",
            SyncMessage::Pause { .. } => "pause",
            SyncMessage::Seek { .. } => "seek",
            SyncMessage::SetSource { .. } => "url",
            SyncMessage::Chat { .. } => "chat",
        }
    }

    fn validate(&self) -> Result<()> {
        let check_time = |time: f64| {
            if time.is_finite() && time >= 0.0 {
                Ok(())
            } else {
                Err(WatchPartyError::MalformedSyncMessage(format!(
                    "{}: invalid time {time}",
                    self.action()
                )))
            }
        };
        match self {
            SyncMessage::Play { time } | SyncMessage::Seek { time } => check_time(*time),
            SyncMessage::Pause { time } => time.map_or(Ok(()), check_time),
            SyncMessage::SetSource { url } if url.trim().is_empty() => Err(
                WatchPartyError::MalformedSyncMessage("url: empty url".into()),
            ),
            SyncMessage::Chat { text } if text.is_empty() => Err(
                WatchPartyError::MalformedSyncMessage("chat: empty message".into()),
            ),
            _ => Ok(()),
        }
    }

    pub fn encode(&self) -> Result<String> {
        self.validate()?;
        serde_json::to_string(self)
            .map_err(|err| WatchPartyError::MalformedSyncMessage(err.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self> {
        let message: SyncMessage = serde_json::from_str(text)
            .map_err(|err| WatchPartyError::MalformedSyncMessage(err.to_string()))?;
        message.validate()?;
        Ok(message)
    }
}
