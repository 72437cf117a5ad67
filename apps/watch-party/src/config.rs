use std::env;

use crate::media::FacingMode;

pub const DEFAULT_DATA_CHANNEL_LABEL: &str = "watchPartySync";
pub const DEFAULT_CALL_MODE: &str = "watchparty";
const DEFAULT_CANDIDATE_POOL_SIZE: u8 = 10;
const OPEN_RELAY_TURN_USER: &str = "openrelayproject";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceServer {
    pub urls: Vec<String>,
    pub username: Option<String>,
    pub credential: Option<String>,
}

impl IceServer {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }

    pub fn turn(url: impl Into<String>, username: impl Into<String>, credential: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: Some(username.into()),
            credential: Some(credential.into()),
        }
    }
}

fn default_ice_servers() -> Vec<IceServer> {
    vec![
        IceServer::stun("stun:stun.l.google.com:19302"),
        IceServer::stun("stun:stun1.l.google.com:19302"),
        IceServer::stun("stun:stun2.l.google.com:19302"),
        IceServer::turn(
            "turn:openrelay.metered.ca:80",
            OPEN_RELAY_TURN_USER,
            OPEN_RELAY_TURN_USER,
        ),
        IceServer::turn(
            "turn:openrelay.metered.ca:443",
            OPEN_RELAY_TURN_USER,
            OPEN_RELAY_TURN_USER,
        ),
    ]
}

/// Configuration for one watch-party session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// ICE servers handed to the peer connection
    pub ice_servers: Vec<IceServer>,
    pub ice_candidate_pool_size: u8,
    /// Label of the single data channel carrying sync and chat messages
    pub data_channel_label: String,
    /// Tag written on relay rows so other call types can share the relay
    pub call_mode: String,
    pub initial_facing: FacingMode,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ice_servers: default_ice_servers(),
            ice_candidate_pool_size: DEFAULT_CANDIDATE_POOL_SIZE,
            data_channel_label: DEFAULT_DATA_CHANNEL_LABEL.to_string(),
            call_mode: DEFAULT_CALL_MODE.to_string(),
            initial_facing: FacingMode::User,
        }
    }
}

impl SessionConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if env_flag("WATCH_PARTY_LOCALHOST_ONLY") {
            config.ice_servers.clear();
            return config;
        }

        if let Ok(urls) = env::var("WATCH_PARTY_STUN_URLS") {
            let stun: Vec<IceServer> = urls
                .split(',')
                .map(str::trim)
                .filter(|url| !url.is_empty())
                .map(IceServer::stun)
                .collect();
            if !stun.is_empty() {
                config.ice_servers.retain(|server| server.username.is_some());
                config.ice_servers.splice(0..0, stun);
            }
        }

        if let Ok(url) = env::var("WATCH_PARTY_TURN_URL") {
            let url = url.trim();
            if !url.is_empty() {
                let username = env::var("WATCH_PARTY_TURN_USERNAME").unwrap_or_default();
                let credential = env::var("WATCH_PARTY_TURN_CREDENTIAL").unwrap_or_default();
                config.ice_servers.retain(|server| server.username.is_none());
                config
                    .ice_servers
                    .push(IceServer::turn(url, username, credential));
            }
        }
        config
    }

    /// No STUN/TURN; host candidates only.
    pub fn localhost() -> Self {
        Self {
            ice_servers: Vec::new(),
            ..Default::default()
        }
    }
}

fn env_flag(name: &str) -> bool {
    env::var(name)
        .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

/// Builder for session configuration, layered over a base config
#[derive(Debug)]
pub struct SessionConfigBuilder {
    base: SessionConfig,
    ice_servers: Vec<IceServer>,
}

impl Default for SessionConfigBuilder {
    fn default() -> Self {
        Self::from_config(SessionConfig::default())
    }
}

impl SessionConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(base: SessionConfig) -> Self {
        Self {
            base,
            ice_servers: Vec::new(),
        }
    }

    /// Servers added here replace the base list.
    pub fn add_ice_server(mut self, server: IceServer) -> Self {
        self.ice_servers.push(server);
        self
    }

    pub fn ice_candidate_pool_size(mut self, size: u8) -> Self {
        self.base.ice_candidate_pool_size = size;
        self
    }

    pub fn data_channel_label(mut self, label: impl Into<String>) -> Self {
        self.base.data_channel_label = label.into();
        self
    }

    pub fn call_mode(mut self, mode: impl Into<String>) -> Self {
        self.base.call_mode = mode.into();
        self
    }

    pub fn initial_facing(mut self, facing: FacingMode) -> Self {
        self.base.initial_facing = facing;
        self
    }

    pub fn build(self) -> SessionConfig {
        let mut config = self.base;
        if !self.ice_servers.is_empty() {
            config.ice_servers = self.ice_servers;
        }
        config
    }
}
