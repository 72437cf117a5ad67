use signal_bus::RelayError;
use thiserror::Error;

use crate::negotiation::NegotiationState;

#[derive(Debug, Error)]
pub enum WatchPartyError {
    #[error("media acquisition failed: {0}")]
    MediaAcquisition(String),
    #[error("signaling transport error: {0}")]
    SignalingTransport(#[from] RelayError),
    #[error("failed to apply ice candidate: {0}")]
    IceApply(String),
    #[error("malformed sync message: {0}")]
    MalformedSyncMessage(String),
    #[error("connectivity lost: {0}")]
    ConnectivityLost(String),
    #[error("peer connection error: {0}")]
    PeerConnection(String),
    #[error("invalid negotiation transition from {from:?} to {to:?}")]
    InvalidTransition {
        from: NegotiationState,
        to: NegotiationState,
    },
    #[error("data channel closed")]
    ChannelClosed,
}

impl WatchPartyError {
    /// Fatal errors end the session; the rest are logged and skipped.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            WatchPartyError::IceApply(_)
                | WatchPartyError::MalformedSyncMessage(_)
                | WatchPartyError::ChannelClosed
        )
    }
}

pub(crate) fn to_peer_error<E: std::fmt::Display>(err: E) -> WatchPartyError {
    WatchPartyError::PeerConnection(err.to_string())
}

pub type Result<T, E = WatchPartyError> = std::result::Result<T, E>;
