//! Signaling records and the relay contract used to bootstrap a watch-party
//! peer connection.

use std::fmt;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

mod local;
mod record;
pub mod wire;

pub use local::LocalRelay;
pub use record::{
    IceCandidate, PeerId, RelayRow, SdpType, SessionDescription, SignalKind, SignalPayload,
    SignalingRecord,
};

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("signaling relay unavailable: {0}")]
    Unavailable(String),
    #[error("signaling relay connection closed")]
    Closed,
    #[error("signaling relay rejected request: {0}")]
    Rejected(String),
    #[error("malformed signaling record: {0}")]
    Malformed(String),
    #[error("failed to encode signaling record: {0}")]
    Encode(#[from] serde_json::Error),
}

pub type RelayResult<T> = Result<T, RelayError>;

/// Thin contract over an external message relay.
///
/// `send` appends one record; `subscribe` delivers every record addressed to
/// `peer` exactly once, in relay order (which is not necessarily send order).
#[async_trait]
pub trait SignalingTransport: Send + Sync {
    async fn send(&self, record: SignalingRecord) -> RelayResult<()>;
    async fn subscribe(&self, peer: &PeerId) -> RelayResult<Subscription>;
}

/// Live delivery of records addressed to one peer. Dropping it unsubscribes.
pub struct Subscription {
    peer: PeerId,
    records: mpsc::UnboundedReceiver<SignalingRecord>,
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub fn new(
        peer: PeerId,
        records: mpsc::UnboundedReceiver<SignalingRecord>,
        cancel: impl FnOnce() + Send + Sync + 'static,
    ) -> Self {
        Self {
            peer,
            records,
            cancel: Some(Box::new(cancel)),
        }
    }

    pub fn peer(&self) -> &PeerId {
        &self.peer
    }

    /// Next record, or `None` once the relay side has gone away.
    pub async fn recv(&mut self) -> Option<SignalingRecord> {
        self.records.recv().await
    }

    pub fn try_recv(&mut self) -> Option<SignalingRecord> {
        self.records.try_recv().ok()
    }

    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("peer", &self.peer)
            .field("active", &self.cancel.is_some())
            .finish()
    }
}
