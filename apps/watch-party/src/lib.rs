//! Two-person watch party over WebRTC: a video call with a data channel
//! that keeps playback and chat in sync.

pub mod chat;
pub mod config;
pub mod error;
pub mod ice_queue;
pub mod media;
pub mod negotiation;
pub mod party;
pub mod peer;
pub mod playback;
pub mod session;
pub mod signaling;
pub mod sync;

pub use config::{IceServer, SessionConfig, SessionConfigBuilder};
pub use error::{Result, WatchPartyError};
pub use negotiation::{NegotiationSession, NegotiationState};
pub use party::{Contact, PartyCommand, PartyEvent, PartyHandle, PartyReport, WatchParty};
pub use session::{EndReason, PeerSessionManager, SessionEvent};
pub use signal_bus::{PeerId, SignalingRecord, SignalingTransport};
pub use sync::{SyncEvent, SyncMessage, SyncProtocol};
