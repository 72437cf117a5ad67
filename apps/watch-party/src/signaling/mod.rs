//! Relay-backed signalling transport.

mod relay_client;

pub use relay_client::{RelayClient, RelayClientConfig};
