//! Websocket protocol spoken between relay clients and the relay server.

use serde::{Deserialize, Serialize};

use crate::RelayRow;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Start receiving pushes for rows whose `receiver_id` matches.
    Subscribe { receiver_id: String },
    Unsubscribe { receiver_id: String },
    Append { request_id: u64, record: RelayRow },
    Ping,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Subscribed {
        receiver_id: String,
    },
    Appended {
        request_id: u64,
        id: u64,
    },
    /// Push notification for a row appended for a subscribed receiver.
    Insert {
        id: u64,
        record: RelayRow,
    },
    Pong,
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<u64>,
        message: String,
    },
}
