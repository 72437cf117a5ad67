use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::Response;
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use signal_bus::RelayRow;
use signal_bus::wire::{ClientMessage, ServerMessage};
use tokio::sync::{Notify, RwLock, mpsc};
use tracing::{debug, info, warn};

use crate::config::RelayConfig;
use crate::store::RecordStore;

type ConnectionId = u64;

struct Connection {
    last_heartbeat: Arc<RwLock<Instant>>,
    kicked: Arc<Notify>,
}

/// Shared relay state: the record log plus live subscriptions.
#[derive(Clone)]
pub struct RelayState {
    store: Arc<RecordStore>,
    /// receiver_id -> (connection -> outbound queue)
    subscribers: Arc<DashMap<String, DashMap<ConnectionId, mpsc::UnboundedSender<ServerMessage>>>>,
    connections: Arc<DashMap<ConnectionId, Connection>>,
    next_connection: Arc<AtomicU64>,
    config: RelayConfig,
}

impl RelayState {
    pub fn new(config: RelayConfig) -> Self {
        let state = Self {
            store: Arc::new(RecordStore::new()),
            subscribers: Arc::new(DashMap::new()),
            connections: Arc::new(DashMap::new()),
            next_connection: Arc::new(AtomicU64::new(1)),
            config,
        };

        let monitor_state = state.clone();
        tokio::spawn(async move {
            monitor_state.monitor_heartbeats().await;
        });

        state
    }

    pub fn store(&self) -> &RecordStore {
        &self.store
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn subscription_count(&self) -> usize {
        self.subscribers.iter().map(|entry| entry.value().len()).sum()
    }

    async fn monitor_heartbeats(&self) {
        let mut interval = tokio::time::interval(self.config.heartbeat_check_interval);
        loop {
            interval.tick().await;

            // Collect first so no DashMap guard is held across an await.
            let checks: Vec<_> = self
                .connections
                .iter()
                .map(|entry| {
                    (
                        *entry.key(),
                        entry.value().last_heartbeat.clone(),
                        entry.value().kicked.clone(),
                    )
                })
                .collect();

            for (id, heartbeat, kicked) in checks {
                let last = *heartbeat.read().await;
                if last.elapsed() > self.config.heartbeat_timeout {
                    info!(connection = id, "dropping relay connection (heartbeat timeout)");
                    self.remove_connection(id);
                    kicked.notify_one();
                }
            }
        }
    }

    fn subscribe(&self, receiver_id: &str, id: ConnectionId, tx: &mpsc::UnboundedSender<ServerMessage>) {
        self.subscribers
            .entry(receiver_id.to_string())
            .or_default()
            .insert(id, tx.clone());
    }

    fn unsubscribe(&self, receiver_id: &str, id: ConnectionId) {
        let mut now_empty = false;
        if let Some(entries) = self.subscribers.get(receiver_id) {
            entries.remove(&id);
            now_empty = entries.is_empty();
        }
        if now_empty {
            self.subscribers.remove_if(receiver_id, |_, entries| entries.is_empty());
        }
    }

    fn remove_connection(&self, id: ConnectionId) {
        self.connections.remove(&id);
        let receivers: Vec<String> = self
            .subscribers
            .iter()
            .filter(|entry| entry.value().contains_key(&id))
            .map(|entry| entry.key().clone())
            .collect();
        for receiver in receivers {
            self.unsubscribe(&receiver, id);
        }
    }

    fn fan_out(&self, id: u64, row: &RelayRow) -> usize {
        let targets: Vec<_> = self
            .subscribers
            .get(&row.receiver_id)
            .map(|entries| entries.iter().map(|entry| entry.value().clone()).collect())
            .unwrap_or_default();
        targets
            .into_iter()
            .filter(|tx| {
                tx.send(ServerMessage::Insert {
                    id,
                    record: row.clone(),
                })
                .is_ok()
            })
            .count()
    }

    async fn touch(&self, id: ConnectionId) {
        let heartbeat = self
            .connections
            .get(&id)
            .map(|entry| entry.value().last_heartbeat.clone());
        if let Some(heartbeat) = heartbeat {
            *heartbeat.write().await = Instant::now();
        }
    }
}

pub async fn websocket_handler(ws: WebSocketUpgrade, State(state): State<RelayState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: RelayState) {
    let id = state.next_connection.fetch_add(1, Ordering::SeqCst);
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();
    let kicked = Arc::new(Notify::new());
    state.connections.insert(
        id,
        Connection {
            last_heartbeat: Arc::new(RwLock::new(Instant::now())),
            kicked: kicked.clone(),
        },
    );

    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if let Ok(json) = serde_json::to_string(&message) {
                if sender.send(Message::Text(json)).await.is_err() {
                    break;
                }
            }
        }
        debug!(connection = id, "relay writer ended");
    });

    debug!(connection = id, "relay websocket connected");
    loop {
        let frame = tokio::select! {
            frame = receiver.next() => frame,
            _ = kicked.notified() => break,
        };
        let Some(frame) = frame else { break };
        let text = match frame {
            Ok(Message::Text(text)) => text,
            Ok(Message::Binary(data)) => match String::from_utf8(data) {
                Ok(text) => text,
                Err(_) => {
                    let _ = tx.send(ServerMessage::Error {
                        request_id: None,
                        message: "binary frame is not utf-8".into(),
                    });
                    continue;
                }
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(err) => {
                warn!(connection = id, error = %err, "relay websocket error");
                break;
            }
        };
        state.touch(id).await;

        match serde_json::from_str::<ClientMessage>(&text) {
            Ok(message) => handle_client_message(message, id, &state, &tx).await,
            Err(err) => {
                warn!(connection = id, error = %err, "invalid relay frame");
                let _ = tx.send(ServerMessage::Error {
                    request_id: None,
                    message: format!("invalid message format: {err}"),
                });
            }
        }
    }

    state.remove_connection(id);
    drop(tx);
    let _ = writer.await;
    debug!(connection = id, "relay websocket closed");
}

async fn handle_client_message(
    message: ClientMessage,
    id: ConnectionId,
    state: &RelayState,
    tx: &mpsc::UnboundedSender<ServerMessage>,
) {
    match message {
        ClientMessage::Subscribe { receiver_id } => {
            state.subscribe(&receiver_id, id, tx);
            debug!(connection = id, receiver = %receiver_id, "subscribed");
            let _ = tx.send(ServerMessage::Subscribed { receiver_id });
        }
        ClientMessage::Unsubscribe { receiver_id } => {
            state.unsubscribe(&receiver_id, id);
            debug!(connection = id, receiver = %receiver_id, "unsubscribed");
        }
        ClientMessage::Append { request_id, record } => match state.store.append(record).await {
            Ok(stored) => {
                let _ = tx.send(ServerMessage::Appended {
                    request_id,
                    id: stored.id,
                });
                let delivered = state.fan_out(stored.id, &stored.row);
                debug!(
                    connection = id,
                    record = stored.id,
                    kind = %stored.row.kind,
                    delivered,
                    "row appended"
                );
            }
            Err(err) => {
                warn!(connection = id, request_id, error = %err, "rejected row");
                let _ = tx.send(ServerMessage::Error {
                    request_id: Some(request_id),
                    message: err.to_string(),
                });
            }
        },
        ClientMessage::Ping => {
            let _ = tx.send(ServerMessage::Pong);
        }
    }
}
