use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use signal_bus::wire::{ClientMessage, ServerMessage};
use signal_bus::{
    PeerId, RelayError, RelayResult, RelayRow, SignalingRecord, SignalingTransport, Subscription,
};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{Error as WsError, Message, error::ProtocolError};
use url::Url;

use crate::config::DEFAULT_CALL_MODE;

#[derive(Debug, Clone)]
pub struct RelayClientConfig {
    pub url: String,
    /// How long `send` waits for the relay to confirm an append.
    pub ack_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub call_mode: Option<String>,
}

impl RelayClientConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ack_timeout: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(30),
            call_mode: Some(DEFAULT_CALL_MODE.to_string()),
        }
    }
}

type Ack = oneshot::Sender<RelayResult<u64>>;
type RecordSender = mpsc::UnboundedSender<SignalingRecord>;

#[derive(Default)]
struct Subscribers {
    by_receiver: HashMap<String, Vec<(u64, RecordSender)>>,
    confirmations: HashMap<String, Vec<oneshot::Sender<()>>>,
}

struct ClientShared {
    send_tx: mpsc::UnboundedSender<ClientMessage>,
    pending: Mutex<HashMap<u64, Ack>>,
    subscribers: Mutex<Subscribers>,
    next_request: AtomicU64,
    next_subscriber: AtomicU64,
    closed: AtomicBool,
    call_mode: Option<String>,
    ack_timeout: Duration,
}

impl ClientShared {
    fn remove_subscriber(&self, receiver: &str, id: u64) {
        let now_empty = {
            let mut guard = self.subscribers.lock();
            match guard.by_receiver.get_mut(receiver) {
                Some(entries) => {
                    entries.retain(|(entry_id, _)| *entry_id != id);
                    if entries.is_empty() {
                        guard.by_receiver.remove(receiver);
                        true
                    } else {
                        false
                    }
                }
                None => false,
            }
        };
        if now_empty {
            let _ = self.send_tx.send(ClientMessage::Unsubscribe {
                receiver_id: receiver.to_string(),
            });
        }
    }

    fn handle_server_message(&self, message: ServerMessage) {
        match message {
            ServerMessage::Appended { request_id, id } => {
                if let Some(ack) = self.pending.lock().remove(&request_id) {
                    let _ = ack.send(Ok(id));
                }
            }
            ServerMessage::Error {
                request_id: Some(request_id),
                message,
            } => {
                if let Some(ack) = self.pending.lock().remove(&request_id) {
                    let _ = ack.send(Err(RelayError::Rejected(message)));
                }
            }
            ServerMessage::Error {
                request_id: None,
                message,
            } => {
                tracing::warn!(target = "relay", %message, "relay reported an error");
            }
            ServerMessage::Subscribed { receiver_id } => {
                let waiters = self
                    .subscribers
                    .lock()
                    .confirmations
                    .remove(&receiver_id)
                    .unwrap_or_default();
                for waiter in waiters {
                    let _ = waiter.send(());
                }
            }
            ServerMessage::Insert { id, record } => {
                let receiver = record.receiver_id.clone();
                let record = match record.into_record() {
                    Ok(record) => record,
                    Err(err) => {
                        tracing::warn!(target = "relay", id, error = %err, "dropping malformed relay row");
                        return;
                    }
                };
                let mut guard = self.subscribers.lock();
                if let Some(entries) = guard.by_receiver.get_mut(&receiver) {
                    entries.retain(|(_, tx)| tx.send(record.clone()).is_ok());
                }
            }
            ServerMessage::Pong => {
                tracing::trace!(target = "relay", "pong");
            }
        }
    }

    fn shut_down(&self) {
        self.closed.store(true, Ordering::SeqCst);
        for (_, ack) in self.pending.lock().drain() {
            let _ = ack.send(Err(RelayError::Closed));
        }
        let mut guard = self.subscribers.lock();
        guard.by_receiver.clear();
        guard.confirmations.clear();
    }
}

/// Websocket client for the watch-party relay.
pub struct RelayClient {
    shared: Arc<ClientShared>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

fn websocket_url(raw: &str) -> RelayResult<Url> {
    let mut url = Url::parse(raw)
        .map_err(|err| RelayError::Unavailable(format!("invalid relay url {raw}: {err}")))?;
    let scheme = match url.scheme() {
        "ws" | "http" => "ws",
        "wss" | "https" => "wss",
        other => {
            return Err(RelayError::Unavailable(format!(
                "unsupported relay url scheme {other}"
            )));
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| RelayError::Unavailable("invalid websocket scheme".into()))?;
    if url.path().is_empty() || url.path() == "/" {
        url.set_path("/ws");
    }
    Ok(url)
}

impl RelayClient {
    pub async fn connect(config: RelayClientConfig) -> RelayResult<Self> {
        let url = websocket_url(&config.url)?;
        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|err| RelayError::Unavailable(format!("websocket connect failed: {err}")))?;
        tracing::debug!(target = "relay", %url, "relay websocket connected");
        let (mut ws_write, mut ws_read) = ws_stream.split();

        let (send_tx, mut send_rx) = mpsc::unbounded_channel::<ClientMessage>();
        let shared = Arc::new(ClientShared {
            send_tx,
            pending: Mutex::new(HashMap::new()),
            subscribers: Mutex::new(Subscribers::default()),
            next_request: AtomicU64::new(1),
            next_subscriber: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            call_mode: config.call_mode.clone(),
            ack_timeout: config.ack_timeout,
        });

        let writer = tokio::spawn(async move {
            while let Some(message) = send_rx.recv().await {
                match serde_json::to_string(&message) {
                    Ok(text) => {
                        if ws_write.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        tracing::warn!(target = "relay", error = %err, "failed to encode relay frame");
                    }
                }
            }
            let _ = ws_write.close().await;
        });

        let reader_shared = Arc::clone(&shared);
        let reader = tokio::spawn(async move {
            while let Some(frame) = ws_read.next().await {
                let text = match frame {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Binary(data)) => match String::from_utf8(data) {
                        Ok(text) => text,
                        Err(_) => continue,
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(err) => {
                        match &err {
                            WsError::ConnectionClosed
                            | WsError::AlreadyClosed
                            | WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
                                tracing::debug!(target = "relay", "relay websocket closed: {err}");
                            }
                            _ => {
                                tracing::warn!(target = "relay", "relay websocket error: {err}");
                            }
                        }
                        break;
                    }
                };
                match serde_json::from_str::<ServerMessage>(&text) {
                    Ok(message) => reader_shared.handle_server_message(message),
                    Err(err) => {
                        tracing::warn!(target = "relay", error = %err, "unrecognised relay frame");
                    }
                }
            }
            reader_shared.shut_down();
        });

        let heartbeat_shared = Arc::clone(&shared);
        let heartbeat_interval = config.heartbeat_interval;
        let heartbeat = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(heartbeat_interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if heartbeat_shared.send_tx.send(ClientMessage::Ping).is_err() {
                    break;
                }
            }
        });

        Ok(Self {
            shared,
            tasks: Mutex::new(vec![writer, reader, heartbeat]),
        })
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    fn enqueue(&self, message: ClientMessage) -> RelayResult<()> {
        if self.is_closed() {
            return Err(RelayError::Closed);
        }
        self.shared
            .send_tx
            .send(message)
            .map_err(|_| RelayError::Closed)
    }

    /// Appends a row and returns the id the relay assigned to it.
    pub async fn append(&self, row: RelayRow) -> RelayResult<u64> {
        let request_id = self.shared.next_request.fetch_add(1, Ordering::SeqCst);
        let (ack_tx, ack_rx) = oneshot::channel();
        self.shared.pending.lock().insert(request_id, ack_tx);
        if let Err(err) = self.enqueue(ClientMessage::Append {
            request_id,
            record: row,
        }) {
            self.shared.pending.lock().remove(&request_id);
            return Err(err);
        }
        match timeout(self.shared.ack_timeout, ack_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(RelayError::Closed),
            Err(_) => {
                self.shared.pending.lock().remove(&request_id);
                Err(RelayError::Unavailable(format!(
                    "no acknowledgement within {:?}",
                    self.shared.ack_timeout
                )))
            }
        }
    }
}

impl Drop for RelayClient {
    fn drop(&mut self) {
        for handle in self.tasks.lock().drain(..) {
            handle.abort();
        }
    }
}

#[async_trait]
impl SignalingTransport for RelayClient {
    async fn send(&self, record: SignalingRecord) -> RelayResult<()> {
        let row = RelayRow::from_record(&record, self.shared.call_mode.as_deref())?;
        let id = self.append(row).await?;
        tracing::trace!(target = "relay", id, kind = %record.kind, to = %record.to, "record appended");
        Ok(())
    }

    async fn subscribe(&self, peer: &PeerId) -> RelayResult<Subscription> {
        let receiver = peer.as_str().to_string();
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.shared.next_subscriber.fetch_add(1, Ordering::SeqCst);
        let (confirm_tx, confirm_rx) = oneshot::channel();
        {
            let mut guard = self.shared.subscribers.lock();
            guard
                .by_receiver
                .entry(receiver.clone())
                .or_default()
                .push((id, tx));
            guard
                .confirmations
                .entry(receiver.clone())
                .or_default()
                .push(confirm_tx);
        }

        let weak: Weak<ClientShared> = Arc::downgrade(&self.shared);
        let owner = receiver.clone();
        let subscription = Subscription::new(peer.clone(), rx, move || {
            if let Some(shared) = weak.upgrade() {
                shared.remove_subscriber(&owner, id);
            }
        });

        self.enqueue(ClientMessage::Subscribe {
            receiver_id: receiver,
        })?;
        match timeout(self.shared.ack_timeout, confirm_rx).await {
            Ok(Ok(())) => Ok(subscription),
            Ok(Err(_)) => Err(RelayError::Closed),
            Err(_) => Err(RelayError::Unavailable(
                "relay did not confirm subscription".into(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn websocket_url_defaults_path() {
        assert_eq!(
            websocket_url("http://127.0.0.1:8090").expect("url").as_str(),
            "ws://127.0.0.1:8090/ws"
        );
        assert_eq!(
            websocket_url("wss://relay.example/custom").expect("url").as_str(),
            "wss://relay.example/custom"
        );
        assert!(websocket_url("ftp://relay.example").is_err());
    }
}
