use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::debug;

use crate::{
    PeerId, RelayError, RelayResult, SignalKind, SignalingRecord, SignalingTransport, Subscription,
};

/// In-memory relay for tests and single-process setups.
///
/// Keeps an append-only log of every accepted record and pushes each one to
/// the live subscriptions of its receiver.
#[derive(Debug, Clone, Default)]
pub struct LocalRelay {
    inner: Arc<RelayInner>,
}

#[derive(Debug, Default)]
struct RelayInner {
    log: RwLock<Vec<SignalingRecord>>,
    subscribers: RwLock<HashMap<PeerId, Vec<(u64, mpsc::UnboundedSender<SignalingRecord>)>>>,
    next_subscriber: AtomicU64,
    unavailable: AtomicBool,
    send_attempts: AtomicU64,
}

impl RelayInner {
    fn remove_subscriber(&self, peer: &PeerId, id: u64) {
        let mut guard = self.subscribers.write();
        if let Some(entries) = guard.get_mut(peer) {
            entries.retain(|(entry_id, _)| *entry_id != id);
            if entries.is_empty() {
                guard.remove(peer);
            }
        }
    }
}

impl LocalRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// While unavailable every `send` fails and nothing is stored.
    pub fn set_available(&self, available: bool) {
        self.inner.unavailable.store(!available, Ordering::SeqCst);
    }

    pub fn records(&self) -> Vec<SignalingRecord> {
        self.inner.log.read().clone()
    }

    pub fn records_of_kind(&self, kind: SignalKind) -> Vec<SignalingRecord> {
        self.inner
            .log
            .read()
            .iter()
            .filter(|record| record.kind == kind)
            .cloned()
            .collect()
    }

    /// Number of `send` calls, including rejected ones.
    pub fn send_attempts(&self) -> u64 {
        self.inner.send_attempts.load(Ordering::SeqCst)
    }

    pub fn subscriber_count(&self, peer: &PeerId) -> usize {
        self.inner
            .subscribers
            .read()
            .get(peer)
            .map(|entries| entries.iter().filter(|(_, tx)| !tx.is_closed()).count())
            .unwrap_or(0)
    }
}

#[async_trait]
impl SignalingTransport for LocalRelay {
    async fn send(&self, record: SignalingRecord) -> RelayResult<()> {
        self.inner.send_attempts.fetch_add(1, Ordering::SeqCst);
        if self.inner.unavailable.load(Ordering::SeqCst) {
            debug!(from = %record.from, to = %record.to, kind = ?record.kind, "local relay offline; record rejected");
            return Err(RelayError::Unavailable("local relay offline".into()));
        }
        self.inner.log.write().push(record.clone());
        let targets: Vec<_> = self
            .inner
            .subscribers
            .read()
            .get(&record.to)
            .map(|entries| entries.iter().map(|(_, tx)| tx.clone()).collect())
            .unwrap_or_default();
        for tx in targets {
            if tx.send(record.clone()).is_err() {
                debug!(to = %record.to, kind = ?record.kind, "dropping record for closed subscriber");
            }
        }
        Ok(())
    }

    async fn subscribe(&self, peer: &PeerId) -> RelayResult<Subscription> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.inner.next_subscriber.fetch_add(1, Ordering::SeqCst);
        self.inner
            .subscribers
            .write()
            .entry(peer.clone())
            .or_default()
            .push((id, tx));
        let weak: Weak<RelayInner> = Arc::downgrade(&self.inner);
        let owner = peer.clone();
        Ok(Subscription::new(peer.clone(), rx, move || {
            if let Some(inner) = weak.upgrade() {
                inner.remove_subscriber(&owner, id);
            }
        }))
    }
}
