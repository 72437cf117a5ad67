//! Append-only signalling log.

use std::sync::atomic::{AtomicU64, Ordering};

use signal_bus::RelayRow;
use thiserror::Error;
use tokio::sync::RwLock;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{0} must not be empty")]
    MissingField(&'static str),
    #[error("invalid signal_data: {0}")]
    InvalidSignal(String),
}

#[derive(Debug, Clone)]
pub struct StoredRow {
    pub id: u64,
    pub row: RelayRow,
}

/// Rows are never edited or removed once appended; ids grow monotonically.
#[derive(Debug, Default)]
pub struct RecordStore {
    rows: RwLock<Vec<StoredRow>>,
    next_id: AtomicU64,
}

impl RecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn append(&self, row: RelayRow) -> Result<StoredRow, StoreError> {
        if row.caller_id.trim().is_empty() {
            return Err(StoreError::MissingField("caller_id"));
        }
        if row.receiver_id.trim().is_empty() {
            return Err(StoreError::MissingField("receiver_id"));
        }
        row.clone()
            .into_record()
            .map_err(|err| StoreError::InvalidSignal(err.to_string()))?;

        let mut rows = self.rows.write().await;
        let stored = StoredRow {
            id: self.next_id.fetch_add(1, Ordering::SeqCst) + 1,
            row,
        };
        rows.push(stored.clone());
        Ok(stored)
    }

    pub async fn len(&self) -> usize {
        self.rows.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use signal_bus::{PeerId, SignalKind, SignalingRecord};

    fn end_row(from: &str, to: &str) -> RelayRow {
        RelayRow::from_record(
            &SignalingRecord::end(PeerId::new(from), PeerId::new(to)),
            Some("watchparty"),
        )
        .expect("row")
    }

    async fn rows_for(store: &RecordStore, receiver_id: &str) -> Vec<StoredRow> {
        store
            .rows
            .read()
            .await
            .iter()
            .filter(|stored| stored.row.receiver_id == receiver_id)
            .cloned()
            .collect()
    }

    #[tokio::test]
    async fn ids_are_monotonic_and_rows_filterable() {
        let store = RecordStore::new();
        let first = store.append(end_row("alice", "bob")).await.expect("append");
        let second = store.append(end_row("bob", "alice")).await.expect("append");
        assert!(second.id > first.id);
        assert_eq!(store.len().await, 2);

        let for_bob = rows_for(&store, "bob").await;
        assert_eq!(for_bob.len(), 1);
        assert_eq!(for_bob[0].row.kind, SignalKind::End);
    }

    #[tokio::test]
    async fn rejects_rows_that_cannot_be_decoded() {
        let store = RecordStore::new();
        let mut row = end_row("alice", "bob");
        row.receiver_id = "  ".into();
        assert!(matches!(
            store.append(row).await,
            Err(StoreError::MissingField("receiver_id"))
        ));

        let mut row = end_row("alice", "bob");
        row.kind = SignalKind::Answer;
        assert!(matches!(
            store.append(row).await,
            Err(StoreError::InvalidSignal(_))
        ));
        assert_eq!(store.len().await, 0);
    }
}
