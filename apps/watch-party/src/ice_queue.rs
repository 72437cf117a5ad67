use std::collections::VecDeque;
use std::future::Future;

use signal_bus::IceCandidate;
use tracing::warn;

use crate::error::Result;

/// Candidates received before the remote description was applied.
///
/// Owned by a single negotiation session. `drain_into` consumes the queue, so
/// the buffered candidates can be applied at most once.
#[derive(Debug, Default)]
pub struct IceCandidateQueue {
    pending: VecDeque<IceCandidate>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DrainReport {
    pub applied: usize,
    pub failed: usize,
}

impl IceCandidateQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, candidate: IceCandidate) {
        self.pending.push_back(candidate);
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Applies every buffered candidate in arrival order. Failures are logged
    /// and skipped.
    pub async fn drain_into<F, Fut>(self, mut apply: F) -> DrainReport
    where
        F: FnMut(IceCandidate) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let mut report = DrainReport::default();
        for candidate in self.pending {
            let label = candidate.candidate.clone();
            match apply(candidate).await {
                Ok(()) => report.applied += 1,
                Err(err) => {
                    warn!(candidate = %label, error = %err, "skipping buffered ice candidate");
                    report.failed += 1;
                }
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::WatchPartyError;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[tokio::test]
    async fn drains_in_fifo_order() {
        let mut queue = IceCandidateQueue::new();
        for idx in 0..3 {
            queue.enqueue(IceCandidate::new(format!("candidate:{idx}")));
        }
        let applied = Arc::new(Mutex::new(Vec::new()));
        let sink = applied.clone();
        let report = queue
            .drain_into(|candidate| {
                let sink = sink.clone();
                async move {
                    sink.lock().push(candidate.candidate);
                    Ok(())
                }
            })
            .await;
        assert_eq!(report, DrainReport { applied: 3, failed: 0 });
        assert_eq!(
            *applied.lock(),
            vec!["candidate:0", "candidate:1", "candidate:2"]
        );
    }

    #[tokio::test]
    async fn failures_are_skipped() {
        let mut queue = IceCandidateQueue::new();
        queue.enqueue(IceCandidate::new("bad"));
        queue.enqueue(IceCandidate::new("good"));
        let report = queue
            .drain_into(|candidate| async move {
                if candidate.candidate == "bad" {
                    Err(WatchPartyError::IceApply("rejected".into()))
                } else {
                    Ok(())
                }
            })
            .await;
        assert_eq!(report, DrainReport { applied: 1, failed: 1 });
    }
}
