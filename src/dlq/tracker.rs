//! Rejection handling shared by all consumer workers.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{error, info, warn};

use crate::emit;
use crate::error::{MaxFailuresExceededSnafu, PipelineError};
use crate::metrics::events::{DeadLettersWritten, MessageRejected, MessagesAcked, MessagesNacked};
use crate::record::Rejection;
use crate::source::{AckId, MessageSource, RawMessage};

use super::queue::DeadLetterQueue;
use super::types::DeadLetter;

/// Routes rejected messages and enforces `max_failures`.
///
/// With a dead letter queue a rejected message is acknowledged only once its
/// record has been written, and released for redelivery if the write fails.
/// Without one it is logged and acknowledged straight away.
pub struct FailureTracker {
    source: Arc<dyn MessageSource>,
    dlq: Option<Arc<DeadLetterQueue>>,
    max_failures: usize,
    count: AtomicUsize,
}

impl FailureTracker {
    /// `max_failures` of 0 means unlimited.
    pub fn new(
        source: Arc<dyn MessageSource>,
        dlq: Option<Arc<DeadLetterQueue>>,
        max_failures: usize,
    ) -> Self {
        Self {
            source,
            dlq,
            max_failures,
            count: AtomicUsize::new(0),
        }
    }

    /// Record a rejected message.
    ///
    /// Returns `Err` once the rejection count reaches `max_failures`; the
    /// rejection itself is still routed before the error is returned.
    pub async fn reject(
        &self,
        message: &RawMessage,
        rejection: Rejection,
    ) -> Result<(), PipelineError> {
        warn!(
            message_id = %rejection.message_id,
            reason = %rejection.reason,
            payload = %rejection.payload,
            "Rejected message"
        );
        emit!(MessageRejected {
            reason: rejection.reason.kind(),
        });

        match &self.dlq {
            Some(dlq) => {
                let letter = DeadLetter::new(message, &rejection);
                if dlq.record(letter, message.ack_id.clone()).await {
                    self.flush().await;
                }
            }
            None => self.ack(std::slice::from_ref(&message.ack_id)).await,
        }

        let count = self.count.fetch_add(1, Ordering::SeqCst) + 1;
        if self.max_failures > 0 && count >= self.max_failures {
            error!("Max failures ({}) reached, stopping pipeline", count);
            self.flush().await;
            return MaxFailuresExceededSnafu { count }.fail();
        }
        Ok(())
    }

    /// Write buffered dead letters and settle their messages.
    pub async fn flush(&self) {
        let Some(dlq) = &self.dlq else {
            return;
        };
        match dlq.flush().await {
            Ok(ack_ids) if ack_ids.is_empty() => {}
            Ok(ack_ids) => {
                emit!(DeadLettersWritten {
                    count: ack_ids.len() as u64,
                });
                self.ack(&ack_ids).await;
            }
            Err(unwritten) => {
                error!(
                    "Failed to write {} dead letters, releasing them for redelivery: {}",
                    unwritten.ack_ids.len(),
                    unwritten.error
                );
                match self.source.nack(&unwritten.ack_ids).await {
                    Ok(()) => emit!(MessagesNacked {
                        count: unwritten.ack_ids.len() as u64,
                    }),
                    Err(e) => warn!("Failed to nack rejected messages: {}", e),
                }
            }
        }
    }

    async fn ack(&self, ack_ids: &[AckId]) {
        match self.source.ack(ack_ids).await {
            Ok(()) => emit!(MessagesAcked {
                count: ack_ids.len() as u64,
            }),
            // Unacked rejections are redelivered and rejected again.
            Err(e) => warn!("Failed to ack {} rejected messages: {}", ack_ids.len(), e),
        }
    }

    /// Flush remaining dead letters and log a summary.
    pub async fn finalize(&self) {
        self.flush().await;
        if let Some(dlq) = &self.dlq {
            let stats = dlq.stats().await;
            info!(
                "DLQ finalized: {} rejected messages ({})",
                stats.total(),
                stats.summary()
            );
        }
    }

    /// Number of rejected messages so far.
    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::parse_message;
    use crate::source::MemorySource;
    use crate::storage::StorageProvider;
    use std::collections::HashMap;
    use std::time::Duration;
    use tempfile::TempDir;

    async fn pull_rejected(source: &MemorySource, payload: &str) -> (RawMessage, Rejection) {
        source.publish(payload);
        let message = source.pull(1).await.unwrap().remove(0);
        let rejection = parse_message(&message).unwrap_err();
        (message, rejection)
    }

    #[tokio::test]
    async fn test_without_dlq_rejections_are_acked() {
        let source = Arc::new(MemorySource::new(Duration::from_secs(30)));
        let tracker = FailureTracker::new(source.clone(), None, 0);

        let (message, rejection) = pull_rejected(&source, "garbage").await;
        tracker.reject(&message, rejection).await.unwrap();

        assert_eq!(source.outstanding(), 0);
        assert_eq!(tracker.count(), 1);
    }

    #[tokio::test]
    async fn test_with_dlq_ack_waits_for_write() {
        let temp_dir = TempDir::new().unwrap();
        let storage = StorageProvider::for_url_with_options(
            temp_dir.path().to_str().unwrap(),
            HashMap::new(),
        )
        .await
        .unwrap();
        let dlq = Arc::new(DeadLetterQueue::new(Arc::new(storage)));
        let source = Arc::new(MemorySource::new(Duration::from_secs(30)));
        let tracker = FailureTracker::new(source.clone(), Some(dlq), 0);

        let (message, rejection) = pull_rejected(&source, "{}").await;
        tracker.reject(&message, rejection).await.unwrap();
        assert_eq!(source.in_flight(), 1);

        tracker.flush().await;
        assert_eq!(source.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_max_failures_stops() {
        let source = Arc::new(MemorySource::new(Duration::from_secs(30)));
        let tracker = FailureTracker::new(source.clone(), None, 2);

        let (m1, r1) = pull_rejected(&source, "x").await;
        tracker.reject(&m1, r1).await.unwrap();
        let (m2, r2) = pull_rejected(&source, "y").await;
        let err = tracker.reject(&m2, r2).await.unwrap_err();
        assert!(matches!(err, PipelineError::MaxFailuresExceeded { count: 2 }));
        // The rejection that hit the limit is still settled.
        assert_eq!(source.outstanding(), 0);
    }
}
