//! Consumer workers.
//!
//! Each worker pulls from the subscription, parses and maps every message,
//! forwards valid rows to the loader and routes rejections to the
//! [`FailureTracker`]. Workers never acknowledge valid rows themselves.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::dlq::FailureTracker;
use crate::emit;
use crate::error::PipelineError;
use crate::loader::PendingRow;
use crate::mapper::map_record;
use crate::metrics::events::{MessagesNacked, MessagesReceived, PullFailed};
use crate::record::parse_message;
use crate::source::{AckId, MessageSource, RawMessage};

/// Per-worker totals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub messages_received: usize,
    pub rows_forwarded: usize,
    pub messages_rejected: usize,
}

impl std::ops::AddAssign for WorkerStats {
    fn add_assign(&mut self, other: Self) {
        self.messages_received += other.messages_received;
        self.rows_forwarded += other.rows_forwarded;
        self.messages_rejected += other.messages_rejected;
    }
}

pub(super) struct ConsumerWorker {
    pub id: usize,
    pub source: Arc<dyn MessageSource>,
    pub tracker: Arc<FailureTracker>,
    pub rows: mpsc::Sender<PendingRow>,
    pub max_messages: usize,
    pub pull_backoff: Duration,
    pub shutdown: CancellationToken,
}

impl ConsumerWorker {
    pub async fn run(self) -> Result<WorkerStats, PipelineError> {
        let mut stats = WorkerStats::default();
        debug!(worker = self.id, "Worker started");

        loop {
            let pulled = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                pulled = self.source.pull(self.max_messages) => pulled,
            };

            let messages = match pulled {
                Ok(messages) => messages,
                Err(e) => {
                    warn!(worker = self.id, "Pull failed: {}", e);
                    emit!(PullFailed);
                    if self.pause().await {
                        break;
                    }
                    continue;
                }
            };
            if messages.is_empty() {
                if self.pause().await {
                    break;
                }
                continue;
            }

            emit!(MessagesReceived {
                count: messages.len() as u64,
            });
            stats.messages_received += messages.len();

            let result = self.process(messages, &mut stats).await;
            self.tracker.flush().await;
            match result {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => {
                    self.shutdown.cancel();
                    return Err(e);
                }
            }
        }

        debug!(worker = self.id, ?stats, "Worker stopped");
        Ok(stats)
    }

    /// Handle one pulled batch. Returns false once the loader is gone.
    async fn process(
        &self,
        messages: Vec<RawMessage>,
        stats: &mut WorkerStats,
    ) -> Result<bool, PipelineError> {
        let mut remaining = messages.into_iter();
        while let Some(message) = remaining.next() {
            match parse_message(&message) {
                Ok(record) => {
                    let pending = PendingRow {
                        row: map_record(&record),
                        ack_id: message.ack_id.clone(),
                    };
                    if self.rows.send(pending).await.is_err() {
                        let unsent: Vec<AckId> = std::iter::once(message.ack_id)
                            .chain(remaining.by_ref().map(|m| m.ack_id))
                            .collect();
                        self.release(&unsent).await;
                        return Ok(false);
                    }
                    stats.rows_forwarded += 1;
                }
                Err(rejection) => {
                    stats.messages_rejected += 1;
                    if let Err(e) = self.tracker.reject(&message, rejection).await {
                        let unsent: Vec<AckId> =
                            remaining.by_ref().map(|m| m.ack_id).collect();
                        self.release(&unsent).await;
                        return Err(e);
                    }
                }
            }
        }
        Ok(true)
    }

    /// Hand messages back for prompt redelivery.
    async fn release(&self, ack_ids: &[AckId]) {
        if ack_ids.is_empty() {
            return;
        }
        match self.source.nack(ack_ids).await {
            Ok(()) => emit!(MessagesNacked {
                count: ack_ids.len() as u64,
            }),
            Err(e) => warn!(
                worker = self.id,
                "Failed to nack {} messages: {}",
                ack_ids.len(),
                e
            ),
        }
    }

    /// Sleep for the pull backoff. Returns true if shutdown was requested.
    async fn pause(&self) -> bool {
        tokio::select! {
            _ = self.shutdown.cancelled() => true,
            _ = tokio::time::sleep(self.pull_backoff) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::MemorySource;

    fn worker(
        source: Arc<MemorySource>,
        max_failures: usize,
        capacity: usize,
    ) -> (ConsumerWorker, mpsc::Receiver<PendingRow>) {
        let (tx, rx) = mpsc::channel(capacity);
        let tracker = Arc::new(FailureTracker::new(source.clone(), None, max_failures));
        let worker = ConsumerWorker {
            id: 0,
            source,
            tracker,
            rows: tx,
            max_messages: 10,
            pull_backoff: Duration::from_millis(100),
            shutdown: CancellationToken::new(),
        };
        (worker, rx)
    }

    #[tokio::test(start_paused = true)]
    async fn test_forwards_valid_rows_and_drops_rejections() {
        let source = Arc::new(MemorySource::new(Duration::from_secs(60)));
        source.publish(r#"{"id":"a1","name":"Alice","age":30,"price":9.99}"#);
        source.publish(r#"{"id":"b2","name":"Bob","age":"x","price":1.0}"#);

        let (worker, mut rx) = worker(source.clone(), 0, 10);
        let shutdown = worker.shutdown.clone();
        let handle = tokio::spawn(worker.run());

        let pending = rx.recv().await.unwrap();
        assert_eq!(pending.row.values()[0].to_string(), "a1");

        shutdown.cancel();
        let stats = handle.await.unwrap().unwrap();
        assert_eq!(stats.messages_received, 2);
        assert_eq!(stats.rows_forwarded, 1);
        assert_eq!(stats.messages_rejected, 1);

        // Without a DLQ the rejection is acknowledged, the valid row is not.
        assert_eq!(source.acked(), vec!["2".to_string()]);
        assert_eq!(source.in_flight(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_failures_stops_worker() {
        let source = Arc::new(MemorySource::new(Duration::from_secs(60)));
        source.publish("not json");
        source.publish("[]");
        source.publish(r#"{"id":"c3","name":"Cy","age":1,"price":2.0}"#);

        let (worker, _rx) = worker(source.clone(), 2, 10);
        let shutdown = worker.shutdown.clone();
        let err = worker.run().await.unwrap_err();

        assert!(matches!(err, PipelineError::MaxFailuresExceeded { count: 2 }));
        assert!(shutdown.is_cancelled());
        // The unprocessed message was released for redelivery.
        assert_eq!(source.in_flight(), 0);
        assert_eq!(source.outstanding(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stops_when_loader_is_gone() {
        let source = Arc::new(MemorySource::new(Duration::from_secs(60)));
        for i in 0..3 {
            source.publish(format!(r#"{{"id":"{i}","name":"n","age":1,"price":1.0}}"#));
        }

        let (worker, rx) = worker(source.clone(), 0, 10);
        drop(rx);
        let stats = worker.run().await.unwrap();

        assert_eq!(stats.rows_forwarded, 0);
        assert_eq!(source.in_flight(), 0);
        assert_eq!(source.outstanding(), 3);
        assert!(source.acked().is_empty());
    }
}
