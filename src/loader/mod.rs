//! Warehouse loader.
//!
//! A single task owns the [`BatchBuffer`]. Rows arrive over a channel from
//! the consumer workers; a batch is flushed when it reaches `max_rows` or
//! when its oldest row reaches `max_latency`, whichever comes first.
//!
//! Flushing a batch:
//! 1. encode the rows once into a staged file,
//! 2. upload it (retried),
//! 3. load it through the configured [`LoadStrategy`] (retried),
//! 4. acknowledge the messages behind the rows.
//!
//! Messages are only acknowledged after the warehouse confirmed the load. If
//! retries run out the loader stops with an error, the staged file stays in
//! place and the unacknowledged messages are redelivered later.

pub mod buffer;
pub mod codec;
pub mod retry;
pub mod staging;
pub mod strategy;

pub use buffer::{Batch, BatchBuffer, FlushPolicy, PendingRow};
pub use retry::{Exhausted, RetryPolicy, retry_with_backoff};
pub use staging::{StagedFile, StagingArea};
pub use strategy::{BulkLoad, ContinuousLoad, LoadStrategy};

use snafu::prelude::*;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::emit;
use crate::error::{EncodeBatchSnafu, LoaderError, WarehouseError};
use crate::metrics::events::{
    BatchCommitted, FlushTrigger, LoadCompleted, MessagesAcked, RetryStage, RowsBuffered,
};
use crate::source::MessageSource;
use crate::warehouse::{TableStatus, TargetTable, Warehouse};

/// Totals reported when the loader stops.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoaderStats {
    pub batches_committed: usize,
    pub rows_loaded: u64,
    pub messages_acked: usize,
    /// Files the warehouse reported as already loaded.
    pub files_skipped: usize,
}

pub struct WarehouseLoader {
    table: TargetTable,
    warehouse: Arc<dyn Warehouse>,
    staging: StagingArea,
    strategy: Arc<dyn LoadStrategy>,
    source: Arc<dyn MessageSource>,
    retry: RetryPolicy,
    policy: FlushPolicy,
    sequence: u64,
    stats: LoaderStats,
}

impl WarehouseLoader {
    pub fn new(
        table: TargetTable,
        warehouse: Arc<dyn Warehouse>,
        staging: StagingArea,
        strategy: Arc<dyn LoadStrategy>,
        source: Arc<dyn MessageSource>,
        retry: RetryPolicy,
        policy: FlushPolicy,
    ) -> Self {
        Self {
            table,
            warehouse,
            staging,
            strategy,
            source,
            retry,
            policy,
            sequence: 0,
            stats: LoaderStats::default(),
        }
    }

    /// Create or verify the target table. Transient failures are retried;
    /// schema drift and disposition violations fail immediately.
    pub async fn prepare_table(&self) -> Result<TableStatus, LoaderError> {
        let status = retry_with_backoff(
            &self.retry,
            RetryStage::PrepareTable,
            WarehouseError::is_retryable,
            || self.warehouse.ensure_table(&self.table),
        )
        .await
        .map_err(|exhausted| LoaderError::PrepareTable {
            table: self.table.qualified_name(),
            source: exhausted.error,
        })?;

        info!(
            table = %self.table.qualified_name(),
            status = ?status,
            "Target table ready"
        );
        Ok(status)
    }

    /// Consume rows until the channel closes, then flush what is left.
    pub async fn run(
        mut self,
        mut rows: mpsc::Receiver<PendingRow>,
    ) -> Result<LoaderStats, LoaderError> {
        let mut buffer = BatchBuffer::new(self.policy);
        info!(
            strategy = self.strategy.name(),
            max_rows = self.policy.max_rows,
            max_latency_ms = self.policy.max_latency.as_millis() as u64,
            "Loader started"
        );

        loop {
            let deadline = buffer.deadline();
            tokio::select! {
                biased;

                received = rows.recv() => {
                    let Some(pending) = received else {
                        break;
                    };
                    let full = buffer.push(pending);
                    emit!(RowsBuffered { count: buffer.len() });
                    if full {
                        self.flush(&mut buffer, FlushTrigger::Size).await?;
                    } else if buffer.is_expired(Instant::now()) {
                        self.flush(&mut buffer, FlushTrigger::Latency).await?;
                    }
                }

                _ = expiry(deadline) => {
                    self.flush(&mut buffer, FlushTrigger::Latency).await?;
                }
            }
        }

        self.flush(&mut buffer, FlushTrigger::Shutdown).await?;
        info!(
            batches = self.stats.batches_committed,
            rows = self.stats.rows_loaded,
            "Loader stopped"
        );
        Ok(self.stats)
    }

    async fn flush(
        &mut self,
        buffer: &mut BatchBuffer,
        trigger: FlushTrigger,
    ) -> Result<(), LoaderError> {
        let Some(batch) = buffer.take() else {
            return Ok(());
        };
        emit!(RowsBuffered { count: 0 });

        self.sequence += 1;
        let sequence = self.sequence;
        let file = self
            .staging
            .prepare(sequence, &batch.rows)
            .context(EncodeBatchSnafu)?;
        debug!(
            sequence,
            file = %file.path,
            rows = file.rows,
            trigger = trigger.as_str(),
            "Flushing batch"
        );

        let staging = &self.staging;
        retry_with_backoff(&self.retry, RetryStage::Staging, |_| true, || {
            staging.upload(&file)
        })
        .await
        .map_err(|exhausted| LoaderError::StagingRetriesExhausted {
            sequence,
            attempts: exhausted.attempts,
            source: exhausted.error,
        })?;

        let start = std::time::Instant::now();
        let strategy = &self.strategy;
        let table = &self.table;
        let outcome = retry_with_backoff(
            &self.retry,
            RetryStage::Load,
            WarehouseError::is_retryable,
            || strategy.load(table, &file),
        )
        .await
        .map_err(|exhausted| LoaderError::LoadRetriesExhausted {
            file: file.path.to_string(),
            attempts: exhausted.attempts,
            source: exhausted.error,
        })?;

        emit!(LoadCompleted {
            strategy: self.strategy.name(),
            duration: start.elapsed(),
        });
        emit!(BatchCommitted {
            rows: outcome.rows_loaded,
            trigger,
        });
        info!(
            sequence,
            rows = batch.len(),
            rows_loaded = outcome.rows_loaded,
            files_skipped = outcome.files_skipped,
            trigger = trigger.as_str(),
            "Batch loaded"
        );
        self.stats.batches_committed += 1;
        self.stats.rows_loaded += outcome.rows_loaded;
        self.stats.files_skipped += outcome.files_skipped;

        if let Err(e) = self.staging.remove(&file).await {
            warn!("Failed to remove loaded staged file: {}", e);
        }

        match self.source.ack(&batch.ack_ids).await {
            Ok(()) => {
                emit!(MessagesAcked {
                    count: batch.ack_ids.len() as u64,
                });
                self.stats.messages_acked += batch.ack_ids.len();
            }
            // Redelivered rows land in a new staged file and load again.
            Err(e) => warn!(
                "Failed to ack {} loaded messages: {}",
                batch.ack_ids.len(),
                e
            ),
        }
        Ok(())
    }
}

async fn expiry(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CreateDisposition, WriteDisposition};
    use crate::mapper::{ColumnTuple, ColumnValue, TableSchema};
    use crate::source::{AckId, MemorySource};
    use crate::storage::StorageProvider;
    use crate::warehouse::MemoryWarehouse;
    use std::collections::HashMap;
    use std::time::Duration;

    const TABLE: &str = "DB.PUBLIC.EVENTS";

    fn target() -> TargetTable {
        TargetTable {
            database: "DB".to_string(),
            schema: "PUBLIC".to_string(),
            name: "EVENTS".to_string(),
            columns: TableSchema::events(),
            create_disposition: CreateDisposition::CreateIfNeeded,
            write_disposition: WriteDisposition::Append,
        }
    }

    fn retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(50),
            multiplier: 2.0,
        }
    }

    struct Harness {
        source: Arc<MemorySource>,
        warehouse: Arc<MemoryWarehouse>,
        staging: StagingArea,
    }

    impl Harness {
        async fn new() -> Self {
            let storage = Arc::new(
                StorageProvider::for_url_with_options("memory://", HashMap::new())
                    .await
                    .unwrap(),
            );
            Self {
                source: Arc::new(MemorySource::new(Duration::from_secs(600))),
                warehouse: Arc::new(MemoryWarehouse::new(storage.clone())),
                staging: StagingArea::new(storage),
            }
        }

        fn loader(&self, max_rows: usize, max_latency: Duration) -> WarehouseLoader {
            let warehouse: Arc<dyn Warehouse> = self.warehouse.clone();
            let strategy = Arc::new(BulkLoad::new(
                warehouse.clone(),
                self.staging.external_root(),
                "INT",
            ));
            WarehouseLoader::new(
                target(),
                warehouse,
                self.staging.clone(),
                strategy,
                self.source.clone(),
                retry(),
                FlushPolicy {
                    max_rows,
                    max_latency,
                },
            )
        }

        /// Publish and pull `n` messages, returning rows tied to their ack ids.
        async fn pending(&self, n: usize) -> Vec<PendingRow> {
            for i in 0..n {
                self.source.publish(format!("payload-{i}"));
            }
            self.source
                .pull(n)
                .await
                .unwrap()
                .into_iter()
                .map(|m| PendingRow {
                    row: ColumnTuple(vec![
                        ColumnValue::String(m.message_id.clone()),
                        ColumnValue::String("name".to_string()),
                        ColumnValue::Integer(1),
                        ColumnValue::Float(0.5),
                    ]),
                    ack_id: m.ack_id,
                })
                .collect()
        }
    }

    #[tokio::test]
    async fn test_flushes_full_batch_and_acks_after_load() {
        let harness = Harness::new().await;
        let loader = harness.loader(3, Duration::from_secs(3600));
        loader.prepare_table().await.unwrap();

        let (tx, rx) = mpsc::channel(16);
        let handle = tokio::spawn(loader.run(rx));
        for row in harness.pending(3).await {
            tx.send(row).await.unwrap();
        }

        // The size trigger fires without waiting for the latency bound.
        while harness.source.acked().len() < 3 {
            tokio::task::yield_now().await;
        }
        assert_eq!(harness.warehouse.rows(TABLE).len(), 3);

        drop(tx);
        let stats = handle.await.unwrap().unwrap();
        assert_eq!(stats.batches_committed, 1);
        assert_eq!(stats.rows_loaded, 3);
        assert_eq!(stats.messages_acked, 3);
        assert_eq!(harness.source.outstanding(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flushes_partial_batch_after_latency() {
        let harness = Harness::new().await;
        let loader = harness.loader(100, Duration::from_secs(5));
        loader.prepare_table().await.unwrap();

        let (tx, rx) = mpsc::channel(16);
        let handle = tokio::spawn(loader.run(rx));
        for row in harness.pending(2).await {
            tx.send(row).await.unwrap();
        }

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert!(harness.warehouse.rows(TABLE).is_empty());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(harness.warehouse.rows(TABLE).len(), 2);
        assert_eq!(harness.source.acked().len(), 2);

        drop(tx);
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_flushes_remaining_rows() {
        let harness = Harness::new().await;
        let loader = harness.loader(100, Duration::from_secs(3600));
        loader.prepare_table().await.unwrap();

        let (tx, rx) = mpsc::channel(16);
        for row in harness.pending(4).await {
            tx.send(row).await.unwrap();
        }
        drop(tx);

        let stats = loader.run(rx).await.unwrap();
        assert_eq!(stats.rows_loaded, 4);
        assert_eq!(harness.source.acked().len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_load_keeps_file_and_messages() {
        let harness = Harness::new().await;
        let loader = harness.loader(2, Duration::from_secs(3600));
        loader.prepare_table().await.unwrap();
        harness.warehouse.fail_next_loads(10);

        let (tx, rx) = mpsc::channel(16);
        for row in harness.pending(2).await {
            tx.send(row).await.unwrap();
        }
        drop(tx);

        let err = loader.run(rx).await.unwrap_err();
        assert!(matches!(
            err,
            LoaderError::LoadRetriesExhausted { attempts: 3, .. }
        ));
        assert!(err.to_string().contains("preserved for recovery"));

        assert_eq!(harness.warehouse.load_calls(), 3);
        assert!(harness.warehouse.rows(TABLE).is_empty());
        assert!(harness.source.acked().is_empty());
        assert_eq!(harness.source.in_flight(), 2);
        assert_eq!(harness.staging.storage().list(None).await.unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_load_failure_is_retried() {
        let harness = Harness::new().await;
        let loader = harness.loader(1, Duration::from_secs(3600));
        loader.prepare_table().await.unwrap();
        harness.warehouse.fail_next_loads(2);

        let (tx, rx) = mpsc::channel(16);
        for row in harness.pending(1).await {
            tx.send(row).await.unwrap();
        }
        drop(tx);

        let stats = loader.run(rx).await.unwrap();
        assert_eq!(stats.rows_loaded, 1);
        assert_eq!(harness.warehouse.load_calls(), 3);
        assert_eq!(harness.warehouse.rows(TABLE).len(), 1);
        assert!(harness.staging.storage().list(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_prepare_table_fails_on_drift() {
        let harness = Harness::new().await;
        let warehouse = Arc::new(
            MemoryWarehouse::new(harness.staging.storage().clone())
                .with_table(TABLE, &[("id", "TEXT"), ("name", "TEXT")]),
        );
        let loader = WarehouseLoader::new(
            target(),
            warehouse.clone(),
            harness.staging.clone(),
            Arc::new(ContinuousLoad::new(warehouse.clone(), "PIPE")),
            harness.source.clone(),
            retry(),
            FlushPolicy {
                max_rows: 10,
                max_latency: Duration::from_secs(1),
            },
        );

        let err = loader.prepare_table().await.unwrap_err();
        assert!(matches!(
            err,
            LoaderError::PrepareTable {
                source: WarehouseError::SchemaDrift { .. },
                ..
            }
        ));
        assert_eq!(warehouse.create_calls(), 0);
    }

    #[tokio::test]
    async fn test_stale_ack_does_not_fail_batch() {
        let harness = Harness::new().await;
        let loader = harness.loader(1, Duration::from_secs(3600));
        loader.prepare_table().await.unwrap();

        let (tx, rx) = mpsc::channel(4);
        tx.send(PendingRow {
            row: ColumnTuple(vec![
                ColumnValue::String("x".to_string()),
                ColumnValue::String("n".to_string()),
                ColumnValue::Integer(2),
                ColumnValue::Float(1.0),
            ]),
            ack_id: AckId::new("unknown"),
        })
        .await
        .unwrap();
        drop(tx);

        let stats = loader.run(rx).await.unwrap();
        assert_eq!(stats.rows_loaded, 1);
    }
}
