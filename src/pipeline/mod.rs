//! Main processing pipeline.
//!
//! Connects the subscription, the consumer workers and the warehouse loader.
//!
//! # Architecture
//!
//! - **Consumer workers** (`source.workers` tokio tasks) pull, parse and map
//!   messages and send rows over a bounded channel.
//! - **Loader** (one tokio task) owns the batch buffer, stages and loads
//!   batches, and acknowledges messages once their rows are committed.
//!
//! - **Lease keeper** (one tokio task) renews the subscription lease of
//!   every message pulled and not yet acknowledged or nacked.
//!
//! Shutdown stops the workers first; the loader then drains the channel,
//! flushes what is buffered and exits. A loader failure stops the workers,
//! and anything not yet acknowledged is redelivered by the subscription.

mod signal;
mod worker;

pub use signal::{cancel_on_signal, shutdown_signal};
pub use worker::WorkerStats;

use snafu::prelude::*;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::Config;
use crate::dlq::{DeadLetterQueue, FailureTracker};
use crate::error::{
    DlqSnafu, LoaderSnafu, PipelineError, SourceSnafu, StagingSnafu, TaskJoinSnafu,
    WarehouseSnafu,
};
use crate::loader::{
    BulkLoad, ContinuousLoad, FlushPolicy, LoadStrategy, LoaderStats, RetryPolicy, StagingArea,
    WarehouseLoader,
};
use crate::source::{LeaseKeeper, LeasePolicy, MessageSource, PubSubSource};
use crate::warehouse::{SnowflakeWarehouse, TableStatus, TargetTable, Warehouse};

use worker::ConsumerWorker;

/// Statistics about the pipeline run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub table_created: bool,
    pub messages_received: usize,
    pub rows_forwarded: usize,
    pub messages_rejected: usize,
    pub batches_committed: usize,
    pub rows_loaded: u64,
    pub messages_acked: usize,
    pub files_skipped: usize,
}

impl PipelineStats {
    fn absorb(&mut self, workers: WorkerStats, loader: LoaderStats) {
        self.messages_received = workers.messages_received;
        self.rows_forwarded = workers.rows_forwarded;
        self.messages_rejected = workers.messages_rejected;
        self.batches_committed = loader.batches_committed;
        self.rows_loaded = loader.rows_loaded;
        self.messages_acked = loader.messages_acked;
        self.files_skipped = loader.files_skipped;
    }
}

/// One subscription feeding one table.
pub struct Pipeline {
    config: Config,
    source: Arc<dyn MessageSource>,
    warehouse: Arc<dyn Warehouse>,
    staging: StagingArea,
    dlq: Option<Arc<DeadLetterQueue>>,
    shutdown: CancellationToken,
}

impl Pipeline {
    pub fn new(
        config: Config,
        source: Arc<dyn MessageSource>,
        warehouse: Arc<dyn Warehouse>,
        staging: StagingArea,
    ) -> Self {
        Self {
            config,
            source,
            warehouse,
            staging,
            dlq: None,
            shutdown: CancellationToken::new(),
        }
    }

    /// Write rejected messages to `dlq` instead of dropping them.
    pub fn with_dead_letters(mut self, dlq: DeadLetterQueue) -> Self {
        self.dlq = Some(Arc::new(dlq));
        self
    }

    /// Stop consuming when `shutdown` is cancelled.
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    fn strategy(&self) -> Arc<dyn LoadStrategy> {
        let sink = &self.config.sink;
        match sink.qualified_pipe() {
            Some(pipe) if sink.continuous => {
                Arc::new(ContinuousLoad::new(self.warehouse.clone(), pipe))
            }
            _ => Arc::new(BulkLoad::new(
                self.warehouse.clone(),
                self.staging.external_root(),
                sink.storage_integration.clone(),
            )),
        }
    }

    /// Run until shutdown is requested or a fatal error occurs.
    pub async fn run(self) -> Result<PipelineStats, PipelineError> {
        let lease = Arc::new(LeaseKeeper::new(
            self.source.clone(),
            LeasePolicy::from(&self.config.source),
        ));
        let source: Arc<dyn MessageSource> = lease.clone();

        let loader = WarehouseLoader::new(
            TargetTable::from_config(&self.config.sink),
            self.warehouse.clone(),
            self.staging.clone(),
            self.strategy(),
            source.clone(),
            RetryPolicy::from(&self.config.retry),
            FlushPolicy {
                max_rows: self.config.batching.max_rows,
                max_latency: self.config.max_latency(),
            },
        );

        let mut stats = PipelineStats {
            table_created: loader.prepare_table().await.context(LoaderSnafu)?
                == TableStatus::Created,
            ..PipelineStats::default()
        };

        // Leases are renewed until the loader has settled every message.
        let lease_stop = CancellationToken::new();
        let _lease_guard = lease_stop.clone().drop_guard();
        tokio::spawn(lease.run(lease_stop));

        let (tx, rx) = mpsc::channel(self.config.batching.channel_capacity);
        let workers_shutdown = self.shutdown.child_token();

        let loader_failed = workers_shutdown.clone();
        let loader_handle = tokio::spawn(async move {
            let result = loader.run(rx).await;
            if result.is_err() {
                loader_failed.cancel();
            }
            result
        });

        let tracker = Arc::new(FailureTracker::new(
            source.clone(),
            self.dlq.clone(),
            self.config.error_handling.max_failures,
        ));

        info!(
            source = self.source.name(),
            table = %self.config.sink.qualified_table(),
            workers = self.config.source.workers,
            "Pipeline started"
        );

        let handles: Vec<_> = (0..self.config.source.workers)
            .map(|id| {
                tokio::spawn(
                    ConsumerWorker {
                        id,
                        source: source.clone(),
                        tracker: tracker.clone(),
                        rows: tx.clone(),
                        max_messages: self.config.source.max_messages,
                        pull_backoff: self.config.source.pull_backoff(),
                        shutdown: workers_shutdown.clone(),
                    }
                    .run(),
                )
            })
            .collect();
        drop(tx);

        let mut worker_stats = WorkerStats::default();
        let mut worker_error = None;
        for handle in handles {
            match handle.await.context(TaskJoinSnafu)? {
                Ok(worker) => worker_stats += worker,
                Err(e) => {
                    worker_error.get_or_insert(e);
                }
            }
        }

        let loader_result = loader_handle.await.context(TaskJoinSnafu)?;
        tracker.finalize().await;

        let loader_stats = loader_result.context(LoaderSnafu).inspect_err(|e| {
            error!("Loader failed: {}", e);
        })?;
        if let Some(e) = worker_error {
            return Err(e);
        }

        stats.absorb(worker_stats, loader_stats);
        info!(
            rows_loaded = stats.rows_loaded,
            rejected = stats.messages_rejected,
            "Pipeline stopped"
        );
        Ok(stats)
    }
}

/// Build the production pipeline from configuration and run it until
/// `shutdown` is cancelled.
pub async fn run_pipeline(
    config: Config,
    shutdown: CancellationToken,
) -> Result<PipelineStats, PipelineError> {
    let source = Arc::new(PubSubSource::new(&config.source).context(SourceSnafu)?);
    let warehouse = Arc::new(SnowflakeWarehouse::new(&config.sink).context(WarehouseSnafu)?);
    let staging = StagingArea::open(
        &config.sink.staging_url(),
        config.sink.storage_options.clone(),
    )
    .await
    .context(StagingSnafu)?;
    let dlq = DeadLetterQueue::from_config(&config.error_handling)
        .await
        .context(DlqSnafu)?;

    let mut pipeline = Pipeline::new(config, source, warehouse, staging).with_shutdown(shutdown);
    if let Some(dlq) = dlq {
        pipeline = pipeline.with_dead_letters(dlq);
    }
    pipeline.run().await
}
