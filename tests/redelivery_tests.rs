//! Tests that interrupt loading and check that no accepted message is lost.
//!
//! Staging lives in a temporary directory so preserved files can be
//! inspected after a failure.
//!
//! Run with: cargo test --test redelivery_tests

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tempfile::TempDir;

use snowdrift::config::Config;
use snowdrift::error::{LoaderError, PipelineError, SourceError};
use snowdrift::loader::{BulkLoad, ContinuousLoad, LoadStrategy, StagingArea};
use snowdrift::mapper::{ColumnTuple, ColumnValue};
use snowdrift::pipeline::Pipeline;
use snowdrift::source::{AckId, MemorySource, MessageSource, RawMessage};
use snowdrift::storage::StorageProvider;
use snowdrift::warehouse::{MemoryWarehouse, TargetTable, Warehouse};

const TABLE: &str = "ANALYTICS.PUBLIC.EVENTS";
const VISIBILITY: Duration = Duration::from_millis(300);

fn config() -> Config {
    let mut config = Config::from_yaml(
        r#"
source:
  subscription: projects/acme/subscriptions/events-sub
  workers: 1
  pull_backoff_ms: 20
sink:
  database: ANALYTICS
  schema: PUBLIC
  table: EVENTS
  role: LOADER
  server_name: localhost
  staging_bucket: /unused
  storage_integration: ACME_GCS
  continuous: false
  auth:
    token: test-token
batching:
  max_latency_ms: 50
retry:
  max_attempts: 3
  initial_backoff_ms: 5
  max_backoff_ms: 20
metrics:
  enabled: false
"#,
    )
    .unwrap();
    config.error_handling.max_failures = 0;
    config
}

fn event(id: &str) -> String {
    format!(r#"{{"id":"{id}","name":"n","age":7,"price":2.5}}"#)
}

async fn local_staging(dir: &TempDir) -> StagingArea {
    StagingArea::open(dir.path().to_str().unwrap(), HashMap::new())
        .await
        .unwrap()
}

async fn wait_for(mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

/// Delegates to a [`MemorySource`] but fails the first `failures` acks.
struct LossyAcks {
    inner: Arc<MemorySource>,
    failures: AtomicU32,
}

#[async_trait]
impl MessageSource for LossyAcks {
    async fn pull(&self, max_messages: usize) -> Result<Vec<RawMessage>, SourceError> {
        self.inner.pull(max_messages).await
    }

    async fn ack(&self, ack_ids: &[AckId]) -> Result<(), SourceError> {
        let left = self.failures.load(Ordering::SeqCst);
        if left > 0 {
            self.failures.store(left - 1, Ordering::SeqCst);
            return Err(SourceError::SourceStatus {
                operation: "acknowledge",
                status: 503,
                body: "unavailable".to_string(),
            });
        }
        self.inner.ack(ack_ids).await
    }

    async fn nack(&self, ack_ids: &[AckId]) -> Result<(), SourceError> {
        self.inner.nack(ack_ids).await
    }

    async fn extend(&self, ack_ids: &[AckId], lease: Duration) -> Result<(), SourceError> {
        self.inner.extend(ack_ids, lease).await
    }

    fn name(&self) -> &str {
        "lossy"
    }
}

/// A load that keeps failing stops the pipeline, leaves the staged file in
/// place and leaves every message unacknowledged. Once the warehouse is back
/// the redelivered messages load exactly once.
#[tokio::test]
async fn test_failed_load_preserves_file_and_messages() {
    let dir = TempDir::new().unwrap();
    let staging = local_staging(&dir).await;
    let source = Arc::new(MemorySource::new(VISIBILITY));
    let warehouse = Arc::new(MemoryWarehouse::new(staging.storage().clone()));
    source.publish(event("a"));
    source.publish(event("b"));

    warehouse.fail_next_loads(3);
    let err = Pipeline::new(config(), source.clone(), warehouse.clone(), staging.clone())
        .run()
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        PipelineError::Loader {
            source: LoaderError::LoadRetriesExhausted { attempts: 3, .. }
        }
    ));

    let preserved = staging.storage().list(None).await.unwrap();
    assert_eq!(preserved.len(), 1);
    assert!(preserved[0].to_string().ends_with(".csv.gz"));
    assert!(warehouse.rows(TABLE).is_empty());
    assert!(source.acked().is_empty());
    assert_eq!(source.outstanding(), 2);

    // Leases expire and the messages come back.
    tokio::time::sleep(VISIBILITY + Duration::from_millis(50)).await;

    let pipeline = Pipeline::new(config(), source.clone(), warehouse.clone(), staging.clone());
    let shutdown = pipeline.shutdown_token();
    let handle = tokio::spawn(pipeline.run());
    wait_for(|| source.acked().len() == 2).await;
    shutdown.cancel();
    let stats = handle.await.unwrap().unwrap();

    assert_eq!(stats.rows_loaded, 2);
    assert_eq!(warehouse.rows(TABLE).len(), 2);
    assert_eq!(source.outstanding(), 0);
    // Only the preserved file is left; the successful one was cleaned up.
    assert_eq!(staging.storage().list(None).await.unwrap(), preserved);
}

/// Losing an ack after a committed load redelivers the message. The row is
/// loaded again: delivery is at-least-once, never at-most-once.
#[tokio::test]
async fn test_lost_ack_redelivers_committed_rows() {
    let dir = TempDir::new().unwrap();
    let staging = local_staging(&dir).await;
    let inner = Arc::new(MemorySource::new(VISIBILITY));
    let source = Arc::new(LossyAcks {
        inner: inner.clone(),
        failures: AtomicU32::new(1),
    });
    let warehouse = Arc::new(MemoryWarehouse::new(staging.storage().clone()));
    inner.publish(event("a"));

    let pipeline = Pipeline::new(config(), source, warehouse.clone(), staging);
    let shutdown = pipeline.shutdown_token();
    let handle = tokio::spawn(pipeline.run());
    wait_for(|| inner.acked().len() == 1).await;
    shutdown.cancel();
    let stats = handle.await.unwrap().unwrap();

    assert_eq!(stats.batches_committed, 2);
    assert_eq!(warehouse.rows(TABLE).len(), 2);
    assert_eq!(inner.outstanding(), 0);
}

mod resubmission_tests {
    use super::*;

    fn rows() -> Vec<ColumnTuple> {
        vec![ColumnTuple(vec![
            ColumnValue::String("a1".to_string()),
            ColumnValue::String("Alice".to_string()),
            ColumnValue::Integer(30),
            ColumnValue::Float(9.99),
        ])]
    }

    async fn setup(dir: &TempDir) -> (StagingArea, Arc<MemoryWarehouse>, TargetTable) {
        let staging = local_staging(dir).await;
        let warehouse = Arc::new(
            MemoryWarehouse::new(staging.storage().clone())
                .with_pipe("ANALYTICS.PUBLIC.EVENTS_PIPE", TABLE),
        );
        let table = TargetTable::from_config(&config().sink);
        warehouse.ensure_table(&table).await.unwrap();
        (staging, warehouse, table)
    }

    #[tokio::test]
    async fn test_bulk_load_resubmission_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let (staging, warehouse, table) = setup(&dir).await;
        let file = staging.prepare(1, &rows()).unwrap();
        staging.upload(&file).await.unwrap();

        let strategy = BulkLoad::new(warehouse.clone(), staging.external_root(), "ACME_GCS");
        let first = strategy.load(&table, &file).await.unwrap();
        let second = strategy.load(&table, &file).await.unwrap();

        assert_eq!(first.rows_loaded, 1);
        assert_eq!(second.rows_loaded, 0);
        assert_eq!(second.files_skipped, 1);
        assert_eq!(warehouse.rows(TABLE), rows());
    }

    #[tokio::test]
    async fn test_pipe_resubmission_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let (staging, warehouse, table) = setup(&dir).await;
        let file = staging.prepare(7, &rows()).unwrap();
        staging.upload(&file).await.unwrap();
        // A retried upload writes the same bytes to the same path.
        staging.upload(&file).await.unwrap();

        let strategy = ContinuousLoad::new(warehouse.clone(), "ANALYTICS.PUBLIC.EVENTS_PIPE");
        strategy.load(&table, &file).await.unwrap();
        strategy.load(&table, &file).await.unwrap();

        assert_eq!(warehouse.rows(TABLE), rows());
    }

    #[tokio::test]
    async fn test_table_bootstrap_is_repeatable() {
        let dir = TempDir::new().unwrap();
        let (_staging, warehouse, table) = setup(&dir).await;
        for _ in 0..3 {
            warehouse.ensure_table(&table).await.unwrap();
        }
        assert_eq!(warehouse.create_calls(), 1);
    }
}

#[tokio::test]
async fn test_storage_provider_opens_local_staging() {
    let dir = TempDir::new().unwrap();
    let storage = StorageProvider::for_url_with_options(
        &format!("file://{}", dir.path().display()),
        HashMap::new(),
    )
    .await
    .unwrap();
    assert!(storage.canonical_url().starts_with("file:///"));
}
