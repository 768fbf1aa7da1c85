//! Internal events for metrics emission.
//!
//! Each event struct represents a measurable occurrence in the pipeline.
//! Events implement [`InternalEvent`], which records the Prometheus metric
//! and leaves a trace line behind.

use metrics::{counter, gauge, histogram};
use std::time::Duration;
use tracing::trace;

/// Trait for internal events that can be emitted as metrics.
pub trait InternalEvent {
    /// Emit this event as a metric.
    fn emit(self);
}

// ============================================================================
// Source
// ============================================================================

/// Messages delivered by a pull.
pub struct MessagesReceived {
    pub count: u64,
}

impl InternalEvent for MessagesReceived {
    fn emit(self) {
        trace!(count = self.count, "Messages received");
        counter!("snowdrift_messages_received_total").increment(self.count);
    }
}

/// Messages acknowledged back to the subscription.
pub struct MessagesAcked {
    pub count: u64,
}

impl InternalEvent for MessagesAcked {
    fn emit(self) {
        trace!(count = self.count, "Messages acked");
        counter!("snowdrift_messages_acked_total").increment(self.count);
    }
}

/// Messages handed back to the subscription for redelivery.
pub struct MessagesNacked {
    pub count: u64,
}

impl InternalEvent for MessagesNacked {
    fn emit(self) {
        trace!(count = self.count, "Messages nacked");
        counter!("snowdrift_messages_nacked_total").increment(self.count);
    }
}

/// Messages currently held by the pipeline under a renewed lease.
pub struct LeasesHeld {
    pub count: usize,
}

impl InternalEvent for LeasesHeld {
    fn emit(self) {
        trace!(count = self.count, "Leases held");
        gauge!("snowdrift_leases_held").set(self.count as f64);
    }
}

/// Lease renewals sent to the subscription.
pub struct LeasesExtended {
    pub count: u64,
}

impl InternalEvent for LeasesExtended {
    fn emit(self) {
        trace!(count = self.count, "Leases extended");
        counter!("snowdrift_lease_extensions_total").increment(self.count);
    }
}

/// Messages dropped from lease renewal after the maximum lease.
pub struct LeasesAbandoned {
    pub count: u64,
}

impl InternalEvent for LeasesAbandoned {
    fn emit(self) {
        trace!(count = self.count, "Leases abandoned");
        counter!("snowdrift_leases_abandoned_total").increment(self.count);
    }
}

/// A pull request failed and will be retried after a backoff.
pub struct PullFailed;

impl InternalEvent for PullFailed {
    fn emit(self) {
        trace!("Pull failed");
        counter!("snowdrift_pull_failures_total").increment(1);
    }
}

/// A message failed validation.
pub struct MessageRejected {
    pub reason: &'static str,
}

impl InternalEvent for MessageRejected {
    fn emit(self) {
        trace!(reason = self.reason, "Message rejected");
        counter!("snowdrift_messages_rejected_total", "reason" => self.reason).increment(1);
    }
}

/// Rejected messages written to the dead letter queue.
pub struct DeadLettersWritten {
    pub count: u64,
}

impl InternalEvent for DeadLettersWritten {
    fn emit(self) {
        trace!(count = self.count, "Dead letters written");
        counter!("snowdrift_dead_letters_written_total").increment(self.count);
    }
}

// ============================================================================
// Loader
// ============================================================================

/// Rows currently waiting in the batch buffer.
pub struct RowsBuffered {
    pub count: usize,
}

impl InternalEvent for RowsBuffered {
    fn emit(self) {
        gauge!("snowdrift_rows_buffered").set(self.count as f64);
    }
}

/// Why a batch was flushed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushTrigger {
    /// The buffer reached `max_rows`.
    Size,
    /// The oldest row exceeded `max_latency`.
    Latency,
    /// The input closed during shutdown.
    Shutdown,
}

impl FlushTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlushTrigger::Size => "size",
            FlushTrigger::Latency => "latency",
            FlushTrigger::Shutdown => "shutdown",
        }
    }
}

/// A batch was committed to the warehouse.
pub struct BatchCommitted {
    pub rows: u64,
    pub trigger: FlushTrigger,
}

impl InternalEvent for BatchCommitted {
    fn emit(self) {
        trace!(
            rows = self.rows,
            trigger = self.trigger.as_str(),
            "Batch committed"
        );
        counter!("snowdrift_batches_committed_total", "trigger" => self.trigger.as_str())
            .increment(1);
        counter!("snowdrift_rows_loaded_total").increment(self.rows);
    }
}

/// A staged file was uploaded.
pub struct StagingUploadCompleted {
    pub bytes: u64,
    pub duration: Duration,
}

impl InternalEvent for StagingUploadCompleted {
    fn emit(self) {
        trace!(
            bytes = self.bytes,
            duration_ms = self.duration.as_millis(),
            "Staging upload completed"
        );
        counter!("snowdrift_staged_bytes_total").increment(self.bytes);
        histogram!("snowdrift_staging_upload_duration_seconds")
            .record(self.duration.as_secs_f64());
    }
}

/// A load of one staged file finished, including retries.
pub struct LoadCompleted {
    pub strategy: &'static str,
    pub duration: Duration,
}

impl InternalEvent for LoadCompleted {
    fn emit(self) {
        trace!(
            strategy = self.strategy,
            duration_ms = self.duration.as_millis(),
            "Load completed"
        );
        histogram!("snowdrift_load_duration_seconds", "strategy" => self.strategy)
            .record(self.duration.as_secs_f64());
    }
}

/// Stage of the loader an attempt belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryStage {
    PrepareTable,
    Staging,
    Load,
}

impl RetryStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            RetryStage::PrepareTable => "prepare_table",
            RetryStage::Staging => "staging",
            RetryStage::Load => "load",
        }
    }
}

/// A failed attempt is about to be retried.
pub struct RetryScheduled {
    pub stage: RetryStage,
}

impl InternalEvent for RetryScheduled {
    fn emit(self) {
        trace!(stage = self.stage.as_str(), "Retry scheduled");
        counter!("snowdrift_retries_total", "stage" => self.stage.as_str()).increment(1);
    }
}

// ============================================================================
// Storage
// ============================================================================

/// Storage operation types.
#[derive(Debug, Clone, Copy)]
pub enum StorageOperation {
    Get,
    Put,
    Delete,
    Head,
    List,
}

impl StorageOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageOperation::Get => "get",
            StorageOperation::Put => "put",
            StorageOperation::Delete => "delete",
            StorageOperation::Head => "head",
            StorageOperation::List => "list",
        }
    }
}

/// Status of a storage request.
#[derive(Debug, Clone, Copy)]
pub enum RequestStatus {
    Success,
    Error,
}

impl RequestStatus {
    fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Success => "success",
            RequestStatus::Error => "error",
        }
    }
}

/// Event emitted when a storage request completes.
pub struct StorageRequest {
    pub operation: StorageOperation,
    pub status: RequestStatus,
}

impl InternalEvent for StorageRequest {
    fn emit(self) {
        trace!(
            operation = self.operation.as_str(),
            status = self.status.as_str(),
            "Storage request"
        );
        counter!(
            "snowdrift_storage_requests_total",
            "operation" => self.operation.as_str(),
            "status" => self.status.as_str()
        )
        .increment(1);
    }
}

/// Event emitted when a storage request completes with duration.
pub struct StorageRequestDuration {
    pub operation: StorageOperation,
    pub duration: Duration,
}

impl InternalEvent for StorageRequestDuration {
    fn emit(self) {
        histogram!(
            "snowdrift_storage_request_duration_seconds",
            "operation" => self.operation.as_str()
        )
        .record(self.duration.as_secs_f64());
    }
}
