//! Dead Letter Queue implementation.
//!
//! Buffers rejected messages and writes them as NDJSON. Every flush writes
//! a new file, so nothing already written is ever overwritten.

use bytes::Bytes;
use chrono::Utc;
use object_store::PutPayload;
use object_store::path::Path;
use snafu::prelude::*;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::ErrorHandlingConfig;
use crate::error::{DlqError, DlqSerializeSnafu, DlqStorageSnafu, DlqWriteSnafu};
use crate::source::AckId;
use crate::storage::{StorageProvider, StorageProviderRef};

use super::types::{DeadLetter, RejectionStats, UnwrittenDeadLetters};

const DEFAULT_BUFFER_SIZE: usize = 100;

/// Dead Letter Queue for rejected messages.
pub struct DeadLetterQueue {
    storage: StorageProviderRef,
    buffer: Mutex<Vec<(DeadLetter, AckId)>>,
    stats: Mutex<RejectionStats>,
    buffer_size: usize,
}

impl DeadLetterQueue {
    /// Create a DLQ from configuration, or `None` if no path is configured.
    pub async fn from_config(config: &ErrorHandlingConfig) -> Result<Option<Self>, DlqError> {
        let Some(dlq_path) = &config.dlq_path else {
            return Ok(None);
        };

        let storage =
            StorageProvider::for_url_with_options(dlq_path, config.dlq_storage_options.clone())
                .await
                .context(DlqStorageSnafu)?;

        info!("DLQ enabled: {}", storage.canonical_url());
        Ok(Some(Self::new(Arc::new(storage))))
    }

    pub fn new(storage: StorageProviderRef) -> Self {
        Self {
            storage,
            buffer: Mutex::new(Vec::new()),
            stats: Mutex::new(RejectionStats::default()),
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }

    /// Flush automatically once this many records are buffered.
    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size.max(1);
        self
    }

    /// Buffer a dead letter. Returns true when the buffer should be flushed.
    pub async fn record(&self, letter: DeadLetter, ack_id: AckId) -> bool {
        debug!(
            message_id = %letter.message_id,
            kind = %letter.kind,
            "Recording dead letter"
        );
        self.stats.lock().await.increment(&letter.kind);

        let mut buffer = self.buffer.lock().await;
        buffer.push((letter, ack_id));
        buffer.len() >= self.buffer_size
    }

    /// Write buffered records to a new file.
    ///
    /// On success returns the ack ids of every written record. On failure
    /// the records are dropped from the buffer and their ack ids are handed
    /// back so the messages can be redelivered.
    pub async fn flush(&self) -> Result<Vec<AckId>, UnwrittenDeadLetters> {
        let pending = std::mem::take(&mut *self.buffer.lock().await);
        if pending.is_empty() {
            return Ok(Vec::new());
        }

        let (letters, ack_ids): (Vec<DeadLetter>, Vec<AckId>) = pending.into_iter().unzip();
        match self.write(&letters).await {
            Ok(path) => {
                info!("Flushed {} records to DLQ file {}", letters.len(), path);
                Ok(ack_ids)
            }
            Err(error) => Err(UnwrittenDeadLetters { ack_ids, error }),
        }
    }

    async fn write(&self, letters: &[DeadLetter]) -> Result<Path, DlqError> {
        let mut ndjson = String::new();
        for letter in letters {
            ndjson.push_str(&serde_json::to_string(letter).context(DlqSerializeSnafu)?);
            ndjson.push('\n');
        }

        let now = Utc::now();
        let path = Path::from(format!(
            "{}/rejected-{}-{}.ndjson",
            now.format("%Y/%m/%d"),
            now.format("%H%M%S"),
            Uuid::new_v4()
        ));
        self.storage
            .put_payload(&path, PutPayload::from(Bytes::from(ndjson)))
            .await
            .context(DlqWriteSnafu)?;
        Ok(path)
    }

    /// Rejection counts recorded so far.
    pub async fn stats(&self) -> RejectionStats {
        self.stats.lock().await.clone()
    }
}
