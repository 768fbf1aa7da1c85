//! Staged files in object storage.
//!
//! A batch is encoded once into a [`StagedFile`]. Uploads, retries and loads
//! all reuse those same bytes and that same path, which is what lets the
//! warehouse recognise a resubmitted file as already loaded.

use bytes::Bytes;
use chrono::Utc;
use object_store::PutPayload;
use object_store::path::Path;
use snafu::prelude::*;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;
use uuid::Uuid;

use crate::emit;
use crate::error::{DeleteSnafu, EncodeSnafu, StagingError, StagingOpenSnafu, UploadSnafu};
use crate::mapper::ColumnTuple;
use crate::metrics::events::StagingUploadCompleted;
use crate::storage::{StorageProvider, StorageProviderRef};

use super::codec;

/// An encoded batch and its location in the staging area.
#[derive(Debug, Clone)]
pub struct StagedFile {
    /// Path relative to the staging root.
    pub path: Path,
    pub sequence: u64,
    pub id: Uuid,
    pub rows: usize,
    pub bytes: Bytes,
}

/// Staging location the warehouse loads from.
#[derive(Debug, Clone)]
pub struct StagingArea {
    storage: StorageProviderRef,
}

impl StagingArea {
    /// Open the staging area at `url` (bucket plus prefix).
    pub async fn open(url: &str, options: HashMap<String, String>) -> Result<Self, StagingError> {
        let storage = StorageProvider::for_url_with_options(url, options)
            .await
            .context(StagingOpenSnafu { url })?;
        Ok(Self::new(Arc::new(storage)))
    }

    pub fn new(storage: StorageProviderRef) -> Self {
        Self { storage }
    }

    pub fn storage(&self) -> &StorageProviderRef {
        &self.storage
    }

    /// `{yyyy/mm/dd}/batch-{sequence}-{uuid}.csv.gz`.
    pub fn file_path(sequence: u64, id: Uuid) -> Path {
        Path::from(format!(
            "{}/batch-{:012}-{}.csv.gz",
            Utc::now().format("%Y/%m/%d"),
            sequence,
            id
        ))
    }

    /// Encode `rows` into a new staged file. Nothing is written yet.
    pub fn prepare(&self, sequence: u64, rows: &[ColumnTuple]) -> Result<StagedFile, StagingError> {
        let bytes = codec::encode(rows).context(EncodeSnafu { sequence })?;
        let id = Uuid::new_v4();
        Ok(StagedFile {
            path: Self::file_path(sequence, id),
            sequence,
            id,
            rows: rows.len(),
            bytes,
        })
    }

    /// Upload a staged file. Uploading the same file twice is harmless.
    pub async fn upload(&self, file: &StagedFile) -> Result<(), StagingError> {
        let start = Instant::now();
        self.storage
            .put_payload(&file.path, PutPayload::from(file.bytes.clone()))
            .await
            .context(UploadSnafu {
                file: file.path.to_string(),
            })?;

        emit!(StagingUploadCompleted {
            bytes: file.bytes.len() as u64,
            duration: start.elapsed(),
        });
        debug!(file = %file.path, rows = file.rows, "Staged file uploaded");
        Ok(())
    }

    /// Remove a staged file after its load was confirmed.
    pub async fn remove(&self, file: &StagedFile) -> Result<(), StagingError> {
        self.storage.delete(&file.path).await.context(DeleteSnafu {
            file: file.path.to_string(),
        })
    }

    /// External URL of the staging root, with a trailing slash.
    pub fn external_root(&self) -> String {
        let root = self.storage.external_location(&Path::default());
        format!("{}/", root.trim_end_matches('/'))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapper::{ColumnValue, TableSchema};
    use tempfile::TempDir;

    #[test]
    fn test_file_path_layout() {
        let id = Uuid::new_v4();
        let path = StagingArea::file_path(42, id).to_string();
        assert!(path.ends_with(&format!("/batch-000000000042-{id}.csv.gz")));
        assert_eq!(path.split('/').count(), 4);
    }

    #[tokio::test]
    async fn test_upload_is_repeatable_and_removable() {
        let temp_dir = TempDir::new().unwrap();
        let staging = StagingArea::open(temp_dir.path().to_str().unwrap(), HashMap::new())
            .await
            .unwrap();

        let rows = vec![ColumnTuple(vec![
            ColumnValue::String("a1".to_string()),
            ColumnValue::String("Alice".to_string()),
            ColumnValue::Integer(30),
            ColumnValue::Float(9.99),
        ])];
        let file = staging.prepare(1, &rows).unwrap();

        staging.upload(&file).await.unwrap();
        staging.upload(&file).await.unwrap();

        let stored = staging.storage().get(&file.path).await.unwrap();
        assert_eq!(stored, file.bytes);
        assert_eq!(codec::decode(&stored, &TableSchema::events()).unwrap(), rows);

        staging.remove(&file).await.unwrap();
        assert!(!staging.storage().exists(&file.path).await.unwrap());
    }

    #[tokio::test]
    async fn test_external_root_has_trailing_slash() {
        let temp_dir = TempDir::new().unwrap();
        let staging = StagingArea::open(temp_dir.path().to_str().unwrap(), HashMap::new())
            .await
            .unwrap();
        let root = staging.external_root();
        assert!(root.starts_with("file:///"));
        assert!(root.ends_with('/'));
        assert!(!root.ends_with("//"));
    }
}
