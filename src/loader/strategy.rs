//! How a staged file gets into the table.

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::WarehouseError;
use crate::warehouse::{CopyRequest, LoadOutcome, TargetTable, Warehouse};

use super::staging::StagedFile;

#[async_trait]
pub trait LoadStrategy: Send + Sync {
    /// Label used in logs and metrics.
    fn name(&self) -> &'static str;

    /// Load one staged file. Calling this again for the same file must not
    /// duplicate rows.
    async fn load(
        &self,
        table: &TargetTable,
        file: &StagedFile,
    ) -> Result<LoadOutcome, WarehouseError>;
}

/// `COPY INTO` from the external staging location.
pub struct BulkLoad {
    warehouse: Arc<dyn Warehouse>,
    location: String,
    storage_integration: String,
}

impl BulkLoad {
    pub fn new(
        warehouse: Arc<dyn Warehouse>,
        location: impl Into<String>,
        storage_integration: impl Into<String>,
    ) -> Self {
        Self {
            warehouse,
            location: location.into(),
            storage_integration: storage_integration.into(),
        }
    }
}

#[async_trait]
impl LoadStrategy for BulkLoad {
    fn name(&self) -> &'static str {
        "bulk"
    }

    async fn load(
        &self,
        table: &TargetTable,
        file: &StagedFile,
    ) -> Result<LoadOutcome, WarehouseError> {
        let request = CopyRequest {
            location: self.location.clone(),
            files: vec![file.path.to_string()],
            storage_integration: self.storage_integration.clone(),
        };
        self.warehouse.copy_into(table, &request).await
    }
}

/// Submission to a continuous-ingest pipe whose stage is the staging root.
pub struct ContinuousLoad {
    warehouse: Arc<dyn Warehouse>,
    pipe: String,
}

impl ContinuousLoad {
    pub fn new(warehouse: Arc<dyn Warehouse>, pipe: impl Into<String>) -> Self {
        Self {
            warehouse,
            pipe: pipe.into(),
        }
    }
}

#[async_trait]
impl LoadStrategy for ContinuousLoad {
    fn name(&self) -> &'static str {
        "continuous"
    }

    async fn load(
        &self,
        _table: &TargetTable,
        file: &StagedFile,
    ) -> Result<LoadOutcome, WarehouseError> {
        self.warehouse
            .ingest_via_pipe(&self.pipe, &[file.path.to_string()])
            .await
    }
}
