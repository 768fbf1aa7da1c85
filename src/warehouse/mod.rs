//! Warehouse access.
//!
//! [`Warehouse`] is the seam between the loader and the data warehouse. A
//! load names staged files; the warehouse keeps a load history keyed by
//! file name and skips files it has already loaded, so resubmitting a file
//! never duplicates rows.

mod memory;
mod snowflake;

pub use memory::MemoryWarehouse;
pub use snowflake::SnowflakeWarehouse;

use async_trait::async_trait;
use tracing::info;

use crate::config::{CreateDisposition, SinkConfig, WriteDisposition};
use crate::error::WarehouseError;
use crate::mapper::TableSchema;

/// The table rows are loaded into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetTable {
    pub database: String,
    pub schema: String,
    pub name: String,
    pub columns: TableSchema,
    pub create_disposition: CreateDisposition,
    pub write_disposition: WriteDisposition,
}

impl TargetTable {
    pub fn from_config(sink: &SinkConfig) -> Self {
        Self {
            database: sink.database.clone(),
            schema: sink.schema.clone(),
            name: sink.table.clone(),
            columns: TableSchema::events(),
            create_disposition: sink.create_disposition,
            write_disposition: sink.write_disposition,
        }
    }

    /// `database.schema.table`.
    pub fn qualified_name(&self) -> String {
        format!("{}.{}.{}", self.database, self.schema, self.name)
    }
}

/// State of the target table after preparation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableStatus {
    Created,
    Existing,
}

/// Files to bulk load from an external location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyRequest {
    /// External URL of the staging root, ending in `/`.
    pub location: String,
    /// File paths relative to `location`.
    pub files: Vec<String>,
    pub storage_integration: String,
}

/// Result of one load request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadOutcome {
    pub rows_loaded: u64,
    /// Files skipped because load history shows them already loaded.
    pub files_skipped: usize,
}

#[async_trait]
pub trait Warehouse: Send + Sync {
    /// Column `(name, type)` pairs of an existing table, or `None` if absent.
    async fn describe_table(
        &self,
        table: &TargetTable,
    ) -> Result<Option<Vec<(String, String)>>, WarehouseError>;

    /// Create the table if it does not exist. Never replaces a table.
    async fn create_table(&self, table: &TargetTable) -> Result<(), WarehouseError>;

    async fn count_rows(&self, table: &TargetTable) -> Result<u64, WarehouseError>;

    /// Bulk load staged files into the table.
    async fn copy_into(
        &self,
        table: &TargetTable,
        request: &CopyRequest,
    ) -> Result<LoadOutcome, WarehouseError>;

    /// Submit staged files to a continuous-ingest pipe and wait until the
    /// pipe reports them loaded.
    async fn ingest_via_pipe(
        &self,
        pipe: &str,
        files: &[String],
    ) -> Result<LoadOutcome, WarehouseError>;

    /// Make sure the table exists, matches the schema and satisfies the
    /// write disposition. Safe to call any number of times.
    async fn ensure_table(&self, table: &TargetTable) -> Result<TableStatus, WarehouseError> {
        let qualified = table.qualified_name();

        let status = match self.describe_table(table).await? {
            Some(existing) => {
                table
                    .columns
                    .check_compatible(&existing)
                    .map_err(|details| WarehouseError::SchemaDrift {
                        table: qualified.clone(),
                        details,
                    })?;
                TableStatus::Existing
            }
            None if table.create_disposition == CreateDisposition::CreateNever => {
                return Err(WarehouseError::TableMissing { table: qualified });
            }
            None => {
                self.create_table(table).await?;
                info!(table = %qualified, "Created table");
                TableStatus::Created
            }
        };

        if table.write_disposition == WriteDisposition::Empty {
            let rows = self.count_rows(table).await?;
            if rows > 0 {
                return Err(WarehouseError::TableNotEmpty {
                    table: qualified,
                    rows,
                });
            }
        }

        Ok(status)
    }
}
