//! In-process warehouse.
//!
//! Reads staged files back from the staging area and keeps rows in memory,
//! with the same load-history deduplication a real warehouse applies. Faults
//! can be injected to exercise retry paths.

use async_trait::async_trait;
use object_store::path::Path;
use snafu::prelude::*;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use crate::error::{StagedDecodeSnafu, StagedReadSnafu, WarehouseError};
use crate::loader::codec;
use crate::mapper::{ColumnTuple, TableSchema};
use crate::storage::StorageProviderRef;

use super::{CopyRequest, LoadOutcome, TargetTable, Warehouse};

#[derive(Debug, Default)]
struct Table {
    columns: Vec<(String, String)>,
    rows: Vec<ColumnTuple>,
    /// Files already loaded into this table.
    history: HashSet<String>,
}

#[derive(Debug, Default)]
struct State {
    tables: HashMap<String, Table>,
    pipes: HashMap<String, String>,
    failing_loads: u32,
    create_calls: usize,
    load_calls: usize,
}

/// In-memory warehouse backed by the staging area.
pub struct MemoryWarehouse {
    staging: StorageProviderRef,
    state: Mutex<State>,
}

impl MemoryWarehouse {
    pub fn new(staging: StorageProviderRef) -> Self {
        Self {
            staging,
            state: Mutex::new(State::default()),
        }
    }

    /// Pre-create a table with arbitrary column types.
    pub fn with_table(self, qualified_name: &str, columns: &[(&str, &str)]) -> Self {
        self.lock().tables.insert(
            qualified_name.to_string(),
            Table {
                columns: columns
                    .iter()
                    .map(|(n, t)| (n.to_string(), t.to_string()))
                    .collect(),
                ..Table::default()
            },
        );
        self
    }

    /// Route a pipe name to a table.
    pub fn with_pipe(self, pipe: &str, qualified_table: &str) -> Self {
        self.lock()
            .pipes
            .insert(pipe.to_string(), qualified_table.to_string());
        self
    }

    /// Make the next `count` load requests fail with a retryable error.
    pub fn fail_next_loads(&self, count: u32) {
        self.lock().failing_loads = count;
    }

    /// Rows in a table, in load order.
    pub fn rows(&self, qualified_name: &str) -> Vec<ColumnTuple> {
        self.lock()
            .tables
            .get(qualified_name)
            .map(|t| t.rows.clone())
            .unwrap_or_default()
    }

    /// Seed rows directly, bypassing staging.
    pub fn insert_rows(&self, qualified_name: &str, rows: Vec<ColumnTuple>) {
        if let Some(table) = self.lock().tables.get_mut(qualified_name) {
            table.rows.extend(rows);
        }
    }

    pub fn table_exists(&self, qualified_name: &str) -> bool {
        self.lock().tables.contains_key(qualified_name)
    }

    /// Number of `create_table` calls that actually created a table.
    pub fn create_calls(&self) -> usize {
        self.lock().create_calls
    }

    /// Number of load requests received, including failed ones.
    pub fn load_calls(&self) -> usize {
        self.lock().load_calls
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn begin_load(&self) -> Result<(), WarehouseError> {
        let mut state = self.lock();
        state.load_calls += 1;
        if state.failing_loads > 0 {
            state.failing_loads -= 1;
            return Err(WarehouseError::InjectedFailure);
        }
        Ok(())
    }

    async fn load_files(
        &self,
        qualified: &str,
        files: &[String],
    ) -> Result<LoadOutcome, WarehouseError> {
        self.begin_load()?;

        let schema = TableSchema::events();
        let mut decoded = Vec::with_capacity(files.len());
        for file in files {
            if self.already_loaded(qualified, file)? {
                decoded.push((file.clone(), None));
                continue;
            }
            let bytes = self
                .staging
                .get(&Path::from(file.as_str()))
                .await
                .context(StagedReadSnafu { file: file.as_str() })?;
            let rows = codec::decode(&bytes, &schema)
                .context(StagedDecodeSnafu { file: file.as_str() })?;
            decoded.push((file.clone(), Some(rows)));
        }

        let mut state = self.lock();
        let table = state
            .tables
            .get_mut(qualified)
            .ok_or_else(|| missing_table(qualified))?;

        let mut outcome = LoadOutcome::default();
        for (file, rows) in decoded {
            // Re-checked under the lock; history may have changed while reading.
            match rows {
                Some(rows) if !table.history.contains(&file) => {
                    table.history.insert(file);
                    outcome.rows_loaded += rows.len() as u64;
                    table.rows.extend(rows);
                }
                _ => outcome.files_skipped += 1,
            }
        }
        Ok(outcome)
    }

    fn already_loaded(&self, qualified: &str, file: &str) -> Result<bool, WarehouseError> {
        let state = self.lock();
        let table = state
            .tables
            .get(qualified)
            .ok_or_else(|| missing_table(qualified))?;
        Ok(table.history.contains(file))
    }
}

fn missing_table(qualified: &str) -> WarehouseError {
    WarehouseError::Statement {
        code: "002003".to_string(),
        message: format!("Table '{qualified}' does not exist"),
    }
}

#[async_trait]
impl Warehouse for MemoryWarehouse {
    async fn describe_table(
        &self,
        table: &TargetTable,
    ) -> Result<Option<Vec<(String, String)>>, WarehouseError> {
        Ok(self
            .lock()
            .tables
            .get(&table.qualified_name())
            .map(|t| t.columns.clone()))
    }

    async fn create_table(&self, table: &TargetTable) -> Result<(), WarehouseError> {
        let mut state = self.lock();
        let qualified = table.qualified_name();
        if !state.tables.contains_key(&qualified) {
            let columns = table
                .columns
                .columns()
                .iter()
                .map(|c| (c.name.to_string(), c.column_type.sql().to_string()))
                .collect();
            state.tables.insert(
                qualified,
                Table {
                    columns,
                    ..Table::default()
                },
            );
            state.create_calls += 1;
        }
        Ok(())
    }

    async fn count_rows(&self, table: &TargetTable) -> Result<u64, WarehouseError> {
        let qualified = table.qualified_name();
        let state = self.lock();
        let table = state
            .tables
            .get(&qualified)
            .ok_or_else(|| missing_table(&qualified))?;
        Ok(table.rows.len() as u64)
    }

    async fn copy_into(
        &self,
        table: &TargetTable,
        request: &CopyRequest,
    ) -> Result<LoadOutcome, WarehouseError> {
        self.load_files(&table.qualified_name(), &request.files).await
    }

    async fn ingest_via_pipe(
        &self,
        pipe: &str,
        files: &[String],
    ) -> Result<LoadOutcome, WarehouseError> {
        let target = self.lock().pipes.get(pipe).cloned();
        let Some(qualified) = target else {
            return Err(WarehouseError::WarehouseStatus {
                status: 404,
                message: format!("pipe {pipe} not found"),
            });
        };
        self.load_files(&qualified, files).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CreateDisposition, WriteDisposition};
    use crate::loader::StagingArea;
    use crate::mapper::ColumnValue;
    use crate::storage::StorageProvider;
    use std::collections::HashMap;
    use std::sync::Arc;
    use tempfile::TempDir;

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

    fn row(id: &str) -> ColumnTuple {
        ColumnTuple(vec![
            ColumnValue::String(id.to_string()),
            ColumnValue::String("n".to_string()),
            ColumnValue::Integer(1),
            ColumnValue::Float(1.5),
        ])
    }

    async fn setup() -> (TempDir, StagingArea, MemoryWarehouse) {
        let temp_dir = TempDir::new().unwrap();
        let storage = Arc::new(
            StorageProvider::for_url_with_options(temp_dir.path().to_str().unwrap(), HashMap::new())
                .await
                .unwrap(),
        );
        let warehouse = MemoryWarehouse::new(storage.clone());
        (temp_dir, StagingArea::new(storage), warehouse)
    }

    #[tokio::test]
    async fn test_copy_dedups_by_file_name() {
        let (_dir, staging, warehouse) = setup().await;
        let table = target();
        warehouse.ensure_table(&table).await.unwrap();

        let file = staging.prepare(1, &[row("a"), row("b")]).unwrap();
        staging.upload(&file).await.unwrap();
        let request = CopyRequest {
            location: staging.external_root(),
            files: vec![file.path.to_string()],
            storage_integration: "INT".to_string(),
        };

        let first = warehouse.copy_into(&table, &request).await.unwrap();
        assert_eq!(first.rows_loaded, 2);
        let second = warehouse.copy_into(&table, &request).await.unwrap();
        assert_eq!(second.rows_loaded, 0);
        assert_eq!(second.files_skipped, 1);
        assert_eq!(warehouse.rows("DB.PUBLIC.EVENTS").len(), 2);
    }

    #[tokio::test]
    async fn test_injected_failures_are_counted() {
        let (_dir, staging, warehouse) = setup().await;
        let table = target();
        warehouse.ensure_table(&table).await.unwrap();
        warehouse.fail_next_loads(1);

        let request = CopyRequest {
            location: staging.external_root(),
            files: vec![],
            storage_integration: "INT".to_string(),
        };
        let err = warehouse.copy_into(&table, &request).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(warehouse.copy_into(&table, &request).await.is_ok());
        assert_eq!(warehouse.load_calls(), 2);
    }

    #[tokio::test]
    async fn test_ensure_table_policies() {
        let (_dir, _staging, warehouse) = setup().await;
        let mut table = target();

        table.create_disposition = CreateDisposition::CreateNever;
        let err = warehouse.ensure_table(&table).await.unwrap_err();
        assert!(matches!(err, WarehouseError::TableMissing { .. }));

        table.create_disposition = CreateDisposition::CreateIfNeeded;
        warehouse.ensure_table(&table).await.unwrap();
        warehouse.insert_rows("DB.PUBLIC.EVENTS", vec![row("x")]);

        table.write_disposition = WriteDisposition::Empty;
        let err = warehouse.ensure_table(&table).await.unwrap_err();
        assert!(matches!(err, WarehouseError::TableNotEmpty { rows: 1, .. }));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_unknown_pipe() {
        let (_dir, _staging, warehouse) = setup().await;
        let err = warehouse
            .ingest_via_pipe("NOPE", &["a.csv.gz".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, WarehouseError::WarehouseStatus { status: 404, .. }));
    }
}
