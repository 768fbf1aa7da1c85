//! Snowflake over its REST APIs.
//!
//! Statements go through the SQL API (`/api/v2/statements`); long-running
//! statements answer 202 and are polled by handle. Continuous loading goes
//! through the Snowpipe REST API (`insertFiles`, then `insertReport` until
//! every submitted file is reported).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use snafu::prelude::*;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::{AuthType, SinkConfig};
use crate::error::{WarehouseClientSnafu, WarehouseError, WarehouseHttpSnafu};
use crate::loader::codec::FILE_FORMAT;

use super::{CopyRequest, LoadOutcome, TargetTable, Warehouse};

const STATEMENT_POLL_INITIAL: Duration = Duration::from_millis(250);
const STATEMENT_POLL_MAX: Duration = Duration::from_secs(5);
const PIPE_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Serialize)]
struct StatementRequest<'a> {
    statement: &'a str,
    timeout: u64,
    database: &'a str,
    schema: &'a str,
    role: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    warehouse: Option<&'a str>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct StatementResponse {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    statement_handle: Option<String>,
    #[serde(default)]
    result_set_meta_data: Option<ResultSetMetaData>,
    #[serde(default)]
    data: Vec<Vec<Value>>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct ResultSetMetaData {
    #[serde(default)]
    row_type: Vec<ColumnMeta>,
}

#[derive(Deserialize)]
struct ColumnMeta {
    name: String,
}

/// Result rows keyed by lower-cased column name.
#[derive(Debug, Default)]
struct ResultSet {
    rows: Vec<HashMap<String, Option<String>>>,
}

impl From<StatementResponse> for ResultSet {
    fn from(response: StatementResponse) -> Self {
        let names: Vec<String> = response
            .result_set_meta_data
            .map(|meta| {
                meta.row_type
                    .into_iter()
                    .map(|c| c.name.to_ascii_lowercase())
                    .collect()
            })
            .unwrap_or_default();

        let rows = response
            .data
            .into_iter()
            .map(|row| {
                names
                    .iter()
                    .cloned()
                    .zip(row.into_iter().map(|v| match v {
                        Value::Null => None,
                        Value::String(s) => Some(s),
                        other => Some(other.to_string()),
                    }))
                    .collect()
            })
            .collect();
        Self { rows }
    }
}

fn cell<'a>(row: &'a HashMap<String, Option<String>>, name: &str) -> Option<&'a str> {
    row.get(name).and_then(|v| v.as_deref())
}

#[derive(Serialize)]
struct InsertFilesRequest<'a> {
    files: Vec<InsertFile<'a>>,
}

#[derive(Serialize)]
struct InsertFile<'a> {
    path: &'a str,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct InsertReport {
    #[serde(default)]
    next_begin_mark: Option<String>,
    #[serde(default)]
    files: Vec<InsertReportFile>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct InsertReportFile {
    path: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    rows_inserted: u64,
    #[serde(default)]
    first_error: Option<String>,
}

/// Snowflake client for one account, database and role.
pub struct SnowflakeWarehouse {
    client: reqwest::Client,
    base_url: String,
    token: String,
    auth_type: AuthType,
    role: String,
    database: String,
    schema: String,
    warehouse: Option<String>,
    confirm_timeout: Duration,
}

impl SnowflakeWarehouse {
    pub fn new(sink: &SinkConfig) -> Result<Self, WarehouseError> {
        let client = reqwest::Client::builder()
            .timeout(sink.request_timeout())
            .user_agent(concat!("snowdrift/", env!("CARGO_PKG_VERSION")))
            .build()
            .context(WarehouseClientSnafu)?;

        let server = sink.server_name.trim_end_matches('/');
        let base_url = if server.starts_with("http://") || server.starts_with("https://") {
            server.to_string()
        } else {
            format!("https://{server}")
        };

        Ok(Self {
            client,
            base_url,
            token: sink.auth.token.clone(),
            auth_type: sink.auth.auth_type,
            role: sink.role.clone(),
            database: sink.database.clone(),
            schema: sink.schema.clone(),
            warehouse: sink.warehouse.clone(),
            confirm_timeout: sink.confirm_timeout(),
        })
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        request
            .bearer_auth(&self.token)
            .header(
                "X-Snowflake-Authorization-Token-Type",
                self.auth_type.header_value(),
            )
            .header(reqwest::header::ACCEPT, "application/json")
    }

    /// Run one SQL statement to completion.
    async fn execute(&self, sql: &str) -> Result<ResultSet, WarehouseError> {
        debug!(statement = %sql, "Executing statement");
        let body = StatementRequest {
            statement: sql,
            timeout: self.confirm_timeout.as_secs(),
            database: &self.database,
            schema: &self.schema,
            role: &self.role,
            warehouse: self.warehouse.as_deref(),
        };
        let request = self
            .client
            .post(format!("{}/api/v2/statements", self.base_url))
            .query(&[("requestId", Uuid::new_v4().to_string())])
            .json(&body);
        let response = self
            .authorized(request)
            .send()
            .await
            .context(WarehouseHttpSnafu)?;

        let deadline = Instant::now() + self.confirm_timeout;
        let mut delay = STATEMENT_POLL_INITIAL;
        let mut outcome = statement_outcome(response).await?;
        loop {
            match outcome {
                StatementProgress::Done(response) => return Ok(ResultSet::from(*response)),
                StatementProgress::Running(handle) => {
                    if Instant::now() + delay > deadline {
                        return Err(WarehouseError::StatementTimeout {
                            handle,
                            secs: self.confirm_timeout.as_secs(),
                        });
                    }
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(STATEMENT_POLL_MAX);

                    let request = self
                        .client
                        .get(format!("{}/api/v2/statements/{}", self.base_url, handle));
                    let response = self
                        .authorized(request)
                        .send()
                        .await
                        .context(WarehouseHttpSnafu)?;
                    outcome = statement_outcome(response).await?;
                }
            }
        }
    }

    fn sql_string(value: &str) -> String {
        format!("'{}'", value.replace('\\', "\\\\").replace('\'', "''"))
    }

    fn pipe_url(&self, pipe: &str, action: &str) -> String {
        format!("{}/v1/data/pipes/{}/{}", self.base_url, pipe, action)
    }

    async fn insert_files(&self, pipe: &str, files: &[String]) -> Result<(), WarehouseError> {
        let body = InsertFilesRequest {
            files: files.iter().map(|path| InsertFile { path }).collect(),
        };
        let request = self
            .client
            .post(self.pipe_url(pipe, "insertFiles"))
            .query(&[("requestId", Uuid::new_v4().to_string())])
            .json(&body);
        let response = self
            .authorized(request)
            .send()
            .await
            .context(WarehouseHttpSnafu)?;
        ensure_success(response).await?;
        Ok(())
    }

    async fn insert_report(
        &self,
        pipe: &str,
        begin_mark: Option<&str>,
    ) -> Result<InsertReport, WarehouseError> {
        let mut request = self
            .client
            .get(self.pipe_url(pipe, "insertReport"))
            .query(&[("requestId", Uuid::new_v4().to_string())]);
        if let Some(mark) = begin_mark {
            request = request.query(&[("beginMark", mark)]);
        }
        let response = self
            .authorized(request)
            .send()
            .await
            .context(WarehouseHttpSnafu)?;
        let response = ensure_success(response).await?;
        response.json().await.context(WarehouseHttpSnafu)
    }
}

enum StatementProgress {
    Done(Box<StatementResponse>),
    Running(String),
}

async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response, WarehouseError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = response.text().await.unwrap_or_default();
    Err(WarehouseError::WarehouseStatus {
        status: status.as_u16(),
        message,
    })
}

async fn statement_outcome(
    response: reqwest::Response,
) -> Result<StatementProgress, WarehouseError> {
    let status = response.status().as_u16();
    match status {
        200 => {
            let body: StatementResponse = response.json().await.context(WarehouseHttpSnafu)?;
            Ok(StatementProgress::Done(Box::new(body)))
        }
        202 => {
            let body: StatementResponse = response.json().await.context(WarehouseHttpSnafu)?;
            match body.statement_handle {
                Some(handle) => Ok(StatementProgress::Running(handle)),
                None => Err(WarehouseError::WarehouseStatus {
                    status,
                    message: "accepted statement has no handle".to_string(),
                }),
            }
        }
        422 => {
            let body: StatementResponse = response.json().await.unwrap_or_default();
            Err(WarehouseError::Statement {
                code: body.code.unwrap_or_default(),
                message: body.message.unwrap_or_default(),
            })
        }
        _ => {
            let message = response.text().await.unwrap_or_default();
            Err(WarehouseError::WarehouseStatus { status, message })
        }
    }
}

/// Sum a COPY result. A COPY that finds nothing new returns a single
/// status row without a `file` column.
fn copy_outcome(result: &ResultSet, requested: usize) -> Result<LoadOutcome, WarehouseError> {
    let mut outcome = LoadOutcome::default();
    let mut loaded_files = 0;
    for row in &result.rows {
        let Some(file) = cell(row, "file") else {
            continue;
        };
        match cell(row, "status").unwrap_or_default() {
            "LOADED" => {
                loaded_files += 1;
                outcome.rows_loaded += cell(row, "rows_loaded")
                    .and_then(|v| v.parse::<u64>().ok())
                    .unwrap_or_default();
            }
            other => {
                return Err(WarehouseError::LoadRejected {
                    file: file.to_string(),
                    message: format!(
                        "{other}: {}",
                        cell(row, "first_error").unwrap_or("no error reported")
                    ),
                });
            }
        }
    }
    outcome.files_skipped = requested.saturating_sub(loaded_files);
    Ok(outcome)
}

#[async_trait]
impl Warehouse for SnowflakeWarehouse {
    async fn describe_table(
        &self,
        table: &TargetTable,
    ) -> Result<Option<Vec<(String, String)>>, WarehouseError> {
        let sql = format!(
            "SELECT column_name, data_type, numeric_precision, numeric_scale \
             FROM {}.information_schema.columns \
             WHERE table_schema = UPPER({}) AND table_name = UPPER({}) \
             ORDER BY ordinal_position",
            table.database,
            Self::sql_string(&table.schema),
            Self::sql_string(&table.name),
        );
        let result = self.execute(&sql).await?;
        if result.rows.is_empty() {
            return Ok(None);
        }

        let columns = result
            .rows
            .iter()
            .map(|row| {
                let name = cell(row, "column_name").unwrap_or_default().to_string();
                let data_type = cell(row, "data_type").unwrap_or_default();
                let reported = match (
                    cell(row, "numeric_precision"),
                    cell(row, "numeric_scale"),
                ) {
                    (Some(p), Some(s)) if data_type == "NUMBER" => format!("NUMBER({p},{s})"),
                    _ => data_type.to_string(),
                };
                (name, reported)
            })
            .collect();
        Ok(Some(columns))
    }

    async fn create_table(&self, table: &TargetTable) -> Result<(), WarehouseError> {
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {} ({})",
            table.qualified_name(),
            table.columns.ddl_columns()
        );
        self.execute(&sql).await?;
        Ok(())
    }

    async fn count_rows(&self, table: &TargetTable) -> Result<u64, WarehouseError> {
        let sql = format!("SELECT COUNT(*) AS row_count FROM {}", table.qualified_name());
        let result = self.execute(&sql).await?;
        Ok(result
            .rows
            .first()
            .and_then(|row| cell(row, "row_count"))
            .and_then(|v| v.parse().ok())
            .unwrap_or_default())
    }

    async fn copy_into(
        &self,
        table: &TargetTable,
        request: &CopyRequest,
    ) -> Result<LoadOutcome, WarehouseError> {
        let files = request
            .files
            .iter()
            .map(|f| Self::sql_string(f))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "COPY INTO {} FROM {} STORAGE_INTEGRATION = {} FILES = ({}) \
             FILE_FORMAT = ({}) ON_ERROR = ABORT_STATEMENT",
            table.qualified_name(),
            Self::sql_string(&request.location),
            request.storage_integration,
            files,
            FILE_FORMAT
        );
        let result = self.execute(&sql).await?;
        copy_outcome(&result, request.files.len())
    }

    async fn ingest_via_pipe(
        &self,
        pipe: &str,
        files: &[String],
    ) -> Result<LoadOutcome, WarehouseError> {
        self.insert_files(pipe, files).await?;

        let mut pending: HashSet<&str> = files.iter().map(String::as_str).collect();
        let mut outcome = LoadOutcome::default();
        let mut begin_mark: Option<String> = None;
        let deadline = Instant::now() + self.confirm_timeout;

        // The first report covers recent history, so a file already loaded
        // by an earlier attempt is confirmed here as well.
        while !pending.is_empty() {
            let report = self.insert_report(pipe, begin_mark.as_deref()).await?;
            for entry in &report.files {
                if !pending.contains(entry.path.as_str()) {
                    continue;
                }
                match entry.status.as_str() {
                    "LOADED" => {
                        pending.remove(entry.path.as_str());
                        outcome.rows_loaded += entry.rows_inserted;
                    }
                    "LOAD_FAILED" | "PARTIALLY_LOADED" => {
                        return Err(WarehouseError::LoadRejected {
                            file: entry.path.clone(),
                            message: format!(
                                "{}: {}",
                                entry.status,
                                entry.first_error.as_deref().unwrap_or("no error reported")
                            ),
                        });
                    }
                    _ => {}
                }
            }
            if report.next_begin_mark.is_some() {
                begin_mark = report.next_begin_mark;
            }
            if pending.is_empty() {
                break;
            }
            if Instant::now() + PIPE_POLL_INTERVAL > deadline {
                let mut remaining: Vec<&str> = pending.into_iter().collect();
                remaining.sort_unstable();
                return Err(WarehouseError::PipeUnconfirmed {
                    pipe: pipe.to_string(),
                    file: remaining.join(", "),
                    secs: self.confirm_timeout.as_secs(),
                });
            }
            tokio::time::sleep(PIPE_POLL_INTERVAL).await;
        }

        info!(pipe, files = files.len(), rows = outcome.rows_loaded, "Pipe confirmed load");
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(body: &str) -> ResultSet {
        let response: StatementResponse = serde_json::from_str(body).unwrap();
        ResultSet::from(response)
    }

    #[test]
    fn test_copy_result_sums_loaded_rows() {
        let result = result(
            r#"{
                "resultSetMetaData": {"rowType": [
                    {"name": "file"}, {"name": "status"}, {"name": "rows_parsed"},
                    {"name": "rows_loaded"}, {"name": "first_error"}
                ]},
                "data": [
                    ["gcs://b/p/a.csv.gz", "LOADED", "3", "3", null],
                    ["gcs://b/p/b.csv.gz", "LOADED", "2", "2", null]
                ]
            }"#,
        );
        let outcome = copy_outcome(&result, 2).unwrap();
        assert_eq!(outcome.rows_loaded, 5);
        assert_eq!(outcome.files_skipped, 0);
    }

    #[test]
    fn test_copy_result_with_nothing_new() {
        let result = result(
            r#"{
                "resultSetMetaData": {"rowType": [{"name": "status"}]},
                "data": [["Copy executed with 0 files processed."]]
            }"#,
        );
        let outcome = copy_outcome(&result, 1).unwrap();
        assert_eq!(outcome.rows_loaded, 0);
        assert_eq!(outcome.files_skipped, 1);
    }

    #[test]
    fn test_copy_result_failure() {
        let result = result(
            r#"{
                "resultSetMetaData": {"rowType": [
                    {"name": "file"}, {"name": "status"}, {"name": "first_error"}
                ]},
                "data": [["a.csv.gz", "LOAD_FAILED", "Numeric value 'x' is not recognized"]]
            }"#,
        );
        let err = copy_outcome(&result, 1).unwrap_err();
        assert!(err.to_string().contains("is not recognized"));
    }

    #[test]
    fn test_sql_string_escaping() {
        assert_eq!(SnowflakeWarehouse::sql_string("o'brien"), "'o''brien'");
        assert_eq!(SnowflakeWarehouse::sql_string(r"a\b"), r"'a\\b'");
    }

    #[test]
    fn test_insert_report_parsing() {
        let report: InsertReport = serde_json::from_str(
            r#"{
                "pipe": "DB.PUBLIC.EVENTS_PIPE",
                "completeResult": true,
                "nextBeginMark": "1_16",
                "files": [{
                    "path": "2026/10/16/batch-000000000001-x.csv.gz",
                    "status": "LOADED",
                    "rowsInserted": 100,
                    "rowsParsed": 100
                }]
            }"#,
        )
        .unwrap();
        assert_eq!(report.next_begin_mark.as_deref(), Some("1_16"));
        assert_eq!(report.files[0].rows_inserted, 100);
    }
}
