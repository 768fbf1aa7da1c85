//! Error types for snowdrift using snafu.
//!
//! Each concern gets its own error enum with context selectors. The
//! top-level [`PipelineError`] aggregates them for the binary.

use snafu::prelude::*;

// ============ Storage Errors ============

/// Errors that can occur during object storage operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum StorageError {
    /// Invalid storage URL format.
    #[snafu(display("Invalid storage URL: {url}"))]
    InvalidUrl { url: String },

    /// Object store operation failed.
    #[snafu(display("Storage operation failed: {source}"))]
    ObjectStore { source: object_store::Error },

    /// IO error during storage operations.
    #[snafu(display("IO error: {source}"))]
    Io { source: std::io::Error },

    /// S3 configuration error.
    #[snafu(display("S3 configuration error: {source}"))]
    S3Config { source: object_store::Error },

    /// GCS configuration error.
    #[snafu(display("GCS configuration error: {source}"))]
    GcsConfig { source: object_store::Error },
}

// ============ Config Errors ============

/// Errors that can occur during configuration parsing and validation.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ConfigError {
    /// A required setting is missing or empty.
    #[snafu(display("Missing required setting: {field}"))]
    MissingField { field: &'static str },

    /// Subscription does not look like `projects/<project>/subscriptions/<name>`.
    #[snafu(display(
        "Invalid subscription '{subscription}': expected projects/<project>/subscriptions/<name>"
    ))]
    InvalidSubscription { subscription: String },

    /// Continuous loading needs a pipe to submit files to.
    #[snafu(display("sink.continuous is enabled but sink.snow_pipe is not set"))]
    MissingSnowPipe,

    /// A numeric setting is out of its allowed range.
    #[snafu(display("Invalid value for {field}: {message}"))]
    InvalidValue {
        field: &'static str,
        message: String,
    },

    /// Environment variable interpolation failed.
    #[snafu(display("Environment variable interpolation failed:\n{message}"))]
    EnvInterpolation { message: String },

    /// Failed to parse YAML configuration.
    #[snafu(display("Failed to parse YAML: {source}"))]
    YamlParse { source: serde_yaml::Error },

    /// Failed to read configuration file.
    #[snafu(display("Failed to read configuration file: {source}"))]
    ReadFile { source: std::io::Error },
}

// ============ Source Errors ============

/// Errors raised by a message source while pulling or acknowledging.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum SourceError {
    /// HTTP transport failure talking to the subscription endpoint.
    #[snafu(display("Pub/Sub request to {operation} failed: {source}"))]
    SourceHttp {
        operation: &'static str,
        source: reqwest::Error,
    },

    /// The endpoint answered with a non-success status.
    #[snafu(display("Pub/Sub {operation} returned HTTP {status}: {body}"))]
    SourceStatus {
        operation: &'static str,
        status: u16,
        body: String,
    },

    /// A delivered message could not be decoded from the wire format.
    #[snafu(display("Failed to decode message {message_id}: {source}"))]
    PayloadDecode {
        message_id: String,
        source: base64::DecodeError,
    },

    /// Failed to build the HTTP client.
    #[snafu(display("Failed to build Pub/Sub client: {source}"))]
    SourceClient { source: reqwest::Error },
}

// ============ Warehouse Errors ============

/// Errors raised by the warehouse while preparing the table or loading files.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum WarehouseError {
    /// HTTP transport failure talking to the warehouse.
    #[snafu(display("Warehouse request failed: {source}"))]
    WarehouseHttp { source: reqwest::Error },

    /// Warehouse answered with a non-success status (quota, availability, auth).
    #[snafu(display("Warehouse returned HTTP {status}: {message}"))]
    WarehouseStatus { status: u16, message: String },

    /// A SQL statement failed to compile or execute.
    #[snafu(display("Statement failed ({code}): {message}"))]
    Statement { code: String, message: String },

    /// A statement did not finish within the configured timeout.
    #[snafu(display("Statement {handle} did not complete within {secs}s"))]
    StatementTimeout { handle: String, secs: u64 },

    /// The warehouse refused the rows in a staged file.
    #[snafu(display("Load of {file} was rejected: {message}"))]
    LoadRejected { file: String, message: String },

    /// The pipe accepted a file but has not confirmed loading it yet.
    #[snafu(display("Pipe {pipe} has not confirmed {file} within {secs}s"))]
    PipeUnconfirmed {
        pipe: String,
        file: String,
        secs: u64,
    },

    /// The existing table is incompatible with the fixed schema.
    #[snafu(display("Table {table} has an incompatible schema: {details}"))]
    SchemaDrift { table: String, details: String },

    /// The table does not exist and the creation policy forbids creating it.
    #[snafu(display("Table {table} does not exist and create_disposition is create_never"))]
    TableMissing { table: String },

    /// The table holds rows but the write policy requires it to be empty.
    #[snafu(display("Table {table} is not empty ({rows} rows) and write_disposition is empty"))]
    TableNotEmpty { table: String, rows: u64 },

    /// Staged file could not be read back (in-process warehouse only).
    #[snafu(display("Failed to read staged file {file}: {source}"))]
    StagedRead { file: String, source: StorageError },

    /// Staged file content could not be decoded.
    #[snafu(display("Failed to decode staged file {file}: {source}"))]
    StagedDecode { file: String, source: CodecError },

    /// Injected failure (in-process warehouse fault injection).
    #[snafu(display("Injected load failure"))]
    InjectedFailure,

    /// Failed to build the HTTP client.
    #[snafu(display("Failed to build warehouse client: {source}"))]
    WarehouseClient { source: reqwest::Error },
}

impl WarehouseError {
    /// Whether retrying the same request can succeed.
    ///
    /// Schema and policy violations are permanent; compile errors in a
    /// statement will not fix themselves either.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            WarehouseError::SchemaDrift { .. }
                | WarehouseError::TableMissing { .. }
                | WarehouseError::TableNotEmpty { .. }
                | WarehouseError::Statement { .. }
                | WarehouseError::StagedDecode { .. }
                | WarehouseError::WarehouseClient { .. }
        )
    }
}

// ============ Codec Errors ============

/// Errors produced while encoding or decoding staged CSV files.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum CodecError {
    /// CSV writer/reader failure.
    #[snafu(display("CSV error: {source}"))]
    Csv { source: csv::Error },

    /// Gzip stream failure.
    #[snafu(display("Gzip error: {source}"))]
    Gzip { source: std::io::Error },

    /// A CSV record does not have one field per column.
    #[snafu(display("Row {row} has {found} fields, expected {expected}"))]
    FieldCount {
        row: usize,
        found: usize,
        expected: usize,
    },

    /// A CSV field does not parse as its column type.
    #[snafu(display("Row {row}, column {column}: cannot parse '{value}'"))]
    FieldValue {
        row: usize,
        column: String,
        value: String,
    },
}

// ============ Staging Errors ============

/// Errors that can occur while writing or removing staged files.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum StagingError {
    /// Failed to create the staging storage provider.
    #[snafu(display("Failed to open staging area {url}: {source}"))]
    StagingOpen { url: String, source: StorageError },

    /// Failed to encode a batch.
    #[snafu(display("Failed to encode batch {sequence}: {source}"))]
    Encode { sequence: u64, source: CodecError },

    /// Failed to upload a staged file.
    #[snafu(display("Failed to upload staged file {file}: {source}"))]
    Upload { file: String, source: StorageError },

    /// Failed to delete a staged file.
    #[snafu(display("Failed to delete staged file {file}: {source}"))]
    Delete { file: String, source: StorageError },
}

// ============ Metrics Errors ============

/// Errors that can occur during metrics initialization.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum MetricsError {
    /// Failed to initialize Prometheus recorder.
    #[snafu(display("Failed to initialize Prometheus recorder: {source}"))]
    PrometheusInit {
        source: metrics_exporter_prometheus::BuildError,
    },
}

// ============ DLQ Errors ============

/// Errors that can occur during Dead Letter Queue operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
// Prefix is intentional to avoid snafu selector conflicts (e.g., WriteSnafu)
#[allow(clippy::enum_variant_names)]
pub enum DlqError {
    /// Failed to write to DLQ.
    #[snafu(display("Failed to write to DLQ: {source}"))]
    DlqWrite { source: StorageError },

    /// Failed to serialize a rejected message record.
    #[snafu(display("Failed to serialize DLQ record: {source}"))]
    DlqSerialize { source: serde_json::Error },

    /// Failed to create DLQ storage provider.
    #[snafu(display("Failed to create DLQ storage: {source}"))]
    DlqStorage { source: StorageError },
}

// ============ Loader Errors ============

/// Fatal errors from the warehouse loader.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum LoaderError {
    /// Table bootstrap failed (drift, policy violation, or retries exhausted).
    #[snafu(display("Failed to prepare table {table}: {source}"))]
    PrepareTable {
        table: String,
        source: WarehouseError,
    },

    /// Staging upload kept failing.
    #[snafu(display("Staging batch {sequence} failed after {attempts} attempt(s): {source}"))]
    StagingRetriesExhausted {
        sequence: u64,
        attempts: u32,
        source: StagingError,
    },

    /// Encoding a batch failed.
    #[snafu(display("Failed to encode batch: {source}"))]
    EncodeBatch { source: StagingError },

    /// Loading a staged file kept failing. The staged file is left in place.
    #[snafu(display(
        "Load of staged file {file} failed after {attempts} attempt(s), file preserved for recovery: {source}"
    ))]
    LoadRetriesExhausted {
        file: String,
        attempts: u32,
        source: WarehouseError,
    },
}

// ============ Pipeline Error (top-level) ============

/// Top-level pipeline errors that aggregate all error types.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum PipelineError {
    /// Configuration error.
    #[snafu(display("Configuration error: {source}"))]
    Config { source: ConfigError },

    /// Message source could not be constructed.
    #[snafu(display("Source error: {source}"))]
    Source { source: SourceError },

    /// Warehouse client could not be constructed.
    #[snafu(display("Warehouse error: {source}"))]
    Warehouse { source: WarehouseError },

    /// Staging area could not be opened.
    #[snafu(display("Staging error: {source}"))]
    Staging { source: StagingError },

    /// Loader failed fatally.
    #[snafu(display("Loader error: {source}"))]
    Loader { source: LoaderError },

    /// DLQ error.
    #[snafu(display("DLQ error: {source}"))]
    Dlq { source: DlqError },

    /// Task join error.
    #[snafu(display("Task join error: {source}"))]
    TaskJoin { source: tokio::task::JoinError },

    /// Address parsing error.
    #[snafu(display("Failed to parse metrics address: {source}"))]
    AddressParse { source: std::net::AddrParseError },

    /// Metrics error.
    #[snafu(display("Metrics error: {source}"))]
    Metrics { source: MetricsError },

    /// Max rejected messages exceeded.
    #[snafu(display("Max failures exceeded: {count} rejected messages"))]
    MaxFailuresExceeded { count: usize },
}
