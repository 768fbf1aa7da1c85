//! Configuration loading and validation.
//!
//! Configuration is a YAML document with environment variable interpolation
//! (see [`vars`]). Everything except the connection identifiers has a
//! default.

mod vars;

use serde::{Deserialize, Serialize};
use snafu::prelude::*;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use crate::error::{
    ConfigError, EnvInterpolationSnafu, InvalidSubscriptionSnafu, InvalidValueSnafu,
    MissingFieldSnafu, MissingSnowPipeSnafu, ReadFileSnafu, YamlParseSnafu,
};

/// Main configuration structure for the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub source: SourceConfig,
    pub sink: SinkConfig,
    #[serde(default)]
    pub batching: BatchingConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub error_handling: ErrorHandlingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Subscription to consume from.
#[derive(Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// `projects/<project>/subscriptions/<name>`.
    pub subscription: String,

    /// API root. Falls back to `PUBSUB_EMULATOR_HOST`, then the public endpoint.
    #[serde(default)]
    pub endpoint: Option<String>,

    /// Bearer token for the subscription API. Not needed against the emulator.
    #[serde(default)]
    pub access_token: Option<String>,

    /// Messages requested per pull (default: 100, max 1000).
    #[serde(default = "default_max_messages")]
    pub max_messages: usize,

    /// Concurrent pulling workers (default: 4).
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Pause after a failed or empty pull (default: 1000ms).
    #[serde(default = "default_pull_backoff_ms")]
    pub pull_backoff_ms: u64,

    /// Lease requested on every renewal of a held message, in seconds
    /// (default: 10). Leases are renewed every third of this period.
    #[serde(default = "default_ack_deadline_secs")]
    pub ack_deadline_secs: u64,

    /// Stop renewing a message held longer than this (default: 3600s).
    #[serde(default = "default_max_lease_secs")]
    pub max_lease_secs: u64,
}

impl std::fmt::Debug for SourceConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceConfig")
            .field("subscription", &self.subscription)
            .field("endpoint", &self.endpoint)
            .field(
                "access_token",
                &self.access_token.as_ref().map(|_| "<redacted>"),
            )
            .field("max_messages", &self.max_messages)
            .field("workers", &self.workers)
            .field("pull_backoff_ms", &self.pull_backoff_ms)
            .field("ack_deadline_secs", &self.ack_deadline_secs)
            .field("max_lease_secs", &self.max_lease_secs)
            .finish()
    }
}

fn default_max_messages() -> usize {
    100
}

fn default_workers() -> usize {
    4
}

fn default_pull_backoff_ms() -> u64 {
    1000
}

fn default_ack_deadline_secs() -> u64 {
    10
}

fn default_max_lease_secs() -> u64 {
    3600
}

impl SourceConfig {
    pub fn pull_backoff(&self) -> Duration {
        Duration::from_millis(self.pull_backoff_ms)
    }

    pub fn ack_deadline(&self) -> Duration {
        Duration::from_secs(self.ack_deadline_secs)
    }

    pub fn max_lease(&self) -> Duration {
        Duration::from_secs(self.max_lease_secs)
    }
}

/// Whether the loader may create the target table.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CreateDisposition {
    #[default]
    CreateIfNeeded,
    CreateNever,
}

/// How the loader treats rows already in the target table.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WriteDisposition {
    /// Add rows, never touching existing ones.
    #[default]
    Append,
    /// Refuse to start unless the table is empty.
    Empty,
}

/// Kind of bearer token presented to the warehouse.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuthType {
    #[default]
    Oauth,
    KeyPairJwt,
}

impl AuthType {
    /// Value of the `X-Snowflake-Authorization-Token-Type` header.
    pub fn header_value(&self) -> &'static str {
        match self {
            AuthType::Oauth => "OAUTH",
            AuthType::KeyPairJwt => "KEYPAIR_JWT",
        }
    }
}

/// Pre-issued warehouse credential.
#[derive(Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(rename = "type", default)]
    pub auth_type: AuthType,
    pub token: String,
}

impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthConfig")
            .field("auth_type", &self.auth_type)
            .field("token", &"<redacted>")
            .finish()
    }
}

/// Target table and staging location.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SinkConfig {
    pub database: String,
    pub schema: String,
    pub table: String,
    pub role: String,

    /// Account host, e.g. `xy12345.us-central1.gcp.snowflakecomputing.com`.
    pub server_name: String,

    /// Virtual warehouse to run statements on (optional).
    #[serde(default)]
    pub warehouse: Option<String>,

    /// Bucket staged files are written to (`gs://`, `s3://` or a local path).
    pub staging_bucket: String,

    /// Key prefix inside the staging bucket (default: `snowdrift`).
    #[serde(default = "default_staging_prefix")]
    pub staging_prefix: String,

    /// Storage integration the warehouse uses to read the staging bucket.
    pub storage_integration: String,

    /// Storage options for the staging bucket (credentials, region, etc.)
    #[serde(default)]
    pub storage_options: HashMap<String, String>,

    /// Load continuously through a pipe instead of periodic COPY statements.
    pub continuous: bool,

    /// Pipe name, required when `continuous` is set.
    #[serde(default)]
    pub snow_pipe: Option<String>,

    pub auth: AuthConfig,

    #[serde(default)]
    pub create_disposition: CreateDisposition,

    #[serde(default)]
    pub write_disposition: WriteDisposition,

    /// Per-request HTTP timeout (default: 60s).
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// How long to wait for a statement or pipe to confirm a load (default: 300s).
    #[serde(default = "default_confirm_timeout_secs")]
    pub confirm_timeout_secs: u64,
}

fn default_staging_prefix() -> String {
    "snowdrift".to_string()
}

fn default_request_timeout_secs() -> u64 {
    60
}

fn default_confirm_timeout_secs() -> u64 {
    300
}

impl SinkConfig {
    /// `database.schema.table`.
    pub fn qualified_table(&self) -> String {
        format!("{}.{}.{}", self.database, self.schema, self.table)
    }

    /// Staging URL with the prefix appended.
    pub fn staging_url(&self) -> String {
        let prefix = self.staging_prefix.trim_matches('/');
        if prefix.is_empty() {
            self.staging_bucket.clone()
        } else {
            format!("{}/{}", self.staging_bucket.trim_end_matches('/'), prefix)
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn confirm_timeout(&self) -> Duration {
        Duration::from_secs(self.confirm_timeout_secs)
    }

    /// Fully qualified pipe name. Unqualified names live next to the table.
    pub fn qualified_pipe(&self) -> Option<String> {
        self.snow_pipe
            .as_deref()
            .filter(|pipe| !pipe.is_empty())
            .map(|pipe| {
                if pipe.contains('.') {
                    pipe.to_string()
                } else {
                    format!("{}.{}.{}", self.database, self.schema, pipe)
                }
            })
    }
}

/// Flush cadence and channel sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchingConfig {
    /// Flush as soon as this many rows are buffered (default: 100).
    #[serde(default = "default_max_rows")]
    pub max_rows: usize,

    /// Flush when the oldest buffered row is this old (default: 5000ms).
    #[serde(default = "default_max_latency_ms")]
    pub max_latency_ms: u64,

    /// Latency bound used instead when loading continuously (default: 1000ms).
    #[serde(default = "default_continuous_max_latency_ms")]
    pub continuous_max_latency_ms: u64,

    /// Rows in flight between workers and the loader (default: 1000).
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

impl Default for BatchingConfig {
    fn default() -> Self {
        Self {
            max_rows: default_max_rows(),
            max_latency_ms: default_max_latency_ms(),
            continuous_max_latency_ms: default_continuous_max_latency_ms(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

fn default_max_rows() -> usize {
    100
}

fn default_max_latency_ms() -> u64 {
    5000
}

fn default_continuous_max_latency_ms() -> u64 {
    1000
}

fn default_channel_capacity() -> usize {
    1000
}

/// Backoff for staging uploads, table preparation and loads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts including the first (default: 5).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            multiplier: default_multiplier(),
        }
    }
}

fn default_max_attempts() -> u32 {
    5
}

fn default_initial_backoff_ms() -> u64 {
    500
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

fn default_multiplier() -> f64 {
    2.0
}

/// Handling of messages that fail validation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorHandlingConfig {
    /// Stop after this many rejected messages (0 = unlimited, default: 0).
    #[serde(default)]
    pub max_failures: usize,
    /// Where to write rejected messages. Without it they are logged and dropped.
    #[serde(default)]
    pub dlq_path: Option<String>,
    /// Storage options for the DLQ location.
    #[serde(default)]
    pub dlq_storage_options: HashMap<String, String>,
}

/// Metrics configuration for Prometheus endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,
    #[serde(default = "default_metrics_address")]
    pub address: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            address: default_metrics_address(),
        }
    }
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_metrics_address() -> String {
    "0.0.0.0:9090".to_string()
}

impl Config {
    /// Load configuration from a YAML file, interpolating environment variables.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref()).context(ReadFileSnafu)?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from YAML text, interpolating environment variables.
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        let content = vars::interpolate(content).map_err(|errors| {
            EnvInterpolationSnafu {
                message: errors.join("\n"),
            }
            .build()
        })?;

        let config: Config = serde_yaml::from_str(&content).context(YamlParseSnafu)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let sink = &self.sink;
        let required = [
            ("source.subscription", &self.source.subscription),
            ("sink.database", &sink.database),
            ("sink.schema", &sink.schema),
            ("sink.table", &sink.table),
            ("sink.role", &sink.role),
            ("sink.server_name", &sink.server_name),
            ("sink.staging_bucket", &sink.staging_bucket),
            ("sink.storage_integration", &sink.storage_integration),
            ("sink.auth.token", &sink.auth.token),
        ];
        for (field, value) in required {
            ensure!(!value.trim().is_empty(), MissingFieldSnafu { field });
        }

        let parts: Vec<&str> = self.source.subscription.split('/').collect();
        ensure!(
            parts.len() == 4
                && parts[0] == "projects"
                && parts[2] == "subscriptions"
                && !parts[1].is_empty()
                && !parts[3].is_empty(),
            InvalidSubscriptionSnafu {
                subscription: &self.source.subscription,
            }
        );

        ensure!(
            !sink.continuous || sink.snow_pipe.as_deref().is_some_and(|p| !p.is_empty()),
            MissingSnowPipeSnafu
        );

        ensure!(
            (1..=1000).contains(&self.source.max_messages),
            InvalidValueSnafu {
                field: "source.max_messages",
                message: "must be between 1 and 1000",
            }
        );
        ensure!(
            (1..=600).contains(&self.source.ack_deadline_secs),
            InvalidValueSnafu {
                field: "source.ack_deadline_secs",
                message: "must be between 1 and 600",
            }
        );
        ensure!(
            self.source.workers > 0,
            InvalidValueSnafu {
                field: "source.workers",
                message: "must be at least 1",
            }
        );
        ensure!(
            self.batching.max_rows > 0,
            InvalidValueSnafu {
                field: "batching.max_rows",
                message: "must be at least 1",
            }
        );
        ensure!(
            self.batching.channel_capacity > 0,
            InvalidValueSnafu {
                field: "batching.channel_capacity",
                message: "must be at least 1",
            }
        );
        ensure!(
            self.retry.max_attempts > 0,
            InvalidValueSnafu {
                field: "retry.max_attempts",
                message: "must be at least 1",
            }
        );
        ensure!(
            self.retry.multiplier >= 1.0,
            InvalidValueSnafu {
                field: "retry.multiplier",
                message: format!("{} is below 1.0", self.retry.multiplier),
            }
        );
        Ok(())
    }

    /// Maximum age of the oldest buffered row for the selected load strategy.
    pub fn max_latency(&self) -> Duration {
        if self.sink.continuous {
            Duration::from_millis(self.batching.continuous_max_latency_ms)
        } else {
            Duration::from_millis(self.batching.max_latency_ms)
        }
    }
}
