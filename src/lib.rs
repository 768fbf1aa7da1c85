//! snowdrift: streams JSON messages from a Pub/Sub subscription into a
//! Snowflake table.
//!
//! Messages are parsed into typed records, mapped to table rows, staged as
//! gzip CSV files in object storage and bulk loaded. A message is
//! acknowledged only after the warehouse has committed its row, so delivery
//! is at-least-once. Messages that fail validation go to an optional dead
//! letter location.
//!
//! # Example
//!
//! ```ignore
//! use snafu::ResultExt;
//! use snowdrift::error::{ConfigSnafu, PipelineError};
//! use snowdrift::{Config, run_pipeline};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), PipelineError> {
//!     let config = Config::from_file("config.yaml").context(ConfigSnafu)?;
//!     let stats = run_pipeline(config, CancellationToken::new()).await?;
//!     println!("Loaded {} rows", stats.rows_loaded);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod dlq;
pub mod error;
pub mod loader;
pub mod mapper;
pub mod metrics;
pub mod pipeline;
pub mod record;
pub mod source;
pub mod storage;
pub mod warehouse;

// Re-export main types
pub use config::Config;
pub use pipeline::{Pipeline, PipelineStats, run_pipeline};
pub use storage::{StorageProvider, StorageProviderRef};
