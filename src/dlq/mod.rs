//! Dead Letter Queue for rejected messages.
//!
//! - [`DeadLetterQueue`] buffers rejected messages and writes them as NDJSON
//! - [`FailureTracker`] routes rejections, settles their acks and enforces
//!   `max_failures`

mod queue;
mod tracker;
mod types;

pub use queue::DeadLetterQueue;
pub use tracker::FailureTracker;
pub use types::{DeadLetter, RejectionStats, UnwrittenDeadLetters};
