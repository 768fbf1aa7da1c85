//! Message sources.
//!
//! A source delivers [`RawMessage`]s from a subscription and takes
//! acknowledgements back. Delivery is at-least-once: anything pulled and not
//! acknowledged is delivered again later, which is how the pipeline
//! recovers from crashes and failed loads.

mod lease;
mod memory;
mod pubsub;

pub use lease::{LeaseKeeper, LeasePolicy};
pub use memory::MemorySource;
pub use pubsub::PubSubSource;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt;
use std::time::Duration;

use crate::error::SourceError;

/// Opaque handle used to acknowledge one delivery of a message.
///
/// A redelivered message gets a fresh handle; an old handle may no longer
/// be honoured by the subscription.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AckId(String);

impl AckId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AckId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One delivered message.
#[derive(Debug, Clone)]
pub struct RawMessage {
    /// Message payload, expected to be UTF-8 JSON.
    pub payload: Vec<u8>,
    pub ack_id: AckId,
    /// Identifier assigned at publish time, stable across redeliveries.
    pub message_id: String,
    pub publish_time: Option<DateTime<Utc>>,
    /// 1 for the first delivery when the subscription reports it.
    pub delivery_attempt: Option<u32>,
}

/// A subscription that can be pulled from and acknowledged to.
#[async_trait]
pub trait MessageSource: Send + Sync {
    /// Pull up to `max_messages`. An empty result means nothing is ready.
    async fn pull(&self, max_messages: usize) -> Result<Vec<RawMessage>, SourceError>;

    /// Acknowledge messages so they are never delivered again.
    async fn ack(&self, ack_ids: &[AckId]) -> Result<(), SourceError>;

    /// Return messages for immediate redelivery.
    async fn nack(&self, ack_ids: &[AckId]) -> Result<(), SourceError>;

    /// Push the redelivery deadline of leased messages to `lease` from now.
    /// Ids whose lease already expired are ignored.
    async fn extend(&self, ack_ids: &[AckId], lease: Duration) -> Result<(), SourceError>;

    /// Name used in logs.
    fn name(&self) -> &str;
}
