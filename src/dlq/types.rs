//! Dead letter records and rejection statistics.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::record::Rejection;
use crate::source::{AckId, RawMessage};

/// One rejected message as written to the dead letter location.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    pub message_id: String,
    /// Payload as received, lossily decoded for non-UTF-8 input.
    pub payload: String,
    /// Short rejection category, e.g. `type_mismatch`.
    pub kind: String,
    /// Human readable rejection reason.
    pub reason: String,
    #[serde(default)]
    pub publish_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub delivery_attempt: Option<u32>,
    pub rejected_at: DateTime<Utc>,
}

impl DeadLetter {
    pub fn new(message: &RawMessage, rejection: &Rejection) -> Self {
        Self {
            message_id: rejection.message_id.clone(),
            payload: rejection.payload.clone(),
            kind: rejection.reason.kind().to_string(),
            reason: rejection.reason.to_string(),
            publish_time: message.publish_time,
            delivery_attempt: message.delivery_attempt,
            rejected_at: Utc::now(),
        }
    }
}

/// Rejection counts by category.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RejectionStats {
    by_kind: BTreeMap<String, usize>,
}

impl RejectionStats {
    pub fn increment(&mut self, kind: &str) {
        *self.by_kind.entry(kind.to_string()).or_default() += 1;
    }

    pub fn total(&self) -> usize {
        self.by_kind.values().sum()
    }

    pub fn get(&self, kind: &str) -> usize {
        self.by_kind.get(kind).copied().unwrap_or_default()
    }

    /// `kind=count` pairs for log lines.
    pub fn summary(&self) -> String {
        self.by_kind
            .iter()
            .map(|(kind, count)| format!("{kind}={count}"))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Dead letters that could not be written, returned to the caller so their
/// messages can be released for redelivery.
#[derive(Debug)]
pub struct UnwrittenDeadLetters {
    pub ack_ids: Vec<AckId>,
    pub error: crate::error::DlqError,
}
