//! Batch accumulation with size and latency bounds.

use std::time::Duration;
use tokio::time::Instant;

use crate::mapper::ColumnTuple;
use crate::source::AckId;

/// When a buffer must be flushed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushPolicy {
    /// Flush as soon as this many rows are buffered.
    pub max_rows: usize,
    /// Flush once the oldest buffered row is this old.
    pub max_latency: Duration,
}

/// A row on its way to the loader, with the handle that acknowledges it.
#[derive(Debug, Clone)]
pub struct PendingRow {
    pub row: ColumnTuple,
    pub ack_id: AckId,
}

/// Rows taken out of the buffer for one flush.
#[derive(Debug, Clone, Default)]
pub struct Batch {
    pub rows: Vec<ColumnTuple>,
    pub ack_ids: Vec<AckId>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Single-owner row accumulator.
#[derive(Debug)]
pub struct BatchBuffer {
    policy: FlushPolicy,
    batch: Batch,
    oldest: Option<Instant>,
}

impl BatchBuffer {
    pub fn new(policy: FlushPolicy) -> Self {
        Self {
            policy,
            batch: Batch::default(),
            oldest: None,
        }
    }

    /// Add a row. Returns true once the buffer is full.
    pub fn push(&mut self, pending: PendingRow) -> bool {
        if self.oldest.is_none() {
            self.oldest = Some(Instant::now());
        }
        self.batch.rows.push(pending.row);
        self.batch.ack_ids.push(pending.ack_id);
        self.is_full()
    }

    pub fn is_full(&self) -> bool {
        self.batch.len() >= self.policy.max_rows
    }

    pub fn is_empty(&self) -> bool {
        self.batch.is_empty()
    }

    pub fn len(&self) -> usize {
        self.batch.len()
    }

    /// When the oldest buffered row reaches `max_latency`.
    pub fn deadline(&self) -> Option<Instant> {
        self.oldest.map(|oldest| oldest + self.policy.max_latency)
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        self.deadline().is_some_and(|deadline| now >= deadline)
    }

    /// Take everything buffered, leaving the buffer empty.
    pub fn take(&mut self) -> Option<Batch> {
        self.oldest = None;
        let batch = std::mem::take(&mut self.batch);
        (!batch.is_empty()).then_some(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapper::ColumnValue;

    fn pending(i: usize) -> PendingRow {
        PendingRow {
            row: ColumnTuple(vec![ColumnValue::Integer(i as i64)]),
            ack_id: AckId::new(format!("ack-{i}")),
        }
    }

    #[test]
    fn test_full_at_max_rows() {
        let mut buffer = BatchBuffer::new(FlushPolicy {
            max_rows: 3,
            max_latency: Duration::from_secs(5),
        });
        assert!(!buffer.push(pending(0)));
        assert!(!buffer.push(pending(1)));
        assert!(buffer.push(pending(2)));

        let batch = buffer.take().unwrap();
        assert_eq!(batch.len(), 3);
        assert_eq!(batch.ack_ids[2], AckId::new("ack-2"));
        assert!(buffer.is_empty());
        assert!(buffer.deadline().is_none());
        assert!(buffer.take().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_tracks_oldest_row() {
        let mut buffer = BatchBuffer::new(FlushPolicy {
            max_rows: 100,
            max_latency: Duration::from_secs(5),
        });
        assert!(buffer.deadline().is_none());

        let start = Instant::now();
        buffer.push(pending(0));
        tokio::time::advance(Duration::from_secs(3)).await;
        buffer.push(pending(1));

        assert_eq!(buffer.deadline(), Some(start + Duration::from_secs(5)));
        assert!(!buffer.is_expired(Instant::now()));
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(buffer.is_expired(Instant::now()));
    }
}
