//! In-process subscription with redelivery.
//!
//! Models the delivery contract of a real subscription: a pulled message is
//! leased for the visibility timeout, an ack removes it for good, a nack or
//! an expired lease makes it deliverable again with a fresh ack id.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::SourceError;

use super::{AckId, MessageSource, RawMessage};

#[derive(Debug, Clone)]
struct Stored {
    message_id: String,
    payload: Vec<u8>,
    deliveries: u32,
}

#[derive(Debug, Default)]
struct State {
    ready: VecDeque<Stored>,
    leased: HashMap<AckId, (Stored, Instant)>,
    acked: Vec<String>,
    next_id: u64,
}

impl State {
    fn expire_leases(&mut self, now: Instant) {
        let expired: Vec<AckId> = self
            .leased
            .iter()
            .filter(|(_, (_, deadline))| *deadline <= now)
            .map(|(ack_id, _)| ack_id.clone())
            .collect();
        for ack_id in expired {
            if let Some((stored, _)) = self.leased.remove(&ack_id) {
                self.ready.push_back(stored);
            }
        }
    }
}

/// In-memory message source.
#[derive(Debug)]
pub struct MemorySource {
    visibility_timeout: Duration,
    state: Mutex<State>,
}

impl MemorySource {
    pub fn new(visibility_timeout: Duration) -> Self {
        Self {
            visibility_timeout,
            state: Mutex::new(State::default()),
        }
    }

    /// Publish a payload, returning its message id.
    pub fn publish(&self, payload: impl Into<Vec<u8>>) -> String {
        let mut state = self.lock();
        state.next_id += 1;
        let message_id = state.next_id.to_string();
        state.ready.push_back(Stored {
            message_id: message_id.clone(),
            payload: payload.into(),
            deliveries: 0,
        });
        message_id
    }

    /// Message ids acknowledged so far, in acknowledgement order.
    pub fn acked(&self) -> Vec<String> {
        self.lock().acked.clone()
    }

    /// Messages not yet acknowledged, whether waiting or leased.
    pub fn outstanding(&self) -> usize {
        let state = self.lock();
        state.ready.len() + state.leased.len()
    }

    /// Messages currently leased to a consumer.
    pub fn in_flight(&self) -> usize {
        self.lock().leased.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        // A panic while holding the lock leaves the queue itself consistent.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl MessageSource for MemorySource {
    async fn pull(&self, max_messages: usize) -> Result<Vec<RawMessage>, SourceError> {
        let now = Instant::now();
        let deadline = now + self.visibility_timeout;
        let mut state = self.lock();
        state.expire_leases(now);

        let mut messages = Vec::new();
        while messages.len() < max_messages {
            let Some(mut stored) = state.ready.pop_front() else {
                break;
            };
            stored.deliveries += 1;
            let ack_id = AckId::new(Uuid::new_v4().to_string());
            messages.push(RawMessage {
                payload: stored.payload.clone(),
                ack_id: ack_id.clone(),
                message_id: stored.message_id.clone(),
                publish_time: Some(Utc::now()),
                delivery_attempt: Some(stored.deliveries),
            });
            state.leased.insert(ack_id, (stored, deadline));
        }
        Ok(messages)
    }

    async fn ack(&self, ack_ids: &[AckId]) -> Result<(), SourceError> {
        let mut state = self.lock();
        for ack_id in ack_ids {
            // Stale ids (lease already expired) are ignored, as a real
            // subscription would.
            if let Some((stored, _)) = state.leased.remove(ack_id) {
                state.acked.push(stored.message_id);
            }
        }
        Ok(())
    }

    async fn nack(&self, ack_ids: &[AckId]) -> Result<(), SourceError> {
        let mut state = self.lock();
        for ack_id in ack_ids {
            if let Some((stored, _)) = state.leased.remove(ack_id) {
                state.ready.push_back(stored);
            }
        }
        Ok(())
    }

    async fn extend(&self, ack_ids: &[AckId], lease: Duration) -> Result<(), SourceError> {
        let now = Instant::now();
        let mut state = self.lock();
        state.expire_leases(now);
        for ack_id in ack_ids {
            if let Some((_, deadline)) = state.leased.get_mut(ack_id) {
                *deadline = now + lease;
            }
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ack_removes_message() {
        let source = MemorySource::new(Duration::from_secs(10));
        source.publish(r#"{"id":"1"}"#);

        let pulled = source.pull(10).await.unwrap();
        assert_eq!(pulled.len(), 1);
        assert_eq!(source.in_flight(), 1);

        source.ack(&[pulled[0].ack_id.clone()]).await.unwrap();
        assert_eq!(source.outstanding(), 0);
        assert_eq!(source.acked(), vec!["1".to_string()]);
        assert!(source.pull(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_nack_redelivers_immediately() {
        let source = MemorySource::new(Duration::from_secs(10));
        source.publish("a");

        let first = source.pull(1).await.unwrap();
        source.nack(&[first[0].ack_id.clone()]).await.unwrap();

        let second = source.pull(1).await.unwrap();
        assert_eq!(second[0].message_id, first[0].message_id);
        assert_ne!(second[0].ack_id, first[0].ack_id);
        assert_eq!(second[0].delivery_attempt, Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unacked_message_redelivered_after_timeout() {
        let source = MemorySource::new(Duration::from_secs(10));
        source.publish("a");

        let first = source.pull(1).await.unwrap();
        assert!(source.pull(1).await.unwrap().is_empty());

        tokio::time::advance(Duration::from_secs(11)).await;
        let second = source.pull(1).await.unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].message_id, first[0].message_id);

        // The first lease is gone; acking with its id changes nothing.
        source.ack(&[first[0].ack_id.clone()]).await.unwrap();
        assert_eq!(source.outstanding(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_extend_keeps_lease() {
        let source = MemorySource::new(Duration::from_secs(10));
        source.publish("a");
        let first = source.pull(1).await.unwrap();

        tokio::time::advance(Duration::from_secs(8)).await;
        source
            .extend(&[first[0].ack_id.clone()], Duration::from_secs(10))
            .await
            .unwrap();

        // Past the original deadline but inside the extended one.
        tokio::time::advance(Duration::from_secs(8)).await;
        assert!(source.pull(1).await.unwrap().is_empty());

        source.ack(&[first[0].ack_id.clone()]).await.unwrap();
        assert_eq!(source.acked(), vec!["1".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_extend_after_expiry_is_ignored() {
        let source = MemorySource::new(Duration::from_secs(10));
        source.publish("a");
        let first = source.pull(1).await.unwrap();

        tokio::time::advance(Duration::from_secs(11)).await;
        source
            .extend(&[first[0].ack_id.clone()], Duration::from_secs(10))
            .await
            .unwrap();

        let second = source.pull(1).await.unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].delivery_attempt, Some(2));
    }

    #[tokio::test]
    async fn test_pull_respects_max() {
        let source = MemorySource::new(Duration::from_secs(10));
        for i in 0..5 {
            source.publish(format!("{i}"));
        }
        assert_eq!(source.pull(3).await.unwrap().len(), 3);
        assert_eq!(source.pull(3).await.unwrap().len(), 2);
    }
}
