//! Lease renewal for messages the pipeline is still working on.
//!
//! A message is held from the moment it is pulled until it is acknowledged
//! or nacked. In between it may wait in the row channel, sit in the batch
//! buffer and ride through staging and load retries, which together can
//! take far longer than the subscription's ack deadline. [`LeaseKeeper`]
//! wraps a [`MessageSource`], remembers every ack id it hands out and
//! renews those leases in the background so held messages are not
//! redelivered to another worker.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::SourceConfig;
use crate::emit;
use crate::error::SourceError;
use crate::metrics::events::{LeasesAbandoned, LeasesExtended, LeasesHeld};

use super::{AckId, MessageSource, RawMessage};

/// How long renewed leases last and how long a message may be held.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeasePolicy {
    /// Lease requested on each renewal.
    pub deadline: Duration,
    /// Messages held longer than this are no longer renewed.
    pub max_lease: Duration,
}

impl LeasePolicy {
    /// Period between renewal rounds, a third of the deadline.
    pub fn renew_every(&self) -> Duration {
        (self.deadline / 3).max(Duration::from_millis(1))
    }
}

impl From<&SourceConfig> for LeasePolicy {
    fn from(config: &SourceConfig) -> Self {
        Self {
            deadline: config.ack_deadline(),
            max_lease: config.max_lease(),
        }
    }
}

/// A [`MessageSource`] that keeps the leases of pulled messages alive until
/// they are acknowledged or nacked.
pub struct LeaseKeeper {
    inner: Arc<dyn MessageSource>,
    policy: LeasePolicy,
    /// Ack ids handed out and not yet settled, with the time they were pulled.
    held: Mutex<HashMap<AckId, Instant>>,
}

impl LeaseKeeper {
    pub fn new(inner: Arc<dyn MessageSource>, policy: LeasePolicy) -> Self {
        Self {
            inner,
            policy,
            held: Mutex::new(HashMap::new()),
        }
    }

    /// Messages currently held.
    pub fn held(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<AckId, Instant>> {
        self.held.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn settle(&self, ack_ids: &[AckId]) {
        let mut held = self.lock();
        for ack_id in ack_ids {
            held.remove(ack_id);
        }
    }

    /// Renew every held lease once. Messages held past the maximum lease
    /// are dropped from renewal and left to the subscription.
    ///
    /// Returns the number of leases renewed.
    pub async fn renew(&self) -> Result<usize, SourceError> {
        let now = Instant::now();
        let (renewing, abandoned) = {
            let mut held = self.lock();
            let before = held.len();
            held.retain(|_, since| now.duration_since(*since) < self.policy.max_lease);
            let abandoned = before - held.len();
            (held.keys().cloned().collect::<Vec<_>>(), abandoned)
        };

        if abandoned > 0 {
            warn!(
                count = abandoned,
                max_lease_secs = self.policy.max_lease.as_secs(),
                "Stopped renewing messages held past the maximum lease"
            );
            emit!(LeasesAbandoned {
                count: abandoned as u64,
            });
        }
        emit!(LeasesHeld {
            count: renewing.len(),
        });
        if renewing.is_empty() {
            return Ok(0);
        }

        self.inner.extend(&renewing, self.policy.deadline).await?;
        emit!(LeasesExtended {
            count: renewing.len() as u64,
        });
        debug!(count = renewing.len(), "Renewed leases");
        Ok(renewing.len())
    }

    /// Renew held leases on a fixed period until `shutdown` is cancelled.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.policy.renew_every());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval.reset();

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => break,

                _ = interval.tick() => {
                    if let Err(e) = self.renew().await {
                        warn!("Failed to renew leases: {}", e);
                    }
                }
            }
        }
        debug!(held = self.held(), "Lease keeper stopped");
    }
}

#[async_trait]
impl MessageSource for LeaseKeeper {
    async fn pull(&self, max_messages: usize) -> Result<Vec<RawMessage>, SourceError> {
        let messages = self.inner.pull(max_messages).await?;
        if !messages.is_empty() {
            let now = Instant::now();
            let mut held = self.lock();
            for message in &messages {
                held.insert(message.ack_id.clone(), now);
            }
        }
        Ok(messages)
    }

    // Settled ids stop being renewed even when the call fails: a lost ack
    // must let the lease lapse so the message is redelivered.
    async fn ack(&self, ack_ids: &[AckId]) -> Result<(), SourceError> {
        self.settle(ack_ids);
        self.inner.ack(ack_ids).await
    }

    async fn nack(&self, ack_ids: &[AckId]) -> Result<(), SourceError> {
        self.settle(ack_ids);
        self.inner.nack(ack_ids).await
    }

    async fn extend(&self, ack_ids: &[AckId], lease: Duration) -> Result<(), SourceError> {
        self.inner.extend(ack_ids, lease).await
    }

    fn name(&self) -> &str {
        self.inner.name()
    }
}
