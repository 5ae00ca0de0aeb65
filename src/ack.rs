//! Acknowledgment controller
//!
//! Each delivery ends in exactly one of three dispositions:
//!
//! ```text
//! Received ─▶ Decoding ─▶ Routing ─▶ Handling ─┬─▶ Acked
//!               │            │                 ├─▶ NackedRequeue
//!               └─ malformed └─ unknown type   └─▶ DeadLettered (redelivery cap hit)
//!                  ─▶ Acked     ─▶ Acked
//! ```

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use tracing::{debug, error, warn};

use crate::error::{DecodeError, HandlerError};
use crate::handlers::HandlerOutcome;

/// Upper bound on in-process redelivery counters
const MAX_TRACKED: usize = 10_000;

// =============================================================================
// Delivery Handle
// =============================================================================

/// Broker-side acknowledgment for one delivery
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> Result<()>;
    async fn nack(&self, requeue: bool) -> Result<()>;
}

/// Resolves a delivery exactly once
///
/// `ack` and `nack` consume the handle. Dropping an unresolved handle is a
/// bug and is logged.
pub struct DeliveryHandle {
    delivery_tag: u64,
    acker: Option<Box<dyn Acknowledger>>,
}

impl DeliveryHandle {
    pub fn new(delivery_tag: u64, acker: Box<dyn Acknowledger>) -> Self {
        Self {
            delivery_tag,
            acker: Some(acker),
        }
    }

    pub fn delivery_tag(&self) -> u64 {
        self.delivery_tag
    }

    pub async fn ack(mut self) -> Result<()> {
        match self.acker.take() {
            Some(acker) => acker.ack().await,
            None => Ok(()),
        }
    }

    pub async fn nack(mut self, requeue: bool) -> Result<()> {
        match self.acker.take() {
            Some(acker) => acker.nack(requeue).await,
            None => Ok(()),
        }
    }
}

impl Drop for DeliveryHandle {
    fn drop(&mut self) {
        if self.acker.is_some() {
            error!(
                delivery_tag = self.delivery_tag,
                "Delivery dropped without ack or nack"
            );
        }
    }
}

// =============================================================================
// Delivery Metadata & Outcomes
// =============================================================================

/// Broker facts about a delivery, independent of its body
#[derive(Debug, Clone)]
pub struct DeliveryMeta {
    pub delivery_tag: u64,
    pub routing_key: String,
    /// Broker says this delivery was seen before
    pub redelivered: bool,
    /// `message_id` property set by the publisher
    pub message_id: Option<String>,
    /// `x-delivery-count` header (quorum queues)
    pub delivery_count: Option<u64>,
    pub received_at: DateTime<Utc>,
}

impl DeliveryMeta {
    pub fn new(delivery_tag: u64, routing_key: impl Into<String>) -> Self {
        Self {
            delivery_tag,
            routing_key: routing_key.into(),
            redelivered: false,
            message_id: None,
            delivery_count: None,
            received_at: Utc::now(),
        }
    }
}

/// Result of decode + route + handle for one delivery
#[derive(Debug)]
pub enum DispatchOutcome {
    /// Payload could not be decoded
    Malformed(DecodeError),
    /// No handler for this event type
    UnknownEventType(String),
    /// Handler finished
    Handled {
        event_type: String,
        outcome: HandlerOutcome,
    },
    /// Handler failed
    Failed {
        event_type: String,
        error: HandlerError,
    },
}

/// Final broker action for a delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Remove from the queue
    Ack,
    /// Return to the queue for redelivery
    Requeue,
    /// Reject without requeue (routed to the dead-letter exchange if any)
    DeadLetter,
}

// =============================================================================
// Controller
// =============================================================================

pub struct AckController {
    /// 0 = requeue forever
    max_redeliveries: u32,
    /// delivery key -> attempts seen
    attempts: DashMap<String, u32>,
}

impl AckController {
    pub fn new(max_redeliveries: u32) -> Self {
        Self {
            max_redeliveries,
            attempts: DashMap::new(),
        }
    }

    /// Decide what to do with a delivery given how dispatch went
    pub fn decide(&self, outcome: &DispatchOutcome, meta: &DeliveryMeta, payload: &[u8]) -> Disposition {
        let key = delivery_key(meta, payload);

        match outcome {
            DispatchOutcome::Malformed(_) | DispatchOutcome::UnknownEventType(_) => {
                self.attempts.remove(&key);
                Disposition::Ack
            }
            DispatchOutcome::Handled { .. } => {
                self.attempts.remove(&key);
                Disposition::Ack
            }
            DispatchOutcome::Failed { event_type, .. } => {
                let attempt = self.record_failure(&key, meta);
                if self.max_redeliveries > 0 && attempt > self.max_redeliveries {
                    self.attempts.remove(&key);
                    error!(
                        delivery_tag = meta.delivery_tag,
                        routing_key = %meta.routing_key,
                        event_type = %event_type,
                        attempt,
                        max_redeliveries = self.max_redeliveries,
                        "Redelivery limit reached, dead-lettering"
                    );
                    Disposition::DeadLetter
                } else {
                    warn!(
                        delivery_tag = meta.delivery_tag,
                        event_type = %event_type,
                        attempt,
                        "Requeueing failed delivery"
                    );
                    Disposition::Requeue
                }
            }
        }
    }

    /// Apply a disposition to the broker
    pub async fn finalize(&self, handle: DeliveryHandle, disposition: Disposition) -> Result<()> {
        let tag = handle.delivery_tag();
        let result = match disposition {
            Disposition::Ack => handle.ack().await,
            Disposition::Requeue => handle.nack(true).await,
            Disposition::DeadLetter => handle.nack(false).await,
        };
        match &result {
            Ok(()) => debug!(delivery_tag = tag, ?disposition, "Delivery resolved"),
            Err(e) => error!(delivery_tag = tag, ?disposition, error = %e, "Failed to resolve delivery"),
        }
        result
    }

    /// Attempt number of the delivery that just failed (first delivery = 1)
    fn record_failure(&self, key: &str, meta: &DeliveryMeta) -> u32 {
        if let Some(count) = meta.delivery_count {
            return u32::try_from(count).unwrap_or(u32::MAX).saturating_add(1);
        }

        if self.attempts.len() >= MAX_TRACKED {
            warn!("Redelivery tracker full, resetting counters");
            self.attempts.clear();
        }

        if !meta.redelivered {
            self.attempts.insert(key.to_string(), 1);
            return 1;
        }

        let mut entry = self.attempts.entry(key.to_string()).or_insert(1);
        *entry += 1;
        *entry
    }

    #[cfg(test)]
    fn tracked(&self) -> usize {
        self.attempts.len()
    }
}

/// Identity of a delivery across redeliveries
fn delivery_key(meta: &DeliveryMeta, payload: &[u8]) -> String {
    if let Some(id) = meta.message_id.as_deref().filter(|id| !id.is_empty()) {
        return format!("id:{}", id);
    }
    let mut hasher = DefaultHasher::new();
    meta.routing_key.hash(&mut hasher);
    payload.hash(&mut hasher);
    format!("hash:{:016x}", hasher.finish())
}
