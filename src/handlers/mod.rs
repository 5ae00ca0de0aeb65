//! Event handlers, one per event type
//!
//! Handlers inspect an envelope and perform at most one outbound send. They
//! succeed on business non-matches and fail only when a required field is
//! missing or the gateway call fails.

mod follow;
mod message;
mod reply;

#[cfg(test)]
pub(crate) mod testing;

use async_trait::async_trait;

use crate::error::HandlerError;
use crate::types::{EventEnvelope, SendMessageResult};

pub use follow::{FollowHandler, FollowPolicy, LogOnly, UnfollowHandler, WelcomeMessage};
pub use message::{MessageHandler, ReplyLedger, ReplyRule, ReplyRules};
pub use reply::ReplySender;

/// What a handler did with an event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerOutcome {
    /// Nothing to send (no rule matched, or the policy is log-only)
    NoAction,
    /// A reply went out
    Replied(SendMessageResult),
    /// Redelivery of an event whose reply was already sent
    AlreadyReplied,
}

#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, envelope: &EventEnvelope) -> Result<HandlerOutcome, HandlerError>;
}
