//! `user_follow` / `user_unfollow` handling

use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

use super::{EventHandler, HandlerOutcome, ReplySender};
use crate::error::HandlerError;
use crate::types::{EventEnvelope, FollowChanged, OutboundMessageRequest};

/// What to do when a user follows the Official Account
#[async_trait]
pub trait FollowPolicy: Send + Sync {
    async fn on_follow(&self, event: &FollowChanged) -> Result<HandlerOutcome, HandlerError>;
}

/// Log the follow, send nothing
pub struct LogOnly;

#[async_trait]
impl FollowPolicy for LogOnly {
    async fn on_follow(&self, _event: &FollowChanged) -> Result<HandlerOutcome, HandlerError> {
        Ok(HandlerOutcome::NoAction)
    }
}

/// Greet every new follower with a fixed text
pub struct WelcomeMessage {
    sender: Arc<ReplySender>,
    text: String,
}

impl WelcomeMessage {
    pub fn new(sender: Arc<ReplySender>, text: impl Into<String>) -> Self {
        Self {
            sender,
            text: text.into(),
        }
    }
}

#[async_trait]
impl FollowPolicy for WelcomeMessage {
    async fn on_follow(&self, event: &FollowChanged) -> Result<HandlerOutcome, HandlerError> {
        let request = OutboundMessageRequest::text(&event.user_id, &self.text);
        let result = self.sender.send(event.oa_id.as_deref(), request).await?;
        Ok(HandlerOutcome::Replied(result))
    }
}

pub struct FollowHandler {
    policy: Box<dyn FollowPolicy>,
}

impl FollowHandler {
    pub fn new(policy: Box<dyn FollowPolicy>) -> Self {
        Self { policy }
    }
}

impl Default for FollowHandler {
    fn default() -> Self {
        Self::new(Box::new(LogOnly))
    }
}

#[async_trait]
impl EventHandler for FollowHandler {
    async fn handle(&self, envelope: &EventEnvelope) -> Result<HandlerOutcome, HandlerError> {
        let event: FollowChanged = envelope.parse()?;

        info!(
            oa_name = event.oa_name.as_deref().unwrap_or("Unknown"),
            user_id = %event.user_id,
            user_name = event.user_name.as_deref().unwrap_or("Unknown"),
            "User followed OA"
        );

        self.policy.on_follow(&event).await
    }
}

#[derive(Default)]
pub struct UnfollowHandler;

#[async_trait]
impl EventHandler for UnfollowHandler {
    async fn handle(&self, envelope: &EventEnvelope) -> Result<HandlerOutcome, HandlerError> {
        let event: FollowChanged = envelope.parse()?;

        info!(
            oa_name = event.oa_name.as_deref().unwrap_or("Unknown"),
            user_id = %event.user_id,
            user_name = event.user_name.as_deref().unwrap_or("Unknown"),
            "User unfollowed OA"
        );

        Ok(HandlerOutcome::NoAction)
    }
}
