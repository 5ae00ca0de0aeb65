//! Event router: exact match of `event_type` against the handler table

use std::collections::HashMap;
use std::sync::Arc;

use crate::handlers::EventHandler;
use crate::types::{USER_FOLLOW, USER_MESSAGE_RECEIVED, USER_UNFOLLOW};

/// Handler table keyed by event type tag
///
/// Routing performs no I/O; an unknown tag yields `None`.
pub struct EventRouter {
    table: HashMap<String, Arc<dyn EventHandler>>,
}

impl EventRouter {
    /// The standard table for the three subscribed event types
    pub fn new(
        message: Arc<dyn EventHandler>,
        follow: Arc<dyn EventHandler>,
        unfollow: Arc<dyn EventHandler>,
    ) -> Self {
        Self::empty()
            .with_handler(USER_MESSAGE_RECEIVED, message)
            .with_handler(USER_FOLLOW, follow)
            .with_handler(USER_UNFOLLOW, unfollow)
    }

    pub fn empty() -> Self {
        Self {
            table: HashMap::new(),
        }
    }

    /// Register (or replace) the handler for `event_type`
    pub fn with_handler(mut self, event_type: &str, handler: Arc<dyn EventHandler>) -> Self {
        self.table.insert(event_type.to_string(), handler);
        self
    }

    pub fn route(&self, event_type: &str) -> Option<&Arc<dyn EventHandler>> {
        self.table.get(event_type)
    }

    pub fn event_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.table.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }
}
