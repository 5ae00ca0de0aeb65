//! `user_message_received` handling: keyword rules and canned replies

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

use super::{EventHandler, HandlerOutcome, ReplySender};
use crate::error::HandlerError;
use crate::types::{EventEnvelope, MessageReceived, OutboundMessageRequest};

// =============================================================================
// Reply Rules
// =============================================================================

type Predicate = Box<dyn Fn(&str) -> bool + Send + Sync>;

/// A predicate over lowercased message content and the reply it triggers
pub struct ReplyRule {
    pub name: String,
    predicate: Predicate,
    pub reply: String,
}

impl ReplyRule {
    pub fn new<F>(name: impl Into<String>, predicate: F, reply: impl Into<String>) -> Self
    where
        F: Fn(&str) -> bool + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            predicate: Box::new(predicate),
            reply: reply.into(),
        }
    }

    /// Match when the content contains any of `keywords`, ignoring case
    pub fn keywords(name: impl Into<String>, keywords: &[&str], reply: impl Into<String>) -> Self {
        let keywords: Vec<String> = keywords.iter().map(|k| k.to_lowercase()).collect();
        Self::new(
            name,
            move |content| keywords.iter().any(|k| content.contains(k.as_str())),
            reply,
        )
    }

    /// `content` must already be lowercased
    pub fn matches(&self, content: &str) -> bool {
        (self.predicate)(content)
    }
}

impl fmt::Debug for ReplyRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplyRule")
            .field("name", &self.name)
            .field("reply", &self.reply)
            .finish_non_exhaustive()
    }
}

/// Ordered rule table, first match wins
#[derive(Debug, Default)]
pub struct ReplyRules {
    rules: Vec<ReplyRule>,
}

impl ReplyRules {
    pub fn new(rules: Vec<ReplyRule>) -> Self {
        Self { rules }
    }

    /// Greeting first, then help
    pub fn standard(greeting_reply: &str, help_reply: &str) -> Self {
        Self::new(vec![
            ReplyRule::keywords("greeting", &["hello", "xin chào"], greeting_reply),
            ReplyRule::keywords("help", &["help", "giúp"], help_reply),
        ])
    }

    pub fn push(&mut self, rule: ReplyRule) {
        self.rules.push(rule);
    }

    pub fn select(&self, content: &str) -> Option<&ReplyRule> {
        let content = content.to_lowercase();
        self.rules.iter().find(|rule| rule.matches(&content))
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

// =============================================================================
// Idempotency Guard
// =============================================================================

/// Remembers inbound message ids that were already answered
///
/// Bounded: the oldest ids are forgotten first.
pub struct ReplyLedger {
    capacity: usize,
    inner: Mutex<(VecDeque<String>, HashSet<String>)>,
}

impl ReplyLedger {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new((VecDeque::new(), HashSet::new())),
        }
    }

    pub fn contains(&self, message_id: &str) -> bool {
        self.inner.lock().1.contains(message_id)
    }

    pub fn record(&self, message_id: &str) {
        let mut guard = self.inner.lock();
        let (order, seen) = &mut *guard;
        if !seen.insert(message_id.to_string()) {
            return;
        }
        order.push_back(message_id.to_string());
        while order.len() > self.capacity {
            if let Some(oldest) = order.pop_front() {
                seen.remove(&oldest);
            }
        }
    }
}

impl Default for ReplyLedger {
    fn default() -> Self {
        Self::new(1024)
    }
}

// =============================================================================
// Handler
// =============================================================================

pub struct MessageHandler {
    rules: ReplyRules,
    sender: Arc<ReplySender>,
    ledger: ReplyLedger,
}

impl MessageHandler {
    pub fn new(rules: ReplyRules, sender: Arc<ReplySender>) -> Self {
        Self {
            rules,
            sender,
            ledger: ReplyLedger::default(),
        }
    }
}

#[async_trait]
impl EventHandler for MessageHandler {
    async fn handle(&self, envelope: &EventEnvelope) -> Result<HandlerOutcome, HandlerError> {
        let event: MessageReceived = envelope.parse()?;

        info!(
            oa_id = event.oa_id.as_deref().unwrap_or("-"),
            oa_name = event.oa_name.as_deref().unwrap_or("Unknown"),
            sender_id = %event.sender_id,
            sender_name = event.sender_name.as_deref().unwrap_or("Unknown"),
            message_type = %event.message_type,
            conversation_id = event.conversation_id.as_deref().unwrap_or("-"),
            "Message received: {}",
            event.content
        );

        let Some(rule) = self.rules.select(&event.content) else {
            debug!("No reply rule matched message from {}", event.sender_id);
            return Ok(HandlerOutcome::NoAction);
        };

        if let Some(message_id) = event.message_id.as_deref()
            && self.ledger.contains(message_id)
        {
            info!(
                "Reply for message {} already sent, skipping redelivery",
                message_id
            );
            return Ok(HandlerOutcome::AlreadyReplied);
        }

        debug!("Rule '{}' matched message from {}", rule.name, event.sender_id);

        let request = OutboundMessageRequest::text(&event.sender_id, &rule.reply);
        let result = self.sender.send(event.oa_id.as_deref(), request).await?;

        if let Some(message_id) = event.message_id.as_deref() {
            self.ledger.record(message_id);
        }
        Ok(HandlerOutcome::Replied(result))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounts::AccountResolver;
    use crate::codec;
    use crate::error::OutboundCallError;
    use crate::handlers::testing::FakeApi;
    use crate::types::MessageType;
    use std::time::Duration;

    const GREETING: &str = "greeting-template";
    const HELP: &str = "help-template";

    fn handler(api: Arc<FakeApi>) -> MessageHandler {
        let accounts = AccountResolver::new(api.clone(), Some("acc-1".to_string()));
        let sender = ReplySender::new(api, accounts, 1).with_retry_delay(Duration::ZERO);
        MessageHandler::new(ReplyRules::standard(GREETING, HELP), Arc::new(sender))
    }

    fn envelope(json: &str) -> EventEnvelope {
        codec::decode(json.as_bytes()).unwrap()
    }

    #[test]
    fn test_rules_are_case_insensitive() {
        let rules = ReplyRules::standard(GREETING, HELP);
        assert_eq!(rules.select("HeLLo bot").unwrap().name, "greeting");
        assert_eq!(rules.select("XIN CHÀO shop").unwrap().name, "greeting");
        assert_eq!(rules.select("can you HELP me").unwrap().name, "help");
        assert_eq!(rules.select("giúp tôi với").unwrap().name, "help");
        assert!(rules.select("what is the price").is_none());
    }

    #[test]
    fn test_first_match_wins() {
        let rules = ReplyRules::standard(GREETING, HELP);
        let rule = rules.select("hello, I need help").unwrap();
        assert_eq!(rule.reply, GREETING);
    }

    #[test]
    fn test_custom_predicate_rule() {
        let mut rules = ReplyRules::default();
        assert!(rules.is_empty());
        rules.push(ReplyRule::new("question", |c| c.ends_with('?'), "we will answer soon"));
        assert_eq!(rules.len(), 1);
        assert!(rules.select("when do you open?").is_some());
        assert!(rules.select("thanks").is_none());
    }

    #[test]
    fn test_ledger_is_bounded() {
        let ledger = ReplyLedger::new(2);
        ledger.record("a");
        ledger.record("b");
        ledger.record("a");
        ledger.record("c");
        assert!(!ledger.contains("a"));
        assert!(ledger.contains("b"));
        assert!(ledger.contains("c"));
    }

    #[tokio::test]
    async fn test_greeting_sends_one_reply_to_sender() {
        let api = Arc::new(FakeApi::default());
        let outcome = handler(api.clone())
            .handle(&envelope(
                r#"{"event_type":"user_message_received","sender_id":"u2","content":"hello there"}"#,
            ))
            .await
            .unwrap();

        assert!(matches!(outcome, HandlerOutcome::Replied(_)));
        let sent = api.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "acc-1");
        assert_eq!(sent[0].1.recipient_id, "u2");
        assert_eq!(sent[0].1.message_type, MessageType::Text);
        assert_eq!(sent[0].1.text.as_deref(), Some(GREETING));
    }

    #[tokio::test]
    async fn test_no_match_sends_nothing() {
        let api = Arc::new(FakeApi::default());
        let outcome = handler(api.clone())
            .handle(&envelope(
                r#"{"event_type":"user_message_received","sender_id":"u2","content":"price list"}"#,
            ))
            .await
            .unwrap();

        assert_eq!(outcome, HandlerOutcome::NoAction);
        assert_eq!(api.send_attempts(), 0);
    }

    #[tokio::test]
    async fn test_missing_sender_is_malformed() {
        let api = Arc::new(FakeApi::default());
        let err = handler(api.clone())
            .handle(&envelope(r#"{"event_type":"user_message_received","content":"hello"}"#))
            .await
            .unwrap_err();

        assert!(matches!(err, HandlerError::MalformedEvent { .. }));
        assert_eq!(api.send_attempts(), 0);
    }

    #[tokio::test]
    async fn test_send_failure_fails_handler() {
        let api = Arc::new(FakeApi::default());
        api.fail_next_sends(1, OutboundCallError::status(500, "down"));

        let err = handler(api.clone())
            .handle(&envelope(
                r#"{"event_type":"user_message_received","sender_id":"u2","content":"help"}"#,
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, HandlerError::Outbound(_)));
    }

    #[tokio::test]
    async fn test_redelivery_after_failure_replies_once() {
        let api = Arc::new(FakeApi::default());
        let handler = handler(api.clone());
        let event = envelope(
            r#"{"event_type":"user_message_received","sender_id":"u2","message_id":"zm-1","content":"hello"}"#,
        );

        api.fail_next_sends(1, OutboundCallError::transport("timeout"));
        assert!(handler.handle(&event).await.is_err());

        // Redelivery re-runs the rule match and sends
        assert!(matches!(
            handler.handle(&event).await.unwrap(),
            HandlerOutcome::Replied(_)
        ));

        // A further redelivery of an answered message is not answered again
        assert_eq!(
            handler.handle(&event).await.unwrap(),
            HandlerOutcome::AlreadyReplied
        );
        assert_eq!(api.sent().len(), 1);
    }
}
