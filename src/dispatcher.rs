//! Per-delivery pipeline: decode, route, handle, acknowledge

use anyhow::Result;
use chrono::Utc;
use futures_util::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use tracing::{debug, error, warn};

use crate::ack::{AckController, DeliveryHandle, DeliveryMeta, DispatchOutcome, Disposition};
use crate::codec;
use crate::error::HandlerError;
use crate::router::EventRouter;

/// Payload characters kept in error logs
const PREVIEW_CHARS: usize = 200;

pub struct Dispatcher {
    router: EventRouter,
    acks: AckController,
    log_payloads: bool,
}

impl Dispatcher {
    pub fn new(router: EventRouter, acks: AckController) -> Self {
        Self {
            router,
            acks,
            log_payloads: false,
        }
    }

    /// Log every raw payload at debug level
    pub fn with_payload_logging(mut self, enabled: bool) -> Self {
        self.log_payloads = enabled;
        self
    }

    pub fn router(&self) -> &EventRouter {
        &self.router
    }

    /// Decode, route and run the handler for one payload
    ///
    /// Never fails: every way a delivery can end is a [`DispatchOutcome`].
    pub async fn dispatch(&self, payload: &[u8], meta: &DeliveryMeta) -> DispatchOutcome {
        if self.log_payloads {
            debug!(
                delivery_tag = meta.delivery_tag,
                routing_key = %meta.routing_key,
                payload = %codec::preview(payload, usize::MAX),
                "Delivery received"
            );
        }

        let envelope = match codec::decode(payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                error!(
                    delivery_tag = meta.delivery_tag,
                    routing_key = %meta.routing_key,
                    error = %e,
                    payload = %codec::preview(payload, PREVIEW_CHARS),
                    "Dropping undecodable event"
                );
                return DispatchOutcome::Malformed(e);
            }
        };

        let event_type = envelope.event_type.clone();
        let Some(handler) = self.router.route(&event_type) else {
            warn!(
                delivery_tag = meta.delivery_tag,
                routing_key = %meta.routing_key,
                event_type = %event_type,
                "Unknown event type, acknowledging without handling"
            );
            return DispatchOutcome::UnknownEventType(event_type);
        };

        // A panicking handler is a failed handler: the delivery must still be resolved
        let result = match AssertUnwindSafe(handler.handle(&envelope)).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => Err(HandlerError::Panicked {
                event_type: event_type.clone(),
                message: panic_message(panic.as_ref()),
            }),
        };

        match result {
            Ok(outcome) => {
                debug!(
                    delivery_tag = meta.delivery_tag,
                    event_type = %event_type,
                    ?outcome,
                    elapsed_ms = (Utc::now() - meta.received_at).num_milliseconds(),
                    "Event handled"
                );
                DispatchOutcome::Handled {
                    event_type,
                    outcome,
                }
            }
            Err(e) => {
                error!(
                    delivery_tag = meta.delivery_tag,
                    routing_key = %meta.routing_key,
                    event_type = %event_type,
                    correlation_id = envelope.correlation_id().unwrap_or("-"),
                    redelivered = meta.redelivered,
                    error = %e,
                    "Event handler failed"
                );
                DispatchOutcome::Failed {
                    event_type,
                    error: e,
                }
            }
        }
    }

    /// Run the pipeline and resolve the delivery
    ///
    /// Errors only when the broker rejects the ack/nack itself.
    pub async fn handle_delivery(
        &self,
        payload: &[u8],
        meta: DeliveryMeta,
        handle: DeliveryHandle,
    ) -> Result<Disposition> {
        let outcome = self.dispatch(payload, &meta).await;
        let disposition = self.acks.decide(&outcome, &meta, payload);
        self.acks.finalize(handle, disposition).await?;
        Ok(disposition)
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounts::AccountResolver;
    use crate::ack::tests::RecordingAcker;
    use crate::error::OutboundCallError;
    use crate::handlers::testing::FakeApi;
    use crate::handlers::{
        FollowHandler, HandlerOutcome, MessageHandler, ReplyRules, ReplySender, UnfollowHandler,
    };
    use crate::router::tests::CountingHandler;
    use crate::types::{MessageType, OutboundMessageRequest};
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::time::Duration;
    use tracing::{Event, Level, Subscriber};
    use tracing_subscriber::layer::{Context, Layer, SubscriberExt};

    const GREETING: &str = "Xin chào! Tôi là AI Bot. Tôi có thể giúp gì cho bạn?";
    const HELP: &str = "help-template";

    /// Counts emitted events per level
    #[derive(Clone, Default)]
    struct LevelCounter {
        counts: Arc<Mutex<HashMap<&'static str, usize>>>,
    }

    impl LevelCounter {
        fn count(&self, level: Level) -> usize {
            self.counts.lock().get(level.as_str()).copied().unwrap_or(0)
        }
    }

    impl<S: Subscriber> Layer<S> for LevelCounter {
        fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
            *self
                .counts
                .lock()
                .entry(event.metadata().level().as_str())
                .or_default() += 1;
        }
    }

    fn dispatcher(api: Arc<FakeApi>) -> Dispatcher {
        let accounts = AccountResolver::new(api.clone(), Some("acc-1".to_string()));
        let sender = ReplySender::new(api, accounts, 1).with_retry_delay(Duration::ZERO);
        let router = EventRouter::new(
            Arc::new(MessageHandler::new(
                ReplyRules::standard(GREETING, HELP),
                Arc::new(sender),
            )),
            Arc::new(FollowHandler::default()),
            Arc::new(UnfollowHandler),
        );
        Dispatcher::new(router, AckController::new(5))
    }

    fn meta(tag: u64, routing_key: &str) -> DeliveryMeta {
        DeliveryMeta::new(tag, routing_key)
    }

    #[tokio::test]
    async fn test_malformed_payloads_ack_with_one_error() {
        let payloads: [&[u8]; 4] = [
            b"\xff\xfe not utf8",
            b"{ not json",
            b"[1, 2, 3]",
            br#"{"content":"hello"}"#,
        ];

        for (tag, payload) in payloads.into_iter().enumerate() {
            let api = Arc::new(FakeApi::default());
            let dispatcher = dispatcher(api.clone());
            let acker = RecordingAcker::default();
            let counter = LevelCounter::default();
            let _guard =
                tracing::subscriber::set_default(tracing_subscriber::registry().with(counter.clone()));

            let disposition = dispatcher
                .handle_delivery(payload, meta(tag as u64, "zalo.message.received"), acker.handle(tag as u64))
                .await
                .unwrap();

            assert_eq!(disposition, Disposition::Ack);
            assert_eq!(acker.entries(), vec!["ack"]);
            assert_eq!(counter.count(Level::ERROR), 1, "payload #{}", tag);
            assert_eq!(api.send_attempts(), 0);
        }
    }

    #[tokio::test]
    async fn test_unknown_event_type_acks_with_one_warning() {
        let handler = Arc::new(CountingHandler::default());
        let router = EventRouter::new(handler.clone(), handler.clone(), handler.clone());
        let dispatcher = Dispatcher::new(router, AckController::new(5));
        let acker = RecordingAcker::default();
        let counter = LevelCounter::default();
        let _guard =
            tracing::subscriber::set_default(tracing_subscriber::registry().with(counter.clone()));

        let disposition = dispatcher
            .handle_delivery(
                br#"{"event_type":"oa_message_sent","oa_id":"oa-1"}"#,
                meta(1, "zalo.message.sent"),
                acker.handle(1),
            )
            .await
            .unwrap();

        assert_eq!(disposition, Disposition::Ack);
        assert_eq!(acker.entries(), vec!["ack"]);
        assert_eq!(counter.count(Level::WARN), 1);
        assert_eq!(counter.count(Level::ERROR), 0);
        assert_eq!(handler.calls(), 0);
    }

    #[tokio::test]
    async fn test_follow_scenario_acks_without_sending() {
        let api = Arc::new(FakeApi::default());
        let acker = RecordingAcker::default();

        let disposition = dispatcher(api.clone())
            .handle_delivery(
                br#"{"event_type":"user_follow","user_id":"u1","user_name":"Alice","oa_name":"ShopOA"}"#,
                meta(1, "zalo.user.follow"),
                acker.handle(1),
            )
            .await
            .unwrap();

        assert_eq!(disposition, Disposition::Ack);
        assert_eq!(acker.entries(), vec!["ack"]);
        assert_eq!(api.send_attempts(), 0);
    }

    #[tokio::test]
    async fn test_greeting_scenario_sends_once_and_acks() {
        let api = Arc::new(FakeApi::default());
        let acker = RecordingAcker::default();

        let disposition = dispatcher(api.clone())
            .handle_delivery(
                br#"{"event_type":"user_message_received","sender_id":"u2","content":"hello there"}"#,
                meta(1, "zalo.message.received"),
                acker.handle(1),
            )
            .await
            .unwrap();

        assert_eq!(disposition, Disposition::Ack);
        assert_eq!(acker.entries(), vec!["ack"]);

        let sent = api.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1.recipient_id, "u2");
        assert_eq!(sent[0].1.message_type, MessageType::Text);
        assert_eq!(sent[0].1.text.as_deref(), Some(GREETING));

        // The request survives the HTTP JSON contract
        let wire = serde_json::to_value(&sent[0].1).unwrap();
        assert_eq!(wire["zaloUserId"], "u2");
        assert_eq!(wire["type"], 0);
        let parsed: OutboundMessageRequest = serde_json::from_value(wire).unwrap();
        assert_eq!(parsed, sent[0].1);
    }

    #[tokio::test]
    async fn test_unmatched_message_acks_without_sending() {
        let api = Arc::new(FakeApi::default());
        let acker = RecordingAcker::default();

        let disposition = dispatcher(api.clone())
            .handle_delivery(
                br#"{"event_type":"user_message_received","sender_id":"u2","content":"how much?"}"#,
                meta(1, "zalo.message.received"),
                acker.handle(1),
            )
            .await
            .unwrap();

        assert_eq!(disposition, Disposition::Ack);
        assert_eq!(api.send_attempts(), 0);
    }

    #[tokio::test]
    async fn test_send_failure_requeues_and_redelivery_rematches() {
        let api = Arc::new(FakeApi::default());
        let dispatcher = dispatcher(api.clone());
        let acker = RecordingAcker::default();
        let payload =
            br#"{"event_type":"user_message_received","sender_id":"u2","message_id":"zm-7","content":"HELP please"}"#;

        api.fail_next_sends(1, OutboundCallError::status(502, "bad gateway"));
        let first = dispatcher
            .handle_delivery(payload, meta(1, "zalo.message.received"), acker.handle(1))
            .await
            .unwrap();
        assert_eq!(first, Disposition::Requeue);

        let redelivered = DeliveryMeta {
            redelivered: true,
            ..meta(2, "zalo.message.received")
        };
        let second = dispatcher
            .handle_delivery(payload, redelivered.clone(), acker.handle(2))
            .await
            .unwrap();
        assert_eq!(second, Disposition::Ack);

        let third = dispatcher
            .handle_delivery(payload, DeliveryMeta { delivery_tag: 3, ..redelivered }, acker.handle(3))
            .await
            .unwrap();
        assert_eq!(third, Disposition::Ack);

        assert_eq!(acker.entries(), vec!["nack(requeue=true)", "ack", "ack"]);
        assert_eq!(api.send_attempts(), 2);
        assert_eq!(api.sent().len(), 1);
        assert_eq!(api.sent()[0].1.text.as_deref(), Some(HELP));
    }

    #[tokio::test]
    async fn test_malformed_event_requeues_then_dead_letters() {
        let api = Arc::new(FakeApi::default());
        let accounts = AccountResolver::new(api.clone(), Some("acc-1".to_string()));
        let sender = ReplySender::new(api.clone(), accounts, 1);
        let router = EventRouter::new(
            Arc::new(MessageHandler::new(ReplyRules::default(), Arc::new(sender))),
            Arc::new(FollowHandler::default()),
            Arc::new(UnfollowHandler),
        );
        let dispatcher = Dispatcher::new(router, AckController::new(1));
        let acker = RecordingAcker::default();
        let payload = br#"{"event_type":"user_unfollow","user_name":"Bob"}"#;

        let first = dispatcher
            .handle_delivery(payload, meta(1, "zalo.user.unfollow"), acker.handle(1))
            .await
            .unwrap();
        let second = dispatcher
            .handle_delivery(
                payload,
                DeliveryMeta {
                    redelivered: true,
                    ..meta(2, "zalo.user.unfollow")
                },
                acker.handle(2),
            )
            .await
            .unwrap();

        assert_eq!(first, Disposition::Requeue);
        assert_eq!(second, Disposition::DeadLetter);
        assert_eq!(
            acker.entries(),
            vec!["nack(requeue=true)", "nack(requeue=false)"]
        );
    }

    #[tokio::test]
    async fn test_dispatch_reports_outcome() {
        let api = Arc::new(FakeApi::default());
        let outcome = dispatcher(api)
            .dispatch(
                br#"{"event_type":"user_unfollow","user_id":"u1","is_follow":false}"#,
                &meta(1, "zalo.user.unfollow"),
            )
            .await;

        assert!(matches!(
            outcome,
            DispatchOutcome::Handled {
                outcome: HandlerOutcome::NoAction,
                ..
            }
        ));
    }

    struct PanickingHandler;

    #[async_trait::async_trait]
    impl crate::handlers::EventHandler for PanickingHandler {
        async fn handle(
            &self,
            _envelope: &crate::types::EventEnvelope,
        ) -> Result<HandlerOutcome, HandlerError> {
            panic!("handler bug")
        }
    }

    #[tokio::test]
    async fn test_panicking_handler_requeues() {
        let router = EventRouter::empty().with_handler("user_follow", Arc::new(PanickingHandler));
        let dispatcher = Arc::new(Dispatcher::new(router, AckController::new(5)));
        let acker = RecordingAcker::default();
        let handle = acker.handle(1);

        let task = tokio::spawn({
            let dispatcher = dispatcher.clone();
            async move {
                dispatcher
                    .handle_delivery(
                        br#"{"event_type":"user_follow","user_id":"u1"}"#,
                        meta(1, "zalo.user.follow"),
                        handle,
                    )
                    .await
            }
        });

        let disposition = task.await.unwrap().unwrap();
        assert_eq!(disposition, Disposition::Requeue);
        assert_eq!(acker.entries(), vec!["nack(requeue=true)"]);

        let outcome = dispatcher
            .dispatch(br#"{"event_type":"user_follow","user_id":"u1"}"#, &meta(2, "zalo.user.follow"))
            .await;
        assert!(matches!(
            outcome,
            DispatchOutcome::Failed {
                error: HandlerError::Panicked { ref message, .. },
                ..
            } if message == "handler bug"
        ));
    }

    #[tokio::test]
    async fn test_account_listing_failure_replies_through_fallback() {
        let api = Arc::new(FakeApi::default());
        api.fail_lists(true);
        let acker = RecordingAcker::default();

        let disposition = dispatcher(api.clone())
            .handle_delivery(
                br#"{"event_type":"user_message_received","sender_id":"u2","oa_id":"oa-1","content":"hello there"}"#,
                meta(1, "zalo.message.received"),
                acker.handle(1),
            )
            .await
            .unwrap();

        assert_eq!(disposition, Disposition::Ack);
        assert_eq!(acker.entries(), vec!["ack"]);
        let sent = api.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "acc-1");
        assert_eq!(sent[0].1.recipient_id, "u2");
    }
}
