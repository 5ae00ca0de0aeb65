//! Zalo OA Event Consumer Library
//!
//! Consumes Zalo Official Account events that the ZaloOA gateway publishes to
//! RabbitMQ and answers them through the gateway's HTTP API.
//!
//! # Architecture
//!
//! ```text
//! ZaloOA Gateway ──publish──▶ RabbitMQ (zalo.events) ──▶ Consumer (this)
//!       ▲                                                   │
//!       │                                                   ├── Codec      bytes ─▶ EventEnvelope
//!       │                                                   ├── Router     event_type ─▶ handler
//!       │                                                   ├── Handlers   message / follow / unfollow
//!       └──────────── POST /{accountId}/messages ◀──────────┴── Ack        ack / requeue / dead-letter
//! ```
//!
//! # Usage
//!
//! ```bash
//! export ZALO_API_BASE_URL=http://localhost:5000/api/zalooa
//! export AMQP_HOST=localhost
//! export ZALO_OA_ACCOUNT_ID=your_gateway_account_id   # optional fallback
//! export WELCOME_MESSAGE="Thanks for following!"      # optional
//!
//! zalo-oa-consumer
//! ```
//!
//! # Wire format
//!
//! ```json
//! {"event_type": "user_message_received", "oa_id": "...", "sender_id": "...", "content": "hello"}
//! {"event_type": "user_follow", "oa_id": "...", "user_id": "...", "user_name": "...", "is_follow": true}
//! ```

pub mod accounts;
pub mod ack;
pub mod codec;
pub mod config;
pub mod consumer;
pub mod dispatcher;
pub mod error;
pub mod handlers;
pub mod router;
pub mod telemetry;
pub mod topic;
pub mod types;
pub mod zalo_api;

pub use accounts::AccountResolver;
pub use ack::{AckController, DeliveryHandle, DeliveryMeta, DispatchOutcome, Disposition};
pub use config::ConsumerConfig;
pub use consumer::AmqpConsumer;
pub use dispatcher::Dispatcher;
pub use error::{DecodeError, HandlerError, OutboundCallError};
pub use router::EventRouter;
pub use types::*;
pub use zalo_api::{OaApi, ZaloApiClient};

/// Prelude for common imports
pub mod prelude {
    pub use crate::ack::{AckController, Disposition};
    pub use crate::config::ConsumerConfig;
    pub use crate::dispatcher::Dispatcher;
    pub use crate::error::{DecodeError, HandlerError, OutboundCallError};
    pub use crate::handlers::{EventHandler, HandlerOutcome};
    pub use crate::router::EventRouter;
    pub use crate::types::*;
    pub use crate::zalo_api::{OaApi, ZaloApiClient};
}
