//! RabbitMQ connector and consume loop
//!
//! ```text
//! zalo.events (topic) ──binding keys──▶ queue ──basic_consume──▶ AmqpConsumer
//!                                         │                         │ window = prefetch
//!                                         └─ x-dead-letter-exchange ▼
//!                                              ──▶ <queue>.dead   Dispatcher (JoinSet workers)
//! ```

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use lapin::acker::Acker;
use lapin::message::Delivery;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicQosOptions,
    ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable, ShortString};
use lapin::uri::{AMQPAuthority, AMQPUri, AMQPUserInfo};
use lapin::{Channel, Connection, ConnectionProperties, Consumer, ExchangeKind};
use std::sync::Arc;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::ack::{Acknowledger, DeliveryHandle, DeliveryMeta, Disposition};
use crate::config::ConsumerConfig;
use crate::dispatcher::Dispatcher;
use crate::topic;

const DELIVERY_COUNT_HEADER: &str = "x-delivery-count";
const DEAD_LETTER_HEADER: &str = "x-dead-letter-exchange";

/// Broker acker behind the [`Acknowledger`] seam
struct LapinAcker(Acker);

#[async_trait]
impl Acknowledger for LapinAcker {
    async fn ack(&self) -> Result<()> {
        self.0
            .ack(BasicAckOptions::default())
            .await
            .context("basic.ack failed")
    }

    async fn nack(&self, requeue: bool) -> Result<()> {
        self.0
            .nack(BasicNackOptions {
                multiple: false,
                requeue,
            })
            .await
            .context("basic.nack failed")
    }
}

/// Owns the broker connection, its single channel and the consumer stream
pub struct AmqpConsumer {
    connection: Connection,
    channel: Channel,
    consumer: Consumer,
    queue: String,
    routing_keys: Vec<String>,
    /// In-process worker cap, equal to the prefetch count
    window: usize,
}

impl AmqpConsumer {
    /// Connect, declare the topology and start consuming
    ///
    /// Any failure here is fatal; there is no reconnect.
    pub async fn connect(config: &ConsumerConfig) -> Result<Self> {
        info!(
            host = %config.amqp_host,
            port = config.amqp_port,
            vhost = %config.amqp_vhost,
            "Connecting to RabbitMQ"
        );

        let connection = Connection::connect_uri(amqp_uri(config), ConnectionProperties::default())
            .await
            .with_context(|| {
                format!(
                    "Failed to connect to RabbitMQ at {}:{}",
                    config.amqp_host, config.amqp_port
                )
            })?;
        let channel = connection
            .create_channel()
            .await
            .context("Failed to open channel")?;

        declare_topology(&channel, config).await?;

        channel
            .basic_qos(config.prefetch_count, BasicQosOptions::default())
            .await
            .context("Failed to set prefetch")?;

        let consumer_tag = format!("zalo-oa-consumer-{}", Uuid::new_v4());
        let consumer = channel
            .basic_consume(
                &config.queue,
                &consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .with_context(|| format!("Failed to consume from queue {}", config.queue))?;

        info!(
            queue = %config.queue,
            consumer_tag = %consumer_tag,
            prefetch = config.prefetch_count,
            "Consumer registered"
        );

        Ok(Self {
            connection,
            channel,
            consumer,
            queue: config.queue.clone(),
            routing_keys: config.routing_keys.clone(),
            window: usize::from(config.prefetch_count.max(1)),
        })
    }

    /// Consume until `ctx` is cancelled or the broker stream ends
    ///
    /// The channel and connection are closed once in-flight deliveries are
    /// resolved, whichever way the loop ended.
    pub async fn run(self, dispatcher: Arc<Dispatcher>, ctx: CancellationToken) -> Result<()> {
        let AmqpConsumer {
            connection,
            channel,
            consumer,
            queue,
            routing_keys,
            window,
        } = self;
        info!(queue = %queue, "Waiting for events");

        let deliveries = consumer.map(move |next| {
            next.map(|delivery| accept(&routing_keys, delivery))
                .context("Consumer stream failed")
        });
        let result = consume(deliveries, dispatcher, window, ctx).await;

        if let Err(e) = channel.close(200, "Bye").await {
            warn!(error = %e, "Failed to close channel");
        }
        if let Err(e) = connection.close(200, "Bye").await {
            warn!(error = %e, "Failed to close connection");
        }
        result
    }
}

/// A delivery taken off the broker stream
pub struct InboundDelivery {
    pub payload: Vec<u8>,
    pub meta: DeliveryMeta,
    pub handle: DeliveryHandle,
}

/// Drive deliveries through the dispatcher, at most `window` at a time
///
/// On cancellation no new deliveries are pulled and in-flight ones are
/// resolved before returning `Ok`. A stream error, or the stream ending
/// without cancellation, is returned as an error after the same drain.
pub async fn consume<S>(
    deliveries: S,
    dispatcher: Arc<Dispatcher>,
    window: usize,
    ctx: CancellationToken,
) -> Result<()>
where
    S: Stream<Item = Result<InboundDelivery>>,
{
    let window = window.max(1);
    let mut deliveries = std::pin::pin!(deliveries);
    let mut in_flight: JoinSet<Result<Disposition>> = JoinSet::new();

    let outcome = loop {
        tokio::select! {
            biased;

            _ = ctx.cancelled() => {
                info!("Received shutdown signal, stopping consumer");
                break Ok(());
            }
            Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                log_worker_result(joined);
            }
            next = deliveries.next(), if in_flight.len() < window => {
                match next {
                    Some(Ok(InboundDelivery { payload, meta, handle })) => {
                        let dispatcher = dispatcher.clone();
                        in_flight.spawn(async move {
                            dispatcher.handle_delivery(&payload, meta, handle).await
                        });
                    }
                    Some(Err(e)) => {
                        error!(error = %e, "Consumer stream failed");
                        break Err(e);
                    }
                    None if ctx.is_cancelled() => break Ok(()),
                    None => {
                        warn!("Consumer stream closed by broker");
                        break Err(anyhow!("Consumer stream closed by broker"));
                    }
                }
            }
        }
    };

    if !in_flight.is_empty() {
        info!(in_flight = in_flight.len(), "Waiting for in-flight deliveries");
    }
    while let Some(joined) = in_flight.join_next().await {
        log_worker_result(joined);
    }

    if outcome.is_ok() {
        info!("Consumer stopped gracefully");
    }
    outcome
}

/// Split a broker delivery into body, metadata and a handle
fn accept(routing_keys: &[String], delivery: Delivery) -> InboundDelivery {
    let Delivery {
        delivery_tag,
        routing_key,
        redelivered,
        properties,
        data,
        acker,
        ..
    } = delivery;

    let routing_key = routing_key.as_str().to_string();
    if !topic::matches_any(routing_keys, &routing_key) {
        warn!(
            delivery_tag,
            routing_key = %routing_key,
            "Delivery routing key matches no configured binding"
        );
    }

    let meta = DeliveryMeta {
        delivery_tag,
        routing_key,
        redelivered,
        message_id: properties
            .message_id()
            .as_ref()
            .map(|id| id.as_str().to_string()),
        delivery_count: properties.headers().as_ref().and_then(delivery_count),
        received_at: chrono::Utc::now(),
    };
    debug!(
        delivery_tag,
        routing_key = %meta.routing_key,
        redelivered,
        bytes = data.len(),
        "Delivery accepted"
    );

    InboundDelivery {
        payload: data,
        meta,
        handle: DeliveryHandle::new(delivery_tag, Box::new(LapinAcker(acker))),
    }
}

/// Exchange, queue (with dead-letter arguments) and bindings
async fn declare_topology(channel: &Channel, config: &ConsumerConfig) -> Result<()> {
    channel
        .exchange_declare(
            &config.exchange,
            ExchangeKind::Topic,
            durable_exchange(),
            FieldTable::default(),
        )
        .await
        .with_context(|| format!("Failed to declare exchange {}", config.exchange))?;

    if let (Some(dlx), Some(dead_queue)) =
        (config.dead_letter_exchange.as_deref(), config.dead_letter_queue())
    {
        channel
            .exchange_declare(dlx, ExchangeKind::Topic, durable_exchange(), FieldTable::default())
            .await
            .with_context(|| format!("Failed to declare dead-letter exchange {}", dlx))?;
        channel
            .queue_declare(&dead_queue, durable_queue(), FieldTable::default())
            .await
            .with_context(|| format!("Failed to declare dead-letter queue {}", dead_queue))?;
        channel
            .queue_bind(&dead_queue, dlx, "#", QueueBindOptions::default(), FieldTable::default())
            .await
            .with_context(|| format!("Failed to bind {} to {}", dead_queue, dlx))?;
        info!(exchange = %dlx, queue = %dead_queue, "Dead-letter route declared");
    }

    channel
        .queue_declare(&config.queue, durable_queue(), queue_arguments(config))
        .await
        .with_context(|| format!("Failed to declare queue {}", config.queue))?;

    for routing_key in &config.routing_keys {
        channel
            .queue_bind(
                &config.queue,
                &config.exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .with_context(|| format!("Failed to bind routing key {}", routing_key))?;
        info!(exchange = %config.exchange, queue = %config.queue, routing_key = %routing_key, "Bound");
    }

    Ok(())
}

fn durable_exchange() -> ExchangeDeclareOptions {
    ExchangeDeclareOptions {
        durable: true,
        ..Default::default()
    }
}

fn durable_queue() -> QueueDeclareOptions {
    QueueDeclareOptions {
        durable: true,
        ..Default::default()
    }
}

fn amqp_uri(config: &ConsumerConfig) -> AMQPUri {
    AMQPUri {
        authority: AMQPAuthority {
            userinfo: AMQPUserInfo {
                username: config.amqp_username.clone(),
                password: config.amqp_password.clone(),
            },
            host: config.amqp_host.clone(),
            port: config.amqp_port,
        },
        vhost: config.amqp_vhost.clone(),
        ..Default::default()
    }
}

fn queue_arguments(config: &ConsumerConfig) -> FieldTable {
    let mut arguments = FieldTable::default();
    if let Some(dlx) = &config.dead_letter_exchange {
        arguments.insert(
            ShortString::from(DEAD_LETTER_HEADER),
            AMQPValue::LongString(dlx.as_str().into()),
        );
    }
    arguments
}

/// `x-delivery-count` as set by quorum queues (0 on first delivery)
fn delivery_count(headers: &FieldTable) -> Option<u64> {
    let count = match header(headers, DELIVERY_COUNT_HEADER)? {
        AMQPValue::ShortShortUInt(n) => u64::from(*n),
        AMQPValue::ShortUInt(n) => u64::from(*n),
        AMQPValue::LongUInt(n) => u64::from(*n),
        AMQPValue::ShortShortInt(n) => u64::try_from(*n).ok()?,
        AMQPValue::ShortInt(n) => u64::try_from(*n).ok()?,
        AMQPValue::LongInt(n) => u64::try_from(*n).ok()?,
        AMQPValue::LongLongInt(n) => u64::try_from(*n).ok()?,
        _ => return None,
    };
    Some(count)
}

fn header<'a>(table: &'a FieldTable, name: &str) -> Option<&'a AMQPValue> {
    table.inner().get(&ShortString::from(name))
}

fn log_worker_result(joined: Result<Result<Disposition>, JoinError>) {
    match joined {
        Ok(Ok(disposition)) => debug!(?disposition, "Worker finished"),
        Ok(Err(e)) => error!(error = %e, "Delivery could not be resolved"),
        Err(e) => error!(error = %e, "Delivery worker panicked"),
    }
}
