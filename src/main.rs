//! Zalo OA Event Consumer - Main Entry Point
//!
//! Connects to RabbitMQ, consumes Zalo OA events and replies through the
//! ZaloOA gateway API until SIGINT/SIGTERM.

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use zalo_oa_consumer::accounts::AccountResolver;
use zalo_oa_consumer::ack::AckController;
use zalo_oa_consumer::config::ConsumerConfig;
use zalo_oa_consumer::consumer::AmqpConsumer;
use zalo_oa_consumer::dispatcher::Dispatcher;
use zalo_oa_consumer::handlers::{
    FollowHandler, FollowPolicy, LogOnly, MessageHandler, ReplyRules, ReplySender,
    UnfollowHandler, WelcomeMessage,
};
use zalo_oa_consumer::router::EventRouter;
use zalo_oa_consumer::telemetry;
use zalo_oa_consumer::zalo_api::{OaApi, ZaloApiClient};

#[tokio::main]
async fn main() -> Result<()> {
    // Logging comes up first so a bad config is reported through it
    let config = ConsumerConfig::from_env();
    telemetry::init_tracing(config.as_ref().is_ok_and(|c| c.log_json))?;

    info!("🚀 Zalo OA consumer starting...");

    let config = match config {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {:#}", e);
            return Err(e);
        }
    };
    info!(
        exchange = %config.exchange,
        queue = %config.queue,
        routing_keys = ?config.routing_keys,
        api_base_url = %config.api_base_url,
        "📋 Configuration loaded"
    );

    let dispatcher = Arc::new(build_dispatcher(&config)?);
    info!(event_types = ?dispatcher.router().event_types(), "Handlers registered");

    let consumer = AmqpConsumer::connect(&config).await?;

    let token = CancellationToken::new();
    spawn_signal_handlers(token.clone());

    let result = consumer.run(dispatcher, token).await;
    match &result {
        Ok(()) => info!("✅ Zalo OA consumer stopped"),
        Err(e) => error!("Consumer terminated: {:#}", e),
    }
    result
}

/// Wire the API client, handlers and router
fn build_dispatcher(config: &ConsumerConfig) -> Result<Dispatcher> {
    let api: Arc<dyn OaApi> =
        Arc::new(ZaloApiClient::from_config(config).context("Failed to build API client")?);

    let accounts = AccountResolver::new(api.clone(), config.default_account_id.clone());
    let sender = Arc::new(ReplySender::new(api, accounts, config.reply_max_attempts));

    let follow_policy: Box<dyn FollowPolicy> = match &config.welcome_message {
        Some(text) => {
            info!("👋 Welcome message enabled for new followers");
            Box::new(WelcomeMessage::new(sender.clone(), text.clone()))
        }
        None => Box::new(LogOnly),
    };

    let rules = ReplyRules::standard(&config.greeting_reply, &config.help_reply);
    let router = EventRouter::new(
        Arc::new(MessageHandler::new(rules, sender)),
        Arc::new(FollowHandler::new(follow_policy)),
        Arc::new(UnfollowHandler),
    );

    Ok(
        Dispatcher::new(router, AckController::new(config.max_redeliveries))
            .with_payload_logging(config.debug_mode),
    )
}

/// Cancel `token` on Ctrl-C or SIGTERM
fn spawn_signal_handlers(token: CancellationToken) {
    let ctrl_c_token = token.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("📢 Shutdown signal received");
                ctrl_c_token.cancel();
            }
            Err(err) => error!("Unable to listen for shutdown signal: {}", err),
        }
    });

    #[cfg(unix)]
    tokio::spawn(async move {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
                info!("📢 SIGTERM received");
                token.cancel();
            }
            Err(err) => error!("Unable to listen for SIGTERM: {}", err),
        }
    });
}
