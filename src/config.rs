//! Configuration management

use anyhow::{Context, Result, anyhow, bail};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::topic;

/// Consumer process configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerConfig {
    // =========================================================================
    // RabbitMQ Configuration
    // =========================================================================
    /// Broker host
    #[serde(default = "default_amqp_host")]
    pub amqp_host: String,

    /// Broker port
    #[serde(default = "default_amqp_port")]
    pub amqp_port: u16,

    /// Broker username
    #[serde(default = "default_amqp_credential")]
    pub amqp_username: String,

    /// Broker password
    #[serde(default = "default_amqp_credential", skip_serializing)]
    pub amqp_password: String,

    /// Broker virtual host
    #[serde(default = "default_amqp_vhost")]
    pub amqp_vhost: String,

    /// Durable topic exchange the gateway publishes to
    #[serde(default = "default_exchange")]
    pub exchange: String,

    /// Durable queue owned by this consumer deployment
    #[serde(default = "default_queue")]
    pub queue: String,

    /// Binding patterns (`*` matches one word, `#` matches zero or more)
    #[serde(default = "default_routing_keys")]
    pub routing_keys: Vec<String>,

    /// Maximum number of unacknowledged deliveries held at once
    #[serde(default = "default_prefetch")]
    pub prefetch_count: u16,

    /// Failed deliveries are dead-lettered after this many redeliveries (0 = never)
    #[serde(default = "default_max_redeliveries")]
    pub max_redeliveries: u32,

    /// Exchange receiving rejected deliveries
    #[serde(default)]
    pub dead_letter_exchange: Option<String>,

    // =========================================================================
    // ZaloOA Gateway Configuration
    // =========================================================================
    /// Gateway base URL, e.g. `https://host/api/zalooa`
    pub api_base_url: String,

    /// Account used when an event's `oa_id` cannot be resolved
    #[serde(default)]
    pub default_account_id: Option<String>,

    /// Value for the `X-User-Id` header
    #[serde(default)]
    pub api_user_id: Option<String>,

    /// Outbound HTTP timeout in seconds
    #[serde(default = "default_api_timeout")]
    pub api_timeout_secs: u64,

    /// Attempts per reply send (1 = no local retry)
    #[serde(default = "default_reply_attempts")]
    pub reply_max_attempts: u32,

    // =========================================================================
    // Reply Policy
    // =========================================================================
    #[serde(default = "default_greeting_reply")]
    pub greeting_reply: String,

    #[serde(default = "default_help_reply")]
    pub help_reply: String,

    /// Welcome text sent to new followers (disabled when unset)
    #[serde(default)]
    pub welcome_message: Option<String>,

    // =========================================================================
    // Common Configuration
    // =========================================================================
    /// Emit JSON logs instead of plain text
    #[serde(default)]
    pub log_json: bool,

    /// Enable debug mode (log raw payloads)
    #[serde(default)]
    pub debug_mode: bool,
}

fn default_amqp_host() -> String {
    "localhost".to_string()
}

fn default_amqp_port() -> u16 {
    5672
}

fn default_amqp_credential() -> String {
    "guest".to_string()
}

fn default_amqp_vhost() -> String {
    "/".to_string()
}

fn default_exchange() -> String {
    "zalo.events".to_string()
}

fn default_queue() -> String {
    "rust.zalo.consumer".to_string()
}

fn default_routing_keys() -> Vec<String> {
    vec![
        "zalo.message.received".to_string(),
        "zalo.user.follow".to_string(),
        "zalo.user.unfollow".to_string(),
    ]
}

fn default_prefetch() -> u16 {
    1
}

fn default_max_redeliveries() -> u32 {
    5
}

fn default_api_timeout() -> u64 {
    10
}

fn default_reply_attempts() -> u32 {
    1
}

fn default_greeting_reply() -> String {
    "Xin chào! Tôi là AI Bot. Tôi có thể giúp gì cho bạn?".to_string()
}

fn default_help_reply() -> String {
    "Tôi có thể hỗ trợ bạn với các vấn đề sau:\n1. Thông tin sản phẩm\n2. Hỗ trợ kỹ thuật\n3. Đặt hàng"
        .to_string()
}

/// Parse an optional numeric variable, failing loudly on garbage
fn parse_var<T>(name: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| anyhow!("{} has invalid value '{}': {}", name, raw, e)),
        Err(_) => Ok(default),
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn flag_var(name: &str) -> bool {
    matches!(
        std::env::var(name).as_deref().map(str::trim),
        Ok("1") | Ok("true") | Ok("yes") | Ok("on")
    )
}

impl ConsumerConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok(); // Load .env file if present

        let api_base_url =
            non_empty_var("ZALO_API_BASE_URL").context("ZALO_API_BASE_URL is required")?;

        let config = Self {
            amqp_host: non_empty_var("AMQP_HOST").unwrap_or_else(default_amqp_host),
            amqp_port: parse_var("AMQP_PORT", default_amqp_port())?,
            amqp_username: non_empty_var("AMQP_USERNAME").unwrap_or_else(default_amqp_credential),
            amqp_password: std::env::var("AMQP_PASSWORD")
                .unwrap_or_else(|_| default_amqp_credential()),
            amqp_vhost: non_empty_var("AMQP_VHOST").unwrap_or_else(default_amqp_vhost),
            exchange: non_empty_var("ZALO_EXCHANGE").unwrap_or_else(default_exchange),
            queue: non_empty_var("ZALO_QUEUE").unwrap_or_else(default_queue),
            routing_keys: non_empty_var("ZALO_ROUTING_KEYS")
                .map(|s| {
                    s.split(',')
                        .map(|k| k.trim().to_string())
                        .filter(|k| !k.is_empty())
                        .collect()
                })
                .unwrap_or_else(default_routing_keys),
            prefetch_count: parse_var("PREFETCH_COUNT", default_prefetch())?,
            max_redeliveries: parse_var("MAX_REDELIVERIES", default_max_redeliveries())?,
            dead_letter_exchange: non_empty_var("DEAD_LETTER_EXCHANGE"),

            api_base_url: api_base_url.trim_end_matches('/').to_string(),
            default_account_id: non_empty_var("ZALO_OA_ACCOUNT_ID"),
            api_user_id: non_empty_var("ZALO_API_USER_ID"),
            api_timeout_secs: parse_var("API_TIMEOUT_SECS", default_api_timeout())?,
            reply_max_attempts: parse_var("REPLY_MAX_ATTEMPTS", default_reply_attempts())?,

            greeting_reply: non_empty_var("GREETING_REPLY").unwrap_or_else(default_greeting_reply),
            help_reply: non_empty_var("HELP_REPLY").unwrap_or_else(default_help_reply),
            welcome_message: non_empty_var("WELCOME_MESSAGE"),

            log_json: std::env::var("LOG_FORMAT")
                .map(|v| v.eq_ignore_ascii_case("json"))
                .unwrap_or(false),
            debug_mode: flag_var("DEBUG_MODE"),
        };

        config.validate()?;
        Ok(config)
    }

    /// Build a configuration with defaults for everything but the gateway URL
    pub fn with_api_base_url(api_base_url: impl Into<String>) -> Self {
        Self {
            amqp_host: default_amqp_host(),
            amqp_port: default_amqp_port(),
            amqp_username: default_amqp_credential(),
            amqp_password: default_amqp_credential(),
            amqp_vhost: default_amqp_vhost(),
            exchange: default_exchange(),
            queue: default_queue(),
            routing_keys: default_routing_keys(),
            prefetch_count: default_prefetch(),
            max_redeliveries: default_max_redeliveries(),
            dead_letter_exchange: None,
            api_base_url: api_base_url.into(),
            default_account_id: None,
            api_user_id: None,
            api_timeout_secs: default_api_timeout(),
            reply_max_attempts: default_reply_attempts(),
            greeting_reply: default_greeting_reply(),
            help_reply: default_help_reply(),
            welcome_message: None,
            log_json: false,
            debug_mode: false,
        }
    }

    /// Reject configurations the consumer cannot start with
    pub fn validate(&self) -> Result<()> {
        let url = reqwest::Url::parse(&self.api_base_url)
            .with_context(|| format!("ZALO_API_BASE_URL '{}' is not a URL", self.api_base_url))?;
        if !matches!(url.scheme(), "http" | "https") {
            bail!("ZALO_API_BASE_URL must use http or https, got '{}'", url.scheme());
        }

        if self.exchange.is_empty() || self.queue.is_empty() {
            bail!("exchange and queue names must not be empty");
        }
        if self.prefetch_count == 0 {
            bail!("PREFETCH_COUNT must be at least 1");
        }
        if self.routing_keys.is_empty() {
            bail!("at least one routing key is required");
        }
        for key in &self.routing_keys {
            topic::validate_pattern(key)
                .with_context(|| format!("invalid routing key '{}'", key))?;
        }
        if self.reply_max_attempts == 0 {
            bail!("REPLY_MAX_ATTEMPTS must be at least 1");
        }
        if self.api_timeout_secs == 0 {
            bail!("API_TIMEOUT_SECS must be at least 1");
        }
        Ok(())
    }

    pub fn api_timeout(&self) -> Duration {
        Duration::from_secs(self.api_timeout_secs)
    }

    /// Name of the queue collecting dead-lettered deliveries
    pub fn dead_letter_queue(&self) -> Option<String> {
        self.dead_letter_exchange
            .as_ref()
            .map(|_| format!("{}.dead", self.queue))
    }
}
