//! ZaloOA gateway API client
//!
//! Handles:
//! - Connected Official Account listing and management
//! - Follower and conversation history queries
//! - Outbound message sending (the only call made while handling events)

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::ConsumerConfig;
use crate::error::OutboundCallError;
use crate::types::{
    Account, AccountList, ConversationMessage, Follower, FollowerPage, MessagePage,
    OutboundMessageRequest, SendMessageResult,
};

/// The gateway sits behind ngrok in development; this skips its browser warning page.
const NGROK_SKIP_HEADER: &str = "ngrok-skip-browser-warning";
const USER_ID_HEADER: &str = "x-user-id";

// =============================================================================
// API Contract
// =============================================================================

/// Operations the consumer needs from the gateway
///
/// Implementations must be cheap to share: handlers hold one behind an `Arc`
/// and may call it concurrently when prefetch is above one.
#[async_trait]
pub trait OaApi: Send + Sync {
    async fn send_message(
        &self,
        account_id: &str,
        request: &OutboundMessageRequest,
    ) -> Result<SendMessageResult, OutboundCallError>;

    async fn list_accounts(&self) -> Result<Vec<Account>, OutboundCallError>;

    async fn get_followers(
        &self,
        account_id: &str,
        offset: u32,
        limit: u32,
    ) -> Result<Vec<Follower>, OutboundCallError>;
}

// =============================================================================
// HTTP Client
// =============================================================================

/// Error body returned by the gateway on failure
#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: Option<serde_json::Value>,
}

/// HTTP client for the ZaloOA gateway
#[derive(Clone)]
pub struct ZaloApiClient {
    base_url: String,
    http_client: Client,
}

impl ZaloApiClient {
    /// Create a client with the given base URL and request timeout
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, OutboundCallError> {
        Self::with_headers(base_url, timeout, HeaderMap::new())
    }

    /// Create a client from process configuration
    pub fn from_config(config: &ConsumerConfig) -> Result<Self, OutboundCallError> {
        let mut headers = HeaderMap::new();
        if let Some(user_id) = &config.api_user_id {
            let value = HeaderValue::from_str(user_id)
                .map_err(|e| OutboundCallError::transport(format!("invalid user id header: {}", e)))?;
            headers.insert(HeaderName::from_static(USER_ID_HEADER), value);
        }
        Self::with_headers(&config.api_base_url, config.api_timeout(), headers)
    }

    fn with_headers(
        base_url: &str,
        timeout: Duration,
        mut headers: HeaderMap,
    ) -> Result<Self, OutboundCallError> {
        headers.insert(
            HeaderName::from_static(NGROK_SKIP_HEADER),
            HeaderValue::from_static("true"),
        );

        let http_client = Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .map_err(|e| OutboundCallError::transport(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http_client,
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}{}", self.base_url, path);
        debug!("{} {}", method, url);
        self.http_client.request(method, url)
    }

    /// Send a request and map every failure to [`OutboundCallError`]
    async fn execute(&self, builder: RequestBuilder) -> Result<Response, OutboundCallError> {
        let response = builder.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        let message = match serde_json::from_str::<ErrorBody>(&body) {
            Ok(ErrorBody {
                error: Some(serde_json::Value::String(msg)),
            }) => msg,
            Ok(ErrorBody { error: Some(other) }) => other.to_string(),
            _ => body,
        };

        warn!("Gateway returned {}: {}", status, message);
        Err(OutboundCallError::status(status.as_u16(), message))
    }

    async fn execute_json<T: DeserializeOwned>(
        &self,
        builder: RequestBuilder,
    ) -> Result<T, OutboundCallError> {
        let response = self.execute(builder).await?;
        let status = response.status().as_u16();
        response.json::<T>().await.map_err(|e| {
            OutboundCallError::status(status, format!("failed to parse response: {}", e))
        })
    }

    // =========================================================================
    // OA Account APIs
    // =========================================================================

    /// Get a specific connected account
    pub async fn get_account(&self, account_id: &str) -> Result<Account, OutboundCallError> {
        self.execute_json(self.request(Method::GET, &format!("/{}", account_id)))
            .await
    }

    /// Disconnect an account from the gateway
    pub async fn disconnect_account(&self, account_id: &str) -> Result<(), OutboundCallError> {
        self.execute(self.request(Method::DELETE, &format!("/{}", account_id)))
            .await?;
        info!("Disconnected OA account {}", account_id);
        Ok(())
    }

    /// Ask the gateway to refresh the account's platform access token
    pub async fn refresh_token(
        &self,
        account_id: &str,
    ) -> Result<serde_json::Value, OutboundCallError> {
        let response = self
            .execute(self.request(Method::POST, &format!("/{}/refresh-token", account_id)))
            .await?;
        let body = response.text().await?;
        if body.trim().is_empty() {
            return Ok(serde_json::Value::Null);
        }
        serde_json::from_str(&body)
            .map_err(|e| OutboundCallError::transport(format!("failed to parse response: {}", e)))
    }

    // =========================================================================
    // Messaging APIs
    // =========================================================================

    /// Get message history with a Zalo user
    pub async fn get_messages(
        &self,
        account_id: &str,
        zalo_user_id: &str,
        offset: u32,
        limit: u32,
    ) -> Result<Vec<ConversationMessage>, OutboundCallError> {
        let builder = self
            .request(Method::GET, &format!("/{}/messages", account_id))
            .query(&[
                ("zaloUserId", zalo_user_id.to_string()),
                ("offset", offset.to_string()),
                ("limit", limit.to_string()),
            ]);
        let page: MessagePage = self.execute_json(builder).await?;
        Ok(page.messages)
    }
}

#[async_trait]
impl OaApi for ZaloApiClient {
    async fn send_message(
        &self,
        account_id: &str,
        request: &OutboundMessageRequest,
    ) -> Result<SendMessageResult, OutboundCallError> {
        if !request.is_meaningful() {
            return Err(OutboundCallError::rejected(
                "refusing to send a message without recipient or content",
            ));
        }

        debug!(
            "Sending {:?} message to user {} via account {}",
            request.message_type, request.recipient_id, account_id
        );

        let builder = self
            .request(Method::POST, &format!("/{}/messages", account_id))
            .json(request);
        let result: SendMessageResult = self.execute_json(builder).await?;

        info!(
            "Message sent to {}, message_id: {:?}",
            request.recipient_id, result.message_id
        );
        Ok(result)
    }

    async fn list_accounts(&self) -> Result<Vec<Account>, OutboundCallError> {
        let list: AccountList = self.execute_json(self.request(Method::GET, "")).await?;
        debug!("Gateway reports {} connected accounts", list.items.len());
        Ok(list.items)
    }

    async fn get_followers(
        &self,
        account_id: &str,
        offset: u32,
        limit: u32,
    ) -> Result<Vec<Follower>, OutboundCallError> {
        let builder = self
            .request(Method::GET, &format!("/{}/followers", account_id))
            .query(&[("offset", offset), ("limit", limit)]);
        let page: FollowerPage = self.execute_json(builder).await?;
        Ok(page.followers)
    }
}

// =============================================================================
// Tests
// =============================================================================
