//! Outbound reply sending with a bounded local retry

use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::accounts::AccountResolver;
use crate::error::HandlerError;
use crate::types::{OutboundMessageRequest, SendMessageResult};
use crate::zalo_api::OaApi;

/// Sends replies through the gateway on behalf of handlers
pub struct ReplySender {
    api: Arc<dyn OaApi>,
    accounts: AccountResolver,
    max_attempts: u32,
    retry_delay: Duration,
}

impl ReplySender {
    pub fn new(api: Arc<dyn OaApi>, accounts: AccountResolver, max_attempts: u32) -> Self {
        Self {
            api,
            accounts,
            max_attempts: max_attempts.max(1),
            retry_delay: Duration::from_millis(500),
        }
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Send `request` through the account owning `oa_id`
    ///
    /// Only transient gateway failures are retried, at most `max_attempts`
    /// times in total. The last error is returned to the caller.
    pub async fn send(
        &self,
        oa_id: Option<&str>,
        request: OutboundMessageRequest,
    ) -> Result<SendMessageResult, HandlerError> {
        let account_id = self.accounts.resolve(oa_id).await?;

        let mut attempt = 1;
        loop {
            match self.api.send_message(&account_id, &request).await {
                Ok(result) => {
                    info!(
                        "Reply sent to {} (attempt {}/{})",
                        request.recipient_id, attempt, self.max_attempts
                    );
                    return Ok(result);
                }
                Err(e) if e.is_transient() && attempt < self.max_attempts => {
                    warn!(
                        "Reply to {} failed (attempt {}/{}): {}",
                        request.recipient_id, attempt, self.max_attempts, e
                    );
                    tokio::time::sleep(self.retry_delay * attempt).await;
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::OutboundCallError;
    use crate::handlers::testing::FakeApi;

    fn sender(api: Arc<FakeApi>, attempts: u32) -> ReplySender {
        let accounts = AccountResolver::new(api.clone(), Some("acc-1".to_string()));
        ReplySender::new(api, accounts, attempts).with_retry_delay(Duration::ZERO)
    }

    #[tokio::test]
    async fn test_single_attempt_by_default() {
        let api = Arc::new(FakeApi::default());
        api.fail_next_sends(1, OutboundCallError::status(503, "busy"));

        let err = sender(api.clone(), 1)
            .send(None, OutboundMessageRequest::text("u1", "hi"))
            .await
            .unwrap_err();
        assert!(matches!(err, HandlerError::Outbound(_)));
        assert_eq!(api.send_attempts(), 1);
    }

    #[tokio::test]
    async fn test_retries_transient_failures() {
        let api = Arc::new(FakeApi::default());
        api.fail_next_sends(2, OutboundCallError::transport("timeout"));

        sender(api.clone(), 3)
            .send(None, OutboundMessageRequest::text("u1", "hi"))
            .await
            .unwrap();
        assert_eq!(api.send_attempts(), 3);
        assert_eq!(api.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_does_not_retry_client_errors() {
        let api = Arc::new(FakeApi::default());
        api.fail_next_sends(5, OutboundCallError::status(400, "bad user"));

        let err = sender(api.clone(), 3)
            .send(None, OutboundMessageRequest::text("u1", "hi"))
            .await
            .unwrap_err();
        assert!(matches!(err, HandlerError::Outbound(ref e) if e.status == Some(400)));
        assert_eq!(api.send_attempts(), 1);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let api = Arc::new(FakeApi::default());
        api.fail_next_sends(10, OutboundCallError::status(502, "bad gateway"));

        assert!(
            sender(api.clone(), 2)
                .send(None, OutboundMessageRequest::text("u1", "hi"))
                .await
                .is_err()
        );
        assert_eq!(api.send_attempts(), 2);
    }

    #[tokio::test]
    async fn test_does_not_retry_rejected_requests() {
        let api = Arc::new(FakeApi::default());
        api.fail_next_sends(5, OutboundCallError::rejected("no content"));

        let err = sender(api.clone(), 3)
            .send(None, OutboundMessageRequest::text("u1", ""))
            .await
            .unwrap_err();
        assert!(matches!(err, HandlerError::Outbound(ref e) if e.rejected));
        assert_eq!(api.send_attempts(), 1);
    }
}
