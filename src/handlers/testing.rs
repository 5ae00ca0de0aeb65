//! In-memory gateway double for handler and dispatcher tests

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::error::OutboundCallError;
use crate::types::{Account, Follower, OutboundMessageRequest, SendMessageResult};
use crate::zalo_api::OaApi;

#[derive(Default)]
pub struct FakeApi {
    accounts: Vec<Account>,
    sent: Mutex<Vec<(String, OutboundMessageRequest)>>,
    send_attempts: AtomicUsize,
    pending_failures: Mutex<Option<(usize, OutboundCallError)>>,
    fail_lists: AtomicBool,
    list_calls: AtomicUsize,
}

impl FakeApi {
    pub fn with_accounts(accounts: Vec<Account>) -> Self {
        Self {
            accounts,
            ..Default::default()
        }
    }

    /// Make the next `count` sends fail with `error`
    pub fn fail_next_sends(&self, count: usize, error: OutboundCallError) {
        *self.pending_failures.lock() = Some((count, error));
    }

    pub fn fail_lists(&self, fail: bool) {
        self.fail_lists.store(fail, Ordering::SeqCst);
    }

    /// Successful sends, as (account id, request)
    pub fn sent(&self) -> Vec<(String, OutboundMessageRequest)> {
        self.sent.lock().clone()
    }

    pub fn send_attempts(&self) -> usize {
        self.send_attempts.load(Ordering::SeqCst)
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl OaApi for FakeApi {
    async fn send_message(
        &self,
        account_id: &str,
        request: &OutboundMessageRequest,
    ) -> Result<SendMessageResult, OutboundCallError> {
        let n = self.send_attempts.fetch_add(1, Ordering::SeqCst) + 1;

        {
            let mut pending = self.pending_failures.lock();
            if let Some((remaining, error)) = pending.as_mut()
                && *remaining > 0
            {
                *remaining -= 1;
                return Err(error.clone());
            }
        }

        self.sent
            .lock()
            .push((account_id.to_string(), request.clone()));
        Ok(SendMessageResult {
            message_id: Some(format!("m-{}", n)),
            sent_at: Some("2026-10-18T00:00:00Z".to_string()),
        })
    }

    async fn list_accounts(&self) -> Result<Vec<Account>, OutboundCallError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_lists.load(Ordering::SeqCst) {
            return Err(OutboundCallError::status(500, "list failed"));
        }
        Ok(self.accounts.clone())
    }

    async fn get_followers(
        &self,
        _account_id: &str,
        _offset: u32,
        _limit: u32,
    ) -> Result<Vec<Follower>, OutboundCallError> {
        Ok(Vec::new())
    }
}
