//! Maps platform `oa_id`s from events to gateway account ids

use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::error::HandlerError;
use crate::zalo_api::OaApi;

/// Resolves the gateway account that owns an Official Account
///
/// Lookups hit an in-memory cache first; a miss refreshes the cache from
/// `list_accounts`, at most once per `refresh_interval`. When nothing matches,
/// or the listing fails, the configured fallback account is used.
pub struct AccountResolver {
    api: Arc<dyn OaApi>,
    /// oa_id -> gateway account id
    cache: DashMap<String, String>,
    fallback: Option<String>,
    refresh_interval: Duration,
    last_refresh: Mutex<Option<Instant>>,
}

impl AccountResolver {
    pub fn new(api: Arc<dyn OaApi>, fallback: Option<String>) -> Self {
        Self {
            api,
            cache: DashMap::new(),
            fallback,
            refresh_interval: Duration::from_secs(60),
            last_refresh: Mutex::new(None),
        }
    }

    pub fn with_refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = interval;
        self
    }

    /// Find the account to send through for `oa_id`
    pub async fn resolve(&self, oa_id: Option<&str>) -> Result<String, HandlerError> {
        let Some(oa_id) = oa_id.filter(|id| !id.is_empty()) else {
            return self.fallback_for("<none>");
        };

        if let Some(account_id) = self.cache.get(oa_id) {
            return Ok(account_id.clone());
        }

        if self.claim_refresh() {
            if let Err(e) = self.refresh().await {
                if self.fallback.is_none() {
                    return Err(e);
                }
                warn!("Account listing failed, falling back: {}", e);
            }

            if let Some(account_id) = self.cache.get(oa_id) {
                return Ok(account_id.clone());
            }
        } else {
            debug!("Account refresh throttled for oa_id {}", oa_id);
        }
        self.fallback_for(oa_id)
    }

    /// True when a cache miss may hit the gateway now
    ///
    /// Failed refreshes count too, so an unreachable listing endpoint costs
    /// one call per interval instead of one per event.
    fn claim_refresh(&self) -> bool {
        let mut last = self.last_refresh.lock();
        match *last {
            Some(at) if at.elapsed() < self.refresh_interval => false,
            _ => {
                *last = Some(Instant::now());
                true
            }
        }
    }

    /// Reload the oa_id mapping from the gateway
    pub async fn refresh(&self) -> Result<usize, HandlerError> {
        let accounts = self.api.list_accounts().await?;
        for account in &accounts {
            self.cache.insert(account.oa_id.clone(), account.id.clone());
        }
        debug!("Account cache refreshed with {} entries", accounts.len());
        Ok(accounts.len())
    }

    fn fallback_for(&self, oa_id: &str) -> Result<String, HandlerError> {
        match &self.fallback {
            Some(account_id) => {
                info!("Using fallback account {} for oa_id {}", account_id, oa_id);
                Ok(account_id.clone())
            }
            None => {
                warn!("No gateway account for oa_id {}", oa_id);
                Err(HandlerError::UnresolvedAccount {
                    oa_id: oa_id.to_string(),
                })
            }
        }
    }
}
