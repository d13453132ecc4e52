//! Single-flight cache for the billing API access token.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use billsync_core::{Clock, SyncError};
use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::transport::CredentialExchange;

pub const DEFAULT_SAFETY_MARGIN_SECS: i64 = 60;
const MAX_TOKEN_LIFETIME_SECS: u64 = 60 * 60 * 24 * 365;

/// Never persisted; replaced wholesale on refresh.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessToken {
    pub value: String,
    pub expires_at: DateTime<Utc>,
}

impl AccessToken {
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

/// The slot lock is held across the exchange, so concurrent callers that
/// miss wait for the in-flight exchange instead of starting their own.
pub struct AccessTokenCache {
    exchanger: Arc<dyn CredentialExchange>,
    clock: Arc<dyn Clock>,
    safety_margin: Duration,
    slot: Mutex<Option<Arc<AccessToken>>>,
    exchanges: AtomicU64,
}

impl AccessTokenCache {
    pub fn new(exchanger: Arc<dyn CredentialExchange>, clock: Arc<dyn Clock>) -> Self {
        Self {
            exchanger,
            clock,
            safety_margin: Duration::seconds(DEFAULT_SAFETY_MARGIN_SECS),
            slot: Mutex::new(None),
            exchanges: AtomicU64::new(0),
        }
    }

    pub async fn get_token(&self, force_refresh: bool) -> Result<Arc<AccessToken>, SyncError> {
        let mut slot = self.slot.lock().await;
        if !force_refresh {
            if let Some(token) = slot.as_ref() {
                if token.is_valid_at(self.clock.now()) {
                    return Ok(token.clone());
                }
            }
        }
        self.exchange_into(&mut slot).await
    }

    /// Refreshes after `rejected` drew a 401, unless another caller already replaced it.
    pub async fn refresh_rejected(&self, rejected: &AccessToken) -> Result<Arc<AccessToken>, SyncError> {
        let mut slot = self.slot.lock().await;
        if let Some(token) = slot.as_ref() {
            if token.value != rejected.value && token.is_valid_at(self.clock.now()) {
                debug!("token already refreshed by a concurrent caller");
                return Ok(token.clone());
            }
        }
        self.exchange_into(&mut slot).await
    }

    pub async fn invalidate(&self) {
        self.slot.lock().await.take();
    }

    /// Number of credential exchanges performed so far.
    pub fn exchange_count(&self) -> u64 {
        self.exchanges.load(Ordering::SeqCst)
    }

    async fn exchange_into(
        &self,
        slot: &mut Option<Arc<AccessToken>>,
    ) -> Result<Arc<AccessToken>, SyncError> {
        // A failed exchange leaves no stale token behind.
        slot.take();
        self.exchanges.fetch_add(1, Ordering::SeqCst);
        let grant = self.exchanger.exchange().await?;
        let lifetime = Duration::seconds(grant.expires_in.min(MAX_TOKEN_LIFETIME_SECS) as i64);
        let usable = (lifetime - self.safety_margin).max(Duration::zero());
        let token = Arc::new(AccessToken {
            value: grant.access_token,
            expires_at: self.clock.now() + usable,
        });
        info!(expires_at = %token.expires_at, "billing access token refreshed");
        *slot = Some(token.clone());
        Ok(token)
    }
}
