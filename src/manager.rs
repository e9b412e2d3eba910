//! Token cache/lifecycle manager.
//!
//! The single in-process choke point for reading and mutating a user's QuickBooks
//! credentials. Reads are memoized per `(user, realm)` for the cache TTL; every mutation
//! clears the cache *before* it reaches the store, so a read issued after the mutation
//! started can never be served a value cached before it.
//!
//! Tokens inside the refresh threshold are only flagged (`needs_refresh`). Renewing them is
//! always an explicit call to [`TokenManager::refresh_token`] or [`TokenManager::renew_token`].

use crate::cache::{CacheKey, TokenCache};
use crate::client_error::{ClientError, Result};
use crate::config::ManagerConfig;
use crate::oauth::IntuitOAuth;
use crate::store::TokenStore;
use crate::token_record::{
    abbreviate_token, AdminChangeRecord, StoreTokenParams, StoreTokenResult, TokenLookup, TokenRecord,
    DEFAULT_EXPIRES_IN,
};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Whether the access token has expired at `now`.
pub fn is_token_expired(token: &TokenRecord, now: DateTime<Utc>) -> bool {
    token.expires_at <= now
}

/// Whether the time left before expiry is within `threshold`.
pub fn needs_refresh(token: &TokenRecord, threshold: Duration, now: DateTime<Utc>) -> bool {
    match chrono::Duration::from_std(threshold) {
        Ok(threshold) => token.time_to_expiry(now) <= threshold,
        // a threshold beyond chrono's range covers every token
        Err(_) => true,
    }
}

pub struct TokenManager {
    store: Arc<dyn TokenStore>,
    cache: TokenCache,
    config: ManagerConfig,
}

impl TokenManager {
    /// Create a manager at session start. The cache lives as long as the manager.
    pub fn new(store: Arc<dyn TokenStore>, config: ManagerConfig) -> Self {
        TokenManager {
            cache: TokenCache::new(config.cache_ttl),
            store,
            config,
        }
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn cache(&self) -> &TokenCache {
        &self.cache
    }

    /// Get the token of one realm, or all tokens of the user when `realm_id` is `None`.
    ///
    /// Concurrent calls for the same key share one store call. Returned tokens carry a
    /// `needs_refresh` flag computed against the refresh threshold.
    pub async fn get_token(&self, user_id: &str, realm_id: Option<&str>) -> Result<TokenLookup> {
        require_user(user_id)?;

        let key = CacheKey::new(user_id, realm_id);
        let (fetch, joined) = self.cache.get_or_insert_with(&key, || {
            let store = Arc::clone(&self.store);
            let threshold = self.config.refresh_threshold;
            let user_id = key.user_id.clone();
            let realm_id = key.realm_id.clone();

            async move {
                let mut lookup = store.get_token(&user_id, realm_id.as_deref()).await?;
                flag_stale_tokens(&mut lookup, threshold);
                Ok(lookup)
            }
        });

        if joined {
            debug!(key = %key, "token cache hit");
        } else {
            debug!(key = %key, "token cache miss, fetching from store");
        }

        fetch.await
    }

    /// Access token of one realm, for building authenticated requests.
    pub async fn access_token(&self, user_id: &str, realm_id: &str) -> Result<String> {
        let lookup = self.get_token(user_id, Some(realm_id)).await?;

        match lookup.for_realm(realm_id) {
            Some(token) => {
                if is_token_expired(token, Utc::now()) {
                    warn!(realm_id, "using an expired QuickBooks access token");
                }
                Ok(token.access_token.clone())
            }
            None => Err(ClientError::TokenNotFound {
                realm_id: realm_id.to_string(),
            }),
        }
    }

    /// Persist a renewed credential pair, retrying the store with exponential backoff.
    pub async fn refresh_token(
        &self,
        user_id: &str,
        realm_id: &str,
        access_token: &str,
        refresh_token: &str,
        expires_in: Option<i64>,
    ) -> Result<bool> {
        require_user(user_id)?;
        self.cache.clear();

        let expires_in = expires_in.unwrap_or(DEFAULT_EXPIRES_IN);
        let attempts = self.config.max_retry_attempts.max(1);
        let mut last_error = None;

        for attempt in 1..=attempts {
            match self
                .store
                .refresh_token(user_id, realm_id, access_token, refresh_token, expires_in)
                .await
            {
                Ok(refreshed) => {
                    info!(
                        user_id,
                        realm_id,
                        attempt,
                        refreshed,
                        access_token = %abbreviate_token(access_token),
                        "stored refreshed token"
                    );
                    return Ok(refreshed);
                }
                Err(err) => {
                    warn!(user_id, realm_id, attempt, error = %err, "token refresh attempt failed");
                    last_error = Some(err);

                    if attempt < attempts {
                        tokio::time::sleep(self.backoff_delay(attempt)).await;
                    }
                }
            }
        }

        let source = last_error.unwrap_or_else(|| ClientError::Backend(String::from("no refresh attempt made")));
        error!(user_id, realm_id, attempts, error = %source, "token refresh failed");

        Err(ClientError::RequestFailed {
            attempts,
            source: Box::new(source),
        })
    }

    /// Store a freshly issued token, reporting whether the realm changed owner.
    pub async fn store_token(&self, user_id: &str, params: &StoreTokenParams) -> Result<StoreTokenResult> {
        require_user(user_id)?;
        self.cache.clear();

        let result = self.store.store_token(user_id, params).await?;

        if result.admin_changed {
            info!(
                realm_id = %params.realm_id,
                new_admin = user_id,
                previous_admin = ?result.previous_admin,
                "QuickBooks company admin changed"
            );
        } else {
            debug!(user_id, realm_id = %params.realm_id, "stored token");
        }

        Ok(result)
    }

    /// Revoke one realm's token, or all of the user's tokens.
    pub async fn revoke_token(&self, user_id: &str, realm_id: Option<&str>) -> Result<u64> {
        require_user(user_id)?;
        self.cache.clear();

        let revoked = self.store.revoke_token(user_id, realm_id).await?;
        info!(user_id, realm_id = ?realm_id, revoked, "revoked tokens");

        Ok(revoked)
    }

    pub async fn get_admin_changes(&self, user_id: &str, realm_id: &str) -> Result<Vec<AdminChangeRecord>> {
        require_user(user_id)?;
        self.store.get_admin_changes(user_id, realm_id).await
    }

    /// Renew a realm's token through Intuit and persist the new pair.
    pub async fn renew_token(&self, user_id: &str, realm_id: &str, oauth: &IntuitOAuth) -> Result<bool> {
        let lookup = self.get_token(user_id, Some(realm_id)).await?;
        let current = lookup.for_realm(realm_id).ok_or_else(|| ClientError::TokenNotFound {
            realm_id: realm_id.to_string(),
        })?;

        let grant = oauth.refresh(&current.refresh_token).await?;
        let access_token = grant
            .access_token
            .ok_or_else(|| ClientError::OAuth(String::from("No token received")))?;
        // Intuit may rotate the refresh token; keep the old one when it does not
        let refresh_token = grant.refresh_token.unwrap_or_else(|| current.refresh_token.clone());

        self.refresh_token(user_id, realm_id, &access_token, &refresh_token, grant.expires_in)
            .await
    }

    /// Drop cached fetches for one realm so the next read goes to the store.
    pub fn invalidate_realm(&self, realm_id: &str) {
        debug!(realm_id, "invalidating cached token");
        self.cache.clear_realm(realm_id);
    }

    /// Drop every cached fetch. Call at sign-out.
    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    pub fn is_token_expired(&self, token: &TokenRecord) -> bool {
        is_token_expired(token, Utc::now())
    }

    pub fn needs_refresh(&self, token: &TokenRecord) -> bool {
        needs_refresh(token, self.config.refresh_threshold, Utc::now())
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        self.config.retry_backoff_base.saturating_mul(1u32 << shift)
    }
}

fn require_user(user_id: &str) -> Result<()> {
    if user_id.trim().is_empty() {
        return Err(ClientError::AuthenticationRequired);
    }
    Ok(())
}

fn flag_stale_tokens(lookup: &mut TokenLookup, threshold: Duration) {
    let now = Utc::now();

    for token in lookup.tokens_mut() {
        token.needs_refresh = needs_refresh(token, threshold, now);
        if token.needs_refresh {
            warn!(
                realm_id = %token.realm_id,
                expires_at = %token.expires_at,
                "token is within the refresh threshold"
            );
        }
    }
}
