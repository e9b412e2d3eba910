//! Persistent token store contract, and an in-memory implementation of it.

use crate::client_error::{ClientError, Result};
use crate::token_record::{AdminChangeRecord, StoreTokenParams, StoreTokenResult, TokenLookup, TokenRecord};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;

/// Remote procedures of the token store. Ownership transfer logic lives behind this trait,
/// never in the manager.
#[async_trait]
pub trait TokenStore: Send + Sync {
    /// Atomically insert a token, or transfer the realm to `user_id` if another user owns it.
    async fn store_token(&self, user_id: &str, params: &StoreTokenParams) -> Result<StoreTokenResult>;

    /// Get the active token for one realm, or every active token of the user when `realm_id`
    /// is `None`.
    async fn get_token(&self, user_id: &str, realm_id: Option<&str>) -> Result<TokenLookup>;

    /// Replace the credential pair of an existing token. Returns `false` when no active token
    /// matched.
    async fn refresh_token(
        &self,
        user_id: &str,
        realm_id: &str,
        access_token: &str,
        refresh_token: &str,
        expires_in: i64,
    ) -> Result<bool>;

    /// Deactivate tokens, returning how many were revoked.
    async fn revoke_token(&self, user_id: &str, realm_id: Option<&str>) -> Result<u64>;

    /// Ownership transfers of a realm that involve the user.
    async fn get_admin_changes(&self, user_id: &str, realm_id: &str) -> Result<Vec<AdminChangeRecord>>;
}

/// Expiry `expires_in` seconds after `now`, or an error when it falls outside chrono's range.
fn expires_at(now: DateTime<Utc>, expires_in: i64) -> Result<DateTime<Utc>> {
    Duration::try_seconds(expires_in)
        .and_then(|lifetime| now.checked_add_signed(lifetime))
        .ok_or_else(|| ClientError::Backend(format!("expires_in out of range: {}", expires_in)))
}

#[derive(Default)]
struct MemoryState {
    tokens: HashMap<String, TokenRecord>,
    admin_changes: Vec<AdminChangeRecord>,
}

/// Token store kept in process memory. Enforces one active token per realm and records admin
/// transfers, like the database functions do.
#[derive(Default)]
pub struct MemoryTokenStore {
    state: Mutex<MemoryState>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        MemoryTokenStore::default()
    }
}

#[async_trait]
impl TokenStore for MemoryTokenStore {
    async fn store_token(&self, user_id: &str, params: &StoreTokenParams) -> Result<StoreTokenResult> {
        let now = Utc::now();
        let expires_at = expires_at(now, params.expires_in)?;
        let mut state = self.state.lock();

        let previous_admin = state
            .tokens
            .get(&params.realm_id)
            .filter(|token| token.is_active && token.user_id != user_id)
            .map(|token| token.user_id.clone());

        if let Some(previous) = &previous_admin {
            state.admin_changes.push(AdminChangeRecord {
                realm_id: params.realm_id.clone(),
                previous_admin: previous.clone(),
                new_admin: user_id.to_string(),
                changed_at: now,
            });
        }

        let created_at = state
            .tokens
            .get(&params.realm_id)
            .filter(|token| token.is_active && token.user_id == user_id)
            .map(|token| token.created_at)
            .unwrap_or(now);

        let company_name = params.company_name.clone().or_else(|| {
            state
                .tokens
                .get(&params.realm_id)
                .and_then(|token| token.company_name.clone())
        });

        state.tokens.insert(
            params.realm_id.clone(),
            TokenRecord {
                realm_id: params.realm_id.clone(),
                user_id: user_id.to_string(),
                access_token: params.access_token.clone(),
                refresh_token: params.refresh_token.clone(),
                expires_at,
                created_at,
                updated_at: now,
                is_active: true,
                company_name,
                needs_refresh: false,
            },
        );

        Ok(StoreTokenResult {
            success: true,
            admin_changed: previous_admin.is_some(),
            previous_admin,
        })
    }

    async fn get_token(&self, user_id: &str, realm_id: Option<&str>) -> Result<TokenLookup> {
        let state = self.state.lock();
        let owned = |token: &&TokenRecord| token.is_active && token.user_id == user_id;

        match realm_id {
            Some(realm_id) => Ok(state
                .tokens
                .get(realm_id)
                .filter(owned)
                .cloned()
                .map(TokenLookup::One)
                .unwrap_or_default()),
            None => {
                let mut tokens: Vec<TokenRecord> = state.tokens.values().filter(owned).cloned().collect();
                tokens.sort_by(|a, b| a.realm_id.cmp(&b.realm_id));

                if tokens.is_empty() {
                    Ok(TokenLookup::None)
                } else {
                    Ok(TokenLookup::Many(tokens))
                }
            }
        }
    }

    async fn refresh_token(
        &self,
        user_id: &str,
        realm_id: &str,
        access_token: &str,
        refresh_token: &str,
        expires_in: i64,
    ) -> Result<bool> {
        let now = Utc::now();
        let expires_at = expires_at(now, expires_in)?;
        let mut state = self.state.lock();

        match state
            .tokens
            .get_mut(realm_id)
            .filter(|token| token.is_active && token.user_id == user_id)
        {
            Some(token) => {
                token.access_token = access_token.to_string();
                token.refresh_token = refresh_token.to_string();
                token.expires_at = expires_at;
                token.updated_at = now;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn revoke_token(&self, user_id: &str, realm_id: Option<&str>) -> Result<u64> {
        let now = Utc::now();
        let mut state = self.state.lock();
        let mut revoked = 0;

        for token in state.tokens.values_mut() {
            let realm_matches = realm_id.map_or(true, |realm_id| token.realm_id == realm_id);
            if token.is_active && token.user_id == user_id && realm_matches {
                token.is_active = false;
                token.updated_at = now;
                revoked += 1;
            }
        }

        Ok(revoked)
    }

    async fn get_admin_changes(&self, user_id: &str, realm_id: &str) -> Result<Vec<AdminChangeRecord>> {
        let state = self.state.lock();

        Ok(state
            .admin_changes
            .iter()
            .filter(|change| change.realm_id == realm_id)
            .filter(|change| change.previous_admin == user_id || change.new_admin == user_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn store_then_get() {
        let store = MemoryTokenStore::new();
        let params = StoreTokenParams::new("realm_x", "access", "refresh").with_company_name("Acme");

        let result = store.store_token("user_a", &params).await.unwrap();
        assert_eq!(result, StoreTokenResult { success: true, admin_changed: false, previous_admin: None });

        match store.get_token("user_a", Some("realm_x")).await.unwrap() {
            TokenLookup::One(token) => {
                assert_eq!(token.access_token, "access");
                assert_eq!(token.company_name.as_deref(), Some("Acme"));
            }
            other => panic!("unexpected lookup: {:?}", other),
        }
    }

    #[tokio::test]
    async fn transfer_records_admin_change() {
        let store = MemoryTokenStore::new();
        let params = StoreTokenParams::new("realm_x", "access", "refresh");

        store.store_token("user_a", &params).await.unwrap();
        let result = store.store_token("user_b", &params).await.unwrap();

        assert!(result.admin_changed);
        assert_eq!(result.previous_admin.as_deref(), Some("user_a"));
        assert!(store.get_token("user_a", Some("realm_x")).await.unwrap().is_empty());

        let changes = store.get_admin_changes("user_a", "realm_x").await.unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].previous_admin, "user_a");
        assert_eq!(changes[0].new_admin, "user_b");
    }

    #[tokio::test]
    async fn same_user_restore_is_not_a_transfer() {
        let store = MemoryTokenStore::new();
        let params = StoreTokenParams::new("realm_x", "access", "refresh");

        store.store_token("user_a", &params).await.unwrap();
        let result = store.store_token("user_a", &params).await.unwrap();

        assert!(!result.admin_changed);
        assert!(store.get_admin_changes("user_a", "realm_x").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn out_of_range_lifetime_is_rejected() {
        let store = MemoryTokenStore::new();
        let huge = StoreTokenParams::new("realm_x", "access", "refresh").with_expires_in(i64::MAX);

        let error = store.store_token("user_a", &huge).await.unwrap_err();
        assert!(matches!(error, ClientError::Backend(_)));
        assert!(store.get_token("user_a", Some("realm_x")).await.unwrap().is_empty());

        store
            .store_token("user_a", &StoreTokenParams::new("realm_x", "access", "refresh"))
            .await
            .unwrap();
        let error = store
            .refresh_token("user_a", "realm_x", "a2", "r2", i64::MIN)
            .await
            .unwrap_err();
        assert!(matches!(error, ClientError::Backend(_)));
        assert_eq!(store.get_token("user_a", Some("realm_x")).await.unwrap().tokens()[0].access_token, "access");
    }

    #[tokio::test]
    async fn get_all_tokens_of_user() {
        let store = MemoryTokenStore::new();
        store.store_token("user_a", &StoreTokenParams::new("2", "a", "r")).await.unwrap();
        store.store_token("user_a", &StoreTokenParams::new("1", "a", "r")).await.unwrap();
        store.store_token("user_b", &StoreTokenParams::new("3", "a", "r")).await.unwrap();

        let tokens = store.get_token("user_a", None).await.unwrap().into_vec();
        let realms: Vec<&str> = tokens.iter().map(|t| t.realm_id.as_str()).collect();

        assert_eq!(realms, vec!["1", "2"]);
        assert_eq!(store.get_token("user_c", None).await.unwrap(), TokenLookup::None);
    }

    #[tokio::test]
    async fn refresh_and_revoke() {
        let store = MemoryTokenStore::new();
        store.store_token("user_a", &StoreTokenParams::new("1", "a", "r")).await.unwrap();
        store.store_token("user_a", &StoreTokenParams::new("2", "a", "r")).await.unwrap();

        assert!(store.refresh_token("user_a", "1", "a2", "r2", 3600).await.unwrap());
        assert!(!store.refresh_token("user_b", "1", "a3", "r3", 3600).await.unwrap());
        assert_eq!(store.get_token("user_a", Some("1")).await.unwrap().tokens()[0].access_token, "a2");

        assert_eq!(store.revoke_token("user_a", Some("1")).await.unwrap(), 1);
        assert_eq!(store.revoke_token("user_a", None).await.unwrap(), 1);
        assert_eq!(store.revoke_token("user_a", None).await.unwrap(), 0);
        assert!(!store.refresh_token("user_a", "1", "a4", "r4", 3600).await.unwrap());
    }
}
