//! In-process memoization of token fetches.
//!
//! The cache maps a key to the *future* of a fetch, not to its value: the shared handle is
//! inserted before anyone awaits it, so callers arriving while the fetch is still running
//! join it instead of issuing their own backend call.

use crate::client_error::Result;
use crate::token_record::TokenLookup;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

/// A memoized, awaitable token fetch.
pub type SharedFetch = Shared<BoxFuture<'static, Result<TokenLookup>>>;

/// Cache key: a user, optionally narrowed to one realm.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub user_id: String,
    pub realm_id: Option<String>,
}

impl CacheKey {
    pub fn new(user_id: &str, realm_id: Option<&str>) -> Self {
        CacheKey {
            user_id: user_id.to_string(),
            realm_id: realm_id.map(str::to_string),
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.realm_id {
            Some(realm_id) => write!(f, "{}:{}", self.user_id, realm_id),
            None => write!(f, "{}", self.user_id),
        }
    }
}

struct CacheEntry {
    fetch: SharedFetch,
    inserted_at: Instant,
}

/// Time-limited registry of in-flight and resolved token fetches.
pub struct TokenCache {
    ttl: Duration,
    entries: Mutex<HashMap<CacheKey, CacheEntry>>,
}

impl TokenCache {
    pub fn new(ttl: Duration) -> Self {
        TokenCache {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Return the live fetch for `key`, or start one with `make_fetch` and register it.
    ///
    /// The lookup and the insertion happen under one lock with no suspension point between
    /// them; the returned handle is awaited by the caller after the lock is released. The
    /// boolean is `true` when an existing fetch was joined.
    pub fn get_or_insert_with<F, Fut>(&self, key: &CacheKey, make_fetch: F) -> (SharedFetch, bool)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<TokenLookup>> + Send + 'static,
    {
        let ttl = self.ttl;
        let mut entries = self.entries.lock();

        if let Some(entry) = entries.get(key) {
            if entry.inserted_at.elapsed() < ttl {
                return (entry.fetch.clone(), true);
            }
        }

        // Stale entries of other keys go on every miss so the map stays bounded.
        entries.retain(|_, entry| entry.inserted_at.elapsed() < ttl);

        let fetch = make_fetch().boxed().shared();
        entries.insert(
            key.clone(),
            CacheEntry {
                fetch: fetch.clone(),
                inserted_at: Instant::now(),
            },
        );

        (fetch, false)
    }

    /// Drop every entry.
    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    /// Drop the entries that name `realm_id`.
    pub fn clear_realm(&self, realm_id: &str) {
        self.entries
            .lock()
            .retain(|key, _| key.realm_id.as_deref() != Some(realm_id));
    }

    /// Drop entries older than the TTL. Misses in `get_or_insert_with` do the same.
    pub fn purge_expired(&self) -> usize {
        let ttl = self.ttl;
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, entry| entry.inserted_at.elapsed() < ttl);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
