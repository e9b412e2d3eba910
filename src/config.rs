//! Explicit configuration for the token manager, the API client, the OAuth endpoints and the
//! RPC token store.
//!
//! Every struct has defaults and an optional `from_env()` constructor; nothing in the crate
//! reads the environment on its own.

use crate::client_error::{ClientError, Result};
use std::str::FromStr;
use std::time::Duration;

/// Default time-to-live of a memoized token fetch.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(60);

/// Default remaining validity under which a token is flagged for renewal.
pub const DEFAULT_REFRESH_THRESHOLD: Duration = Duration::from_secs(12 * 60 * 60);

/// Default number of attempts for a token refresh against the store.
pub const DEFAULT_MAX_RETRY_ATTEMPTS: u32 = 3;

/// Default base delay of the refresh backoff, doubled on every retry.
pub const DEFAULT_RETRY_BACKOFF_BASE: Duration = Duration::from_secs(2);

/// Default network timeout for API requests.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default `minorversion` sent with every accounting API call.
const DEFAULT_MINOR_VERSION: u32 = 73;

const PRODUCTION_BASE_URL: &str = "https://quickbooks.api.intuit.com";
const SANDBOX_BASE_URL: &str = "https://sandbox-quickbooks.api.intuit.com";

const AUTHORIZATION_URL: &str = "https://appcenter.intuit.com/connect/oauth2";
const TOKEN_URL: &str = "https://oauth.platform.intuit.com/oauth2/v1/tokens/bearer";
const REVOKE_URL: &str = "https://developer.api.intuit.com/v2/oauth2/tokens/revoke";
const ACCOUNTING_SCOPE: &str = "com.intuit.quickbooks.accounting";

/// Settings of the token cache/lifecycle manager.
#[derive(Debug, Clone, PartialEq)]
pub struct ManagerConfig {
    pub cache_ttl: Duration,
    pub refresh_threshold: Duration,
    pub max_retry_attempts: u32,
    pub retry_backoff_base: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        ManagerConfig {
            cache_ttl: DEFAULT_CACHE_TTL,
            refresh_threshold: DEFAULT_REFRESH_THRESHOLD,
            max_retry_attempts: DEFAULT_MAX_RETRY_ATTEMPTS,
            retry_backoff_base: DEFAULT_RETRY_BACKOFF_BASE,
        }
    }
}

impl ManagerConfig {
    /// Load from `QBO_TOKEN_CACHE_TTL_SECS`, `QBO_REFRESH_THRESHOLD_HOURS`,
    /// `QBO_MAX_RETRY_ATTEMPTS` and `QBO_RETRY_BACKOFF_MS`. Unset variables keep their default.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F: Fn(&str) -> Option<String>>(lookup: F) -> Result<Self> {
        let defaults = ManagerConfig::default();

        Ok(ManagerConfig {
            cache_ttl: parse_var::<u64, _>(&lookup, "QBO_TOKEN_CACHE_TTL_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.cache_ttl),
            refresh_threshold: match parse_var::<u64, _>(&lookup, "QBO_REFRESH_THRESHOLD_HOURS")? {
                Some(hours) => hours
                    .checked_mul(60 * 60)
                    .map(Duration::from_secs)
                    .ok_or_else(|| {
                        ClientError::Config(format!("QBO_REFRESH_THRESHOLD_HOURS too large: {}", hours))
                    })?,
                None => defaults.refresh_threshold,
            },
            max_retry_attempts: parse_var::<u32, _>(&lookup, "QBO_MAX_RETRY_ATTEMPTS")?
                .map(|attempts| attempts.max(1))
                .unwrap_or(defaults.max_retry_attempts),
            retry_backoff_base: parse_var::<u64, _>(&lookup, "QBO_RETRY_BACKOFF_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.retry_backoff_base),
        })
    }
}

/// QuickBooks environment a company lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Production,
    Sandbox,
}

impl Environment {
    pub fn base_url(&self) -> &'static str {
        match self {
            Environment::Production => PRODUCTION_BASE_URL,
            Environment::Sandbox => SANDBOX_BASE_URL,
        }
    }
}

impl FromStr for Environment {
    type Err = ClientError;

    fn from_str(value: &str) -> Result<Self> {
        match value.to_ascii_lowercase().as_str() {
            "production" | "prod" => Ok(Environment::Production),
            "sandbox" | "development" | "dev" => Ok(Environment::Sandbox),
            other => Err(ClientError::Config(format!("unknown QuickBooks environment '{}'", other))),
        }
    }
}

/// Settings of the accounting API client.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    pub base_url: String,
    pub minor_version: u32,
    pub timeout: Duration,
    pub max_attempts: u32,
    pub retry_backoff: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig::for_environment(Environment::Production)
    }
}

impl ClientConfig {
    pub fn for_environment(environment: Environment) -> Self {
        ClientConfig {
            base_url: environment.base_url().to_string(),
            minor_version: DEFAULT_MINOR_VERSION,
            timeout: DEFAULT_TIMEOUT,
            max_attempts: 3,
            retry_backoff: Duration::from_secs(1),
        }
    }

    /// Point the client at another host, e.g. a mock server.
    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    /// Load from `QBO_ENVIRONMENT` (`production` or `sandbox`, default production).
    pub fn from_env() -> Result<Self> {
        let environment = match std::env::var("QBO_ENVIRONMENT") {
            Ok(value) => value.parse()?,
            Err(_) => Environment::Production,
        };

        Ok(ClientConfig::for_environment(environment))
    }
}

/// Intuit OAuth application credentials and endpoints.
#[derive(Debug, Clone, PartialEq)]
pub struct OAuthConfig {
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
    pub scopes: Vec<String>,
    pub authorization_url: String,
    pub token_url: String,
    pub revoke_url: String,
}

impl OAuthConfig {
    pub fn new(client_id: &str, client_secret: &str, redirect_uri: &str) -> Self {
        OAuthConfig {
            client_id: client_id.to_string(),
            client_secret: client_secret.to_string(),
            redirect_uri: redirect_uri.to_string(),
            scopes: vec![ACCOUNTING_SCOPE.to_string()],
            authorization_url: AUTHORIZATION_URL.to_string(),
            token_url: TOKEN_URL.to_string(),
            revoke_url: REVOKE_URL.to_string(),
        }
    }

    /// Load from `QBO_CLIENT_ID`, `QBO_CLIENT_SECRET` and `QBO_REDIRECT_URI`, all required.
    pub fn from_env() -> Result<Self> {
        Ok(OAuthConfig::new(
            &required_var("QBO_CLIENT_ID")?,
            &required_var("QBO_CLIENT_SECRET")?,
            &required_var("QBO_REDIRECT_URI")?,
        ))
    }
}

/// Location and credentials of the PostgREST endpoint exposing the token functions.
#[derive(Debug, Clone, PartialEq)]
pub struct RpcStoreConfig {
    pub base_url: String,
    pub api_key: String,
    pub timeout: Duration,
}

impl RpcStoreConfig {
    pub fn new(base_url: &str, api_key: &str) -> Self {
        RpcStoreConfig {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Load from `SUPABASE_URL` and `SUPABASE_SERVICE_KEY`, both required.
    pub fn from_env() -> Result<Self> {
        Ok(RpcStoreConfig::new(
            &required_var("SUPABASE_URL")?,
            &required_var("SUPABASE_SERVICE_KEY")?,
        ))
    }
}

fn required_var(key: &str) -> Result<String> {
    std::env::var(key).map_err(|_| ClientError::Config(format!("{} is required", key)))
}

fn parse_var<T, F>(lookup: &F, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ClientError::Config(format!("invalid value for {}: '{}'", key, raw))),
        None => Ok(None),
    }
}
