//! # qbo-client
//!
//! Token cache, token lifecycle manager and API client for QuickBooks Online.
//!
//! Credentials live in a persistent [`TokenStore`] (usually database functions reached through
//! [`RpcTokenStore`]). A [`TokenManager`] created once per session memoizes reads from it,
//! collapsing concurrent reads of the same user and realm into one store call, and clears its
//! cache before every store, refresh or revoke. The [`Client`] builds authenticated requests on
//! top of the manager and retries rate limits, rejected tokens, transport failures and server
//! errors.
//!
//! You can read more about the accounting API here:
//! [https://developer.intuit.com/app/developer/qbo/docs/get-started](https://developer.intuit.com/app/developer/qbo/docs/get-started)
//!
//! ### Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use qbo_client::{Client, ClientConfig, ManagerConfig, RpcStoreConfig, RpcTokenStore, TokenManager};
//!
//! # async fn example() -> qbo_client::Result<()> {
//! let store = RpcTokenStore::new(RpcStoreConfig::from_env()?)?;
//! let manager = Arc::new(TokenManager::new(Arc::new(store), ManagerConfig::from_env()?));
//!
//! let client = Client::new(Arc::clone(&manager), "user_2abc", ClientConfig::from_env()?)?;
//! let report = client
//!     .get_report("9130357766900456", "ProfitAndLoss", &[("date_macro", "Last Fiscal Year")])
//!     .await?;
//! println!("{}", report["Header"]["ReportName"]);
//!
//! // sign-out
//! manager.clear_cache();
//! # Ok(())
//! # }
//! ```

pub mod cache;
mod client_error;
mod client;
pub mod config;
pub mod manager;
pub mod oauth;
pub mod response;
mod rpc_store;
mod store;
mod token_record;

pub use cache::{CacheKey, TokenCache};
pub use client::{ApiRequest, Client};
pub use client_error::{ClientError, Result};
pub use config::{ClientConfig, Environment, ManagerConfig, OAuthConfig, RpcStoreConfig};
pub use manager::{is_token_expired, needs_refresh, TokenManager};
pub use oauth::IntuitOAuth;
pub use response::{ApiErrorDetail, ApiResponse, ResponseBody};
pub use rpc_store::RpcTokenStore;
pub use store::{MemoryTokenStore, TokenStore};
pub use token_record::{
    abbreviate_token, AdminChangeRecord, StoreTokenParams, StoreTokenResult, TokenGrant, TokenLookup, TokenRecord,
};
