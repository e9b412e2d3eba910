//! Token store reached through PostgREST remote procedure calls (Supabase).
//!
//! Every operation is `POST {base}/rest/v1/rpc/{function}` with a JSON body of
//! `p_`-prefixed arguments. The database functions own the upsert-or-transfer logic and the
//! admin-change audit table.

use crate::client_error::{ClientError, Result};
use crate::config::RpcStoreConfig;
use crate::store::TokenStore;
use crate::token_record::{AdminChangeRecord, StoreTokenParams, StoreTokenResult, TokenLookup, TokenRecord};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::debug;

const STORE_TOKEN: &str = "store_qbo_token";
const GET_TOKEN: &str = "get_qbo_token";
const REFRESH_TOKEN: &str = "refresh_qbo_token";
const REVOKE_TOKEN: &str = "revoke_qbo_token";
const GET_ADMIN_CHANGES: &str = "get_qbo_admin_changes";

pub struct RpcTokenStore {
    config: RpcStoreConfig,
    http: reqwest::Client,
}

impl RpcTokenStore {
    pub fn new(config: RpcStoreConfig) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(config.timeout).build()?;

        Ok(RpcTokenStore { config, http })
    }

    async fn call<A: Serialize, T: DeserializeOwned>(&self, function: &str, args: &A) -> Result<T> {
        let url = format!("{}/rest/v1/rpc/{}", self.config.base_url, function);
        debug!(function, "calling token store");

        let response = self
            .http
            .post(url.as_str())
            .header("apikey", &self.config.api_key)
            .bearer_auth(&self.config.api_key)
            .json(args)
            .send()
            .await?;

        let status = response.status();
        let raw_response = response.text().await?;

        if !status.is_success() {
            return Err(ClientError::Backend(format!(
                "{} failed with {}: {}",
                function,
                status.as_u16(),
                backend_message(&raw_response)
            )));
        }

        serde_json::from_str(&raw_response)
            .map_err(|err| ClientError::MalformedResponse(format!("{}: {}", function, err)))
    }
}

/// PostgREST errors carry a `message` field; anything else is passed through.
fn backend_message(raw_response: &str) -> String {
    serde_json::from_str::<Value>(raw_response)
        .ok()
        .and_then(|value| value.get("message").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| raw_response.to_string())
}

fn parse_lookup(value: Value) -> Result<TokenLookup> {
    match value {
        Value::Null => Ok(TokenLookup::None),
        Value::Array(rows) if rows.is_empty() => Ok(TokenLookup::None),
        Value::Array(rows) => {
            let tokens = rows
                .into_iter()
                .map(serde_json::from_value::<TokenRecord>)
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(TokenLookup::Many(tokens))
        }
        value @ Value::Object(_) => Ok(TokenLookup::One(serde_json::from_value(value)?)),
        other => Err(ClientError::MalformedResponse(format!("unexpected token payload: {}", other))),
    }
}

#[async_trait]
impl TokenStore for RpcTokenStore {
    async fn store_token(&self, user_id: &str, params: &StoreTokenParams) -> Result<StoreTokenResult> {
        self.call(
            STORE_TOKEN,
            &json!({
                "p_user_id": user_id,
                "p_realm_id": params.realm_id,
                "p_access_token": params.access_token,
                "p_refresh_token": params.refresh_token,
                "p_expires_in": params.expires_in,
                "p_company_name": params.company_name,
            }),
        )
        .await
    }

    async fn get_token(&self, user_id: &str, realm_id: Option<&str>) -> Result<TokenLookup> {
        let value: Value = self
            .call(GET_TOKEN, &json!({ "p_user_id": user_id, "p_realm_id": realm_id }))
            .await?;

        parse_lookup(value)
    }

    async fn refresh_token(
        &self,
        user_id: &str,
        realm_id: &str,
        access_token: &str,
        refresh_token: &str,
        expires_in: i64,
    ) -> Result<bool> {
        self.call(
            REFRESH_TOKEN,
            &json!({
                "p_user_id": user_id,
                "p_realm_id": realm_id,
                "p_access_token": access_token,
                "p_refresh_token": refresh_token,
                "p_expires_in": expires_in,
            }),
        )
        .await
    }

    async fn revoke_token(&self, user_id: &str, realm_id: Option<&str>) -> Result<u64> {
        self.call(REVOKE_TOKEN, &json!({ "p_user_id": user_id, "p_realm_id": realm_id }))
            .await
    }

    async fn get_admin_changes(&self, user_id: &str, realm_id: &str) -> Result<Vec<AdminChangeRecord>> {
        let value: Value = self
            .call(GET_ADMIN_CHANGES, &json!({ "p_user_id": user_id, "p_realm_id": realm_id }))
            .await?;

        match value {
            Value::Null => Ok(Vec::new()),
            value => Ok(serde_json::from_value(value)?),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::{Matcher, Server};

    const TOKEN_ROW: &str = r#"{
        "realm_id": "9130",
        "user_id": "user_a",
        "access_token": "access",
        "refresh_token": "refresh",
        "expires_at": "2030-01-01T00:00:00Z",
        "created_at": "2029-12-31T23:00:00Z",
        "updated_at": "2029-12-31T23:00:00Z",
        "is_active": true,
        "company_name": null
    }"#;

    fn get_store(server: &Server) -> RpcTokenStore {
        RpcTokenStore::new(RpcStoreConfig::new(&server.url(), "service-key")).unwrap()
    }

    #[tokio::test]
    async fn store_token_sends_prefixed_arguments() {
        let mut server = Server::new_async().await;
        let mocker = server
            .mock("POST", "/rest/v1/rpc/store_qbo_token")
            .match_header("apikey", "service-key")
            .match_header("authorization", "Bearer service-key")
            .match_body(Matcher::PartialJson(json!({
                "p_user_id": "user_b",
                "p_realm_id": "9130",
                "p_expires_in": 3600,
            })))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"success":true,"admin_changed":true,"previous_admin":"user_a"}"#)
            .create_async()
            .await;

        let result = get_store(&server)
            .store_token("user_b", &StoreTokenParams::new("9130", "access", "refresh"))
            .await
            .unwrap();

        mocker.assert_async().await;
        assert!(result.admin_changed);
        assert_eq!(result.previous_admin.as_deref(), Some("user_a"));
    }

    #[tokio::test]
    async fn get_token_shapes() {
        let mut server = Server::new_async().await;
        server
            .mock("POST", "/rest/v1/rpc/get_qbo_token")
            .match_body(Matcher::PartialJson(json!({ "p_realm_id": "9130" })))
            .with_status(200)
            .with_body(TOKEN_ROW)
            .create_async()
            .await;
        server
            .mock("POST", "/rest/v1/rpc/get_qbo_token")
            .match_body(Matcher::PartialJson(json!({ "p_realm_id": null })))
            .with_status(200)
            .with_body(format!("[{}]", TOKEN_ROW))
            .create_async()
            .await;
        server
            .mock("POST", "/rest/v1/rpc/get_qbo_token")
            .match_body(Matcher::PartialJson(json!({ "p_realm_id": "missing" })))
            .with_status(200)
            .with_body("null")
            .create_async()
            .await;

        let store = get_store(&server);

        assert!(matches!(store.get_token("user_a", Some("9130")).await.unwrap(), TokenLookup::One(_)));
        assert!(matches!(store.get_token("user_a", None).await.unwrap(), TokenLookup::Many(ref t) if t.len() == 1));
        assert_eq!(store.get_token("user_a", Some("missing")).await.unwrap(), TokenLookup::None);
    }

    #[tokio::test]
    async fn backend_error_is_surfaced() {
        let mut server = Server::new_async().await;
        server
            .mock("POST", "/rest/v1/rpc/revoke_qbo_token")
            .with_status(400)
            .with_body(r#"{"code":"P0001","message":"permission denied"}"#)
            .create_async()
            .await;

        let error = get_store(&server).revoke_token("user_a", None).await.unwrap_err();

        assert_eq!(
            error,
            ClientError::Backend(String::from("revoke_qbo_token failed with 400: permission denied"))
        );
    }

    #[tokio::test]
    async fn unparsable_body_is_malformed() {
        let mut server = Server::new_async().await;
        server
            .mock("POST", "/rest/v1/rpc/refresh_qbo_token")
            .with_status(200)
            .with_body("\"yes\"")
            .create_async()
            .await;

        let error = get_store(&server)
            .refresh_token("user_a", "9130", "a", "r", 3600)
            .await
            .unwrap_err();

        assert!(matches!(error, ClientError::MalformedResponse(_)));
    }

    #[test]
    fn empty_array_is_no_token() {
        assert_eq!(parse_lookup(json!([])).unwrap(), TokenLookup::None);
        assert!(parse_lookup(json!(42)).is_err());
    }
}
