//! Calls against the Intuit OAuth 2.0 endpoints.

use crate::client_error::{ClientError, Result};
use crate::config::OAuthConfig;
use crate::token_record::{abbreviate_token, TokenGrant};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

#[derive(Deserialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Serialize)]
struct AuthorizationQuery<'a> {
    client_id: &'a str,
    response_type: &'a str,
    scope: String,
    redirect_uri: &'a str,
    state: &'a str,
}

/// Client for the Intuit authorization, token and revocation endpoints.
pub struct IntuitOAuth {
    config: OAuthConfig,
    http: reqwest::Client,
}

impl IntuitOAuth {
    pub fn new(config: OAuthConfig) -> Self {
        IntuitOAuth {
            config,
            http: reqwest::Client::new(),
        }
    }

    pub fn config(&self) -> &OAuthConfig {
        &self.config
    }

    /// URL the user is sent to in order to connect a QuickBooks company.
    pub fn authorization_url(&self, state: &str) -> Result<String> {
        let query = serde_urlencoded::to_string(AuthorizationQuery {
            client_id: &self.config.client_id,
            response_type: "code",
            scope: self.config.scopes.join(" "),
            redirect_uri: &self.config.redirect_uri,
            state,
        })?;

        Ok(format!("{}?{}", self.config.authorization_url, query))
    }

    /// Exchange the authorization code from the OAuth callback for a token pair.
    pub async fn exchange_code(&self, code: &str) -> Result<TokenGrant> {
        debug!("exchanging authorization code");
        self.token_request(&[
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", self.config.redirect_uri.as_str()),
        ])
        .await
    }

    /// Get a new token pair from Intuit. Guarantees an access token when it returns `Ok`.
    pub async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant> {
        debug!(refresh_token = %abbreviate_token(refresh_token), "refreshing access token");
        self.token_request(&[("grant_type", "refresh_token"), ("refresh_token", refresh_token)])
            .await
    }

    /// Revoke an access or refresh token, disconnecting the company.
    pub async fn revoke(&self, token: &str) -> Result<()> {
        let response = self
            .http
            .post(&self.config.revoke_url)
            .basic_auth(&self.config.client_id, Some(&self.config.client_secret))
            .header(reqwest::header::ACCEPT, "application/json")
            .json(&serde_json::json!({ "token": token }))
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            info!(token = %abbreviate_token(token), "revoked token with Intuit");
            return Ok(());
        }

        let raw_response = response.text().await?;
        Err(ClientError::OAuth(error_message(status.as_u16(), &raw_response)))
    }

    async fn token_request(&self, form: &[(&str, &str)]) -> Result<TokenGrant> {
        let response = self
            .http
            .post(&self.config.token_url)
            .basic_auth(&self.config.client_id, Some(&self.config.client_secret))
            .header(reqwest::header::ACCEPT, "application/json")
            .form(form)
            .send()
            .await?;

        let status = response.status();
        let raw_response = response.text().await?;

        if !status.is_success() {
            return Err(ClientError::OAuth(error_message(status.as_u16(), &raw_response)));
        }

        let grant: TokenGrant = serde_json::from_str(&raw_response)?;

        if let Some(error) = grant.error {
            return Err(ClientError::OAuth(error));
        }

        match &grant.access_token {
            Some(_) => Ok(grant),
            None => Err(ClientError::OAuth(String::from("No token received"))),
        }
    }
}

fn error_message(status: u16, raw_response: &str) -> String {
    match serde_json::from_str::<ErrorResponse>(raw_response) {
        Ok(response) => response.error,
        Err(_) => format!("token endpoint returned {}", status),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::{Matcher, Server};

    fn get_oauth(server: &Server) -> IntuitOAuth {
        let mut config = OAuthConfig::new("id", "secret", "https://app.example.com/callback");
        config.token_url = format!("{}/oauth2/v1/tokens/bearer", server.url());
        config.revoke_url = format!("{}/v2/oauth2/tokens/revoke", server.url());

        IntuitOAuth::new(config)
    }

    #[test]
    fn authorization_url_carries_scope_and_state() {
        let oauth = IntuitOAuth::new(OAuthConfig::new("id", "secret", "https://app.example.com/callback"));

        let url = oauth.authorization_url("csrf123").unwrap();

        assert!(url.starts_with("https://appcenter.intuit.com/connect/oauth2?"));
        assert!(url.contains("client_id=id"));
        assert!(url.contains("response_type=code"));
        assert!(url.contains("scope=com.intuit.quickbooks.accounting"));
        assert!(url.contains("redirect_uri=https%3A%2F%2Fapp.example.com%2Fcallback"));
        assert!(url.contains("state=csrf123"));
    }

    #[tokio::test]
    /// Tests that a valid token pair is returned from the refresh grant.
    async fn refresh_success() {
        let mut server = Server::new_async().await;
        let body = r#"{"token_type":"bearer","expires_in":3600,"refresh_token":"AB11-new","x_refresh_token_expires_in":8726400,"access_token":"eyJlbmMiOiJBMTI4Q0JDLUhTMjU2"}"#;
        let mocker = server
            .mock("POST", "/oauth2/v1/tokens/bearer")
            .match_header("authorization", Matcher::Regex(String::from("^Basic ")))
            .match_body(Matcher::AllOf(vec![
                Matcher::UrlEncoded(String::from("grant_type"), String::from("refresh_token")),
                Matcher::UrlEncoded(String::from("refresh_token"), String::from("AB11-old")),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(body)
            .create_async()
            .await;

        let grant = get_oauth(&server).refresh("AB11-old").await.unwrap();

        mocker.assert_async().await;
        assert_eq!(grant.access_token.as_deref(), Some("eyJlbmMiOiJBMTI4Q0JDLUhTMjU2"));
        assert_eq!(grant.refresh_token.as_deref(), Some("AB11-new"));
        assert_eq!(grant.expires_in, Some(3600));
    }

    #[tokio::test]
    /// Tests that an error is returned when refreshing with an invalid refresh token.
    async fn refresh_invalid_grant() {
        let mut server = Server::new_async().await;
        let mocker = server
            .mock("POST", "/oauth2/v1/tokens/bearer")
            .with_status(400)
            .with_header("content-type", "application/json")
            .with_body(r#"{"error":"invalid_grant"}"#)
            .create_async()
            .await;

        let error = get_oauth(&server).refresh("expired").await.unwrap_err();

        mocker.assert_async().await;
        assert_eq!(error, ClientError::OAuth(String::from("invalid_grant")));
    }

    #[tokio::test]
    async fn exchange_code_without_access_token() {
        let mut server = Server::new_async().await;
        server
            .mock("POST", "/oauth2/v1/tokens/bearer")
            .match_body(Matcher::UrlEncoded(String::from("code"), String::from("abc")))
            .with_status(200)
            .with_body(r#"{"token_type":"bearer"}"#)
            .create_async()
            .await;

        let error = get_oauth(&server).exchange_code("abc").await.unwrap_err();

        assert_eq!(error, ClientError::OAuth(String::from("No token received")));
    }

    #[tokio::test]
    async fn revoke_posts_token() {
        let mut server = Server::new_async().await;
        let mocker = server
            .mock("POST", "/v2/oauth2/tokens/revoke")
            .match_body(Matcher::Json(serde_json::json!({ "token": "AB11-old" })))
            .with_status(200)
            .create_async()
            .await;

        get_oauth(&server).revoke("AB11-old").await.unwrap();

        mocker.assert_async().await;
    }
}
