use crate::client_error::{ClientError, Result};
use crate::config::ClientConfig;
use crate::manager::TokenManager;
use crate::response::{parse_error_body, ApiResponse, QueryResponse, ResponseBody};
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, ACCEPT, CONTENT_TYPE, RETRY_AFTER};
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const JSON: &str = "application/json";
const PDF: &str = "application/pdf";

/// One call against the accounting API, relative to `/v3/company/{realmId}/`.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub endpoint: String,
    pub method: Method,
    pub body: Option<Value>,
    pub query_params: Vec<(String, String)>,
    pub accept: String,
}

impl ApiRequest {
    pub fn new(method: Method, endpoint: &str) -> Self {
        ApiRequest {
            endpoint: endpoint.trim_start_matches('/').to_string(),
            method,
            body: None,
            query_params: Vec::new(),
            accept: JSON.to_string(),
        }
    }

    pub fn get(endpoint: &str) -> Self {
        ApiRequest::new(Method::GET, endpoint)
    }

    pub fn post(endpoint: &str, body: Value) -> Self {
        ApiRequest::new(Method::POST, endpoint).with_body(body)
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_query(mut self, key: &str, value: &str) -> Self {
        self.query_params.push((key.to_string(), value.to_string()));
        self
    }

    pub fn with_accept(mut self, accept: &str) -> Self {
        self.accept = accept.to_string();
        self
    }
}

/// Authenticated client for the QuickBooks Online accounting API, acting for one signed-in
/// user. Tokens come from the shared [`TokenManager`]; the client never refreshes them.
pub struct Client {
    manager: Arc<TokenManager>,
    user_id: String,
    config: ClientConfig,
    http: reqwest::Client,
}

impl Client {
    /// Create a new client for `user_id`, sharing the session's token manager.
    pub fn new(manager: Arc<TokenManager>, user_id: &str, config: ClientConfig) -> Result<Client> {
        if user_id.trim().is_empty() {
            return Err(ClientError::AuthenticationRequired);
        }

        let http = reqwest::Client::builder().timeout(config.timeout).build()?;

        Ok(Client {
            manager,
            user_id: user_id.to_string(),
            config,
            http,
        })
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Get the timeout for API requests.
    pub fn timeout(&self) -> Duration {
        self.config.timeout
    }
}

impl Client {
    /// Perform one API call, retrying rate limits, expired credentials, transport failures
    /// and server errors up to `max_attempts` times.
    pub async fn request(&self, realm_id: &str, request: &ApiRequest) -> Result<ApiResponse> {
        let attempts = self.config.max_attempts.max(1);
        let mut last_error = None;

        for attempt in 1..=attempts {
            let token = self.manager.access_token(&self.user_id, realm_id).await?;
            let has_next = attempt < attempts;

            let response = match self.send(realm_id, request, &token).await {
                Ok(response) => response,
                Err(err) => {
                    warn!(realm_id, attempt, error = %err, "request to QuickBooks failed");
                    last_error = Some(err);
                    if has_next {
                        tokio::time::sleep(self.backoff_delay(attempt)).await;
                    }
                    continue;
                }
            };

            let status = response.status();
            debug!(realm_id, attempt, status = status.as_u16(), endpoint = %request.endpoint, "received response");

            if status == StatusCode::TOO_MANY_REQUESTS {
                let retry_after = retry_after(response.headers(), Utc::now());
                warn!(realm_id, attempt, retry_after = ?retry_after, "rate limited by QuickBooks");
                last_error = Some(ClientError::RateLimited {
                    retry_after: retry_after.map(|delay| delay.as_secs()),
                });
                if has_next {
                    let delay = retry_after.unwrap_or_else(|| self.backoff_delay(attempt));
                    tokio::time::sleep(delay).await;
                }
                continue;
            }

            if status == StatusCode::UNAUTHORIZED && has_next {
                warn!(realm_id, attempt, "access token rejected, re-reading from store");
                self.manager.invalidate_realm(realm_id);
                last_error = Some(error_from_response(response).await);
                continue;
            }

            if !status.is_success() {
                let err = error_from_response(response).await;
                if !err.is_transient() {
                    return Err(err);
                }

                warn!(realm_id, attempt, error = %err, "QuickBooks server error");
                last_error = Some(err);
                if has_next {
                    tokio::time::sleep(self.backoff_delay(attempt)).await;
                }
                continue;
            }

            let body = parse_body(response).await?;
            return Ok(ApiResponse {
                status: status.as_u16(),
                body,
            });
        }

        let source = last_error.unwrap_or_else(|| ClientError::Transport(String::from("no attempt made")));

        Err(ClientError::RequestFailed {
            attempts,
            source: Box::new(source),
        })
    }

    async fn send(&self, realm_id: &str, request: &ApiRequest, token: &str) -> Result<reqwest::Response> {
        let url = format!(
            "{}/v3/company/{}/{}",
            self.config.base_url, realm_id, request.endpoint
        );
        let minor_version = self.config.minor_version.to_string();

        let mut builder = self
            .http
            .request(request.method.clone(), url.as_str())
            .bearer_auth(token)
            .header(ACCEPT, request.accept.as_str())
            .query(&[("minorversion", minor_version.as_str())])
            .query(&request.query_params);

        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        Ok(builder.send().await?)
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        self.config.retry_backoff.saturating_mul(1u32 << shift)
    }
}

impl Client {
    /// Make a GET request and deserialize the JSON body.
    pub async fn get<T: DeserializeOwned>(&self, realm_id: &str, endpoint: &str) -> Result<T> {
        let response = self.request(realm_id, &ApiRequest::get(endpoint)).await?;
        deserialize_json(response)
    }

    pub async fn get_company_info(&self, realm_id: &str) -> Result<Value> {
        self.get(realm_id, &format!("companyinfo/{}", realm_id)).await
    }

    /// Run a query such as `SELECT * FROM Customer WHERE Active = true`.
    pub async fn query(&self, realm_id: &str, query: &str) -> Result<QueryResponse> {
        let request = ApiRequest::get("query").with_query("query", query);
        let response = self.request(realm_id, &request).await?;
        deserialize_json(response)
    }

    pub async fn create(&self, realm_id: &str, entity: &str, body: Value) -> Result<Value> {
        let request = ApiRequest::post(&entity.to_lowercase(), body);
        let response = self.request(realm_id, &request).await?;
        deserialize_json(response)
    }

    /// Update an entity. The body must carry its `Id` and current `SyncToken`; set
    /// `"sparse": true` in it to only send changed fields.
    pub async fn update(&self, realm_id: &str, entity: &str, body: Value) -> Result<Value> {
        self.create(realm_id, entity, body).await
    }

    pub async fn delete(&self, realm_id: &str, entity: &str, id: &str, sync_token: &str) -> Result<Value> {
        let request = ApiRequest::post(&entity.to_lowercase(), json!({ "Id": id, "SyncToken": sync_token }))
            .with_query("operation", "delete");
        let response = self.request(realm_id, &request).await?;
        deserialize_json(response)
    }

    /// Send up to 30 operations in one call. Each item needs a `bId` and one operation.
    pub async fn batch(&self, realm_id: &str, items: Vec<Value>) -> Result<Value> {
        let request = ApiRequest::post("batch", json!({ "BatchItemRequest": items }));
        let response = self.request(realm_id, &request).await?;
        deserialize_json(response)
    }

    /// Fetch a report, e.g. `ProfitAndLoss` with `start_date` and `end_date` parameters.
    pub async fn get_report(&self, realm_id: &str, report: &str, params: &[(&str, &str)]) -> Result<Value> {
        let request = params
            .iter()
            .fold(ApiRequest::get(&format!("reports/{}", report)), |request, (key, value)| {
                request.with_query(key, value)
            });
        let response = self.request(realm_id, &request).await?;
        deserialize_json(response)
    }

    /// Download the PDF rendering of an invoice, estimate or other sales form.
    pub async fn download_pdf(&self, realm_id: &str, entity: &str, id: &str) -> Result<Vec<u8>> {
        let request = ApiRequest::get(&format!("{}/{}/pdf", entity.to_lowercase(), id)).with_accept(PDF);

        match self.request(realm_id, &request).await?.body {
            ResponseBody::Pdf(bytes) => Ok(bytes),
            other => Err(ClientError::MalformedResponse(format!("expected a PDF, got {}", body_kind(&other)))),
        }
    }
}

fn deserialize_json<T: DeserializeOwned>(response: ApiResponse) -> Result<T> {
    match response.body {
        ResponseBody::Json(value) => Ok(serde_json::from_value(value)?),
        other => Err(ClientError::MalformedResponse(format!("expected JSON, got {}", body_kind(&other)))),
    }
}

fn body_kind(body: &ResponseBody) -> &'static str {
    match body {
        ResponseBody::Json(_) => "JSON",
        ResponseBody::Pdf(_) => "PDF",
        ResponseBody::Text(_) => "text",
    }
}

fn content_type(headers: &HeaderMap) -> Option<String> {
    headers
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.to_ascii_lowercase())
}

async fn parse_body(response: reqwest::Response) -> Result<ResponseBody> {
    let content_type = content_type(response.headers());

    match content_type.as_deref() {
        Some(kind) if kind.starts_with(JSON) => {
            let raw_response = response.text().await?;
            if raw_response.trim().is_empty() {
                return Ok(ResponseBody::Json(Value::Null));
            }
            Ok(ResponseBody::Json(serde_json::from_str(&raw_response)?))
        }
        Some(kind) if kind.starts_with(PDF) => Ok(ResponseBody::Pdf(response.bytes().await?.to_vec())),
        Some(kind) if kind.starts_with("text/") => Ok(ResponseBody::Text(response.text().await?)),
        Some(kind) => Err(ClientError::MalformedResponse(format!("unexpected content type '{}'", kind))),
        None => {
            let raw_response = response.text().await?;
            if raw_response.is_empty() {
                Ok(ResponseBody::Text(raw_response))
            } else {
                Err(ClientError::MalformedResponse(String::from("response has no content type")))
            }
        }
    }
}

async fn error_from_response(response: reqwest::Response) -> ClientError {
    let status = response.status().as_u16();

    match response.text().await {
        Ok(raw_response) => ClientError::Api {
            status,
            detail: parse_error_body(status, &raw_response),
        },
        Err(err) => ClientError::from(err),
    }
}

/// Delay requested by a `Retry-After` header, given either in seconds or as an HTTP date.
fn retry_after(headers: &HeaderMap, now: DateTime<Utc>) -> Option<Duration> {
    let value = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();

    if let Ok(seconds) = value.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }

    let date = DateTime::parse_from_rfc2822(value).ok()?;
    (date.with_timezone(&Utc) - now).to_std().ok()
}
