use crate::response::ApiErrorDetail;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ClientError>;

/// Various errors returned by the token manager, the token stores and the API client.
///
/// The type is `Clone` because a failed token fetch is memoized in the cache and handed to
/// every caller that joined it.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ClientError {
    /// No user identity was supplied, so no token operation can run.
    #[error("authentication required")]
    AuthenticationRequired,

    /// The requested realm has no stored (active) credential for this user.
    #[error("no QuickBooks token found for realm {realm_id}")]
    TokenNotFound { realm_id: String },

    /// The request never produced an HTTP response (connect, timeout, body read).
    #[error("transport error: {0}")]
    Transport(String),

    /// QuickBooks kept answering 429.
    #[error("rate limited by QuickBooks (retry after {retry_after:?}s)")]
    RateLimited { retry_after: Option<u64> },

    /// Error payload returned by the QuickBooks API.
    #[error("[{status}] {detail}")]
    Api { status: u16, detail: ApiErrorDetail },

    /// The persistent token store rejected a call.
    #[error("token store error: {0}")]
    Backend(String),

    /// A response had an unexpected content type or could not be parsed.
    #[error("malformed response: {0}")]
    MalformedResponse(String),

    /// Error returned by the Intuit OAuth endpoints.
    #[error("oauth error: {0}")]
    OAuth(String),

    /// Invalid or missing configuration value.
    #[error("configuration error: {0}")]
    Config(String),

    /// Every attempt failed; `source` is the last underlying error.
    #[error("request failed after {attempts} attempt(s): {source}")]
    RequestFailed {
        attempts: u32,
        source: Box<ClientError>,
    },
}

impl ClientError {
    /// Whether the error came from the network layer or a 5xx, and is worth retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            ClientError::Transport(_) | ClientError::RateLimited { .. } => true,
            ClientError::Api { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(err: serde_json::Error) -> Self {
        ClientError::MalformedResponse(err.to_string())
    }
}

impl From<serde_urlencoded::ser::Error> for ClientError {
    fn from(err: serde_urlencoded::ser::Error) -> Self {
        ClientError::Config(err.to_string())
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> ClientError {
        if err.is_decode() {
            ClientError::MalformedResponse(err.to_string())
        } else {
            ClientError::Transport(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_failed_carries_last_cause() {
        let error = ClientError::RequestFailed {
            attempts: 3,
            source: Box::new(ClientError::Transport(String::from("connection reset"))),
        };

        assert_eq!(
            error.to_string(),
            "request failed after 3 attempt(s): transport error: connection reset"
        );
    }

    #[test]
    fn server_errors_are_transient() {
        let detail = ApiErrorDetail::new("500", "Internal error", None);
        let server = ClientError::Api { status: 503, detail: detail.clone() };
        let client = ClientError::Api { status: 400, detail };

        assert!(server.is_transient());
        assert!(!client.is_transient());
        assert!(!ClientError::AuthenticationRequired.is_transient());
    }
}
