//! Various response objects returned from QuickBooks Online.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Uniform error shape every QuickBooks error payload is unwrapped into.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiErrorDetail {
    pub code: String,
    pub message: String,
    pub detail: Option<String>,
}

impl ApiErrorDetail {
    pub fn new(code: &str, message: &str, detail: Option<&str>) -> Self {
        ApiErrorDetail {
            code: code.to_string(),
            message: message.to_string(),
            detail: detail.map(str::to_string),
        }
    }
}

impl fmt::Display for ApiErrorDetail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.detail {
            Some(detail) => write!(f, "{} ({}): {}", self.message, self.code, detail),
            None => write!(f, "{} ({})", self.message, self.code),
        }
    }
}

/// Error envelope sent back by the accounting API:
///
/// ```json
/// {"Fault": {"Error": [{"Message": "...", "Detail": "...", "code": "..."}], "type": "..."}}
/// ```
#[derive(Debug, Deserialize)]
pub struct FaultResponse {
    #[serde(rename = "Fault")]
    pub fault: Fault,
}

#[derive(Debug, Deserialize)]
pub struct Fault {
    #[serde(rename = "Error", default)]
    pub errors: Vec<FaultError>,

    #[serde(rename = "type")]
    pub fault_type: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct FaultError {
    #[serde(rename = "Message")]
    pub message: Option<String>,

    #[serde(rename = "Detail")]
    pub detail: Option<String>,

    pub code: Option<String>,
}

// Some endpoints (mostly authentication failures) use a flat payload instead of the fault
// envelope, so both shapes are tried, in this order.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ErrorPayload {
    Fault(FaultResponse),
    Flat {
        error: String,
        error_description: Option<String>,
    },
}

/// Unwrap an error body into an [`ApiErrorDetail`]. Bodies that match no known shape keep
/// their raw text as the detail.
pub fn parse_error_body(status: u16, body: &str) -> ApiErrorDetail {
    match serde_json::from_str::<ErrorPayload>(body) {
        Ok(ErrorPayload::Fault(response)) => {
            let fault_type = response.fault.fault_type;
            match response.fault.errors.into_iter().next() {
                Some(error) => ApiErrorDetail {
                    code: error.code.unwrap_or_else(|| status.to_string()),
                    message: error
                        .message
                        .or(fault_type)
                        .unwrap_or_else(|| String::from("Unknown error")),
                    detail: error.detail,
                },
                None => ApiErrorDetail {
                    code: status.to_string(),
                    message: fault_type.unwrap_or_else(|| String::from("Unknown error")),
                    detail: None,
                },
            }
        }
        Ok(ErrorPayload::Flat { error, error_description }) => ApiErrorDetail {
            code: status.to_string(),
            message: error,
            detail: error_description,
        },
        Err(_) => ApiErrorDetail {
            code: status.to_string(),
            message: String::from("Unexpected error response"),
            detail: if body.is_empty() { None } else { Some(body.to_string()) },
        },
    }
}

/// Body of a successful response, decoded according to its declared content type.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseBody {
    Json(serde_json::Value),
    Pdf(Vec<u8>),
    Text(String),
}

impl ResponseBody {
    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            ResponseBody::Json(value) => Some(value),
            _ => None,
        }
    }
}

/// A successful API response.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: u16,
    pub body: ResponseBody,
}

/// Wrapper around the result of a `query()` call. QuickBooks names the list after the queried
/// entity, so the entity lists are kept as raw JSON keyed by entity name.
#[derive(Debug, Deserialize)]
pub struct QueryResponse {
    #[serde(rename = "QueryResponse")]
    pub query_response: serde_json::Map<String, serde_json::Value>,

    pub time: Option<String>,
}

impl QueryResponse {
    /// Get the records for one entity, deserialized.
    pub fn entities<T: serde::de::DeserializeOwned>(&self, entity: &str) -> Result<Vec<T>, serde_json::Error> {
        match self.query_response.get(entity) {
            Some(value) => serde_json::from_value(value.clone()),
            None => Ok(Vec::new()),
        }
    }

    pub fn total_count(&self) -> Option<u64> {
        self.query_response.get("totalCount").and_then(|v| v.as_u64())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unwraps_fault_envelope() {
        let body = r#"{"Fault":{"Error":[{"Message":"Object Not Found","Detail":"Invoice 42 missing","code":"610"}],"type":"ValidationFault"},"time":"2024-01-01T00:00:00.000-08:00"}"#;

        let detail = parse_error_body(400, body);

        assert_eq!(detail, ApiErrorDetail::new("610", "Object Not Found", Some("Invoice 42 missing")));
    }

    #[test]
    fn unwraps_flat_error() {
        let detail = parse_error_body(401, r#"{"error":"invalid_token","error_description":"Token expired"}"#);

        assert_eq!(detail.code, "401");
        assert_eq!(detail.message, "invalid_token");
        assert_eq!(detail.detail.as_deref(), Some("Token expired"));
    }

    #[test]
    fn keeps_raw_body_when_unknown() {
        let detail = parse_error_body(400, "<html>bad gateway</html>");

        assert_eq!(detail.code, "400");
        assert_eq!(detail.detail.as_deref(), Some("<html>bad gateway</html>"));
    }

    #[test]
    fn query_response_entities() {
        #[derive(Deserialize)]
        struct Customer {
            #[serde(rename = "Id")]
            id: String,
        }

        let body = r#"{"QueryResponse":{"Customer":[{"Id":"1"},{"Id":"2"}],"startPosition":1,"maxResults":2,"totalCount":2},"time":"now"}"#;
        let response: QueryResponse = serde_json::from_str(body).unwrap();
        let customers: Vec<Customer> = response.entities("Customer").unwrap();

        assert_eq!(customers.len(), 2);
        assert_eq!(customers[1].id, "2");
        assert_eq!(response.total_count(), Some(2));
        assert!(response.entities::<Customer>("Invoice").unwrap().is_empty());
    }
}
