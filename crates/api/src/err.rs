use serde::{Deserialize, Serialize};

/// TypeCode classifies a failure by required caller behavior, not by the
/// Rust type that produced it.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TypeCode {
    /// Transient transport failure; retry with backoff.
    Retriable,
    /// Object, bucket, or node does not exist.
    NotFound,
    /// Rejected at validation; never retried, never committed.
    Precondition,
    /// Out of space; the affected mountpath is marked.
    Capacity,
    /// Checksum mismatch; the object is left untouched.
    Integrity,
    /// The node cannot continue (missing mountpaths, corrupt metadata).
    Fatal,
    Internal,
}

/// ErrBody is the structured JSON error envelope returned by every
/// control endpoint. The S3-compat layer renders the XML equivalent
/// from the same fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrBody {
    pub status: u16,
    pub message: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub method: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub url: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub request_id: String,
    pub type_code: TypeCode,
}

impl ErrBody {
    pub fn new(status: u16, message: impl Into<String>, type_code: TypeCode) -> Self {
        Self {
            status,
            message: message.into(),
            method: String::new(),
            url: String::new(),
            request_id: String::new(),
            type_code,
        }
    }

    pub fn with_request(mut self, method: &str, url: &str, request_id: &str) -> Self {
        self.method = method.to_string();
        self.url = url.to_string();
        self.request_id = request_id.to_string();
        self
    }
}

impl std::fmt::Display for ErrBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message, self.status)
    }
}

impl std::error::Error for ErrBody {}

/// Whether an HTTP status indicates a retriable transport condition.
pub fn is_retriable_status(status: u16) -> bool {
    matches!(status, 502 | 503 | 504)
}

/// Whether a reqwest error should be retried: connection-level failures
/// (refused, reset, broken pipe, EOF, DNS), timeouts, and gateway 5xx.
pub fn is_retriable(err: &reqwest::Error) -> bool {
    if err.is_timeout() || err.is_connect() {
        return true;
    }
    if let Some(status) = err.status() {
        return is_retriable_status(status.as_u16());
    }
    // Mid-body disconnects surface as request/body errors.
    err.is_request() || err.is_body()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn body_round_trips() {
        let body = ErrBody::new(404, "bucket \"ais://x\" does not exist", TypeCode::NotFound)
            .with_request("HEAD", "/v1/buckets/x", "r-17");
        let text = serde_json::to_string(&body).unwrap();
        let back: ErrBody = serde_json::from_str(&text).unwrap();
        assert_eq!(body, back);
        assert!(text.contains(r#""type_code":"not-found""#));
    }

    #[test]
    fn gateway_statuses_are_retriable() {
        assert!(is_retriable_status(502));
        assert!(is_retriable_status(503));
        assert!(is_retriable_status(504));
        assert!(!is_retriable_status(500));
        assert!(!is_retriable_status(404));
    }
}
