//! Error types for Inkwell operations

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Classification of a failed request.
///
/// Every transport or HTTP failure is mapped onto exactly one category.
/// The category drives retry eligibility and is what the UI layer turns
/// into a user-facing message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Connection refused, reset, DNS failure, or the host is offline.
    Network,
    /// The transport gave up waiting for a response.
    Timeout,
    /// 401 / 403.
    Auth,
    /// 400 / 422.
    Validation,
    /// Any 5xx.
    Server,
    /// Any other 4xx.
    Client,
    /// The caller cancelled the request before it settled.
    Cancelled,
    /// Anything that fits nowhere else.
    Unknown,
}

impl ErrorCategory {
    /// All categories, in declaration order.
    pub const ALL: [ErrorCategory; 8] = [
        ErrorCategory::Network,
        ErrorCategory::Timeout,
        ErrorCategory::Auth,
        ErrorCategory::Validation,
        ErrorCategory::Server,
        ErrorCategory::Client,
        ErrorCategory::Cancelled,
        ErrorCategory::Unknown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Network => "network",
            ErrorCategory::Timeout => "timeout",
            ErrorCategory::Auth => "auth",
            ErrorCategory::Validation => "validation",
            ErrorCategory::Server => "server",
            ErrorCategory::Client => "client",
            ErrorCategory::Cancelled => "cancelled",
            ErrorCategory::Unknown => "unknown",
        }
    }

    /// Categories retried by the default retry policy.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorCategory::Network | ErrorCategory::Timeout | ErrorCategory::Server
        )
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified request failure.
///
/// Produced by the request pipeline's classifier and handed back to the
/// caller unchanged after retries are exhausted. `Clone` because a
/// deduplicated request delivers the same failure to every waiting caller.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[error("{category} error: {message}")]
pub struct ApiError {
    pub category: ErrorCategory,
    pub message: String,
    /// HTTP status, when the failure came from a response.
    pub status_code: Option<u16>,
    /// Backend `errorCode` field, when present.
    pub error_code: Option<String>,
    /// Backend `metadata.debugInfo`, kept verbatim for diagnostics.
    pub debug_info: Option<serde_json::Value>,
    /// Raw response body, when one was received.
    pub response_body: Option<String>,
    /// `METHOD url` of the request that failed.
    pub endpoint: Option<String>,
    pub request_id: Option<String>,
}

impl ApiError {
    pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            message: message.into(),
            status_code: None,
            error_code: None,
            debug_info: None,
            response_body: None,
            endpoint: None,
            request_id: None,
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Network, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Timeout, message)
    }

    pub fn server(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Server, message)
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Unknown, message)
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorCategory::Cancelled, "request was cancelled")
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status_code = Some(status);
        self
    }

    pub fn with_error_code(mut self, code: impl Into<String>) -> Self {
        self.error_code = Some(code.into());
        self
    }

    pub fn with_debug_info(mut self, info: serde_json::Value) -> Self {
        self.debug_info = Some(info);
        self
    }

    pub fn with_response_body(mut self, body: impl Into<String>) -> Self {
        self.response_body = Some(body.into());
        self
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn is_retryable(&self) -> bool {
        self.category.is_retryable()
    }

    pub fn is_cancelled(&self) -> bool {
        self.category == ErrorCategory::Cancelled
    }
}

/// Result type alias for pipeline operations.
pub type ApiResult<T> = Result<T, ApiError>;

/// Configuration validation errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },
}

impl ConfigError {
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_error_display() {
        let err = ApiError::server("upstream exploded").with_status(503);
        let msg = format!("{}", err);
        assert!(msg.contains("server"));
        assert!(msg.contains("upstream exploded"));
        assert_eq!(err.status_code, Some(503));
    }

    #[test]
    fn test_retryable_categories() {
        let retryable: Vec<_> = ErrorCategory::ALL
            .iter()
            .filter(|c| c.is_retryable())
            .copied()
            .collect();
        assert_eq!(
            retryable,
            vec![
                ErrorCategory::Network,
                ErrorCategory::Timeout,
                ErrorCategory::Server
            ]
        );
    }

    #[test]
    fn test_cancelled_is_not_retryable() {
        let err = ApiError::cancelled();
        assert!(err.is_cancelled());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_builder_fields() {
        let err = ApiError::new(ErrorCategory::Validation, "bad title")
            .with_status(422)
            .with_error_code("TITLE_TOO_LONG")
            .with_debug_info(serde_json::json!({"max": 70}))
            .with_endpoint("POST /posts-api/articles")
            .with_request_id("req-1");
        assert_eq!(err.error_code.as_deref(), Some("TITLE_TOO_LONG"));
        assert_eq!(err.endpoint.as_deref(), Some("POST /posts-api/articles"));
        assert_eq!(err.request_id.as_deref(), Some("req-1"));
        assert_eq!(err.debug_info, Some(serde_json::json!({"max": 70})));
    }

    #[test]
    fn test_category_serde_snake_case() {
        let json = serde_json::to_string(&ErrorCategory::Timeout).unwrap();
        assert_eq!(json, "\"timeout\"");
        let back: ErrorCategory = serde_json::from_str("\"validation\"").unwrap();
        assert_eq!(back, ErrorCategory::Validation);
    }

    #[test]
    fn test_config_error_display_invalid_value() {
        let err = ConfigError::invalid("api_base_url", "must not be empty");
        let msg = format!("{}", err);
        assert!(msg.contains("api_base_url"));
        assert!(msg.contains("must not be empty"));
    }
}
