//! Maps transport failures and HTTP statuses onto [`ErrorCategory`].
//!
//! | Outcome                                   | Category     |
//! |-------------------------------------------|--------------|
//! | timeout, `ECONNABORTED`, "timeout" text   | `timeout`    |
//! | 401, 403                                  | `auth`       |
//! | 400, 422                                  | `validation` |
//! | >= 500                                    | `server`     |
//! | other 4xx                                 | `client`     |
//! | connection-level codes                    | `network`    |
//! | anything else                             | `unknown`    |

use inkwell_core::{ApiError, ErrorCategory};
use serde::Deserialize;

use crate::transport::{TransportError, TransportErrorKind};

/// Low-level codes that mean the network, not the server, failed.
pub const NETWORK_ERROR_CODES: &[&str] = &[
    "ECONNREFUSED",
    "ECONNRESET",
    "ENOTFOUND",
    "ENETUNREACH",
    "EHOSTUNREACH",
    "EAI_AGAIN",
    "EPIPE",
    "ERR_NETWORK",
];

/// Classify a failure that happened before any response arrived.
pub fn classify_transport(err: &TransportError) -> ApiError {
    let code = err.code.as_deref();
    let category = if err.kind == TransportErrorKind::Timeout
        || err.kind == TransportErrorKind::Aborted
        || code == Some("ECONNABORTED")
        || err.message.to_ascii_lowercase().contains("timeout")
        || err.message.to_ascii_lowercase().contains("timed out")
    {
        ErrorCategory::Timeout
    } else if matches!(err.kind, TransportErrorKind::Connect | TransportErrorKind::Io)
        || code.is_some_and(|code| NETWORK_ERROR_CODES.contains(&code))
    {
        ErrorCategory::Network
    } else {
        ErrorCategory::Unknown
    };

    let mut api_error = ApiError::new(category, err.message.clone());
    if let Some(code) = code {
        api_error = api_error.with_error_code(code);
    }
    api_error
}

/// JSON error body fields the backend may send.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ErrorBody {
    error: Option<String>,
    message: Option<String>,
    error_code: Option<String>,
    metadata: Option<ErrorMetadata>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ErrorMetadata {
    debug_info: Option<serde_json::Value>,
}

/// Classify a non-2xx response.
pub fn classify_status(status: u16, body: &[u8]) -> ApiError {
    let category = match status {
        401 | 403 => ErrorCategory::Auth,
        400 | 422 => ErrorCategory::Validation,
        500.. => ErrorCategory::Server,
        402..=499 => ErrorCategory::Client,
        _ => ErrorCategory::Unknown,
    };

    let parsed: ErrorBody = serde_json::from_slice(body).unwrap_or_default();
    let message = parsed
        .error
        .or(parsed.message)
        .filter(|message| !message.trim().is_empty())
        .unwrap_or_else(|| default_message(status));

    let mut api_error = ApiError::new(category, message).with_status(status);
    if let Some(code) = parsed.error_code {
        api_error = api_error.with_error_code(code);
    }
    if let Some(debug_info) = parsed.metadata.and_then(|m| m.debug_info) {
        api_error = api_error.with_debug_info(debug_info);
    }
    if !body.is_empty() {
        api_error = api_error.with_response_body(String::from_utf8_lossy(body).into_owned());
    }
    api_error
}

fn default_message(status: u16) -> String {
    match status {
        401 => "Authentication required".to_string(),
        403 => "Access denied".to_string(),
        404 => "Resource not found".to_string(),
        429 => "Too many requests".to_string(),
        500.. => format!("Server error (HTTP {})", status),
        _ => format!("Request failed with HTTP {}", status),
    }
}
