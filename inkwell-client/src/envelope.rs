//! Response envelope decoding.
//!
//! The backend either wraps payloads as `{ "data": ..., "correlationId": ... }`
//! or returns them bare. Which one to expect is decided up front by an
//! [`EnvelopeMode`], and the body is decoded in a single step. A wrapped
//! response that is missing `data` is an error, not a bare payload.

use inkwell_core::{ApiError, ErrorCategory};
use serde::{Deserialize, Serialize};

/// Highest envelope version this client understands.
pub const ENVELOPE_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvelopeMode {
    /// `{ data, correlationId }`.
    #[default]
    Wrapped,
    /// The body is the payload.
    Raw,
}

/// The wrapped response shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope<T> {
    pub data: T,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// Absent means version 1.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u32>,
}

/// A decoded payload plus the correlation id, if the server sent one.
#[derive(Debug, Clone, PartialEq)]
pub struct Decoded {
    pub data: serde_json::Value,
    pub correlation_id: Option<String>,
}

/// Decode a successful response body.
///
/// An empty body (e.g. `204 No Content`) decodes to `null` in either mode.
pub fn decode(mode: EnvelopeMode, body: &[u8]) -> Result<Decoded, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(Decoded {
            data: serde_json::Value::Null,
            correlation_id: None,
        });
    }

    match mode {
        EnvelopeMode::Raw => {
            let data = serde_json::from_slice(body).map_err(|e| malformed(body, e))?;
            Ok(Decoded {
                data,
                correlation_id: None,
            })
        }
        EnvelopeMode::Wrapped => {
            let envelope: Envelope<serde_json::Value> =
                serde_json::from_slice(body).map_err(|e| malformed(body, e))?;
            let version = envelope.version.unwrap_or(1);
            if version > ENVELOPE_VERSION {
                return Err(ApiError::new(
                    ErrorCategory::Unknown,
                    format!("Unsupported response envelope version {}", version),
                ));
            }
            Ok(Decoded {
                data: envelope.data,
                correlation_id: envelope.correlation_id,
            })
        }
    }
}

fn malformed(body: &[u8], err: serde_json::Error) -> ApiError {
    ApiError::new(
        ErrorCategory::Unknown,
        format!("Malformed response body: {}", err),
    )
    .with_response_body(String::from_utf8_lossy(body).into_owned())
}
