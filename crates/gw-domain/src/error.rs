//! Error taxonomy shared across all gateway crates.
//!
//! Every variant carries both an HTTP status and an OpenAI-style error
//! `code`/`type`, so the central mapper in `gw-gateway` can turn any of
//! these into the uniform `{error: {message, type, param, code}}` envelope
//! without guessing.

/// A typed gateway error. Framework-agnostic on purpose -- this crate does
/// not depend on axum, so it can be reused by the provider backends.
#[derive(thiserror::Error, Debug, Clone)]
pub enum Error {
    #[error("{0}")]
    InvalidRequest(String),

    #[error("invalid header value")]
    InvalidHeaderValue,

    #[error("invalid session id")]
    InvalidSessionId,

    #[error("session not found")]
    SessionNotFound,

    #[error("session is busy")]
    SessionBusy,

    #[error("missing api key")]
    MissingApiKey,

    #[error("invalid api key")]
    InvalidApiKey,

    #[error("rate limit exceeded")]
    RateLimitExceeded { retry_after_secs: u64 },

    #[error("unsupported parameter: {0}")]
    UnsupportedParameter(String),

    #[error("model not found: {0}")]
    ModelNotFound(String),

    #[error("failed to spawn CLA process: {0}")]
    CliSpawnError(String),

    #[error("stream error: {0}")]
    StreamError(String),

    #[error("backend error: {0}")]
    BackendError(String),

    /// An upstream API error whose HTTP status and body must pass through
    /// to the client verbatim, rather than being flattened to a generic
    /// backend error.
    #[error("upstream error {status}")]
    UpstreamStatus { status: u16, body: String },

    #[error("output limit exceeded")]
    OutputLimitExceeded,

    #[error("passthrough disabled")]
    PassthroughDisabled,

    #[error("passthrough not configured")]
    PassthroughNotConfigured,

    #[error("connection error: {0}")]
    ConnectionError(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("unsupported media type")]
    UnsupportedMediaType,

    #[error("payload too large")]
    PayloadTooLarge,

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// The uniform OpenAI error envelope body.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ErrorDetail {
    pub message: String,
    #[serde(rename = "type")]
    pub error_type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub param: Option<String>,
    pub code: &'static str,
}

impl ErrorBody {
    pub fn new(message: impl Into<String>, error_type: &'static str, code: &'static str) -> Self {
        Self {
            error: ErrorDetail {
                message: message.into(),
                error_type,
                param: None,
                code,
            },
        }
    }
}

/// HTTP status + OpenAI envelope for a typed [`Error`].
///
/// Kept as a plain `u16` (rather than an axum `StatusCode`) so this crate
/// stays framework-agnostic; `gw-gateway` converts it at the edge.
pub struct MappedError {
    pub status: u16,
    pub body: ErrorBody,
    pub retry_after_secs: Option<u64>,
    /// Set only for errors that must pass an upstream response body
    /// through verbatim instead of the uniform envelope in `body`.
    pub raw_body: Option<String>,
}

impl Error {
    pub fn map(&self) -> MappedError {
        let (status, error_type, code, retry_after) = match self {
            Error::InvalidRequest(_) => (400, "invalid_request_error", "invalid_request", None),
            Error::InvalidHeaderValue => {
                (400, "invalid_request_error", "invalid_header_value", None)
            }
            Error::InvalidSessionId => (400, "invalid_request_error", "invalid_session_id", None),
            Error::SessionNotFound => (404, "invalid_request_error", "session_not_found", None),
            Error::SessionBusy => (429, "invalid_request_error", "session_busy", Some(1)),
            Error::MissingApiKey => (401, "invalid_request_error", "missing_api_key", None),
            Error::InvalidApiKey => (401, "invalid_request_error", "invalid_api_key", None),
            Error::RateLimitExceeded { retry_after_secs } => (
                429,
                "rate_limit_error",
                "rate_limit_exceeded",
                Some(*retry_after_secs),
            ),
            Error::UnsupportedParameter(_) => {
                (400, "invalid_request_error", "unsupported_parameter", None)
            }
            Error::ModelNotFound(_) => (400, "invalid_request_error", "model_not_found", None),
            Error::CliSpawnError(_) => (500, "server_error", "cli_spawn_error", None),
            Error::StreamError(_) => (500, "server_error", "stream_error", None),
            Error::BackendError(_) => (500, "server_error", "backend_error", None),
            Error::UpstreamStatus { status, .. } => (*status, "server_error", "upstream_error", None),
            Error::OutputLimitExceeded => (502, "server_error", "output_limit_exceeded", None),
            Error::PassthroughDisabled => (503, "server_error", "passthrough_disabled", None),
            Error::PassthroughNotConfigured => {
                (503, "server_error", "passthrough_not_configured", None)
            }
            Error::ConnectionError(_) => (502, "server_error", "connection_error", None),
            Error::Timeout(_) => (504, "server_error", "timeout", None),
            Error::UnsupportedMediaType => {
                (415, "invalid_request_error", "unsupported_media_type", None)
            }
            Error::PayloadTooLarge => (413, "invalid_request_error", "payload_too_large", None),
            Error::Internal(_) => (500, "server_error", "internal_error", None),
        };

        let raw_body = match self {
            Error::UpstreamStatus { body, .. } => Some(body.clone()),
            _ => None,
        };

        MappedError {
            status,
            body: ErrorBody::new(self.to_string(), error_type, code),
            retry_after_secs: retry_after,
            raw_body,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upstream_status_preserves_status_and_body() {
        let err = Error::UpstreamStatus {
            status: 429,
            body: "{\"error\":{\"message\":\"rate limited upstream\"}}".to_string(),
        };
        let mapped = err.map();
        assert_eq!(mapped.status, 429);
        assert_eq!(mapped.raw_body.as_deref(), Some("{\"error\":{\"message\":\"rate limited upstream\"}}"));
    }

    #[test]
    fn backend_error_has_no_raw_body() {
        let mapped = Error::BackendError("boom".to_string()).map();
        assert_eq!(mapped.status, 500);
        assert!(mapped.raw_body.is_none());
    }
}
