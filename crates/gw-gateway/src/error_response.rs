//! Central error mapper: turns any typed `gw_domain::Error` into the
//! uniform OpenAI-shaped envelope, with the status-specific headers the
//! spec requires (`WWW-Authenticate`, `Retry-After`).

use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use gw_domain::error::Error;

pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mapped = self.0.map();
        let status = StatusCode::from_u16(mapped.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let mut response = match mapped.raw_body {
            Some(raw) => (
                status,
                [("content-type", "application/json")],
                raw,
            )
                .into_response(),
            None => (status, Json(mapped.body)).into_response(),
        };

        if status == StatusCode::UNAUTHORIZED {
            response
                .headers_mut()
                .insert("WWW-Authenticate", HeaderValue::from_static("Bearer"));
        }
        if let Some(retry_after) = mapped.retry_after_secs {
            if let Ok(value) = HeaderValue::from_str(&retry_after.to_string()) {
                response.headers_mut().insert("Retry-After", value);
            }
        }

        response
    }
}

/// Security headers applied to every response per the external-interfaces
/// contract. `cache_control` differs between buffered and streamed replies.
pub fn security_headers(cache_control: &'static str) -> [(&'static str, &'static str); 5] {
    [
        ("X-Content-Type-Options", "nosniff"),
        ("Cache-Control", cache_control),
        ("X-Frame-Options", "DENY"),
        ("Content-Security-Policy", "default-src 'none'"),
        ("Referrer-Policy", "no-referrer"),
    ]
}
