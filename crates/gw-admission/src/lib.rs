pub mod auth;
pub mod headers;
pub mod limiter;
pub mod redact;
