//! `POST /v1/chat/completions` — the OpenAI-compatible admission pipeline
//! and backend dispatch.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{ConnectInfo, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Json, Response};
use futures_util::stream::Stream;
use gw_admission::auth::key_in_set;
use gw_admission::headers::{extract_bearer, first_value, is_valid_request_id, mask_key};
use gw_admission::limiter::LimitOutcome;
use gw_domain::error::{Error, ErrorBody};
use gw_domain::wire::{ChatCompletionRequest, ChatCompletionResponse};
use gw_providers::router::{select_backend, Backend};
use gw_providers::stream_adapter::AdapterEvent;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error_response::{security_headers, ApiError};
use crate::state::AppState;

const MAX_MESSAGES: usize = 100;
const MAX_CONTENT_CHARS: usize = 500_000;
const MAX_MODEL_CHARS: usize = 256;

/// Cancels `token` when dropped -- including when the enclosing future is
/// dropped by axum because the client disconnected before completion.
/// Cancelling after the operation already finished is a harmless no-op.
struct CancelOnDrop(CancellationToken);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

pub async fn chat_completions(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: axum::http::HeaderMap,
    body: Bytes,
) -> Response {
    match handle(state, addr, headers, body).await {
        Ok(response) => response,
        Err(e) => ApiError(e).into_response(),
    }
}

/// Rate-limit headers set during admission, carried through to every
/// response regardless of streaming mode or backend outcome.
struct AdmissionInfo {
    limit: u32,
    remaining: u32,
    reset_secs: u64,
    concurrency_key: String,
}

async fn handle(
    state: AppState,
    addr: SocketAddr,
    headers: axum::http::HeaderMap,
    body: Bytes,
) -> Result<Response, Error> {
    let request_id = resolve_request_id(&headers);
    let ip = addr.ip().to_string();

    let presented_key = header_str(&headers, "authorization").and_then(extract_bearer);
    authenticate(&state, presented_key)?;

    let admission = admit(&state, &ip, presented_key, &headers)?;
    let release_guard = ConcurrencyReleaseGuard {
        limiter: state.key_concurrency.clone(),
        key: admission.concurrency_key.clone(),
    };

    let request: ChatCompletionRequest = serde_json::from_slice(&body)
        .map_err(|e| Error::InvalidRequest(format!("malformed request body: {e}")))?;
    validate_body(&request)?;

    let claude_code_header = header_str(&headers, "x-claude-code");
    let session_id_header = header_str(&headers, "x-claude-session-id").map(str::to_string);
    let openai_key_header = header_str(&headers, "x-openai-api-key").map(str::to_string);

    let backend = select_backend(claude_code_header, session_id_header.is_some())?;
    let client_id = presented_key.map(mask_key).unwrap_or_else(|| "__anonymous__".to_string());

    if request.stream {
        Ok(stream_response(
            state,
            request,
            request_id,
            client_id,
            session_id_header,
            openai_key_header,
            backend,
            admission,
            release_guard,
        ))
    } else {
        let response = complete_response(
            &state,
            &request,
            &request_id,
            &client_id,
            session_id_header.as_deref(),
            openai_key_header.as_deref(),
            backend,
            &admission,
        )
        .await;
        drop(release_guard);
        response
    }
}

/// Releases a key-or-IP concurrency slot exactly once, on every exit path
/// -- including early `?` returns and client disconnect during a stream.
struct ConcurrencyReleaseGuard {
    limiter: Arc<gw_admission::limiter::ConcurrencyLimiter>,
    key: String,
}

impl Drop for ConcurrencyReleaseGuard {
    fn drop(&mut self) {
        self.limiter.release(&self.key);
    }
}

fn header_str<'a>(headers: &'a axum::http::HeaderMap, name: &str) -> Option<&'a str> {
    first_value(headers.get_all(name).iter().filter_map(|v| v.to_str().ok()))
}

fn resolve_request_id(headers: &axum::http::HeaderMap) -> String {
    match header_str(headers, "x-request-id") {
        Some(v) if is_valid_request_id(v) => v.to_string(),
        _ => Uuid::new_v4().to_string(),
    }
}

fn authenticate(state: &AppState, presented_key: Option<&str>) -> Result<(), Error> {
    if state.config.auth.api_keys.is_empty() {
        return Ok(());
    }
    match presented_key {
        None => Err(Error::MissingApiKey),
        Some(key) => {
            if key_in_set(key, &state.config.auth.api_keys) {
                Ok(())
            } else {
                tracing::warn!(key = %mask_key(key), "rejected invalid API key");
                Err(Error::InvalidApiKey)
            }
        }
    }
}

fn admit(
    state: &AppState,
    ip: &str,
    presented_key: Option<&str>,
    headers: &axum::http::HeaderMap,
) -> Result<AdmissionInfo, Error> {
    let ip_outcome = state.ip_limiter.record(ip);
    if !ip_outcome.allowed {
        return Err(rate_limit_error(&ip_outcome));
    }

    if let Some(key) = presented_key {
        let key_outcome = state.key_limiter.record(key);
        if !key_outcome.allowed {
            return Err(rate_limit_error(&key_outcome));
        }
    }

    let concurrency_key = presented_key.unwrap_or(ip).to_string();
    if !state.key_concurrency.acquire(&concurrency_key) {
        return Err(Error::RateLimitExceeded { retry_after_secs: 1 });
    }

    if let Some(session_id) = header_str(headers, "x-claude-session-id") {
        let session_outcome = state.session_limiter.record(session_id);
        if !session_outcome.allowed {
            state.key_concurrency.release(&concurrency_key);
            return Err(rate_limit_error(&session_outcome));
        }
    }

    Ok(AdmissionInfo {
        limit: ip_outcome.limit,
        remaining: ip_outcome.remaining,
        reset_secs: (ip_outcome.reset_ms / 1000).max(1),
        concurrency_key,
    })
}

fn rate_limit_error(outcome: &LimitOutcome) -> Error {
    Error::RateLimitExceeded {
        retry_after_secs: (outcome.reset_ms / 1000).max(1),
    }
}

fn validate_body(request: &ChatCompletionRequest) -> Result<(), Error> {
    if request.model.trim().is_empty() {
        return Err(Error::InvalidRequest("model must be a non-empty string".into()));
    }
    if request.model.chars().count() > MAX_MODEL_CHARS {
        return Err(Error::InvalidRequest("model exceeds maximum length".into()));
    }
    if request.messages.is_empty() {
        return Err(Error::InvalidRequest("messages must be non-empty".into()));
    }
    if request.messages.len() > MAX_MESSAGES {
        return Err(Error::InvalidRequest("too many messages".into()));
    }
    for message in &request.messages {
        if message.content.char_len() > MAX_CONTENT_CHARS {
            return Err(Error::InvalidRequest("message content exceeds maximum length".into()));
        }
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn complete_response(
    state: &AppState,
    request: &ChatCompletionRequest,
    request_id: &str,
    client_id: &str,
    session_id_header: Option<&str>,
    openai_key_header: Option<&str>,
    backend: Backend,
    admission: &AdmissionInfo,
) -> Result<Response, Error> {
    match backend {
        Backend::Cla => {
            let created = chrono_now();
            let result = state
                .cla
                .complete(request, client_id, session_id_header, CancellationToken::new())
                .await?;

            let response = ChatCompletionResponse {
                id: format!("chatcmpl-{request_id}"),
                object: "chat.completion".to_string(),
                created,
                model: request.model.clone(),
                choices: vec![result.choice],
                usage: result.usage,
            };

            let mut headers = result.headers;
            headers.insert("X-Request-ID".to_string(), request_id.to_string());
            Ok(with_standard_headers(
                Json(response).into_response(),
                headers,
                admission,
                "no-store",
            ))
        }
        Backend::Proxy => {
            let response = state.proxy.complete(request, openai_key_header).await?;
            let mut headers = std::collections::HashMap::new();
            headers.insert("X-Backend-Mode".to_string(), "openai-passthrough".to_string());
            headers.insert("X-Request-ID".to_string(), request_id.to_string());
            Ok(with_standard_headers(
                Json(response).into_response(),
                headers,
                admission,
                "no-store",
            ))
        }
    }
}

fn with_standard_headers(
    mut response: Response,
    backend_headers: std::collections::HashMap<String, String>,
    admission: &AdmissionInfo,
    cache_control: &'static str,
) -> Response {
    let headers = response.headers_mut();
    for (name, value) in security_headers(cache_control) {
        if let Ok(v) = axum::http::HeaderValue::from_str(value) {
            headers.insert(name, v);
        }
    }
    headers.insert("X-RateLimit-Limit", axum::http::HeaderValue::from(admission.limit));
    headers.insert(
        "X-RateLimit-Remaining",
        axum::http::HeaderValue::from(admission.remaining),
    );
    headers.insert(
        "X-RateLimit-Reset",
        axum::http::HeaderValue::from(admission.reset_secs),
    );
    for (name, value) in backend_headers {
        if let (Ok(name), Ok(value)) = (
            axum::http::HeaderName::from_bytes(name.as_bytes()),
            axum::http::HeaderValue::from_str(&value),
        ) {
            headers.insert(name, value);
        }
    }
    response
}

#[allow(clippy::too_many_arguments)]
fn stream_response(
    state: AppState,
    request: ChatCompletionRequest,
    request_id: String,
    client_id: String,
    session_id_header: Option<String>,
    openai_key_header: Option<String>,
    backend: Backend,
    admission: AdmissionInfo,
    release_guard: ConcurrencyReleaseGuard,
) -> Response {
    let backend_mode = match backend {
        Backend::Cla => "claude-code",
        Backend::Proxy => "openai-passthrough",
    };

    // Only a client-supplied session id signals a resume at header-commit
    // time; a session created during this request is only known once the
    // backend resolves it, after headers are already on the wire.
    let resumed_session_id = match backend {
        Backend::Cla => session_id_header.clone(),
        Backend::Proxy => None,
    };

    let event_stream = build_event_stream(
        state,
        request,
        request_id.clone(),
        client_id,
        session_id_header,
        openai_key_header,
        backend,
        release_guard,
    );

    let mut response = Sse::new(event_stream).keep_alive(KeepAlive::default()).into_response();
    let mut backend_headers = std::collections::HashMap::new();
    backend_headers.insert("X-Backend-Mode".to_string(), backend_mode.to_string());
    backend_headers.insert("X-Request-ID".to_string(), request_id);
    if let Some(session_id) = resumed_session_id {
        backend_headers.insert("X-Claude-Session-ID".to_string(), session_id);
    }
    response = with_standard_headers(response, backend_headers, &admission, "no-cache");
    response
}

#[allow(clippy::too_many_arguments)]
fn build_event_stream(
    state: AppState,
    request: ChatCompletionRequest,
    request_id: String,
    client_id: String,
    session_id_header: Option<String>,
    openai_key_header: Option<String>,
    backend: Backend,
    release_guard: ConcurrencyReleaseGuard,
) -> impl Stream<Item = Result<Event, std::convert::Infallible>> {
    async_stream::stream! {
        // Holds the concurrency-slot release for the lifetime of the
        // generator; dropped (and thus released) when the stream ends or
        // the client disconnects and axum drops this future.
        let _release_guard = release_guard;
        let cancel = CancellationToken::new();
        let _cancel_guard = CancelOnDrop(cancel.clone());
        let created = chrono_now();
        let stream_ended = AtomicBool::new(false);

        match backend {
            Backend::Cla => {
                let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<AdapterEvent>();
                let cla = state.cla.clone();
                let req = request.clone();
                let rid = request_id.clone();
                let cid = client_id.clone();
                let sid = session_id_header.clone();
                let worker_cancel = cancel.clone();
                tokio::spawn(async move {
                    cla.stream(&req, &rid, &cid, sid.as_deref(), created, worker_cancel, |event| {
                        let _ = tx.send(event);
                    })
                    .await;
                });

                while let Some(event) = rx.recv().await {
                    match event {
                        AdapterEvent::Chunk(chunk) => {
                            if let Ok(data) = serde_json::to_string(&chunk) {
                                yield Ok(Event::default().data(data));
                            }
                        }
                        AdapterEvent::Done(_) => {
                            if !stream_ended.swap(true, Ordering::SeqCst) {
                                yield Ok(Event::default().data("[DONE]"));
                            }
                        }
                        AdapterEvent::Error(body) => {
                            if let Ok(data) = serde_json::to_string(&body) {
                                yield Ok(Event::default().data(data));
                            }
                            if !stream_ended.swap(true, Ordering::SeqCst) {
                                yield Ok(Event::default().data("[DONE]"));
                            }
                        }
                    }
                }
            }
            Backend::Proxy => {
                let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<serde_json::Value>();
                let proxy = state.proxy.clone();
                let req = request.clone();
                let key = openai_key_header.clone();
                let handle = tokio::spawn(async move {
                    proxy
                        .stream(&req, key.as_deref(), |value| {
                            let _ = tx.send(value);
                        })
                        .await
                });

                while let Some(value) = rx.recv().await {
                    if let Ok(data) = serde_json::to_string(&value) {
                        yield Ok(Event::default().data(data));
                    }
                }

                if let Ok(Err(e)) = handle.await {
                    let body = ErrorBody::new(
                        format!("Stream interrupted: {e}"),
                        "server_error",
                        "stream_error",
                    );
                    if let Ok(data) = serde_json::to_string(&body) {
                        yield Ok(Event::default().data(data));
                    }
                }

                if !stream_ended.swap(true, Ordering::SeqCst) {
                    yield Ok(Event::default().data("[DONE]"));
                }
            }
        }
    }
}

fn chrono_now() -> i64 {
    chrono::Utc::now().timestamp()
}

pub async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

pub async fn list_models(State(state): State<AppState>) -> impl IntoResponse {
    let mut data: Vec<gw_domain::wire::ModelInfo> = gw_providers::model_map::exact_map()
        .iter()
        .map(|(name, _)| gw_domain::wire::ModelInfo {
            id: (*name).to_string(),
            object: "model",
            created: 0,
            owned_by: "gateway",
        })
        .collect();

    if state.config.proxy.enabled {
        data.push(gw_domain::wire::ModelInfo {
            id: "gpt-4o".to_string(),
            object: "model",
            created: 0,
            owned_by: "openai-passthrough",
        });
    }

    Json(gw_domain::wire::ModelList { object: "list", data })
}

#[cfg(test)]
mod tests {
    use super::*;
    use gw_domain::wire::{ChatMessage, MessageContent};
    use std::collections::HashMap as Map;

    fn request(model: &str, message_count: usize, content_chars: usize) -> ChatCompletionRequest {
        ChatCompletionRequest {
            model: model.to_string(),
            messages: (0..message_count)
                .map(|_| ChatMessage {
                    role: "user".to_string(),
                    content: MessageContent::Text("a".repeat(content_chars)),
                })
                .collect(),
            stream: false,
            extra: Map::new(),
        }
    }

    #[test]
    fn validate_body_rejects_empty_model() {
        let err = validate_body(&request("", 1, 1)).unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));
    }

    #[test]
    fn validate_body_rejects_empty_messages() {
        let err = validate_body(&request("gpt-4o", 0, 1)).unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));
    }

    #[test]
    fn validate_body_rejects_too_many_messages() {
        let err = validate_body(&request("gpt-4o", MAX_MESSAGES + 1, 1)).unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));
    }

    #[test]
    fn validate_body_rejects_oversized_content() {
        let err = validate_body(&request("gpt-4o", 1, MAX_CONTENT_CHARS + 1)).unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));
    }

    #[test]
    fn validate_body_accepts_well_formed_request() {
        assert!(validate_body(&request("gpt-4o", 1, 10)).is_ok());
    }

    #[test]
    fn resolve_request_id_generates_uuid_when_absent() {
        let headers = axum::http::HeaderMap::new();
        let id = resolve_request_id(&headers);
        assert!(Uuid::parse_str(&id).is_ok());
    }

    #[test]
    fn resolve_request_id_rejects_invalid_client_value() {
        let mut headers = axum::http::HeaderMap::new();
        headers.insert("x-request-id", axum::http::HeaderValue::from_static("has space"));
        let id = resolve_request_id(&headers);
        assert!(Uuid::parse_str(&id).is_ok());
    }

    #[test]
    fn resolve_request_id_keeps_valid_client_value() {
        let mut headers = axum::http::HeaderMap::new();
        headers.insert("x-request-id", axum::http::HeaderValue::from_static("client-req-1"));
        assert_eq!(resolve_request_id(&headers), "client-req-1");
    }

    #[test]
    fn authenticate_allows_any_request_when_no_keys_configured() {
        let state = test_state(vec![]);
        assert!(authenticate(&state, None).is_ok());
    }

    #[test]
    fn authenticate_rejects_missing_key_when_configured() {
        let state = test_state(vec!["sk-test".to_string()]);
        assert!(matches!(authenticate(&state, None), Err(Error::MissingApiKey)));
    }

    #[test]
    fn authenticate_rejects_wrong_key() {
        let state = test_state(vec!["sk-test".to_string()]);
        assert!(matches!(
            authenticate(&state, Some("sk-wrong")),
            Err(Error::InvalidApiKey)
        ));
    }

    #[test]
    fn authenticate_accepts_matching_key() {
        let state = test_state(vec!["sk-test".to_string()]);
        assert!(authenticate(&state, Some("sk-test")).is_ok());
    }

    fn test_state(api_keys: Vec<String>) -> AppState {
        let mut config = gw_domain::Config::default();
        config.auth.api_keys = api_keys;
        AppState::new(config)
    }
}
