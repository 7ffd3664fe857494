//! CLA backend: orchestrates the session registry, process pool, NDJSON
//! buffer, stream adapter, request transformer and model mapper for both
//! the non-streaming and streaming completion paths.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use gw_admission::redact::{looks_like_auth_failure, sanitize_stderr};
use gw_domain::error::Error;
use gw_domain::wire::{ChatCompletionRequest, Choice, ResponseMessage, Usage};
use gw_pool::pool::{ProcessPool, Terminable};
use gw_sessions::registry::{ResolveAction, SessionRegistry};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::model_map::map_model;
use crate::ndjson::NdjsonLineBuffer;
use crate::stream_adapter::{AdapterEvent, StreamAdapter};
use crate::transform::{build_cli_args, build_env, build_prompt, validate_params, CliArgOptions};

const STDOUT_CAP: usize = 10 * 1024 * 1024;
const STDERR_CAP: usize = 1 * 1024 * 1024;
const STDIN_PROMPT_THRESHOLD: usize = 128 * 1024;
const KILL_ESCALATION_TIMEOUT: Duration = Duration::from_secs(5);

pub struct ClaBackend {
    binary_path: String,
    sessions: Arc<SessionRegistry>,
    pool: Arc<ProcessPool>,
}

/// Releases the session lock on every exit path, including panics.
struct SessionLockGuard {
    sessions: Arc<SessionRegistry>,
    id: Uuid,
}

impl Drop for SessionLockGuard {
    fn drop(&mut self) {
        self.sessions.release_lock(self.id);
    }
}

/// Bridges the pool's signal abstraction to a real child process via a
/// channel, since the pool only ever sees `Arc<dyn Terminable>`.
struct ChildSignal {
    graceful: mpsc::Sender<()>,
    force: mpsc::Sender<()>,
}

#[async_trait]
impl Terminable for ChildSignal {
    async fn terminate_graceful(&self) {
        let _ = self.graceful.send(()).await;
    }
    async fn terminate_force(&self) {
        let _ = self.force.send(()).await;
    }
}

#[derive(Debug)]
pub struct CompletionResult {
    pub choice: Choice,
    pub usage: Option<Usage>,
    pub headers: HashMap<String, String>,
}

impl ClaBackend {
    pub fn new(binary_path: String, sessions: Arc<SessionRegistry>, pool: Arc<ProcessPool>) -> Self {
        Self {
            binary_path,
            sessions,
            pool,
        }
    }

    /// Non-streaming completion. Every failure path is a typed `Error`;
    /// the session lock is released via `SessionLockGuard` regardless of
    /// how this function returns.
    pub async fn complete(
        &self,
        request: &ChatCompletionRequest,
        client_id: &str,
        session_id_header: Option<&str>,
        cancel: CancellationToken,
    ) -> Result<CompletionResult, Error> {
        let n = request
            .extra
            .get("n")
            .and_then(|v| v.as_u64());
        let ignored_params = validate_params(&request.extra, n)?;
        let model_alias = map_model(&request.model)?;

        let outcome = self
            .sessions
            .resolve(session_id_header, client_id, &request.model)?;
        self.sessions.acquire_lock(outcome.session_id)?;
        let _lock_guard = SessionLockGuard {
            sessions: self.sessions.clone(),
            id: outcome.session_id,
        };

        let is_resume = outcome.action == ResolveAction::Resumed;
        let built = build_prompt(&request.messages, is_resume)?;

        let deliver_via_stdin = built.prompt.len() > STDIN_PROMPT_THRESHOLD;
        let args = build_cli_args(&CliArgOptions {
            streaming: false,
            model_alias,
            session_id: outcome.session_id.to_string(),
            is_resume,
            system_prompt: built.system_prompt.clone(),
            prompt: built.prompt.clone(),
            deliver_via_stdin,
        });

        let _permit = self.pool.acquire().await?;

        let stdin_payload = deliver_via_stdin.then(|| built.prompt.clone());
        let mut child = spawn_child(&self.binary_path, &args, stdin_payload.as_deref())?;

        let stdout = child.stdout.take().expect("piped stdout");
        let stderr = child.stderr.take().expect("piped stderr");

        let (graceful_tx, mut graceful_rx) = mpsc::channel::<()>(1);
        let (force_tx, mut force_rx) = mpsc::channel::<()>(1);
        let signal: Arc<dyn Terminable> = Arc::new(ChildSignal {
            graceful: graceful_tx,
            force: force_tx,
        });
        let tracked_id = self.pool.track(signal);

        let stdout_task = tokio::spawn(drain_capped(stdout, STDOUT_CAP));
        let stderr_task = tokio::spawn(drain_capped(stderr, STDERR_CAP));

        let exit = tokio::select! {
            result = child.wait() => result.map_err(|e| Error::CliSpawnError(e.to_string())),
            _ = cancel.cancelled() => {
                escalate(&mut child, &mut graceful_rx, &mut force_rx).await;
                child.wait().await.map_err(|e| Error::CliSpawnError(e.to_string()))
            }
            _ = graceful_rx.recv() => {
                escalate(&mut child, &mut graceful_rx, &mut force_rx).await;
                child.wait().await.map_err(|e| Error::CliSpawnError(e.to_string()))
            }
        };
        self.pool.untrack(tracked_id);

        let (stdout_text, stdout_exceeded) = stdout_task.await.unwrap_or((String::new(), false));
        let (stderr_text, _stderr_exceeded) = stderr_task.await.unwrap_or((String::new(), false));

        if stdout_exceeded {
            let _ = child.start_kill();
            return Err(Error::OutputLimitExceeded);
        }

        let status = exit?;
        let sanitized_stderr = sanitize_stderr(&stderr_text);

        if !status.success() {
            if looks_like_auth_failure(&stderr_text) {
                return Err(Error::InvalidApiKey);
            }
            return Err(Error::BackendError(format!(
                "CLA exited with code {}: {sanitized_stderr}",
                status.code().unwrap_or(-1)
            )));
        }

        let result_value: serde_json::Value = serde_json::from_str(&stdout_text)
            .map_err(|e| Error::BackendError(format!("malformed CLA output: {e}")))?;
        let content = result_value
            .get("result")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let input_tokens = result_value
            .get("usage")
            .and_then(|u| u.get("input_tokens"))
            .and_then(|v| v.as_u64())
            .unwrap_or(0);
        let output_tokens = result_value
            .get("usage")
            .and_then(|u| u.get("output_tokens"))
            .and_then(|v| v.as_u64())
            .unwrap_or(0);

        let mut headers = HashMap::new();
        headers.insert("X-Backend-Mode".to_string(), "claude-code".to_string());
        headers.insert(
            "X-Claude-Session-ID".to_string(),
            outcome.session_id.to_string(),
        );
        if matches!(outcome.action, ResolveAction::Created) {
            headers.insert("X-Claude-Session-Created".to_string(), "true".to_string());
        }
        if !ignored_params.is_empty() {
            headers.insert(
                "X-Claude-Ignored-Params".to_string(),
                ignored_params.join(","),
            );
        }

        Ok(CompletionResult {
            choice: Choice {
                index: 0,
                message: ResponseMessage {
                    role: "assistant".to_string(),
                    content,
                },
                finish_reason: "stop".to_string(),
            },
            usage: Some(Usage {
                prompt_tokens: input_tokens,
                completion_tokens: output_tokens,
                total_tokens: input_tokens + output_tokens,
            }),
            headers,
        })
    }

    /// Streaming completion. Never fails: every failure routes through
    /// `on_event` as an `AdapterEvent::Error`.
    pub async fn stream(
        &self,
        request: &ChatCompletionRequest,
        request_id: &str,
        client_id: &str,
        session_id_header: Option<&str>,
        created: i64,
        cancel: CancellationToken,
        mut on_event: impl FnMut(AdapterEvent) + Send,
    ) {
        let mut adapter = StreamAdapter::new(request_id.to_string(), request.model.clone(), created);

        if let Err(e) = self
            .stream_inner(request, client_id, session_id_header, cancel, &mut adapter, &mut on_event)
            .await
        {
            for event in adapter.handle_error(&e.to_string()) {
                on_event(event);
            }
        }
    }

    async fn stream_inner(
        &self,
        request: &ChatCompletionRequest,
        client_id: &str,
        session_id_header: Option<&str>,
        cancel: CancellationToken,
        adapter: &mut StreamAdapter,
        on_event: &mut impl FnMut(AdapterEvent),
    ) -> Result<(), Error> {
        let n = request.extra.get("n").and_then(|v| v.as_u64());
        validate_params(&request.extra, n)?;
        let model_alias = map_model(&request.model)?;

        let outcome = self
            .sessions
            .resolve(session_id_header, client_id, &request.model)?;
        self.sessions.acquire_lock(outcome.session_id)?;
        let _lock_guard = SessionLockGuard {
            sessions: self.sessions.clone(),
            id: outcome.session_id,
        };

        let is_resume = outcome.action == ResolveAction::Resumed;
        let built = build_prompt(&request.messages, is_resume)?;
        let deliver_via_stdin = built.prompt.len() > STDIN_PROMPT_THRESHOLD;
        let args = build_cli_args(&CliArgOptions {
            streaming: true,
            model_alias,
            session_id: outcome.session_id.to_string(),
            is_resume,
            system_prompt: built.system_prompt.clone(),
            prompt: built.prompt.clone(),
            deliver_via_stdin,
        });

        let _permit = self.pool.acquire().await?;
        let stdin_payload = deliver_via_stdin.then(|| built.prompt.clone());
        let mut child = spawn_child(&self.binary_path, &args, stdin_payload.as_deref())?;

        let mut stdout = child.stdout.take().expect("piped stdout");
        let stderr = child.stderr.take().expect("piped stderr");

        let (graceful_tx, mut graceful_rx) = mpsc::channel::<()>(1);
        let (force_tx, mut force_rx) = mpsc::channel::<()>(1);
        let signal: Arc<dyn Terminable> = Arc::new(ChildSignal {
            graceful: graceful_tx,
            force: force_tx,
        });
        let tracked_id = self.pool.track(signal);

        let stderr_task = tokio::spawn(drain_capped(stderr, STDERR_CAP));

        let mut line_buffer = NdjsonLineBuffer::new();
        let mut buf = [0u8; 8192];
        let exit_status;

        loop {
            tokio::select! {
                read = stdout.read(&mut buf) => {
                    match read {
                        Ok(0) => {
                            exit_status = child.wait().await.ok();
                            break;
                        }
                        Ok(n) => {
                            let text = String::from_utf8_lossy(&buf[..n]);
                            for line in line_buffer.push(&text) {
                                for event in adapter.feed_line(&line) {
                                    on_event(event);
                                }
                            }
                        }
                        Err(e) => return Err(Error::StreamError(e.to_string())),
                    }
                }
                _ = cancel.cancelled() => {
                    escalate(&mut child, &mut graceful_rx, &mut force_rx).await;
                    exit_status = child.wait().await.ok();
                    break;
                }
                _ = graceful_rx.recv() => {
                    escalate(&mut child, &mut graceful_rx, &mut force_rx).await;
                    exit_status = child.wait().await.ok();
                    break;
                }
            }
        }
        self.pool.untrack(tracked_id);

        if let Some(tail) = line_buffer.flush() {
            for event in adapter.feed_line(&tail) {
                on_event(event);
            }
        }

        let (stderr_text, _) = stderr_task.await.unwrap_or_default();
        let success = exit_status.map(|s| s.success()).unwrap_or(false);

        if !success {
            let sanitized = sanitize_stderr(&stderr_text);
            for event in adapter.handle_error(&sanitized) {
                on_event(event);
            }
        } else if !adapter.is_done() {
            let mut headers = HashMap::new();
            headers.insert("X-Backend-Mode".to_string(), "claude-code".to_string());
            if let Some(id) = adapter.session_id() {
                headers.insert("X-Claude-Session-ID".to_string(), id.to_string());
            }
            on_event(AdapterEvent::Done(crate::stream_adapter::DoneInfo {
                headers,
                usage: None,
            }));
        }

        Ok(())
    }
}

async fn escalate(
    child: &mut Child,
    graceful_rx: &mut mpsc::Receiver<()>,
    force_rx: &mut mpsc::Receiver<()>,
) {
    // Drain any already-queued signal so repeated escalation calls don't loop.
    let _ = graceful_rx.try_recv();
    if let Some(id) = child.id() {
        tracing::debug!(pid = id, "sending graceful termination to CLA child");
    }
    #[cfg(unix)]
    {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;
        if let Some(id) = child.id() {
            let _ = kill(Pid::from_raw(id as i32), Signal::SIGTERM);
        }
    }
    #[cfg(not(unix))]
    {
        let _ = child.start_kill();
    }

    tokio::select! {
        _ = child.wait() => {}
        _ = force_rx.recv() => {
            let _ = child.start_kill();
        }
        _ = tokio::time::sleep(KILL_ESCALATION_TIMEOUT) => {
            let _ = child.start_kill();
        }
    }
}

fn spawn_child(binary: &str, args: &[String], stdin_payload: Option<&str>) -> Result<Child, Error> {
    let mut command = Command::new(binary);
    command.args(args);
    command.env_clear();
    for (key, value) in build_env() {
        command.env(key, value);
    }
    command.stdout(Stdio::piped());
    command.stderr(Stdio::piped());
    command.stdin(if stdin_payload.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    });

    let mut child = command
        .spawn()
        .map_err(|e| Error::CliSpawnError(e.to_string()))?;

    if let Some(payload) = stdin_payload {
        if let Some(mut stdin) = child.stdin.take() {
            let payload = payload.to_string();
            tokio::spawn(async move {
                let _ = stdin.write_all(payload.as_bytes()).await;
            });
        }
    }

    Ok(child)
}

/// Reads `reader` to completion (or until `cap` bytes have been read),
/// returning the accumulated UTF-8 text and whether the cap was hit.
async fn drain_capped<R: tokio::io::AsyncRead + Unpin>(mut reader: R, cap: usize) -> (String, bool) {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 8192];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                buf.extend_from_slice(&chunk[..n]);
                if buf.len() > cap {
                    return (String::from_utf8_lossy(&buf).into_owned(), true);
                }
            }
            Err(_) => break,
        }
    }
    (String::from_utf8_lossy(&buf).into_owned(), false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use gw_domain::wire::{ChatMessage, MessageContent};
    use std::collections::HashMap as Map;

    fn request(model: &str, user_text: &str) -> ChatCompletionRequest {
        ChatCompletionRequest {
            model: model.to_string(),
            messages: vec![ChatMessage {
                role: "user".to_string(),
                content: MessageContent::Text(user_text.to_string()),
            }],
            stream: false,
            extra: Map::new(),
        }
    }

    fn fake_cla_script(body: &str) -> tempfile::TempPath {
        use std::io::Write;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "#!/bin/sh\n{body}").unwrap();
        let path = file.into_temp_path();
        std::fs::set_permissions(&path, std::os::unix::fs::PermissionsExt::from_mode(0o755)).unwrap();
        path
    }

    #[tokio::test]
    async fn non_streaming_success_parses_result_json() {
        let script = fake_cla_script(
            r#"echo '{"result":"hi there","usage":{"input_tokens":3,"output_tokens":2}}'"#,
        );
        let backend = ClaBackend::new(
            script.to_string_lossy().to_string(),
            Arc::new(SessionRegistry::new(Duration::from_secs(60), Duration::from_secs(600))),
            Arc::new(ProcessPool::new(2, Duration::from_secs(5), Duration::from_secs(5))),
        );

        let req = request("gpt-4o", "hello");
        let result = backend
            .complete(&req, "client-a", None, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.choice.message.content, "hi there");
        assert_eq!(result.usage.unwrap().total_tokens, 5);
        assert_eq!(result.headers.get("X-Backend-Mode").unwrap(), "claude-code");
    }

    #[tokio::test]
    async fn non_streaming_auth_failure_maps_to_invalid_api_key() {
        let script = fake_cla_script(r#"echo "Error: invalid api key" >&2; exit 1"#);
        let backend = ClaBackend::new(
            script.to_string_lossy().to_string(),
            Arc::new(SessionRegistry::new(Duration::from_secs(60), Duration::from_secs(600))),
            Arc::new(ProcessPool::new(2, Duration::from_secs(5), Duration::from_secs(5))),
        );

        let req = request("gpt-4o", "hello");
        let err = backend
            .complete(&req, "client-a", None, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidApiKey));
    }

    #[tokio::test]
    async fn streaming_success_emits_done_event() {
        let script = fake_cla_script(
            r#"echo '{"type":"result","is_error":false,"session_id":"s1","usage":{"input_tokens":1,"output_tokens":1}}'"#,
        );
        let backend = ClaBackend::new(
            script.to_string_lossy().to_string(),
            Arc::new(SessionRegistry::new(Duration::from_secs(60), Duration::from_secs(600))),
            Arc::new(ProcessPool::new(2, Duration::from_secs(5), Duration::from_secs(5))),
        );

        let req = request("gpt-4o", "hello");
        let mut saw_done = false;
        backend
            .stream(
                &req,
                "req-1",
                "client-a",
                None,
                1_700_000_000,
                CancellationToken::new(),
                |event| {
                    if matches!(event, AdapterEvent::Done(_)) {
                        saw_done = true;
                    }
                },
            )
            .await;
        assert!(saw_done);
    }
}
