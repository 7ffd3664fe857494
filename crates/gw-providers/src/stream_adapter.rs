//! Stateful NDJSON-event -> OpenAI-chunk mapper.
//!
//! Mirrors the shape of the upstream SSE parser: one line in, zero or more
//! typed events out. The adapter owns all per-stream state (the first
//! `content_block_start`, the `done` latch) so the caller just has to fan
//! the returned events out to chunk/done/error handling.

use std::collections::HashMap;

use gw_admission::redact::redact;
use gw_domain::error::ErrorBody;
use gw_domain::wire::{ChunkChoice, ChunkDelta, ChunkResponse};
use serde_json::Value;

pub struct DoneInfo {
    pub headers: HashMap<String, String>,
    pub usage: Option<Usage>,
}

pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

pub enum AdapterEvent {
    Chunk(ChunkResponse),
    Done(DoneInfo),
    Error(ErrorBody),
}

pub struct StreamAdapter {
    request_id: String,
    model: String,
    created: i64,
    first_content_block_seen: bool,
    done: bool,
    session_id: Option<String>,
}

impl StreamAdapter {
    pub fn new(request_id: String, model: String, created: i64) -> Self {
        Self {
            request_id,
            model,
            created,
            first_content_block_seen: false,
            done: false,
            session_id: None,
        }
    }

    fn chunk(&self, delta: ChunkDelta, finish_reason: Option<&'static str>) -> ChunkResponse {
        ChunkResponse {
            id: format!("chatcmpl-{}", self.request_id),
            object: "chat.completion.chunk",
            created: self.created,
            model: self.model.clone(),
            choices: vec![ChunkChoice {
                index: 0,
                delta,
                finish_reason,
            }],
        }
    }

    /// Feeds one complete NDJSON line. Malformed JSON is silently skipped,
    /// as are event types this adapter doesn't surface.
    pub fn feed_line(&mut self, line: &str) -> Vec<AdapterEvent> {
        let Ok(value) = serde_json::from_str::<Value>(line) else {
            return Vec::new();
        };
        self.feed_value(&value)
    }

    fn feed_value(&mut self, value: &Value) -> Vec<AdapterEvent> {
        let Some(top_type) = value.get("type").and_then(Value::as_str) else {
            return Vec::new();
        };

        match top_type {
            "system" => {
                if value.get("subtype").and_then(Value::as_str) == Some("init") {
                    if let Some(id) = value.get("session_id").and_then(Value::as_str) {
                        self.session_id = Some(id.to_string());
                    }
                }
                Vec::new()
            }
            "stream_event" => self.handle_stream_event(value.get("event")),
            "result" => self.handle_result(value),
            _ => Vec::new(),
        }
    }

    fn handle_stream_event(&mut self, event: Option<&Value>) -> Vec<AdapterEvent> {
        let Some(event) = event else { return Vec::new() };
        let Some(kind) = event.get("type").and_then(Value::as_str) else {
            return Vec::new();
        };

        match kind {
            "content_block_start" => {
                if self.first_content_block_seen {
                    Vec::new()
                } else {
                    self.first_content_block_seen = true;
                    vec![AdapterEvent::Chunk(self.chunk(
                        ChunkDelta {
                            role: Some("assistant"),
                            content: None,
                        },
                        None,
                    ))]
                }
            }
            "content_block_delta" => {
                let delta = event.get("delta");
                if delta.and_then(|d| d.get("type")).and_then(Value::as_str) == Some("text_delta")
                {
                    let text = delta
                        .and_then(|d| d.get("text"))
                        .and_then(Value::as_str)
                        .unwrap_or_default();
                    vec![AdapterEvent::Chunk(self.chunk(
                        ChunkDelta {
                            role: None,
                            content: Some(redact(text)),
                        },
                        None,
                    ))]
                } else {
                    Vec::new()
                }
            }
            "content_block_stop" | "message_stop" => Vec::new(),
            "message_delta" => {
                let stop_reason = event
                    .get("delta")
                    .and_then(|d| d.get("stop_reason"))
                    .and_then(Value::as_str);
                let finish_reason = map_stop_reason(stop_reason);
                vec![AdapterEvent::Chunk(
                    self.chunk(ChunkDelta::default(), Some(finish_reason)),
                )]
            }
            _ => Vec::new(),
        }
    }

    fn handle_result(&mut self, value: &Value) -> Vec<AdapterEvent> {
        if let Some(id) = value.get("session_id").and_then(Value::as_str) {
            self.session_id = Some(id.to_string());
        }

        if value.get("is_error").and_then(Value::as_bool) == Some(true) {
            let result = value.get("result").and_then(Value::as_str).unwrap_or_default();
            let reason = redact(result);
            return self.handle_error(&reason);
        }

        self.done = true;
        let mut headers = HashMap::new();
        headers.insert("X-Backend-Mode".to_string(), "claude-code".to_string());
        if let Some(id) = &self.session_id {
            headers.insert("X-Claude-Session-ID".to_string(), id.clone());
        }

        let input_tokens = value.get("usage").and_then(|u| u.get("input_tokens")).and_then(Value::as_u64).unwrap_or(0);
        let output_tokens = value.get("usage").and_then(|u| u.get("output_tokens")).and_then(Value::as_u64).unwrap_or(0);

        vec![AdapterEvent::Done(DoneInfo {
            headers,
            usage: Some(Usage {
                prompt_tokens: input_tokens,
                completion_tokens: output_tokens,
                total_tokens: input_tokens + output_tokens,
            }),
        })]
    }

    /// One-shot error path: a no-op once `done`, otherwise emits a finish
    /// chunk followed by a `stream_error` body.
    pub fn handle_error(&mut self, reason: &str) -> Vec<AdapterEvent> {
        if self.done {
            return Vec::new();
        }
        self.done = true;

        let finish = AdapterEvent::Chunk(self.chunk(ChunkDelta::default(), Some("stop")));
        let error = AdapterEvent::Error(ErrorBody::new(
            format!("Stream interrupted: {reason}"),
            "server_error",
            "stream_error",
        ));
        vec![finish, error]
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }
}

fn map_stop_reason(stop_reason: Option<&str>) -> &'static str {
    match stop_reason {
        Some("max_tokens") => "length",
        _ => "stop",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter() -> StreamAdapter {
        StreamAdapter::new("req-1".to_string(), "gpt-4o".to_string(), 1_700_000_000)
    }

    #[test]
    fn malformed_json_is_silently_skipped() {
        let mut a = adapter();
        assert!(a.feed_line("not json").is_empty());
    }

    #[test]
    fn first_content_block_start_emits_role_chunk_only_once() {
        let mut a = adapter();
        let line = r#"{"type":"stream_event","event":{"type":"content_block_start"}}"#;
        let events = a.feed_line(line);
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], AdapterEvent::Chunk(c) if c.choices[0].delta.role == Some("assistant")));

        assert!(a.feed_line(line).is_empty());
    }

    #[test]
    fn text_delta_emits_redacted_content_chunk() {
        let mut a = adapter();
        let line = r#"{"type":"stream_event","event":{"type":"content_block_delta","delta":{"type":"text_delta","text":"hello sk-abcdefghijklmnop"}}}"#;
        let events = a.feed_line(line);
        assert_eq!(events.len(), 1);
        match &events[0] {
            AdapterEvent::Chunk(c) => {
                let content = c.choices[0].delta.content.as_ref().unwrap();
                assert!(!content.contains("sk-abcdefghijklmnop"));
            }
            _ => panic!("expected chunk"),
        }
    }

    #[test]
    fn message_delta_maps_max_tokens_to_length() {
        let mut a = adapter();
        let line = r#"{"type":"stream_event","event":{"type":"message_delta","delta":{"stop_reason":"max_tokens"}}}"#;
        let events = a.feed_line(line);
        match &events[0] {
            AdapterEvent::Chunk(c) => assert_eq!(c.choices[0].finish_reason, Some("length")),
            _ => panic!("expected chunk"),
        }
    }

    #[test]
    fn message_delta_maps_other_reasons_to_stop() {
        let mut a = adapter();
        let line = r#"{"type":"stream_event","event":{"type":"message_delta","delta":{"stop_reason":null}}}"#;
        let events = a.feed_line(line);
        match &events[0] {
            AdapterEvent::Chunk(c) => assert_eq!(c.choices[0].finish_reason, Some("stop")),
            _ => panic!("expected chunk"),
        }
    }

    #[test]
    fn result_success_emits_done_with_usage() {
        let mut a = adapter();
        let line = r#"{"type":"result","session_id":"s-1","is_error":false,"usage":{"input_tokens":10,"output_tokens":5}}"#;
        let events = a.feed_line(line);
        assert_eq!(events.len(), 1);
        match &events[0] {
            AdapterEvent::Done(d) => {
                assert_eq!(d.headers.get("X-Claude-Session-ID").unwrap(), "s-1");
                let usage = d.usage.as_ref().unwrap();
                assert_eq!(usage.total_tokens, 15);
            }
            _ => panic!("expected done"),
        }
        assert!(a.is_done());
    }

    #[test]
    fn result_error_routes_through_handle_error() {
        let mut a = adapter();
        let line = r#"{"type":"result","is_error":true,"result":"boom"}"#;
        let events = a.feed_line(line);
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], AdapterEvent::Chunk(_)));
        if let AdapterEvent::Error(body) = &events[1] {
            assert!(body.error.message.contains("boom"));
        } else {
            panic!("expected Error event");
        }
        assert!(a.is_done());
    }

    #[test]
    fn handle_error_is_a_noop_once_done() {
        let mut a = adapter();
        a.handle_error("first");
        assert!(a.handle_error("second").is_empty());
    }
}
