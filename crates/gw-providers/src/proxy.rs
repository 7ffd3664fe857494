//! Proxy backend: a thin, auditable client for an upstream
//! OpenAI-compatible HTTP API.

use std::time::Duration;

use futures_util::StreamExt;
use gw_domain::error::Error;
use gw_domain::wire::{ChatCompletionRequest, ChatCompletionResponse};
use serde_json::Value;

pub struct ProxyConfig {
    pub enabled: bool,
    pub base_url: String,
    pub api_key: String,
    pub allow_client_key: bool,
}

pub struct ProxyBackend {
    config: ProxyConfig,
    default_client: reqwest::Client,
}

impl ProxyBackend {
    pub fn new(config: ProxyConfig) -> Self {
        let default_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .expect("reqwest client");
        Self {
            config,
            default_client,
        }
    }

    /// Resolves which bearer key this call uses. The base URL always
    /// comes from configuration, regardless of key source, so a client
    /// key can never redirect the call to an attacker-controlled host.
    fn resolve_key(&self, client_supplied_key: Option<&str>) -> Result<String, Error> {
        if self.config.allow_client_key {
            if let Some(key) = client_supplied_key {
                return Ok(key.to_string());
            }
        }
        if !self.config.api_key.is_empty() {
            return Ok(self.config.api_key.clone());
        }
        Err(Error::PassthroughNotConfigured)
    }

    fn client_for(&self, client_supplied_key: Option<&str>) -> Result<(reqwest::Client, String), Error> {
        let key = self.resolve_key(client_supplied_key)?;
        if self.config.allow_client_key && client_supplied_key.is_some() {
            let client = reqwest::Client::builder()
                .timeout(Duration::from_secs(120))
                .build()
                .map_err(|e| Error::ConnectionError(e.to_string()))?;
            Ok((client, key))
        } else {
            Ok((self.default_client.clone(), key))
        }
    }

    pub async fn complete(
        &self,
        request: &ChatCompletionRequest,
        client_supplied_key: Option<&str>,
    ) -> Result<ChatCompletionResponse, Error> {
        if !self.config.enabled {
            return Err(Error::PassthroughDisabled);
        }
        let (client, key) = self.client_for(client_supplied_key)?;

        let mut body = serde_json::to_value(RequestView(request))
            .map_err(|e| Error::BackendError(e.to_string()))?;
        body["stream"] = Value::Bool(false);

        let response = client
            .post(format!("{}/chat/completions", self.config.base_url))
            .bearer_auth(key)
            .json(&body)
            .send()
            .await
            .map_err(map_reqwest_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::UpstreamStatus {
                status: status.as_u16(),
                body,
            });
        }

        response
            .json::<ChatCompletionResponse>()
            .await
            .map_err(|e| Error::BackendError(e.to_string()))
    }

    /// Streams upstream SSE chunks to `on_chunk`, forwarding the last
    /// observed usage value (if any) to the caller once the stream ends.
    pub async fn stream(
        &self,
        request: &ChatCompletionRequest,
        client_supplied_key: Option<&str>,
        mut on_chunk: impl FnMut(Value) + Send,
    ) -> Result<Option<Value>, Error> {
        if !self.config.enabled {
            return Err(Error::PassthroughDisabled);
        }
        let (client, key) = self.client_for(client_supplied_key)?;

        let mut body = serde_json::to_value(RequestView(request))
            .map_err(|e| Error::BackendError(e.to_string()))?;
        body["stream"] = Value::Bool(true);

        let response = client
            .post(format!("{}/chat/completions", self.config.base_url))
            .bearer_auth(key)
            .json(&body)
            .send()
            .await
            .map_err(map_reqwest_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::UpstreamStatus {
                status: status.as_u16(),
                body,
            });
        }

        let mut stream = response.bytes_stream();
        let mut buffer = String::new();
        let mut last_usage = None;

        while let Some(chunk) = stream.next().await {
            let bytes = chunk.map_err(map_reqwest_error)?;
            buffer.push_str(&String::from_utf8_lossy(&bytes));

            for data in drain_data_lines(&mut buffer) {
                if data == "[DONE]" {
                    continue;
                }
                if let Ok(value) = serde_json::from_str::<Value>(&data) {
                    if let Some(usage) = value.get("usage") {
                        if !usage.is_null() {
                            last_usage = Some(usage.clone());
                        }
                    }
                    on_chunk(value);
                }
            }
        }

        Ok(last_usage)
    }
}

/// Serializes only the fields an upstream OpenAI-compatible API expects,
/// dropping internal bookkeeping fields that happened to ride along in
/// `extra`.
struct RequestView<'a>(&'a ChatCompletionRequest);

impl serde::Serialize for RequestView<'_> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeMap;
        let mut map = serializer.serialize_map(None)?;
        map.serialize_entry("model", &self.0.model)?;
        map.serialize_entry(
            "messages",
            &self
                .0
                .messages
                .iter()
                .map(|m| serde_json::json!({"role": m.role, "content": m.content.as_prompt_text()}))
                .collect::<Vec<_>>(),
        )?;
        for (key, value) in &self.0.extra {
            map.serialize_entry(key, value)?;
        }
        map.end()
    }
}

fn drain_data_lines(buffer: &mut String) -> Vec<String> {
    let mut data_lines = Vec::new();
    while let Some(pos) = buffer.find("\n\n") {
        let block: String = buffer.drain(..pos).collect();
        buffer.drain(..2);
        for line in block.lines() {
            let line = line.trim();
            if let Some(data) = line.strip_prefix("data:") {
                let data = data.trim();
                if !data.is_empty() {
                    data_lines.push(data.to_string());
                }
            }
        }
    }
    data_lines
}

fn map_reqwest_error(e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::Timeout(e.to_string())
    } else if e.is_connect() {
        Error::ConnectionError(e.to_string())
    } else {
        Error::BackendError(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(enabled: bool, allow_client_key: bool) -> ProxyConfig {
        ProxyConfig {
            enabled,
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: "server-key".to_string(),
            allow_client_key,
        }
    }

    #[test]
    fn drain_data_lines_extracts_payloads() {
        let mut buf = String::from("data: {\"a\":1}\n\ndata: [DONE]\n\n");
        let lines = drain_data_lines(&mut buf);
        assert_eq!(lines, vec!["{\"a\":1}", "[DONE]"]);
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn disabled_backend_fails_fast() {
        let backend = ProxyBackend::new(cfg(false, false));
        let req = ChatCompletionRequest {
            model: "gpt-4o".to_string(),
            messages: vec![],
            stream: false,
            extra: Default::default(),
        };
        let err = backend.complete(&req, None).await.unwrap_err();
        assert!(matches!(err, Error::PassthroughDisabled));
    }

    #[test]
    fn resolve_key_prefers_client_key_when_allowed() {
        let backend = ProxyBackend::new(cfg(true, true));
        assert_eq!(backend.resolve_key(Some("client-key")).unwrap(), "client-key");
    }

    #[test]
    fn resolve_key_falls_back_to_server_key_when_disallowed() {
        let backend = ProxyBackend::new(cfg(true, false));
        assert_eq!(backend.resolve_key(Some("client-key")).unwrap(), "server-key");
    }

    #[test]
    fn resolve_key_fails_with_no_key_source() {
        let backend = ProxyBackend::new(ProxyConfig {
            enabled: true,
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: String::new(),
            allow_client_key: false,
        });
        let err = backend.resolve_key(None).unwrap_err();
        assert!(matches!(err, Error::PassthroughNotConfigured));
    }
}
