//! Chat model access.
//!
//! The [`ChatModel`] trait decouples the tool loop from the HTTP backend. The
//! production implementation speaks the OpenAI-compatible Chat Completions
//! protocol; tests use scripted models that never touch the network.

use std::time::Duration;

use anyhow::Result;
use reqwest::blocking::Client;
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::core::types::{Message, ToolCall, ToolSpec};
use crate::io::config::ModelConfig;

pub const API_KEY_ENV: &str = "OPENAI_API_KEY";

const ERROR_BODY_LIMIT: usize = 500;

/// One assistant reply: text, requested tool calls, or both.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AssistantTurn {
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
}

/// Abstraction over chat completion backends.
pub trait ChatModel {
    /// Ask for the next assistant turn given the full conversation and the tool set.
    fn complete(&self, messages: &[Message], tools: &[ToolSpec]) -> Result<AssistantTurn>;
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ModelError {
    #[error("{0} environment variable is not set")]
    MissingApiKey(&'static str),
    #[error("failed to create HTTP client: {0}")]
    Client(String),
    #[error("model request failed: {0}")]
    Transport(String),
    #[error("model returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("model response could not be decoded: {0}")]
    Decode(String),
}

pub struct OpenAiCompatClient {
    http: Client,
    endpoint: String,
    api_key: String,
    model: String,
    temperature: f64,
    max_retries: u32,
    backoff: Duration,
}

impl OpenAiCompatClient {
    pub fn new(cfg: &ModelConfig, api_key: String) -> Result<Self, ModelError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_secs))
            .build()
            .map_err(|e| ModelError::Client(e.to_string()))?;
        Ok(Self {
            http,
            endpoint: format!("{}/chat/completions", cfg.base_url.trim_end_matches('/')),
            api_key,
            model: cfg.model.clone(),
            temperature: cfg.temperature,
            max_retries: cfg.max_retries,
            backoff: Duration::from_millis(cfg.retry_backoff_ms),
        })
    }

    /// Client using the API key from `OPENAI_API_KEY`.
    pub fn from_env(cfg: &ModelConfig) -> Result<Self, ModelError> {
        let api_key = std::env::var(API_KEY_ENV)
            .ok()
            .filter(|k| !k.trim().is_empty())
            .ok_or(ModelError::MissingApiKey(API_KEY_ENV))?;
        Self::new(cfg, api_key.trim().to_string())
    }

    fn payload(&self, messages: &[Message], tools: &[ToolSpec]) -> Value {
        let mut payload = json!({
            "model": self.model,
            "messages": messages,
            "temperature": self.temperature,
        });
        if !tools.is_empty() {
            payload["tools"] = Value::Array(tools.iter().map(ToolSpec::to_wire).collect());
            payload["tool_choice"] = json!("auto");
        }
        payload
    }

    fn send_once(&self, payload: &Value) -> Result<Value, (ModelError, bool)> {
        let response = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(payload)
            .send()
            .map_err(|e| {
                let retryable = e.is_timeout() || e.is_connect() || e.is_request();
                (ModelError::Transport(e.to_string()), retryable)
            })?;

        let status = response.status().as_u16();
        if response.status().is_success() {
            return response
                .json::<Value>()
                .map_err(|e| (ModelError::Decode(e.to_string()), false));
        }
        let body: String = response
            .text()
            .unwrap_or_default()
            .chars()
            .take(ERROR_BODY_LIMIT)
            .collect();
        Err((ModelError::Status { status, body }, is_retryable_status(status)))
    }
}

impl ChatModel for OpenAiCompatClient {
    #[instrument(skip_all, fields(model = %self.model, messages = messages.len()))]
    fn complete(&self, messages: &[Message], tools: &[ToolSpec]) -> Result<AssistantTurn> {
        let payload = self.payload(messages, tools);
        let mut attempt = 0u32;
        loop {
            match self.send_once(&payload) {
                Ok(body) => {
                    let turn = parse_completion(&body)?;
                    debug!(
                        tool_calls = turn.tool_calls.len(),
                        content_chars = turn.content.len(),
                        "model turn received"
                    );
                    return Ok(turn);
                }
                Err((err, retryable)) if retryable && attempt < self.max_retries => {
                    attempt += 1;
                    let delay = self.backoff * 2u32.saturating_pow(attempt - 1);
                    warn!(attempt, delay_ms = delay.as_millis() as u64, err = %err, "retrying model request");
                    std::thread::sleep(delay);
                }
                Err((err, _)) => return Err(err.into()),
            }
        }
    }
}

/// 429 and 5xx are worth retrying; other statuses will not change on retry.
pub fn is_retryable_status(status: u16) -> bool {
    status == 429 || (500..600).contains(&status)
}

/// Extract the first choice's message from a Chat Completions response body.
pub fn parse_completion(body: &Value) -> Result<AssistantTurn, ModelError> {
    let message = body
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("message"))
        .ok_or_else(|| ModelError::Decode("response has no choices[0].message".to_string()))?;
    let content = message
        .get("content")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let tool_calls = match message.get("tool_calls") {
        None | Some(Value::Null) => Vec::new(),
        Some(calls) => serde_json::from_value::<Vec<ToolCall>>(calls.clone())
            .map_err(|e| ModelError::Decode(format!("tool_calls: {e}")))?,
    };
    Ok(AssistantTurn {
        content,
        tool_calls,
    })
}

#[cfg(test)]
mod tests {
    use std::io::{BufRead, BufReader, Read, Write};
    use std::net::TcpListener;
    use std::thread;

    use super::*;

    #[test]
    fn parses_tool_calls_and_null_content() {
        let body = json!({"choices": [{"message": {
            "role": "assistant",
            "content": null,
            "tool_calls": [{"id": "call_1", "type": "function",
                "function": {"name": "workspace_read_file", "arguments": "{\"path\":\"sections/a.liquid\"}"}}]
        }}]});
        let turn = parse_completion(&body).expect("parse");
        assert_eq!(turn.content, "");
        assert_eq!(turn.tool_calls.len(), 1);
        assert_eq!(turn.tool_calls[0].name(), "workspace_read_file");
        assert_eq!(
            turn.tool_calls[0].parsed_arguments(),
            json!({"path": "sections/a.liquid"})
        );
    }

    #[test]
    fn missing_choices_is_a_decode_error() {
        assert!(matches!(
            parse_completion(&json!({"choices": []})),
            Err(ModelError::Decode(_))
        ));
    }

    #[test]
    fn retryable_statuses() {
        assert!(is_retryable_status(429));
        assert!(is_retryable_status(503));
        assert!(!is_retryable_status(400));
        assert!(!is_retryable_status(401));
    }

    #[test]
    fn payload_advertises_tools_only_when_present() {
        let client = OpenAiCompatClient::new(&ModelConfig::default(), "k".to_string()).expect("client");
        let bare = client.payload(&[Message::user("hi")], &[]);
        assert!(bare.get("tools").is_none());
        assert_eq!(bare["messages"][0], json!({"role": "user", "content": "hi"}));

        let spec = ToolSpec::new("verify_run", "Run verification", json!({"type": "object"}));
        let with_tools = client.payload(&[Message::user("hi")], &[spec]);
        assert_eq!(with_tools["tool_choice"], "auto");
        assert_eq!(with_tools["tools"][0]["function"]["name"], "verify_run");
    }

    /// Serve canned HTTP responses, one per connection, in order.
    fn serve(responses: Vec<(u16, String)>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        thread::spawn(move || {
            for (status, body) in responses {
                let (mut stream, _) = listener.accept().expect("accept");
                let mut reader = BufReader::new(stream.try_clone().expect("clone"));
                let mut content_length = 0usize;
                loop {
                    let mut line = String::new();
                    reader.read_line(&mut line).expect("read header");
                    if line == "\r\n" || line.is_empty() {
                        break;
                    }
                    if let Some(value) = line.to_ascii_lowercase().strip_prefix("content-length:") {
                        content_length = value.trim().parse().expect("length");
                    }
                }
                let mut request_body = vec![0u8; content_length];
                reader.read_exact(&mut request_body).expect("read body");
                let response = format!(
                    "HTTP/1.1 {status} X\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                    body.len()
                );
                stream.write_all(response.as_bytes()).expect("write");
            }
        });
        format!("http://{addr}")
    }

    #[test]
    fn retries_server_errors_then_succeeds() {
        let ok = json!({"choices": [{"message": {"role": "assistant", "content": "{\"status\":\"done\"}"}}]});
        let base_url = serve(vec![
            (503, "busy".to_string()),
            (200, ok.to_string()),
        ]);
        let cfg = ModelConfig {
            base_url,
            retry_backoff_ms: 1,
            ..ModelConfig::default()
        };
        let client = OpenAiCompatClient::new(&cfg, "test-key".to_string()).expect("client");
        let turn = client.complete(&[Message::user("go")], &[]).expect("complete");
        assert_eq!(turn.content, "{\"status\":\"done\"}");
    }

    #[test]
    fn client_errors_fail_without_retry() {
        let base_url = serve(vec![(401, "{\"error\":\"bad key\"}".to_string())]);
        let cfg = ModelConfig {
            base_url,
            retry_backoff_ms: 1,
            ..ModelConfig::default()
        };
        let client = OpenAiCompatClient::new(&cfg, "test-key".to_string()).expect("client");
        let err = client.complete(&[Message::user("go")], &[]).expect_err("401");
        assert!(matches!(
            err.downcast_ref::<ModelError>(),
            Some(ModelError::Status { status: 401, .. })
        ));
    }
}
