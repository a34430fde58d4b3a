//! Chat completion backends.
//!
//! Two wire formats are supported:
//!
//! | Provider | Endpoint | Streaming format |
//! |----------|----------|------------------|
//! | `openai` | `POST {url}/v1/chat/completions` | server-sent `data:` lines, `[DONE]` terminator |
//! | `ollama` | `POST {url}/api/chat` | one JSON object per line, `done: true` terminator |
//!
//! Streaming responses are read on a background task that pushes decoded
//! tokens into a channel; the caller sees a plain [`TokenStream`].
//!
//! Chat requests are retried on network failures only. A 429 or 5xx from
//! the model is returned as is, carrying its status for the error
//! classifier.

use anyhow::{bail, Result};
use futures_util::StreamExt;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::config::LlmConfig;
use crate::provider::{openai_key, post_with_retry, ChatRequest, RetryPolicy, TokenStream};

const OPENAI_URL: &str = "https://api.openai.com";
const OLLAMA_URL: &str = "http://localhost:11434";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Wire {
    OpenAi,
    Ollama,
}

struct Endpoint {
    wire: Wire,
    url: String,
    key: Option<String>,
    model: String,
}

fn endpoint(config: &LlmConfig) -> Result<Endpoint> {
    let model = config
        .model
        .clone()
        .ok_or_else(|| anyhow::anyhow!("llm.model required"))?;
    match config.provider.as_str() {
        "openai" => Ok(Endpoint {
            wire: Wire::OpenAi,
            url: format!(
                "{}/v1/chat/completions",
                config.url.as_deref().unwrap_or(OPENAI_URL)
            ),
            key: Some(openai_key()?),
            model,
        }),
        "ollama" => Ok(Endpoint {
            wire: Wire::Ollama,
            url: format!("{}/api/chat", config.url.as_deref().unwrap_or(OLLAMA_URL)),
            key: None,
            model,
        }),
        "disabled" => bail!("LLM provider is disabled"),
        other => bail!("Unknown llm provider: {}", other),
    }
}

fn request_body(
    ep: &Endpoint,
    config: &LlmConfig,
    request: &ChatRequest,
    stream: bool,
) -> serde_json::Value {
    let messages = serde_json::json!([
        {"role": "system", "content": request.system},
        {"role": "user", "content": request.user},
    ]);
    match ep.wire {
        Wire::OpenAi => {
            let mut body = serde_json::json!({
                "model": ep.model,
                "messages": messages,
                "temperature": config.temperature,
                "stream": stream,
            });
            if request.json {
                body["response_format"] = serde_json::json!({"type": "json_object"});
            }
            body
        }
        Wire::Ollama => {
            let mut body = serde_json::json!({
                "model": ep.model,
                "messages": messages,
                "stream": stream,
                "options": {"temperature": config.temperature},
            });
            if request.json {
                body["format"] = serde_json::json!("json");
            }
            body
        }
    }
}

fn client(config: &LlmConfig) -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .timeout(Duration::from_secs(config.timeout_secs))
        .build()?)
}

fn label(wire: Wire) -> &'static str {
    match wire {
        Wire::OpenAi => "OpenAI",
        Wire::Ollama => "Ollama",
    }
}

/// Run a non-streaming completion and return the message content.
pub async fn complete(config: &LlmConfig, request: &ChatRequest) -> Result<String> {
    let ep = endpoint(config)?;
    let body = request_body(&ep, config, request, false);
    let response = post_with_retry(
        &client(config)?,
        &ep.url,
        ep.key.as_deref(),
        &body,
        config.max_retries,
        RetryPolicy::NetworkOnly,
        label(ep.wire),
    )
    .await?;
    let json: serde_json::Value = response.json().await?;

    let content = match ep.wire {
        Wire::OpenAi => json
            .pointer("/choices/0/message/content")
            .and_then(|c| c.as_str()),
        Wire::Ollama => json.pointer("/message/content").and_then(|c| c.as_str()),
    };
    content
        .map(|c| c.to_string())
        .ok_or_else(|| anyhow::anyhow!("Invalid {} response: missing message content", label(ep.wire)))
}

/// Run a streaming completion.
///
/// Only the initial request is retried, and only on network failures; once
/// tokens start flowing a broken connection surfaces as an error item in the
/// stream.
pub async fn complete_streaming(config: &LlmConfig, request: &ChatRequest) -> Result<TokenStream> {
    let ep = endpoint(config)?;
    let body = request_body(&ep, config, request, true);
    let response = post_with_retry(
        &client(config)?,
        &ep.url,
        ep.key.as_deref(),
        &body,
        config.max_retries,
        RetryPolicy::NetworkOnly,
        label(ep.wire),
    )
    .await?;

    let wire = ep.wire;
    let (tx, rx) = mpsc::channel::<Result<String>>(64);

    tokio::spawn(async move {
        let mut bytes = response.bytes_stream();
        let mut lines = LineBuffer::default();

        while let Some(next) = bytes.next().await {
            let piece = match next {
                Ok(piece) => piece,
                Err(e) => {
                    let _ = tx
                        .send(Err(anyhow::anyhow!("{} stream error: {}", label(wire), e)))
                        .await;
                    return;
                }
            };
            lines.push(&piece);

            while let Some(line) = lines.next_line() {
                let event = line
                    .map_err(|e| anyhow::anyhow!("{} stream is not UTF-8: {}", label(wire), e))
                    .and_then(|line| decode_line(wire, line.trim()));
                match event {
                    Ok(LineEvent::Token(token)) => {
                        if tx.send(Ok(token)).await.is_err() {
                            return;
                        }
                    }
                    Ok(LineEvent::Done) => return,
                    Ok(LineEvent::Skip) => {}
                    Err(e) => {
                        let _ = tx.send(Err(e)).await;
                        return;
                    }
                }
            }
        }

        if let Ok(rest) = lines.finish() {
            if let Ok(LineEvent::Token(token)) = decode_line(wire, rest.trim()) {
                let _ = tx.send(Ok(token)).await;
            }
        }
    });

    Ok(ReceiverStream::new(rx).boxed())
}

/// Splits a byte stream into lines. Network chunks can end inside a
/// multi-byte character, so bytes are only decoded once a whole line is in.
#[derive(Debug, Default)]
struct LineBuffer {
    buf: Vec<u8>,
}

impl LineBuffer {
    fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    fn next_line(&mut self) -> Option<Result<String, std::string::FromUtf8Error>> {
        let pos = self.buf.iter().position(|&b| b == b'\n')?;
        let line: Vec<u8> = self.buf.drain(..=pos).collect();
        Some(String::from_utf8(line))
    }

    /// Whatever follows the last newline.
    fn finish(self) -> Result<String, std::string::FromUtf8Error> {
        String::from_utf8(self.buf)
    }
}

#[derive(Debug, PartialEq)]
enum LineEvent {
    Token(String),
    Done,
    Skip,
}

fn decode_line(wire: Wire, line: &str) -> Result<LineEvent> {
    if line.is_empty() {
        return Ok(LineEvent::Skip);
    }
    match wire {
        Wire::OpenAi => {
            let Some(data) = line.strip_prefix("data:") else {
                return Ok(LineEvent::Skip);
            };
            let data = data.trim();
            if data == "[DONE]" {
                return Ok(LineEvent::Done);
            }
            let json: serde_json::Value = serde_json::from_str(data)?;
            if let Some(err) = json.get("error") {
                bail!("OpenAI stream error: {}", err);
            }
            Ok(json
                .pointer("/choices/0/delta/content")
                .and_then(|c| c.as_str())
                .filter(|c| !c.is_empty())
                .map(|c| LineEvent::Token(c.to_string()))
                .unwrap_or(LineEvent::Skip))
        }
        Wire::Ollama => {
            let json: serde_json::Value = serde_json::from_str(line)?;
            if let Some(err) = json.get("error").and_then(|e| e.as_str()) {
                bail!("Ollama stream error: {}", err);
            }
            let token = json
                .pointer("/message/content")
                .and_then(|c| c.as_str())
                .unwrap_or("");
            if !token.is_empty() {
                return Ok(LineEvent::Token(token.to_string()));
            }
            if json.get("done").and_then(|d| d.as_bool()) == Some(true) {
                return Ok(LineEvent::Done);
            }
            Ok(LineEvent::Skip)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_openai_sse_lines() {
        let line = r#"data: {"choices":[{"delta":{"content":"{\"rules\""}}]}"#;
        assert_eq!(
            decode_line(Wire::OpenAi, line).unwrap(),
            LineEvent::Token("{\"rules\"".to_string())
        );
        assert_eq!(decode_line(Wire::OpenAi, "data: [DONE]").unwrap(), LineEvent::Done);
        assert_eq!(decode_line(Wire::OpenAi, ": keep-alive").unwrap(), LineEvent::Skip);
        assert_eq!(
            decode_line(Wire::OpenAi, r#"data: {"choices":[{"delta":{"role":"assistant"}}]}"#)
                .unwrap(),
            LineEvent::Skip
        );
    }

    #[test]
    fn test_openai_stream_error_payload() {
        let line = r#"data: {"error":{"message":"Rate limit reached","code":"rate_limit_exceeded"}}"#;
        let err = decode_line(Wire::OpenAi, line).unwrap_err();
        assert!(err.to_string().contains("rate_limit_exceeded"));
    }

    #[test]
    fn test_ollama_lines() {
        let line = r#"{"message":{"role":"assistant","content":"Цена"},"done":false}"#;
        assert_eq!(
            decode_line(Wire::Ollama, line).unwrap(),
            LineEvent::Token("Цена".to_string())
        );
        let done = r#"{"message":{"role":"assistant","content":""},"done":true}"#;
        assert_eq!(decode_line(Wire::Ollama, done).unwrap(), LineEvent::Done);
    }

    #[test]
    fn test_line_buffer_joins_split_characters() {
        let line = r#"{"message":{"content":"Цена"},"done":false}"#.to_string() + "\n";
        let bytes = line.as_bytes();
        // Cut between the two bytes of "Ц".
        let cut = line.find('Ц').unwrap() + 1;

        let mut lines = LineBuffer::default();
        lines.push(&bytes[..cut]);
        assert!(lines.next_line().is_none());
        lines.push(&bytes[cut..]);
        let decoded = lines.next_line().unwrap().unwrap();
        assert_eq!(
            decode_line(Wire::Ollama, decoded.trim()).unwrap(),
            LineEvent::Token("Цена".to_string())
        );
        assert!(lines.next_line().is_none());
        assert_eq!(lines.finish().unwrap(), "");
    }

    #[test]
    fn test_line_buffer_rejects_invalid_utf8() {
        let mut lines = LineBuffer::default();
        lines.push(&[b'a', 0xff, b'\n', b'b']);
        assert!(lines.next_line().unwrap().is_err());
        assert_eq!(lines.finish().unwrap(), "b");
    }

    #[tokio::test]
    async fn test_chat_does_not_retry_server_errors() {
        use axum::{extract::State, http::StatusCode, routing::post, Router};
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        async fn overloaded(State(hits): State<Arc<AtomicUsize>>) -> (StatusCode, &'static str) {
            hits.fetch_add(1, Ordering::SeqCst);
            (StatusCode::SERVICE_UNAVAILABLE, "overloaded")
        }

        let hits = Arc::new(AtomicUsize::new(0));
        let app = Router::new()
            .route("/api/chat", post(overloaded))
            .with_state(hits.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let config = LlmConfig {
            provider: "ollama".into(),
            model: Some("qwen2.5".into()),
            url: Some(format!("http://{}", addr)),
            max_retries: 3,
            ..LlmConfig::default()
        };
        let err = complete(&config, &ChatRequest::json("s", "u")).await.unwrap_err();
        assert!(err.to_string().contains("503"));
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        let err = complete_streaming(&config, &ChatRequest::json("s", "u"))
            .await
            .err()
            .unwrap();
        assert!(err.to_string().contains("503"));
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_request_body_json_mode() {
        let config = LlmConfig {
            provider: "ollama".into(),
            model: Some("qwen2.5".into()),
            ..LlmConfig::default()
        };
        let ep = endpoint(&config).unwrap();
        let body = request_body(&ep, &config, &ChatRequest::json("s", "u"), true);
        assert_eq!(body["format"], "json");
        assert_eq!(body["stream"], true);
        assert_eq!(body["messages"][1]["content"], "u");
    }
}
