//! OpenAI-compatible streaming backend for response generation.
//!
//! Works against any server implementing the chat completions API with
//! SSE streaming: Ollama, vLLM, llama.cpp server, hosted providers.

use crate::config::LlmConfig;
use crate::error::{AgentError, Result};
use crate::llm::ResponseGenerator;
use crate::pipeline::messages::{ChatTurn, TokenEvent};
use async_trait::async_trait;
use futures_util::StreamExt;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Buffer size for the token channel handed to the caller.
const TOKEN_CHANNEL_SIZE: usize = 64;

/// Streaming LLM client over an OpenAI-compatible HTTP API.
pub struct OpenAiGenerator {
    config: LlmConfig,
    client: reqwest::Client,
}

impl OpenAiGenerator {
    /// Create a new generator from config.
    #[must_use]
    pub fn new(config: &LlmConfig) -> Self {
        info!(
            "LLM configured: {} model={}",
            config.api_url, config.api_model
        );
        Self {
            config: config.clone(),
            client: reqwest::Client::new(),
        }
    }

    fn completions_url(&self) -> String {
        let base = self
            .config
            .api_url
            .strip_suffix("/v1")
            .unwrap_or(&self.config.api_url);
        format!("{}/v1/chat/completions", base.trim_end_matches('/'))
    }

    fn build_body(&self, system_prompt: &str, history: &[ChatTurn]) -> serde_json::Value {
        let mut messages = vec![serde_json::json!({
            "role": "system",
            "content": system_prompt,
        })];
        // Bounded recent history: the profile snapshot in the system
        // prompt carries the long-term state.
        let start = history.len().saturating_sub(self.config.max_history_turns);
        for turn in &history[start..] {
            messages.push(serde_json::json!({
                "role": turn.speaker.role(),
                "content": turn.text,
            }));
        }

        serde_json::json!({
            "model": self.config.api_model,
            "messages": messages,
            "stream": true,
            "temperature": self.config.temperature,
            "top_p": self.config.top_p,
            "max_tokens": self.config.max_tokens,
        })
    }
}

#[async_trait]
impl ResponseGenerator for OpenAiGenerator {
    async fn generate(
        &self,
        system_prompt: &str,
        history: &[ChatTurn],
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<TokenEvent>> {
        let body = self.build_body(system_prompt, history);
        let mut req = self
            .client
            .post(self.completions_url())
            .header("Content-Type", "application/json");
        if !self.config.api_key.is_empty() {
            req = req.bearer_auth(&self.config.api_key);
        }

        let response = req
            .json(&body)
            .send()
            .await
            .map_err(|e| AgentError::Llm(format!("API request failed: {e}")))?;
        let response = response
            .error_for_status()
            .map_err(|e| AgentError::Llm(format!("API returned error status: {e}")))?;

        let (tx, rx) = mpsc::channel::<TokenEvent>(TOKEN_CHANNEL_SIZE);
        let gen_start = Instant::now();

        tokio::spawn(async move {
            let mut stream = response.bytes_stream();
            let mut line_buf = String::new();
            let mut token_count: usize = 0;
            let mut cancelled = false;

            'network: loop {
                let chunk = tokio::select! {
                    // Cancellation drops the byte stream, aborting the
                    // HTTP request rather than draining it.
                    () = cancel.cancelled() => {
                        cancelled = true;
                        break 'network;
                    }
                    chunk = stream.next() => chunk,
                };

                let bytes = match chunk {
                    Some(Ok(b)) => b,
                    Some(Err(e)) => {
                        warn!("LLM stream read failed: {e}");
                        break 'network;
                    }
                    None => break 'network,
                };

                line_buf.push_str(&String::from_utf8_lossy(&bytes));
                while let Some(newline) = line_buf.find('\n') {
                    let line: String = line_buf.drain(..=newline).collect();
                    match parse_sse_line(line.trim_end()) {
                        SseLine::Token(text) => {
                            token_count += 1;
                            if tx
                                .send(TokenEvent {
                                    text,
                                    is_end: false,
                                })
                                .await
                                .is_err()
                            {
                                break 'network;
                            }
                        }
                        SseLine::Done => break 'network,
                        SseLine::Skip => {}
                    }
                }
            }

            if !cancelled {
                let _ = tx
                    .send(TokenEvent {
                        text: String::new(),
                        is_end: true,
                    })
                    .await;
            }

            let elapsed = gen_start.elapsed().as_secs_f64();
            info!(
                "LLM streamed {token_count} tokens in {elapsed:.1}s{}",
                if cancelled { " [cancelled]" } else { "" }
            );
        });

        Ok(rx)
    }
}

enum SseLine {
    Token(String),
    Done,
    Skip,
}

fn parse_sse_line(line: &str) -> SseLine {
    let Some(data) = line.strip_prefix("data: ") else {
        return SseLine::Skip;
    };
    if data == "[DONE]" {
        return SseLine::Done;
    }
    let Ok(chunk) = serde_json::from_str::<serde_json::Value>(data) else {
        warn!("unparseable SSE chunk skipped");
        return SseLine::Skip;
    };
    if chunk["choices"][0]["finish_reason"].as_str() == Some("stop") {
        // A final chunk can still carry content; surface it first.
        if let Some(content) = chunk["choices"][0]["delta"]["content"].as_str()
            && !content.is_empty()
        {
            return SseLine::Token(content.to_owned());
        }
        return SseLine::Done;
    }
    match chunk["choices"][0]["delta"]["content"].as_str() {
        Some(content) if !content.is_empty() => SseLine::Token(content.to_owned()),
        _ => SseLine::Skip,
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;
    use crate::pipeline::messages::Speaker;

    // ── SSE parsing ─────────────────────────────────────────────────

    #[test]
    fn parses_content_delta() {
        let line = r#"data: {"choices":[{"delta":{"content":"Hi"}}]}"#;
        assert!(matches!(parse_sse_line(line), SseLine::Token(t) if t == "Hi"));
    }

    #[test]
    fn done_marker_ends_stream() {
        assert!(matches!(parse_sse_line("data: [DONE]"), SseLine::Done));
    }

    #[test]
    fn finish_reason_stop_ends_stream() {
        let line = r#"data: {"choices":[{"delta":{},"finish_reason":"stop"}]}"#;
        assert!(matches!(parse_sse_line(line), SseLine::Done));
    }

    #[test]
    fn non_data_lines_skipped() {
        assert!(matches!(parse_sse_line(""), SseLine::Skip));
        assert!(matches!(parse_sse_line(": keepalive"), SseLine::Skip));
        assert!(matches!(parse_sse_line("event: ping"), SseLine::Skip));
    }

    // ── request body ────────────────────────────────────────────────

    #[test]
    fn history_is_bounded_to_recent_turns() {
        let mut config = LlmConfig::default();
        config.max_history_turns = 2;
        let generator = OpenAiGenerator::new(&config);

        let history: Vec<ChatTurn> = (0..5)
            .map(|i| ChatTurn {
                speaker: if i % 2 == 0 {
                    Speaker::User
                } else {
                    Speaker::Assistant
                },
                text: format!("turn {i}"),
            })
            .collect();

        let body = generator.build_body("sys", &history);
        let messages = body["messages"].as_array().unwrap();
        // system prompt + the 2 most recent turns
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0]["role"], "system");
        assert_eq!(messages[1]["content"], "turn 3");
        assert_eq!(messages[2]["content"], "turn 4");
    }

    #[test]
    fn url_handles_v1_suffix() {
        let mut config = LlmConfig::default();
        config.api_url = "http://localhost:8080/v1".to_owned();
        let generator = OpenAiGenerator::new(&config);
        assert_eq!(
            generator.completions_url(),
            "http://localhost:8080/v1/chat/completions"
        );
    }
}
