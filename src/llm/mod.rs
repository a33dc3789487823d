//! Streaming chat-completions client yielding sentence chunks.
//!
//! Consumes server-sent events from an OpenAI-compatible endpoint and slices
//! the token stream into sentences so TTS can start before the full response
//! completes.

use crate::config::LlmConfig;
use crate::error::{AgentError, Result};
use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Message role in a chat prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A single role-tagged message in a chat prompt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

/// A sentence sliced from the LLM token stream, ready for TTS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentenceChunk {
    /// Complete sentence text.
    pub text: String,
    /// Whether this is the last sentence of the response.
    pub is_final: bool,
}

/// Ordered stream of sentence chunks.
pub type SentenceStream = Pin<Box<dyn Stream<Item = Result<SentenceChunk>> + Send>>;

/// Sentence-producing language model contract.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Start a streaming generation and return the sentence stream.
    ///
    /// The stream observes `cancel` at every provider-chunk boundary and
    /// terminates promptly once it is set. A response with no content yields
    /// an empty stream.
    ///
    /// # Errors
    ///
    /// Returns an error if the request cannot be issued or is rejected.
    async fn stream_sentences(
        &self,
        messages: Vec<ChatMessage>,
        cancel: CancellationToken,
    ) -> Result<SentenceStream>;
}

/// LLM client for an OpenAI-compatible chat-completions API.
pub struct ChatApiClient {
    config: LlmConfig,
    client: reqwest::Client,
}

impl ChatApiClient {
    /// Create a client with the configured connect and request timeouts.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_millis(config.connect_timeout_ms))
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()
            .map_err(|e| AgentError::Llm(format!("failed to build HTTP client: {e}")))?;

        info!(
            "LLM client configured: {} model={}",
            config.api_url, config.model
        );

        Ok(Self {
            config: config.clone(),
            client,
        })
    }

    fn completions_url(&self) -> String {
        let base = match self.config.api_url.strip_suffix("/v1") {
            Some(stripped) => stripped,
            None => &self.config.api_url,
        };
        let base = base.trim_end_matches('/');
        format!("{base}/v1/chat/completions")
    }
}

#[async_trait]
impl LanguageModel for ChatApiClient {
    async fn stream_sentences(
        &self,
        messages: Vec<ChatMessage>,
        cancel: CancellationToken,
    ) -> Result<SentenceStream> {
        let body = serde_json::json!({
            "model": self.config.model,
            "messages": messages,
            "stream": true,
            "temperature": self.config.temperature,
            "max_tokens": self.config.max_tokens,
        });

        let mut request = self.client.post(self.completions_url()).json(&body);
        if !self.config.api_key.is_empty() {
            request = request.bearer_auth(&self.config.api_key);
        }
        if self.config.use_priority_tier {
            request = request.header("x-stainless-priority", "high");
        }
        if let Some(ref organization) = self.config.organization_id {
            request = request.header("OpenAI-Organization", organization);
        }
        if let Some(ref project) = self.config.project_id {
            request = request.header("OpenAI-Project", project);
        }

        let response = request
            .send()
            .await
            .map_err(|e| AgentError::Llm(format!("request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let detail = response.text().await.unwrap_or_default();
            return Err(AgentError::Llm(format!("API error {status}: {detail}")));
        }

        let mut body_stream = response.bytes_stream();

        let stream = async_stream::stream! {
            let mut line_buffer = String::new();
            let mut sentence_buffer = String::new();
            let mut completion_tokens: u64 = 0;
            let mut done = false;

            'outer: while !done {
                let chunk = tokio::select! {
                    biased;
                    () = cancel.cancelled() => {
                        debug!("LLM sentence streaming cancelled");
                        return;
                    }
                    chunk = body_stream.next() => chunk,
                };
                let chunk = match chunk {
                    Some(Ok(chunk)) => chunk,
                    Some(Err(e)) => {
                        yield Err(AgentError::Llm(format!("stream read failed: {e}")));
                        return;
                    }
                    None => break,
                };

                line_buffer.push_str(&String::from_utf8_lossy(&chunk));

                while let Some(newline) = line_buffer.find('\n') {
                    let line: String = line_buffer.drain(..=newline).collect();
                    let line = line.trim_end_matches(['\n', '\r']);
                    if line.is_empty() {
                        continue;
                    }
                    let Some(data) = line.strip_prefix("data: ") else {
                        continue;
                    };
                    if data == "[DONE]" {
                        done = true;
                        break;
                    }

                    let event: serde_json::Value = match serde_json::from_str(data) {
                        Ok(event) => event,
                        Err(e) => {
                            warn!("skipping malformed SSE data line: {e}");
                            continue;
                        }
                    };

                    // Usage counts ride on the last frame when the provider sends them.
                    if let Some(usage) = event.get("usage")
                        && let Some(tokens) = usage.get("completion_tokens").and_then(serde_json::Value::as_u64)
                    {
                        completion_tokens = tokens;
                    }

                    let Some(content) = event["choices"][0]["delta"]["content"].as_str() else {
                        continue;
                    };
                    if content.is_empty() {
                        continue;
                    }
                    sentence_buffer.push_str(content);

                    while let Some(pos) = find_sentence_boundary(&sentence_buffer) {
                        let sentence = sentence_buffer[..=pos].trim().to_owned();
                        sentence_buffer = sentence_buffer[pos + 1..].to_owned();
                        if !sentence.is_empty() {
                            yield Ok(SentenceChunk { text: sentence, is_final: false });
                        }
                        if cancel.is_cancelled() {
                            break 'outer;
                        }
                    }
                }
            }

            let residue = sentence_buffer.trim().to_owned();
            if !residue.is_empty() && !cancel.is_cancelled() {
                yield Ok(SentenceChunk { text: residue, is_final: true });
            }
            info!("LLM sentence streaming complete ({completion_tokens} completion tokens)");
        };

        Ok(Box::pin(stream))
    }
}

/// Find the byte index of a sentence-ending character (`.`, `!`, `?`)
/// followed by whitespace or end of buffer.
pub(crate) fn find_sentence_boundary(text: &str) -> Option<usize> {
    for (i, c) in text.char_indices() {
        if matches!(c, '.' | '!' | '?') {
            let rest = &text[i + c.len_utf8()..];
            if rest.is_empty() || rest.starts_with(char::is_whitespace) {
                return Some(i);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    #[test]
    fn boundary_at_period_before_space() {
        assert!(find_sentence_boundary("Hi there. How") == Some(8));
    }

    #[test]
    fn boundary_at_end_of_buffer() {
        assert!(find_sentence_boundary("How can I help?") == Some(14));
    }

    #[test]
    fn no_boundary_inside_decimal() {
        assert!(find_sentence_boundary("pi is 3.14 roughly").is_none());
    }

    #[test]
    fn no_boundary_without_punctuation() {
        assert!(find_sentence_boundary("still going").is_none());
    }

    #[test]
    fn exclamation_and_question_marks_count() {
        assert!(find_sentence_boundary("Wow! Really") == Some(3));
        assert!(find_sentence_boundary("Really? Yes") == Some(6));
    }

    #[test]
    fn completions_url_strips_v1_suffix() {
        let config = LlmConfig {
            api_url: "http://localhost:8080/v1".to_owned(),
            ..Default::default()
        };
        let client = ChatApiClient::new(&config).unwrap();
        assert!(client.completions_url() == "http://localhost:8080/v1/chat/completions");
    }

    #[test]
    fn completions_url_without_suffix() {
        let config = LlmConfig {
            api_url: "http://localhost:8080/".to_owned(),
            ..Default::default()
        };
        let client = ChatApiClient::new(&config).unwrap();
        assert!(client.completions_url() == "http://localhost:8080/v1/chat/completions");
    }

    #[test]
    fn role_serializes_lowercase() {
        let message = ChatMessage {
            role: Role::Assistant,
            content: "hi".to_owned(),
        };
        let json = serde_json::to_value(&message).unwrap();
        assert!(json["role"] == "assistant");
    }
}
