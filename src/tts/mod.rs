//! Streaming text-to-speech client.
//!
//! The core only demands an ordered, cancellable stream of audio bytes; the
//! provider's chunk framing is passed through untouched.

use crate::config::TtsConfig;
use crate::error::{AgentError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use std::pin::Pin;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Ordered stream of synthesized audio chunks.
pub type AudioStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// Streaming speech synthesis contract.
#[async_trait]
pub trait TextToSpeech: Send + Sync {
    /// Synthesize `text` and return the ordered chunk stream.
    ///
    /// The stream stops producing within one chunk boundary of `cancel`
    /// being set.
    ///
    /// # Errors
    ///
    /// Returns an error if the synthesis request cannot be issued or is
    /// rejected.
    async fn synthesize(&self, text: &str, cancel: CancellationToken) -> Result<AudioStream>;
}

/// TTS client for a streaming HTTP synthesis endpoint.
pub struct StreamingTtsClient {
    config: TtsConfig,
    client: reqwest::Client,
}

impl StreamingTtsClient {
    /// Create a client for the configured endpoint and voice.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(config: &TtsConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| AgentError::Tts(format!("failed to build HTTP client: {e}")))?;

        info!(
            "TTS client configured: {} voice={}",
            config.endpoint, config.voice_id
        );

        Ok(Self {
            config: config.clone(),
            client,
        })
    }

    fn stream_url(&self) -> String {
        let base = self.config.endpoint.trim_end_matches('/');
        format!("{base}/{}/stream", self.config.voice_id)
    }
}

#[async_trait]
impl TextToSpeech for StreamingTtsClient {
    async fn synthesize(&self, text: &str, cancel: CancellationToken) -> Result<AudioStream> {
        let body = serde_json::json!({ "text": text });

        let mut request = self.client.post(self.stream_url()).json(&body);
        if !self.config.api_key.is_empty() {
            request = request.bearer_auth(&self.config.api_key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| AgentError::Tts(format!("request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let detail = response.text().await.unwrap_or_default();
            return Err(AgentError::Tts(format!("API error {status}: {detail}")));
        }

        let mut body_stream = response.bytes_stream();

        let stream = async_stream::stream! {
            loop {
                let chunk = tokio::select! {
                    biased;
                    () = cancel.cancelled() => {
                        debug!("TTS chunk streaming cancelled");
                        return;
                    }
                    chunk = body_stream.next() => chunk,
                };
                match chunk {
                    Some(Ok(chunk)) => yield Ok(chunk),
                    Some(Err(e)) => {
                        yield Err(AgentError::Tts(format!("stream read failed: {e}")));
                        return;
                    }
                    None => return,
                }
            }
        };

        Ok(Box::pin(stream))
    }
}
