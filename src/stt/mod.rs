//! Streaming speech-to-text client over a persistent WebSocket.
//!
//! The send path decouples callers from the provider through a bounded queue
//! so backpressure never stalls the turn controller; the receive path parses
//! provider frames into partial/final transcript events. Transport loss is
//! handled by a reconnect supervisor with exponential backoff.

use crate::config::SttConfig;
use crate::error::{AgentError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use url::Url;
use tracing::{debug, error, info, warn};

/// Reconnect backoff schedule in seconds.
const RECONNECT_DELAYS_SECS: [u64; 5] = [0, 1, 2, 4, 8];

/// Maximum reconnect attempts before reporting an unrecoverable error.
const MAX_RECONNECT_ATTEMPTS: usize = RECONNECT_DELAYS_SECS.len();

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Transcript and error events from the STT provider.
#[derive(Debug, Clone, PartialEq)]
pub enum SttEvent {
    /// Interim hypothesis; may change.
    Partial { text: String, confidence: f32 },
    /// Stable segment; feeds the LLM.
    Final { text: String, confidence: f32 },
    /// Provider or transport error. `recoverable = false` means the
    /// reconnect budget is exhausted.
    Error { message: String, recoverable: bool },
}

/// Connection status of the STT adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SttStatus {
    Disconnected,
    Connected,
    Reconnecting,
    Closing,
}

/// Streaming speech-to-text contract.
#[async_trait]
pub trait SpeechToText: Send + Sync {
    /// Open the streaming connection; events flow on `events`.
    ///
    /// # Errors
    ///
    /// Returns an error if the initial handshake fails.
    async fn connect(&mut self, events: mpsc::UnboundedSender<SttEvent>) -> Result<()>;

    /// Queue an audio chunk for the provider.
    ///
    /// Never blocks the caller for long; chunks are dropped with a warning
    /// when the send queue stays full.
    async fn send_audio(&self, audio: Bytes);

    /// Close the connection. Idempotent.
    async fn disconnect(&mut self);

    /// Current connection status.
    fn status(&self) -> SttStatus;
}

/// WebSocket STT client with a bounded send queue and reconnect supervisor.
pub struct RealtimeSttClient {
    config: SttConfig,
    audio_tx: mpsc::Sender<Bytes>,
    audio_rx: Option<mpsc::Receiver<Bytes>>,
    shared: Arc<Shared>,
    cancel: CancellationToken,
    supervisor: Option<JoinHandle<()>>,
}

#[derive(Debug, Default)]
struct Shared {
    connected: AtomicBool,
    closing: AtomicBool,
    reconnecting: AtomicBool,
}

impl RealtimeSttClient {
    /// Create a disconnected client.
    #[must_use]
    pub fn new(config: &SttConfig) -> Self {
        let (audio_tx, audio_rx) = mpsc::channel(config.send_queue_capacity);
        Self {
            config: config.clone(),
            audio_tx,
            audio_rx: Some(audio_rx),
            shared: Arc::new(Shared::default()),
            cancel: CancellationToken::new(),
            supervisor: None,
        }
    }
}

#[async_trait]
impl SpeechToText for RealtimeSttClient {
    async fn connect(&mut self, events: mpsc::UnboundedSender<SttEvent>) -> Result<()> {
        if self.supervisor.is_some() {
            warn!("already connected to STT provider");
            return Ok(());
        }
        if self.audio_rx.is_none() {
            return Err(AgentError::Stt("client already shut down".to_owned()));
        }

        let stream = dial(&self.config).await?;
        let Some(audio_rx) = self.audio_rx.take() else {
            return Err(AgentError::Stt("client already shut down".to_owned()));
        };
        self.shared.connected.store(true, Ordering::Relaxed);
        info!("connected to STT streaming API");

        let config = self.config.clone();
        let shared = Arc::clone(&self.shared);
        let cancel = self.cancel.clone();
        self.supervisor = Some(tokio::spawn(async move {
            run_supervisor(config, stream, events, audio_rx, shared, cancel).await;
        }));
        Ok(())
    }

    async fn send_audio(&self, audio: Bytes) {
        if !self.shared.connected.load(Ordering::Relaxed) {
            warn!("cannot send audio: not connected to STT provider");
            return;
        }
        let enqueue_timeout = Duration::from_millis(self.config.enqueue_timeout_ms);
        match tokio::time::timeout(enqueue_timeout, self.audio_tx.send(audio)).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => warn!("STT audio queue closed"),
            Err(_) => warn!("STT audio queue full - dropping chunk to avoid stalling"),
        }
    }

    async fn disconnect(&mut self) {
        let Some(supervisor) = self.supervisor.take() else {
            return;
        };
        self.shared.closing.store(true, Ordering::Relaxed);
        self.cancel.cancel();
        let _ = supervisor.await;
        self.shared.connected.store(false, Ordering::Relaxed);
        info!("disconnected from STT provider");
    }

    fn status(&self) -> SttStatus {
        if self.shared.closing.load(Ordering::Relaxed) {
            SttStatus::Closing
        } else if self.shared.connected.load(Ordering::Relaxed) {
            SttStatus::Connected
        } else if self.shared.reconnecting.load(Ordering::Relaxed) {
            SttStatus::Reconnecting
        } else {
            SttStatus::Disconnected
        }
    }
}

/// Open the provider socket configured for interim results and
/// utterance-end events.
async fn dial(config: &SttConfig) -> Result<WsStream> {
    let url = build_url(config)?;
    let mut request = url
        .as_str()
        .into_client_request()
        .map_err(|e| AgentError::Stt(format!("invalid STT endpoint: {e}")))?;
    if !config.api_key.is_empty() {
        let value = format!("Bearer {}", config.api_key)
            .parse()
            .map_err(|e| AgentError::Stt(format!("invalid API key header: {e}")))?;
        request.headers_mut().insert("Authorization", value);
    }

    let (stream, _) = tokio_tungstenite::connect_async(request)
        .await
        .map_err(|e| AgentError::Stt(format!("connection failed: {e}")))?;
    Ok(stream)
}

fn build_url(config: &SttConfig) -> Result<Url> {
    let mut url = Url::parse(&config.endpoint)
        .map_err(|e| AgentError::Stt(format!("invalid STT endpoint: {e}")))?;
    url.query_pairs_mut()
        .append_pair("encoding", "linear16")
        .append_pair("sample_rate", &config.sample_rate.to_string())
        .append_pair("channels", "1")
        .append_pair("interim_results", "true")
        .append_pair("punctuate", "true")
        .append_pair("utterance_end_ms", &config.utterance_end_ms.to_string())
        .append_pair("vad_events", "true");
    Ok(url)
}

/// Why a live connection ended.
enum ConnectionOutcome {
    /// Clean close (disconnect requested or queue dropped).
    Closed,
    /// In-flight transport drop; the supervisor should reconnect.
    TransportLost,
}

/// Owns the connection lifecycle: drives the live socket, reconnects with
/// backoff on transport loss, reports exhaustion as an unrecoverable error.
async fn run_supervisor(
    config: SttConfig,
    first: WsStream,
    events: mpsc::UnboundedSender<SttEvent>,
    mut audio_rx: mpsc::Receiver<Bytes>,
    shared: Arc<Shared>,
    cancel: CancellationToken,
) {
    let mut stream = Some(first);
    let mut attempts: usize = 0;

    loop {
        let live = match stream.take() {
            Some(live) => live,
            None => {
                if attempts >= MAX_RECONNECT_ATTEMPTS {
                    error!("max STT reconnection attempts reached");
                    shared.reconnecting.store(false, Ordering::Relaxed);
                    let _ = events.send(SttEvent::Error {
                        message: "connection lost - max retries exceeded".to_owned(),
                        recoverable: false,
                    });
                    return;
                }
                let delay = RECONNECT_DELAYS_SECS[attempts];
                attempts += 1;
                info!(
                    "reconnecting to STT (attempt {attempts}/{MAX_RECONNECT_ATTEMPTS}) in {delay}s"
                );
                shared.reconnecting.store(true, Ordering::Relaxed);
                tokio::select! {
                    () = cancel.cancelled() => return,
                    () = tokio::time::sleep(Duration::from_secs(delay)) => {}
                }
                match dial(&config).await {
                    Ok(live) => {
                        attempts = 0;
                        shared.reconnecting.store(false, Ordering::Relaxed);
                        shared.connected.store(true, Ordering::Relaxed);
                        info!("reconnected to STT streaming API");
                        live
                    }
                    Err(e) => {
                        warn!("STT reconnect failed: {e}");
                        let _ = events.send(SttEvent::Error {
                            message: format!("reconnect failed: {e}"),
                            recoverable: true,
                        });
                        continue;
                    }
                }
            }
        };

        match run_connection(&config, live, &events, &mut audio_rx, &cancel).await {
            ConnectionOutcome::Closed => {
                shared.connected.store(false, Ordering::Relaxed);
                return;
            }
            ConnectionOutcome::TransportLost => {
                shared.connected.store(false, Ordering::Relaxed);
            }
        }
    }
}

/// Drive one live socket: forward queued audio, keep the connection alive
/// during silence, and parse incoming provider frames.
async fn run_connection(
    config: &SttConfig,
    stream: WsStream,
    events: &mpsc::UnboundedSender<SttEvent>,
    audio_rx: &mut mpsc::Receiver<Bytes>,
    cancel: &CancellationToken,
) -> ConnectionOutcome {
    let (mut write, mut read) = stream.split();
    let keepalive = Duration::from_millis(config.keepalive_interval_ms);

    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                let _ = write
                    .send(Message::Text(r#"{"type":"CloseStream"}"#.to_owned()))
                    .await;
                let _ = write.close().await;
                return ConnectionOutcome::Closed;
            }
            queued = tokio::time::timeout(keepalive, audio_rx.recv()) => match queued {
                Ok(Some(audio)) => {
                    if let Err(e) = write.send(Message::Binary(audio.to_vec())).await {
                        error!("error sending audio to STT: {e}");
                        return ConnectionOutcome::TransportLost;
                    }
                }
                Ok(None) => {
                    let _ = write.close().await;
                    return ConnectionOutcome::Closed;
                }
                Err(_) => {
                    // No audio for the keepalive interval.
                    if write
                        .send(Message::Text(r#"{"type":"KeepAlive"}"#.to_owned()))
                        .await
                        .is_err()
                    {
                        return ConnectionOutcome::TransportLost;
                    }
                }
            },
            frame = read.next() => match frame {
                Some(Ok(Message::Text(text))) => handle_frame(&text, events),
                Some(Ok(Message::Close(_))) | None => {
                    warn!("STT socket closed by provider");
                    return ConnectionOutcome::TransportLost;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    error!("STT socket error: {e}");
                    return ConnectionOutcome::TransportLost;
                }
            }
        }
    }
}

/// Parse one provider frame into transcript events.
fn handle_frame(raw: &str, events: &mpsc::UnboundedSender<SttEvent>) {
    let frame: serde_json::Value = match serde_json::from_str(raw) {
        Ok(frame) => frame,
        Err(e) => {
            warn!("invalid JSON from STT provider: {e}");
            return;
        }
    };

    if let Some(message) = frame.get("error").and_then(serde_json::Value::as_str) {
        error!("STT provider error: {message}");
        let _ = events.send(SttEvent::Error {
            message: message.to_owned(),
            recoverable: true,
        });
        return;
    }

    let Some(alternative) = frame
        .get("channel")
        .and_then(|channel| channel.get("alternatives"))
        .and_then(|alternatives| alternatives.get(0))
    else {
        return;
    };

    let transcript = alternative
        .get("transcript")
        .and_then(serde_json::Value::as_str)
        .unwrap_or("")
        .trim();
    if transcript.is_empty() {
        return;
    }
    let confidence = alternative
        .get("confidence")
        .and_then(serde_json::Value::as_f64)
        .unwrap_or(0.0) as f32;

    let is_final = frame
        .get("is_final")
        .and_then(serde_json::Value::as_bool)
        .unwrap_or(false);
    let speech_final = frame
        .get("speech_final")
        .and_then(serde_json::Value::as_bool)
        .unwrap_or(false);

    if is_final || speech_final {
        debug!("final transcript: {transcript} (confidence {confidence:.2})");
        let _ = events.send(SttEvent::Final {
            text: transcript.to_owned(),
            confidence,
        });
    } else {
        debug!("partial transcript: {transcript} (confidence {confidence:.2})");
        let _ = events.send(SttEvent::Partial {
            text: transcript.to_owned(),
            confidence,
        });
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    fn frame_events(raw: &str) -> Vec<SttEvent> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        handle_frame(raw, &tx);
        drop(tx);
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn url_carries_streaming_parameters() {
        let url = build_url(&SttConfig::default()).unwrap();
        let query = url.query().unwrap();
        assert!(query.contains("encoding=linear16"));
        assert!(query.contains("sample_rate=16000"));
        assert!(query.contains("interim_results=true"));
        assert!(query.contains("utterance_end_ms=1000"));
    }

    #[test]
    fn partial_frame_parses() {
        let events = frame_events(
            r#"{"channel":{"alternatives":[{"transcript":"hello","confidence":0.8}]},"is_final":false}"#,
        );
        assert!(
            events
                == vec![SttEvent::Partial {
                    text: "hello".to_owned(),
                    confidence: 0.8
                }]
        );
    }

    #[test]
    fn final_frame_parses() {
        let events = frame_events(
            r#"{"channel":{"alternatives":[{"transcript":"hello there","confidence":0.95}]},"is_final":true}"#,
        );
        assert!(
            events
                == vec![SttEvent::Final {
                    text: "hello there".to_owned(),
                    confidence: 0.95
                }]
        );
    }

    #[test]
    fn speech_final_counts_as_final() {
        let events = frame_events(
            r#"{"channel":{"alternatives":[{"transcript":"done","confidence":0.9}]},"speech_final":true}"#,
        );
        assert!(matches!(events[0], SttEvent::Final { .. }));
    }

    #[test]
    fn empty_transcript_is_dropped() {
        let events = frame_events(
            r#"{"channel":{"alternatives":[{"transcript":"  ","confidence":0.1}]},"is_final":false}"#,
        );
        assert!(events.is_empty());
    }

    #[test]
    fn error_frame_maps_to_error_event() {
        let events = frame_events(r#"{"error":"bad stream"}"#);
        assert!(
            events
                == vec![SttEvent::Error {
                    message: "bad stream".to_owned(),
                    recoverable: true
                }]
        );
    }

    #[test]
    fn malformed_json_is_ignored() {
        assert!(frame_events("not json").is_empty());
    }
}
