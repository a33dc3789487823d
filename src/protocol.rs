//! Typed client message frames.
//!
//! Both directions use `{"type": ..., "data": {...}}` envelopes. Incoming
//! frames are parsed leniently (missing payload fields fall back to
//! defaults); outgoing frames are serialized from typed variants.

use crate::error::{AgentError, Result};
use crate::state::TurnState;
use crate::turn::{TurnEvent, TurnRecord};
use serde::Serialize;
use std::time::{SystemTime, UNIX_EPOCH};

/// Frames received from the client.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientFrame {
    Connect,
    Ping,
    Pong,
    AudioChunk {
        audio: String,
        format: String,
        sample_rate: u32,
    },
    TextInput {
        text: String,
    },
    Interrupt,
    PlaybackComplete,
    UpdateSettings {
        silence_debounce_ms: Option<u64>,
        cancellation_threshold: Option<f32>,
        adaptive_debounce_enabled: Option<bool>,
    },
    Disconnect,
}

impl ClientFrame {
    /// Parse a raw client message.
    ///
    /// # Errors
    ///
    /// Returns a transport error for malformed JSON or unknown frame types.
    pub fn parse(raw: &str) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_str(raw)
            .map_err(|e| AgentError::Transport(format!("malformed frame: {e}")))?;
        let frame_type = value
            .get("type")
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| AgentError::Transport("frame missing type".to_owned()))?;
        let data = value.get("data").cloned().unwrap_or_default();

        match frame_type {
            "connect" => Ok(Self::Connect),
            "ping" => Ok(Self::Ping),
            "pong" => Ok(Self::Pong),
            "audio_chunk" => Ok(Self::AudioChunk {
                audio: data
                    .get("audio")
                    .and_then(serde_json::Value::as_str)
                    .unwrap_or("")
                    .to_owned(),
                format: data
                    .get("format")
                    .and_then(serde_json::Value::as_str)
                    .unwrap_or("pcm")
                    .to_owned(),
                sample_rate: data
                    .get("sample_rate")
                    .and_then(serde_json::Value::as_u64)
                    .unwrap_or(16_000) as u32,
            }),
            "text_input" => Ok(Self::TextInput {
                text: data
                    .get("text")
                    .and_then(serde_json::Value::as_str)
                    .unwrap_or("")
                    .to_owned(),
            }),
            "interrupt" => Ok(Self::Interrupt),
            "playback_complete" => Ok(Self::PlaybackComplete),
            "update_settings" => Ok(Self::UpdateSettings {
                silence_debounce_ms: data
                    .get("silence_debounce_ms")
                    .and_then(serde_json::Value::as_u64),
                cancellation_threshold: data
                    .get("cancellation_threshold")
                    .and_then(serde_json::Value::as_f64)
                    .map(|threshold| threshold as f32),
                adaptive_debounce_enabled: data
                    .get("adaptive_debounce_enabled")
                    .and_then(serde_json::Value::as_bool),
            }),
            "disconnect" => Ok(Self::Disconnect),
            other => Err(AgentError::Transport(format!(
                "unknown message type: {other}"
            ))),
        }
    }
}

/// Frames sent to the client.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ServerFrame {
    SessionReady {
        session_id: String,
    },
    Pong {},
    StateChange {
        from: TurnState,
        to: TurnState,
    },
    TranscriptPartial {
        text: String,
        confidence: f32,
        timestamp_ms: u64,
    },
    TranscriptFinal {
        text: String,
        confidence: f32,
        timestamp_ms: u64,
    },
    AgentAudioChunk {
        audio: String,
        chunk_index: u64,
        is_final: bool,
    },
    AgentTextFallback {
        text: String,
        reason: String,
    },
    TurnComplete {
        turn_id: String,
        user_text: String,
        agent_text: String,
        duration_ms: u64,
        was_interrupted: bool,
        timestamp_ms: u64,
    },
    Error {
        code: String,
        message: String,
        recoverable: bool,
    },
}

impl ServerFrame {
    /// Map a controller event to its wire frame, stamping the current time.
    #[must_use]
    pub fn from_event(event: TurnEvent) -> Self {
        match event {
            TurnEvent::StateChange { from, to } => Self::StateChange { from, to },
            TurnEvent::TranscriptPartial { text, confidence } => Self::TranscriptPartial {
                text,
                confidence,
                timestamp_ms: now_timestamp_ms(),
            },
            TurnEvent::TranscriptFinal { text, confidence } => Self::TranscriptFinal {
                text,
                confidence,
                timestamp_ms: now_timestamp_ms(),
            },
            TurnEvent::AgentAudio {
                audio_b64,
                chunk_index,
                is_final,
            } => Self::AgentAudioChunk {
                audio: audio_b64,
                chunk_index,
                is_final,
            },
            TurnEvent::AgentTextFallback { text, reason } => {
                Self::AgentTextFallback { text, reason }
            }
            TurnEvent::TurnComplete(TurnRecord {
                turn_id,
                user_text,
                agent_text,
                duration_ms,
                was_interrupted,
            }) => Self::TurnComplete {
                turn_id,
                user_text,
                agent_text,
                duration_ms,
                was_interrupted,
                timestamp_ms: now_timestamp_ms(),
            },
            TurnEvent::Error {
                code,
                message,
                recoverable,
            } => Self::Error {
                code: code.as_str().to_owned(),
                message,
                recoverable,
            },
        }
    }

    /// Serialize for the wire.
    #[must_use]
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Milliseconds since the Unix epoch.
#[must_use]
pub fn now_timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    #[test]
    fn audio_chunk_parses_with_defaults() {
        let frame = ClientFrame::parse(r#"{"type":"audio_chunk","data":{"audio":"AAAA"}}"#).unwrap();
        assert!(
            frame
                == ClientFrame::AudioChunk {
                    audio: "AAAA".to_owned(),
                    format: "pcm".to_owned(),
                    sample_rate: 16_000,
                }
        );
    }

    #[test]
    fn payload_less_frames_parse_without_data() {
        assert!(ClientFrame::parse(r#"{"type":"ping"}"#).unwrap() == ClientFrame::Ping);
        assert!(
            ClientFrame::parse(r#"{"type":"interrupt","data":{}}"#).unwrap()
                == ClientFrame::Interrupt
        );
    }

    #[test]
    fn update_settings_parses_partial_payload() {
        let frame = ClientFrame::parse(
            r#"{"type":"update_settings","data":{"silence_debounce_ms":600}}"#,
        )
        .unwrap();
        assert!(
            frame
                == ClientFrame::UpdateSettings {
                    silence_debounce_ms: Some(600),
                    cancellation_threshold: None,
                    adaptive_debounce_enabled: None,
                }
        );
    }

    #[test]
    fn unknown_type_is_rejected() {
        assert!(ClientFrame::parse(r#"{"type":"bogus"}"#).is_err());
        assert!(ClientFrame::parse("not json").is_err());
    }

    #[test]
    fn state_change_frame_shape() {
        let frame = ServerFrame::StateChange {
            from: TurnState::Idle,
            to: TurnState::Listening,
        };
        let value: serde_json::Value = serde_json::from_str(&frame.to_json()).unwrap();
        assert!(value["type"] == "state_change");
        assert!(value["data"]["from"] == "idle");
        assert!(value["data"]["to"] == "listening");
    }

    #[test]
    fn turn_complete_frame_carries_timestamp() {
        let frame = ServerFrame::from_event(TurnEvent::TurnComplete(TurnRecord {
            turn_id: "s_0".to_owned(),
            user_text: "hello there".to_owned(),
            agent_text: "Hi there.".to_owned(),
            duration_ms: 1200,
            was_interrupted: false,
        }));
        let value: serde_json::Value = serde_json::from_str(&frame.to_json()).unwrap();
        assert!(value["type"] == "turn_complete");
        assert!(value["data"]["was_interrupted"] == false);
        assert!(value["data"]["timestamp_ms"].as_u64().unwrap() > 0);
    }

    #[test]
    fn error_frame_uses_wire_code() {
        let frame = ServerFrame::from_event(TurnEvent::Error {
            code: crate::turn::ErrorCode::LlmTimeout,
            message: "too slow".to_owned(),
            recoverable: true,
        });
        let value: serde_json::Value = serde_json::from_str(&frame.to_json()).unwrap();
        assert!(value["data"]["code"] == "llm_timeout");
    }
}
