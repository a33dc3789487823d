//! Host-facing events emitted by the turn controller.

use crate::state::TurnState;
use serde::Serialize;

/// Error codes surfaced to the client alongside `Error` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    SttConnectionFailed,
    SttTransportLost,
    LlmTimeout,
    LlmNoResponse,
    LlmError,
    TtsQueueTimeout,
    TtsError,
    InternalError,
}

impl ErrorCode {
    /// Wire representation of the code.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SttConnectionFailed => "stt_connection_failed",
            Self::SttTransportLost => "stt_transport_lost",
            Self::LlmTimeout => "llm_timeout",
            Self::LlmNoResponse => "llm_no_response",
            Self::LlmError => "llm_error",
            Self::TtsQueueTimeout => "tts_queue_timeout",
            Self::TtsError => "tts_error",
            Self::InternalError => "internal_error",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Summary of one completed turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnRecord {
    pub turn_id: String,
    pub user_text: String,
    pub agent_text: String,
    pub duration_ms: u64,
    pub was_interrupted: bool,
}

/// Events the turn controller emits to its host.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnEvent {
    /// A state transition happened; emitted exactly once per transition,
    /// before any other event that follows from the new state.
    StateChange { from: TurnState, to: TurnState },
    /// Interim transcript for UI display.
    TranscriptPartial { text: String, confidence: f32 },
    /// Finalized transcript fragment.
    TranscriptFinal { text: String, confidence: f32 },
    /// One agent audio chunk; the terminator frame carries an empty payload
    /// and `is_final = true`.
    AgentAudio {
        audio_b64: String,
        chunk_index: u64,
        is_final: bool,
    },
    /// Synthesis failed mid-turn; the agent's text is delivered instead.
    AgentTextFallback { text: String, reason: String },
    /// A turn closed (completed or interrupted). At most one per turn.
    TurnComplete(TurnRecord),
    /// A recoverable or fatal error.
    Error {
        code: ErrorCode,
        message: String,
        recoverable: bool,
    },
}

/// Live tuning metrics for monitoring.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Telemetry {
    /// Cancelled turns over total turns for the session.
    pub cancellation_rate: f32,
    /// Current adaptive silence dwell.
    pub current_debounce_ms: u64,
    /// Completed turns this session.
    pub total_turns: u64,
    /// Barge-ins and explicit interrupts.
    pub interruption_count: u64,
    /// Estimated tokens discarded by cancelled generations.
    pub tokens_wasted: u64,
}
