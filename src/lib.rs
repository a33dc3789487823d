//! voxloop: real-time voice-agent orchestrator.
//!
//! Coordinates three independently streaming providers under one turn-taking
//! contract: client audio → STT → transcript debouncing → speculative LLM →
//! sentence-streamed TTS → client audio, with cancellation, barge-in, and
//! adaptive end-of-utterance detection.
//!
//! # Architecture
//!
//! Each session runs one [`turn::TurnController`] actor that owns all
//! session-local state and `select!`s over its inputs:
//! - **STT adapter**: persistent WebSocket with a bounded send queue and
//!   reconnect supervisor
//! - **LLM adapter**: SSE chat-completions stream sliced into sentences
//! - **TTS adapter**: ordered, cancellable audio chunk stream
//! - **Transport**: axum WebSocket endpoint bridging typed client frames

pub mod audio;
pub mod config;
pub mod error;
pub mod history;
pub mod llm;
pub mod protocol;
pub mod server;
pub mod silence;
pub mod state;
pub mod stt;
pub mod transcript;
pub mod tts;
pub mod turn;

pub use config::OrchestratorConfig;
pub use error::{AgentError, Result};
pub use state::TurnState;
pub use turn::{TurnController, TurnEvent, TurnHandle};
