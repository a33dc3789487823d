//! Turn state machine.

use crate::error::{AgentError, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// The five turn states.
///
/// - `Listening`: actively receiving and transcribing user audio.
/// - `Speculative`: LLM is streaming on the assumption the user is done.
/// - `Committed`: first sentence is usable, TTS may begin.
/// - `Speaking`: agent audio is streaming to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnState {
    Idle,
    Listening,
    Speculative,
    Committed,
    Speaking,
}

impl std::fmt::Display for TurnState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Listening => "listening",
            Self::Speculative => "speculative",
            Self::Committed => "committed",
            Self::Speaking => "speaking",
        };
        f.write_str(name)
    }
}

/// Returns `true` if `from -> to` is a legal turn transition.
#[must_use]
pub fn is_legal(from: TurnState, to: TurnState) -> bool {
    use TurnState::{Committed, Idle, Listening, Speaking, Speculative};
    matches!(
        (from, to),
        (Idle, Listening)
            | (Listening, Speculative)
            | (Listening, Idle)
            | (Speculative, Listening)
            | (Speculative, Committed)
            | (Speculative, Idle)
            | (Committed, Speaking)
            | (Committed, Idle)
            | (Speaking, Listening)
            | (Speaking, Idle)
    )
}

/// Enforces legal transitions across the five turn states.
///
/// An illegal transition indicates a scheduler bug and fails loudly with an
/// [`AgentError::State`]; the caller decides whether that is fatal.
#[derive(Debug)]
pub struct StateMachine {
    current: TurnState,
}

impl StateMachine {
    /// Create a state machine in the initial `Idle` state.
    #[must_use]
    pub fn new() -> Self {
        Self {
            current: TurnState::Idle,
        }
    }

    /// Current state.
    #[must_use]
    pub fn current(&self) -> TurnState {
        self.current
    }

    /// Transition to `to`, returning the previous state.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::State`] if the transition is not in the legal
    /// table.
    pub fn transition(&mut self, to: TurnState, reason: &str) -> Result<TurnState> {
        let from = self.current;
        if !is_legal(from, to) {
            return Err(AgentError::State(format!("{from} -> {to} ({reason})")));
        }
        self.current = to;
        debug!("state {from} -> {to}: {reason}");
        Ok(from)
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use TurnState::{Committed, Idle, Listening, Speaking, Speculative};

    const ALL: [TurnState; 5] = [Idle, Listening, Speculative, Committed, Speaking];

    #[test]
    fn legal_table_is_exact() {
        let legal = [
            (Idle, Listening),
            (Listening, Speculative),
            (Listening, Idle),
            (Speculative, Listening),
            (Speculative, Committed),
            (Speculative, Idle),
            (Committed, Speaking),
            (Committed, Idle),
            (Speaking, Listening),
            (Speaking, Idle),
        ];
        for from in ALL {
            for to in ALL {
                let expected = legal.contains(&(from, to));
                assert!(
                    is_legal(from, to) == expected,
                    "{from} -> {to} legality mismatch"
                );
            }
        }
    }

    #[test]
    fn happy_path_walk() {
        let mut sm = StateMachine::new();
        assert!(sm.transition(Listening, "first audio").unwrap() == Idle);
        assert!(sm.transition(Speculative, "silence").unwrap() == Listening);
        assert!(sm.transition(Committed, "first sentence").unwrap() == Speculative);
        assert!(sm.transition(Speaking, "first chunk").unwrap() == Committed);
        assert!(sm.transition(Idle, "playback complete").unwrap() == Speaking);
    }

    #[test]
    fn illegal_transition_fails_and_preserves_state() {
        let mut sm = StateMachine::new();
        assert!(sm.transition(Speaking, "nope").is_err());
        assert!(sm.current() == Idle);
    }

    #[test]
    fn barge_in_returns_to_listening() {
        let mut sm = StateMachine::new();
        sm.transition(Listening, "audio").unwrap();
        sm.transition(Speculative, "silence").unwrap();
        sm.transition(Committed, "sentence").unwrap();
        sm.transition(Speaking, "chunk").unwrap();
        assert!(sm.transition(Listening, "barge-in").is_ok());
    }
}
