//! Turn-structured conversation history feeding LLM prompts.

use crate::llm::{ChatMessage, Role};
use chrono::{DateTime, Utc};
use std::collections::VecDeque;

/// One completed user/agent exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationTurn {
    /// What the user said (may be empty for agent-only fallback turns).
    pub user_text: String,
    /// What the agent replied (may be empty for interrupted turns).
    pub agent_text: String,
    /// When the turn was recorded.
    pub recorded_at: DateTime<Utc>,
}

/// Ordered conversation history with an optional recent-turn window.
#[derive(Debug, Clone)]
pub struct ConversationHistory {
    turns: VecDeque<ConversationTurn>,
    /// Maximum retained turns; 0 keeps the full session.
    max_turns: usize,
}

impl ConversationHistory {
    /// Create a history bounded to `max_turns` recent turns (0 = unbounded).
    #[must_use]
    pub fn new(max_turns: usize) -> Self {
        Self {
            turns: VecDeque::new(),
            max_turns,
        }
    }

    /// Append a completed turn iff at least one side is non-empty.
    pub fn add_turn(&mut self, user_text: &str, agent_text: &str) {
        if user_text.trim().is_empty() && agent_text.trim().is_empty() {
            return;
        }
        if self.max_turns > 0 && self.turns.len() >= self.max_turns {
            self.turns.pop_front();
        }
        self.turns.push_back(ConversationTurn {
            user_text: user_text.to_owned(),
            agent_text: agent_text.to_owned(),
            recorded_at: Utc::now(),
        });
    }

    /// Materialize the history as role-tagged messages for LLM input.
    #[must_use]
    pub fn messages(&self) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(self.turns.len() * 2);
        for turn in &self.turns {
            if !turn.user_text.trim().is_empty() {
                messages.push(ChatMessage {
                    role: Role::User,
                    content: turn.user_text.clone(),
                });
            }
            if !turn.agent_text.trim().is_empty() {
                messages.push(ChatMessage {
                    role: Role::Assistant,
                    content: turn.agent_text.clone(),
                });
            }
        }
        messages
    }

    /// Number of retained turns.
    #[must_use]
    pub fn len(&self) -> usize {
        self.turns.len()
    }

    /// Whether any turn has been recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }
}

impl Default for ConversationHistory {
    fn default() -> Self {
        Self::new(0)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    #[test]
    fn empty_turn_is_skipped() {
        let mut history = ConversationHistory::default();
        history.add_turn("", "   ");
        assert!(history.is_empty());
    }

    #[test]
    fn one_sided_turn_is_kept() {
        let mut history = ConversationHistory::default();
        history.add_turn("wait", "");
        assert!(history.len() == 1);
        let messages = history.messages();
        assert!(messages.len() == 1);
        assert!(messages[0].role == Role::User);
    }

    #[test]
    fn messages_alternate_in_order() {
        let mut history = ConversationHistory::default();
        history.add_turn("hello there", "Hi there. How can I help?");
        history.add_turn("what time is it", "It is noon.");
        let messages = history.messages();
        assert!(messages.len() == 4);
        assert!(messages[0].role == Role::User);
        assert!(messages[0].content == "hello there");
        assert!(messages[1].role == Role::Assistant);
        assert!(messages[3].content == "It is noon.");
    }

    #[test]
    fn window_evicts_oldest() {
        let mut history = ConversationHistory::new(2);
        history.add_turn("one", "1");
        history.add_turn("two", "2");
        history.add_turn("three", "3");
        assert!(history.len() == 2);
        assert!(history.messages()[0].content == "two");
    }

    #[test]
    fn zero_window_is_unbounded() {
        let mut history = ConversationHistory::new(0);
        for i in 0..100 {
            history.add_turn(&format!("u{i}"), &format!("a{i}"));
        }
        assert!(history.len() == 100);
    }
}
