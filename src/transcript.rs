//! Per-utterance transcript accumulation with lock/snapshot semantics.

use tracing::debug;

/// Accumulates partial and final transcript fragments for one user utterance.
///
/// `lock()` freezes the finalized text as a snapshot so speculative LLM work
/// reads a stable prompt; fragments that arrive while locked still update the
/// internal state, but `get_final_text()` keeps returning the snapshot until
/// `unlock()`.
#[derive(Debug, Default)]
pub struct TranscriptBuffer {
    finals: Vec<String>,
    partial: Option<String>,
    snapshot: Option<String>,
}

impl TranscriptBuffer {
    /// Create an empty buffer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the latest interim hypothesis.
    pub fn add_partial(&mut self, text: &str) {
        self.partial = Some(text.to_owned());
    }

    /// Append a finalized fragment and clear the pending partial.
    pub fn add_final(&mut self, text: &str) {
        self.finals.push(text.to_owned());
        self.partial = None;
    }

    /// The joined finalized text, or the locked snapshot if one is active.
    #[must_use]
    pub fn get_final_text(&self) -> String {
        match &self.snapshot {
            Some(snapshot) => snapshot.clone(),
            None => self.joined_finals(),
        }
    }

    /// The latest interim hypothesis, if any.
    #[must_use]
    pub fn current_partial(&self) -> Option<&str> {
        self.partial.as_deref()
    }

    /// Freeze the finalized text; later fragments do not affect the snapshot.
    pub fn lock(&mut self) {
        self.snapshot = Some(self.joined_finals());
        debug!("transcript buffer locked");
    }

    /// Drop the snapshot so `get_final_text()` reflects live state again.
    pub fn unlock(&mut self) {
        self.snapshot = None;
        debug!("transcript buffer unlocked");
    }

    /// Whether a snapshot is active.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.snapshot.is_some()
    }

    /// Reset all state for the next turn.
    pub fn clear(&mut self) {
        self.finals.clear();
        self.partial = None;
        self.snapshot = None;
    }

    fn joined_finals(&self) -> String {
        self.finals.join(" ")
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    #[test]
    fn finals_join_with_spaces() {
        let mut buffer = TranscriptBuffer::new();
        buffer.add_final("hello there");
        buffer.add_final("how are you");
        assert!(buffer.get_final_text() == "hello there how are you");
    }

    #[test]
    fn final_clears_partial() {
        let mut buffer = TranscriptBuffer::new();
        buffer.add_partial("hel");
        buffer.add_final("hello");
        assert!(buffer.current_partial().is_none());
    }

    #[test]
    fn locked_snapshot_is_stable() {
        let mut buffer = TranscriptBuffer::new();
        buffer.add_final("what time is it");
        buffer.lock();
        buffer.add_partial("actually");
        buffer.add_final("actually never mind");
        assert!(buffer.get_final_text() == "what time is it");
        buffer.unlock();
        assert!(buffer.get_final_text() == "what time is it actually never mind");
    }

    #[test]
    fn mutations_while_locked_are_retained() {
        let mut buffer = TranscriptBuffer::new();
        buffer.lock();
        buffer.add_partial("wait");
        assert!(buffer.current_partial() == Some("wait"));
    }

    #[test]
    fn clear_resets_everything() {
        let mut buffer = TranscriptBuffer::new();
        buffer.add_final("one");
        buffer.lock();
        buffer.clear();
        assert!(!buffer.is_locked());
        assert!(buffer.get_final_text().is_empty());
    }
}
