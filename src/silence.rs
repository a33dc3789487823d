//! Adaptive end-of-utterance silence timer.

use crate::config::TurnConfig;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Step added to the dwell when the cancellation rate is above threshold.
const DEBOUNCE_STEP_UP_MS: u64 = 100;

/// Step removed from the dwell when the cancellation rate is acceptable.
const DEBOUNCE_STEP_DOWN_MS: u64 = 50;

/// Single-shot re-armable silence timer.
///
/// `start()` (re)arms the countdown at the current debounce; a fire is
/// delivered as the arm generation on the channel given at construction.
/// Stale fires (from an arm that was since cancelled or re-armed) are
/// filtered by [`SilenceTimer::accept_fire`].
#[derive(Debug)]
pub struct SilenceTimer {
    fire_tx: mpsc::UnboundedSender<u64>,
    current_debounce_ms: u64,
    min_debounce_ms: u64,
    max_debounce_ms: u64,
    threshold: f32,
    adaptive_enabled: bool,
    generation: u64,
    armed: bool,
    task: Option<JoinHandle<()>>,
}

impl SilenceTimer {
    /// Create a disarmed timer; fires are sent on `fire_tx`.
    #[must_use]
    pub fn new(config: &TurnConfig, fire_tx: mpsc::UnboundedSender<u64>) -> Self {
        Self {
            fire_tx,
            current_debounce_ms: config.initial_silence_debounce_ms,
            min_debounce_ms: config.min_silence_debounce_ms,
            max_debounce_ms: config.max_silence_debounce_ms,
            threshold: config.cancellation_rate_threshold,
            adaptive_enabled: config.adaptive_debounce_enabled,
            generation: 0,
            armed: false,
            task: None,
        }
    }

    /// (Re)arm the countdown; an already-armed timer restarts from zero.
    pub fn start(&mut self) {
        self.disarm_task();
        self.generation += 1;
        self.armed = true;

        let generation = self.generation;
        let dwell = Duration::from_millis(self.current_debounce_ms);
        let fire_tx = self.fire_tx.clone();
        self.task = Some(tokio::spawn(async move {
            tokio::time::sleep(dwell).await;
            let _ = fire_tx.send(generation);
        }));
    }

    /// Disarm without firing.
    pub fn cancel(&mut self) {
        self.disarm_task();
        self.generation += 1;
        self.armed = false;
    }

    /// Validate a received fire; returns `true` exactly once per live arm.
    pub fn accept_fire(&mut self, generation: u64) -> bool {
        if self.armed && generation == self.generation {
            self.armed = false;
            self.task = None;
            true
        } else {
            debug!("ignoring stale silence fire (generation {generation})");
            false
        }
    }

    /// Whether a countdown is currently armed.
    #[must_use]
    pub fn is_armed(&self) -> bool {
        self.armed
    }

    /// Current dwell in milliseconds.
    #[must_use]
    pub fn current_debounce_ms(&self) -> u64 {
        self.current_debounce_ms
    }

    /// Adapt the dwell to the observed cancellation rate.
    ///
    /// A high rate means speculation keeps firing while the user is still
    /// speaking, so the dwell grows; a low rate lets it shrink back.
    pub fn adjust_debounce(&mut self, cancellation_rate: f32) {
        if !self.adaptive_enabled {
            return;
        }
        let previous = self.current_debounce_ms;
        if cancellation_rate > self.threshold {
            self.current_debounce_ms =
                (self.current_debounce_ms + DEBOUNCE_STEP_UP_MS).min(self.max_debounce_ms);
        } else {
            self.current_debounce_ms = self
                .current_debounce_ms
                .saturating_sub(DEBOUNCE_STEP_DOWN_MS)
                .max(self.min_debounce_ms);
        }
        if self.current_debounce_ms != previous {
            info!(
                "silence debounce {previous}ms -> {}ms (cancellation rate {cancellation_rate:.2})",
                self.current_debounce_ms
            );
        }
    }

    /// Set the dwell directly, clamped to the configured bounds.
    pub fn set_debounce_ms(&mut self, debounce_ms: u64) {
        self.current_debounce_ms = debounce_ms.clamp(self.min_debounce_ms, self.max_debounce_ms);
    }

    /// Set the cancellation-rate threshold, clamped to its allowed range.
    pub fn set_threshold(&mut self, threshold: f32) {
        self.threshold = threshold.clamp(0.1, 0.5);
    }

    /// Enable or disable adaptive tuning.
    pub fn set_adaptive_enabled(&mut self, enabled: bool) {
        self.adaptive_enabled = enabled;
    }

    fn disarm_task(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for SilenceTimer {
    fn drop(&mut self) {
        self.disarm_task();
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::config::TurnConfig;

    fn timer_with(
        config: &TurnConfig,
    ) -> (SilenceTimer, mpsc::UnboundedReceiver<u64>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (SilenceTimer::new(config, tx), rx)
    }

    #[tokio::test(start_paused = true)]
    async fn fires_after_dwell() {
        let (mut timer, mut rx) = timer_with(&TurnConfig::default());
        timer.start();
        let generation = rx.recv().await.unwrap();
        assert!(timer.accept_fire(generation));
        assert!(!timer.is_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn rearm_postpones_and_stales_old_fire() {
        let (mut timer, mut rx) = timer_with(&TurnConfig::default());
        timer.start();
        let first_generation = timer.generation;
        timer.start();
        let generation = rx.recv().await.unwrap();
        assert!(generation != first_generation);
        assert!(timer.accept_fire(generation));
        assert!(!timer.accept_fire(first_generation));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_invalidates_pending_fire() {
        let (mut timer, mut rx) = timer_with(&TurnConfig::default());
        timer.start();
        let generation = timer.generation;
        timer.cancel();
        assert!(!timer.is_armed());
        assert!(!timer.accept_fire(generation));
        // The aborted task never delivers.
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn adjust_raises_on_high_cancellation_rate() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut timer = SilenceTimer::new(&TurnConfig::default(), tx);
        timer.adjust_debounce(0.4);
        assert!(timer.current_debounce_ms() == 500);
    }

    #[test]
    fn adjust_caps_at_max() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut timer = SilenceTimer::new(&TurnConfig::default(), tx);
        // Ten turns at 40% cancellation: +100ms each, capped at 1200ms.
        for _ in 0..10 {
            timer.adjust_debounce(0.4);
        }
        assert!(timer.current_debounce_ms() == 1_200);
    }

    #[test]
    fn adjust_floors_at_min() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut timer = SilenceTimer::new(&TurnConfig::default(), tx);
        for _ in 0..5 {
            timer.adjust_debounce(0.0);
        }
        assert!(timer.current_debounce_ms() == 400);
    }

    #[test]
    fn adjust_is_noop_when_adaptive_disabled() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut timer = SilenceTimer::new(&TurnConfig::default(), tx);
        timer.set_adaptive_enabled(false);
        timer.adjust_debounce(0.5);
        assert!(timer.current_debounce_ms() == 400);
    }

    #[test]
    fn set_debounce_clamps_to_bounds() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut timer = SilenceTimer::new(&TurnConfig::default(), tx);
        timer.set_debounce_ms(50);
        assert!(timer.current_debounce_ms() == 400);
        timer.set_debounce_ms(10_000);
        assert!(timer.current_debounce_ms() == 1_200);
    }
}
