//! Audio payload helpers and the bounded input buffer.

use base64::Engine;
use tracing::{debug, warn};

/// Decode a base64-encoded audio payload to raw bytes.
///
/// Returns `None` on malformed input (logged as a warning by callers that
/// care which stream the payload came from).
pub fn decode_audio_base64(audio_b64: &str) -> Option<Vec<u8>> {
    base64::engine::general_purpose::STANDARD
        .decode(audio_b64)
        .ok()
}

/// Encode raw audio bytes to base64 for client framing.
pub fn encode_audio_base64(audio: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(audio)
}

/// Bounded byte ring holding recent user audio.
///
/// Capacity is derived from the configured maximum duration at 16-bit mono;
/// overflow drops the oldest bytes so the buffer never exceeds its cap.
#[derive(Debug)]
pub struct AudioInputBuffer {
    buffer: Vec<u8>,
    max_size: usize,
    total_bytes_received: u64,
}

impl AudioInputBuffer {
    /// Create a buffer capped at `max_seconds` of 16-bit mono audio.
    #[must_use]
    pub fn new(max_seconds: u32, sample_rate: u32) -> Self {
        Self {
            buffer: Vec::new(),
            max_size: max_seconds as usize * sample_rate as usize * 2,
            total_bytes_received: 0,
        }
    }

    /// Append an audio chunk, evicting the oldest bytes on overflow.
    pub fn add(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
        self.total_bytes_received += chunk.len() as u64;

        if self.buffer.len() > self.max_size {
            let overflow = self.buffer.len() - self.max_size;
            self.buffer.drain(..overflow);
            warn!("audio buffer overflow: dropped {overflow} oldest bytes");
        }
    }

    /// Discard all buffered audio.
    pub fn clear(&mut self) {
        self.buffer.clear();
        debug!("audio buffer cleared");
    }

    /// Current buffer size in bytes.
    #[must_use]
    pub fn size_bytes(&self) -> usize {
        self.buffer.len()
    }

    /// Total bytes ever received, including evicted ones.
    #[must_use]
    pub fn total_bytes_received(&self) -> u64 {
        self.total_bytes_received
    }

    /// Duration of the buffered audio at the given sample rate (16-bit mono).
    #[must_use]
    pub fn duration_seconds(&self, sample_rate: u32) -> f64 {
        let num_samples = self.buffer.len() / 2;
        num_samples as f64 / f64::from(sample_rate)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    #[test]
    fn base64_round_trip() {
        let raw = vec![0u8, 1, 2, 255, 128];
        let encoded = encode_audio_base64(&raw);
        assert!(decode_audio_base64(&encoded).unwrap() == raw);
    }

    #[test]
    fn malformed_base64_is_none() {
        assert!(decode_audio_base64("not base64!!").is_none());
    }

    #[test]
    fn add_and_measure() {
        let mut buffer = AudioInputBuffer::new(30, 16_000);
        buffer.add(&[0u8; 32_000]);
        assert!(buffer.size_bytes() == 32_000);
        // 32000 bytes = 16000 samples = 1 second at 16kHz.
        assert!((buffer.duration_seconds(16_000) - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn overflow_drops_oldest() {
        // Cap: 1 second at 16kHz 16-bit = 32000 bytes.
        let mut buffer = AudioInputBuffer::new(1, 16_000);
        buffer.add(&vec![1u8; 32_000]);
        buffer.add(&vec![2u8; 100]);
        assert!(buffer.size_bytes() == 32_000);
        assert!(buffer.total_bytes_received() == 32_100);
    }

    #[test]
    fn never_exceeds_cap_on_oversized_chunk() {
        let mut buffer = AudioInputBuffer::new(1, 16_000);
        buffer.add(&vec![0u8; 100_000]);
        assert!(buffer.size_bytes() == 32_000);
    }

    #[test]
    fn clear_resets_size_but_not_total() {
        let mut buffer = AudioInputBuffer::new(30, 16_000);
        buffer.add(&[0u8; 1_000]);
        buffer.clear();
        assert!(buffer.size_bytes() == 0);
        assert!(buffer.total_bytes_received() == 1_000);
    }
}
