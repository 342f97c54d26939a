//! # Rolling Audio Buffer
//!
//! Holds the most recent audio of one session as a queue of timestamped
//! chunks. The buffer is capped by duration: every `add` evicts the oldest
//! chunks until the total fits under `max_duration_seconds` again.
//!
//! ## Key Features:
//! - **O(1) bookkeeping**: the sample count is cached, duration is derived from it
//! - **Exact-size reads**: `get_audio` allocates its output once
//! - **Single owner**: a buffer belongs to exactly one `RealtimeSession`, so no
//!   interior locking is needed

use crate::error::AudioFormatError;
use std::collections::VecDeque;
use tracing::debug;

/// One immutable block of mono audio.
///
/// Samples are normalized `f32` in `[-1.0, 1.0]`; PCM16 input is converted on
/// decode (see `processor::decode_pcm16`).
#[derive(Debug, Clone, PartialEq)]
pub struct AudioChunk {
    timestamp: f64,
    samples: Vec<f32>,
    sample_rate: u32,
}

impl AudioChunk {
    /// `timestamp` is the stream time, in seconds, of the first sample.
    pub fn new(timestamp: f64, samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            timestamp,
            samples,
            sample_rate,
        }
    }

    pub fn timestamp(&self) -> f64 {
        self.timestamp
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Duration in seconds.
    pub fn duration(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.sample_rate as f64
    }

    /// Stream time just after the last sample.
    pub fn end_time(&self) -> f64 {
        self.timestamp + self.duration()
    }
}

/// Bounded, duration-capped chunk queue.
#[derive(Debug)]
pub struct AudioBuffer {
    chunks: VecDeque<AudioChunk>,
    total_samples: usize,
    sample_rate: u32,
    max_duration_seconds: f64,
}

impl AudioBuffer {
    pub fn new(sample_rate: u32, max_duration_seconds: f64) -> Self {
        Self {
            chunks: VecDeque::new(),
            total_samples: 0,
            sample_rate,
            max_duration_seconds,
        }
    }

    /// Check a chunk's format without storing it.
    pub fn accepts(&self, chunk: &AudioChunk) -> Result<(), AudioFormatError> {
        if chunk.sample_rate != self.sample_rate {
            return Err(AudioFormatError::SampleRateMismatch {
                expected: self.sample_rate,
                actual: chunk.sample_rate,
            });
        }
        Ok(())
    }

    /// Append a chunk, then evict from the front while over capacity.
    ///
    /// ## Errors:
    /// A chunk whose sample rate differs from the buffer's is rejected.
    /// Nothing is resampled.
    pub fn add(&mut self, chunk: AudioChunk) -> Result<(), AudioFormatError> {
        self.accepts(&chunk)?;

        self.total_samples += chunk.len();
        self.chunks.push_back(chunk);

        let mut evicted = 0usize;
        while self.duration() > self.max_duration_seconds {
            match self.chunks.pop_front() {
                Some(old) => {
                    self.total_samples -= old.len();
                    evicted += 1;
                }
                None => break,
            }
        }
        if evicted > 0 {
            debug!(
                evicted_chunks = evicted,
                buffered_seconds = self.duration(),
                "Audio buffer at capacity, evicted oldest chunks"
            );
        }

        Ok(())
    }

    /// The most recent `duration` seconds of audio, or the whole buffer if it
    /// holds less.
    pub fn get_audio(&self, duration: f64) -> Vec<f32> {
        if duration <= 0.0 {
            return Vec::new();
        }
        let wanted = (duration * self.sample_rate as f64).round() as usize;
        self.tail_samples(wanted.min(self.total_samples))
    }

    /// Audio from `start_time` up to the end of the buffer.
    pub fn get_audio_since(&self, start_time: f64) -> Vec<f32> {
        match self.end_time() {
            Some(end) if end > start_time => self.get_audio(end - start_time),
            _ => Vec::new(),
        }
    }

    fn tail_samples(&self, count: usize) -> Vec<f32> {
        let mut out = Vec::with_capacity(count);
        if count == 0 {
            return out;
        }

        // Walk back to the chunk holding the first wanted sample.
        let mut remaining = count;
        let mut first = self.chunks.len();
        let mut skip = 0;
        for (index, chunk) in self.chunks.iter().enumerate().rev() {
            first = index;
            if chunk.len() >= remaining {
                skip = chunk.len() - remaining;
                break;
            }
            remaining -= chunk.len();
        }

        for (offset, chunk) in self.chunks.range(first..).enumerate() {
            let samples = if offset == 0 { &chunk.samples[skip..] } else { &chunk.samples[..] };
            out.extend_from_slice(samples);
        }
        out
    }

    /// Drop all audio. Called once an utterance has been handed off.
    pub fn clear(&mut self) {
        self.chunks.clear();
        self.total_samples = 0;
    }

    /// Buffered duration in seconds.
    pub fn duration(&self) -> f64 {
        self.total_samples as f64 / self.sample_rate as f64
    }

    /// Stream time just after the newest sample, if any audio is buffered.
    pub fn end_time(&self) -> Option<f64> {
        self.chunks.back().map(AudioChunk::end_time)
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn max_duration_seconds(&self) -> f64 {
        self.max_duration_seconds
    }

    /// Number of buffered samples.
    pub fn len(&self) -> usize {
        self.total_samples
    }

    pub fn is_empty(&self) -> bool {
        self.total_samples == 0
    }
}
