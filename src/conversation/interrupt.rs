//! Barge-in detection.
//!
//! Armed only while the agent is speaking. Watches chunk energy against its
//! own threshold and debounce (stricter and shorter than the speech tracker's)
//! and reports a barge-in at most once per arming. Detection is a pure
//! decision: stopping playback and discarding in-flight work is the session's
//! job.

use crate::audio::processor::VadSample;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct InterruptConfig {
    pub enabled: bool,
    pub energy_threshold: f32,
    pub debounce_ms: u64,
}

impl Default for InterruptConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            energy_threshold: 0.05,
            debounce_ms: 100,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BargeIn {
    /// First sample of the loud run.
    pub start_time: f64,
    pub detected_at: f64,
}

#[derive(Debug, Clone)]
pub struct InterruptDetector {
    config: InterruptConfig,
    armed: bool,
    fired: bool,
    run_start: Option<f64>,
}

impl InterruptDetector {
    pub fn new(config: InterruptConfig) -> Self {
        Self {
            config,
            armed: false,
            fired: false,
            run_start: None,
        }
    }

    /// Called when the agent starts speaking.
    pub fn arm(&mut self) {
        self.armed = self.config.enabled;
        self.fired = false;
        self.run_start = None;
    }

    /// Called whenever the session leaves `AgentSpeaking`.
    pub fn disarm(&mut self) {
        self.armed = false;
        self.run_start = None;
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }

    pub fn has_fired(&self) -> bool {
        self.fired
    }

    pub fn observe(&mut self, sample: &VadSample, current_time: f64) -> Option<BargeIn> {
        if !self.armed || self.fired {
            return None;
        }

        if sample.energy < self.config.energy_threshold {
            self.run_start = None;
            return None;
        }

        let start_time = *self.run_start.get_or_insert(sample.timestamp);
        if (current_time - start_time) * 1000.0 < self.config.debounce_ms as f64 {
            return None;
        }

        self.fired = true;
        self.run_start = None;
        Some(BargeIn {
            start_time,
            detected_at: current_time,
        })
    }
}
