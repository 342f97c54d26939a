//! # Speech Activity Tracking
//!
//! Debounces the per-chunk speech probability stream into `Started` /
//! `Ended` events with hysteresis:
//!
//! - speech **starts** once probability stays `>= start_threshold` for
//!   `start_debounce_ms`; any sample below the threshold restarts the wait
//! - speech **ends** once probability stays `< end_threshold` for
//!   `end_debounce_ms`; samples between the two thresholds count as voiced
//!
//! The tracker never reads a clock. Every decision is a function of the
//! samples seen so far and the `current_time` passed in, so tests can drive
//! it with synthetic timelines.

use crate::audio::processor::VadSample;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SpeechTrackerConfig {
    pub start_threshold: f32,
    pub end_threshold: f32,
    pub start_debounce_ms: u64,
    pub end_debounce_ms: u64,
}

impl Default for SpeechTrackerConfig {
    fn default() -> Self {
        Self {
            start_threshold: 0.5,
            end_threshold: 0.35,
            start_debounce_ms: 150,
            end_debounce_ms: 300,
        }
    }
}

/// Snapshot of the tracker.
///
/// `speech_start_time` is `None` exactly when `is_speaking` is false. A start
/// time of `0.0` is a real value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SpeechState {
    pub is_speaking: bool,
    pub speech_start_time: Option<f64>,
    pub silence_duration: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SpeechEvent {
    Started {
        /// Timestamp of the first above-threshold sample of the run.
        start_time: f64,
    },
    Ended {
        start_time: f64,
        /// Timestamp of the last voiced sample.
        last_voiced_time: f64,
        silence_duration: f64,
    },
}

#[derive(Debug, Clone)]
pub struct SpeechActivityTracker {
    config: SpeechTrackerConfig,
    /// First sample of the current above-threshold run while not speaking.
    candidate_start: Option<f64>,
    /// Set while speaking.
    speech_start: Option<f64>,
    last_voiced: Option<f64>,
    silence_duration: f64,
}

impl SpeechActivityTracker {
    pub fn new(config: SpeechTrackerConfig) -> Self {
        Self {
            config,
            candidate_start: None,
            speech_start: None,
            last_voiced: None,
            silence_duration: 0.0,
        }
    }

    pub fn config(&self) -> &SpeechTrackerConfig {
        &self.config
    }

    pub fn is_speaking(&self) -> bool {
        self.speech_start.is_some()
    }

    pub fn state(&self) -> SpeechState {
        SpeechState {
            is_speaking: self.is_speaking(),
            speech_start_time: self.speech_start,
            silence_duration: self.silence_duration,
        }
    }

    /// Feed one sample. Returns an event when a debounce completes.
    pub fn observe(&mut self, sample: &VadSample, current_time: f64) -> Option<SpeechEvent> {
        match self.speech_start {
            None => self.observe_silent(sample, current_time),
            Some(start_time) => self.observe_speaking(start_time, sample, current_time),
        }
    }

    fn observe_silent(&mut self, sample: &VadSample, current_time: f64) -> Option<SpeechEvent> {
        if sample.speech_probability < self.config.start_threshold {
            self.candidate_start = None;
            return None;
        }

        let first = *self.candidate_start.get_or_insert(sample.timestamp);
        if elapsed_ms(first, current_time) < self.config.start_debounce_ms as f64 {
            return None;
        }

        self.candidate_start = None;
        self.speech_start = Some(first);
        self.last_voiced = Some(sample.timestamp);
        self.silence_duration = 0.0;
        Some(SpeechEvent::Started { start_time: first })
    }

    fn observe_speaking(
        &mut self,
        start_time: f64,
        sample: &VadSample,
        current_time: f64,
    ) -> Option<SpeechEvent> {
        if sample.speech_probability >= self.config.end_threshold {
            self.last_voiced = Some(sample.timestamp);
            self.silence_duration = 0.0;
            return None;
        }

        let last_voiced = self.last_voiced.unwrap_or(start_time);
        self.silence_duration = (current_time - last_voiced).max(0.0);
        if elapsed_ms(last_voiced, current_time) < self.config.end_debounce_ms as f64 {
            return None;
        }

        let silence_duration = self.silence_duration;
        self.speech_start = None;
        self.last_voiced = None;
        Some(SpeechEvent::Ended {
            start_time,
            last_voiced_time: last_voiced,
            silence_duration,
        })
    }

    /// Enter the speaking state from an external detection (barge-in), so
    /// the matching end is still reported.
    pub fn force_start(&mut self, start_time: f64, current_time: f64) {
        self.candidate_start = None;
        if self.speech_start.is_none() {
            self.speech_start = Some(start_time);
        }
        self.last_voiced = Some(current_time);
        self.silence_duration = 0.0;
    }

    pub fn reset(&mut self) {
        self.candidate_start = None;
        self.speech_start = None;
        self.last_voiced = None;
        self.silence_duration = 0.0;
    }
}

fn elapsed_ms(since: f64, now: f64) -> f64 {
    (now - since) * 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> SpeechActivityTracker {
        SpeechActivityTracker::new(SpeechTrackerConfig::default())
    }

    /// Feed `prob` at 1ms steps over `[from_ms, to_ms)`, collecting events.
    fn feed(t: &mut SpeechActivityTracker, from_ms: u64, to_ms: u64, prob: f32) -> Vec<SpeechEvent> {
        (from_ms..to_ms)
            .filter_map(|ms| {
                let ts = ms as f64 / 1000.0;
                t.observe(&VadSample::new(ts, prob, prob), ts)
            })
            .collect()
    }

    #[test]
    fn test_start_debounce_not_met() {
        let mut t = tracker();
        // samples at 0..=149ms: held for 149ms
        let events = feed(&mut t, 0, 150, 0.9);
        assert!(events.is_empty());
        let events = feed(&mut t, 150, 400, 0.0);
        assert!(events.is_empty());
        assert!(!t.state().is_speaking);
    }

    #[test]
    fn test_start_debounce_met_fires_once() {
        let mut t = tracker();
        // samples at 0..=151ms: held for 151ms
        let events = feed(&mut t, 0, 152, 0.9);
        assert_eq!(events, vec![SpeechEvent::Started { start_time: 0.0 }]);
        assert!(feed(&mut t, 152, 400, 0.9).is_empty());
    }

    #[test]
    fn test_zero_timestamp_is_a_valid_start() {
        let mut t = tracker();
        feed(&mut t, 0, 200, 0.9);
        let state = t.state();
        assert!(state.is_speaking);
        assert_eq!(state.speech_start_time, Some(0.0));
    }

    #[test]
    fn test_start_time_is_first_sample_not_debounce_time() {
        let mut t = tracker();
        feed(&mut t, 0, 100, 0.0);
        let events = feed(&mut t, 100, 300, 0.9);
        assert_eq!(events, vec![SpeechEvent::Started { start_time: 0.1 }]);
    }

    #[test]
    fn test_dropout_resets_start_candidate() {
        let mut t = tracker();
        feed(&mut t, 0, 100, 0.9);
        feed(&mut t, 100, 101, 0.1);
        assert!(feed(&mut t, 101, 200, 0.9).is_empty());
        let events = feed(&mut t, 200, 260, 0.9);
        assert_eq!(events, vec![SpeechEvent::Started { start_time: 0.101 }]);
    }

    #[test]
    fn test_end_after_sustained_silence() {
        let mut t = tracker();
        feed(&mut t, 0, 500, 0.9);
        // brief dropout shorter than the end debounce keeps speech alive
        assert!(feed(&mut t, 500, 700, 0.0).is_empty());
        assert!(feed(&mut t, 700, 800, 0.9).is_empty());

        let events = feed(&mut t, 800, 1200, 0.0);
        assert_eq!(events.len(), 1);
        match events[0] {
            SpeechEvent::Ended {
                start_time,
                last_voiced_time,
                silence_duration,
            } => {
                assert_eq!(start_time, 0.0);
                assert_eq!(last_voiced_time, 0.799);
                assert!(silence_duration >= 0.299);
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(t.state().speech_start_time, None);
    }

    #[test]
    fn test_hysteresis_band_keeps_speech_alive() {
        let mut t = tracker();
        feed(&mut t, 0, 200, 0.9);
        // between end (0.35) and start (0.5) thresholds
        assert!(feed(&mut t, 200, 1000, 0.4).is_empty());
        assert!(t.is_speaking());
    }

    #[test]
    fn test_force_start_reports_matching_end() {
        let mut t = tracker();
        t.force_start(2.0, 2.1);
        assert_eq!(t.state().speech_start_time, Some(2.0));
        let events = feed(&mut t, 2100, 2500, 0.0);
        assert!(matches!(
            events.as_slice(),
            [SpeechEvent::Ended { start_time, .. }] if *start_time == 2.0
        ));
    }
}
