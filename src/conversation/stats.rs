//! Per-session counters and turn latency samples.
//!
//! Only the owning session's processing path mutates these, so plain fields
//! are enough. Counters only ever increase.

use serde::Serialize;
use std::collections::VecDeque;

/// Latency samples kept for the rolling average.
const LATENCY_WINDOW: usize = 64;

#[derive(Debug, Clone, Default)]
pub struct SessionStats {
    pub turns_completed: u64,
    pub turns_failed: u64,
    pub interrupts_detected: u64,
    pub utterances_submitted: u64,
    pub utterances_coalesced: u64,
    pub chunks_processed: u64,
    pub chunks_rejected: u64,
    latencies_ms: VecDeque<f64>,
}

impl SessionStats {
    /// Record the delay between handing off an utterance and the agent
    /// starting to speak.
    pub fn record_latency(&mut self, latency_ms: f64) {
        if self.latencies_ms.len() == LATENCY_WINDOW {
            self.latencies_ms.pop_front();
        }
        self.latencies_ms.push_back(latency_ms);
    }

    pub fn average_turn_latency_ms(&self) -> Option<f64> {
        if self.latencies_ms.is_empty() {
            return None;
        }
        Some(self.latencies_ms.iter().sum::<f64>() / self.latencies_ms.len() as f64)
    }

    pub fn latency_samples(&self) -> usize {
        self.latencies_ms.len()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            turns_completed: self.turns_completed,
            turns_failed: self.turns_failed,
            interrupts_detected: self.interrupts_detected,
            utterances_submitted: self.utterances_submitted,
            utterances_coalesced: self.utterances_coalesced,
            chunks_processed: self.chunks_processed,
            chunks_rejected: self.chunks_rejected,
            average_turn_latency_ms: self.average_turn_latency_ms(),
            latency_samples: self.latencies_ms.len() as u64,
        }
    }
}

/// Serializable copy of `SessionStats` for the management API.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StatsSnapshot {
    pub turns_completed: u64,
    pub turns_failed: u64,
    pub interrupts_detected: u64,
    pub utterances_submitted: u64,
    pub utterances_coalesced: u64,
    pub chunks_processed: u64,
    pub chunks_rejected: u64,
    pub average_turn_latency_ms: Option<f64>,
    /// Number of samples behind `average_turn_latency_ms`.
    pub latency_samples: u64,
}

impl StatsSnapshot {
    /// Sum counters across sessions; the latency average is weighted by the
    /// number of latency samples behind each side.
    pub fn merge(&mut self, other: &StatsSnapshot) {
        let weighted = |avg: Option<f64>, samples: u64| {
            avg.filter(|_| samples > 0).map(|a| (a * samples as f64, samples))
        };
        let combined = match (
            weighted(self.average_turn_latency_ms, self.latency_samples),
            weighted(other.average_turn_latency_ms, other.latency_samples),
        ) {
            (Some((a, n)), Some((b, m))) => Some((a + b) / (n + m) as f64),
            (Some((a, n)), None) | (None, Some((a, n))) => Some(a / n as f64),
            (None, None) => None,
        };

        self.turns_completed += other.turns_completed;
        self.turns_failed += other.turns_failed;
        self.interrupts_detected += other.interrupts_detected;
        self.utterances_submitted += other.utterances_submitted;
        self.utterances_coalesced += other.utterances_coalesced;
        self.chunks_processed += other.chunks_processed;
        self.chunks_rejected += other.chunks_rejected;
        self.latency_samples += other.latency_samples;
        self.average_turn_latency_ms = combined;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latency_window_is_bounded() {
        let mut stats = SessionStats::default();
        assert_eq!(stats.average_turn_latency_ms(), None);
        for i in 0..100 {
            stats.record_latency(i as f64);
        }
        assert_eq!(stats.latency_samples(), LATENCY_WINDOW);
        // samples 36..=99
        assert_eq!(stats.average_turn_latency_ms(), Some(67.5));
    }

    #[test]
    fn test_merge_sums_counters() {
        let mut total = StatsSnapshot::default();
        total.merge(&StatsSnapshot {
            turns_completed: 2,
            interrupts_detected: 1,
            average_turn_latency_ms: Some(100.0),
            latency_samples: 2,
            ..StatsSnapshot::default()
        });
        total.merge(&StatsSnapshot {
            turns_completed: 1,
            utterances_submitted: 4,
            average_turn_latency_ms: Some(400.0),
            latency_samples: 1,
            ..StatsSnapshot::default()
        });
        assert_eq!(total.turns_completed, 3);
        assert_eq!(total.interrupts_detected, 1);
        assert_eq!(total.utterances_submitted, 4);
        assert_eq!(total.average_turn_latency_ms, Some(200.0));
    }

    #[test]
    fn test_merge_keeps_latency_of_interrupted_turns() {
        // every turn was cut off by a barge-in, so none completed
        let mut interrupted = SessionStats::default();
        interrupted.interrupts_detected = 2;
        interrupted.record_latency(300.0);
        interrupted.record_latency(500.0);

        let mut total = StatsSnapshot::default();
        total.merge(&interrupted.snapshot());
        assert_eq!(total.average_turn_latency_ms, Some(400.0));

        let mut finished = SessionStats::default();
        finished.turns_completed = 2;
        finished.record_latency(100.0);
        total.merge(&finished.snapshot());
        assert_eq!(total.latency_samples, 3);
        assert_eq!(total.average_turn_latency_ms, Some(300.0));
    }
}
