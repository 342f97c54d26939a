//! Downstream collaborator interfaces and their loopback implementations.
//!
//! The loopbacks need no external services: the transcriber labels the
//! utterance by length, the responder echoes it and the synthesizer answers
//! with a tone whose length follows the reply. They make the full turn loop
//! runnable end to end.

use async_trait::async_trait;
use serde::Serialize;
use std::f64::consts::PI;
use tracing::debug;

/// Synthesized agent speech.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentAudio {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl AgentAudio {
    pub fn duration(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.sample_rate as f64
    }
}

#[async_trait]
pub trait SpeechToText: Send + Sync {
    async fn transcribe(
        &self,
        session_id: &str,
        audio: &[f32],
        sample_rate: u32,
    ) -> Result<String, anyhow::Error>;
}

#[async_trait]
pub trait ResponseGenerator: Send + Sync {
    async fn respond(&self, session_id: &str, text: &str) -> Result<String, anyhow::Error>;
}

#[async_trait]
pub trait TextToSpeech: Send + Sync {
    async fn synthesize(&self, session_id: &str, text: &str) -> Result<AgentAudio, anyhow::Error>;

    /// Stop any synthesis or playback in progress for the session.
    async fn stop(&self, session_id: &str) -> Result<(), anyhow::Error>;
}

#[derive(Debug, Default, Clone)]
pub struct LoopbackTranscriber;

#[async_trait]
impl SpeechToText for LoopbackTranscriber {
    async fn transcribe(
        &self,
        session_id: &str,
        audio: &[f32],
        sample_rate: u32,
    ) -> Result<String, anyhow::Error> {
        if audio.is_empty() || sample_rate == 0 {
            anyhow::bail!("no audio to transcribe");
        }
        let seconds = audio.len() as f64 / sample_rate as f64;
        debug!(session_id = %session_id, seconds, "Loopback transcription");
        Ok(format!("{:.1} seconds of speech", seconds))
    }
}

#[derive(Debug, Clone)]
pub struct EchoResponder {
    prefix: String,
}

impl EchoResponder {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }
}

impl Default for EchoResponder {
    fn default() -> Self {
        Self::new("I heard")
    }
}

#[async_trait]
impl ResponseGenerator for EchoResponder {
    async fn respond(&self, _session_id: &str, text: &str) -> Result<String, anyhow::Error> {
        Ok(format!("{} {}", self.prefix, text.trim()))
    }
}

/// Answers every reply with a 440Hz tone, ~150ms per word.
#[derive(Debug, Clone)]
pub struct ToneSynthesizer {
    sample_rate: u32,
    frequency: f64,
    amplitude: f64,
    seconds_per_word: f64,
    max_seconds: f64,
}

impl ToneSynthesizer {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            frequency: 440.0,
            amplitude: 0.3,
            seconds_per_word: 0.15,
            max_seconds: 5.0,
        }
    }

    fn tone(&self, seconds: f64) -> Vec<f32> {
        let count = (seconds * self.sample_rate as f64) as usize;
        (0..count)
            .map(|i| {
                let t = i as f64 / self.sample_rate as f64;
                (self.amplitude * (2.0 * PI * self.frequency * t).sin()) as f32
            })
            .collect()
    }
}

#[async_trait]
impl TextToSpeech for ToneSynthesizer {
    async fn synthesize(&self, session_id: &str, text: &str) -> Result<AgentAudio, anyhow::Error> {
        let words = text.split_whitespace().count();
        if words == 0 {
            anyhow::bail!("nothing to synthesize");
        }
        let seconds = (words as f64 * self.seconds_per_word).min(self.max_seconds);
        debug!(session_id = %session_id, words, seconds, "Loopback synthesis");
        Ok(AgentAudio {
            samples: self.tone(seconds),
            sample_rate: self.sample_rate,
        })
    }

    async fn stop(&self, session_id: &str) -> Result<(), anyhow::Error> {
        debug!(session_id = %session_id, "Loopback synthesis stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_loopback_chain() {
        let text = LoopbackTranscriber
            .transcribe("s", &vec![0.1; 24_000], 16_000)
            .await
            .unwrap();
        assert_eq!(text, "1.5 seconds of speech");

        let reply = EchoResponder::default().respond("s", &text).await.unwrap();
        assert_eq!(reply, "I heard 1.5 seconds of speech");

        let audio = ToneSynthesizer::new(16_000).synthesize("s", &reply).await.unwrap();
        assert_eq!(audio.sample_rate, 16_000);
        assert!((audio.duration() - 0.9).abs() < 1e-3);
        assert!(audio.samples.iter().all(|s| s.abs() <= 0.3 + f32::EPSILON));
    }

    #[tokio::test]
    async fn test_loopback_rejects_empty_input() {
        assert!(LoopbackTranscriber.transcribe("s", &[], 16_000).await.is_err());
        assert!(ToneSynthesizer::new(16_000).synthesize("s", "   ").await.is_err());
    }
}
