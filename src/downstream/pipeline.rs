//! # Turn Pipeline
//!
//! Runs one turn's downstream work (speech-to-text → response → speech) for
//! an utterance handed off by a session. The pipeline holds no session lock:
//! callers spawn `run_turn` as a task and feed the `TurnResult` back into
//! the owning session, which drops results for stale turns.
//!
//! A turn ends in exactly one way:
//! - `Ready`: all three stages finished inside the deadline
//! - `Failed`: a stage errored, or the deadline passed
//! - `Cancelled`: the utterance's token fired (barge-in, reset, close)

use crate::downstream::collaborators::{
    AgentAudio, EchoResponder, LoopbackTranscriber, ResponseGenerator, SpeechToText, TextToSpeech,
    ToneSynthesizer,
};
use crate::error::DownstreamError;
use crate::session::Utterance;
use anyhow::Context;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct AgentReply {
    pub turn_id: u64,
    pub transcript: String,
    pub response: String,
    pub audio: AgentAudio,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone)]
pub enum TurnResult {
    Ready(AgentReply),
    Failed { turn_id: u64, error: DownstreamError },
    Cancelled { turn_id: u64 },
}

impl TurnResult {
    pub fn turn_id(&self) -> u64 {
        match self {
            TurnResult::Ready(reply) => reply.turn_id,
            TurnResult::Failed { turn_id, .. } | TurnResult::Cancelled { turn_id } => *turn_id,
        }
    }
}

#[derive(Clone)]
pub struct DownstreamPipeline {
    stt: Arc<dyn SpeechToText>,
    responder: Arc<dyn ResponseGenerator>,
    tts: Arc<dyn TextToSpeech>,
}

impl DownstreamPipeline {
    pub fn new(
        stt: Arc<dyn SpeechToText>,
        responder: Arc<dyn ResponseGenerator>,
        tts: Arc<dyn TextToSpeech>,
    ) -> Self {
        Self {
            stt,
            responder,
            tts,
        }
    }

    /// Pipeline built from the in-process loopback collaborators.
    pub fn loopback(sample_rate: u32) -> Self {
        Self::new(
            Arc::new(LoopbackTranscriber),
            Arc::new(EchoResponder::default()),
            Arc::new(ToneSynthesizer::new(sample_rate)),
        )
    }

    pub async fn run_turn(
        &self,
        session_id: String,
        utterance: Utterance,
        timeout: Duration,
    ) -> TurnResult {
        let turn_id = utterance.turn_id;
        let cancel = utterance.cancel.clone();
        let started = Instant::now();

        debug!(session_id = %session_id, turn_id, "Downstream turn started");
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => TurnResult::Cancelled { turn_id },
            outcome = tokio::time::timeout(timeout, self.stages(&session_id, utterance)) => {
                match outcome {
                    Ok(Ok((transcript, response, audio))) => TurnResult::Ready(AgentReply {
                        turn_id,
                        transcript,
                        response,
                        audio,
                        elapsed_ms: started.elapsed().as_millis() as u64,
                    }),
                    Ok(Err(err)) => TurnResult::Failed {
                        turn_id,
                        error: DownstreamError::Failure(format!("{:#}", err)),
                    },
                    Err(_) => TurnResult::Failed {
                        turn_id,
                        error: DownstreamError::Timeout {
                            after_ms: timeout.as_millis() as u64,
                        },
                    },
                }
            }
        };

        match &result {
            TurnResult::Ready(reply) => {
                info!(session_id = %session_id, turn_id, elapsed_ms = reply.elapsed_ms, "Downstream turn ready")
            }
            TurnResult::Failed { error, .. } => {
                warn!(session_id = %session_id, turn_id, error = %error, "Downstream turn failed")
            }
            TurnResult::Cancelled { .. } => {
                debug!(session_id = %session_id, turn_id, "Downstream turn cancelled")
            }
        }
        result
    }

    /// Tell the speech collaborator to stop talking to this session.
    pub async fn stop_speech(&self, session_id: &str) {
        if let Err(err) = self.tts.stop(session_id).await {
            warn!(session_id = %session_id, error = %err, "Failed to stop speech synthesis");
        }
    }

    async fn stages(
        &self,
        session_id: &str,
        utterance: Utterance,
    ) -> Result<(String, String, AgentAudio), anyhow::Error> {
        let transcript = self
            .stt
            .transcribe(session_id, &utterance.audio, utterance.sample_rate)
            .await
            .context("speech-to-text failed")?;
        if transcript.trim().is_empty() {
            anyhow::bail!("speech-to-text returned an empty transcript");
        }

        let response = self
            .responder
            .respond(session_id, &transcript)
            .await
            .context("response generation failed")?;

        let audio = self
            .tts
            .synthesize(session_id, &response)
            .await
            .context("text-to-speech failed")?;

        Ok((transcript, response, audio))
    }
}
