//! # Realtime Session
//!
//! Per-user orchestrator. Owns the audio buffer, the speech tracker, the
//! interrupt detector, the state machine and the stats of one conversation,
//! and is the only code that mutates them.
//!
//! ## Processing Path:
//! `process_audio_chunk` is the single audio entry point. For each chunk, in
//! arrival order:
//! 1. check the format, score the chunk with the VAD and append it to the
//!    buffer (format errors reject the chunk before the VAD sees it)
//! 2. enforce the `Processing` deadline on stream time
//! 3. run the interrupt detector if the agent is speaking
//! 4. run the speech tracker and feed its events to the state machine
//!
//! Callbacks fire synchronously inside that path, so observers see events in
//! the order of the audio that caused them.
//!
//! ## Turns:
//! A `speech_ended` in `Listening`/`UserSpeaking` hands an `Utterance` to
//! `on_speech_end` and records a pending turn (id, deadline, cancellation
//! token). Downstream results come back through `begin_agent_speech`,
//! `end_agent_speech` and `fail_turn` tagged with the turn id; results for any
//! other id are stale and ignored. Speech that ends while a turn is in flight
//! is coalesced into one deferred span that becomes the next turn.

use crate::audio::buffer::{AudioBuffer, AudioChunk};
use crate::audio::processor::{EnergyVad, VadSample, VoiceActivityDetector};
use crate::conversation::{
    BargeIn, ConversationEvent, ConversationState, ConversationStateMachine, InterruptConfig,
    InterruptDetector, SessionStats, SpeechActivityTracker, SpeechEvent, SpeechState,
    SpeechTrackerConfig, StatsSnapshot, Transition,
};
use crate::error::{AudioFormatError, DownstreamError};
use serde::Serialize;
use std::fmt;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Tuning for one session. Built from `AppConfig` at creation time.
#[derive(Debug, Clone, PartialEq)]
pub struct RealtimeConfig {
    pub sample_rate: u32,
    pub max_buffer_seconds: f64,
    /// RMS level treated as certain speech by the built-in `EnergyVad`.
    pub energy_reference: f32,
    pub speech: SpeechTrackerConfig,
    pub interrupt: InterruptConfig,
    pub processing_timeout_ms: u64,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            max_buffer_seconds: 30.0,
            energy_reference: 0.1,
            speech: SpeechTrackerConfig::default(),
            interrupt: InterruptConfig::default(),
            processing_timeout_ms: 10_000,
        }
    }
}

impl RealtimeConfig {
    pub fn processing_timeout(&self) -> Duration {
        Duration::from_millis(self.processing_timeout_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpeechStart {
    pub start_time: f64,
    /// True when the user started speaking over the agent.
    pub barge_in: bool,
}

/// Audio handed off for recognition.
#[derive(Debug, Clone)]
pub struct Utterance {
    pub turn_id: u64,
    pub audio: Vec<f32>,
    pub sample_rate: u32,
    pub start_time: f64,
    pub end_time: f64,
    /// Cancelled on barge-in, timeout, reset or close.
    pub cancel: CancellationToken,
}

impl Utterance {
    pub fn duration(&self) -> f64 {
        self.audio.len() as f64 / self.sample_rate as f64
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Interrupt {
    pub turn_id: u64,
    pub start_time: f64,
    pub detected_at: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TurnOutcome {
    pub turn_id: u64,
    pub success: bool,
    pub interrupted: bool,
    pub error: Option<DownstreamError>,
    pub latency_ms: Option<f64>,
}

type Callback<T> = Box<dyn Fn(T) + Send>;

/// Typed session callbacks, one per event. Unset callbacks are no-ops.
pub struct SessionCallbacks {
    on_speech_start: Callback<SpeechStart>,
    on_speech_end: Callback<Utterance>,
    on_interrupt: Callback<Interrupt>,
    on_turn_complete: Callback<TurnOutcome>,
    on_state_change: Callback<Transition>,
}

impl SessionCallbacks {
    pub fn new() -> Self {
        Self {
            on_speech_start: Box::new(|_| {}),
            on_speech_end: Box::new(|_| {}),
            on_interrupt: Box::new(|_| {}),
            on_turn_complete: Box::new(|_| {}),
            on_state_change: Box::new(|_| {}),
        }
    }

    pub fn on_speech_start(mut self, f: impl Fn(SpeechStart) + Send + 'static) -> Self {
        self.on_speech_start = Box::new(f);
        self
    }

    pub fn on_speech_end(mut self, f: impl Fn(Utterance) + Send + 'static) -> Self {
        self.on_speech_end = Box::new(f);
        self
    }

    pub fn on_interrupt(mut self, f: impl Fn(Interrupt) + Send + 'static) -> Self {
        self.on_interrupt = Box::new(f);
        self
    }

    pub fn on_turn_complete(mut self, f: impl Fn(TurnOutcome) + Send + 'static) -> Self {
        self.on_turn_complete = Box::new(f);
        self
    }

    pub fn on_state_change(mut self, f: impl Fn(Transition) + Send + 'static) -> Self {
        self.on_state_change = Box::new(f);
        self
    }
}

impl Default for SessionCallbacks {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SessionCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionCallbacks").finish_non_exhaustive()
    }
}

#[derive(Debug)]
struct PendingTurn {
    turn_id: u64,
    /// Stream time of the hand-off, for the deadline.
    dispatched_at: f64,
    /// Wall clock of the hand-off, for latency stats.
    dispatched_instant: Instant,
    latency_ms: Option<f64>,
    cancel: CancellationToken,
}

/// Serializable view of a session for status endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct RealtimeStatus {
    pub state: ConversationState,
    pub can_respond: bool,
    pub speech: SpeechState,
    pub buffered_seconds: f64,
    pub pending_turn: Option<u64>,
    pub has_deferred_speech: bool,
    pub stats: StatsSnapshot,
}

pub struct RealtimeSession {
    session_id: String,
    config: RealtimeConfig,
    machine: ConversationStateMachine,
    buffer: AudioBuffer,
    tracker: SpeechActivityTracker,
    interrupts: InterruptDetector,
    vad: Box<dyn VoiceActivityDetector>,
    stats: SessionStats,
    callbacks: SessionCallbacks,
    next_turn_id: u64,
    pending: Option<PendingTurn>,
    /// Start of speech that ended while a turn was in flight.
    deferred_start: Option<f64>,
}

impl RealtimeSession {
    pub fn new(session_id: impl Into<String>, config: RealtimeConfig, callbacks: SessionCallbacks) -> Self {
        let vad = Box::new(EnergyVad::new(config.energy_reference));
        Self::with_detector(session_id, config, callbacks, vad)
    }

    pub fn with_detector(
        session_id: impl Into<String>,
        config: RealtimeConfig,
        callbacks: SessionCallbacks,
        vad: Box<dyn VoiceActivityDetector>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            machine: ConversationStateMachine::new(),
            buffer: AudioBuffer::new(config.sample_rate, config.max_buffer_seconds),
            tracker: SpeechActivityTracker::new(config.speech),
            interrupts: InterruptDetector::new(config.interrupt),
            vad,
            stats: SessionStats::default(),
            callbacks,
            next_turn_id: 1,
            pending: None,
            deferred_start: None,
            config,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn config(&self) -> &RealtimeConfig {
        &self.config
    }

    pub fn state(&self) -> ConversationState {
        self.machine.state()
    }

    pub fn can_respond(&self) -> bool {
        self.machine.can_respond()
    }

    pub fn speech_state(&self) -> SpeechState {
        self.tracker.state()
    }

    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    pub fn buffer(&self) -> &AudioBuffer {
        &self.buffer
    }

    /// Turn currently waiting on downstream work or being spoken.
    pub fn pending_turn(&self) -> Option<u64> {
        self.pending.as_ref().map(|p| p.turn_id)
    }

    /// Swap the callbacks, e.g. when a transport attaches to a session that
    /// was created through the management API.
    pub fn replace_callbacks(&mut self, callbacks: SessionCallbacks) {
        self.callbacks = callbacks;
    }

    pub fn status(&self) -> RealtimeStatus {
        RealtimeStatus {
            state: self.state(),
            can_respond: self.can_respond(),
            speech: self.speech_state(),
            buffered_seconds: self.buffer.duration(),
            pending_turn: self.pending_turn(),
            has_deferred_speech: self.deferred_start.is_some(),
            stats: self.stats.snapshot(),
        }
    }

    /// Analyze a chunk with the session's VAD, then process it.
    ///
    /// A chunk in the wrong format is rejected before the detector sees it.
    pub fn process_audio_chunk(&mut self, chunk: AudioChunk) -> Result<(), AudioFormatError> {
        if let Err(err) = self.buffer.accepts(&chunk) {
            return Err(self.reject_chunk(err));
        }
        let sample = self.vad.analyze(&chunk);
        self.process_analyzed_chunk(chunk, sample)
    }

    /// Process a chunk whose VAD sample was computed elsewhere.
    pub fn process_analyzed_chunk(
        &mut self,
        chunk: AudioChunk,
        sample: VadSample,
    ) -> Result<(), AudioFormatError> {
        let now = chunk.timestamp();
        if let Err(err) = self.buffer.add(chunk) {
            return Err(self.reject_chunk(err));
        }
        self.stats.chunks_processed += 1;

        self.check_deadline(now);

        if self.interrupts.is_armed() {
            if let Some(barge_in) = self.interrupts.observe(&sample, now) {
                self.handle_barge_in(barge_in, now);
            }
        }

        match self.tracker.observe(&sample, now) {
            Some(SpeechEvent::Started { start_time }) => self.handle_speech_started(start_time),
            Some(SpeechEvent::Ended {
                start_time,
                last_voiced_time,
                silence_duration,
            }) => self.handle_speech_ended(start_time, last_voiced_time, silence_duration, now),
            None => {}
        }

        Ok(())
    }

    /// Fire `downstream_timeout` if the pending turn has been processing for
    /// longer than the configured deadline (measured in stream time).
    pub fn check_deadline(&mut self, current_time: f64) {
        if self.machine.state() != ConversationState::Processing {
            return;
        }
        let Some(pending) = &self.pending else {
            return;
        };
        let elapsed_ms = (current_time - pending.dispatched_at) * 1000.0;
        if elapsed_ms >= self.config.processing_timeout_ms as f64 {
            let turn_id = pending.turn_id;
            self.fail_turn(
                turn_id,
                DownstreamError::Timeout {
                    after_ms: self.config.processing_timeout_ms,
                },
            );
        }
    }

    /// Downstream produced a reply: `Processing → AgentSpeaking`.
    ///
    /// Returns false for stale turns or illegal states.
    pub fn begin_agent_speech(&mut self, turn_id: u64) -> bool {
        if !self.is_current(turn_id) {
            debug!(session_id = %self.session_id, turn_id, "Ignoring stale response");
            return false;
        }
        if self.apply(ConversationEvent::DownstreamResponseReady).is_none() {
            return false;
        }

        self.interrupts.arm();
        if let Some(pending) = self.pending.as_mut() {
            let latency_ms = pending.dispatched_instant.elapsed().as_secs_f64() * 1000.0;
            pending.latency_ms = Some(latency_ms);
            self.stats.record_latency(latency_ms);
        }
        true
    }

    /// Playback finished normally: `AgentSpeaking → Idle`, turn complete.
    pub fn end_agent_speech(&mut self, turn_id: u64) -> bool {
        if !self.is_current(turn_id) {
            debug!(session_id = %self.session_id, turn_id, "Ignoring stale playback completion");
            return false;
        }
        if self.apply(ConversationEvent::AgentSpeechFinished).is_none() {
            return false;
        }

        self.interrupts.disarm();
        let latency_ms = self.pending.take().and_then(|p| p.latency_ms);
        self.stats.turns_completed += 1;
        info!(session_id = %self.session_id, turn_id, "Turn completed");
        (self.callbacks.on_turn_complete)(TurnOutcome {
            turn_id,
            success: true,
            interrupted: false,
            error: None,
            latency_ms,
        });
        self.resume_deferred();
        true
    }

    /// Downstream failed or timed out: `Processing → Idle`.
    pub fn fail_turn(&mut self, turn_id: u64, error: DownstreamError) -> bool {
        if !self.is_current(turn_id) {
            debug!(session_id = %self.session_id, turn_id, "Ignoring stale failure");
            return false;
        }
        let event = match error {
            DownstreamError::Timeout { .. } => ConversationEvent::DownstreamTimeout,
            _ => ConversationEvent::DownstreamError,
        };
        if self.apply(event).is_none() {
            return false;
        }

        if let Some(pending) = self.pending.take() {
            pending.cancel.cancel();
        }
        self.stats.turns_failed += 1;
        warn!(session_id = %self.session_id, turn_id, error = %error, "Turn failed");
        (self.callbacks.on_turn_complete)(TurnOutcome {
            turn_id,
            success: false,
            interrupted: false,
            error: Some(error),
            latency_ms: None,
        });
        self.resume_deferred();
        true
    }

    /// Orchestrator-initiated stop of the current turn, whether it is still
    /// processing or already speaking. Returns the cancelled turn id.
    pub fn cancel_agent_speech(&mut self) -> Option<u64> {
        let event = match self.machine.state() {
            ConversationState::AgentSpeaking => ConversationEvent::AgentSpeechFinished,
            ConversationState::Processing => ConversationEvent::DownstreamError,
            _ => return None,
        };
        self.apply(event)?;
        self.interrupts.disarm();

        let pending = self.pending.take()?;
        pending.cancel.cancel();
        self.stats.turns_failed += 1;
        info!(session_id = %self.session_id, turn_id = pending.turn_id, "Agent speech cancelled");
        (self.callbacks.on_turn_complete)(TurnOutcome {
            turn_id: pending.turn_id,
            success: false,
            interrupted: false,
            error: Some(DownstreamError::Cancelled),
            latency_ms: pending.latency_ms,
        });
        self.resume_deferred();
        Some(pending.turn_id)
    }

    /// `session_reset`: back to `Idle`, dropping any in-flight turn and
    /// buffered audio.
    pub fn reset(&mut self) {
        if let Some(pending) = self.pending.take() {
            pending.cancel.cancel();
        }
        self.interrupts.disarm();
        self.tracker.reset();
        self.deferred_start = None;
        self.buffer.clear();
        self.apply(ConversationEvent::SessionReset);
    }

    /// Teardown: cancel in-flight work and release audio.
    pub fn close(&mut self) {
        if let Some(pending) = self.pending.take() {
            pending.cancel.cancel();
        }
        self.interrupts.disarm();
        self.buffer.clear();
        debug!(session_id = %self.session_id, "Realtime session closed");
    }

    fn reject_chunk(&mut self, err: AudioFormatError) -> AudioFormatError {
        self.stats.chunks_rejected += 1;
        warn!(session_id = %self.session_id, error = %err, "Rejected audio chunk");
        err
    }

    fn is_current(&self, turn_id: u64) -> bool {
        self.pending.as_ref().is_some_and(|p| p.turn_id == turn_id)
    }

    /// Apply an event, logging and swallowing illegal transitions.
    fn apply(&mut self, event: ConversationEvent) -> Option<Transition> {
        match self.machine.apply(event) {
            Ok(transition) => {
                debug!(
                    session_id = %self.session_id,
                    from = %transition.from,
                    to = %transition.to,
                    event = %event,
                    "State transition"
                );
                (self.callbacks.on_state_change)(transition);
                Some(transition)
            }
            Err(err) => {
                debug!(session_id = %self.session_id, error = %err, "Ignored event");
                None
            }
        }
    }

    fn handle_speech_started(&mut self, start_time: f64) {
        if self.apply(ConversationEvent::SpeechStarted).is_some() {
            (self.callbacks.on_speech_start)(SpeechStart {
                start_time,
                barge_in: false,
            });
        }
    }

    fn handle_speech_ended(
        &mut self,
        start_time: f64,
        last_voiced_time: f64,
        silence_duration: f64,
        now: f64,
    ) {
        match self.machine.state() {
            ConversationState::Listening | ConversationState::UserSpeaking => {
                let start_time = self
                    .deferred_start
                    .take()
                    .map_or(start_time, |deferred| deferred.min(start_time));
                if self.apply(ConversationEvent::SpeechEnded).is_some() {
                    debug!(
                        session_id = %self.session_id,
                        speech_seconds = last_voiced_time - start_time,
                        silence_duration,
                        "Speech ended"
                    );
                    self.dispatch_utterance(start_time, now);
                }
            }
            ConversationState::Processing | ConversationState::AgentSpeaking => {
                let merged = self
                    .deferred_start
                    .map_or(start_time, |deferred| deferred.min(start_time));
                self.deferred_start = Some(merged);
                self.stats.utterances_coalesced += 1;
                debug!(
                    session_id = %self.session_id,
                    state = %self.machine.state(),
                    "Coalescing utterance into next turn"
                );
            }
            ConversationState::Idle => {
                self.apply(ConversationEvent::SpeechEnded);
            }
        }
    }

    fn handle_barge_in(&mut self, barge_in: BargeIn, now: f64) {
        if self.apply(ConversationEvent::BargeInDetected).is_none() {
            return;
        }
        self.interrupts.disarm();
        self.stats.interrupts_detected += 1;

        let turn_id = match self.pending.take() {
            Some(pending) => {
                pending.cancel.cancel();
                pending.turn_id
            }
            None => 0,
        };
        self.tracker.force_start(barge_in.start_time, now);

        info!(session_id = %self.session_id, turn_id, "Barge-in detected");
        (self.callbacks.on_interrupt)(Interrupt {
            turn_id,
            start_time: barge_in.start_time,
            detected_at: barge_in.detected_at,
        });
        (self.callbacks.on_turn_complete)(TurnOutcome {
            turn_id,
            success: false,
            interrupted: true,
            error: Some(DownstreamError::Cancelled),
            latency_ms: None,
        });
        (self.callbacks.on_speech_start)(SpeechStart {
            start_time: barge_in.start_time,
            barge_in: true,
        });
    }

    fn dispatch_utterance(&mut self, start_time: f64, now: f64) {
        let audio = self.buffer.get_audio_since(start_time);
        let end_time = self.buffer.end_time().unwrap_or(start_time);
        let turn_id = self.next_turn_id;
        self.next_turn_id += 1;

        let cancel = CancellationToken::new();
        self.pending = Some(PendingTurn {
            turn_id,
            dispatched_at: now,
            dispatched_instant: Instant::now(),
            latency_ms: None,
            cancel: cancel.clone(),
        });
        self.stats.utterances_submitted += 1;
        self.buffer.clear();

        info!(
            session_id = %self.session_id,
            turn_id,
            samples = audio.len(),
            "Utterance handed off"
        );
        (self.callbacks.on_speech_end)(Utterance {
            turn_id,
            audio,
            sample_rate: self.config.sample_rate,
            start_time,
            end_time,
            cancel,
        });
    }

    /// After a turn ends, start the next one from coalesced speech or from
    /// speech that is still in progress.
    fn resume_deferred(&mut self) {
        let start_time = match (self.deferred_start, self.tracker.state().speech_start_time) {
            (Some(deferred), _) => deferred,
            (None, Some(live)) => live,
            (None, None) => return,
        };
        if self.apply(ConversationEvent::SpeechStarted).is_none() {
            return;
        }
        (self.callbacks.on_speech_start)(SpeechStart {
            start_time,
            barge_in: false,
        });

        // Still talking: the tracker's end event will close this span.
        if self.tracker.is_speaking() {
            return;
        }
        self.deferred_start = None;
        if self.apply(ConversationEvent::SpeechEnded).is_some() {
            let now = self.buffer.end_time().unwrap_or(start_time);
            self.dispatch_utterance(start_time, now);
        }
    }
}

impl fmt::Debug for RealtimeSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RealtimeSession")
            .field("session_id", &self.session_id)
            .field("state", &self.machine.state())
            .field("pending_turn", &self.pending_turn())
            .field("buffered_seconds", &self.buffer.duration())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    const RATE: u32 = 16_000;
    const CHUNK_MS: u64 = 20;

    #[derive(Debug, Clone, PartialEq)]
    enum Seen {
        SpeechStart { barge_in: bool },
        SpeechEnd { turn_id: u64 },
        Interrupt { turn_id: u64 },
        TurnComplete { turn_id: u64, success: bool },
    }

    #[derive(Default, Clone)]
    struct Recorder {
        events: Arc<Mutex<Vec<Seen>>>,
        utterances: Arc<Mutex<Vec<Utterance>>>,
        outcomes: Arc<Mutex<Vec<TurnOutcome>>>,
    }

    impl Recorder {
        fn callbacks(&self) -> SessionCallbacks {
            let (starts, ends, interrupts, turns) = (self.clone(), self.clone(), self.clone(), self.clone());
            SessionCallbacks::new()
                .on_speech_start(move |s| {
                    starts.events.lock().push(Seen::SpeechStart { barge_in: s.barge_in })
                })
                .on_speech_end(move |u| {
                    ends.events.lock().push(Seen::SpeechEnd { turn_id: u.turn_id });
                    ends.utterances.lock().push(u);
                })
                .on_interrupt(move |i| {
                    interrupts.events.lock().push(Seen::Interrupt { turn_id: i.turn_id })
                })
                .on_turn_complete(move |o| {
                    turns.events.lock().push(Seen::TurnComplete {
                        turn_id: o.turn_id,
                        success: o.success,
                    });
                    turns.outcomes.lock().push(o);
                })
        }

        fn events(&self) -> Vec<Seen> {
            self.events.lock().clone()
        }
    }

    fn session_with(config: RealtimeConfig) -> (RealtimeSession, Recorder) {
        let recorder = Recorder::default();
        let session = RealtimeSession::new("test", config, recorder.callbacks());
        (session, recorder)
    }

    fn session() -> (RealtimeSession, Recorder) {
        session_with(RealtimeConfig::default())
    }

    /// Feed 20ms chunks of constant amplitude over `[from_ms, to_ms)`.
    fn feed(session: &mut RealtimeSession, from_ms: u64, to_ms: u64, amplitude: f32) {
        let samples_per_chunk = (RATE as u64 * CHUNK_MS / 1000) as usize;
        for ms in (from_ms..to_ms).step_by(CHUNK_MS as usize) {
            let chunk = AudioChunk::new(ms as f64 / 1000.0, vec![amplitude; samples_per_chunk], RATE);
            session.process_audio_chunk(chunk).unwrap();
        }
    }

    const SILENCE: f32 = 0.0;
    const SPEECH: f32 = 0.5;

    #[test]
    fn test_end_to_end_turn_with_barge_in() {
        let (mut session, recorder) = session();

        feed(&mut session, 0, 300, SILENCE);
        assert_eq!(session.state(), ConversationState::Idle);

        feed(&mut session, 300, 560, SPEECH);
        assert_eq!(session.state(), ConversationState::UserSpeaking);
        assert_eq!(session.speech_state().speech_start_time, Some(0.3));

        feed(&mut session, 560, 960, SILENCE);
        assert_eq!(session.state(), ConversationState::Processing);
        assert_eq!(session.pending_turn(), Some(1));
        {
            let utterances = recorder.utterances.lock();
            assert_eq!(utterances.len(), 1);
            assert_eq!(utterances[0].start_time, 0.3);
            assert!(utterances[0].duration() > 0.25);
        }

        assert!(session.begin_agent_speech(1));
        assert_eq!(session.state(), ConversationState::AgentSpeaking);

        feed(&mut session, 960, 1160, SPEECH);
        assert_eq!(session.state(), ConversationState::UserSpeaking);
        assert_eq!(session.stats().interrupts_detected, 1);
        assert!(recorder.utterances.lock()[0].cancel.is_cancelled());

        assert_eq!(
            recorder.events(),
            vec![
                Seen::SpeechStart { barge_in: false },
                Seen::SpeechEnd { turn_id: 1 },
                Seen::Interrupt { turn_id: 1 },
                Seen::TurnComplete { turn_id: 1, success: false },
                Seen::SpeechStart { barge_in: true },
            ]
        );
    }

    #[test]
    fn test_quiet_audio_never_leaves_idle() {
        let (mut session, recorder) = session();
        // rms 0.03 against a 0.1 reference: probability 0.3, under the start threshold
        feed(&mut session, 0, 3000, 0.03);
        assert_eq!(session.state(), ConversationState::Idle);
        assert!(recorder.events().is_empty());
    }

    #[test]
    fn test_barge_in_fires_once_per_turn() {
        let (mut session, recorder) = session();
        feed(&mut session, 0, 300, SPEECH);
        feed(&mut session, 300, 700, SILENCE);
        assert!(session.begin_agent_speech(1));

        feed(&mut session, 700, 2000, SPEECH);
        let interrupts = recorder
            .events()
            .into_iter()
            .filter(|e| matches!(e, Seen::Interrupt { .. }))
            .count();
        assert_eq!(interrupts, 1);
        assert_eq!(session.stats().interrupts_detected, 1);
    }

    #[test]
    fn test_barge_in_utterance_becomes_next_turn() {
        let (mut session, recorder) = session();
        feed(&mut session, 0, 300, SPEECH);
        feed(&mut session, 300, 700, SILENCE);
        assert!(session.begin_agent_speech(1));
        feed(&mut session, 700, 1000, SPEECH);
        feed(&mut session, 1000, 1400, SILENCE);

        assert_eq!(session.state(), ConversationState::Processing);
        assert_eq!(session.pending_turn(), Some(2));
        let utterances = recorder.utterances.lock();
        assert_eq!(utterances[1].start_time, 0.7);
    }

    #[test]
    fn test_stale_completions_after_barge_in_are_ignored() {
        let (mut session, _recorder) = session();
        feed(&mut session, 0, 300, SPEECH);
        feed(&mut session, 300, 700, SILENCE);
        assert!(session.begin_agent_speech(1));
        feed(&mut session, 700, 900, SPEECH);
        assert_eq!(session.state(), ConversationState::UserSpeaking);

        assert!(!session.end_agent_speech(1));
        assert!(!session.begin_agent_speech(1));
        assert!(!session.fail_turn(1, DownstreamError::Failure("late".into())));
        assert_eq!(session.state(), ConversationState::UserSpeaking);
        assert_eq!(session.stats().turns_completed, 0);
    }

    #[test]
    fn test_completed_turn_records_stats() {
        let (mut session, recorder) = session();
        feed(&mut session, 0, 300, SPEECH);
        feed(&mut session, 300, 700, SILENCE);
        assert!(session.begin_agent_speech(1));
        assert!(session.end_agent_speech(1));

        assert_eq!(session.state(), ConversationState::Idle);
        assert!(session.can_respond());
        let stats = session.stats();
        assert_eq!(stats.turns_completed, 1);
        assert_eq!(stats.utterances_submitted, 1);
        assert_eq!(stats.latency_samples(), 1);
        let outcomes = recorder.outcomes.lock();
        assert!(outcomes[0].success);
        assert!(outcomes[0].latency_ms.is_some());
    }

    #[test]
    fn test_processing_deadline_returns_to_idle() {
        let (mut session, recorder) = session_with(RealtimeConfig {
            processing_timeout_ms: 500,
            ..RealtimeConfig::default()
        });
        feed(&mut session, 0, 300, SPEECH);
        feed(&mut session, 300, 700, SILENCE);
        assert_eq!(session.state(), ConversationState::Processing);

        feed(&mut session, 700, 1300, SILENCE);
        assert_eq!(session.state(), ConversationState::Idle);
        assert_eq!(session.stats().turns_failed, 1);
        let outcomes = recorder.outcomes.lock();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].error, Some(DownstreamError::Timeout { after_ms: 500 }));
        assert!(recorder.utterances.lock()[0].cancel.is_cancelled());
    }

    #[test]
    fn test_speech_across_deadline_becomes_next_turn() {
        let (mut session, recorder) = session_with(RealtimeConfig {
            processing_timeout_ms: 500,
            ..RealtimeConfig::default()
        });
        feed(&mut session, 0, 300, SPEECH);
        feed(&mut session, 300, 700, SILENCE);
        assert_eq!(session.pending_turn(), Some(1));

        // the deadline passes while the user is talking
        feed(&mut session, 700, 1300, SPEECH);
        assert_eq!(session.stats().turns_failed, 1);
        assert_eq!(session.state(), ConversationState::UserSpeaking);

        feed(&mut session, 1300, 1500, SPEECH);
        feed(&mut session, 1500, 1900, SILENCE);
        assert_eq!(session.state(), ConversationState::Processing);
        assert_eq!(session.pending_turn(), Some(2));
        assert_eq!(session.stats().utterances_submitted, 2);
        let utterances = recorder.utterances.lock();
        assert_eq!(utterances.len(), 2);
        assert_eq!(utterances[1].start_time, 0.7);
        assert!(utterances[1].duration() > 0.7);
    }

    #[test]
    fn test_speech_across_playback_end_becomes_next_turn() {
        let mut config = RealtimeConfig::default();
        config.interrupt.enabled = false;
        let (mut session, recorder) = session_with(config);
        feed(&mut session, 0, 300, SPEECH);
        feed(&mut session, 300, 700, SILENCE);
        assert!(session.begin_agent_speech(1));

        feed(&mut session, 700, 1000, SPEECH);
        assert_eq!(session.state(), ConversationState::AgentSpeaking);
        assert!(session.end_agent_speech(1));
        assert_eq!(session.state(), ConversationState::UserSpeaking);
        assert_eq!(recorder.events().last(), Some(&Seen::SpeechStart { barge_in: false }));

        feed(&mut session, 1000, 1500, SPEECH);
        feed(&mut session, 1500, 1900, SILENCE);
        assert_eq!(session.pending_turn(), Some(2));
        let utterances = recorder.utterances.lock();
        assert_eq!(utterances.len(), 2);
        assert_eq!(utterances[1].start_time, 0.7);
    }

    #[test]
    fn test_downstream_failure_ends_turn_gracefully() {
        let (mut session, recorder) = session();
        feed(&mut session, 0, 300, SPEECH);
        feed(&mut session, 300, 700, SILENCE);

        assert!(session.fail_turn(1, DownstreamError::Failure("stt unavailable".into())));
        assert_eq!(session.state(), ConversationState::Idle);
        assert_eq!(
            recorder.events().last(),
            Some(&Seen::TurnComplete { turn_id: 1, success: false })
        );

        // next utterance still works
        feed(&mut session, 700, 1000, SPEECH);
        feed(&mut session, 1000, 1400, SILENCE);
        assert_eq!(session.pending_turn(), Some(2));
    }

    #[test]
    fn test_speech_during_processing_is_coalesced() {
        let (mut session, recorder) = session();
        feed(&mut session, 0, 300, SPEECH);
        feed(&mut session, 300, 700, SILENCE);
        assert_eq!(session.pending_turn(), Some(1));

        feed(&mut session, 700, 1000, SPEECH);
        feed(&mut session, 1000, 1400, SILENCE);
        feed(&mut session, 1400, 1700, SPEECH);
        feed(&mut session, 1700, 2100, SILENCE);
        assert_eq!(session.state(), ConversationState::Processing);
        assert_eq!(session.stats().utterances_coalesced, 2);
        assert_eq!(recorder.utterances.lock().len(), 1);

        assert!(session.begin_agent_speech(1));
        assert!(session.end_agent_speech(1));

        // both spans became one new turn
        assert_eq!(session.state(), ConversationState::Processing);
        assert_eq!(session.pending_turn(), Some(2));
        let utterances = recorder.utterances.lock();
        assert_eq!(utterances.len(), 2);
        assert_eq!(utterances[1].start_time, 0.7);
    }

    #[test]
    fn test_cancel_agent_speech() {
        let (mut session, recorder) = session();
        assert_eq!(session.cancel_agent_speech(), None);

        feed(&mut session, 0, 300, SPEECH);
        feed(&mut session, 300, 700, SILENCE);
        assert!(session.begin_agent_speech(1));
        assert_eq!(session.cancel_agent_speech(), Some(1));
        assert_eq!(session.state(), ConversationState::Idle);
        assert_eq!(
            recorder.outcomes.lock()[0].error,
            Some(DownstreamError::Cancelled)
        );
    }

    #[test]
    fn test_rejected_chunk_leaves_session_untouched() {
        let (mut session, _recorder) = session();
        feed(&mut session, 0, 300, SPEECH);
        let state = session.state();

        let bad = AudioChunk::new(0.3, vec![0.5; 160], 8_000);
        assert!(matches!(
            session.process_audio_chunk(bad),
            Err(AudioFormatError::SampleRateMismatch { .. })
        ));
        assert_eq!(session.state(), state);
        assert_eq!(session.stats().chunks_rejected, 1);
        assert_eq!(session.stats().chunks_processed, 15);
    }

    struct CountingVad {
        calls: Arc<std::sync::atomic::AtomicUsize>,
    }

    impl VoiceActivityDetector for CountingVad {
        fn analyze(&mut self, chunk: &AudioChunk) -> VadSample {
            self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            VadSample::new(chunk.timestamp(), 0.0, 0.0)
        }
    }

    #[test]
    fn test_rejected_chunk_never_reaches_detector() {
        let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let vad = Box::new(CountingVad {
            calls: Arc::clone(&calls),
        });
        let mut session =
            RealtimeSession::with_detector("test", RealtimeConfig::default(), SessionCallbacks::new(), vad);

        feed(&mut session, 0, 100, SILENCE);
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 5);

        let bad = AudioChunk::new(0.1, vec![0.5; 160], 8_000);
        assert!(session.process_audio_chunk(bad).is_err());
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 5);
        assert_eq!(session.stats().chunks_rejected, 1);
    }

    #[test]
    fn test_reset_clears_in_flight_turn() {
        let (mut session, recorder) = session();
        feed(&mut session, 0, 300, SPEECH);
        feed(&mut session, 300, 700, SILENCE);
        session.reset();
        assert_eq!(session.state(), ConversationState::Idle);
        assert_eq!(session.pending_turn(), None);
        assert!(session.buffer().is_empty());
        assert!(recorder.utterances.lock()[0].cancel.is_cancelled());
    }
}
