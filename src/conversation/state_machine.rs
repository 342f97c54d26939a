//! # Conversation State Machine
//!
//! Canonical per-session conversation state. Events come from the speech
//! tracker, the interrupt detector and downstream completions; every event is
//! checked against the transition table below and anything else is rejected
//! with an `IllegalTransitionError` (the session logs it and carries on).
//!
//! | From | Event | To |
//! |---|---|---|
//! | Idle | speech_started | Listening → UserSpeaking |
//! | Listening / UserSpeaking | speech_ended | Processing |
//! | Processing | downstream_response_ready | AgentSpeaking |
//! | Processing | downstream_error / downstream_timeout | Idle |
//! | AgentSpeaking | agent_speech_finished | Idle |
//! | AgentSpeaking | barge_in_detected | UserSpeaking |
//! | any | session_reset | Idle |

use crate::error::IllegalTransitionError;
use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationState {
    Idle,
    Listening,
    UserSpeaking,
    Processing,
    AgentSpeaking,
}

/// States in which the agent may begin a new turn.
pub const CAN_RESPOND_STATES: [ConversationState; 2] =
    [ConversationState::Idle, ConversationState::Listening];

impl ConversationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConversationState::Idle => "idle",
            ConversationState::Listening => "listening",
            ConversationState::UserSpeaking => "user_speaking",
            ConversationState::Processing => "processing",
            ConversationState::AgentSpeaking => "agent_speaking",
        }
    }
}

impl fmt::Display for ConversationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationEvent {
    SpeechStarted,
    SpeechEnded,
    DownstreamResponseReady,
    DownstreamError,
    DownstreamTimeout,
    AgentSpeechFinished,
    BargeInDetected,
    SessionReset,
}

impl ConversationEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConversationEvent::SpeechStarted => "speech_started",
            ConversationEvent::SpeechEnded => "speech_ended",
            ConversationEvent::DownstreamResponseReady => "downstream_response_ready",
            ConversationEvent::DownstreamError => "downstream_error",
            ConversationEvent::DownstreamTimeout => "downstream_timeout",
            ConversationEvent::AgentSpeechFinished => "agent_speech_finished",
            ConversationEvent::BargeInDetected => "barge_in_detected",
            ConversationEvent::SessionReset => "session_reset",
        }
    }
}

impl fmt::Display for ConversationEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A successful state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: ConversationState,
    pub to: ConversationState,
    /// Intermediate state passed through without stopping.
    pub via: Option<ConversationState>,
    pub event: ConversationEvent,
}

#[derive(Debug, Clone)]
pub struct ConversationStateMachine {
    state: ConversationState,
    transitions: u64,
}

impl Default for ConversationStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl ConversationStateMachine {
    pub fn new() -> Self {
        Self {
            state: ConversationState::Idle,
            transitions: 0,
        }
    }

    pub fn state(&self) -> ConversationState {
        self.state
    }

    /// Number of transitions applied since creation.
    pub fn transition_count(&self) -> u64 {
        self.transitions
    }

    pub fn can_respond(&self) -> bool {
        CAN_RESPOND_STATES.contains(&self.state)
    }

    pub fn apply(&mut self, event: ConversationEvent) -> Result<Transition, IllegalTransitionError> {
        use ConversationEvent as E;
        use ConversationState as S;

        let (to, via) = match (self.state, event) {
            (_, E::SessionReset) => (S::Idle, None),
            (S::Idle, E::SpeechStarted) => (S::UserSpeaking, Some(S::Listening)),
            (S::Listening | S::UserSpeaking, E::SpeechEnded) => (S::Processing, None),
            (S::Processing, E::DownstreamResponseReady) => (S::AgentSpeaking, None),
            (S::Processing, E::DownstreamError | E::DownstreamTimeout) => (S::Idle, None),
            (S::AgentSpeaking, E::AgentSpeechFinished) => (S::Idle, None),
            (S::AgentSpeaking, E::BargeInDetected) => (S::UserSpeaking, None),
            (state, event) => return Err(IllegalTransitionError { state, event }),
        };

        let transition = Transition {
            from: self.state,
            to,
            via,
            event,
        };
        self.state = to;
        self.transitions += 1;
        Ok(transition)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ConversationEvent as E;
    use ConversationState as S;

    #[test]
    fn test_full_turn_cycle() {
        let mut machine = ConversationStateMachine::new();
        assert_eq!(machine.state(), S::Idle);
        assert!(machine.can_respond());

        let started = machine.apply(E::SpeechStarted).unwrap();
        assert_eq!(started.via, Some(S::Listening));
        assert_eq!(machine.state(), S::UserSpeaking);
        assert!(!machine.can_respond());

        machine.apply(E::SpeechEnded).unwrap();
        assert_eq!(machine.state(), S::Processing);
        machine.apply(E::DownstreamResponseReady).unwrap();
        assert_eq!(machine.state(), S::AgentSpeaking);
        machine.apply(E::AgentSpeechFinished).unwrap();
        assert_eq!(machine.state(), S::Idle);
        assert_eq!(machine.transition_count(), 4);
    }

    #[test]
    fn test_barge_in_returns_to_user_speaking() {
        let mut machine = ConversationStateMachine::new();
        for event in [E::SpeechStarted, E::SpeechEnded, E::DownstreamResponseReady] {
            machine.apply(event).unwrap();
        }
        let transition = machine.apply(E::BargeInDetected).unwrap();
        assert_eq!(transition.from, S::AgentSpeaking);
        assert_eq!(machine.state(), S::UserSpeaking);
    }

    #[test]
    fn test_downstream_failures_return_to_idle() {
        for failure in [E::DownstreamError, E::DownstreamTimeout] {
            let mut machine = ConversationStateMachine::new();
            machine.apply(E::SpeechStarted).unwrap();
            machine.apply(E::SpeechEnded).unwrap();
            machine.apply(failure).unwrap();
            assert_eq!(machine.state(), S::Idle);
        }
    }

    #[test]
    fn test_illegal_transitions_leave_state_unchanged() {
        let mut machine = ConversationStateMachine::new();
        let err = machine.apply(E::SpeechEnded).unwrap_err();
        assert_eq!(err.state, S::Idle);
        assert_eq!(err.event, E::SpeechEnded);
        assert_eq!(machine.state(), S::Idle);

        machine.apply(E::SpeechStarted).unwrap();
        machine.apply(E::SpeechEnded).unwrap();
        // second utterance while processing is not a transition
        assert!(machine.apply(E::SpeechStarted).is_err());
        assert!(machine.apply(E::SpeechEnded).is_err());
        assert!(machine.apply(E::BargeInDetected).is_err());
        assert_eq!(machine.state(), S::Processing);
    }

    #[test]
    fn test_reset_from_any_state() {
        let mut machine = ConversationStateMachine::new();
        machine.apply(E::SpeechStarted).unwrap();
        machine.apply(E::SessionReset).unwrap();
        assert_eq!(machine.state(), S::Idle);
        machine.apply(E::SessionReset).unwrap();
        assert_eq!(machine.state(), S::Idle);
    }
}
