//! # Sessions
//!
//! - **realtime**: the per-user orchestrator (`RealtimeSession`) and its
//!   typed callbacks
//! - **manager**: the registry of live sessions (`SessionManager`)

pub mod manager;
pub mod realtime;

pub use manager::{Session, SessionManager};
pub use realtime::{
    Interrupt, RealtimeConfig, SessionCallbacks, SpeechStart, TurnOutcome, Utterance,
};
