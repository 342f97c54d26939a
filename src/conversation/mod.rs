//! # Conversation Turn-Taking
//!
//! The decision layer that sits between raw audio and the session:
//!
//! - **speech**: debounced speech start/end from VAD samples
//! - **interrupt**: barge-in detection while the agent talks
//! - **state_machine**: legal conversation state transitions
//! - **stats**: per-session counters and latency samples
//!
//! Everything here is synchronous and clock-free; time only enters through
//! sample timestamps.

pub mod interrupt;
pub mod speech;
pub mod state_machine;
pub mod stats;

pub use interrupt::{BargeIn, InterruptConfig, InterruptDetector};
pub use speech::{SpeechActivityTracker, SpeechEvent, SpeechState, SpeechTrackerConfig};
pub use state_machine::{ConversationEvent, ConversationState, ConversationStateMachine, Transition};
pub use stats::{SessionStats, StatsSnapshot};
