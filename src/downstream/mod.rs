//! Downstream turn processing: collaborator traits and the pipeline that
//! drives them for each handed-off utterance.

pub mod collaborators;
pub mod pipeline;

pub use pipeline::{DownstreamPipeline, TurnResult};
