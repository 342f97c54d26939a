//! # Audio Module
//!
//! Per-session audio storage and ingress decoding.
//!
//! ## Key Components:
//! - **AudioBuffer**: duration-capped rolling buffer of timestamped chunks
//! - **Processor**: PCM16 decode/encode, declared-format checks, voice activity scoring
//!
//! ## Audio Format Requirements:
//! - **Sample Rate**: configured per deployment (16kHz by default)
//! - **Bit Depth**: 16-bit PCM
//! - **Channels**: Mono
//! - **Encoding**: Little-endian signed integers

pub mod buffer;
pub mod processor;
