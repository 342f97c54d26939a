//! # Configuration Management
//!
//! This module handles loading and managing application configuration from multiple sources:
//! - TOML configuration files (config.toml)
//! - Environment variables (with APP_ prefix)
//! - Default values (built into the code)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. `HOST` / `PORT` (deployment platforms)
//! 2. Environment variables (`APP_SERVER__PORT`, `APP_VAD__START_THRESHOLD`, ...)
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impl)
//!
//! ## Sections:
//! - **server**: bind address
//! - **performance**: session limits and idle cleanup
//! - **audio**: expected input format and buffer cap
//! - **vad**: speech detection and barge-in tuning
//! - **turn**: downstream deadline and barge-in switch
//!
//! Sessions copy the relevant values when they are created, so runtime
//! updates only affect sessions created afterwards.

use crate::audio::processor::AudioConfig;
use crate::conversation::{InterruptConfig, SpeechTrackerConfig};
use crate::session::RealtimeConfig;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;

/// Main application configuration that contains all settings.
///
/// ## Why separate config structs:
/// Each section maps to one concern (transport, capacity, audio format,
/// detection tuning, turn handling) and to one table in config.toml.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub performance: PerformanceConfig,
    pub audio: AudioSettings,
    pub vad: VadSettings,
    pub turn: TurnSettings,
}

/// Server-specific configuration settings.
///
/// ## Common values:
/// - `host = "127.0.0.1"`: Only accept connections from localhost (development)
/// - `host = "0.0.0.0"`: Accept connections from any IP address (production)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Capacity and housekeeping.
///
/// ## Fields:
/// - `max_concurrent_sessions`: hard cap on live conversations
/// - `idle_timeout_seconds`: sessions without audio or control traffic for
///   this long are removed by the cleanup task
/// - `cleanup_interval_seconds`: how often the cleanup task runs
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PerformanceConfig {
    pub max_concurrent_sessions: usize,
    pub idle_timeout_seconds: u64,
    pub cleanup_interval_seconds: u64,
}

/// Expected client audio. Only mono PCM16 is accepted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AudioSettings {
    pub sample_rate: u32,
    pub channels: u8,
    pub bit_depth: u8,
    /// Rolling buffer cap per session.
    pub max_buffer_seconds: f64,
}

/// Speech detection tuning.
///
/// ## Tuning guidelines:
/// - `start_threshold` above `end_threshold` gives hysteresis; noisy rooms
///   want a wider gap
/// - longer `end_debounce_ms` tolerates pauses inside a sentence at the cost
///   of a slower turn hand-off
/// - barge-in uses its own, shorter debounce on raw energy
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VadSettings {
    /// RMS level mapped to speech probability 1.0.
    pub energy_reference: f32,
    pub start_threshold: f32,
    pub end_threshold: f32,
    pub start_debounce_ms: u64,
    pub end_debounce_ms: u64,
    pub interrupt_threshold: f32,
    pub interrupt_debounce_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TurnSettings {
    /// Deadline for STT → response → TTS before the turn is abandoned.
    pub processing_timeout_ms: u64,
    pub barge_in_enabled: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            performance: PerformanceConfig {
                max_concurrent_sessions: 10,
                idle_timeout_seconds: 300,
                cleanup_interval_seconds: 30,
            },
            audio: AudioSettings {
                sample_rate: 16_000,
                channels: 1,
                bit_depth: 16,
                max_buffer_seconds: 30.0,
            },
            vad: VadSettings {
                energy_reference: 0.1,
                start_threshold: 0.5,
                end_threshold: 0.35,
                start_debounce_ms: 150,
                end_debounce_ms: 300,
                interrupt_threshold: 0.05,
                interrupt_debounce_ms: 100,
            },
            turn: TurnSettings {
                processing_timeout_ms: 10_000,
                barge_in_enabled: true,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER__PORT=3000`: Override server port
    /// - `APP_VAD__END_DEBOUNCE_MS=500`: Wait longer before ending a turn
    /// - `APP_TURN__BARGE_IN_ENABLED=false`: Let the agent finish every reply
    /// - `HOST=0.0.0.0` / `PORT=3000`: Special cases for deployment platforms
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            // Nested keys use a double underscore so field names may contain one.
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// ## What this checks:
    /// - non-zero port, session limit, idle timeout and cleanup interval
    /// - mono 16-bit audio at a sane sample rate, positive buffer cap
    /// - probability thresholds in `[0, 1]` with `end_threshold <= start_threshold`
    /// - positive energy reference, interrupt threshold and processing deadline
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.performance.max_concurrent_sessions == 0 {
            return Err(anyhow::anyhow!("Max concurrent sessions must be greater than 0"));
        }
        if self.performance.idle_timeout_seconds == 0 {
            return Err(anyhow::anyhow!("Idle timeout must be greater than 0"));
        }
        if self.performance.cleanup_interval_seconds == 0 {
            return Err(anyhow::anyhow!("Cleanup interval must be greater than 0"));
        }

        if !(8_000..=48_000).contains(&self.audio.sample_rate) {
            return Err(anyhow::anyhow!(
                "Sample rate must be between 8000 and 48000 Hz, got {}",
                self.audio.sample_rate
            ));
        }
        if self.audio.channels != 1 {
            return Err(anyhow::anyhow!("Only mono audio is supported"));
        }
        if self.audio.bit_depth != 16 {
            return Err(anyhow::anyhow!("Only 16-bit PCM audio is supported"));
        }
        if self.audio.max_buffer_seconds <= 0.0 {
            return Err(anyhow::anyhow!("Max buffer seconds must be greater than 0"));
        }

        let vad = &self.vad;
        for (name, value) in [
            ("start_threshold", vad.start_threshold),
            ("end_threshold", vad.end_threshold),
            ("interrupt_threshold", vad.interrupt_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(anyhow::anyhow!("{} must be between 0 and 1, got {}", name, value));
            }
        }
        if vad.end_threshold > vad.start_threshold {
            return Err(anyhow::anyhow!(
                "end_threshold ({}) cannot exceed start_threshold ({})",
                vad.end_threshold,
                vad.start_threshold
            ));
        }
        if vad.energy_reference <= 0.0 {
            return Err(anyhow::anyhow!("Energy reference must be greater than 0"));
        }
        if vad.interrupt_threshold <= 0.0 {
            return Err(anyhow::anyhow!("Interrupt threshold must be greater than 0"));
        }

        if self.turn.processing_timeout_ms == 0 {
            return Err(anyhow::anyhow!("Processing timeout must be greater than 0"));
        }

        Ok(())
    }

    /// Update configuration from a JSON string (used for runtime config updates).
    ///
    /// ## Partial updates:
    /// Only the keys present are changed, e.g. `{"vad": {"end_debounce_ms": 500}}`.
    /// The result is validated before it replaces the current values; on
    /// error `self` is left untouched.
    pub fn update_from_json(&mut self, json_str: &str) -> Result<()> {
        let patch: serde_json::Value = serde_json::from_str(json_str)?;
        if !patch.is_object() {
            return Err(anyhow::anyhow!("Config update must be a JSON object"));
        }

        let mut merged = serde_json::to_value(&*self)?;
        merge_json(&mut merged, &patch);
        let updated: AppConfig = serde_json::from_value(merged)?;

        updated.validate()?;
        *self = updated;
        Ok(())
    }

    pub fn audio_format(&self) -> AudioConfig {
        AudioConfig::new(self.audio.sample_rate, self.audio.channels, self.audio.bit_depth)
    }

    /// Per-session tuning derived from this configuration.
    pub fn realtime_config(&self) -> RealtimeConfig {
        RealtimeConfig {
            sample_rate: self.audio.sample_rate,
            max_buffer_seconds: self.audio.max_buffer_seconds,
            energy_reference: self.vad.energy_reference,
            speech: SpeechTrackerConfig {
                start_threshold: self.vad.start_threshold,
                end_threshold: self.vad.end_threshold,
                start_debounce_ms: self.vad.start_debounce_ms,
                end_debounce_ms: self.vad.end_debounce_ms,
            },
            interrupt: InterruptConfig {
                enabled: self.turn.barge_in_enabled,
                energy_threshold: self.vad.interrupt_threshold,
                debounce_ms: self.vad.interrupt_debounce_ms,
            },
            processing_timeout_ms: self.turn.processing_timeout_ms,
        }
    }
}

/// Recursively overlay `patch` onto `base`. Unknown keys are kept and later
/// rejected by deserialization.
fn merge_json(base: &mut serde_json::Value, patch: &serde_json::Value) {
    match (base, patch) {
        (serde_json::Value::Object(base), serde_json::Value::Object(patch)) => {
            for (key, value) in patch {
                match base.get_mut(key) {
                    Some(existing) => merge_json(existing, value),
                    None => {
                        base.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base, patch) => *base = patch.clone(),
    }
}
