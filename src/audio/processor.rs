//! # Audio Decoding and Voice Activity Analysis
//!
//! Turns raw ingress payloads into `AudioChunk`s and scores each chunk for
//! voice activity.
//!
//! ## Key Functions:
//! - **Format validation**: the client-declared format must match the server's
//! - **PCM decoding**: 16-bit little-endian PCM → normalized `f32`
//! - **Voice activity**: a `VoiceActivityDetector` produces one `VadSample`
//!   per chunk. The acoustic model is an external concern; `EnergyVad` is the
//!   built-in RMS detector used when nothing better is plugged in.

use crate::audio::buffer::AudioChunk;
use crate::error::AudioFormatError;
use byteorder::{LittleEndian, ReadBytesExt};
use serde::{Deserialize, Serialize};
use std::io::Cursor;

/// Audio format declared by a client when it opens a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioConfig {
    pub sample_rate: u32,
    pub channels: u8,
    pub bit_depth: u8,
}

impl AudioConfig {
    pub fn new(sample_rate: u32, channels: u8, bit_depth: u8) -> Self {
        Self {
            sample_rate,
            channels,
            bit_depth,
        }
    }

    /// Check a declared format against what the server accepts.
    pub fn ensure_matches(&self, expected: &AudioConfig) -> Result<(), AudioFormatError> {
        if self.sample_rate != expected.sample_rate {
            return Err(AudioFormatError::SampleRateMismatch {
                expected: expected.sample_rate,
                actual: self.sample_rate,
            });
        }
        if self.channels != expected.channels {
            return Err(AudioFormatError::Unsupported(format!(
                "expected {} channel(s), got {}",
                expected.channels, self.channels
            )));
        }
        if self.bit_depth != expected.bit_depth {
            return Err(AudioFormatError::Unsupported(format!(
                "expected {}-bit samples, got {}-bit",
                expected.bit_depth, self.bit_depth
            )));
        }
        Ok(())
    }
}

/// Decode a PCM16 LE payload into normalized samples.
pub fn decode_pcm16(data: &[u8]) -> Result<Vec<f32>, AudioFormatError> {
    if data.is_empty() {
        return Err(AudioFormatError::Empty);
    }
    if data.len() % 2 != 0 {
        return Err(AudioFormatError::OddByteLength(data.len()));
    }

    let mut cursor = Cursor::new(data);
    let mut samples = Vec::with_capacity(data.len() / 2);
    while let Ok(sample) = cursor.read_i16::<LittleEndian>() {
        samples.push(sample as f32 / 32768.0);
    }
    Ok(samples)
}

/// Encode normalized samples as PCM16 LE (outgoing agent audio).
pub fn encode_pcm16(samples: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        let scaled = (sample * 32768.0).clamp(-32768.0, 32767.0) as i16;
        out.extend_from_slice(&scaled.to_le_bytes());
    }
    out
}

/// Root-mean-square level of a block of samples, `0.0` for an empty block.
pub fn rms_energy(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f64 = samples.iter().map(|&s| (s as f64) * (s as f64)).sum();
    (sum / samples.len() as f64).sqrt() as f32
}

/// Per-chunk voice activity measurement.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VadSample {
    pub timestamp: f64,
    /// 0.0..=1.0
    pub speech_probability: f32,
    pub energy: f32,
}

impl VadSample {
    pub fn new(timestamp: f64, speech_probability: f32, energy: f32) -> Self {
        Self {
            timestamp,
            speech_probability: speech_probability.clamp(0.0, 1.0),
            energy,
        }
    }
}

/// Scores a chunk for speech. Implementations may keep model state, so
/// `analyze` takes `&mut self`; each session owns its own detector.
pub trait VoiceActivityDetector: Send {
    fn analyze(&mut self, chunk: &AudioChunk) -> VadSample;
}

/// RMS energy detector: probability is energy relative to `reference_rms`,
/// saturating at 1.0.
#[derive(Debug, Clone)]
pub struct EnergyVad {
    reference_rms: f32,
}

impl EnergyVad {
    pub fn new(reference_rms: f32) -> Self {
        Self {
            reference_rms: reference_rms.max(f32::EPSILON),
        }
    }
}

impl VoiceActivityDetector for EnergyVad {
    fn analyze(&mut self, chunk: &AudioChunk) -> VadSample {
        let energy = rms_energy(chunk.samples());
        VadSample::new(chunk.timestamp(), energy / self.reference_rms, energy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_pcm16() {
        let mut data = Vec::new();
        for sample in [0i16, 16384, -16384, -32768] {
            data.extend_from_slice(&sample.to_le_bytes());
        }
        let samples = decode_pcm16(&data).unwrap();
        assert_eq!(samples, vec![0.0, 0.5, -0.5, -1.0]);

        assert_eq!(decode_pcm16(&[]), Err(AudioFormatError::Empty));
        assert_eq!(decode_pcm16(&[0u8; 15]), Err(AudioFormatError::OddByteLength(15)));
    }

    #[test]
    fn test_pcm_encoding_is_close_to_input() {
        let samples = vec![0.0f32, 0.25, -0.75, 0.999];
        let decoded = decode_pcm16(&encode_pcm16(&samples)).unwrap();
        for (original, converted) in samples.iter().zip(decoded.iter()) {
            assert!((original - converted).abs() < 1e-3, "{} vs {}", original, converted);
        }
    }

    #[test]
    fn test_declared_format_validation() {
        let expected = AudioConfig::new(16000, 1, 16);
        assert!(AudioConfig::new(16000, 1, 16).ensure_matches(&expected).is_ok());
        assert!(matches!(
            AudioConfig::new(44100, 1, 16).ensure_matches(&expected),
            Err(AudioFormatError::SampleRateMismatch { expected: 16000, actual: 44100 })
        ));
        assert!(AudioConfig::new(16000, 2, 16).ensure_matches(&expected).is_err());
    }

    #[test]
    fn test_energy_vad_scores_loud_and_silent_chunks() {
        let mut vad = EnergyVad::new(0.1);

        let silent = vad.analyze(&AudioChunk::new(1.5, vec![0.0; 160], 16000));
        assert_eq!(silent.timestamp, 1.5);
        assert_eq!(silent.speech_probability, 0.0);

        let loud = vad.analyze(&AudioChunk::new(1.6, vec![0.5; 160], 16000));
        assert!((loud.energy - 0.5).abs() < 1e-6);
        assert_eq!(loud.speech_probability, 1.0);

        let quiet = vad.analyze(&AudioChunk::new(1.7, vec![0.05; 160], 16000));
        assert!((quiet.speech_probability - 0.5).abs() < 1e-4);
    }
}
