//! # Silence Gate, Gain Normalizer and Quantizer
//!
//! First stage of the sync pipeline. Every frame captured from the remote voice
//! track passes through here before it is buffered for the avatar renderer.
//!
//! ## Key Functions:
//! - **Silence gate**: frames whose RMS energy is below the threshold are dropped
//! - **Adaptive gain**: quiet speech is lifted towards a target RMS, capped by a maximum gain
//! - **Quantization**: float samples in [-1, 1] become signed 16-bit PCM
//! - **Wire conversion**: little-endian encode/decode for the session socket

use crate::config::AudioConfig;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;
use std::time::Duration;

/// One quantized frame ready for the jitter buffer.
///
/// ## Fields:
/// - **samples**: 16-bit PCM, same length as the captured frame
/// - **captured_at**: audio-clock time when the frame was captured
/// - **gain**: gain that was applied (always ≤ the configured maximum)
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    pub samples: Vec<i16>,
    pub captured_at: Duration,
    pub gain: f32,
}

/// Gate + normalizer + quantizer for float PCM frames.
pub struct AudioProcessor {
    silence_threshold: f32,
    target_rms: f32,
    max_gain: f32,
}

impl AudioProcessor {
    /// Create a new audio processor with the given configuration.
    pub fn new(config: &AudioConfig) -> Self {
        Self {
            silence_threshold: config.silence_threshold,
            target_rms: config.target_rms,
            max_gain: config.max_gain,
        }
    }

    /// Run one captured frame through the gate and the normalizer.
    ///
    /// ## Returns:
    /// - **None**: the frame is silent (RMS below threshold) and must not be transmitted
    /// - **Some(frame)**: quantized samples tagged with the original capture time
    pub fn process_frame(&self, samples: &[f32], captured_at: Duration) -> Option<AudioFrame> {
        if samples.is_empty() {
            return None;
        }

        let rms = rms(samples);
        if rms < self.silence_threshold {
            return None;
        }

        let gain = self.gain_for(rms);
        let quantized = samples
            .iter()
            .map(|&sample| quantize((sample * gain).clamp(-1.0, 1.0)))
            .collect();

        Some(AudioFrame {
            samples: quantized,
            captured_at,
            gain,
        })
    }

    /// gain = min(target_rms / rms, max_gain), unity for a zero-energy frame.
    fn gain_for(&self, rms: f32) -> f32 {
        if rms > 0.0 {
            (self.target_rms / rms).min(self.max_gain)
        } else {
            1.0
        }
    }
}

/// Root-mean-square energy of a frame.
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }

    let sum_squares: f32 = samples.iter().map(|&s| s * s).sum();
    (sum_squares / samples.len() as f32).sqrt()
}

/// Asymmetric scaling: negatives use the full 32768 range, positives stop at 32767.
pub fn quantize(sample: f32) -> i16 {
    if sample < 0.0 {
        (sample * 32768.0) as i16
    } else {
        (sample * 32767.0) as i16
    }
}

/// Decode little-endian f32 samples sent by the client.
///
/// ## Error Handling:
/// Payloads that are empty or not a multiple of 4 bytes are rejected.
pub fn decode_f32_le(data: &[u8]) -> Result<Vec<f32>, String> {
    if data.is_empty() {
        return Err("Audio data is empty".to_string());
    }
    if data.len() % 4 != 0 {
        return Err("Audio data length must be a multiple of 4 for f32 samples".to_string());
    }

    let mut cursor = Cursor::new(data);
    let mut samples = Vec::with_capacity(data.len() / 4);
    while let Ok(sample) = cursor.read_f32::<LittleEndian>() {
        samples.push(sample);
    }
    Ok(samples)
}

/// Encode 16-bit PCM as little-endian bytes for the renderer.
pub fn encode_i16_le(samples: &[i16]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        // Writing into a Vec cannot fail
        let _ = bytes.write_i16::<LittleEndian>(sample);
    }
    bytes
}
