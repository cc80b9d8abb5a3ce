//! # Audio Sync Module
//!
//! Real-time path from the engine's remote voice track to the avatar renderer.
//! Everything in here is synchronous and bounded per frame; nothing awaits I/O.
//!
//! ## Key Components:
//! - **Processor**: RMS silence gate, adaptive gain, 16-bit quantization
//! - **Buffer**: timestamp-ordered jitter buffer with paced release
//! - **Drift**: occupancy-based playback-rate correction for lip-sync
//! - **Pipeline**: the stages wired together for one bound track
//! - **Clock**: monotonic audio clock that timestamps captured frames
//!
//! ## Audio Format:
//! - **Input**: f32 mono frames, 512 samples at 16 kHz (32 ms)
//! - **Output**: i16 little-endian PCM for the renderer

pub mod buffer;       // Jitter buffer and pacer
pub mod clock;        // Audio clock
pub mod drift;        // Drift corrector
pub mod pipeline;     // Stage wiring
pub mod processor;    // Gate, gain, quantizer
