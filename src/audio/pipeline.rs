//! # Sync Pipeline
//!
//! Wires the stages between the bound remote voice track and the avatar renderer:
//!
//! ```text
//! track frame ─▶ gate ─▶ normalizer/quantizer ─▶ jitter buffer ─▶ pacer ─▶ renderer
//!                                                      │
//!                                  drift corrector ◀───┘ (occupancy)
//! ```
//!
//! The pipeline is pure bookkeeping: it returns the frames to send and the
//! playback rate to apply, and the session controller talks to the renderer.

use crate::audio::buffer::JitterBuffer;
use crate::audio::clock::AudioClock;
use crate::audio::drift::{DriftCorrector, DriftSample};
use crate::audio::processor::{AudioFrame, AudioProcessor};
use crate::config::AppConfig;
use std::sync::Arc;
use std::time::Duration;

/// Frame counters reported when the pipeline is torn down.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct PipelineStats {
    pub frames_captured: u64,
    pub frames_gated: u64,
    pub frames_released: u64,
}

pub struct SyncPipeline {
    processor: AudioProcessor,
    buffer: JitterBuffer,
    drift: DriftCorrector,
    clock: Arc<dyn AudioClock>,
    stats: PipelineStats,
}

impl SyncPipeline {
    /// Build the pipeline; the drift corrector's first check is one interval from now.
    pub fn new(config: &AppConfig, clock: Arc<dyn AudioClock>) -> Self {
        let buffer = JitterBuffer::new(Duration::from_millis(config.sync.target_latency_ms));
        let drift = DriftCorrector::new(
            buffer.target_latency(),
            config.audio.frame_duration_ms(),
            Duration::from_millis(config.sync.drift_check_interval_ms),
            clock.now(),
        );

        Self {
            processor: AudioProcessor::new(&config.audio),
            buffer,
            drift,
            clock,
            stats: PipelineStats::default(),
        }
    }

    /// Handle one captured frame: gate, quantize, buffer, then release what is due.
    ///
    /// ## Returns:
    /// Frames ready for the renderer, in capture order. A silent frame is never
    /// among them, but its arrival still releases older frames that are due.
    pub fn on_frame(&mut self, samples: &[f32]) -> Vec<AudioFrame> {
        let now = self.clock.now();
        self.stats.frames_captured += 1;

        match self.processor.process_frame(samples, now) {
            Some(frame) => self.buffer.push(frame),
            None => self.stats.frames_gated += 1,
        }

        self.release(now)
    }

    /// Scheduled trigger: release due frames without new input.
    pub fn tick(&mut self) -> Vec<AudioFrame> {
        let now = self.clock.now();
        self.release(now)
    }

    /// Run the drift check against the current occupancy.
    pub fn check_drift(&mut self) -> Option<f32> {
        let now = self.clock.now();
        self.drift.poll(now, self.buffer.len())
    }

    /// Measurement taken by the most recent drift check.
    pub fn last_drift_sample(&self) -> Option<DriftSample> {
        self.drift.last_sample()
    }

    pub fn target_latency(&self) -> Duration {
        self.buffer.target_latency()
    }

    pub fn occupancy(&self) -> usize {
        self.buffer.len()
    }

    pub fn playback_rate(&self) -> f32 {
        self.drift.current_rate()
    }

    pub fn stats(&self) -> PipelineStats {
        self.stats
    }

    /// Drop buffered frames; called when the audio graph is disconnected.
    pub fn disconnect(&mut self) {
        self.buffer.clear();
    }

    fn release(&mut self, now: Duration) -> Vec<AudioFrame> {
        let released = self.buffer.release_due(now);
        self.stats.frames_released += released.len() as u64;
        released
    }
}
