//! # Drift Corrector
//!
//! The engine's voice and the avatar video run on independent clocks. Buffer
//! occupancy is the proxy for how far they have drifted: a growing buffer means
//! audio is piling up behind the video, a shrinking one means video lags.
//!
//! ## Policy (drift = occupancy - ceil(target_latency / frame_duration)):
//! - **|drift| ≤ 1**: playback rate 1.0 (written only if it is not already 1.0)
//! - **drift > 2**: rate 0.98, slow the video so audio catches up
//! - **drift < -2**: rate 1.02, speed the video up
//! - **|drift| = 2**: dead zone, leave the rate alone (hysteresis)

use std::time::Duration;

/// Normal playback rate.
pub const RATE_NORMAL: f32 = 1.0;
/// Rate used while audio is behind the video.
pub const RATE_SLOW: f32 = 0.98;
/// Rate used while video is behind the audio.
pub const RATE_FAST: f32 = 1.02;

/// One occupancy measurement, local to a check.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DriftSample {
    pub buffer_occupancy: usize,
    pub target_occupancy: usize,
    pub timestamp: Duration,
}

impl DriftSample {
    pub fn drift(&self) -> i64 {
        self.buffer_occupancy as i64 - self.target_occupancy as i64
    }
}

/// Periodic playback-rate controller.
///
/// ## Timing:
/// `poll` is called frequently (every 100 ms by the session), but a check only
/// happens once `check_interval` of audio-clock time has elapsed since the last one.
#[derive(Debug)]
pub struct DriftCorrector {
    target_occupancy: usize,
    check_interval: Duration,
    last_check: Duration,
    current_rate: f32,
    last_sample: Option<DriftSample>,
}

impl DriftCorrector {
    /// Create a corrector whose first check happens `check_interval` after `started_at`.
    pub fn new(
        target_latency: Duration,
        frame_duration_ms: f64,
        check_interval: Duration,
        started_at: Duration,
    ) -> Self {
        let target_occupancy = (target_latency.as_secs_f64() * 1000.0 / frame_duration_ms).ceil() as usize;

        Self {
            target_occupancy,
            check_interval,
            last_check: started_at,
            current_rate: RATE_NORMAL,
            last_sample: None,
        }
    }

    /// Check occupancy if the interval has elapsed.
    ///
    /// ## Returns:
    /// - **Some(rate)**: the renderer's playback rate must be set to `rate`
    /// - **None**: not time yet, in the dead zone, or the rate is already right
    pub fn poll(&mut self, now: Duration, occupancy: usize) -> Option<f32> {
        if now.saturating_sub(self.last_check) < self.check_interval {
            return None;
        }
        self.last_check = now;

        let sample = DriftSample {
            buffer_occupancy: occupancy,
            target_occupancy: self.target_occupancy,
            timestamp: now,
        };
        self.last_sample = Some(sample);

        let wanted = match sample.drift() {
            d if d.abs() <= 1 => RATE_NORMAL,
            d if d > 2 => RATE_SLOW,
            d if d < -2 => RATE_FAST,
            _ => return None,
        };

        if wanted == self.current_rate {
            return None;
        }

        tracing::debug!(
            drift = sample.drift(),
            occupancy,
            at_ms = sample.timestamp.as_millis() as u64,
            from = self.current_rate,
            to = wanted,
            "Adjusting avatar playback rate"
        );
        self.current_rate = wanted;
        Some(wanted)
    }

    pub fn current_rate(&self) -> f32 {
        self.current_rate
    }

    pub fn target_occupancy(&self) -> usize {
        self.target_occupancy
    }

    pub fn last_sample(&self) -> Option<DriftSample> {
        self.last_sample
    }
}
