//! Audio clock used to timestamp captured frames.

use std::time::{Duration, Instant};

/// Monotonic time source for the audio graph.
///
/// The pipeline only ever compares readings of the same clock, so the origin
/// is arbitrary.
pub trait AudioClock: Send + Sync {
    fn now(&self) -> Duration;
}

/// Clock that starts at zero when created.
#[derive(Debug, Clone)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self { origin: Instant::now() }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioClock for MonotonicClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_is_monotonic() {
        let clock = MonotonicClock::new();
        let first = clock.now();
        let second = clock.now();
        assert!(second >= first);
    }
}
