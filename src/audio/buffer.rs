//! # Jitter Buffer and Pacer
//!
//! Holds quantized frames between the normalizer and the avatar renderer so the
//! renderer receives a steady stream even when capture callbacks arrive unevenly.
//!
//! ## Key Features:
//! - **Timestamp order**: frames are kept sorted by capture time (normally a plain append)
//! - **Paced release**: a frame leaves only once it has aged `target_latency`
//! - **Strict FIFO**: the head blocks everything behind it, nothing is released early or reordered
//! - **Occupancy**: the buffer length is the drift corrector's input signal

use crate::audio::processor::AudioFrame;
use std::collections::VecDeque;
use std::time::Duration;

/// Timestamp-ordered queue of frames waiting for their release time.
///
/// ## Concurrency:
/// Owned by a single session actor; capture, release and drift checks all run
/// on that actor, so no lock is needed.
#[derive(Debug)]
pub struct JitterBuffer {
    frames: VecDeque<AudioFrame>,
    target_latency: Duration,
}

impl JitterBuffer {
    /// Create an empty buffer releasing frames after `target_latency`.
    pub fn new(target_latency: Duration) -> Self {
        Self {
            frames: VecDeque::new(),
            target_latency,
        }
    }

    /// Append a frame at the tail.
    ///
    /// ## Ordering:
    /// Capture is sequential, so this is almost always a `push_back`. A frame
    /// that arrives late is slotted in by its capture time so release order
    /// still equals capture order.
    pub fn push(&mut self, frame: AudioFrame) {
        let in_order = self
            .frames
            .back()
            .map_or(true, |last| last.captured_at <= frame.captured_at);

        if in_order {
            self.frames.push_back(frame);
        } else {
            let index = self
                .frames
                .partition_point(|queued| queued.captured_at <= frame.captured_at);
            self.frames.insert(index, frame);
        }
    }

    /// Release every head frame whose age has reached the target latency.
    ///
    /// ## Returns:
    /// Frames in capture order; empty if the head is still too young.
    pub fn release_due(&mut self, now: Duration) -> Vec<AudioFrame> {
        let mut released = Vec::new();

        while let Some(head) = self.frames.front() {
            if now.saturating_sub(head.captured_at) < self.target_latency {
                break;
            }
            if let Some(frame) = self.frames.pop_front() {
                released.push(frame);
            }
        }

        released
    }

    /// Number of frames currently buffered.
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// Check if the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn target_latency(&self) -> Duration {
        self.target_latency
    }

    /// Drop every buffered frame (teardown).
    pub fn clear(&mut self) {
        self.frames.clear();
    }
}
