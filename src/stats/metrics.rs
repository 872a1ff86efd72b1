//! Counters kept by the relay tasks and the coordinator
//!
//! Each counter set is owned by a single task, so plain integers suffice.
//! They are returned when the task ends and logged during teardown.

use std::time::{Duration, Instant};

/// Per-channel relay statistics
#[derive(Debug, Clone)]
pub struct RelayStats {
    /// Channel the relay served
    pub channel: String,
    /// When the relay started
    pub started_at: Instant,
    /// Encoded chunks read from the encoder
    pub chunks: u64,
    /// Encoded bytes read from the encoder
    pub bytes: u64,
    /// Chunk deliveries to viewers (one chunk to three viewers counts three)
    pub deliveries: u64,
    /// Viewers dropped after a failed send
    pub dropped_subscribers: u64,
}

impl RelayStats {
    pub fn new(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            started_at: Instant::now(),
            chunks: 0,
            bytes: 0,
            deliveries: 0,
            dropped_subscribers: 0,
        }
    }

    /// Get duration since the relay started
    pub fn duration(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Average encoder output rate in bits per second
    pub fn bitrate(&self) -> u64 {
        let secs = self.duration().as_secs();
        if secs > 0 {
            (self.bytes * 8) / secs
        } else {
            0
        }
    }
}

/// Output coordinator statistics
#[derive(Debug, Clone, Default)]
pub struct CoordinatorStats {
    /// Metadata items dequeued
    pub frames: u64,
    /// Frames whose buffer was missing
    pub missing_frames: u64,
    /// Frames for cameras that are not configured
    pub unknown_cameras: u64,
    /// Raw frames written to encoders, birdseye included
    pub encoder_writes: u64,
    /// Birdseye updates that produced a new composite
    pub birdseye_updates: u64,
    /// Buffers released, during the loop and the shutdown drain
    pub released: u64,
    /// Buffers whose release failed
    pub release_errors: u64,
}

impl CoordinatorStats {
    pub fn new() -> Self {
        Self::default()
    }
}
