//! Streaming session configuration
//!
//! Consumed, not owned: loading and persistence are the caller's concern.
//! The struct is read once at `start()`; runtime volume and mute changes go
//! through the scheduler's atomic setters instead.

use crate::types::ChannelLayout;
use serde::{Deserialize, Serialize};

/// How the streaming thread waits when every device buffer is queued.
///
/// Platform-dependent policy, not a correctness requirement: `Event` blocks
/// on a wake condition with a bounded timeout, `Spin` busy-waits with a
/// bounded (≤1 ms) sleep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum WakePolicy {
    /// Block on a condition variable, woken by `notify_data_available()`
    #[default]
    Event,

    /// Sleep-poll in 1 ms steps
    Spin,
}

/// Streaming pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Desired output latency in milliseconds.
    ///
    /// Drives both frames-per-buffer and the buffer pool size.
    pub latency_ms: u32,

    /// Decode the mixer's stereo output into `surround_layout` when the sink
    /// supports it. Falls back to stereo when it does not.
    pub enable_surround: bool,

    /// Layout requested when surround decoding is enabled
    pub surround_layout: ChannelLayout,

    /// Absorb emulation-speed deviation by time-stretching instead of
    /// device-level pitch control
    pub enable_time_stretch: bool,

    /// Initial volume, 0–100
    pub volume: u8,

    /// Wait policy when no device buffer is free
    pub wake_policy: WakePolicy,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            latency_ms: 20,
            enable_surround: false,
            surround_layout: ChannelLayout::Surround51,
            enable_time_stretch: false,
            volume: 100,
            wake_policy: WakePolicy::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_stereo_and_full_volume() {
        let config = StreamConfig::default();
        assert_eq!(config.latency_ms, 20);
        assert!(!config.enable_surround);
        assert!(!config.enable_time_stretch);
        assert_eq!(config.volume, 100);
        assert_eq!(config.wake_policy, WakePolicy::Event);
    }
}
