//! Mixer interface consumed by the streaming thread
//!
//! The mixer is an external collaborator running on the emulation's timing
//! domain. It resamples and synthesizes its internal channels on demand; the
//! streaming thread only ever pulls interleaved stereo i16 frames from it.

/// Thread-safe pull interface to the upstream sample producer.
///
/// Implementations must be safe for concurrent calls from the streaming
/// thread while being fed from the emulation thread; neither side may block
/// the other beyond the mixer's own internal synchronization.
///
/// Producing fewer frames than requested is *not* an error: during boot
/// silence the mixer legitimately has nothing to deliver, and the scheduler
/// skips that iteration.
pub trait Mixer: Send + Sync {
    /// Fill `out` with up to `frames` interleaved stereo frames.
    ///
    /// Returns the number of frames actually produced. `out` must hold at
    /// least `frames * 2` samples.
    fn mix(&self, out: &mut [i16], frames: usize) -> usize;

    /// Current sample rate of the primary mix, in Hz
    fn sample_rate(&self) -> u32;

    /// Current emulation speed relative to nominal (1.0 = full speed)
    fn current_speed(&self) -> f64;

    /// Number of discrete sub-stream sources.
    ///
    /// Most mixers blend everything into one stereo stream; mixers backed by
    /// multiple hardware sample sources with independent rates report each
    /// one here and serve them through [`mix_source`].
    ///
    /// [`mix_source`]: Mixer::mix_source
    fn source_count(&self) -> usize {
        1
    }

    /// Pull frames for one discrete source. Source 0 is the primary mix.
    fn mix_source(&self, source: usize, out: &mut [i16], frames: usize) -> usize {
        debug_assert_eq!(source, 0, "default mixers expose a single source");
        self.mix(out, frames)
    }

    /// Sample rate of one discrete source.
    ///
    /// May change mid-session (the emulated hardware can be reprogrammed);
    /// the scheduler detects the change and resets that source's queue.
    fn source_sample_rate(&self, source: usize) -> u32 {
        debug_assert_eq!(source, 0, "default mixers expose a single source");
        self.sample_rate()
    }
}
