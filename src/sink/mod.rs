//! Audio sink interface
//!
//! The sink owns the device buffers and playback state; the scheduler owns
//! the accounting. The trait keeps the queue/processed-count model of
//! buffer-queuing device APIs so real backends map onto it 1:1, and the
//! shipped [`CpalSink`] adapts it to a callback-driven host API.
//!
//! Backend selection (and any dynamic loading of a native audio library) is
//! outside this crate; callers hand the scheduler a ready sink chosen at
//! startup from its capability probe.

mod cpal_sink;

pub use cpal_sink::CpalSink;

use thiserror::Error;

use crate::types::{ChannelLayout, OutputEncoding, SampleData, SessionParams};

/// Sink-level error taxonomy.
///
/// Only `Open` ever reaches the caller (through `start()`); the rest are
/// handled inside the streaming loop.
#[derive(Error, Debug)]
pub enum SinkError {
    /// Device or session could not be opened
    #[error("device open failed: {0}")]
    Open(String),

    /// The queued buffer's sample encoding was rejected by the device.
    ///
    /// The scheduler reacts by permanently downgrading the session encoding
    /// and retrying the same frame data.
    #[error("sample encoding rejected by device")]
    EncodingRejected,

    /// Transient queue failure; the scheduler drops the buffer and moves on
    #[error("queue error: {0}")]
    Queue(String),
}

/// Capability probe result, gathered before the session is opened.
#[derive(Debug, Clone)]
pub struct SinkCaps {
    /// Sample encodings the device accepts
    pub encodings: Vec<OutputEncoding>,

    /// Channel layouts the device accepts
    pub layouts: Vec<ChannelLayout>,
}

impl SinkCaps {
    pub fn supports_encoding(&self, encoding: OutputEncoding) -> bool {
        self.encodings.contains(&encoding)
    }

    pub fn supports_layout(&self, layout: ChannelLayout) -> bool {
        self.layouts.contains(&layout)
    }
}

/// Device-side half of the streaming pipeline.
///
/// All methods are called from the streaming thread once the session is
/// running; `probe` and `open` may also run on the caller's thread during
/// `start()`.
pub trait AudioSink: Send {
    /// Report what the device can accept. Called before `open`.
    fn probe(&self) -> SinkCaps;

    /// Open a device session: allocate `pool_size` buffers per source and
    /// prepare each source for queuing.
    fn open(&mut self, params: &SessionParams) -> Result<(), SinkError>;

    /// Tear the session down, releasing buffers and the device.
    fn close(&mut self);

    /// Queue one filled buffer on `source`.
    ///
    /// The scheduler guarantees at most `pool_size` buffers are in flight
    /// per source; a sink may treat overflow as a `Queue` error.
    fn queue(&mut self, source: usize, data: SampleData<'_>, sample_rate: u32)
        -> Result<(), SinkError>;

    /// Return buffers the device has finished playing to the free pool,
    /// reporting how many were reclaimed.
    fn reclaim_processed(&mut self, source: usize) -> usize;

    /// Begin or resume playback on `source`.
    fn play(&mut self, source: usize) -> Result<(), SinkError>;

    /// Halt playback on `source` without releasing its buffers.
    fn pause(&mut self, source: usize);

    /// Whether `source` is currently playing. A `false` while buffers are
    /// queued means the device starved and playback must be reissued.
    fn is_playing(&self, source: usize) -> bool;

    /// Per-source gain, 0.0–1.0. Applies to buffers queued after the call,
    /// never retroactively to buffers already in flight.
    fn set_gain(&mut self, source: usize, gain: f32);

    /// Device-level playback rate control (1.0 = nominal). Used instead of
    /// time-stretching when stretch mode is off.
    fn set_pitch(&mut self, source: usize, pitch: f32);

    /// Drop everything queued on `source` and reset its cursor, keeping the
    /// session open. Used when a source's sample rate changes mid-session.
    fn reset_source(&mut self, source: usize);
}
