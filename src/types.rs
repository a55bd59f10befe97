//! Core session data types
//!
//! Channel layouts, output sample encodings, and the per-session parameters
//! negotiated once at device open. All of these are immutable for the
//! lifetime of a streaming session; changing a layout requires session
//! teardown and reinit.

use serde::{Deserialize, Serialize};

/// Speaker layout of a streaming session.
///
/// Fixes both the channel count and the channel-to-speaker-position mapping.
/// Non-stereo layouts are synthesized from the mixer's stereo output by the
/// surround matrix decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelLayout {
    /// Plain 2-channel stereo, straight from the mixer
    Stereo,

    /// 5.1 surround: FL, FR, FC, LFE, BL, BR
    Surround51,

    /// 7.1 surround: FL, FR, FC, LFE, BL, BR, SL, SR
    Surround71,

    /// 16-speaker virtual layout used for HRTF spatialization
    Hrtf16,
}

impl ChannelLayout {
    /// Number of interleaved channels per frame
    pub fn channels(self) -> usize {
        match self {
            ChannelLayout::Stereo => 2,
            ChannelLayout::Surround51 => 6,
            ChannelLayout::Surround71 => 8,
            ChannelLayout::Hrtf16 => 16,
        }
    }

    /// Whether frames of this layout come out of the matrix decoder
    pub fn is_decoded(self) -> bool {
        !matches!(self, ChannelLayout::Stereo)
    }
}

/// Sample encoding negotiated with the sink at session start.
///
/// Selected once from the sink's capability probe and never changed
/// mid-session, except on a detected format-rejection error, in which case
/// the scheduler degrades to the next-safer encoding via [`downgrade`] and
/// continues.
///
/// [`downgrade`]: OutputEncoding::downgrade
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutputEncoding {
    /// 16-bit signed integer samples (the mixer's native format)
    Int16,

    /// 32-bit signed fixed-point samples
    Int32Fixed,

    /// 32-bit IEEE float samples
    Float32,
}

impl OutputEncoding {
    /// Preference order used when probing sink capabilities at session start.
    pub const PREFERENCE: [OutputEncoding; 3] = [
        OutputEncoding::Float32,
        OutputEncoding::Int32Fixed,
        OutputEncoding::Int16,
    ];

    /// Next-safer encoding to fall back to after a format rejection.
    ///
    /// Returns `None` once at `Int16`, which every sink must accept.
    pub fn downgrade(self) -> Option<OutputEncoding> {
        match self {
            OutputEncoding::Float32 => Some(OutputEncoding::Int32Fixed),
            OutputEncoding::Int32Fixed => Some(OutputEncoding::Int16),
            OutputEncoding::Int16 => None,
        }
    }
}

/// Borrowed view of one filled device buffer, tagged with its encoding.
///
/// Samples are interleaved in the session's channel layout.
#[derive(Debug, Clone, Copy)]
pub enum SampleData<'a> {
    Int16(&'a [i16]),
    Int32(&'a [i32]),
    Float32(&'a [f32]),
}

impl SampleData<'_> {
    /// Encoding of the carried samples
    pub fn encoding(&self) -> OutputEncoding {
        match self {
            SampleData::Int16(_) => OutputEncoding::Int16,
            SampleData::Int32(_) => OutputEncoding::Int32Fixed,
            SampleData::Float32(_) => OutputEncoding::Float32,
        }
    }

    /// Total sample count (all channels interleaved)
    pub fn len(&self) -> usize {
        match self {
            SampleData::Int16(s) => s.len(),
            SampleData::Int32(s) => s.len(),
            SampleData::Float32(s) => s.len(),
        }
    }

    /// Whether the buffer carries no samples
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Parameters of one sink source within a session.
///
/// The stereo path may drive several discrete sources with independent
/// sample rates; the surround path always drives exactly one.
#[derive(Debug, Clone, Copy)]
pub struct SourceParams {
    /// Input sample rate of this source
    pub sample_rate: u32,

    /// Channel layout queued on this source
    pub layout: ChannelLayout,

    /// Frames held by one device buffer of this source
    pub frames_per_buffer: usize,
}

/// Everything the sink needs to open a device session.
#[derive(Debug, Clone)]
pub struct SessionParams {
    /// One entry per sink source
    pub sources: Vec<SourceParams>,

    /// Device buffers allocated per source
    pub pool_size: usize,

    /// Initially negotiated sample encoding
    pub encoding: OutputEncoding,
}
