//! # Real-time audio output streaming pipeline
//!
//! Takes a continuous stream of PCM samples produced by an upstream mixer
//! (running on its own timing domain) and delivers them to an audio sink in
//! fixed-size buffers, without dropouts, while optionally performing
//! multichannel surround matrix-decoding and sample-rate-independent
//! time-stretching.
//!
//! **Architecture:** a dedicated streaming thread per session reconciles three
//! independently-clocked domains: the mixer's production rate, the surround
//! decoder's fixed block size, and the device's buffer-consumption rate.
//!
//! Pipeline: `Mixer` → [`TimeStretcher`] (optional) →
//! [`SurroundMatrixDecoder`] (optional) → format conversion → device buffer →
//! [`AudioSink`].
//!
//! Once [`StreamScheduler::start`] succeeds the pipeline is self-healing:
//! encoding rejections degrade and retry, mixer starvation skips an
//! iteration, and playback stalls reissue a play command. Nothing after a
//! successful start is surfaced to the caller except through logs.

pub mod config;
pub mod convert;
pub mod error;
pub mod mixer;
pub mod scheduler;
pub mod sink;
pub mod stretch;
pub mod surround;
pub mod types;

pub use config::{StreamConfig, WakePolicy};
pub use error::{Error, Result};
pub use mixer::Mixer;
pub use scheduler::{SchedulerState, StreamScheduler};
pub use sink::{AudioSink, CpalSink, SinkCaps, SinkError};
pub use stretch::TimeStretcher;
pub use surround::SurroundMatrixDecoder;
pub use types::{ChannelLayout, OutputEncoding, SampleData};
