//! cpal-backed audio sink
//!
//! Adapts the buffer-queue sink contract onto cpal's callback-driven host
//! API: queued buffers are pushed into a lock-free ring, the device callback
//! drains it, and the consumed-sample counter drives the processed-buffer
//! accounting. Gain is applied while copying into the ring, which is what
//! gives `set_gain` its queued-after-the-call semantics.
//!
//! Supports a single stereo source; multi-source mixers need a backend with
//! real per-source queues.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, Stream, StreamConfig};
use ringbuf::{
    traits::{Consumer, Observer, Producer, Split},
    HeapCons, HeapProd, HeapRb,
};
use tracing::{debug, error, info, warn};

use super::{AudioSink, SinkCaps, SinkError};
use crate::types::{ChannelLayout, OutputEncoding, SampleData, SessionParams};

/// Callback-side scratch size in samples
const CALLBACK_CHUNK: usize = 4096;

/// State shared with the device callback
struct Shared {
    /// Total f32 samples the callback has consumed from the ring
    consumed: AtomicUsize,

    /// Set by the callback when it ran dry while playback was expected
    starved: AtomicBool,

    playing: AtomicBool,
}

struct OpenSession {
    stream_config: StreamConfig,
    sample_format: SampleFormat,
}

/// Audio sink backed by a cpal output device.
pub struct CpalSink {
    device: Device,
    stream: Option<Stream>,
    session: Option<OpenSession>,
    shared: Arc<Shared>,

    producer: Option<HeapProd<f32>>,
    /// Consumer parked here between `open` and the first `play`
    pending_consumer: Option<HeapCons<f32>>,

    /// Sample length of each in-flight buffer, oldest first
    queued: VecDeque<usize>,
    /// Samples already credited to reclaimed buffers
    accounted: usize,

    gain: f32,
    pitch_warned: bool,

    /// f32 staging for queued data, reused across calls
    staging: Vec<f32>,
}

// cpal's Stream is !Send, but it is created, used, and dropped exclusively on
// the streaming thread; only the stream-less shell crosses threads.
unsafe impl Send for CpalSink {}

impl CpalSink {
    /// Open the named output device, or the default one.
    pub fn new(device_name: Option<&str>) -> Result<Self, SinkError> {
        let host = cpal::default_host();

        let device = if let Some(name) = device_name {
            let mut devices = host
                .output_devices()
                .map_err(|e| SinkError::Open(format!("failed to enumerate devices: {e}")))?;
            match devices.find(|d| d.name().ok().as_deref() == Some(name)) {
                Some(dev) => dev,
                None => {
                    warn!("audio device '{name}' not found, falling back to default");
                    host.default_output_device()
                        .ok_or_else(|| SinkError::Open("no default output device".to_string()))?
                }
            }
        } else {
            host.default_output_device()
                .ok_or_else(|| SinkError::Open("no default output device".to_string()))?
        };

        info!(
            "using audio device: {}",
            device.name().unwrap_or_else(|_| "<unknown>".to_string())
        );

        Ok(Self {
            device,
            stream: None,
            session: None,
            shared: Arc::new(Shared {
                consumed: AtomicUsize::new(0),
                starved: AtomicBool::new(false),
                playing: AtomicBool::new(false),
            }),
            producer: None,
            pending_consumer: None,
            queued: VecDeque::new(),
            accounted: 0,
            gain: 1.0,
            pitch_warned: false,
            staging: Vec::new(),
        })
    }

    /// Best supported device configuration for the session: stereo at the
    /// session rate, f32 preferred, i16 accepted.
    fn best_config(&self, sample_rate: u32) -> Result<(StreamConfig, SampleFormat), SinkError> {
        let mut configs = self
            .device
            .supported_output_configs()
            .map_err(|e| SinkError::Open(format!("failed to get device configs: {e}")))?;

        let preferred = configs.find(|c| {
            c.channels() == 2
                && c.min_sample_rate().0 <= sample_rate
                && c.max_sample_rate().0 >= sample_rate
                && matches!(c.sample_format(), SampleFormat::F32 | SampleFormat::I16)
        });

        if let Some(supported) = preferred {
            let format = supported.sample_format();
            let config = supported
                .with_sample_rate(cpal::SampleRate(sample_rate))
                .config();
            return Ok((config, format));
        }

        let supported = self
            .device
            .default_output_config()
            .map_err(|e| SinkError::Open(format!("failed to get default config: {e}")))?;
        let format = supported.sample_format();
        Ok((supported.config(), format))
    }

    /// Build the output stream on the streaming thread, moving the ring
    /// consumer into the device callback.
    fn build_stream(&mut self) -> Result<(), SinkError> {
        if self.stream.is_some() {
            return Ok(());
        }
        let session = self
            .session
            .as_ref()
            .ok_or_else(|| SinkError::Queue("session not open".to_string()))?;
        let mut consumer = self
            .pending_consumer
            .take()
            .ok_or_else(|| SinkError::Queue("stream already consumed the ring".to_string()))?;

        let shared = Arc::clone(&self.shared);
        let err_fn = |err| error!("audio stream error: {err}");

        let stream = match session.sample_format {
            SampleFormat::F32 => self
                .device
                .build_output_stream(
                    &session.stream_config,
                    move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                        let read = consumer.pop_slice(data);
                        shared.consumed.fetch_add(read, Ordering::Release);
                        if read < data.len() {
                            data[read..].fill(0.0);
                            if shared.playing.load(Ordering::Acquire) {
                                shared.starved.store(true, Ordering::Release);
                            }
                        }
                    },
                    err_fn,
                    None,
                )
                .map_err(|e| SinkError::Open(format!("failed to build stream: {e}")))?,
            SampleFormat::I16 => {
                let mut scratch = vec![0.0f32; CALLBACK_CHUNK];
                self.device
                    .build_output_stream(
                        &session.stream_config,
                        move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                            let mut filled = 0usize;
                            while filled < data.len() {
                                let want = (data.len() - filled).min(scratch.len());
                                let read = consumer.pop_slice(&mut scratch[..want]);
                                shared.consumed.fetch_add(read, Ordering::Release);
                                for i in 0..read {
                                    data[filled + i] = crate::convert::sample_to_int16(scratch[i]);
                                }
                                filled += read;
                                if read < want {
                                    data[filled..].fill(0);
                                    if shared.playing.load(Ordering::Acquire) {
                                        shared.starved.store(true, Ordering::Release);
                                    }
                                    break;
                                }
                            }
                        },
                        err_fn,
                        None,
                    )
                    .map_err(|e| SinkError::Open(format!("failed to build stream: {e}")))?
            }
            other => {
                return Err(SinkError::Open(format!(
                    "unsupported device sample format: {other:?}"
                )))
            }
        };

        self.stream = Some(stream);
        Ok(())
    }

    /// Stage `data` as gain-scaled f32 samples.
    fn stage(&mut self, data: SampleData<'_>) {
        let gain = self.gain;
        self.staging.clear();
        match data {
            SampleData::Int16(samples) => self
                .staging
                .extend(samples.iter().map(|&s| f32::from(s) / 32768.0 * gain)),
            SampleData::Int32(samples) => self.staging.extend(
                samples
                    .iter()
                    .map(|&s| (f64::from(s) / 2147483648.0) as f32 * gain),
            ),
            SampleData::Float32(samples) => {
                self.staging.extend(samples.iter().map(|&s| s * gain))
            }
        }
    }
}

impl AudioSink for CpalSink {
    fn probe(&self) -> SinkCaps {
        // Every encoding is converted into the ring's f32 samples, so all
        // three are accepted; the layout is fixed by the stereo ring.
        SinkCaps {
            encodings: vec![
                OutputEncoding::Float32,
                OutputEncoding::Int32Fixed,
                OutputEncoding::Int16,
            ],
            layouts: vec![ChannelLayout::Stereo],
        }
    }

    fn open(&mut self, params: &SessionParams) -> Result<(), SinkError> {
        if params.sources.len() != 1 {
            return Err(SinkError::Open(
                "cpal sink drives a single source".to_string(),
            ));
        }
        let source = params.sources[0];
        if source.layout != ChannelLayout::Stereo {
            return Err(SinkError::Open(
                "cpal sink only supports the stereo layout".to_string(),
            ));
        }

        let (stream_config, sample_format) = self.best_config(source.sample_rate)?;
        debug!(
            "cpal session: rate={}, format={:?}, {} frames x {} buffers",
            stream_config.sample_rate.0, sample_format, source.frames_per_buffer, params.pool_size
        );

        let capacity = params.pool_size * source.frames_per_buffer * 2;
        let (producer, consumer) = HeapRb::<f32>::new(capacity).split();
        self.producer = Some(producer);
        self.pending_consumer = Some(consumer);
        self.queued.clear();
        self.accounted = 0;
        self.shared.consumed.store(0, Ordering::Release);
        self.shared.starved.store(false, Ordering::Release);
        self.shared.playing.store(false, Ordering::Release);
        self.session = Some(OpenSession {
            stream_config,
            sample_format,
        });
        Ok(())
    }

    fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.pause();
        }
        self.producer = None;
        self.pending_consumer = None;
        self.queued.clear();
        self.session = None;
        self.shared.playing.store(false, Ordering::Release);
    }

    fn queue(
        &mut self,
        source: usize,
        data: SampleData<'_>,
        _sample_rate: u32,
    ) -> Result<(), SinkError> {
        debug_assert_eq!(source, 0);
        if self.session.is_none() {
            return Err(SinkError::Queue("session not open".to_string()));
        }
        self.stage(data);

        let producer = self
            .producer
            .as_mut()
            .ok_or_else(|| SinkError::Queue("ring producer missing".to_string()))?;
        if producer.vacant_len() < self.staging.len() {
            // The scheduler's pool accounting should make this impossible.
            return Err(SinkError::Queue("device ring full".to_string()));
        }
        producer.push_slice(&self.staging);
        self.queued.push_back(self.staging.len());
        Ok(())
    }

    fn reclaim_processed(&mut self, source: usize) -> usize {
        debug_assert_eq!(source, 0);
        let consumed = self.shared.consumed.load(Ordering::Acquire);
        let mut reclaimed = 0;
        while let Some(&len) = self.queued.front() {
            if consumed - self.accounted >= len {
                self.accounted += len;
                self.queued.pop_front();
                reclaimed += 1;
            } else {
                break;
            }
        }
        reclaimed
    }

    fn play(&mut self, source: usize) -> Result<(), SinkError> {
        debug_assert_eq!(source, 0);
        self.build_stream()?;
        if let Some(stream) = &self.stream {
            stream
                .play()
                .map_err(|e| SinkError::Queue(format!("failed to start stream: {e}")))?;
        }
        self.shared.starved.store(false, Ordering::Release);
        self.shared.playing.store(true, Ordering::Release);
        Ok(())
    }

    fn pause(&mut self, source: usize) {
        debug_assert_eq!(source, 0);
        if let Some(stream) = &self.stream {
            let _ = stream.pause();
        }
        self.shared.playing.store(false, Ordering::Release);
    }

    fn is_playing(&self, source: usize) -> bool {
        debug_assert_eq!(source, 0);
        self.shared.playing.load(Ordering::Acquire) && !self.shared.starved.load(Ordering::Acquire)
    }

    fn set_gain(&mut self, source: usize, gain: f32) {
        debug_assert_eq!(source, 0);
        self.gain = gain.clamp(0.0, 1.0);
    }

    fn set_pitch(&mut self, source: usize, pitch: f32) {
        debug_assert_eq!(source, 0);
        // This host API has no device-level rate control; speed deviation
        // must be absorbed by time-stretching instead.
        if (pitch - 1.0).abs() > 0.01 && !self.pitch_warned {
            debug!("cpal sink cannot apply device pitch {pitch:.2}; enable time-stretch");
            self.pitch_warned = true;
        }
    }

    fn reset_source(&mut self, source: usize) {
        debug_assert_eq!(source, 0);
        // Best effort: already-rung samples play out, but the accounting
        // restarts so the scheduler sees an empty queue.
        let consumed = self.shared.consumed.load(Ordering::Acquire);
        self.queued.clear();
        self.accounted = consumed;
    }
}

impl Drop for CpalSink {
    fn drop(&mut self) {
        self.close();
    }
}
