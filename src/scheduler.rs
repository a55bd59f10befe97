//! Streaming session scheduler
//!
//! Drives the producer-to-sink pipeline at real-time rate: pulls samples
//! from the mixer, routes them through the optional time-stretch and
//! surround-decode stages, converts to the negotiated sample encoding, and
//! keeps the device buffer pool full without starving it.
//!
//! One dedicated streaming thread per active session, started by `start()`
//! and joined by `stop()`. The thread is the sole mutator of buffer-pool,
//! FIFO, and stretch state; volume and mute land in atomics read once per
//! iteration. After `start()` succeeds nothing is surfaced to the caller:
//! encoding rejections degrade and retry, mixer underruns skip the
//! iteration, and playback stalls reissue play, all inside the loop.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::config::{StreamConfig, WakePolicy};
use crate::convert;
use crate::error::{Error, Result};
use crate::mixer::Mixer;
use crate::sink::{AudioSink, SinkError};
use crate::surround::{SurroundMatrixDecoder, DECODE_BLOCK_FRAMES};
use crate::stretch::TimeStretcher;
use crate::types::{ChannelLayout, OutputEncoding, SampleData, SessionParams, SourceParams};

/// Milliseconds of audio held by one device buffer
const BUFFER_MS: usize = 2;

/// Upper clamp on frames per device buffer
const MAX_FRAMES_PER_BUFFER: usize = 2048;

/// Buffer pool bounds; the lower bound keeps double-buffering headroom even
/// at minimal latency
const MIN_POOL_SIZE: usize = 3;
const MAX_POOL_SIZE: usize = 128;

/// Speed deviations at or below this floor are ignored: near-silent boot
/// audio plays at nominal rate instead of being pitched or stretched down
const MIN_SPEED: f64 = 0.1;

/// Bounded wait when every device buffer is queued
const SLOT_WAIT: Duration = Duration::from_millis(1);

/// Streaming session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// State shared between the caller and the streaming thread.
struct Control {
    running: AtomicBool,

    /// Volume 0..=100; read once per iteration, applied to the next queued
    /// buffer's gain, never retroactively
    volume: AtomicU32,

    muted: AtomicBool,

    /// Wake pair for the event wait policy
    wake_flag: Mutex<bool>,
    wake_cv: Condvar,
}

impl Control {
    fn new(volume: u8) -> Self {
        Self {
            running: AtomicBool::new(true),
            volume: AtomicU32::new(u32::from(volume.min(100))),
            muted: AtomicBool::new(false),
            wake_flag: Mutex::new(false),
            wake_cv: Condvar::new(),
        }
    }

    fn wake(&self) {
        let mut pending = lock_recover(&self.wake_flag);
        *pending = true;
        self.wake_cv.notify_one();
    }
}

/// Recover the guard from a poisoned mutex; the wake flag holds no
/// invariant that a panic could break.
fn lock_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Frames held by one device buffer: the configured latency divided across
/// the buffer pool at `sample_rate`.
///
/// Decoded layouts are floored to the decode block size so every buffer
/// holds whole decoder output.
fn frames_per_buffer(
    sample_rate: u32,
    latency_ms: u32,
    pool_size: usize,
    decoded: bool,
) -> usize {
    let frames = sample_rate as usize * latency_ms as usize / 1000 / pool_size.max(1);
    if decoded {
        frames.clamp(DECODE_BLOCK_FRAMES, MAX_FRAMES_PER_BUFFER)
    } else {
        frames.clamp(32, MAX_FRAMES_PER_BUFFER)
    }
}

/// Device buffers allocated per source for the configured latency.
fn pool_size_for_latency(latency_ms: u32) -> usize {
    (latency_ms as usize / BUFFER_MS).clamp(MIN_POOL_SIZE, MAX_POOL_SIZE)
}

/// Outcome of one streaming iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    /// At least one buffer was queued
    Worked,

    /// Nothing to do: pool full or mixer starved; wait before retrying
    Idle,

    /// Session is muted; wait without touching the pipeline
    Muted,
}

/// Conversion scratch reused across iterations.
#[derive(Default)]
struct Scratch {
    f32_buf: Vec<f32>,
    i32_buf: Vec<i32>,
    i16_buf: Vec<i16>,
}

/// Frame data staged for queuing, before encoding conversion.
#[derive(Clone, Copy)]
enum Staged<'a> {
    /// Interleaved stereo straight from the mixer or stretcher
    Pcm(&'a [i16]),

    /// Interleaved multichannel floats from the matrix decoder
    Decoded(&'a [f32]),
}

/// Convert `staged` to the session encoding and queue it, degrading the
/// encoding and retrying the same data on rejection.
///
/// Returns whether a buffer was queued. Transient queue errors drop the
/// buffer; the loop is self-healing and never propagates them.
fn queue_with_degrade(
    sink: &mut dyn AudioSink,
    encoding: &mut OutputEncoding,
    scratch: &mut Scratch,
    source: usize,
    sample_rate: u32,
    staged: Staged<'_>,
) -> bool {
    loop {
        let data = match (*encoding, staged) {
            (OutputEncoding::Float32, Staged::Decoded(samples)) => SampleData::Float32(samples),
            (OutputEncoding::Float32, Staged::Pcm(samples)) => {
                convert::int16_to_float32(samples, &mut scratch.f32_buf);
                SampleData::Float32(&scratch.f32_buf)
            }
            (OutputEncoding::Int32Fixed, Staged::Decoded(samples)) => {
                convert::float32_to_int32(samples, &mut scratch.i32_buf);
                SampleData::Int32(&scratch.i32_buf)
            }
            (OutputEncoding::Int32Fixed, Staged::Pcm(samples)) => {
                convert::int16_to_int32(samples, &mut scratch.i32_buf);
                SampleData::Int32(&scratch.i32_buf)
            }
            (OutputEncoding::Int16, Staged::Decoded(samples)) => {
                convert::float32_to_int16(samples, &mut scratch.i16_buf);
                SampleData::Int16(&scratch.i16_buf)
            }
            (OutputEncoding::Int16, Staged::Pcm(samples)) => SampleData::Int16(samples),
        };

        match sink.queue(source, data, sample_rate) {
            Ok(()) => return true,
            Err(SinkError::EncodingRejected) => match encoding.downgrade() {
                Some(next) => {
                    warn!("device rejected {:?} samples, degrading to {next:?}", *encoding);
                    *encoding = next;
                }
                None => {
                    warn!("device rejected every sample encoding; dropping buffer");
                    return false;
                }
            },
            Err(e) => {
                warn!("queue error on source {source}: {e}");
                return false;
            }
        }
    }
}

/// The streaming loop and everything it owns.
///
/// Constructed on the caller's thread, moved into the streaming thread by
/// `start()`, and handed back through the join so the sink survives for a
/// later restart.
struct Worker {
    sink: Box<dyn AudioSink>,
    mixer: Arc<dyn Mixer>,
    control: Arc<Control>,

    layout: ChannelLayout,
    encoding: OutputEncoding,
    pool_size: usize,
    latency_ms: u32,
    wake_policy: WakePolicy,
    time_stretch: bool,

    /// Per-source frames per buffer; recomputed on a source rate change
    fpb: Vec<usize>,
    /// Per-source count of buffers currently queued on the sink
    queued: Vec<usize>,
    /// Per-source sample rate last seen from the mixer
    last_rate: Vec<u32>,
    /// Whether play has ever been issued on the source
    started: Vec<bool>,

    decoder: Option<SurroundMatrixDecoder>,
    stretcher: Option<TimeStretcher>,

    was_muted: bool,
    last_pitch: f64,

    mix_buf: Vec<i16>,
    stretch_buf: Vec<i16>,
    float_buf: Vec<f32>,
    scratch: Scratch,
}

impl Worker {
    #[allow(clippy::too_many_arguments)]
    fn new(
        sink: Box<dyn AudioSink>,
        mixer: Arc<dyn Mixer>,
        control: Arc<Control>,
        config: &StreamConfig,
        layout: ChannelLayout,
        encoding: OutputEncoding,
        pool_size: usize,
        source_rates: Vec<u32>,
    ) -> Result<Self> {
        let primary_rate = *source_rates
            .first()
            .ok_or_else(|| Error::InvalidState("session has no sources".to_string()))?;
        let decoder = if layout.is_decoded() {
            Some(SurroundMatrixDecoder::new(layout, primary_rate)?)
        } else {
            None
        };
        let stretcher = if config.enable_time_stretch {
            Some(TimeStretcher::new(primary_rate))
        } else {
            None
        };
        let fpb: Vec<usize> = source_rates
            .iter()
            .map(|&rate| {
                frames_per_buffer(rate, config.latency_ms, pool_size, layout.is_decoded())
            })
            .collect();
        let sources = source_rates.len();

        Ok(Self {
            sink,
            mixer,
            control,
            layout,
            encoding,
            pool_size,
            latency_ms: config.latency_ms,
            wake_policy: config.wake_policy,
            time_stretch: config.enable_time_stretch,
            fpb,
            queued: vec![0; sources],
            last_rate: source_rates,
            started: vec![false; sources],
            decoder,
            stretcher,
            was_muted: false,
            last_pitch: 1.0,
            mix_buf: Vec::new(),
            stretch_buf: Vec::new(),
            float_buf: Vec::new(),
            scratch: Scratch::default(),
        })
    }

    /// Run until stopped, then tear the device session down on this thread.
    fn run(mut self) -> Box<dyn AudioSink> {
        debug!(
            "streaming loop started: {:?} {:?}, {} buffers x {:?} frames",
            self.layout, self.encoding, self.pool_size, self.fpb
        );
        while self.control.running.load(Ordering::Acquire) {
            match self.iterate() {
                Step::Worked => {}
                Step::Idle | Step::Muted => self.wait_for_slot(),
            }
        }
        self.sink.close();
        debug!("streaming loop stopped");
        self.sink
    }

    /// One pass of the per-iteration algorithm. Never blocks.
    fn iterate(&mut self) -> Step {
        let muted = self.control.muted.load(Ordering::Acquire);
        if muted != self.was_muted {
            self.apply_mute_edge(muted);
        }
        if muted {
            return Step::Muted;
        }

        for source in 0..self.queued.len() {
            let reclaimed = self.sink.reclaim_processed(source);
            self.queued[source] = self.queued[source].saturating_sub(reclaimed);
        }
        if self.queued.iter().all(|&q| q >= self.pool_size) {
            return Step::Idle;
        }

        let speed = self.mixer.current_speed();
        let speed = if speed > MIN_SPEED { speed } else { 1.0 };
        self.apply_pitch(speed);

        let gain = self.control.volume.load(Ordering::Acquire).min(100) as f32 / 100.0;

        let mut worked = false;
        if self.decoder.is_some() {
            worked = self.fill_surround(speed, gain);
        } else {
            for source in 0..self.queued.len() {
                worked |= self.fill_stereo_source(source, speed, gain);
            }
        }
        if worked {
            Step::Worked
        } else {
            Step::Idle
        }
    }

    /// Pause/resume playback on a mute transition and drop pipeline state so
    /// stale audio is never delivered after the discontinuity.
    fn apply_mute_edge(&mut self, muted: bool) {
        if muted {
            for source in 0..self.queued.len() {
                self.sink.pause(source);
            }
            if let Some(decoder) = self.decoder.as_mut() {
                decoder.clear();
            }
            if let Some(stretcher) = self.stretcher.as_mut() {
                stretcher.clear();
            }
            debug!("playback muted");
        } else {
            for source in 0..self.queued.len() {
                if self.started[source] {
                    if let Err(e) = self.sink.play(source) {
                        warn!("failed to resume source {source}: {e}");
                    }
                }
            }
            debug!("playback resumed");
        }
        self.was_muted = muted;
    }

    /// Forward speed deviation to the device as pitch when time-stretch is
    /// not absorbing it. The stretched source never gets device pitch.
    fn apply_pitch(&mut self, speed: f64) {
        if (speed - self.last_pitch).abs() < 0.01 {
            return;
        }
        let first = usize::from(self.time_stretch);
        for source in first..self.queued.len() {
            self.sink.set_pitch(source, speed as f32);
        }
        self.last_pitch = speed;
    }

    /// Surround path: single source, decoder block granularity.
    fn fill_surround(&mut self, speed: f64, gain: f32) -> bool {
        if self.queued[0] >= self.pool_size {
            return false;
        }
        let fpb = self.fpb[0];
        let Some(decoder) = self.decoder.as_mut() else {
            return false;
        };

        let needed = decoder.frames_needed_for_output(fpb);
        if needed > 0 {
            if let Some(stretcher) = self.stretcher.as_mut() {
                // Pull at the emulation's rate, stretch to the device's.
                let want = ((needed as f64 * speed).round() as usize).max(1);
                self.mix_buf.resize(want * 2, 0);
                let produced = self.mixer.mix(&mut self.mix_buf, want);
                if produced == 0 {
                    return false;
                }
                stretcher.process_samples(&self.mix_buf[..produced * 2], needed);
                self.stretch_buf.resize(needed * 2, 0);
                stretcher.get_stretched_samples(&mut self.stretch_buf);
                decoder.put_frames(&self.stretch_buf);
            } else {
                self.mix_buf.resize(needed * 2, 0);
                let produced = self.mixer.mix(&mut self.mix_buf, needed);
                if produced < needed {
                    // Expected starvation, e.g. boot silence. Not an error.
                    return false;
                }
                decoder.put_frames(&self.mix_buf);
            }
        }

        self.float_buf.resize(fpb * decoder.channels(), 0.0);
        decoder.receive_frames(&mut self.float_buf, fpb);

        self.sink.set_gain(0, gain);
        if queue_with_degrade(
            self.sink.as_mut(),
            &mut self.encoding,
            &mut self.scratch,
            0,
            self.last_rate[0],
            Staged::Decoded(&self.float_buf),
        ) {
            self.queued[0] += 1;
        }
        self.ensure_playing(0);
        true
    }

    /// Stereo path for one source, with per-source rate-change detection
    /// when the mixer exposes several discrete sources.
    fn fill_stereo_source(&mut self, source: usize, speed: f64, gain: f32) -> bool {
        if self.queued[source] >= self.pool_size {
            return false;
        }
        if self.queued.len() > 1 {
            let rate = self.mixer.source_sample_rate(source);
            if rate != self.last_rate[source] {
                info!(
                    "source {source} sample rate changed {} -> {rate}, resetting its queue",
                    self.last_rate[source]
                );
                self.sink.reset_source(source);
                self.queued[source] = 0;
                self.started[source] = false;
                self.fpb[source] =
                    frames_per_buffer(rate, self.latency_ms, self.pool_size, false);
                self.last_rate[source] = rate;
            }
        }

        let fpb = self.fpb[source];
        let stretch_this = source == 0 && self.time_stretch;
        let staged_is_stretched = if stretch_this {
            let Some(stretcher) = self.stretcher.as_mut() else {
                return false;
            };
            let want = ((fpb as f64 * speed).round() as usize).max(1);
            self.mix_buf.resize(want * 2, 0);
            let produced = self.mixer.mix_source(source, &mut self.mix_buf, want);
            if produced == 0 {
                return false;
            }
            stretcher.process_samples(&self.mix_buf[..produced * 2], fpb);
            self.stretch_buf.resize(fpb * 2, 0);
            stretcher.get_stretched_samples(&mut self.stretch_buf);
            true
        } else {
            self.mix_buf.resize(fpb * 2, 0);
            let produced = self.mixer.mix_source(source, &mut self.mix_buf, fpb);
            if produced < fpb {
                return false;
            }
            false
        };

        let staged = if staged_is_stretched {
            Staged::Pcm(&self.stretch_buf)
        } else {
            Staged::Pcm(&self.mix_buf)
        };

        self.sink.set_gain(source, gain);
        if queue_with_degrade(
            self.sink.as_mut(),
            &mut self.encoding,
            &mut self.scratch,
            source,
            self.last_rate[source],
            staged,
        ) {
            self.queued[source] += 1;
        }
        self.ensure_playing(source);
        true
    }

    /// Start playback on the first queued buffer, and reissue play if the
    /// device starved and fell out of the playing state.
    fn ensure_playing(&mut self, source: usize) {
        if self.queued[source] == 0 {
            return;
        }
        if !self.started[source] {
            match self.sink.play(source) {
                Ok(()) => self.started[source] = true,
                Err(e) => warn!("failed to start playback on source {source}: {e}"),
            }
        } else if !self.sink.is_playing(source) {
            warn!("audio device starved on source {source}, reissuing play");
            if let Err(e) = self.sink.play(source) {
                warn!("failed to restart playback on source {source}: {e}");
            }
        }
    }

    /// Bounded wait when no device buffer is free; a latency/CPU tradeoff,
    /// not a correctness requirement.
    fn wait_for_slot(&self) {
        match self.wake_policy {
            WakePolicy::Event => {
                let mut pending = lock_recover(&self.control.wake_flag);
                if !*pending {
                    let (guard, _) = match self
                        .control
                        .wake_cv
                        .wait_timeout(pending, SLOT_WAIT)
                    {
                        Ok(r) => r,
                        Err(poisoned) => poisoned.into_inner(),
                    };
                    pending = guard;
                }
                *pending = false;
            }
            WakePolicy::Spin => thread::sleep(SLOT_WAIT),
        }
    }
}

/// Orchestrates a streaming session over a mixer and a sink.
///
/// The sink is owned by the scheduler while stopped and by the streaming
/// thread while running; `stop()` hands it back so the session can be
/// restarted without reopening the device handle.
pub struct StreamScheduler {
    mixer: Arc<dyn Mixer>,
    config: StreamConfig,
    control: Arc<Control>,
    sink_slot: Option<Box<dyn AudioSink>>,
    worker: Option<JoinHandle<Box<dyn AudioSink>>>,
    state: SchedulerState,
}

impl StreamScheduler {
    pub fn new(mixer: Arc<dyn Mixer>, sink: Box<dyn AudioSink>, config: StreamConfig) -> Self {
        let volume = config.volume.min(100);
        Self {
            mixer,
            config,
            control: Arc::new(Control::new(volume)),
            sink_slot: Some(sink),
            worker: None,
            state: SchedulerState::Stopped,
        }
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    /// Negotiate the session with the sink, open the device, and launch the
    /// streaming thread.
    ///
    /// Device-open failure is the only error a running pipeline ever
    /// surfaces; everything after this returns is handled inside the loop.
    pub fn start(&mut self) -> Result<()> {
        if self.worker.is_some() {
            return Err(Error::InvalidState("scheduler already running".to_string()));
        }
        self.state = SchedulerState::Starting;
        let mut sink = match self.sink_slot.take() {
            Some(sink) => sink,
            None => {
                self.state = SchedulerState::Stopped;
                return Err(Error::InvalidState("sink unavailable".to_string()));
            }
        };

        let caps = sink.probe();

        let layout = if self.config.enable_surround && self.mixer.source_count() == 1 {
            if caps.supports_layout(self.config.surround_layout) {
                self.config.surround_layout
            } else {
                warn!(
                    "device does not support {:?}, falling back to stereo",
                    self.config.surround_layout
                );
                ChannelLayout::Stereo
            }
        } else {
            ChannelLayout::Stereo
        };

        let encoding = match OutputEncoding::PREFERENCE
            .iter()
            .copied()
            .find(|&e| caps.supports_encoding(e))
        {
            Some(encoding) => encoding,
            None => {
                self.sink_slot = Some(sink);
                self.state = SchedulerState::Stopped;
                return Err(Error::Config(
                    "device supports no known sample encoding".to_string(),
                ));
            }
        };

        let source_rates: Vec<u32> = if layout.is_decoded() || self.mixer.source_count() <= 1 {
            vec![self.mixer.sample_rate()]
        } else {
            (0..self.mixer.source_count())
                .map(|s| self.mixer.source_sample_rate(s))
                .collect()
        };
        let pool_size = pool_size_for_latency(self.config.latency_ms);
        let params = SessionParams {
            sources: source_rates
                .iter()
                .map(|&rate| SourceParams {
                    sample_rate: rate,
                    layout,
                    frames_per_buffer: frames_per_buffer(
                        rate,
                        self.config.latency_ms,
                        pool_size,
                        layout.is_decoded(),
                    ),
                })
                .collect(),
            pool_size,
            encoding,
        };

        if let Err(e) = sink.open(&params) {
            self.sink_slot = Some(sink);
            self.state = SchedulerState::Stopped;
            return Err(Error::DeviceOpen(e.to_string()));
        }
        info!(
            "streaming session open: {layout:?} {encoding:?}, pool of {pool_size}, {} source(s)",
            source_rates.len()
        );

        self.control.running.store(true, Ordering::Release);
        self.control.muted.store(false, Ordering::Release);
        let worker = match Worker::new(
            sink,
            Arc::clone(&self.mixer),
            Arc::clone(&self.control),
            &self.config,
            layout,
            encoding,
            pool_size,
            source_rates,
        ) {
            Ok(worker) => worker,
            Err(e) => {
                self.state = SchedulerState::Stopped;
                return Err(e);
            }
        };
        self.worker = Some(thread::spawn(move || worker.run()));
        self.state = SchedulerState::Running;
        Ok(())
    }

    /// Signal the streaming thread, join it, and take the sink back.
    /// A no-op when the scheduler is not running.
    pub fn stop(&mut self) {
        let Some(handle) = self.worker.take() else {
            return;
        };
        self.state = SchedulerState::Stopping;
        self.control.running.store(false, Ordering::Release);
        self.control.wake();
        match handle.join() {
            Ok(sink) => self.sink_slot = Some(sink),
            Err(_) => error!("streaming thread panicked; sink lost"),
        }
        self.state = SchedulerState::Stopped;
    }

    /// Set the output volume, 0..=100. Takes effect on the next queued
    /// buffer, not on buffers already in flight.
    pub fn set_volume(&self, volume: u8) {
        self.control
            .volume
            .store(u32::from(volume.min(100)), Ordering::Release);
    }

    /// Pause or resume playback without tearing the session down.
    ///
    /// Muting drops in-flight decode and stretch state, so unmuting never
    /// replays stale audio.
    pub fn set_muted(&self, muted: bool) {
        self.control.muted.store(muted, Ordering::Release);
        self.control.wake();
    }

    /// Best-effort hint that the mixer has fresh samples. Wakes a blocked
    /// streaming thread early; never required for correctness.
    pub fn notify_data_available(&self) {
        self.control.wake();
    }
}

impl Drop for StreamScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::SinkCaps;
    use crate::types::SessionParams;
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;

    /// Scripted mixer: serves a queue of per-call frame counts, then
    /// produces everything requested.
    struct MockMixer {
        rate: u32,
        speed: StdMutex<f64>,
        script: StdMutex<VecDeque<usize>>,
        /// Frame counts requested from `mix`, in call order
        requests: StdMutex<Vec<usize>>,
        fill: i16,
    }

    impl MockMixer {
        fn full(rate: u32, fill: i16) -> Self {
            Self {
                rate,
                speed: StdMutex::new(1.0),
                script: StdMutex::new(VecDeque::new()),
                requests: StdMutex::new(Vec::new()),
                fill,
            }
        }

        fn scripted(rate: u32, fill: i16, counts: &[usize]) -> Self {
            let mixer = Self::full(rate, fill);
            *mixer.script.lock().unwrap() = counts.iter().copied().collect();
            mixer
        }
    }

    impl Mixer for MockMixer {
        fn mix(&self, out: &mut [i16], frames: usize) -> usize {
            self.requests.lock().unwrap().push(frames);
            let produced = match self.script.lock().unwrap().pop_front() {
                Some(count) => count.min(frames),
                None => frames,
            };
            out[..produced * 2].fill(self.fill);
            produced
        }

        fn sample_rate(&self) -> u32 {
            self.rate
        }

        fn current_speed(&self) -> f64 {
            *self.speed.lock().unwrap()
        }
    }

    /// Observable sink state, shared between the mock and the test.
    #[derive(Default)]
    struct SinkState {
        in_flight: usize,
        /// (gain, encoding, samples) per queued buffer, in order
        queue_log: Vec<(f32, OutputEncoding, usize)>,
        playing: bool,
        play_calls: usize,
        pause_calls: usize,
        /// Every pitch value the scheduler applied, in order
        pitch_log: Vec<f32>,
        gain: f32,
    }

    /// Records every sink call so tests can assert iteration-precise
    /// behavior.
    struct MockSink {
        state: Arc<StdMutex<SinkState>>,
        pool_size: usize,
        /// Encodings the device pretends not to accept
        rejected: Vec<OutputEncoding>,
        /// Report one processed buffer per reclaim once the pool is full
        auto_reclaim: bool,
    }

    impl MockSink {
        fn new(pool_size: usize) -> Self {
            Self {
                state: Arc::new(StdMutex::new(SinkState {
                    gain: 1.0,
                    ..SinkState::default()
                })),
                pool_size,
                rejected: Vec::new(),
                auto_reclaim: false,
            }
        }

        fn state(&self) -> Arc<StdMutex<SinkState>> {
            Arc::clone(&self.state)
        }
    }

    impl AudioSink for MockSink {
        fn probe(&self) -> SinkCaps {
            SinkCaps {
                encodings: vec![
                    OutputEncoding::Float32,
                    OutputEncoding::Int32Fixed,
                    OutputEncoding::Int16,
                ],
                layouts: vec![ChannelLayout::Stereo, ChannelLayout::Surround51],
            }
        }

        fn open(&mut self, _params: &SessionParams) -> std::result::Result<(), SinkError> {
            Ok(())
        }

        fn close(&mut self) {}

        fn queue(
            &mut self,
            _source: usize,
            data: SampleData<'_>,
            _sample_rate: u32,
        ) -> std::result::Result<(), SinkError> {
            if self.rejected.contains(&data.encoding()) {
                return Err(SinkError::EncodingRejected);
            }
            let mut state = self.state.lock().unwrap();
            assert!(state.in_flight < self.pool_size, "pool overcommitted");
            state.in_flight += 1;
            let gain = state.gain;
            state.queue_log.push((gain, data.encoding(), data.len()));
            Ok(())
        }

        fn reclaim_processed(&mut self, _source: usize) -> usize {
            let mut state = self.state.lock().unwrap();
            if self.auto_reclaim && state.in_flight == self.pool_size {
                state.in_flight -= 1;
                1
            } else {
                0
            }
        }

        fn play(&mut self, _source: usize) -> std::result::Result<(), SinkError> {
            let mut state = self.state.lock().unwrap();
            state.play_calls += 1;
            state.playing = true;
            Ok(())
        }

        fn pause(&mut self, _source: usize) {
            let mut state = self.state.lock().unwrap();
            state.pause_calls += 1;
            state.playing = false;
        }

        fn is_playing(&self, _source: usize) -> bool {
            self.state.lock().unwrap().playing
        }

        fn set_gain(&mut self, _source: usize, gain: f32) {
            self.state.lock().unwrap().gain = gain;
        }

        fn set_pitch(&mut self, _source: usize, pitch: f32) {
            self.state.lock().unwrap().pitch_log.push(pitch);
        }

        fn reset_source(&mut self, _source: usize) {
            self.state.lock().unwrap().in_flight = 0;
        }
    }

    fn make_worker(
        sink: MockSink,
        mixer: Arc<MockMixer>,
        pool_size: usize,
        fpb: usize,
    ) -> Worker {
        let control = Arc::new(Control::new(100));
        let config = StreamConfig::default();
        let mut worker = Worker::new(
            Box::new(sink),
            mixer,
            control,
            &config,
            ChannelLayout::Stereo,
            OutputEncoding::Int16,
            pool_size,
            vec![48000],
        )
        .unwrap();
        worker.fpb = vec![fpb];
        worker
    }

    #[test]
    fn test_pool_saturates_and_stays_saturated() {
        let mixer = Arc::new(MockMixer::full(48000, 1000));
        let mut sink = MockSink::new(3);
        sink.auto_reclaim = true;
        let state = sink.state();
        let mut worker = make_worker(sink, mixer, 3, 240);

        for i in 0..10 {
            assert_eq!(worker.iterate(), Step::Worked, "iteration {i} skipped");
        }

        let state = state.lock().unwrap();
        assert_eq!(state.in_flight, 3);
        assert_eq!(state.queue_log.len(), 10);
        for (gain, encoding, samples) in &state.queue_log {
            assert_eq!(*gain, 1.0);
            assert_eq!(*encoding, OutputEncoding::Int16);
            assert_eq!(*samples, 240 * 2);
        }
        assert_eq!(state.play_calls, 1);
    }

    #[test]
    fn test_mixer_underrun_skips_without_corrupting_state() {
        let mixer = Arc::new(MockMixer::scripted(48000, 1000, &[0, 0, 0, 0, 0]));
        let sink = MockSink::new(3);
        let state = sink.state();
        let mut worker = make_worker(sink, mixer, 3, 240);

        for _ in 0..5 {
            assert_eq!(worker.iterate(), Step::Idle);
        }
        assert_eq!(state.lock().unwrap().queue_log.len(), 0);
        assert_eq!(worker.queued[0], 0);

        // Mixer resumes; streaming continues from the state it left.
        for _ in 0..3 {
            assert_eq!(worker.iterate(), Step::Worked);
        }
        assert_eq!(worker.queued[0], 3);
        assert_eq!(state.lock().unwrap().in_flight, 3);
    }

    #[test]
    fn test_volume_change_lands_on_next_queued_buffer() {
        let mixer = Arc::new(MockMixer::full(48000, 1000));
        let sink = MockSink::new(4);
        let state = sink.state();
        let mut worker = make_worker(sink, mixer, 4, 240);

        worker.iterate();
        worker.iterate();
        worker.control.volume.store(40, Ordering::Release);
        worker.iterate();

        let state = state.lock().unwrap();
        assert_eq!(state.queue_log.len(), 3);
        assert_eq!(state.queue_log[0].0, 1.0);
        assert_eq!(state.queue_log[1].0, 1.0);
        assert_eq!(state.queue_log[2].0, 0.4);
    }

    #[test]
    fn test_encoding_rejection_degrades_and_retries_same_data() {
        let mixer = Arc::new(MockMixer::full(48000, 1000));
        let mut sink = MockSink::new(3);
        sink.rejected = vec![OutputEncoding::Float32];
        let state = sink.state();
        let control = Arc::new(Control::new(100));
        let config = StreamConfig::default();
        let mut worker = Worker::new(
            Box::new(sink),
            mixer,
            control,
            &config,
            ChannelLayout::Stereo,
            OutputEncoding::Float32,
            3,
            vec![48000],
        )
        .unwrap();
        worker.fpb = vec![240];

        assert_eq!(worker.iterate(), Step::Worked);

        // The buffer was not dropped: it landed under the downgraded
        // encoding, and the session stays downgraded.
        assert_eq!(worker.encoding, OutputEncoding::Int32Fixed);
        let state = state.lock().unwrap();
        assert_eq!(state.queue_log.len(), 1);
        assert_eq!(state.queue_log[0].1, OutputEncoding::Int32Fixed);
        assert_eq!(state.queue_log[0].2, 240 * 2);
    }

    #[test]
    fn test_playback_stall_reissues_play() {
        let mixer = Arc::new(MockMixer::full(48000, 1000));
        let sink = MockSink::new(4);
        let state = sink.state();
        let mut worker = make_worker(sink, mixer, 4, 240);

        worker.iterate();
        assert_eq!(state.lock().unwrap().play_calls, 1);

        // Simulate a device starvation dropping the playing state.
        state.lock().unwrap().playing = false;
        worker.iterate();
        let state = state.lock().unwrap();
        assert!(state.playing);
        assert_eq!(state.play_calls, 2);
    }

    #[test]
    fn test_mute_pauses_and_unmute_resumes() {
        let mixer = Arc::new(MockMixer::full(48000, 1000));
        let sink = MockSink::new(4);
        let state = sink.state();
        let mut worker = make_worker(sink, mixer, 4, 240);

        worker.iterate();
        worker.control.muted.store(true, Ordering::Release);
        assert_eq!(worker.iterate(), Step::Muted);
        assert_eq!(state.lock().unwrap().pause_calls, 1);
        assert!(!state.lock().unwrap().playing);

        // No queueing while muted.
        assert_eq!(worker.iterate(), Step::Muted);
        assert_eq!(state.lock().unwrap().queue_log.len(), 1);

        worker.control.muted.store(false, Ordering::Release);
        assert_eq!(worker.iterate(), Step::Worked);
        assert!(state.lock().unwrap().playing);
    }

    #[test]
    fn test_surround_path_queues_decoded_multichannel_buffers() {
        let mixer = Arc::new(MockMixer::full(48000, 1000));
        let sink = MockSink::new(3);
        let state = sink.state();
        let control = Arc::new(Control::new(100));
        let config = StreamConfig::default();
        let mut worker = Worker::new(
            Box::new(sink),
            mixer,
            control,
            &config,
            ChannelLayout::Surround51,
            OutputEncoding::Float32,
            3,
            vec![48000],
        )
        .unwrap();

        assert_eq!(worker.iterate(), Step::Worked);
        let state = state.lock().unwrap();
        assert_eq!(state.queue_log.len(), 1);
        assert_eq!(state.queue_log[0].1, OutputEncoding::Float32);
        // 512-frame surround buffer carries six channels.
        assert_eq!(state.queue_log[0].2, DECODE_BLOCK_FRAMES * 6);
    }

    #[test]
    fn test_speed_below_floor_keeps_playback_at_nominal() {
        let mixer = Arc::new(MockMixer::full(48000, 1000));
        *mixer.speed.lock().unwrap() = 0.05;
        let sink = MockSink::new(4);
        let state = sink.state();
        let mut worker = make_worker(sink, Arc::clone(&mixer), 4, 240);

        worker.iterate();
        // Boot silence at 5% speed: no device pitch at all, and the pull
        // size stays nominal.
        assert!(state.lock().unwrap().pitch_log.is_empty());
        assert_eq!(mixer.requests.lock().unwrap().last().copied(), Some(240));

        // Above the floor the deviation is forwarded as-is.
        *mixer.speed.lock().unwrap() = 0.5;
        worker.iterate();
        assert_eq!(state.lock().unwrap().pitch_log, vec![0.5]);
    }

    #[test]
    fn test_stretch_pull_ignores_speed_below_floor() {
        let mixer = Arc::new(MockMixer::full(48000, 1000));
        *mixer.speed.lock().unwrap() = 0.05;
        let sink = MockSink::new(4);
        let control = Arc::new(Control::new(100));
        let config = StreamConfig {
            enable_time_stretch: true,
            ..StreamConfig::default()
        };
        let mut worker = Worker::new(
            Box::new(sink),
            Arc::clone(&mixer) as Arc<dyn Mixer>,
            control,
            &config,
            ChannelLayout::Stereo,
            OutputEncoding::Int16,
            4,
            vec![48000],
        )
        .unwrap();
        worker.fpb = vec![240];

        assert_eq!(worker.iterate(), Step::Worked);
        // The stretcher is fed at the nominal ratio, not dragged to 10x.
        assert_eq!(mixer.requests.lock().unwrap().last().copied(), Some(240));
    }

    #[test]
    fn test_frames_per_buffer_divides_latency_across_the_pool() {
        assert_eq!(frames_per_buffer(48000, 20, 10, false), 96);
        assert_eq!(frames_per_buffer(48000, 100, 10, false), 480);
        assert_eq!(frames_per_buffer(48000, 20, 10, true), DECODE_BLOCK_FRAMES);
        assert_eq!(frames_per_buffer(8000, 20, 10, false), 32);
        assert_eq!(
            frames_per_buffer(2_000_000, 20, 10, false),
            MAX_FRAMES_PER_BUFFER
        );
    }

    #[test]
    fn test_pool_size_clamps_to_latency() {
        assert_eq!(pool_size_for_latency(20), 10);
        assert_eq!(pool_size_for_latency(0), MIN_POOL_SIZE);
        assert_eq!(pool_size_for_latency(10_000), MAX_POOL_SIZE);
    }

    #[test]
    fn test_stop_without_start_is_a_no_op() {
        let mixer: Arc<dyn Mixer> = Arc::new(MockMixer::full(48000, 0));
        let sink = Box::new(MockSink::new(3));
        let mut scheduler = StreamScheduler::new(mixer, sink, StreamConfig::default());
        assert_eq!(scheduler.state(), SchedulerState::Stopped);
        scheduler.stop();
        assert_eq!(scheduler.state(), SchedulerState::Stopped);
    }
}
