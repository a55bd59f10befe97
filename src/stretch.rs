//! Tempo adjustment without pitch shift
//!
//! Smooths over emulation-speed variation (fast-forward, slow-motion,
//! frame-skip) by time-stretching the mixer's stereo output. The stretch
//! ratio follows `input_frames / desired_output_frames`, low-pass filtered so
//! momentary speed wobble does not pump the engine.
//!
//! The engine is a time-domain WSOLA: output is assembled in fixed hops,
//! each spliced from the input position (near the nominal read cursor) that
//! correlates best with the previous hop's tail, then cross-faded in. When
//! the engine has not yet produced enough output, `get_stretched_samples`
//! pads with the last emitted frame so buffer boundaries never click.

use std::collections::VecDeque;

use tracing::trace;

use crate::convert;

/// Interleaved channel count; the stretcher sits before the surround
/// decoder, so it only ever sees the mixer's stereo output.
const CHANNELS: usize = 2;

/// Splice crossfade length in frames; also the output hop
const OVERLAP_FRAMES: usize = 256;

/// Frames of slack searched for the best splice offset
const SEARCH_FRAMES: usize = 128;

/// Correlation search and scoring stride, in frames
const SEARCH_STRIDE: usize = 4;

/// Smoothing time constant for the running stretch ratio, in seconds
const RATIO_LPF_SECS: f64 = 0.1;

/// Pending input is trimmed whenever the consumed prefix grows past this
const DRAIN_THRESHOLD_FRAMES: usize = 4096;

/// Acceptable ratio extremes; beyond these the engine would smear audio
/// into mush, so the ratio is clamped
const MIN_RATIO: f64 = 0.1;
const MAX_RATIO: f64 = 10.0;

struct WsolaEngine {
    /// Interleaved pending input
    input: Vec<f32>,
    /// Previous hop's tail, crossfaded against each new splice
    tail: Vec<f32>,
    /// Interleaved stretched output awaiting retrieval
    output: VecDeque<f32>,
    /// Nominal read cursor into `input`, in frames (fractional)
    read_pos: f64,
    ratio: f64,
}

impl WsolaEngine {
    fn new() -> Self {
        Self {
            input: Vec::new(),
            tail: vec![0.0; OVERLAP_FRAMES * CHANNELS],
            output: VecDeque::new(),
            read_pos: 0.0,
            ratio: 1.0,
        }
    }

    fn clear(&mut self) {
        self.input.clear();
        self.tail.iter_mut().for_each(|s| *s = 0.0);
        self.output.clear();
        self.read_pos = 0.0;
        self.ratio = 1.0;
    }

    fn feed(&mut self, samples: &[f32]) {
        self.input.extend_from_slice(samples);
        self.synthesize();
    }

    /// Assemble output hops while enough input is buffered for a full
    /// search window plus splice segment.
    fn synthesize(&mut self) {
        loop {
            let nominal = self.read_pos as usize;
            let segment_end = nominal + SEARCH_FRAMES + 2 * OVERLAP_FRAMES;
            if segment_end * CHANNELS > self.input.len() {
                break;
            }

            let start = nominal + self.best_offset(nominal);

            // Crossfade the stored tail into the chosen segment head.
            for i in 0..OVERLAP_FRAMES {
                let fade = i as f32 / OVERLAP_FRAMES as f32;
                for c in 0..CHANNELS {
                    let held = self.tail[i * CHANNELS + c];
                    let fresh = self.input[(start + i) * CHANNELS + c];
                    self.output.push_back(held * (1.0 - fade) + fresh * fade);
                }
            }

            // The segment's second half becomes the next tail.
            let tail_start = (start + OVERLAP_FRAMES) * CHANNELS;
            self.tail
                .copy_from_slice(&self.input[tail_start..tail_start + OVERLAP_FRAMES * CHANNELS]);

            self.read_pos += OVERLAP_FRAMES as f64 * self.ratio;
            self.trim_consumed();
        }
    }

    /// Offset in [0, SEARCH_FRAMES) whose overlap region correlates best
    /// with the stored tail, scored on the mono sum at a coarse stride.
    fn best_offset(&self, nominal: usize) -> usize {
        let mut best = 0usize;
        let mut best_score = f32::NEG_INFINITY;
        for offset in (0..SEARCH_FRAMES).step_by(SEARCH_STRIDE) {
            let mut score = 0.0f32;
            for i in (0..OVERLAP_FRAMES).step_by(SEARCH_STRIDE) {
                let t = self.tail[i * CHANNELS] + self.tail[i * CHANNELS + 1];
                let base = (nominal + offset + i) * CHANNELS;
                let s = self.input[base] + self.input[base + 1];
                score += t * s;
            }
            if score > best_score {
                best_score = score;
                best = offset;
            }
        }
        best
    }

    /// Drop input frames the read cursor has permanently passed.
    fn trim_consumed(&mut self) {
        let consumed = self.read_pos as usize;
        if consumed >= DRAIN_THRESHOLD_FRAMES {
            self.input.drain(..consumed * CHANNELS);
            self.read_pos -= consumed as f64;
        }
    }

    fn available_frames(&self) -> usize {
        self.output.len() / CHANNELS
    }
}

/// Adjusts playback tempo by a continuous ratio without altering pitch.
///
/// Created per streaming session; `clear()` must be called on seek, reset,
/// or mute/unmute so unrelated audio is never stitched together.
pub struct TimeStretcher {
    sample_rate: u32,
    engine: WsolaEngine,
    /// Running input/output ratio, low-pass filtered
    stretch_ratio: f64,
    /// Seed for continuity padding when the engine runs dry
    last_frame: [i16; CHANNELS],
    /// Scratch for i16 → f32 input conversion
    float_input: Vec<f32>,
}

impl TimeStretcher {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            engine: WsolaEngine::new(),
            stretch_ratio: 1.0,
            last_frame: [0; CHANNELS],
            float_input: Vec::new(),
        }
    }

    /// Current smoothed stretch ratio (input frames per output frame)
    pub fn ratio(&self) -> f64 {
        self.stretch_ratio
    }

    /// Buffer `input` (interleaved stereo) into the engine, stretching at a
    /// ratio derived from `input frames / num_out_frames`.
    pub fn process_samples(&mut self, input: &[i16], num_out_frames: usize) {
        debug_assert_eq!(input.len() % CHANNELS, 0);
        let in_frames = input.len() / CHANNELS;
        if in_frames == 0 || num_out_frames == 0 {
            return;
        }

        let instant = in_frames as f64 / num_out_frames as f64;
        // First-order low-pass keyed to how much wall-clock time this chunk
        // represents.
        let time_delta = in_frames as f64 / f64::from(self.sample_rate.max(1));
        let lpf_gain = 1.0 - (-time_delta / RATIO_LPF_SECS).exp();
        self.stretch_ratio += lpf_gain * (instant - self.stretch_ratio);
        self.stretch_ratio = self.stretch_ratio.clamp(MIN_RATIO, MAX_RATIO);
        self.engine.ratio = self.stretch_ratio;

        trace!(
            ratio = self.stretch_ratio,
            in_frames,
            num_out_frames,
            "stretch chunk"
        );

        convert::int16_to_float32(input, &mut self.float_input);
        self.engine.feed(&self.float_input);
    }

    /// Drain stretched output into `out` (interleaved stereo, whole frames).
    ///
    /// If the engine has not yet produced enough, the remainder repeats the
    /// last known frame so there is no discontinuity at buffer boundaries.
    pub fn get_stretched_samples(&mut self, out: &mut [i16]) {
        debug_assert_eq!(out.len() % CHANNELS, 0);
        let want_frames = out.len() / CHANNELS;
        let have_frames = self.engine.available_frames().min(want_frames);

        for frame in 0..have_frames {
            for c in 0..CHANNELS {
                // Queue holds whole frames, so pop cannot fail here.
                let sample = self.engine.output.pop_front().unwrap_or(0.0);
                let value = convert::sample_to_int16(sample);
                out[frame * CHANNELS + c] = value;
                self.last_frame[c] = value;
            }
        }
        for frame in have_frames..want_frames {
            for c in 0..CHANNELS {
                out[frame * CHANNELS + c] = self.last_frame[c];
            }
        }
    }

    /// Reset the engine and the padding seed.
    pub fn clear(&mut self) {
        self.engine.clear();
        self.stretch_ratio = 1.0;
        self.last_frame = [0; CHANNELS];
    }
}
