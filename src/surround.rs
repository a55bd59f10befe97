//! Surround matrix decoding
//!
//! Decodes interleaved stereo frames into N discrete surround channels using
//! a fixed block-size frequency-domain matrix decode, and absorbs the
//! mismatch between the decoder's fixed block size and the scheduler's
//! variable request size with an internal FIFO of already-decoded frames.
//!
//! Call order contract: `frames_needed_for_output` tells the scheduler how
//! many stereo frames to pull upstream, `put_frames` decodes them, and only
//! then may `receive_frames` pop the requested output. The FIFO never
//! overflows because the scheduler asks only for the decode blocks needed to
//! satisfy the next request.

use std::collections::VecDeque;
use std::f32::consts::{FRAC_1_SQRT_2, PI};
use std::sync::Arc;

use rustfft::num_complex::Complex32;
use rustfft::{Fft, FftPlanner};

use crate::error::{Error, Result};
use crate::types::ChannelLayout;

/// Stereo frames consumed by each decode call
pub const DECODE_BLOCK_FRAMES: usize = 512;

/// Analysis/synthesis window length in frames
const WINDOW: usize = DECODE_BLOCK_FRAMES;

/// Window hop; 50% overlap
const HOP: usize = WINDOW / 2;

/// Fixed FIFO capacity in samples, all channels interleaved.
///
/// Sized for the largest layout (16 channels) at the scheduler's maximum
/// surround frames-per-buffer plus one decode block of slack.
const FIFO_CAPACITY: usize = 65536;

/// Everything at or below this frequency feeds the reconstructed LFE
const LFE_CUTOFF_HZ: f32 = 120.0;

const EPS: f32 = 1e-9;

/// Channel permutation from decoder-internal order to the output convention,
/// plus the output slot whose decoder-reconstructed LFE must be zeroed.
///
/// Decoder order 5.1: FL, FC, FR, BL, BR, LFE.
/// Output order 5.1:  FL, FR, FC, LFE, BL, BR.
const REMAP_51: ([usize; 6], Option<usize>) = ([0, 2, 1, 5, 3, 4], Some(3));

/// Decoder order 7.1: FL, FC, FR, SL, SR, BL, BR, LFE.
/// Output order 7.1:  FL, FR, FC, LFE, BL, BR, SL, SR.
const REMAP_71: ([usize; 8], Option<usize>) = ([0, 2, 1, 7, 5, 6, 3, 4], Some(3));

/// Decoder order HRTF: 16 virtual speakers on an azimuth ring, index k at
/// k * 22.5° clockwise from front center.
/// Output order: front-to-back, alternating left/right, ending at back
/// center. No LFE in this layout.
const REMAP_16: ([usize; 16], Option<usize>) = (
    [0, 15, 1, 14, 2, 13, 3, 12, 4, 11, 5, 10, 6, 9, 7, 8],
    None,
);

fn remap_for(layout: ChannelLayout) -> (&'static [usize], Option<usize>) {
    match layout {
        ChannelLayout::Surround51 => (&REMAP_51.0, REMAP_51.1),
        ChannelLayout::Surround71 => (&REMAP_71.0, REMAP_71.1),
        ChannelLayout::Hrtf16 => (&REMAP_16.0, REMAP_16.1),
        ChannelLayout::Stereo => (&[], None),
    }
}

/// Apply the fixed permutation table for `layout` to one decoder-order frame.
fn remap_frame(layout: ChannelLayout, decoder_frame: &[f32], out_frame: &mut [f32]) {
    let (table, lfe_slot) = remap_for(layout);
    for (slot, &src) in table.iter().enumerate() {
        out_frame[slot] = decoder_frame[src];
    }
    if let Some(slot) = lfe_slot {
        // The matrix decode reconstructs a plausible N.0 image but not a
        // perceptually reliable subwoofer channel.
        out_frame[slot] = 0.0;
    }
}

/// Per-speaker steering gains for the 16-point HRTF ring, derived once from
/// each speaker's azimuth.
#[derive(Clone, Copy)]
struct SpeakerGains {
    left: f32,
    right: f32,
    front: f32,
    rear: f32,
    rear_sign: f32,
}

fn hrtf_ring_gains() -> [SpeakerGains; 16] {
    let mut gains = [SpeakerGains {
        left: 0.0,
        right: 0.0,
        front: 0.0,
        rear: 0.0,
        rear_sign: 1.0,
    }; 16];
    for (k, g) in gains.iter_mut().enumerate() {
        let azimuth = k as f32 * (2.0 * PI / 16.0);
        let x = azimuth.sin(); // > 0 on the listener's right
        let y = azimuth.cos(); // > 0 in front
        g.left = (1.0 - x) * 0.5;
        g.right = (1.0 + x) * 0.5;
        g.front = (1.0 + y) * 0.5;
        g.rear = 1.0 - g.front;
        g.rear_sign = if x <= 0.0 { 1.0 } else { -1.0 };
    }
    gains
}

/// Fixed-block frequency-domain surround matrix decoder.
///
/// Owned by the streaming session that created it; constructed at session
/// start and dropped at session stop, so no decode state ever leaks across
/// sessions.
pub struct SurroundMatrixDecoder {
    layout: ChannelLayout,
    channels: usize,
    lfe_cutoff_bin: usize,

    fft_forward: Arc<dyn Fft<f32>>,
    fft_inverse: Arc<dyn Fft<f32>>,
    /// sqrt-Hann, applied at analysis and again at synthesis so 50% overlap
    /// reconstructs unity gain
    window: Vec<f32>,

    /// Deinterleaved pending input, pre-seeded with one hop of silence so
    /// every whole put block yields a whole block of output
    input_left: Vec<f32>,
    input_right: Vec<f32>,

    /// Per-decoder-channel overlap-add carry, one hop deep
    overlap: Vec<Vec<f32>>,
    hrtf_gains: [SpeakerGains; 16],

    /// Decoded, remapped output samples awaiting delivery
    fifo: VecDeque<f32>,

    // FFT scratch, reused across windows
    spec_left: Vec<Complex32>,
    spec_right: Vec<Complex32>,
    channel_spec: Vec<Vec<Complex32>>,
}

impl SurroundMatrixDecoder {
    /// Create a decoder for one streaming session.
    ///
    /// `layout` must be a decoded (non-stereo) layout.
    pub fn new(layout: ChannelLayout, sample_rate: u32) -> Result<Self> {
        if !layout.is_decoded() {
            return Err(Error::Config(
                "surround decoder requires a non-stereo layout".to_string(),
            ));
        }
        let channels = layout.channels();
        let mut planner = FftPlanner::new();
        let window = (0..WINDOW)
            .map(|i| (PI * (i as f32 + 0.5) / WINDOW as f32).sin().sqrt())
            .collect();

        Ok(Self {
            layout,
            channels,
            lfe_cutoff_bin: (LFE_CUTOFF_HZ * WINDOW as f32 / sample_rate as f32).ceil() as usize,
            fft_forward: planner.plan_fft_forward(WINDOW),
            fft_inverse: planner.plan_fft_inverse(WINDOW),
            window,
            input_left: vec![0.0; HOP],
            input_right: vec![0.0; HOP],
            overlap: vec![vec![0.0; HOP]; channels],
            hrtf_gains: hrtf_ring_gains(),
            fifo: VecDeque::with_capacity(FIFO_CAPACITY),
            spec_left: vec![Complex32::default(); WINDOW],
            spec_right: vec![Complex32::default(); WINDOW],
            channel_spec: vec![vec![Complex32::default(); WINDOW]; channels],
        })
    }

    /// Channel count of the decoded output
    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Stereo frames the scheduler must pull upstream before
    /// `receive_frames(_, output_frames)` can succeed.
    ///
    /// Returns 0 when the FIFO already covers the request, else the smallest
    /// multiple of [`DECODE_BLOCK_FRAMES`] covering the shortfall.
    pub fn frames_needed_for_output(&self, output_frames: usize) -> usize {
        let buffered_frames = self.fifo.len() / self.channels;
        if buffered_frames >= output_frames {
            return 0;
        }
        let shortfall = output_frames - buffered_frames;
        shortfall.div_ceil(DECODE_BLOCK_FRAMES) * DECODE_BLOCK_FRAMES
    }

    /// Decode as many whole blocks as `stereo` contains and append the
    /// remapped result to the FIFO. Leftover frames smaller than a block stay
    /// buffered for the next call.
    pub fn put_frames(&mut self, stereo: &[i16]) {
        debug_assert_eq!(stereo.len() % 2, 0, "input must be whole stereo frames");

        self.input_left
            .extend(stereo.iter().step_by(2).map(|&s| f32::from(s) / 32768.0));
        self.input_right
            .extend(stereo.iter().skip(1).step_by(2).map(|&s| f32::from(s) / 32768.0));

        // One decode block spans two overlapped analysis windows; partial
        // blocks wait for the rest of their input.
        while self.input_left.len() >= WINDOW + HOP {
            for _ in 0..2 {
                self.decode_window();
                self.input_left.drain(..HOP);
                self.input_right.drain(..HOP);
            }
        }
        debug_assert!(self.fifo.len() <= FIFO_CAPACITY, "decode FIFO overflow");
        debug_assert_eq!(self.fifo.len() % self.channels, 0);
    }

    /// Pop `frames` decoded frames (interleaved in output channel order) in
    /// FIFO order.
    ///
    /// Hard precondition: the caller supplied enough input via `put_frames`
    /// first. Shortfalls are zero-filled in release builds.
    pub fn receive_frames(&mut self, out: &mut [f32], frames: usize) {
        let samples = frames * self.channels;
        debug_assert!(
            self.fifo.len() >= samples,
            "receive_frames called without enough decoded input"
        );
        for slot in out.iter_mut().take(samples) {
            *slot = self.fifo.pop_front().unwrap_or(0.0);
        }
    }

    /// Flush internal decode state and empty the FIFO.
    ///
    /// Required whenever playback is muted/unmuted or the session resets, so
    /// stale decoded audio is never delivered after a discontinuity.
    /// Idempotent.
    pub fn clear(&mut self) {
        self.input_left.clear();
        self.input_left.resize(HOP, 0.0);
        self.input_right.clear();
        self.input_right.resize(HOP, 0.0);
        for carry in &mut self.overlap {
            carry.iter_mut().for_each(|s| *s = 0.0);
        }
        self.fifo.clear();
    }

    #[cfg(test)]
    pub(crate) fn buffered_samples(&self) -> usize {
        self.fifo.len()
    }

    /// Run one analysis window: FFT both stereo channels, steer every bin
    /// into the decoder-order channel spectra, then synthesize one hop of
    /// output per channel and push it through the remap into the FIFO.
    fn decode_window(&mut self) {
        for i in 0..WINDOW {
            self.spec_left[i] = Complex32::new(self.input_left[i] * self.window[i], 0.0);
            self.spec_right[i] = Complex32::new(self.input_right[i] * self.window[i], 0.0);
        }
        self.fft_forward.process(&mut self.spec_left);
        self.fft_forward.process(&mut self.spec_right);

        for bin in 0..WINDOW {
            let lt = self.spec_left[bin];
            let rt = self.spec_right[bin];
            self.steer_bin(bin, lt, rt);
        }

        // Inverse transform each channel, window again, overlap-add one hop.
        let inv_scale = 1.0 / WINDOW as f32;
        let mut decoder_frame = vec![0.0f32; self.channels];
        let mut out_frame = vec![0.0f32; self.channels];
        let mut hop_frames = vec![0.0f32; HOP * self.channels];

        for ch in 0..self.channels {
            self.fft_inverse.process(&mut self.channel_spec[ch]);
            let carry = &mut self.overlap[ch];
            for i in 0..HOP {
                let sample = self.channel_spec[ch][i].re * inv_scale * self.window[i];
                hop_frames[i * self.channels + ch] = carry[i] + sample;
            }
            for i in 0..HOP {
                carry[i] =
                    self.channel_spec[ch][HOP + i].re * inv_scale * self.window[HOP + i];
            }
        }

        for frame in hop_frames.chunks_exact(self.channels) {
            decoder_frame.copy_from_slice(frame);
            remap_frame(self.layout, &decoder_frame, &mut out_frame);
            self.fifo.extend(out_frame.iter().copied());
        }
    }

    /// Steer one frequency bin of the stereo spectrum into the decoder-order
    /// channel spectra.
    ///
    /// `front` measures inter-channel phase correlation: 1.0 for in-phase
    /// (front-panned) content, 0.0 for anti-phase (rear/ambient) content.
    fn steer_bin(&mut self, bin: usize, lt: Complex32, rt: Complex32) {
        let center = (lt + rt) * 0.5;
        let surround = (lt - rt) * 0.5;

        let corr = lt * rt.conj();
        let denom = lt.norm() * rt.norm() + EPS;
        let front = (0.5 + 0.5 * (corr.re / denom)).clamp(0.0, 1.0);
        let back = 1.0 - front;

        let in_lfe_band = bin <= self.lfe_cutoff_bin || bin >= WINDOW - self.lfe_cutoff_bin;
        let lfe = if in_lfe_band {
            center
        } else {
            Complex32::default()
        };

        let fl = lt - center * 0.5;
        let fr = rt - center * 0.5;
        let fc = center * front;
        let bl = lt * back + surround * FRAC_1_SQRT_2;
        let br = rt * back - surround * FRAC_1_SQRT_2;

        match self.layout {
            ChannelLayout::Surround51 => {
                let spec = &mut self.channel_spec;
                spec[0][bin] = fl;
                spec[1][bin] = fc;
                spec[2][bin] = fr;
                spec[3][bin] = bl;
                spec[4][bin] = br;
                spec[5][bin] = lfe;
            }
            ChannelLayout::Surround71 => {
                let sl = (fl + bl) * 0.5;
                let sr = (fr + br) * 0.5;
                let spec = &mut self.channel_spec;
                spec[0][bin] = fl;
                spec[1][bin] = fc;
                spec[2][bin] = fr;
                spec[3][bin] = sl;
                spec[4][bin] = sr;
                spec[5][bin] = bl;
                spec[6][bin] = br;
                spec[7][bin] = lfe;
            }
            ChannelLayout::Hrtf16 => {
                for (k, g) in self.hrtf_gains.iter().enumerate() {
                    let direct = (lt * g.left + rt * g.right) * (g.front * front + g.rear * back);
                    let ambient = surround * (g.rear * g.rear_sign * FRAC_1_SQRT_2);
                    self.channel_spec[k][bin] = direct + ambient;
                }
            }
            ChannelLayout::Stereo => unreachable!("decoder is never built for stereo"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stereo_sine(frames: usize, freq: f32, rate: f32, anti_phase: bool) -> Vec<i16> {
        let mut out = Vec::with_capacity(frames * 2);
        for i in 0..frames {
            let s = (2.0 * PI * freq * i as f32 / rate).sin();
            let left = (s * 12000.0) as i16;
            out.push(left);
            out.push(if anti_phase { -left } else { left });
        }
        out
    }

    fn rms_of_output_channel(decoder: &mut SurroundMatrixDecoder, frames: usize, slot: usize) -> f32 {
        let ch = decoder.channels();
        let mut out = vec![0.0f32; frames * ch];
        decoder.receive_frames(&mut out, frames);
        let sum: f32 = out
            .chunks_exact(ch)
            .map(|frame| frame[slot] * frame[slot])
            .sum();
        (sum / frames as f32).sqrt()
    }

    #[test]
    fn test_frames_needed_rounds_up_to_whole_blocks() {
        let decoder = SurroundMatrixDecoder::new(ChannelLayout::Surround51, 48000).unwrap();
        assert_eq!(decoder.frames_needed_for_output(1), DECODE_BLOCK_FRAMES);
        assert_eq!(decoder.frames_needed_for_output(240), DECODE_BLOCK_FRAMES);
        assert_eq!(decoder.frames_needed_for_output(512), DECODE_BLOCK_FRAMES);
        assert_eq!(decoder.frames_needed_for_output(513), 2 * DECODE_BLOCK_FRAMES);
    }

    #[test]
    fn test_needed_then_put_satisfies_receive_for_all_layouts() {
        for layout in [
            ChannelLayout::Surround51,
            ChannelLayout::Surround71,
            ChannelLayout::Hrtf16,
        ] {
            let mut decoder = SurroundMatrixDecoder::new(layout, 48000).unwrap();
            let ch = decoder.channels();

            // Several request sizes, including ones that leave FIFO leftovers.
            for &out_frames in &[240usize, 512, 600, 100] {
                let needed = decoder.frames_needed_for_output(out_frames);
                if needed > 0 {
                    decoder.put_frames(&stereo_sine(needed, 440.0, 48000.0, false));
                }
                assert!(
                    decoder.buffered_samples() >= out_frames * ch,
                    "layout {layout:?}: request for {out_frames} frames not covered"
                );
                let mut out = vec![0.0f32; out_frames * ch];
                decoder.receive_frames(&mut out, out_frames);
                assert_eq!(decoder.buffered_samples() % ch, 0);
            }
        }
    }

    #[test]
    fn test_remap_permutation_table() {
        // Decoder order 5.1 is FL, FC, FR, BL, BR, LFE; the fixed table must
        // land FL in slot 0 and FC in slot 2 of the output convention.
        let decoder_frame = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let mut out = [0.0f32; 6];
        remap_frame(ChannelLayout::Surround51, &decoder_frame, &mut out);
        assert_eq!(out[0], 1.0); // Front-Left
        assert_eq!(out[1], 3.0); // Front-Right
        assert_eq!(out[2], 2.0); // Front-Center
        assert_eq!(out[3], 0.0); // LFE, zeroed despite decoder value 6.0
        assert_eq!(out[4], 4.0); // Back-Left
        assert_eq!(out[5], 5.0); // Back-Right
    }

    #[test]
    fn test_remap_71_places_sides_last() {
        let decoder_frame = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0];
        let mut out = [0.0f32; 8];
        remap_frame(ChannelLayout::Surround71, &decoder_frame, &mut out);
        assert_eq!(out, [1.0, 3.0, 2.0, 0.0, 6.0, 7.0, 4.0, 5.0]);
    }

    #[test]
    fn test_remap_16_is_a_permutation() {
        let (table, lfe) = remap_for(ChannelLayout::Hrtf16);
        assert!(lfe.is_none());
        let mut seen = [false; 16];
        for &src in table {
            assert!(!seen[src], "decoder channel {src} mapped twice");
            seen[src] = true;
        }
        assert!(seen.iter().all(|&s| s));
    }

    #[test]
    fn test_in_phase_content_stays_out_of_the_rear() {
        let mut decoder = SurroundMatrixDecoder::new(ChannelLayout::Surround51, 48000).unwrap();
        let needed = decoder.frames_needed_for_output(512);
        decoder.put_frames(&stereo_sine(needed, 1000.0, 48000.0, false));

        let ch = decoder.channels();
        let mut out = vec![0.0f32; 512 * ch];
        decoder.receive_frames(&mut out, 512);

        let rms = |slot: usize| -> f32 {
            let sum: f32 = out
                .chunks_exact(ch)
                .map(|frame| frame[slot] * frame[slot])
                .sum();
            (sum / 512.0).sqrt()
        };
        // Output order: FL FR FC LFE BL BR. In-phase input has zero
        // anti-phase component, so the rears carry (near) nothing.
        assert!(rms(2) > 0.01, "center should carry in-phase content");
        assert!(rms(4) < rms(2) * 0.1, "back-left should be silent");
        assert!(rms(5) < rms(2) * 0.1, "back-right should be silent");
    }

    #[test]
    fn test_anti_phase_content_stays_out_of_the_center() {
        let mut decoder = SurroundMatrixDecoder::new(ChannelLayout::Surround51, 48000).unwrap();
        let needed = decoder.frames_needed_for_output(512);
        decoder.put_frames(&stereo_sine(needed, 1000.0, 48000.0, true));

        let center = rms_of_output_channel(&mut decoder, 512, 2);
        assert!(center < 0.01, "anti-phase input must not steer to center");
    }

    #[test]
    fn test_clear_is_idempotent() {
        let mut decoder = SurroundMatrixDecoder::new(ChannelLayout::Surround51, 48000).unwrap();
        decoder.put_frames(&stereo_sine(DECODE_BLOCK_FRAMES, 440.0, 48000.0, false));
        assert!(decoder.buffered_samples() > 0);

        decoder.clear();
        assert_eq!(decoder.buffered_samples(), 0);
        decoder.clear();
        assert_eq!(decoder.buffered_samples(), 0);
    }

    #[test]
    fn test_whole_blocks_only_leftover_stays_buffered() {
        let mut decoder = SurroundMatrixDecoder::new(ChannelLayout::Surround51, 48000).unwrap();
        // Half a block decodes nothing.
        decoder.put_frames(&stereo_sine(DECODE_BLOCK_FRAMES / 2, 440.0, 48000.0, false));
        assert_eq!(decoder.buffered_samples(), 0);
        // The second half completes the block.
        decoder.put_frames(&stereo_sine(DECODE_BLOCK_FRAMES / 2, 440.0, 48000.0, false));
        assert_eq!(
            decoder.buffered_samples(),
            DECODE_BLOCK_FRAMES * decoder.channels()
        );
    }
}
