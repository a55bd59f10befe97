//! Stateless sample-format conversion with saturation
//!
//! Converts between the mixer's native 16-bit integer samples and the sink's
//! negotiated encoding. Matrix-decoded floats are not guaranteed to stay
//! within [-1, 1] (the decode can overshoot) and must be hard-clamped, never
//! wrapped.
//!
//! Caller contract: input length is an exact multiple of the channel count.
//! The helpers clear and refill the output vector so scratch buffers can be
//! reused across iterations without reallocating.

/// Full-scale divisor/multiplier between i16 and normalized float
const I16_SCALE: f32 = 32768.0;

/// Full-scale multiplier between normalized float and i32 fixed point
const I32_SCALE: f64 = 2147483648.0; // 2^31

/// Widening ratio from i16 full scale to i32 full scale
const I16_TO_I32_RATIO: i32 = i32::MAX / i16::MAX as i32;

/// Convert 16-bit integer samples to normalized 32-bit floats.
pub fn int16_to_float32(input: &[i16], out: &mut Vec<f32>) {
    out.clear();
    out.extend(input.iter().map(|&s| f32::from(s) / I16_SCALE));
}

/// Convert 32-bit float samples to 16-bit integers, clamping to the i16
/// range before narrowing.
pub fn float32_to_int16(input: &[f32], out: &mut Vec<i16>) {
    out.clear();
    out.extend(
        input
            .iter()
            .map(|&s| (s * I16_SCALE).clamp(i16::MIN as f32, i16::MAX as f32) as i16),
    );
}

/// Convert 32-bit float samples to 32-bit fixed point, clamping to the i32
/// range before narrowing.
///
/// The scale factor exceeds f32 integer precision, so the multiply runs in
/// f64.
pub fn float32_to_int32(input: &[f32], out: &mut Vec<i32>) {
    out.clear();
    out.extend(
        input
            .iter()
            .map(|&s| (f64::from(s) * I32_SCALE).clamp(i32::MIN as f64, i32::MAX as f64) as i32),
    );
}

/// Widen 16-bit integer samples to 32-bit fixed point.
pub fn int16_to_int32(input: &[i16], out: &mut Vec<i32>) {
    out.clear();
    out.extend(input.iter().map(|&s| i32::from(s) * I16_TO_I32_RATIO));
}

/// Clamp a single float sample to the i16 range and narrow it.
pub fn sample_to_int16(sample: f32) -> i16 {
    (sample * I16_SCALE).clamp(i16::MIN as f32, i16::MAX as f32) as i16
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_int16_float_round_trip_is_exact() {
        // Every i16 value is exactly representable in f32 and the scale is a
        // power of two, so the round trip must reproduce the input bit-exact.
        let input: Vec<i16> = (i16::MIN..=i16::MAX).collect();
        let mut floats = Vec::new();
        let mut back = Vec::new();

        int16_to_float32(&input, &mut floats);
        float32_to_int16(&floats, &mut back);

        assert_eq!(input, back);
    }

    #[test]
    fn test_float_to_int16_saturates_instead_of_wrapping() {
        let mut out = Vec::new();
        float32_to_int16(&[2.5, -3.0], &mut out);
        assert_eq!(out, vec![32767, -32768]);
    }

    #[test]
    fn test_float_to_int32_saturates() {
        let mut out = Vec::new();
        float32_to_int32(&[2.5, -3.0, 0.0], &mut out);
        assert_eq!(out, vec![i32::MAX, i32::MIN, 0]);
    }

    #[test]
    fn test_float_to_int32_scale() {
        let mut out = Vec::new();
        float32_to_int32(&[0.5, -0.5], &mut out);
        assert_eq!(out, vec![1 << 30, -(1 << 30)]);
    }

    #[test]
    fn test_int16_widening_preserves_sign_and_scale() {
        let mut out = Vec::new();
        int16_to_int32(&[i16::MAX, i16::MIN + 1, 0], &mut out);
        assert_eq!(out[0], i16::MAX as i32 * (i32::MAX / i16::MAX as i32));
        assert_eq!(out[1], -out[0]);
        assert_eq!(out[2], 0);
    }

    #[test]
    fn test_scratch_buffers_are_cleared_between_calls() {
        let mut out = Vec::new();
        float32_to_int16(&[1.0; 8], &mut out);
        assert_eq!(out.len(), 8);
        float32_to_int16(&[0.0; 2], &mut out);
        assert_eq!(out.len(), 2);
    }
}
