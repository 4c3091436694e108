// Sample-level conversions shared by capture and playback.
//
// Downsampling is block averaging: each output sample is the mean of the input
// samples in its window, with window edges at round(i * ratio). This is a crude
// low-pass, kept because its output must be reproducible sample for sample.

/// Root-mean-square of PCM16 samples normalised to [-1, 1].
pub fn rms_pcm16(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }

    let sum: f64 = samples
        .iter()
        .map(|&s| {
            let v = s as f64 / 32768.0;
            v * v
        })
        .sum();

    (sum / samples.len() as f64).sqrt() as f32
}

/// Downsample `input` from `input_rate` to `output_rate` by block averaging.
///
/// Returns the input unchanged when `output_rate >= input_rate`.
pub fn downsample(input: &[f32], input_rate: u32, output_rate: u32) -> Vec<f32> {
    if output_rate >= input_rate || output_rate == 0 {
        return input.to_vec();
    }

    let ratio = input_rate as f64 / output_rate as f64;
    let output_len = (input.len() as f64 / ratio).round() as usize;
    let mut output = Vec::with_capacity(output_len);

    let mut window_start = 0usize;
    for i in 0..output_len {
        let window_end = ((i + 1) as f64 * ratio).round() as usize;
        let end = window_end.min(input.len());

        let (sum, count) = if window_start < end {
            (input[window_start..end].iter().sum::<f32>(), end - window_start)
        } else {
            (0.0, 0)
        };

        output.push(if count > 0 { sum / count as f32 } else { 0.0 });
        window_start = window_end;
    }

    output
}

/// Convert float samples to PCM16.
///
/// Clamps to [-1, 1], then scales negatives by 0x8000 and the rest by 0x7FFF.
/// The asymmetry maps -1.0 to i16::MIN and 1.0 to i16::MAX.
pub fn float_to_pcm16(input: &[f32]) -> Vec<i16> {
    input
        .iter()
        .map(|&sample| {
            let s = sample.clamp(-1.0, 1.0);
            if s < 0.0 {
                (s * 32768.0) as i16
            } else {
                (s * 32767.0) as i16
            }
        })
        .collect()
}

/// Convert PCM16 to float samples in [-1, 1).
pub fn pcm16_to_float(input: &[i16]) -> Vec<f32> {
    input.iter().map(|&s| s as f32 / 32768.0).collect()
}

/// Linear-interpolation resampler used by output devices whose native rate
/// differs from the stream rate.
pub fn resample_linear(input: &[f32], input_rate: u32, output_rate: u32) -> Vec<f32> {
    if input_rate == output_rate || input.is_empty() || input_rate == 0 {
        return input.to_vec();
    }

    let ratio = input_rate as f64 / output_rate as f64;
    let output_len = (input.len() as f64 / ratio).round() as usize;

    (0..output_len)
        .map(|i| {
            let pos = i as f64 * ratio;
            let idx = pos.floor() as usize;
            let frac = (pos - idx as f64) as f32;
            let a = input[idx.min(input.len() - 1)];
            let b = input[(idx + 1).min(input.len() - 1)];
            a + (b - a) * frac
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rms_of_silence_is_zero() {
        assert_eq!(rms_pcm16(&[0; 160]), 0.0);
        assert_eq!(rms_pcm16(&[]), 0.0);
    }

    #[test]
    fn test_rms_of_constant_signal() {
        let rms = rms_pcm16(&[16384; 100]);
        assert!((rms - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_downsample_output_length() {
        // 48k -> 16k, 44.1k -> 16k, 48k -> 24k
        let cases = [(48000u32, 16000u32, 128usize), (44100, 16000, 128), (48000, 24000, 1024)];
        for (input_rate, output_rate, len) in cases {
            let input = vec![0.25f32; len];
            let output = downsample(&input, input_rate, output_rate);
            let expected = (len as f64 * output_rate as f64 / input_rate as f64).round() as usize;
            assert_eq!(output.len(), expected, "{input_rate} -> {output_rate}");
        }
    }

    #[test]
    fn test_downsample_averages_windows() {
        let input = [0.0, 0.3, 0.6, 0.9, 0.9, 0.9];
        let output = downsample(&input, 48000, 16000);
        assert_eq!(output.len(), 2);
        assert!((output[0] - 0.3).abs() < 1e-6);
        assert!((output[1] - 0.9).abs() < 1e-6);
    }

    #[test]
    fn test_downsample_uses_rounded_window_edges() {
        // ratio 1.5: windows [0,2) [2,3) [3,5) [5,6)
        let input = [1.0, 3.0, 5.0, 7.0, 9.0, 11.0];
        let output = downsample(&input, 24000, 16000);
        assert_eq!(output, vec![2.0, 5.0, 8.0, 11.0]);
    }

    #[test]
    fn test_downsample_passthrough_when_not_lower() {
        let input = [0.1, 0.2, 0.3];
        assert_eq!(downsample(&input, 16000, 16000), input.to_vec());
        assert_eq!(downsample(&input, 16000, 48000), input.to_vec());
    }

    #[test]
    fn test_float_to_pcm16_asymmetric_scale() {
        let pcm = float_to_pcm16(&[-1.0, 1.0, 0.0, -0.5, 0.5]);
        assert_eq!(pcm, vec![-32768, 32767, 0, -16384, 16383]);
    }

    #[test]
    fn test_float_to_pcm16_clamps() {
        let pcm = float_to_pcm16(&[-4.0, 7.5, f32::MAX, f32::MIN]);
        assert_eq!(pcm, vec![i16::MIN, i16::MAX, i16::MAX, i16::MIN]);
    }

    #[test]
    fn test_pcm16_to_float_range() {
        let floats = pcm16_to_float(&[i16::MIN, 0, i16::MAX]);
        assert_eq!(floats[0], -1.0);
        assert_eq!(floats[1], 0.0);
        assert!(floats[2] < 1.0);
    }

    #[test]
    fn test_resample_linear_doubles_length() {
        let output = resample_linear(&[0.0, 1.0, 0.0, 1.0], 24000, 48000);
        assert_eq!(output.len(), 8);
        assert!((output[1] - 0.5).abs() < 1e-6);
    }
}
