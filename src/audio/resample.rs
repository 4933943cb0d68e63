//! Audio resampling using rubato
//!
//! Converts every channel of a [`RawAudio`] to a target rate in one pass. The
//! resampler's output delay is compensated, so output sample `i` lines up with
//! input time `i / target_rate`, and the output length is
//! `ceil(frames * target_rate / source_rate)`.

use anyhow::{Context, Result};
use rubato::{
    FastFixedIn, PolynomialDegree, Resampler as RubatoResampler, SincFixedIn,
    SincInterpolationParameters, SincInterpolationType, WindowFunction,
};

use super::RawAudio;

const CHUNK_SIZE: usize = 1024;
/// Input position of the calibration impulse, well inside the first chunk
const IMPULSE_AT: usize = CHUNK_SIZE / 2;

/// Resampling quality preset
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ResampleQuality {
    /// Polynomial interpolation, lower quality
    Fast,
    /// Balanced speed and quality
    #[default]
    Normal,
    /// High quality, slower
    High,
}

/// Audio resampler
#[derive(Debug, Clone, Copy, Default)]
pub struct Resampler {
    quality: ResampleQuality,
}

impl Resampler {
    /// Create a new resampler
    pub fn new(quality: ResampleQuality) -> Self {
        Self { quality }
    }

    /// Resample all channels to a target sample rate
    pub fn resample(&self, audio: &RawAudio, target_rate: u32) -> Result<RawAudio> {
        if audio.sample_rate == target_rate || audio.num_frames() == 0 {
            return RawAudio::new(audio.channels.clone(), target_rate);
        }

        let ratio = target_rate as f64 / audio.sample_rate as f64;
        let expected_len = output_len(audio.num_frames(), audio.sample_rate, target_rate);
        let n_channels = audio.num_channels();

        let channels = match self.quality {
            ResampleQuality::Fast => {
                let mut resampler = FastFixedIn::<f32>::new(
                    ratio,
                    1.0,
                    PolynomialDegree::Cubic,
                    CHUNK_SIZE,
                    n_channels,
                )
                .context("Failed to create fast resampler")?;
                process_chunks(&mut resampler, &audio.channels, ratio, expected_len)?
            }
            ResampleQuality::Normal | ResampleQuality::High => {
                let high = self.quality == ResampleQuality::High;
                let params = SincInterpolationParameters {
                    sinc_len: if high { 256 } else { 128 },
                    f_cutoff: 0.95,
                    interpolation: SincInterpolationType::Linear,
                    oversampling_factor: if high { 256 } else { 128 },
                    window: WindowFunction::BlackmanHarris2,
                };
                let mut resampler =
                    SincFixedIn::<f32>::new(ratio, 1.0, params, CHUNK_SIZE, n_channels)
                        .context("Failed to create sinc resampler")?;
                process_chunks(&mut resampler, &audio.channels, ratio, expected_len)?
            }
        };

        RawAudio::new(channels, target_rate)
    }
}

/// Number of output frames for `frames` input frames
pub fn output_len(frames: usize, source_rate: u32, target_rate: u32) -> usize {
    let num = frames as u64 * target_rate as u64;
    num.div_ceil(source_rate as u64) as usize
}

/// Output delay in frames, found by running an impulse through the resampler
///
/// `output_delay()` does not match where the sinc resampler actually places its
/// output, so the delay is located from the impulse response instead. The
/// resampler is reset afterwards.
fn measure_delay<R: RubatoResampler<f32>>(resampler: &mut R, ratio: f64) -> Result<usize> {
    let mut impulse = vec![0.0f32; CHUNK_SIZE];
    impulse[IMPULSE_AT] = 1.0;

    let mut response = Vec::new();
    for chunk in [impulse, vec![0.0f32; CHUNK_SIZE]] {
        let input = vec![chunk; resampler.nbr_channels()];
        let result = resampler
            .process(&input, None)
            .context("Resampler calibration failed")?;
        if let Some(first) = result.into_iter().next() {
            response.extend(first);
        }
    }
    resampler.reset();

    let peak = response
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.abs().total_cmp(&b.1.abs()))
        .map_or(0, |(i, _)| i);
    let expected = (IMPULSE_AT as f64 * ratio).round() as usize;
    Ok(peak.saturating_sub(expected))
}

/// Feed fixed-size chunks (zero padded past the end) until the delayed output covers
/// `expected_len` frames, then drop the delay and cut to length
fn process_chunks<R: RubatoResampler<f32>>(
    resampler: &mut R,
    channels: &[Vec<f32>],
    ratio: f64,
    expected_len: usize,
) -> Result<Vec<Vec<f32>>> {
    let input_len = channels.first().map_or(0, Vec::len);
    let delay = measure_delay(resampler, ratio)?;
    tracing::trace!(delay, "resampler delay");
    let needed = delay + expected_len;

    let mut output: Vec<Vec<f32>> = vec![Vec::with_capacity(needed); channels.len()];
    let mut pos = 0;

    while output[0].len() < needed {
        let input: Vec<Vec<f32>> = channels
            .iter()
            .map(|channel| {
                let mut chunk = vec![0.0f32; CHUNK_SIZE];
                if pos < input_len {
                    let end = (pos + CHUNK_SIZE).min(input_len);
                    chunk[..end - pos].copy_from_slice(&channel[pos..end]);
                }
                chunk
            })
            .collect();

        let result = resampler
            .process(&input, None)
            .context("Resampling failed")?;

        for (out, resampled) in output.iter_mut().zip(result) {
            out.extend_from_slice(&resampled);
        }
        pos += CHUNK_SIZE;
    }

    Ok(output
        .into_iter()
        .map(|mut channel| {
            channel.drain(..delay);
            channel.truncate(expected_len);
            channel
        })
        .collect())
}

/// Convenience function to resample audio
pub fn resample(audio: &RawAudio, target_rate: u32) -> Result<RawAudio> {
    Resampler::default().resample(audio, target_rate)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(freq: f32, rate: u32, frames: usize) -> Vec<f32> {
        (0..frames)
            .map(|i| (2.0 * std::f32::consts::PI * freq * i as f32 / rate as f32).sin())
            .collect()
    }

    #[test]
    fn test_no_resample_needed() {
        let audio = RawAudio::mono(vec![0.0; 1000], 44100).unwrap();
        let result = resample(&audio, 44100).unwrap();
        assert_eq!(result.sample_rate, 44100);
        assert_eq!(result.num_frames(), 1000);
    }

    #[test]
    fn test_upsample_exact_length() {
        // 22.05kHz -> 44.1kHz doubles the length exactly
        let audio = RawAudio::mono(vec![0.0; 22050], 22050).unwrap();
        let result = resample(&audio, 44100).unwrap();
        assert_eq!(result.sample_rate, 44100);
        assert_eq!(result.num_frames(), 44100);
    }

    #[test]
    fn test_downsample_length() {
        let audio = RawAudio::mono(vec![0.0; 4800], 48000).unwrap();
        let result = resample(&audio, 44100).unwrap();
        assert_eq!(result.num_frames(), 4410);
    }

    #[test]
    fn test_multichannel_kept_planar() {
        let left = sine(440.0, 16000, 1600);
        let right = vec![0.0; 1600];
        let audio = RawAudio::new(vec![left, right], 16000).unwrap();
        let result = resample(&audio, 44100).unwrap();
        assert_eq!(result.num_channels(), 2);
        assert_eq!(result.num_frames(), output_len(1600, 16000, 44100));
        assert!(result.channels[1].iter().all(|s| s.abs() < 1e-6));
        assert!(result.channels[0].iter().any(|s| s.abs() > 0.5));
    }

    #[test]
    fn test_delay_compensated() {
        // A sine resampled 2x should stay in phase with the ideal 2x sine
        let rate = 22050;
        let input = sine(220.0, rate, rate as usize);
        let audio = RawAudio::mono(input, rate).unwrap();
        let result = resample(&audio, 44100).unwrap();
        let ideal = sine(220.0, 44100, 44100);
        let mid = 20000..24000;
        let err: f32 = mid
            .clone()
            .map(|i| (result.channels[0][i] - ideal[i]).abs())
            .sum::<f32>()
            / mid.len() as f32;
        assert!(err < 0.05, "mean abs error {}", err);
    }

    fn impulse_peak(quality: ResampleQuality, from: u32, to: u32, at: usize) -> usize {
        let mut input = vec![0.0; from as usize];
        input[at] = 1.0;
        let audio = RawAudio::mono(input, from).unwrap();
        let result = Resampler::new(quality).resample(&audio, to).unwrap();
        result.channels[0]
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.abs().total_cmp(&b.1.abs()))
            .map(|(i, _)| i)
            .unwrap()
    }

    #[test]
    fn test_impulse_stays_aligned() {
        for quality in [ResampleQuality::Fast, ResampleQuality::Normal, ResampleQuality::High] {
            let peak = impulse_peak(quality, 22050, 44100, 10000);
            assert!(peak.abs_diff(20000) <= 1, "{:?} peak at {}", quality, peak);
        }
    }

    #[test]
    fn test_impulse_aligned_when_downsampling() {
        for quality in [ResampleQuality::Fast, ResampleQuality::Normal] {
            let peak = impulse_peak(quality, 48000, 44100, 24000);
            assert!(peak.abs_diff(22050) <= 1, "{:?} peak at {}", quality, peak);
        }
    }

    #[test]
    fn test_leading_samples_kept() {
        // An impulse near the start must survive delay compensation
        let peak = impulse_peak(ResampleQuality::Normal, 22050, 44100, 20);
        assert!(peak.abs_diff(40) <= 1, "peak at {}", peak);
    }

    #[test]
    fn test_fast_quality() {
        let audio = RawAudio::mono(vec![0.25; 3000], 24000).unwrap();
        let result = Resampler::new(ResampleQuality::Fast)
            .resample(&audio, 44100)
            .unwrap();
        assert_eq!(result.num_frames(), output_len(3000, 24000, 44100));
    }

    #[test]
    fn test_output_len_rounds_up() {
        assert_eq!(output_len(3, 3, 2), 2);
        assert_eq!(output_len(661_500, 22050, 44100), 1_323_000);
    }
}
