//! Waveform conditioning ahead of the codec
//!
//! Resample to the model rate, average channels, peak-normalize, then pad or
//! truncate to the lengths the encoder expects.

use anyhow::Result;

use super::{AudioBuffer, RawAudio, Resampler};

/// Resample every channel to `target_rate`, downmix to mono and peak-normalize
pub fn preprocess(audio: &RawAudio, target_rate: u32) -> Result<AudioBuffer> {
    preprocess_with(&Resampler::default(), audio, target_rate)
}

/// [`preprocess`] with an explicit resampler
pub fn preprocess_with(
    resampler: &Resampler,
    audio: &RawAudio,
    target_rate: u32,
) -> Result<AudioBuffer> {
    let resampled = resampler.resample(audio, target_rate)?;
    let mut samples = downmix(&resampled);
    peak_normalize(&mut samples);
    Ok(AudioBuffer::new(samples, target_rate))
}

/// Average the channels of `audio` into a single channel
///
/// Channels of unequal length are cut to the shortest.
pub fn downmix(audio: &RawAudio) -> Vec<f32> {
    match audio.channels.as_slice() {
        [] => Vec::new(),
        [mono] => mono.clone(),
        channels => {
            let frames = channels.iter().map(Vec::len).min().unwrap_or(0);
            let mut mixed = vec![0.0f32; frames];
            for channel in channels {
                for (out, sample) in mixed.iter_mut().zip(channel) {
                    *out += sample;
                }
            }
            let scale = 1.0 / channels.len() as f32;
            mixed.iter_mut().for_each(|s| *s *= scale);
            mixed
        }
    }
}

/// Divide by the peak absolute amplitude so the loudest sample is at +/-1.0.
///
/// All-zero input is left untouched. Returns the peak that was found.
pub fn peak_normalize(samples: &mut [f32]) -> f32 {
    let peak = samples.iter().map(|s| s.abs()).fold(0.0f32, f32::max);
    if peak > 0.0 {
        for sample in samples.iter_mut() {
            *sample /= peak;
        }
    }
    peak
}

/// Append zeros until `samples` holds `target_len` values; longer input is unchanged
pub fn pad_to_length(mut samples: Vec<f32>, target_len: usize) -> Vec<f32> {
    if samples.len() < target_len {
        samples.resize(target_len, 0.0);
    }
    samples
}

/// The leading `seconds` of audio at `sample_rate`
pub fn truncate_seconds(samples: &[f32], sample_rate: u32, seconds: u32) -> &[f32] {
    let max_len = sample_rate as usize * seconds as usize;
    &samples[..samples.len().min(max_len)]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_downmix_averages() {
        let audio = RawAudio::new(vec![vec![1.0, 0.0, -0.5], vec![0.0, 0.0, 0.5]], 44100).unwrap();
        assert_eq!(downmix(&audio), vec![0.5, 0.0, 0.0]);
    }

    #[test]
    fn test_downmix_ragged_channels() {
        // Public fields allow skipping the length check in `RawAudio::new`
        let audio = RawAudio {
            channels: vec![vec![1.0, 1.0, 1.0], vec![0.0, 1.0]],
            sample_rate: 44100,
        };
        assert_eq!(downmix(&audio), vec![0.5, 1.0]);
    }

    #[test]
    fn test_preprocess_stereo_is_mono() {
        let left: Vec<f32> = (0..2205).map(|i| (i as f32 * 0.01).sin() * 0.3).collect();
        let right: Vec<f32> = left.iter().map(|s| s * 0.5).collect();
        let audio = RawAudio::new(vec![left, right], 22050).unwrap();

        let out = preprocess(&audio, 44100).unwrap();
        assert_eq!(out.sample_rate, 44100);
        assert_eq!(out.len(), 4410);
        assert!((out.peak() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_peak_is_one() {
        let mut samples = vec![0.5, -0.25, 0.1];
        let peak = peak_normalize(&mut samples);
        assert!((peak - 0.5).abs() < 1e-6);
        assert!((samples[0] - 1.0).abs() < 1e-6);
        assert!((samples[1] + 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_negative_peak() {
        let mut samples = vec![0.2, -0.8];
        peak_normalize(&mut samples);
        assert_eq!(samples.iter().map(|s| s.abs()).fold(0.0f32, f32::max), 1.0);
    }

    #[test]
    fn test_silence_stays_zero() {
        let audio = RawAudio::mono(vec![0.0; 1000], 44100).unwrap();
        let out = preprocess(&audio, 44100).unwrap();
        assert!(out.samples.iter().all(|&s| s == 0.0));
        assert!(out.samples.iter().all(|s| s.is_finite()));
    }

    #[test]
    fn test_pad_to_length() {
        let padded = pad_to_length(vec![1.0; 10], 16);
        assert_eq!(padded.len(), 16);
        assert!(padded[10..].iter().all(|&s| s == 0.0));
        assert_eq!(pad_to_length(vec![1.0; 20], 16).len(), 20);
    }

    #[test]
    fn test_truncate_seconds() {
        let samples = vec![0.0; 44100 * 30];
        assert_eq!(truncate_seconds(&samples, 44100, 25).len(), 44100 * 25);
        assert_eq!(truncate_seconds(&samples[..100], 44100, 25).len(), 100);
    }
}
