//! Audio I/O utilities

use anyhow::{Context, Result};
use candle_core::{Device, Tensor};
use hound::{SampleFormat, WavReader, WavSpec, WavWriter};
use std::path::Path;

use crate::error::EmbedError;

/// Decoded audio as it comes off disk: planar channels at the source sample rate
#[derive(Debug, Clone)]
pub struct RawAudio {
    /// One vector per channel, all the same length
    pub channels: Vec<Vec<f32>>,
    /// Sample rate in Hz
    pub sample_rate: u32,
}

impl RawAudio {
    /// Create from planar channels; every channel must have the same length
    pub fn new(channels: Vec<Vec<f32>>, sample_rate: u32) -> Result<Self> {
        if channels.is_empty() {
            return Err(EmbedError::invalid_input("audio has no channels").into());
        }
        if sample_rate == 0 {
            return Err(EmbedError::invalid_input("sample rate must be positive").into());
        }
        let frames = channels[0].len();
        if let Some(bad) = channels.iter().position(|ch| ch.len() != frames) {
            return Err(EmbedError::invalid_input(format!(
                "channel {} has {} samples, expected {}",
                bad,
                channels[bad].len(),
                frames
            ))
            .into());
        }
        Ok(Self {
            channels,
            sample_rate,
        })
    }

    /// Single-channel audio
    pub fn mono(samples: Vec<f32>, sample_rate: u32) -> Result<Self> {
        Self::new(vec![samples], sample_rate)
    }

    /// Split interleaved frames (`L R L R ...`) into planar channels
    pub fn from_interleaved(samples: &[f32], num_channels: usize, sample_rate: u32) -> Result<Self> {
        if num_channels == 0 || samples.len() % num_channels != 0 {
            return Err(EmbedError::invalid_input(format!(
                "{} interleaved samples do not split into {} channels",
                samples.len(),
                num_channels
            ))
            .into());
        }
        let frames = samples.len() / num_channels;
        let mut channels = vec![Vec::with_capacity(frames); num_channels];
        for frame in samples.chunks_exact(num_channels) {
            for (channel, &sample) in channels.iter_mut().zip(frame) {
                channel.push(sample);
            }
        }
        Self::new(channels, sample_rate)
    }

    pub fn num_channels(&self) -> usize {
        self.channels.len()
    }

    /// Samples per channel
    pub fn num_frames(&self) -> usize {
        self.channels.first().map_or(0, Vec::len)
    }

    /// Duration in seconds
    pub fn duration(&self) -> f32 {
        self.num_frames() as f32 / self.sample_rate as f32
    }

    /// Load from WAV file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        load_wav(path)
    }
}

/// Mono waveform at a known sample rate
#[derive(Debug, Clone)]
pub struct AudioBuffer {
    /// Mono audio samples
    pub samples: Vec<f32>,
    /// Sample rate in Hz
    pub sample_rate: u32,
}

impl AudioBuffer {
    /// Create a new audio buffer
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    /// Convert to a `[1, samples, 1]` tensor, the layout the codec encoder takes
    pub fn to_tensor(&self, device: &Device) -> Result<Tensor> {
        Ok(Tensor::from_slice(
            self.samples.as_slice(),
            (1, self.samples.len(), 1),
            device,
        )?)
    }

    /// Duration in seconds
    pub fn duration(&self) -> f32 {
        self.samples.len() as f32 / self.sample_rate as f32
    }

    /// Number of samples
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Largest absolute sample value
    pub fn peak(&self) -> f32 {
        self.samples.iter().map(|s| s.abs()).fold(0.0f32, f32::max)
    }

    /// Save to WAV file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        save_wav(path, &self.samples, self.sample_rate)
    }
}

/// Load a WAV file, keeping every channel
pub fn load_wav<P: AsRef<Path>>(path: P) -> Result<RawAudio> {
    let path = path.as_ref();
    let reader = WavReader::open(path)
        .with_context(|| format!("Failed to open WAV file: {}", path.display()))?;

    let spec = reader.spec();
    let channels = spec.channels as usize;

    let samples: Vec<f32> = match spec.sample_format {
        SampleFormat::Float => reader
            .into_samples::<f32>()
            .collect::<Result<Vec<_>, _>>()
            .with_context(|| format!("Failed to decode {}", path.display()))?,
        SampleFormat::Int => {
            let bits = spec.bits_per_sample;
            let max_val = (1i64 << (bits - 1)) as f32;
            reader
                .into_samples::<i32>()
                .map(|s| s.map(|v| v as f32 / max_val))
                .collect::<Result<Vec<_>, _>>()
                .with_context(|| format!("Failed to decode {}", path.display()))?
        }
    };

    RawAudio::from_interleaved(&samples, channels, spec.sample_rate)
        .with_context(|| format!("Malformed WAV data in {}", path.display()))
}

/// Save mono samples to a 32-bit float WAV file
pub fn save_wav<P: AsRef<Path>>(path: P, samples: &[f32], sample_rate: u32) -> Result<()> {
    save_wav_channels(path, &[samples.to_vec()], sample_rate)
}

/// Save planar channels to a 32-bit float WAV file
pub fn save_wav_channels<P: AsRef<Path>>(
    path: P,
    channels: &[Vec<f32>],
    sample_rate: u32,
) -> Result<()> {
    let path = path.as_ref();
    let spec = WavSpec {
        channels: channels.len() as u16,
        sample_rate,
        bits_per_sample: 32,
        sample_format: SampleFormat::Float,
    };

    let mut writer = WavWriter::create(path, spec)
        .with_context(|| format!("Failed to create WAV file: {}", path.display()))?;

    let frames = channels.first().map_or(0, Vec::len);
    for i in 0..frames {
        for channel in channels {
            writer.write_sample(channel[i])?;
        }
    }

    writer.finalize()?;
    Ok(())
}
