//! Jukebox VQ-VAE, encode path
//!
//! Each level has its own encoder (a chain of conv blocks) and codebook. Audio of
//! shape `[batch, samples, channels]` becomes one token stream per level, with
//! `raw_to_tokens(level)` samples per token.

mod bottleneck;
mod encoder;

pub use bottleneck::BottleneckBlock;
pub use encoder::{Encoder, EncoderConvBlock};

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use std::path::Path;

use super::config::VqVaeConfig;
use super::weights::{self, Weights};
use super::Codec;

pub struct VqVae {
    encoders: Vec<Encoder>,
    bottlenecks: Vec<BottleneckBlock>,
    config: VqVaeConfig,
    device: Device,
}

impl VqVae {
    /// Build all levels from a VarBuilder rooted at the state dict
    pub fn new(config: &VqVaeConfig, vb: VarBuilder) -> Result<Self> {
        config.validate()?;
        let mut encoders = Vec::with_capacity(config.levels);
        let mut bottlenecks = Vec::with_capacity(config.levels);
        for level in 0..config.levels {
            encoders.push(
                Encoder::new(level, config, vb.pp("encoders").pp(level))
                    .with_context(|| format!("Failed to build encoder for level {}", level))?,
            );
            bottlenecks.push(BottleneckBlock::new(
                config.l_bins,
                config.emb_width,
                vb.pp("bottleneck").pp("level_blocks").pp(level),
            )?);
        }
        Ok(Self {
            encoders,
            bottlenecks,
            config: config.clone(),
            device: vb.device().clone(),
        })
    }

    /// Build from loaded tensors
    pub fn from_weights(weights: Weights, config: &VqVaeConfig, device: &Device) -> Result<Self> {
        let vb = VarBuilder::from_tensors(weights, DType::F32, device);
        Self::new(config, vb)
    }

    /// Load encoder and codebook tensors from a checkpoint, skipping the decoder
    pub fn load(path: &Path, config: &VqVaeConfig, device: &Device) -> Result<Self> {
        tracing::info!("Loading VQ-VAE from {}", path.display());
        let weights = weights::load_checkpoint_filtered(path, device, |name| {
            name.starts_with("encoders.") || name.starts_with("bottleneck.")
        })?;
        Self::from_weights(weights, config, device)
    }

    pub fn config(&self) -> &VqVaeConfig {
        &self.config
    }

    /// Tokens for one level; `audio` is [batch, samples, channels]
    pub fn encode_level(&self, audio: &Tensor, level: usize) -> Result<Tensor> {
        anyhow::ensure!(
            level < self.config.levels,
            "Level {} out of range for {} levels",
            level,
            self.config.levels
        );
        let x = preprocess(audio)?;
        let h = self.encoders[level].forward(&x)?;
        self.bottlenecks[level].encode(&h)
    }
}

/// [batch, samples, channels] -> [batch, channels, samples] in F32
fn preprocess(audio: &Tensor) -> Result<Tensor> {
    let (_, _, _) = audio.dims3()?;
    Ok(audio.transpose(1, 2)?.contiguous()?.to_dtype(DType::F32)?)
}

impl Codec for VqVae {
    fn encode(&self, audio: &Tensor) -> Result<Vec<Tensor>> {
        (0..self.config.levels)
            .map(|level| self.encode_level(audio, level))
            .collect()
    }

    fn encode_top(&self, audio: &Tensor) -> Result<Tensor> {
        self.encode_level(audio, self.config.levels - 1)
    }

    fn raw_to_tokens(&self, level: usize) -> usize {
        self.config.raw_to_tokens(level)
    }

    fn device(&self) -> &Device {
        &self.device
    }
}
