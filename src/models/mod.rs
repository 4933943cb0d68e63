//! Neural network models for Jukebox embedding
//!
//! This module contains:
//! - `config`: Model and run configuration
//! - `weights`: Checkpoint loading
//! - `vqvae`: Audio codec (encoder + codebooks)
//! - `labels`: Metadata to label vectors
//! - `prior`: Top-level autoregressive prior
//!
//! The pipeline talks to the models through the [`Codec`] and [`Prior`] traits.

pub mod config;
pub mod labels;
pub mod prior;
pub mod vqvae;
pub mod weights;

pub use config::{JukeboxConfig, PriorConfig, VqVaeConfig};
pub use labels::{ArtistGenreVocab, Labeller, TrackMetadata};
pub use prior::TopPrior;
pub use vqvae::VqVae;

use anyhow::Result;
use candle_core::{Device, Tensor};
use std::path::Path;

/// Turns audio into discrete tokens
pub trait Codec {
    /// Encode `[batch, samples, channels]` audio into one `[batch, tokens]` stream per
    /// level, finest first
    fn encode(&self, audio: &Tensor) -> Result<Vec<Tensor>>;

    /// Tokens of the coarsest level only
    fn encode_top(&self, audio: &Tensor) -> Result<Tensor> {
        self.encode(audio)?
            .pop()
            .ok_or_else(|| anyhow::anyhow!("Codec returned no token levels"))
    }

    /// Audio samples per token at `level`
    fn raw_to_tokens(&self, level: usize) -> usize;

    fn device(&self) -> &Device;
}

/// Conditioning tensors derived from label vectors
#[derive(Debug, Clone)]
pub struct PriorConditioning {
    /// Per-position conditioning `[batch, n_ctx, width]` (or `[batch, 1, width]`)
    pub x_cond: Tensor,
    /// Start-slot conditioning `[batch, 1, width]`
    pub y_cond: Tensor,
    /// Lyric tokens, for priors that condition on them
    pub prime: Option<Tensor>,
}

/// Options for [`Prior::forward`]
#[derive(Debug, Clone, Default)]
pub struct ForwardOptions {
    /// Return hidden states instead of logits
    pub only_encode: bool,
    /// Cached lyric encoder keys/values
    pub encoder_kv: Option<Tensor>,
    /// Run in reduced precision
    pub fp16: bool,
}

impl ForwardOptions {
    /// Full precision, no encoder cache, hidden states out
    pub fn encode_only() -> Self {
        Self {
            only_encode: true,
            encoder_kv: None,
            fp16: false,
        }
    }
}

/// Autoregressive prior over codec tokens
pub trait Prior {
    fn labeller(&self) -> &Labeller;

    /// Context length in tokens
    fn n_ctx(&self) -> usize;

    /// Hidden width
    fn width(&self) -> usize;

    /// Audio samples per token at the prior's level
    fn raw_to_tokens(&self) -> usize;

    fn device(&self) -> &Device;

    /// Adapt label vectors to this prior's window starting at token `start`
    fn get_y(&self, labels: &Tensor, start: usize) -> Result<Tensor>;

    /// Conditioning tensors for label vectors
    fn get_cond(&self, y: &Tensor) -> Result<PriorConditioning>;

    /// Run the prior on tokens `[batch, len]`
    fn forward(
        &self,
        x: &Tensor,
        x_cond: &Tensor,
        y_cond: &Tensor,
        options: &ForwardOptions,
    ) -> Result<Tensor>;
}

/// Load the codec and top-level prior named by `config`
///
/// The prior is truncated to `config.prior_depth()` layers.
pub fn load_vqvae_and_prior(
    vqvae_path: &Path,
    prior_path: &Path,
    config: &JukeboxConfig,
    device: &Device,
) -> Result<(VqVae, TopPrior)> {
    config.validate()?;
    let vqvae = VqVae::load(vqvae_path, &config.vqvae, device)?;
    let prior = TopPrior::load(prior_path, config, device)?;
    tracing::info!(
        "Models ready: {} codec levels, prior with {} layers",
        config.vqvae.levels,
        prior.depth()
    );
    Ok((vqvae, prior))
}
