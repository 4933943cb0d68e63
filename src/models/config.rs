//! Model configuration for the Jukebox codec and top-level prior
//!
//! Defaults match the released `5b` model, with the prior truncated to the 36
//! layers whose activations are used as features. Set `hparams.prior_depth` to
//! `null` to build every layer of `prior.depth`.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::EmbedError;

/// Everything needed to build the models and the conditioning for a run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JukeboxConfig {
    #[serde(default)]
    pub vqvae: VqVaeConfig,
    #[serde(default)]
    pub prior: PriorConfig,
    #[serde(default)]
    pub hparams: Hyperparams,
}

impl JukeboxConfig {
    /// Load config from a JSON file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| EmbedError::resource_load("config", path, e.into()))?;
        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field invariants
    pub fn validate(&self) -> Result<()> {
        self.vqvae.validate()?;
        self.prior.validate()?;
        if self.prior.level >= self.vqvae.levels {
            return Err(EmbedError::invalid_input(format!(
                "prior level {} but the codec has {} levels",
                self.prior.level, self.vqvae.levels
            ))
            .into());
        }
        if self.prior.bins != self.vqvae.l_bins {
            return Err(EmbedError::invalid_input(format!(
                "prior vocabulary {} does not match codebook size {}",
                self.prior.bins, self.vqvae.l_bins
            ))
            .into());
        }
        Ok(())
    }

    /// Audio samples per token at the prior's level
    pub fn raw_to_tokens(&self) -> usize {
        self.vqvae.raw_to_tokens(self.prior.level)
    }

    /// Number of prior layers actually built
    pub fn prior_depth(&self) -> usize {
        self.hparams
            .prior_depth
            .map_or(self.prior.depth, |depth| depth.min(self.prior.depth))
    }
}

/// Hierarchical VQ-VAE (encoder side)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VqVaeConfig {
    /// Number of token levels
    #[serde(default = "default_levels")]
    pub levels: usize,

    /// Strided convolutions per level
    #[serde(default = "default_downs_t")]
    pub downs_t: Vec<usize>,

    /// Stride of each downsampling convolution per level
    #[serde(default = "default_strides_t")]
    pub strides_t: Vec<usize>,

    /// Bottleneck embedding width
    #[serde(default = "default_emb_width")]
    pub emb_width: usize,

    /// Codebook size
    #[serde(default = "default_l_bins")]
    pub l_bins: usize,

    /// Base conv width
    #[serde(default = "default_vq_width")]
    pub width: usize,

    /// Residual blocks per downsampling step
    #[serde(default = "default_vq_depth")]
    pub depth: usize,

    /// Residual hidden width multiplier
    #[serde(default = "default_m_conv")]
    pub m_conv: f64,

    #[serde(default = "default_dilation_growth_rate")]
    pub dilation_growth_rate: usize,

    /// Reset dilation every `n` residual blocks
    #[serde(default)]
    pub dilation_cycle: Option<usize>,

    /// Per-level width/depth multipliers
    #[serde(default = "default_multipliers")]
    pub multipliers: Vec<usize>,

    /// Input audio channels
    #[serde(default = "default_input_channels")]
    pub input_channels: usize,

    /// Scale residual branches by `1/sqrt(depth)`
    #[serde(default)]
    pub res_scale: bool,
}

impl VqVaeConfig {
    pub fn validate(&self) -> Result<()> {
        for (name, len) in [
            ("downs_t", self.downs_t.len()),
            ("strides_t", self.strides_t.len()),
            ("multipliers", self.multipliers.len()),
        ] {
            if len != self.levels {
                return Err(EmbedError::invalid_input(format!(
                    "vqvae.{} has {} entries for {} levels",
                    name, len, self.levels
                ))
                .into());
            }
        }
        Ok(())
    }

    /// Audio samples per token at `level`
    pub fn raw_to_tokens(&self, level: usize) -> usize {
        self.downs_t
            .iter()
            .zip(&self.strides_t)
            .take(level + 1)
            .map(|(&down, &stride)| stride.pow(down as u32))
            .product()
    }
}

impl Default for VqVaeConfig {
    fn default() -> Self {
        Self {
            levels: default_levels(),
            downs_t: default_downs_t(),
            strides_t: default_strides_t(),
            emb_width: default_emb_width(),
            l_bins: default_l_bins(),
            width: default_vq_width(),
            depth: default_vq_depth(),
            m_conv: default_m_conv(),
            dilation_growth_rate: default_dilation_growth_rate(),
            dilation_cycle: None,
            multipliers: default_multipliers(),
            input_channels: default_input_channels(),
            res_scale: false,
        }
    }
}

/// Conditional autoregressive prior
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriorConfig {
    /// Codec level this prior models
    #[serde(default = "default_prior_level")]
    pub level: usize,

    /// Context length in tokens
    #[serde(default = "default_n_ctx")]
    pub n_ctx: usize,

    /// Hidden width
    #[serde(default = "default_prior_width")]
    pub width: usize,

    /// Number of residual attention blocks to build
    #[serde(default = "default_prior_depth")]
    pub depth: usize,

    #[serde(default = "default_heads")]
    pub heads: usize,

    /// Factorization pattern: 0 dense, 1 row/column, 2 row/column/prev-row, 9 with dense
    #[serde(default = "default_attn_order")]
    pub attn_order: usize,

    /// Number of blocks the context is factored into
    #[serde(default = "default_blocks")]
    pub blocks: usize,

    /// Attention width multiplier
    #[serde(default = "default_m_attn")]
    pub m_attn: f64,

    /// MLP width multiplier
    #[serde(default = "default_m_mlp")]
    pub m_mlp: f64,

    /// Token vocabulary
    #[serde(default = "default_l_bins")]
    pub bins: usize,

    #[serde(default = "default_true")]
    pub add_cond_after_transformer: bool,

    #[serde(default)]
    pub res_scale: bool,

    #[serde(default = "default_layer_norm_eps")]
    pub layer_norm_eps: f64,

    /// MLP nonlinearity
    #[serde(default)]
    pub afn: Activation,

    /// Shortest track the total-length embedding covers, in seconds
    #[serde(default = "default_min_duration")]
    pub min_duration: f64,

    /// Longest track the position embeddings cover, in seconds
    #[serde(default = "default_max_duration")]
    pub max_duration: f64,

    #[serde(default)]
    pub labels: LabelConfig,
}

impl PriorConfig {
    pub fn validate(&self) -> Result<()> {
        let check = |ok: bool, msg: String| -> Result<()> {
            if ok {
                Ok(())
            } else {
                Err(EmbedError::invalid_input(msg).into())
            }
        };
        check(
            self.blocks > 0 && self.n_ctx % self.blocks == 0,
            format!("n_ctx {} is not divisible into {} blocks", self.n_ctx, self.blocks),
        )?;
        check(
            self.heads > 0 && self.attn_width() % self.heads == 0,
            format!(
                "attention width {} is not divisible by {} heads",
                self.attn_width(),
                self.heads
            ),
        )?;
        check(
            self.min_duration < self.max_duration,
            format!(
                "min_duration {} must be below max_duration {}",
                self.min_duration, self.max_duration
            ),
        )
    }

    /// Width of the query/key/value projections
    pub fn attn_width(&self) -> usize {
        (self.width as f64 * self.m_attn) as usize
    }

    pub fn mlp_width(&self) -> usize {
        (self.width as f64 * self.m_mlp) as usize
    }

    pub fn head_dim(&self) -> usize {
        self.attn_width() / self.heads
    }

    /// Tokens per factorization block
    pub fn block_ctx(&self) -> usize {
        self.n_ctx / self.blocks
    }
}

impl Default for PriorConfig {
    fn default() -> Self {
        Self {
            level: default_prior_level(),
            n_ctx: default_n_ctx(),
            width: default_prior_width(),
            depth: default_prior_depth(),
            heads: default_heads(),
            attn_order: default_attn_order(),
            blocks: default_blocks(),
            m_attn: default_m_attn(),
            m_mlp: default_m_mlp(),
            bins: default_l_bins(),
            add_cond_after_transformer: true,
            res_scale: false,
            layer_norm_eps: default_layer_norm_eps(),
            afn: Activation::default(),
            min_duration: default_min_duration(),
            max_duration: default_max_duration(),
            labels: LabelConfig::default(),
        }
    }
}

/// MLP nonlinearity of the prior
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Activation {
    /// `x * sigmoid(1.702 x)`
    #[default]
    QuickGelu,
    /// Tanh approximation
    Gelu,
    Relu,
}

/// Artist/genre/timing label conditioning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabelConfig {
    /// Genre vocabulary size
    #[serde(default = "default_genre_bins")]
    pub genre_bins: usize,

    /// Artist vocabulary size
    #[serde(default = "default_artist_bins")]
    pub artist_bins: usize,

    /// Bins for each timing embedding
    #[serde(default = "default_t_bins")]
    pub t_bins: usize,

    /// Genre slots in the label vector
    #[serde(default = "default_max_bow_genre_size")]
    pub max_bow_genre_size: usize,

    /// Lyric tokens in the label vector
    #[serde(default)]
    pub n_tokens: usize,

    /// Add total-length and position embeddings
    #[serde(default = "default_true")]
    pub include_time_signal: bool,
}

impl LabelConfig {
    /// Length of a label vector: timing fields, artist, genres, lyric tokens
    pub fn label_len(&self) -> usize {
        4 + self.max_bow_genre_size + self.n_tokens
    }
}

impl Default for LabelConfig {
    fn default() -> Self {
        Self {
            genre_bins: default_genre_bins(),
            artist_bins: default_artist_bins(),
            t_bins: default_t_bins(),
            max_bow_genre_size: default_max_bow_genre_size(),
            n_tokens: 0,
            include_time_signal: true,
        }
    }
}

/// Run-level settings shared by the conditioning builder
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hyperparams {
    /// Model sample rate
    #[serde(default = "default_sr")]
    pub sr: u32,

    /// Rows in the conditioning label batch
    #[serde(default = "default_n_samples")]
    pub n_samples: usize,

    /// Track length the placeholder metadata claims, in seconds
    #[serde(default = "default_conditioning_seconds")]
    pub conditioning_seconds: f64,

    /// Layer count the prior is truncated to (None keeps `prior.depth`)
    #[serde(default = "default_truncated_depth")]
    pub prior_depth: Option<usize>,
}

impl Hyperparams {
    /// Placeholder track length in samples, a whole number of tokens
    pub fn conditioning_length(&self, raw_to_tokens: usize) -> usize {
        let samples = (self.conditioning_seconds * self.sr as f64) as usize;
        samples / raw_to_tokens * raw_to_tokens
    }
}

impl Default for Hyperparams {
    fn default() -> Self {
        Self {
            sr: default_sr(),
            n_samples: default_n_samples(),
            conditioning_seconds: default_conditioning_seconds(),
            prior_depth: default_truncated_depth(),
        }
    }
}

// Default values matching Jukebox 5b
fn default_levels() -> usize {
    3
}

fn default_downs_t() -> Vec<usize> {
    vec![3, 2, 2]
}

fn default_strides_t() -> Vec<usize> {
    vec![2, 2, 2]
}

fn default_emb_width() -> usize {
    64
}

fn default_l_bins() -> usize {
    2048
}

fn default_vq_width() -> usize {
    32
}

fn default_vq_depth() -> usize {
    4
}

fn default_m_conv() -> f64 {
    1.0
}

fn default_dilation_growth_rate() -> usize {
    3
}

fn default_multipliers() -> Vec<usize> {
    vec![2, 1, 1]
}

fn default_input_channels() -> usize {
    1
}

fn default_prior_level() -> usize {
    2
}

fn default_n_ctx() -> usize {
    8192
}

fn default_prior_width() -> usize {
    4800
}

fn default_prior_depth() -> usize {
    72
}

fn default_heads() -> usize {
    8
}

fn default_attn_order() -> usize {
    2
}

fn default_blocks() -> usize {
    128
}

fn default_m_attn() -> f64 {
    0.25
}

fn default_m_mlp() -> f64 {
    1.0
}

fn default_layer_norm_eps() -> f64 {
    1e-5
}

fn default_min_duration() -> f64 {
    60.0
}

fn default_max_duration() -> f64 {
    600.0
}

fn default_genre_bins() -> usize {
    604
}

fn default_artist_bins() -> usize {
    7898
}

fn default_t_bins() -> usize {
    64
}

fn default_max_bow_genre_size() -> usize {
    1
}

fn default_sr() -> u32 {
    44100
}

fn default_n_samples() -> usize {
    8
}

fn default_conditioning_seconds() -> f64 {
    62.0
}

fn default_truncated_depth() -> Option<usize> {
    Some(crate::PRIOR_DEPTH)
}

fn default_true() -> bool {
    true
}

/// Ready-made configurations
pub mod presets {
    use super::*;

    /// Jukebox 5b with the prior cut to 36 layers
    pub fn jukemir_5b() -> JukeboxConfig {
        let mut config = JukeboxConfig::default();
        config.hparams.prior_depth = Some(crate::PRIOR_DEPTH);
        config.prior.depth = crate::PRIOR_DEPTH;
        config
    }
}
