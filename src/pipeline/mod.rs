//! Audio to embedding
//!
//! [`Embedder`] owns a codec and a prior and runs the per-track steps:
//! preprocess, tokenize, condition, extract activations, pool. The
//! conditioning for the placeholder metadata is built on first use and reused
//! for every track.

pub mod batch;
pub mod pooling;

pub use batch::{BatchOptions, BatchReport, CachePolicy, FailurePolicy};
pub use pooling::mean_pool;

use anyhow::{Context, Result};
use candle_core::{DType, IndexOp, Tensor};
use std::path::Path;
use std::sync::OnceLock;

use crate::audio::{self, AudioBuffer, RawAudio, ResampleQuality, Resampler};
use crate::error::EmbedError;
use crate::models::config::Hyperparams;
use crate::models::{Codec, ForwardOptions, Prior, TrackMetadata};

/// Per-run embedding settings
#[derive(Debug, Clone)]
pub struct EmbedOptions {
    /// Equal time slices averaged into output rows
    pub pool_windows: usize,
    /// Audio shorter than this is zero padded before encoding
    pub sample_length: usize,
    /// Only this many leading seconds are tokenized
    pub tokenize_seconds: u32,
    pub resample_quality: ResampleQuality,
}

impl Default for EmbedOptions {
    fn default() -> Self {
        Self {
            pool_windows: crate::DEFAULT_POOL_WINDOWS,
            sample_length: audio::SAMPLE_LENGTH,
            tokenize_seconds: audio::TOKENIZE_SECONDS,
            resample_quality: ResampleQuality::default(),
        }
    }
}

/// Prior conditioning trimmed to one batch row and the prior context
#[derive(Debug, Clone)]
pub struct Conditioning {
    /// `[1, n_ctx, width]`
    pub x_cond: Tensor,
    /// `[1, 1, width]`
    pub y_cond: Tensor,
}

pub struct Embedder<C: Codec, P: Prior> {
    codec: C,
    prior: P,
    hparams: Hyperparams,
    options: EmbedOptions,
    placeholder: OnceLock<Conditioning>,
}

impl<C: Codec, P: Prior> Embedder<C, P> {
    pub fn new(codec: C, prior: P, hparams: Hyperparams) -> Self {
        Self {
            codec,
            prior,
            hparams,
            options: EmbedOptions::default(),
            placeholder: OnceLock::new(),
        }
    }

    pub fn with_options(mut self, options: EmbedOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_pool_windows(mut self, pool_windows: usize) -> Self {
        self.options.pool_windows = pool_windows;
        self
    }

    pub fn codec(&self) -> &C {
        &self.codec
    }

    pub fn prior(&self) -> &P {
        &self.prior
    }

    pub fn hparams(&self) -> &Hyperparams {
        &self.hparams
    }

    pub fn options(&self) -> &EmbedOptions {
        &self.options
    }

    /// Resample, downmix, normalize and pad to the fixed sample length
    pub fn preprocess(&self, audio: &RawAudio) -> Result<AudioBuffer> {
        let resampler = Resampler::new(self.options.resample_quality);
        let mut buffer = audio::preprocess::preprocess_with(&resampler, audio, self.hparams.sr)?;
        buffer.samples = audio::pad_to_length(buffer.samples, self.options.sample_length);
        Ok(buffer)
    }

    /// Codec tokens `[1, L]` of the leading seconds of `audio`
    ///
    /// Fails with [`EmbedError::AudioTooShort`] when `L` is below the prior context.
    pub fn tokenize(&self, audio: &AudioBuffer) -> Result<Tensor> {
        let samples =
            audio::truncate_seconds(&audio.samples, audio.sample_rate, self.options.tokenize_seconds);
        let x = Tensor::from_slice(samples, (1, samples.len(), 1), self.codec.device())?;

        let z = self
            .codec
            .encode_top(&x)
            .map_err(|e| EmbedError::computation("codec encode", e))?;
        let z = z.flatten_all()?.unsqueeze(0)?;

        let tokens = z.dim(1)?;
        let required = self.prior.n_ctx();
        if tokens < required {
            return Err(EmbedError::AudioTooShort { tokens, required }.into());
        }
        tracing::debug!("Tokenized {} samples into {} tokens", samples.len(), tokens);
        Ok(z)
    }

    /// Metadata used when nothing is known about the tracks
    pub fn placeholder_metadata(&self) -> TrackMetadata {
        let total_length = self
            .hparams
            .conditioning_length(self.prior.raw_to_tokens());
        TrackMetadata::placeholder(total_length)
    }

    /// Conditioning for `meta`
    ///
    /// All `n_samples` label rows are identical, so only the first is embedded.
    pub fn build_conditioning(&self, meta: &TrackMetadata) -> Result<Conditioning> {
        let n_ctx = self.prior.n_ctx();
        let metas = vec![meta.clone(); self.hparams.n_samples.max(1)];
        let labels = self
            .prior
            .labeller()
            .get_batch_labels(&metas, self.prior.device())?;
        let y = self.prior.get_y(&labels, 0)?.narrow(0, 0, 1)?;
        let cond = self
            .prior
            .get_cond(&y)
            .context("Failed to build prior conditioning")?;

        let x_cond = cond.x_cond.i(0)?;
        let x_cond = if x_cond.dim(0)? > n_ctx {
            x_cond.narrow(0, 0, n_ctx)?
        } else {
            x_cond
        };
        Ok(Conditioning {
            x_cond: x_cond.unsqueeze(0)?,
            y_cond: cond.y_cond.i(0)?.unsqueeze(0)?,
        })
    }

    /// Placeholder conditioning, built once per embedder
    pub fn conditioning(&self) -> Result<&Conditioning> {
        if let Some(cond) = self.placeholder.get() {
            return Ok(cond);
        }
        let cond = self.build_conditioning(&self.placeholder_metadata())?;
        tracing::debug!("Built placeholder conditioning");
        Ok(self.placeholder.get_or_init(|| cond))
    }

    /// Encode-only prior activations `[1, n_ctx, width]` for the first `n_ctx` tokens
    pub fn final_activations(&self, z: &Tensor, cond: &Conditioning) -> Result<Tensor> {
        let x = z.narrow(1, 0, self.prior.n_ctx())?;
        let acts = self
            .prior
            .forward(
                &x,
                &cond.x_cond,
                &cond.y_cond,
                &ForwardOptions::encode_only(),
            )
            .map_err(|e| EmbedError::computation("prior forward", e))?;
        tracing::debug!("Prior activations {:?}", acts.dims());
        Ok(acts)
    }

    /// Embedding `[pool_windows, width]` for decoded audio
    pub fn embed_array(&self, audio: &RawAudio) -> Result<Tensor> {
        self.embed_with(audio, self.conditioning()?)
    }

    /// Embedding conditioned on explicit track metadata
    pub fn embed_array_with_metadata(&self, audio: &RawAudio, meta: &TrackMetadata) -> Result<Tensor> {
        let cond = self.build_conditioning(meta)?;
        self.embed_with(audio, &cond)
    }

    /// Embedding for a WAV file
    pub fn embed_file(&self, path: &Path) -> Result<Tensor> {
        let audio = audio::load_wav(path)
            .map_err(|e| EmbedError::resource_load("audio", path, e))?;
        self.embed_array(&audio)
    }

    fn embed_with(&self, audio: &RawAudio, cond: &Conditioning) -> Result<Tensor> {
        pooling::check_windows(self.prior.n_ctx(), self.options.pool_windows)?;

        let buffer = self.preprocess(audio)?;
        let z = self.tokenize(&buffer)?;
        let acts = self.final_activations(&z, cond)?;
        let acts = acts.squeeze(0)?.to_dtype(DType::F32)?;
        let pooled = mean_pool(&acts, self.options.pool_windows)?;
        Ok(pooled.to_device(&candle_core::Device::Cpu)?)
    }
}
