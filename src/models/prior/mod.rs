//! Top-level Jukebox prior
//!
//! Label conditioning plus the autoregressive transformer. Only the encode
//! path is used for embeddings, but logits are available for inspection.

mod conditioner;
mod transformer;

pub use conditioner::{LabelConditioner, LabelEmbeddings, RangeEmbedding};
pub use transformer::{AttentionKind, ConditionalAutoregressive, ATTN_MODS_PREFIX};

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use std::path::Path;

use super::config::{JukeboxConfig, PriorConfig};
use super::labels::Labeller;
use super::weights::{self, Weights};
use super::{ForwardOptions, Prior, PriorConditioning};
use crate::error::EmbedError;

pub struct TopPrior {
    transformer: ConditionalAutoregressive,
    conditioner: LabelConditioner,
    labeller: Labeller,
    config: PriorConfig,
    raw_to_tokens: usize,
    device: Device,
}

impl TopPrior {
    /// Build from loaded tensors; `config.depth` layers are used
    pub fn from_weights(
        weights: &Weights,
        config: &PriorConfig,
        raw_to_tokens: usize,
        sr: u32,
        device: &Device,
    ) -> Result<Self> {
        config.validate()?;
        let transformer = ConditionalAutoregressive::load(weights, config)
            .context("Failed to build prior transformer")?;
        let conditioner = LabelConditioner::load(
            weights,
            "y_emb",
            &config.labels,
            config.n_ctx,
            sr,
            config.min_duration,
            config.max_duration,
            device,
        )
        .context("Failed to build label conditioner")?;
        let sample_length = config.n_ctx * raw_to_tokens;

        Ok(Self {
            transformer,
            conditioner,
            labeller: Labeller::new(&config.labels, sample_length),
            config: config.clone(),
            raw_to_tokens,
            device: device.clone(),
        })
    }

    /// Load the prior from a checkpoint, truncated to `hparams.prior_depth` layers when set
    pub fn load(path: &Path, config: &JukeboxConfig, device: &Device) -> Result<Self> {
        let mut prior_config = config.prior.clone();
        prior_config.depth = config.prior_depth();
        tracing::info!(
            "Loading prior from {} ({} layers)",
            path.display(),
            prior_config.depth
        );

        let depth = prior_config.depth;
        let weights = weights::load_checkpoint_filtered(path, device, |name| {
            keep_prior_weight(name, depth)
        })?;
        Self::from_weights(
            &weights,
            &prior_config,
            config.raw_to_tokens(),
            config.hparams.sr,
            device,
        )
    }

    /// Replace the labeller, e.g. to attach artist/genre vocabularies
    pub fn with_labeller(mut self, labeller: Labeller) -> Self {
        self.labeller = labeller;
        self
    }

    pub fn config(&self) -> &PriorConfig {
        &self.config
    }

    pub fn depth(&self) -> usize {
        self.transformer.depth()
    }

    /// Window length the prior models, in audio samples
    pub fn sample_length(&self) -> usize {
        self.config.n_ctx * self.raw_to_tokens
    }
}

/// Transformer layers past `depth` and anything outside the prior and its labels are skipped
pub fn keep_prior_weight(name: &str, depth: usize) -> bool {
    if let Some(index) = weights::layer_index(name, ATTN_MODS_PREFIX) {
        return index < depth;
    }
    name.starts_with("prior.") || name.starts_with("y_emb.")
}

impl Prior for TopPrior {
    fn labeller(&self) -> &Labeller {
        &self.labeller
    }

    fn n_ctx(&self) -> usize {
        self.config.n_ctx
    }

    fn width(&self) -> usize {
        self.config.width
    }

    fn raw_to_tokens(&self) -> usize {
        self.raw_to_tokens
    }

    fn device(&self) -> &Device {
        &self.device
    }

    fn get_y(&self, labels: &Tensor, start: usize) -> Result<Tensor> {
        let (batch, cols) = labels.dims2()?;
        if cols != self.labeller.label_len() {
            return Err(EmbedError::invalid_input(format!(
                "labels have {} columns, expected {}",
                cols,
                self.labeller.label_len()
            ))
            .into());
        }
        let mut rows = labels.to_dtype(DType::I64)?.to_vec2::<i64>()?;
        for row in &mut rows {
            row[2] = self.sample_length() as i64;
            row[1] += (start * self.raw_to_tokens) as i64;
        }
        let flat: Vec<i64> = rows.into_iter().flatten().collect();
        Ok(Tensor::from_vec(flat, (batch, cols), labels.device())?)
    }

    fn get_cond(&self, y: &Tensor) -> Result<PriorConditioning> {
        let (batch, cols) = y.dims2()?;
        if cols != self.labeller.label_len() {
            return Err(EmbedError::invalid_input(format!(
                "labels have {} columns, expected {}",
                cols,
                self.labeller.label_len()
            ))
            .into());
        }
        let n_labels = cols - self.config.labels.n_tokens;
        let rows = y.to_dtype(DType::I64)?.to_vec2::<i64>()?;
        let label_rows: Vec<Vec<i64>> = rows.iter().map(|r| r[..n_labels].to_vec()).collect();

        let embeddings = self.conditioner.forward(&label_rows)?;
        let x_cond = match embeddings.pos_emb {
            Some(pos) => pos,
            None => Tensor::zeros((batch, 1, self.config.width), DType::F32, &self.device)?,
        };
        let prime = if self.config.labels.n_tokens > 0 {
            Some(y.narrow(1, n_labels, self.config.labels.n_tokens)?)
        } else {
            None
        };

        Ok(PriorConditioning {
            x_cond,
            y_cond: embeddings.start_emb,
            prime,
        })
    }

    fn forward(
        &self,
        x: &Tensor,
        x_cond: &Tensor,
        y_cond: &Tensor,
        options: &ForwardOptions,
    ) -> Result<Tensor> {
        if options.encoder_kv.is_some() {
            return Err(EmbedError::invalid_input(
                "encoder key/value conditioning is not supported by this prior",
            )
            .into());
        }
        if options.fp16 {
            return Err(EmbedError::invalid_input("half precision forward is not supported").into());
        }
        let h = self.transformer.encode(x, x_cond, Some(y_cond))?;
        if options.only_encode {
            Ok(h)
        } else {
            self.transformer.logits(&h)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::config::LabelConfig;
    use crate::models::labels::TrackMetadata;
    use candle_core::IndexOp;
    use std::collections::HashMap;

    const N_CTX: usize = 16;
    const WIDTH: usize = 8;
    const BINS: usize = 32;

    fn tiny_config() -> PriorConfig {
        PriorConfig {
            n_ctx: N_CTX,
            width: WIDTH,
            depth: 3,
            heads: 2,
            attn_order: 2,
            blocks: 4,
            m_attn: 0.5,
            m_mlp: 2.0,
            bins: BINS,
            labels: LabelConfig {
                genre_bins: 6,
                artist_bins: 5,
                t_bins: 8,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn random_weights(config: &PriorConfig, layers: usize, device: &Device) -> Weights {
        let mut w = HashMap::new();
        let mut put = |name: String, shape: &[usize]| {
            let t = Tensor::randn(0f32, 0.1, shape, device).unwrap();
            w.insert(name, t);
        };
        let (width, attn, mlp) = (config.width, config.attn_width(), config.mlp_width());
        put("prior.x_emb.weight".into(), &[config.bins, width]);
        put("prior.pos_emb.pos_emb".into(), &[config.n_ctx, width]);
        for i in 0..layers {
            let p = format!("{}{}", ATTN_MODS_PREFIX, i);
            put(format!("{}.attn.c_attn.w", p), &[width, 3 * attn]);
            put(format!("{}.attn.c_attn.b", p), &[3 * attn]);
            put(format!("{}.attn.c_proj.w", p), &[attn, width]);
            put(format!("{}.attn.c_proj.b", p), &[width]);
            put(format!("{}.mlp.c_fc.w", p), &[width, mlp]);
            put(format!("{}.mlp.c_fc.b", p), &[mlp]);
            put(format!("{}.mlp.c_proj.w", p), &[mlp, width]);
            put(format!("{}.mlp.c_proj.b", p), &[width]);
            put(format!("{}.ln_0.weight", p), &[width]);
            put(format!("{}.ln_0.bias", p), &[width]);
            put(format!("{}.ln_1.weight", p), &[width]);
            put(format!("{}.ln_1.bias", p), &[width]);
        }
        let labels = &config.labels;
        put("y_emb.artist_emb.emb.weight".into(), &[labels.artist_bins, width]);
        put("y_emb.bow_genre_emb.emb.weight".into(), &[labels.genre_bins, width]);
        for name in ["total_length_emb", "absolute_pos_emb", "relative_pos_emb"] {
            put(format!("y_emb.{}.emb.weight", name), &[labels.t_bins, width]);
        }
        w
    }

    fn tiny_prior(device: &Device) -> TopPrior {
        let config = tiny_config();
        let weights = random_weights(&config, 3, device);
        TopPrior::from_weights(&weights, &config, 128, 44100, device).unwrap()
    }

    fn conditioning(prior: &TopPrior) -> PriorConditioning {
        let meta = TrackMetadata::placeholder(2_734_080);
        let labels = prior
            .labeller()
            .get_batch_labels(&[meta], prior.device())
            .unwrap();
        let y = prior.get_y(&labels, 0).unwrap();
        prior.get_cond(&y).unwrap()
    }

    fn tokens(values: &[u32], device: &Device) -> Tensor {
        Tensor::new(values, device).unwrap().unsqueeze(0).unwrap()
    }

    #[test]
    fn test_get_y_sets_sample_length_and_offset() {
        let device = Device::Cpu;
        let prior = tiny_prior(&device);
        let labels = Tensor::new(&[[2_734_080i64, 0, 5, 0, 0]], &device).unwrap();
        let y = prior.get_y(&labels, 3).unwrap().to_vec2::<i64>().unwrap();
        assert_eq!(y[0][2], (N_CTX * 128) as i64);
        assert_eq!(y[0][1], 3 * 128);
    }

    #[test]
    fn test_conditioning_shapes() {
        let device = Device::Cpu;
        let prior = tiny_prior(&device);
        let cond = conditioning(&prior);
        assert_eq!(cond.x_cond.dims(), &[1, N_CTX, WIDTH]);
        assert_eq!(cond.y_cond.dims(), &[1, 1, WIDTH]);
        assert!(cond.prime.is_none());
    }

    #[test]
    fn test_encode_only_returns_activations() {
        let device = Device::Cpu;
        let prior = tiny_prior(&device);
        let cond = conditioning(&prior);
        let x = tokens(&(0..N_CTX as u32).collect::<Vec<_>>(), &device);

        let acts = prior
            .forward(&x, &cond.x_cond, &cond.y_cond, &ForwardOptions::encode_only())
            .unwrap();
        assert_eq!(acts.dims(), &[1, N_CTX, WIDTH]);

        let logits = prior
            .forward(&x, &cond.x_cond, &cond.y_cond, &ForwardOptions::default())
            .unwrap();
        assert_eq!(logits.dims(), &[1, N_CTX, BINS]);
    }

    #[test]
    fn test_activations_are_causal() {
        let device = Device::Cpu;
        let prior = tiny_prior(&device);
        let cond = conditioning(&prior);

        let mut values: Vec<u32> = (0..N_CTX as u32).collect();
        let before = prior
            .forward(
                &tokens(&values, &device),
                &cond.x_cond,
                &cond.y_cond,
                &ForwardOptions::encode_only(),
            )
            .unwrap();
        values[9] = 31;
        let after = prior
            .forward(
                &tokens(&values, &device),
                &cond.x_cond,
                &cond.y_cond,
                &ForwardOptions::encode_only(),
            )
            .unwrap();

        // Token 9 is first visible at position 10
        let diff = (before.i((0, ..10)).unwrap() - after.i((0, ..10)).unwrap())
            .unwrap()
            .abs()
            .unwrap()
            .max_keepdim(0)
            .unwrap()
            .max_keepdim(1)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1::<f32>()
            .unwrap()[0];
        assert!(diff < 1e-5, "earlier positions changed by {}", diff);

        let later = (before.i((0, 10..)).unwrap() - after.i((0, 10..)).unwrap())
            .unwrap()
            .abs()
            .unwrap()
            .sum_all()
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!(later > 0.0);
    }

    #[test]
    fn test_rejects_unsupported_options() {
        let device = Device::Cpu;
        let prior = tiny_prior(&device);
        let cond = conditioning(&prior);
        let x = tokens(&[0; N_CTX], &device);
        let options = ForwardOptions {
            fp16: true,
            ..ForwardOptions::encode_only()
        };
        assert!(prior
            .forward(&x, &cond.x_cond, &cond.y_cond, &options)
            .is_err());
    }

    #[test]
    fn test_truncated_depth_ignores_extra_layers() {
        let device = Device::Cpu;
        let mut config = tiny_config();
        let weights = random_weights(&config, 6, &device);
        config.depth = 2;
        let prior = TopPrior::from_weights(&weights, &config, 128, 44100, &device).unwrap();
        assert_eq!(prior.depth(), 2);
    }

    #[test]
    fn test_missing_layer_fails() {
        let device = Device::Cpu;
        let mut config = tiny_config();
        let weights = random_weights(&config, 2, &device);
        config.depth = 3;
        assert!(TopPrior::from_weights(&weights, &config, 128, 44100, &device).is_err());
    }

    #[test]
    fn test_keep_prior_weight() {
        assert!(keep_prior_weight("prior.transformer._attn_mods.35.ln_0.weight", 36));
        assert!(!keep_prior_weight("prior.transformer._attn_mods.36.ln_0.weight", 36));
        assert!(keep_prior_weight("prior.x_emb.weight", 36));
        assert!(keep_prior_weight("y_emb.artist_emb.emb.weight", 36));
        assert!(!keep_prior_weight("conditioner_blocks.0.x_emb.weight", 36));
    }
}
