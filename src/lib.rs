//! # jukemir
//!
//! Pure Rust extraction of Jukebox audio embeddings for music information retrieval.
//!
//! Audio is resampled to 44.1 kHz mono, encoded by the Jukebox VQ-VAE, run through
//! the first 36 layers of the 5b top-level prior, and the resulting activations are
//! mean-pooled into a `[pool_windows, 4800]` feature array per track.
//!
//! ## Features
//!
//! - **CPU**: Default, with optional MKL/Accelerate for faster BLAS
//! - **CUDA**: NVIDIA GPU acceleration
//! - **Metal**: Apple Silicon GPU acceleration
//! - **cli**: The `jukemir` command line tool
//!
//! ## Example
//!
//! ```rust,ignore
//! use jukemir::{auto_device, BatchOptions, JukeboxEmbedder};
//! use std::path::Path;
//!
//! let embedder = JukeboxEmbedder::from_checkpoints(
//!     Path::new("vqvae.pth.tar"),
//!     Path::new("prior_level_2.pth.tar"),
//!     auto_device()?,
//! )?;
//! let embedding = embedder.embed_file(Path::new("track.wav"))?;
//! assert_eq!(embedding.dims(), &[32, 4800]);
//!
//! embedder.embed_folder(Path::new("wavs"), Path::new("features"), &BatchOptions::default())?;
//! ```

pub mod audio;
pub mod error;
pub mod models;
pub mod pipeline;

use anyhow::Result;
use candle_core::Device;
use std::path::Path;

/// Re-exports for convenience
pub use audio::{AudioBuffer, RawAudio};
pub use error::EmbedError;
pub use models::config::{presets, JukeboxConfig};
pub use models::{ArtistGenreVocab, Codec, Prior, TopPrior, TrackMetadata, VqVae};
pub use pipeline::{
    BatchOptions, BatchReport, CachePolicy, EmbedOptions, Embedder, FailurePolicy,
};

/// Prior context length in tokens
pub const N_CTX: usize = 8192;

/// Width of the prior activations
pub const ACTIVATION_WIDTH: usize = 4800;

/// Prior layers kept for feature extraction
pub const PRIOR_DEPTH: usize = 36;

/// Default number of pooled time slices per embedding
pub const DEFAULT_POOL_WINDOWS: usize = 32;

/// Embedder backed by the Jukebox VQ-VAE and top-level prior
pub type JukeboxEmbedder = Embedder<VqVae, TopPrior>;

impl Embedder<VqVae, TopPrior> {
    /// Load the 36-layer 5b setup from checkpoint files
    pub fn from_checkpoints(vqvae_path: &Path, prior_path: &Path, device: Device) -> Result<Self> {
        Self::from_config(vqvae_path, prior_path, &presets::jukemir_5b(), device)
    }

    /// Load models described by `config`
    pub fn from_config(
        vqvae_path: &Path,
        prior_path: &Path,
        config: &JukeboxConfig,
        device: Device,
    ) -> Result<Self> {
        Self::from_config_with_vocab(
            vqvae_path,
            prior_path,
            config,
            ArtistGenreVocab::default(),
            device,
        )
    }

    /// Load models described by `config`, resolving artist and genre names with `vocab`
    pub fn from_config_with_vocab(
        vqvae_path: &Path,
        prior_path: &Path,
        config: &JukeboxConfig,
        vocab: ArtistGenreVocab,
        device: Device,
    ) -> Result<Self> {
        tracing::info!("Loading Jukebox models on {}", device_info(&device));
        let (vqvae, prior) =
            models::load_vqvae_and_prior(vqvae_path, prior_path, config, &device)?;
        let labeller = prior.labeller().clone().with_vocab(vocab);
        Ok(Self::new(vqvae, prior.with_labeller(labeller), config.hparams.clone()))
    }
}

/// Load the models and embed every `.wav` file in `input_dir` into `output_dir`
///
/// Existing outputs are recomputed, the first failure aborts the run, and a
/// progress bar is shown.
pub fn embed_from_folder(
    input_dir: &Path,
    output_dir: &Path,
    vqvae_path: &Path,
    prior_path: &Path,
    pool_windows: usize,
    device: Device,
) -> Result<BatchReport> {
    pipeline::pooling::check_windows(N_CTX, pool_windows)?;
    let embedder = JukeboxEmbedder::from_checkpoints(vqvae_path, prior_path, device)?
        .with_pool_windows(pool_windows);
    embedder.embed_folder(input_dir, output_dir, &folder_options())
}

fn folder_options() -> BatchOptions {
    BatchOptions {
        show_progress: true,
        ..Default::default()
    }
}

/// Select the best available device
pub fn auto_device() -> Result<Device> {
    #[cfg(feature = "cuda")]
    {
        if let Ok(device) = Device::cuda_if_available(0) {
            if device.is_cuda() {
                tracing::info!("Using CUDA device");
                return Ok(device);
            }
        }
    }

    #[cfg(feature = "metal")]
    {
        if let Ok(device) = Device::new_metal(0) {
            tracing::info!("Using Metal device");
            return Ok(device);
        }
    }

    tracing::info!("Using CPU device");
    Ok(Device::Cpu)
}

/// Parse a device selector: `auto`, `cpu`, `cuda`, `cuda:N` or `metal`
pub fn parse_device(spec: &str) -> Result<Device> {
    match spec.trim().to_lowercase().as_str() {
        "auto" => auto_device(),
        "cpu" => Ok(Device::Cpu),
        "cuda" => Ok(Device::new_cuda(0)?),
        "metal" => Ok(Device::new_metal(0)?),
        other => match other.strip_prefix("cuda:") {
            Some(index) => {
                let index: usize = index.parse().map_err(|_| {
                    EmbedError::invalid_input(format!("bad CUDA device index in {:?}", spec))
                })?;
                Ok(Device::new_cuda(index)?)
            }
            None => Err(EmbedError::invalid_input(format!(
                "unknown device {:?} (expected auto, cpu, cuda, cuda:N or metal)",
                spec
            ))
            .into()),
        },
    }
}

/// Human-readable device name
pub fn device_info(device: &Device) -> String {
    match device {
        Device::Cpu => "CPU".to_string(),
        Device::Cuda(_) => "CUDA".to_string(),
        Device::Metal(_) => "Metal".to_string(),
    }
}
