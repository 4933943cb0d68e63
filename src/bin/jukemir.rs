//! Extract Jukebox embeddings for a folder of WAV files
//!
//! ```sh
//! cargo run --release --features cli --bin jukemir -- \
//!     --input-dir wavs --output-dir features \
//!     --vqvae models/vqvae.pth.tar --prior models/prior_level_2.pth.tar
//! ```

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use jukemir::{
    device_info, parse_device, presets, ArtistGenreVocab, BatchOptions, CachePolicy,
    FailurePolicy, JukeboxConfig, JukeboxEmbedder,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Extract Jukebox embeddings from WAV files")]
struct Args {
    /// Directory of .wav files
    #[arg(short, long)]
    input_dir: PathBuf,

    /// Directory for the .npy outputs
    #[arg(short, long)]
    output_dir: PathBuf,

    /// VQ-VAE checkpoint (.pth.tar or .safetensors)
    #[arg(long)]
    vqvae: PathBuf,

    /// Top-level prior checkpoint (.pth.tar or .safetensors)
    #[arg(long)]
    prior: PathBuf,

    /// Number of time slices averaged into output rows (must divide 8192)
    #[arg(long, default_value_t = jukemir::DEFAULT_POOL_WINDOWS)]
    pool_windows: usize,

    /// Device: auto, cpu, cuda, cuda:N, metal
    #[arg(long, default_value = "auto")]
    device: String,

    /// Model configuration JSON; missing fields take the 36-layer 5b values
    #[arg(long)]
    config: Option<PathBuf>,

    /// Artist id table (`name;id` per line) for the label conditioning
    #[arg(long, requires = "genre_ids")]
    artist_ids: Option<PathBuf>,

    /// Genre id table (`name;id` per line) for the label conditioning
    #[arg(long, requires = "artist_ids")]
    genre_ids: Option<PathBuf>,

    /// Keep outputs that already exist instead of recomputing them
    #[arg(long)]
    skip_existing: bool,

    /// Log failed files and keep going instead of stopping
    #[arg(long)]
    continue_on_error: bool,

    /// Hide the progress bar
    #[arg(long)]
    quiet: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();

    let device = parse_device(&args.device)?;
    println!("Device: {}", device_info(&device));

    let config = match &args.config {
        Some(path) => JukeboxConfig::from_file(path)?,
        None => presets::jukemir_5b(),
    };

    jukemir::pipeline::pooling::check_windows(config.prior.n_ctx, args.pool_windows)?;

    let vocab = match (&args.artist_ids, &args.genre_ids) {
        (Some(artists), Some(genres)) => ArtistGenreVocab::from_files(artists, genres)?,
        _ => ArtistGenreVocab::default(),
    };

    let embedder =
        JukeboxEmbedder::from_config_with_vocab(&args.vqvae, &args.prior, &config, vocab, device)?
            .with_pool_windows(args.pool_windows);

    let options = BatchOptions {
        cache: if args.skip_existing {
            CachePolicy::SkipExisting
        } else {
            CachePolicy::Recompute
        },
        on_error: if args.continue_on_error {
            FailurePolicy::SkipAndContinue
        } else {
            FailurePolicy::Abort
        },
        show_progress: !args.quiet,
    };

    let report = embedder.embed_folder(&args.input_dir, &args.output_dir, &options)?;

    println!(
        "Wrote {} embeddings ({} skipped, {} failed)",
        report.written.len(),
        report.skipped.len(),
        report.failed.len()
    );
    for (path, reason) in &report.failed {
        eprintln!("  {}: {}", path.display(), reason);
    }

    Ok(())
}
