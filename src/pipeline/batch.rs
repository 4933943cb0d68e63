//! Sequential embedding of a folder of WAV files
//!
//! Inputs are the `.wav` files of a directory in sorted order; each produces
//! `<output_dir>/<stem>.npy`. Files are written only once their embedding is
//! complete.

use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};

use super::{pooling, Embedder};
use crate::error::{find_embed_error, EmbedError};
use crate::models::{Codec, Prior};

/// What to do when an output file already exists
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CachePolicy {
    /// Recompute and overwrite
    #[default]
    Recompute,
    /// Leave the existing file and move on
    SkipExisting,
}

/// What to do when a file fails to embed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Stop the batch with the error
    #[default]
    Abort,
    /// Record the failure and continue with the next file
    SkipAndContinue,
}

#[derive(Debug, Clone, Default)]
pub struct BatchOptions {
    pub cache: CachePolicy,
    pub on_error: FailurePolicy,
    pub show_progress: bool,
}

/// Outcome of a batch run
#[derive(Debug, Clone, Default)]
pub struct BatchReport {
    /// Output files written
    pub written: Vec<PathBuf>,
    /// Inputs whose output already existed
    pub skipped: Vec<PathBuf>,
    /// Inputs that failed, with the error message
    pub failed: Vec<(PathBuf, String)>,
}

impl BatchReport {
    pub fn processed(&self) -> usize {
        self.written.len() + self.skipped.len() + self.failed.len()
    }
}

/// Sorted paths in `dir` whose file name ends in `.wav`
pub fn list_wav_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = std::fs::read_dir(dir)
        .map_err(|e| EmbedError::resource_load("input directory", dir, e.into()))?;
    let mut files = Vec::new();
    for entry in entries {
        let path = entry
            .with_context(|| format!("Failed to read {}", dir.display()))?
            .path();
        let is_wav = path
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.ends_with(".wav"));
        if is_wav && path.is_file() {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// `<output_dir>/<stem>.npy`
pub fn output_path(output_dir: &Path, input: &Path) -> PathBuf {
    let mut name = input.file_stem().unwrap_or(input.as_os_str()).to_os_string();
    name.push(".npy");
    output_dir.join(name)
}

fn progress_bar(len: usize, visible: bool) -> ProgressBar {
    if !visible {
        return ProgressBar::hidden();
    }
    let bar = ProgressBar::new(len as u64);
    if let Ok(style) = ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
    {
        bar.set_style(style.progress_chars("#>-"));
    }
    bar
}

impl<C: Codec, P: Prior> Embedder<C, P> {
    /// Embed every `.wav` file in `input_dir` into `output_dir`
    pub fn embed_folder(
        &self,
        input_dir: &Path,
        output_dir: &Path,
        options: &BatchOptions,
    ) -> Result<BatchReport> {
        pooling::check_windows(self.prior().n_ctx(), self.options().pool_windows)?;
        let inputs = list_wav_files(input_dir)?;
        std::fs::create_dir_all(output_dir)
            .with_context(|| format!("Failed to create {}", output_dir.display()))?;
        tracing::info!(
            "Embedding {} files from {} into {}",
            inputs.len(),
            input_dir.display(),
            output_dir.display()
        );

        let bar = progress_bar(inputs.len(), options.show_progress);
        let mut report = BatchReport::default();

        for input in &inputs {
            let name = input
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            bar.set_message(name.clone());
            let output = output_path(output_dir, input);

            if options.cache == CachePolicy::SkipExisting && output.exists() {
                tracing::info!("Skipping {}, {} exists", name, output.display());
                report.skipped.push(input.clone());
                bar.inc(1);
                continue;
            }

            match self.embed_to_file(input, &output) {
                Ok(()) => {
                    tracing::info!("Wrote {}", output.display());
                    report.written.push(output);
                }
                Err(err) => {
                    let kind = match find_embed_error(&err) {
                        Some(e) if e.is_invalid_input() => "invalid input",
                        _ => "error",
                    };
                    match options.on_error {
                        FailurePolicy::Abort => {
                            bar.abandon();
                            return Err(err.context(format!("Failed to embed {}", input.display())));
                        }
                        FailurePolicy::SkipAndContinue => {
                            tracing::warn!("Skipping {} ({}): {:#}", name, kind, err);
                            report.failed.push((input.clone(), format!("{:#}", err)));
                        }
                    }
                }
            }
            bar.inc(1);
        }

        bar.finish_with_message("done");
        tracing::info!(
            "Batch finished: {} written, {} skipped, {} failed",
            report.written.len(),
            report.skipped.len(),
            report.failed.len()
        );
        Ok(report)
    }

    /// Embed one file and write it as `.npy`, via a temporary file renamed into place
    ///
    /// The temporary file is removed again if writing or renaming fails.
    pub fn embed_to_file(&self, input: &Path, output: &Path) -> Result<()> {
        let embedding = self.embed_file(input)?;
        let partial = output.with_extension("npy.partial");
        let written = embedding
            .write_npy(&partial)
            .with_context(|| format!("Failed to write {}", partial.display()))
            .and_then(|()| {
                std::fs::rename(&partial, output)
                    .with_context(|| format!("Failed to move {} into place", output.display()))
            });
        if written.is_err() && partial.exists() {
            if let Err(e) = std::fs::remove_file(&partial) {
                tracing::warn!("Could not remove {}: {}", partial.display(), e);
            }
        }
        written
    }
}
