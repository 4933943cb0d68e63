//! Audio handling for Jukebox embedding
//!
//! This module provides:
//! - WAV file I/O
//! - Audio resampling
//! - Downmixing, peak normalization, padding and truncation

mod io;
pub mod preprocess;
mod resample;

pub use io::{load_wav, save_wav, save_wav_channels, AudioBuffer, RawAudio};
pub use preprocess::{downmix, pad_to_length, peak_normalize, preprocess, truncate_seconds};
pub use resample::{output_len, resample, ResampleQuality, Resampler};

/// Sample rate the Jukebox codec runs at
pub const JUKEBOX_SAMPLE_RATE: u32 = 44100;

/// Fixed input length before encoding (about 23.77 s at 44.1 kHz)
pub const SAMPLE_LENGTH: usize = 1_048_576;

/// Only the leading seconds of a track are tokenized
pub const TOKENIZE_SECONDS: u32 = 25;
