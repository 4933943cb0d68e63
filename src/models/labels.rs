//! Track metadata to label vectors
//!
//! A label vector is `[total_length, offset, sample_length, artist_id,
//! genre_ids.., lyric_tokens..]`, with unused genre slots set to `-1`.

use anyhow::{Context, Result};
use candle_core::{Device, Tensor};
use std::collections::HashMap;
use std::path::Path;

use super::config::LabelConfig;
use crate::error::EmbedError;

/// Placeholder used for artist and genre when nothing is known about a track
pub const UNKNOWN: &str = "unknown";

/// Placeholder lyrics
pub const PLACEHOLDER_LYRICS: &str = "lyrics go here!!!";

/// Per-track metadata the prior conditions on
#[derive(Debug, Clone, PartialEq)]
pub struct TrackMetadata {
    pub artist: String,
    pub genre: String,
    pub lyrics: String,
    /// Full track length in samples
    pub total_length: usize,
    /// Start of the modelled window in samples
    pub offset: usize,
}

impl TrackMetadata {
    /// Unknown artist and genre, placeholder lyrics, offset 0
    pub fn placeholder(total_length: usize) -> Self {
        Self {
            artist: UNKNOWN.to_string(),
            genre: UNKNOWN.to_string(),
            lyrics: PLACEHOLDER_LYRICS.to_string(),
            total_length,
            offset: 0,
        }
    }
}

/// Name to id tables; names missing from a table map to 0
#[derive(Debug, Clone, Default)]
pub struct ArtistGenreVocab {
    artist_ids: HashMap<String, i64>,
    genre_ids: HashMap<String, i64>,
}

impl ArtistGenreVocab {
    pub fn new(artist_ids: HashMap<String, i64>, genre_ids: HashMap<String, i64>) -> Self {
        Self {
            artist_ids,
            genre_ids,
        }
    }

    /// Read `name;id` tables (one entry per line)
    pub fn from_files(artists: &Path, genres: &Path) -> Result<Self> {
        Ok(Self::new(read_id_table(artists)?, read_id_table(genres)?))
    }

    pub fn artist_id(&self, artist: &str) -> i64 {
        self.artist_ids
            .get(&normalize_name(artist))
            .copied()
            .unwrap_or(0)
    }

    pub fn genre_id(&self, genre: &str) -> i64 {
        self.genre_ids
            .get(&genre.trim().to_lowercase())
            .copied()
            .unwrap_or(0)
    }
}

fn read_id_table(path: &Path) -> Result<HashMap<String, i64>> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| EmbedError::resource_load("label vocabulary", path, e.into()))?;
    let mut table = HashMap::new();
    for (line_no, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let (name, id) = line
            .rsplit_once(';')
            .with_context(|| format!("{}:{}: expected name;id", path.display(), line_no + 1))?;
        let id: i64 = id
            .trim()
            .parse()
            .with_context(|| format!("{}:{}: bad id {:?}", path.display(), line_no + 1, id))?;
        table.insert(normalize_name(name), id);
    }
    Ok(table)
}

/// Lowercase, with runs of anything outside `[a-z0-9]` collapsed to `_`
fn normalize_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.trim().to_lowercase().chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c);
        } else if !out.ends_with('_') {
            out.push('_');
        }
    }
    out
}

/// Character vocabulary for lyrics; id 0 is padding and unknown characters are dropped
#[derive(Debug, Clone)]
pub struct LyricsVocab {
    ids: HashMap<char, i64>,
}

const LYRICS_ALPHABET: &str =
    "ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789.,:;!?-+'\"()[] \t\n";

impl Default for LyricsVocab {
    fn default() -> Self {
        Self::new(LYRICS_ALPHABET)
    }
}

impl LyricsVocab {
    pub fn new(alphabet: &str) -> Self {
        let ids = alphabet
            .chars()
            .enumerate()
            .map(|(i, c)| (c, i as i64 + 1))
            .collect();
        Self { ids }
    }

    pub fn tokenize(&self, text: &str) -> Vec<i64> {
        text.replace('\\', "\n")
            .chars()
            .filter_map(|c| self.ids.get(&c).copied())
            .collect()
    }
}

/// The `n_tokens` lyric tokens centred on the modelled window, left-padded with 0
pub fn relevant_lyric_tokens(
    full_tokens: &[i64],
    n_tokens: usize,
    total_length: usize,
    offset: usize,
    duration: usize,
) -> Vec<i64> {
    if full_tokens.len() < n_tokens {
        let mut tokens = vec![0; n_tokens - full_tokens.len()];
        tokens.extend_from_slice(full_tokens);
        return tokens;
    }
    let half = n_tokens / 2;
    let centre = (offset as f64 + duration as f64 / 2.0) / total_length.max(1) as f64;
    let midpoint = (full_tokens.len() as f64 * centre) as usize;
    let midpoint = midpoint.max(half).min(full_tokens.len() - (n_tokens - half));
    full_tokens[midpoint - half..midpoint - half + n_tokens].to_vec()
}

/// Builds label vectors for a prior
#[derive(Debug, Clone)]
pub struct Labeller {
    vocab: ArtistGenreVocab,
    lyrics: LyricsVocab,
    max_genre_words: usize,
    n_tokens: usize,
    sample_length: usize,
}

impl Labeller {
    /// `sample_length` is the window the prior sees, in audio samples
    pub fn new(config: &LabelConfig, sample_length: usize) -> Self {
        Self {
            vocab: ArtistGenreVocab::default(),
            lyrics: LyricsVocab::default(),
            max_genre_words: config.max_bow_genre_size,
            n_tokens: config.n_tokens,
            sample_length,
        }
    }

    pub fn with_vocab(mut self, vocab: ArtistGenreVocab) -> Self {
        self.vocab = vocab;
        self
    }

    /// Label vector width
    pub fn label_len(&self) -> usize {
        4 + self.max_genre_words + self.n_tokens
    }

    pub fn sample_length(&self) -> usize {
        self.sample_length
    }

    pub fn get_label(&self, meta: &TrackMetadata) -> Result<Vec<i64>> {
        if meta.offset >= meta.total_length.max(1) {
            return Err(EmbedError::invalid_input(format!(
                "offset {} is outside a track of {} samples",
                meta.offset, meta.total_length
            ))
            .into());
        }

        let mut label = Vec::with_capacity(self.label_len());
        label.push(meta.total_length as i64);
        label.push(meta.offset as i64);
        label.push(self.sample_length as i64);
        label.push(self.vocab.artist_id(&meta.artist));

        // Multi-genre labels join names with '_'
        let mut genres: Vec<i64> = meta
            .genre
            .split('_')
            .filter(|g| !g.trim().is_empty())
            .map(|g| self.vocab.genre_id(g))
            .take(self.max_genre_words)
            .collect();
        genres.resize(self.max_genre_words, -1);
        label.extend(genres);

        if self.n_tokens > 0 {
            let full = self.lyrics.tokenize(&meta.lyrics);
            label.extend(relevant_lyric_tokens(
                &full,
                self.n_tokens,
                meta.total_length,
                meta.offset,
                self.sample_length,
            ));
        }
        Ok(label)
    }

    /// Stack label vectors into a `[batch, label_len]` i64 tensor
    pub fn get_batch_labels(&self, metas: &[TrackMetadata], device: &Device) -> Result<Tensor> {
        let mut flat = Vec::with_capacity(metas.len() * self.label_len());
        for meta in metas {
            flat.extend(self.get_label(meta)?);
        }
        Ok(Tensor::from_vec(flat, (metas.len(), self.label_len()), device)?)
    }
}
