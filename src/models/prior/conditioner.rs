//! Label conditioning: artist/genre start embedding and timing embeddings
//!
//! Label rows are small, so bin indices are computed on the host in f32 and
//! the embedding tables are gathered on the model device.

use anyhow::Result;
use candle_core::{Device, Tensor};

use crate::error::EmbedError;
use crate::models::config::LabelConfig;
use crate::models::weights::{self, Weights};

/// Lookup table `[bins, width]`
struct Embedding {
    weight: Tensor,
}

impl Embedding {
    fn load(weights: &Weights, prefix: &str) -> Result<Self> {
        Ok(Self {
            weight: weights::get(weights, &format!("{}.emb.weight", prefix))?,
        })
    }

    fn bins(&self) -> usize {
        self.weight.dims()[0]
    }

    /// `[rows.len(), n, width]` from `rows` of `n` ids each
    fn lookup(&self, rows: &[Vec<u32>], device: &Device) -> Result<Tensor> {
        let n = rows.first().map_or(0, Vec::len);
        let flat: Vec<u32> = rows.iter().flatten().copied().collect();
        let ids = Tensor::from_vec(flat, rows.len() * n, device)?;
        let width = self.weight.dims()[1];
        Ok(self
            .weight
            .index_select(&ids, 0)?
            .reshape((rows.len(), n, width))?)
    }
}

/// Embeds a time (or time span) as `n_time` interpolated bins over `[pos_min, pos_max)`
pub struct RangeEmbedding {
    emb: Embedding,
    n_time: usize,
    t_bins: usize,
    pos_min: f32,
    pos_max: f32,
    clamp: bool,
}

impl RangeEmbedding {
    fn load(
        weights: &Weights,
        prefix: &str,
        n_time: usize,
        range: (f32, f32),
        clamp: bool,
    ) -> Result<Self> {
        let emb = Embedding::load(weights, prefix)?;
        let t_bins = emb.bins();
        Ok(Self {
            emb,
            n_time,
            t_bins,
            pos_min: range.0,
            pos_max: range.1,
            clamp,
        })
    }

    /// Bin index per interpolated position between `start` and `end`
    pub fn bins(&self, start: f32, end: Option<f32>) -> Result<Vec<u32>> {
        if !(self.pos_min <= start && start < self.pos_max) {
            return Err(EmbedError::invalid_input(format!(
                "position {} outside [{}, {})",
                start, self.pos_min, self.pos_max
            ))
            .into());
        }
        let end = match end {
            Some(end) => {
                let end = if self.clamp {
                    end.clamp(self.pos_min, self.pos_max)
                } else {
                    end
                };
                if !(self.pos_min <= end && end <= self.pos_max) {
                    return Err(EmbedError::invalid_input(format!(
                        "end position {} outside [{}, {}]",
                        end, self.pos_min, self.pos_max
                    ))
                    .into());
                }
                Some(end)
            }
            None => None,
        };

        let positions: Vec<f32> = match (self.n_time, end) {
            (1, _) => vec![start],
            (n, Some(end)) => (0..n)
                .map(|i| start + (end - start) * (i as f32 / n as f32))
                .collect(),
            (_, None) => anyhow::bail!("a span is required for {} time steps", self.n_time),
        };

        let scale = self.t_bins as f32;
        Ok(positions
            .into_iter()
            .map(|p| {
                let normalised = (p - self.pos_min) / (self.pos_max - self.pos_min);
                ((scale * normalised).floor().max(0.0) as u32).min(self.t_bins as u32 - 1)
            })
            .collect())
    }
}

/// Start and position conditioning for a batch of label rows
pub struct LabelEmbeddings {
    /// `[batch, 1, width]`
    pub start_emb: Tensor,
    /// `[batch, n_ctx, width]` when the time signal is enabled
    pub pos_emb: Option<Tensor>,
}

pub struct LabelConditioner {
    artist_emb: Embedding,
    bow_genre_emb: Embedding,
    total_length_emb: Option<RangeEmbedding>,
    absolute_pos_emb: Option<RangeEmbedding>,
    relative_pos_emb: Option<RangeEmbedding>,
    max_bow_genre_size: usize,
    device: Device,
}

impl LabelConditioner {
    /// Load `<prefix>.{artist_emb,bow_genre_emb,...}`
    #[allow(clippy::too_many_arguments)]
    pub fn load(
        weights: &Weights,
        prefix: &str,
        config: &LabelConfig,
        n_ctx: usize,
        sr: u32,
        min_duration: f64,
        max_duration: f64,
        device: &Device,
    ) -> Result<Self> {
        let artist_emb = Embedding::load(weights, &format!("{}.artist_emb", prefix))?;
        let bow_genre_emb = Embedding::load(weights, &format!("{}.bow_genre_emb", prefix))?;

        let (total_length_emb, absolute_pos_emb, relative_pos_emb) = if config.include_time_signal
        {
            let sr = sr as f64;
            let total = ((min_duration * sr) as f32, (max_duration * sr) as f32);
            let absolute = (0.0, (max_duration * sr) as f32);
            (
                Some(RangeEmbedding::load(
                    weights,
                    &format!("{}.total_length_emb", prefix),
                    1,
                    total,
                    false,
                )?),
                Some(RangeEmbedding::load(
                    weights,
                    &format!("{}.absolute_pos_emb", prefix),
                    n_ctx,
                    absolute,
                    false,
                )?),
                Some(RangeEmbedding::load(
                    weights,
                    &format!("{}.relative_pos_emb", prefix),
                    n_ctx,
                    (0.0, 1.0),
                    true,
                )?),
            )
        } else {
            (None, None, None)
        };

        Ok(Self {
            artist_emb,
            bow_genre_emb,
            total_length_emb,
            absolute_pos_emb,
            relative_pos_emb,
            max_bow_genre_size: config.max_bow_genre_size,
            device: device.clone(),
        })
    }

    /// Embed label rows `[total_length, offset, length, artist, genres..]`
    pub fn forward(&self, y: &[Vec<i64>]) -> Result<LabelEmbeddings> {
        let expected = 4 + self.max_bow_genre_size;
        if let Some(row) = y.iter().find(|row| row.len() != expected) {
            return Err(EmbedError::invalid_input(format!(
                "label row has {} fields, expected {}",
                row.len(),
                expected
            ))
            .into());
        }

        let artists: Vec<Vec<u32>> = y.iter().map(|row| vec![row[3].max(0) as u32]).collect();
        let artist_emb = self.artist_emb.lookup(&artists, &self.device)?;

        // Empty genre slots are -1 and contribute nothing
        let genres: Vec<Vec<u32>> = y
            .iter()
            .map(|row| row[4..].iter().map(|&g| g.max(0) as u32).collect())
            .collect();
        let mask: Vec<f32> = y
            .iter()
            .flat_map(|row| row[4..].iter().map(|&g| if g >= 0 { 1.0 } else { 0.0 }))
            .collect();
        let mask = Tensor::from_vec(mask, (y.len(), self.max_bow_genre_size, 1), &self.device)?;
        let genre_emb = self
            .bow_genre_emb
            .lookup(&genres, &self.device)?
            .broadcast_mul(&mask)?
            .sum_keepdim(1)?;

        let start_emb = (genre_emb + artist_emb)?;

        let pos_emb = match (
            &self.total_length_emb,
            &self.absolute_pos_emb,
            &self.relative_pos_emb,
        ) {
            (Some(total_emb), Some(absolute_emb), Some(relative_emb)) => {
                let mut total_bins = Vec::with_capacity(y.len());
                let mut absolute_bins = Vec::with_capacity(y.len());
                let mut relative_bins = Vec::with_capacity(y.len());
                for row in y {
                    let total = row[0] as f32;
                    let start = row[1] as f32;
                    let end = (row[1] + row[2]) as f32;
                    total_bins.push(total_emb.bins(total, None)?);
                    absolute_bins.push(absolute_emb.bins(start, Some(end))?);
                    relative_bins.push(relative_emb.bins(start / total, Some(end / total))?);
                }
                let total = total_emb.emb.lookup(&total_bins, &self.device)?;
                let absolute = absolute_emb.emb.lookup(&absolute_bins, &self.device)?;
                let relative = relative_emb.emb.lookup(&relative_bins, &self.device)?;
                Some(total.broadcast_add(&(absolute + relative)?)?)
            }
            _ => None,
        };

        Ok(LabelEmbeddings { start_emb, pos_emb })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, IndexOp};
    use std::collections::HashMap;

    const WIDTH: usize = 4;

    fn weights(device: &Device) -> Weights {
        let mut w = HashMap::new();
        // artist i -> all entries i, genre i -> all entries 100 * i
        let artist: Vec<f32> = (0..10).flat_map(|i| vec![i as f32; WIDTH]).collect();
        let genre: Vec<f32> = (0..5).flat_map(|i| vec![100.0 * i as f32; WIDTH]).collect();
        w.insert(
            "y_emb.artist_emb.emb.weight".to_string(),
            Tensor::from_vec(artist, (10, WIDTH), device).unwrap(),
        );
        w.insert(
            "y_emb.bow_genre_emb.emb.weight".to_string(),
            Tensor::from_vec(genre, (5, WIDTH), device).unwrap(),
        );
        for name in ["total_length_emb", "absolute_pos_emb", "relative_pos_emb"] {
            w.insert(
                format!("y_emb.{}.emb.weight", name),
                Tensor::ones((8, WIDTH), DType::F32, device).unwrap(),
            );
        }
        w
    }

    fn conditioner(device: &Device) -> LabelConditioner {
        let config = LabelConfig {
            max_bow_genre_size: 2,
            t_bins: 8,
            ..Default::default()
        };
        LabelConditioner::load(&weights(device), "y_emb", &config, 16, 100, 60.0, 600.0, device)
            .unwrap()
    }

    #[test]
    fn test_start_embedding_masks_genre_padding() {
        let device = Device::Cpu;
        let cond = conditioner(&device);
        let out = cond.forward(&[vec![6200, 0, 1600, 3, 2, -1]]).unwrap();
        assert_eq!(out.start_emb.dims(), &[1, 1, WIDTH]);
        let v = out.start_emb.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        // artist 3 + genre 2 (the -1 slot masked)
        assert!(v.iter().all(|&x| (x - 203.0).abs() < 1e-6));
    }

    #[test]
    fn test_position_embedding_shape() {
        let device = Device::Cpu;
        let cond = conditioner(&device);
        let out = cond.forward(&[vec![6200, 0, 1600, 0, 0, -1]]).unwrap();
        let pos = out.pos_emb.unwrap();
        assert_eq!(pos.dims(), &[1, 16, WIDTH]);
        // Each of the three all-ones tables contributes 1
        let first: Vec<f32> = pos.i((0, 0)).unwrap().to_vec1().unwrap();
        assert_eq!(first, vec![3.0; WIDTH]);
    }

    #[test]
    fn test_range_bins() {
        let device = Device::Cpu;
        let cond = conditioner(&device);
        let absolute = cond.absolute_pos_emb.as_ref().unwrap();
        // [0, 60000) in 8 bins, 16 steps from 0 to 30000
        let bins = absolute.bins(0.0, Some(30000.0)).unwrap();
        assert_eq!(bins.len(), 16);
        assert_eq!(bins[0], 0);
        assert_eq!(bins[15], 3);
        assert!(bins.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_total_length_out_of_range() {
        let device = Device::Cpu;
        let cond = conditioner(&device);
        // 60 s minimum at 100 Hz is 6000 samples
        let err = match cond.forward(&[vec![5000, 0, 1600, 0, 0, -1]]) {
            Ok(_) => panic!("expected out-of-range error"),
            Err(e) => e,
        };
        assert!(err.downcast_ref::<EmbedError>().unwrap().is_invalid_input());
    }

    #[test]
    fn test_relative_end_is_clamped() {
        let device = Device::Cpu;
        let cond = conditioner(&device);
        let relative = cond.relative_pos_emb.as_ref().unwrap();
        let bins = relative.bins(0.5, Some(1.5)).unwrap();
        assert_eq!(*bins.last().unwrap(), 7);
    }
}
