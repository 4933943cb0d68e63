//! Vector quantization bottleneck
//!
//! Maps each encoder output frame to the index of its nearest codebook entry.

use anyhow::Result;
use candle_core::{Tensor, D};
use candle_nn::{Init, VarBuilder};

/// Codebook for one level
pub struct BottleneckBlock {
    /// Codebook embeddings: [l_bins, emb_width]
    k: Tensor,
    l_bins: usize,
    emb_width: usize,
}

impl BottleneckBlock {
    /// Create from `<vb>.k`
    pub fn new(l_bins: usize, emb_width: usize, vb: VarBuilder) -> Result<Self> {
        let k = vb.get_with_hints(
            (l_bins, emb_width),
            "k",
            Init::Randn {
                mean: 0.0,
                stdev: 1.0,
            },
        )?;
        Ok(Self {
            k,
            l_bins,
            emb_width,
        })
    }

    /// Quantize encoder output to discrete codes
    ///
    /// # Arguments
    /// * `x` - Encoder output of shape [batch, emb_width, frames]
    ///
    /// # Returns
    /// Code indices of shape [batch, frames] (u32)
    pub fn encode(&self, x: &Tensor) -> Result<Tensor> {
        let (batch, width, frames) = x.dims3()?;
        anyhow::ensure!(
            width == self.emb_width,
            "Bottleneck expects {} channels, got {}",
            self.emb_width,
            width
        );

        // [batch, frames, width] -> [batch * frames, width]
        let x_flat = x
            .transpose(1, 2)?
            .contiguous()?
            .reshape((batch * frames, width))?;

        // ||x - k||^2 = ||x||^2 - 2 x.k + ||k||^2
        let x_sq = x_flat.sqr()?.sum_keepdim(D::Minus1)?;
        let k_sq = self.k.sqr()?.sum(D::Minus1)?.unsqueeze(0)?;
        let xk = x_flat.matmul(&self.k.t()?)?;
        let distances = x_sq.broadcast_sub(&(xk * 2.0)?)?.broadcast_add(&k_sq)?;

        let indices = distances.argmin(D::Minus1)?;
        Ok(indices.reshape((batch, frames))?)
    }

    /// Codebook size
    pub fn size(&self) -> usize {
        self.l_bins
    }

    /// Codebook vectors for `indices`
    pub fn dequantize(&self, indices: &Tensor) -> Result<Tensor> {
        let (batch, frames) = indices.dims2()?;
        let flat = self.k.index_select(&indices.flatten_all()?, 0)?;
        Ok(flat.reshape((batch, frames, self.emb_width))?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use std::collections::HashMap;

    fn codebook(device: &Device) -> BottleneckBlock {
        // Four 2-d codes on the axes
        let k = Tensor::new(
            &[[1.0f32, 0.0], [0.0, 1.0], [-1.0, 0.0], [0.0, -1.0]],
            device,
        )
        .unwrap();
        let mut tensors = HashMap::new();
        tensors.insert("k".to_string(), k);
        let vb = VarBuilder::from_tensors(tensors, DType::F32, device);
        BottleneckBlock::new(4, 2, vb).unwrap()
    }

    #[test]
    fn test_nearest_code() {
        let device = Device::Cpu;
        let bottleneck = codebook(&device);
        // [1, 2, 4]: frames (0.9, 0.1), (0.1, 0.8), (-2, 0.3), (0.2, -0.5)
        let x = Tensor::new(&[[[0.9f32, 0.1, -2.0, 0.2], [0.1, 0.8, 0.3, -0.5]]], &device).unwrap();
        let codes = bottleneck.encode(&x).unwrap();
        assert_eq!(codes.dims(), &[1, 4]);
        assert_eq!(codes.to_vec2::<u32>().unwrap(), vec![vec![0, 1, 2, 3]]);
    }

    #[test]
    fn test_dequantize() {
        let device = Device::Cpu;
        let bottleneck = codebook(&device);
        let codes = Tensor::new(&[[2u32, 1]], &device).unwrap();
        let vectors = bottleneck.dequantize(&codes).unwrap();
        assert_eq!(
            vectors.to_vec3::<f32>().unwrap(),
            vec![vec![vec![-1.0, 0.0], vec![0.0, 1.0]]]
        );
    }

    #[test]
    fn test_wrong_width() {
        let device = Device::Cpu;
        let bottleneck = codebook(&device);
        let x = Tensor::zeros((1, 3, 4), DType::F32, &device).unwrap();
        assert!(bottleneck.encode(&x).is_err());
    }
}
