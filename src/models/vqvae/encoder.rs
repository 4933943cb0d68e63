//! Convolutional encoder stack
//!
//! Weight layout follows the Jukebox state dict:
//! `level_blocks.{b}.model.{i}.0` is the i-th strided conv, `.{i}.1.model.{d}` its
//! residual blocks, and `level_blocks.{b}.model.{downs}` the output projection.

use anyhow::Result;
use candle_core::{Module, Tensor};
use candle_nn::{conv1d, Conv1d, Conv1dConfig, VarBuilder};

use crate::models::config::VqVaeConfig;

/// ReLU -> dilated conv3 -> ReLU -> conv1, added back to the input
struct ResConv1dBlock {
    conv_dilated: Conv1d,
    conv_out: Conv1d,
    res_scale: f64,
}

impl ResConv1dBlock {
    fn new(
        n_in: usize,
        n_state: usize,
        dilation: usize,
        res_scale: f64,
        vb: VarBuilder,
    ) -> Result<Self> {
        let conv_dilated = conv1d(
            n_in,
            n_state,
            3,
            Conv1dConfig {
                padding: dilation,
                dilation,
                ..Default::default()
            },
            vb.pp("1"),
        )?;
        let conv_out = conv1d(n_state, n_in, 1, Default::default(), vb.pp("3"))?;
        Ok(Self {
            conv_dilated,
            conv_out,
            res_scale,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let h = self.conv_dilated.forward(&x.relu()?)?;
        let h = self.conv_out.forward(&h.relu()?)?;
        if self.res_scale == 1.0 {
            Ok((x + h)?)
        } else {
            Ok((x + (h * self.res_scale)?)?)
        }
    }
}

/// Stack of residual blocks with growing dilation
struct Resnet1d {
    blocks: Vec<ResConv1dBlock>,
}

impl Resnet1d {
    fn new(width: usize, depth: usize, config: &VqVaeConfig, vb: VarBuilder) -> Result<Self> {
        let n_state = (width as f64 * config.m_conv) as usize;
        let res_scale = if config.res_scale {
            1.0 / (depth as f64).sqrt()
        } else {
            1.0
        };
        let vb = vb.pp("model");
        let blocks = (0..depth)
            .map(|d| {
                let exponent = match config.dilation_cycle {
                    Some(cycle) if cycle > 0 => d % cycle,
                    _ => d,
                };
                let dilation = config.dilation_growth_rate.pow(exponent as u32);
                ResConv1dBlock::new(width, n_state, dilation, res_scale, vb.pp(d).pp("model"))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { blocks })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let mut h = x.clone();
        for block in &self.blocks {
            h = block.forward(&h)?;
        }
        Ok(h)
    }
}

/// `down_t` strided downsampling steps followed by a projection to the embedding width
pub struct EncoderConvBlock {
    downs: Vec<(Conv1d, Resnet1d)>,
    proj: Conv1d,
}

impl EncoderConvBlock {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        input_width: usize,
        output_width: usize,
        down_t: usize,
        stride_t: usize,
        width: usize,
        depth: usize,
        config: &VqVaeConfig,
        vb: VarBuilder,
    ) -> Result<Self> {
        let vb = vb.pp("model");
        let down_cfg = Conv1dConfig {
            padding: stride_t / 2,
            stride: stride_t,
            ..Default::default()
        };
        let mut downs = Vec::with_capacity(down_t);
        for i in 0..down_t {
            let in_ch = if i == 0 { input_width } else { width };
            let conv = conv1d(in_ch, width, stride_t * 2, down_cfg, vb.pp(i).pp("0"))?;
            let resnet = Resnet1d::new(width, depth, config, vb.pp(i).pp("1"))?;
            downs.push((conv, resnet));
        }
        let proj = conv1d(
            width,
            output_width,
            3,
            Conv1dConfig {
                padding: 1,
                ..Default::default()
            },
            vb.pp(down_t),
        )?;
        Ok(Self { downs, proj })
    }

    /// [batch, channels, time] -> [batch, output_width, time / stride^down_t]
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let mut h = x.clone();
        for (conv, resnet) in &self.downs {
            h = conv.forward(&h)?;
            h = resnet.forward(&h)?;
        }
        Ok(self.proj.forward(&h)?)
    }
}

/// Encoder for one codec level: the block chain for levels `0..=level`
pub struct Encoder {
    level_blocks: Vec<EncoderConvBlock>,
}

impl Encoder {
    pub fn new(level: usize, config: &VqVaeConfig, vb: VarBuilder) -> Result<Self> {
        let multiplier = config.multipliers[level];
        let width = config.width * multiplier;
        let depth = config.depth * multiplier;
        let vb = vb.pp("level_blocks");
        let level_blocks = (0..=level)
            .map(|b| {
                let input_width = if b == 0 {
                    config.input_channels
                } else {
                    config.emb_width
                };
                EncoderConvBlock::new(
                    input_width,
                    config.emb_width,
                    config.downs_t[b],
                    config.strides_t[b],
                    width,
                    depth,
                    config,
                    vb.pp(b),
                )
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { level_blocks })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let mut h = x.clone();
        for block in &self.level_blocks {
            h = block.forward(&h)?;
        }
        Ok(h)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn tiny_config() -> VqVaeConfig {
        VqVaeConfig {
            levels: 2,
            downs_t: vec![2, 1],
            strides_t: vec![2, 2],
            emb_width: 8,
            l_bins: 16,
            width: 4,
            depth: 2,
            multipliers: vec![1, 1],
            ..Default::default()
        }
    }

    #[test]
    fn test_encoder_downsamples() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let config = tiny_config();

        let encoder = Encoder::new(1, &config, vb.pp("encoders").pp(1)).unwrap();
        let x = Tensor::randn(0f32, 1.0, (1, 1, 256), &device).unwrap();
        let h = encoder.forward(&x).unwrap();
        // 2^2 * 2^1 = 8x downsampling
        assert_eq!(h.dims(), &[1, 8, 32]);
    }

    #[test]
    fn test_weight_names() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let config = tiny_config();
        let _ = Encoder::new(0, &config, vb.pp("encoders").pp(0)).unwrap();

        let data = varmap.data().lock().unwrap();
        for name in [
            "encoders.0.level_blocks.0.model.0.0.weight",
            "encoders.0.level_blocks.0.model.1.0.bias",
            "encoders.0.level_blocks.0.model.0.1.model.1.model.1.weight",
            "encoders.0.level_blocks.0.model.0.1.model.0.model.3.weight",
            "encoders.0.level_blocks.0.model.2.weight",
        ] {
            assert!(data.contains_key(name), "missing {}", name);
        }
    }
}
