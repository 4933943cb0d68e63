//! Conditional autoregressive transformer with factored attention
//!
//! Layers alternate between attention patterns over the context viewed as a
//! `[n_ctx / block_ctx, block_ctx]` grid: within a row, down a column, and onto
//! the previous row. All patterns are causal in token order.

use anyhow::Result;
use candle_core::{Device, Module, Tensor, D};
use candle_nn::LayerNorm;

use crate::error::EmbedError;
use crate::models::config::{Activation, PriorConfig};
use crate::models::weights::{self, Weights};

fn activate(afn: Activation, x: &Tensor) -> Result<Tensor> {
    Ok(match afn {
        Activation::QuickGelu => (x * candle_nn::ops::sigmoid(&(x * 1.702)?)?)?,
        Activation::Gelu => x.gelu()?,
        Activation::Relu => x.relu()?,
    })
}

/// Attention pattern for one layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttentionKind {
    /// Causal over the whole context
    Dense,
    /// Causal within each block
    Block,
    /// Causal across blocks at the same in-block position
    TransposeBlock,
    /// Unmasked over the previous block
    PrevBlock,
}

impl AttentionKind {
    /// Pattern for layer `depth` under `attn_order`
    pub fn for_layer(attn_order: usize, depth: usize) -> Result<Self> {
        use AttentionKind::*;
        Ok(match attn_order {
            0 => Dense,
            1 => [Block, TransposeBlock][depth % 2],
            2 => [Block, TransposeBlock, PrevBlock][depth % 3],
            9 => [Block, TransposeBlock, PrevBlock, Dense][depth % 4],
            other => {
                return Err(EmbedError::invalid_input(format!(
                    "attention order {} is not supported",
                    other
                ))
                .into())
            }
        })
    }

    fn causal(&self) -> bool {
        !matches!(self, Self::PrevBlock)
    }
}

/// Projection with weight stored `[n_in, n_out]`
struct Conv1d {
    w: Tensor,
    b: Tensor,
}

impl Conv1d {
    fn load(weights: &Weights, prefix: &str) -> Result<Self> {
        Ok(Self {
            w: weights::get(weights, &format!("{}.w", prefix))?,
            b: weights::get(weights, &format!("{}.b", prefix))?,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let (batch, seq, features) = x.dims3()?;
        let out = x.reshape((batch * seq, features))?.matmul(&self.w)?;
        let out = out.broadcast_add(&self.b)?;
        Ok(out.reshape((batch, seq, out.dim(1)?))?)
    }
}

fn layer_norm(weights: &Weights, prefix: &str, eps: f64) -> Result<LayerNorm> {
    Ok(LayerNorm::new(
        weights::get(weights, &format!("{}.weight", prefix))?,
        weights::get(weights, &format!("{}.bias", prefix))?,
        eps,
    ))
}

/// `[len, len]` additive mask, 0 on and below the diagonal
fn causal_mask(len: usize, device: &Device) -> Result<Tensor> {
    let mask: Vec<f32> = (0..len)
        .flat_map(|i| (0..len).map(move |j| if j <= i { 0.0 } else { f32::NEG_INFINITY }))
        .collect();
    Ok(Tensor::from_vec(mask, (len, len), device)?)
}

struct FactoredAttention {
    c_attn: Conv1d,
    c_proj: Conv1d,
    kind: AttentionKind,
    n_state: usize,
    n_head: usize,
    block_ctx: usize,
}

impl FactoredAttention {
    fn load(
        weights: &Weights,
        prefix: &str,
        config: &PriorConfig,
        kind: AttentionKind,
    ) -> Result<Self> {
        Ok(Self {
            c_attn: Conv1d::load(weights, &format!("{}.c_attn", prefix))?,
            c_proj: Conv1d::load(weights, &format!("{}.c_proj", prefix))?,
            kind,
            n_state: config.attn_width(),
            n_head: config.heads,
            block_ctx: config.block_ctx(),
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let qkv = self.c_attn.forward(x)?;
        let q = qkv.narrow(2, 0, self.n_state)?;
        let k = qkv.narrow(2, self.n_state, self.n_state)?;
        let v = qkv.narrow(2, 2 * self.n_state, self.n_state)?;

        let a = match self.kind {
            AttentionKind::Dense => self.dense(&q, &k, &v)?,
            AttentionKind::Block => self.block(&q, &k, &v)?,
            AttentionKind::TransposeBlock => self.transpose_block(&q, &k, &v)?,
            AttentionKind::PrevBlock => self.prev_block(&q, &k, &v)?,
        };
        self.c_proj.forward(&a)
    }

    /// Multi-head attention over `[batch, len, n_state]`
    fn dense(&self, q: &Tensor, k: &Tensor, v: &Tensor) -> Result<Tensor> {
        let (batch, q_len, _) = q.dims3()?;
        let kv_len = k.dim(1)?;
        let head_dim = self.n_state / self.n_head;

        let split = |t: &Tensor, len: usize| -> Result<Tensor> {
            Ok(t
                .reshape((batch, len, self.n_head, head_dim))?
                .transpose(1, 2)?
                .contiguous()?)
        };
        let q = split(q, q_len)?;
        let k = split(k, kv_len)?;
        let v = split(v, kv_len)?;

        let scale = 1.0 / (head_dim as f64).sqrt();
        let mut w = (q.matmul(&k.t()?.contiguous()?)? * scale)?;
        if self.kind.causal() {
            let mask = causal_mask(q_len, q.device())?;
            w = w.broadcast_add(&mask)?;
        }
        let w = candle_nn::ops::softmax_last_dim(&w)?;
        let a = w.matmul(&v)?;

        Ok(a.transpose(1, 2)?
            .contiguous()?
            .reshape((batch, q_len, self.n_state))?)
    }

    fn blocks_of(&self, len: usize) -> Result<usize> {
        if len % self.block_ctx != 0 {
            return Err(EmbedError::invalid_input(format!(
                "sequence length {} is not a multiple of the block length {}",
                len, self.block_ctx
            ))
            .into());
        }
        Ok(len / self.block_ctx)
    }

    fn block(&self, q: &Tensor, k: &Tensor, v: &Tensor) -> Result<Tensor> {
        let (batch, len, d) = q.dims3()?;
        let blocks = self.blocks_of(len)?;
        let fold = |t: &Tensor| t.reshape((batch * blocks, self.block_ctx, d));
        let a = self.dense(&fold(q)?, &fold(k)?, &fold(v)?)?;
        Ok(a.reshape((batch, len, d))?)
    }

    fn transpose_block(&self, q: &Tensor, k: &Tensor, v: &Tensor) -> Result<Tensor> {
        let (batch, len, d) = q.dims3()?;
        let blocks = self.blocks_of(len)?;
        let fold = |t: &Tensor| -> Result<Tensor> {
            Ok(t.reshape((batch, blocks, self.block_ctx, d))?
                .transpose(1, 2)?
                .contiguous()?
                .reshape((batch * self.block_ctx, blocks, d))?)
        };
        let a = self.dense(&fold(q)?, &fold(k)?, &fold(v)?)?;
        Ok(a.reshape((batch, self.block_ctx, blocks, d))?
            .transpose(1, 2)?
            .contiguous()?
            .reshape((batch, len, d))?)
    }

    fn prev_block(&self, q: &Tensor, k: &Tensor, v: &Tensor) -> Result<Tensor> {
        let (batch, len, d) = q.dims3()?;
        let blocks = self.blocks_of(len)?;
        // Block i sees block i - 1; block 0 sees zeros
        let shift = |t: &Tensor| -> Result<Tensor> {
            Ok(t.reshape((batch, blocks, self.block_ctx, d))?
                .narrow(1, 0, blocks - 1)?
                .pad_with_zeros(1, 1, 0)?
                .reshape((batch * blocks, self.block_ctx, d))?)
        };
        let q = q.reshape((batch * blocks, self.block_ctx, d))?;
        let a = self.dense(&q, &shift(k)?, &shift(v)?)?;
        Ok(a.reshape((batch, len, d))?)
    }
}

struct Mlp {
    c_fc: Conv1d,
    c_proj: Conv1d,
    afn: Activation,
}

impl Mlp {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let h = activate(self.afn, &self.c_fc.forward(x)?)?;
        self.c_proj.forward(&h)
    }
}

struct ResAttnBlock {
    ln_0: LayerNorm,
    attn: FactoredAttention,
    ln_1: LayerNorm,
    mlp: Mlp,
    res_scale: f64,
}

impl ResAttnBlock {
    fn load(weights: &Weights, prefix: &str, config: &PriorConfig, index: usize) -> Result<Self> {
        let kind = AttentionKind::for_layer(config.attn_order, index)?;
        let eps = config.layer_norm_eps;
        Ok(Self {
            ln_0: layer_norm(weights, &format!("{}.ln_0", prefix), eps)?,
            attn: FactoredAttention::load(weights, &format!("{}.attn", prefix), config, kind)?,
            ln_1: layer_norm(weights, &format!("{}.ln_1", prefix), eps)?,
            mlp: Mlp {
                c_fc: Conv1d::load(weights, &format!("{}.mlp.c_fc", prefix))?,
                c_proj: Conv1d::load(weights, &format!("{}.mlp.c_proj", prefix))?,
                afn: config.afn,
            },
            res_scale: if config.res_scale {
                1.0 / config.depth as f64
            } else {
                1.0
            },
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let a = self.attn.forward(&self.ln_0.forward(x)?)?;
        let m = self.mlp.forward(&self.ln_1.forward(&(x + &a)?)?)?;
        if self.res_scale == 1.0 {
            Ok(((x + a)? + m)?)
        } else {
            Ok((x + ((a + m)? * self.res_scale)?)?)
        }
    }
}

/// Token embedding, position embedding and the residual attention stack
pub struct ConditionalAutoregressive {
    x_emb: Tensor,
    pos_emb: Tensor,
    start_token: Option<Tensor>,
    x_out: Tensor,
    layers: Vec<ResAttnBlock>,
    add_cond_after_transformer: bool,
    width: usize,
}

/// Key prefix of the residual attention blocks
pub const ATTN_MODS_PREFIX: &str = "prior.transformer._attn_mods.";

impl ConditionalAutoregressive {
    /// Load `prior.*`, building `config.depth` layers
    pub fn load(weights: &Weights, config: &PriorConfig) -> Result<Self> {
        let layers = (0..config.depth)
            .map(|i| {
                ResAttnBlock::load(weights, &format!("{}{}", ATTN_MODS_PREFIX, i), config, i)
            })
            .collect::<Result<Vec<_>>>()?;

        let x_emb = weights::get(weights, "prior.x_emb.weight")?;
        let x_out = match weights.get("prior.x_out.weight") {
            Some(w) => w.clone(),
            None => x_emb.clone(),
        };

        Ok(Self {
            x_emb,
            pos_emb: weights::get(weights, "prior.pos_emb.pos_emb")?,
            start_token: weights.get("prior.start_token").cloned(),
            x_out,
            layers,
            add_cond_after_transformer: config.add_cond_after_transformer,
            width: config.width,
        })
    }

    pub fn depth(&self) -> usize {
        self.layers.len()
    }

    /// Hidden states `[batch, len, width]` for tokens `[batch, len]`
    ///
    /// The sequence is shifted right by one with `y_cond` (or the learned start
    /// token) in the first slot, so position `i` sees only tokens before `i`.
    pub fn encode(&self, x: &Tensor, x_cond: &Tensor, y_cond: Option<&Tensor>) -> Result<Tensor> {
        let (batch, len) = x.dims2()?;
        if len == 0 || len > self.pos_emb.dim(0)? {
            return Err(EmbedError::invalid_input(format!(
                "token length {} outside 1..={}",
                len,
                self.pos_emb.dim(0)?
            ))
            .into());
        }

        let h = self
            .x_emb
            .index_select(&x.flatten_all()?, 0)?
            .reshape((batch, len, self.width))?;

        let start = match (y_cond, &self.start_token) {
            (Some(y_cond), _) => y_cond.reshape((batch, 1, self.width))?,
            (None, Some(token)) => token.reshape((1, 1, self.width))?.repeat((batch, 1, 1))?,
            (None, None) => anyhow::bail!("Prior has no start token and no y_cond was given"),
        };
        let h = Tensor::cat(&[&start, &h.narrow(1, 0, len - 1)?], 1)?;

        let pos = self.pos_emb.narrow(0, 0, len)?.unsqueeze(0)?;
        let mut h = h.broadcast_add(&pos)?.broadcast_add(x_cond)?;

        for (i, layer) in self.layers.iter().enumerate() {
            h = layer.forward(&h)?;
            tracing::trace!("prior layer {} done", i);
        }

        if self.add_cond_after_transformer {
            h = h.broadcast_add(x_cond)?;
        }
        Ok(h)
    }

    /// Next-token logits `[batch, len, bins]` from hidden states
    pub fn logits(&self, h: &Tensor) -> Result<Tensor> {
        let (batch, len, width) = h.dims3()?;
        let out = h.reshape((batch * len, width))?.matmul(&self.x_out.t()?)?;
        Ok(out.reshape((batch, len, out.dim(D::Minus1)?))?)
    }
}
