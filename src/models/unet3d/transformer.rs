//! Spatial and temporal transformers of the 3D UNet
//!
//! `Transformer2DModel` attends over the pixels of each frame and
//! cross-attends to the prompt. `TransformerTemporalModel` attends over the
//! frames at each pixel location.

use candle_core::{D, DType, Module, Result, Tensor};
use candle_nn::{Conv2d, GroupNorm, LayerNorm, Linear, VarBuilder, linear};

/// Feed-forward network with GEGLU activation
#[derive(Debug)]
struct FeedForward {
    proj: Linear,
    proj_out: Linear,
    inner_dim: usize,
}

impl FeedForward {
    fn new(vb: VarBuilder, dim: usize, mult: usize) -> Result<Self> {
        let inner_dim = dim * mult;
        let proj = linear(dim, inner_dim * 2, vb.pp("net").pp("0").pp("proj"))?;
        let proj_out = linear(inner_dim, dim, vb.pp("net").pp("2"))?;
        Ok(Self {
            proj,
            proj_out,
            inner_dim,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let h = self.proj.forward(x)?;
        let value = h.narrow(D::Minus1, 0, self.inner_dim)?;
        let gate = h.narrow(D::Minus1, self.inner_dim, self.inner_dim)?;
        self.proj_out.forward(&(value * gate.gelu_erf()?)?)
    }
}

/// Multi-head attention; self-attention when no context is given
#[derive(Debug)]
pub struct Attention {
    to_q: Linear,
    to_k: Linear,
    to_v: Linear,
    to_out: Linear,
    heads: usize,
    head_dim: usize,
    scale: f64,
    slice_size: Option<usize>,
}

impl Attention {
    pub fn new(
        vb: VarBuilder,
        query_dim: usize,
        heads: usize,
        head_dim: usize,
        context_dim: Option<usize>,
        slice_size: Option<usize>,
    ) -> Result<Self> {
        let inner_dim = heads * head_dim;
        let context_dim = context_dim.unwrap_or(query_dim);
        Ok(Self {
            to_q: candle_nn::linear_no_bias(query_dim, inner_dim, vb.pp("to_q"))?,
            to_k: candle_nn::linear_no_bias(context_dim, inner_dim, vb.pp("to_k"))?,
            to_v: candle_nn::linear_no_bias(context_dim, inner_dim, vb.pp("to_v"))?,
            to_out: linear(inner_dim, query_dim, vb.pp("to_out").pp("0"))?,
            heads,
            head_dim,
            scale: (head_dim as f64).powf(-0.5),
            slice_size,
        })
    }

    fn split_heads(&self, x: &Tensor) -> Result<Tensor> {
        let (batch, seq_len, _) = x.dims3()?;
        x.reshape((batch, seq_len, self.heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()
    }

    pub fn forward(&self, hidden_states: &Tensor, context: Option<&Tensor>) -> Result<Tensor> {
        let context = context.unwrap_or(hidden_states);
        let (batch, seq_len, _) = hidden_states.dims3()?;

        let q = self.split_heads(&self.to_q.forward(hidden_states)?)?;
        let k = self.split_heads(&self.to_k.forward(context)?)?;
        let v = self.split_heads(&self.to_v.forward(context)?)?;
        let k_t = k.transpose(2, 3)?.contiguous()?;

        // Softmax in f32, optionally over query chunks to bound peak memory
        let chunk = self.slice_size.unwrap_or(seq_len).clamp(1, seq_len.max(1));
        let mut chunks = Vec::with_capacity(seq_len.div_ceil(chunk));
        for start in (0..seq_len).step_by(chunk) {
            let len = chunk.min(seq_len - start);
            let q_chunk = q.narrow(2, start, len)?;
            let weights = (q_chunk.matmul(&k_t)? * self.scale)?.to_dtype(DType::F32)?;
            let weights = candle_nn::ops::softmax_last_dim(&weights)?.to_dtype(v.dtype())?;
            chunks.push(weights.matmul(&v)?);
        }
        let out = if chunks.len() == 1 {
            chunks.remove(0)
        } else {
            Tensor::cat(&chunks, 2)?
        };

        let out = out
            .transpose(1, 2)?
            .contiguous()?
            .reshape((batch, seq_len, self.heads * self.head_dim))?;
        self.to_out.forward(&out)
    }
}

/// Self-attention, second attention, GEGLU feed-forward, each pre-normed
/// with a residual.
///
/// The second attention attends to `context` when the block was built with a
/// context dimension and to itself otherwise.
#[derive(Debug)]
pub struct BasicTransformerBlock {
    norm1: LayerNorm,
    attn1: Attention,
    norm2: LayerNorm,
    attn2: Attention,
    norm3: LayerNorm,
    ff: FeedForward,
    cross_attention: bool,
}

impl BasicTransformerBlock {
    pub fn new(
        vb: VarBuilder,
        dim: usize,
        heads: usize,
        head_dim: usize,
        context_dim: Option<usize>,
        slice_size: Option<usize>,
    ) -> Result<Self> {
        Ok(Self {
            norm1: candle_nn::layer_norm(dim, 1e-5, vb.pp("norm1"))?,
            attn1: Attention::new(vb.pp("attn1"), dim, heads, head_dim, None, slice_size)?,
            norm2: candle_nn::layer_norm(dim, 1e-5, vb.pp("norm2"))?,
            attn2: Attention::new(vb.pp("attn2"), dim, heads, head_dim, context_dim, slice_size)?,
            norm3: candle_nn::layer_norm(dim, 1e-5, vb.pp("norm3"))?,
            ff: FeedForward::new(vb.pp("ff"), dim, 4)?,
            cross_attention: context_dim.is_some(),
        })
    }

    pub fn forward(&self, hidden_states: &Tensor, context: Option<&Tensor>) -> Result<Tensor> {
        let h = (self.attn1.forward(&self.norm1.forward(hidden_states)?, None)? + hidden_states)?;

        let context = if self.cross_attention { context } else { None };
        let h = (self.attn2.forward(&self.norm2.forward(&h)?, context)? + &h)?;

        self.ff.forward(&self.norm3.forward(&h)?)? + h
    }
}

/// Per-frame spatial transformer with prompt cross-attention
#[derive(Debug)]
pub struct Transformer2DModel {
    norm: GroupNorm,
    proj_in: Conv2d,
    transformer_blocks: Vec<BasicTransformerBlock>,
    proj_out: Conv2d,
}

impl Transformer2DModel {
    pub fn new(
        vb: VarBuilder,
        in_channels: usize,
        heads: usize,
        head_dim: usize,
        context_dim: usize,
        groups: usize,
        slice_size: Option<usize>,
    ) -> Result<Self> {
        let inner_dim = heads * head_dim;
        let norm = candle_nn::group_norm(groups, in_channels, 1e-6, vb.pp("norm"))?;
        let proj_in =
            candle_nn::conv2d(in_channels, inner_dim, 1, Default::default(), vb.pp("proj_in"))?;
        let transformer_blocks = vec![BasicTransformerBlock::new(
            vb.pp("transformer_blocks").pp(0),
            inner_dim,
            heads,
            head_dim,
            Some(context_dim),
            slice_size,
        )?];
        let proj_out =
            candle_nn::conv2d(inner_dim, in_channels, 1, Default::default(), vb.pp("proj_out"))?;
        Ok(Self {
            norm,
            proj_in,
            transformer_blocks,
            proj_out,
        })
    }

    /// `x`: `[B*F, C, H, W]`, `context`: `[B*F, L, context_dim]`
    pub fn forward(&self, x: &Tensor, context: &Tensor) -> Result<Tensor> {
        let (bf, _c, h, w) = x.dims4()?;
        let hidden = self.proj_in.forward(&self.norm.forward(x)?)?;
        let inner_dim = hidden.dim(1)?;
        let mut hidden = hidden
            .permute((0, 2, 3, 1))?
            .reshape((bf, h * w, inner_dim))?;

        for block in &self.transformer_blocks {
            hidden = block.forward(&hidden, Some(context))?;
        }

        let hidden = hidden
            .reshape((bf, h, w, inner_dim))?
            .permute((0, 3, 1, 2))?
            .contiguous()?;
        self.proj_out.forward(&hidden)? + x
    }
}

/// Attention along the frame axis at every pixel location
#[derive(Debug)]
pub struct TransformerTemporalModel {
    norm: GroupNorm,
    proj_in: Linear,
    transformer_blocks: Vec<BasicTransformerBlock>,
    proj_out: Linear,
}

impl TransformerTemporalModel {
    pub fn new(
        vb: VarBuilder,
        in_channels: usize,
        heads: usize,
        head_dim: usize,
        groups: usize,
        slice_size: Option<usize>,
    ) -> Result<Self> {
        let inner_dim = heads * head_dim;
        let norm = candle_nn::group_norm(groups, in_channels, 1e-6, vb.pp("norm"))?;
        let proj_in = linear(in_channels, inner_dim, vb.pp("proj_in"))?;
        let transformer_blocks = vec![BasicTransformerBlock::new(
            vb.pp("transformer_blocks").pp(0),
            inner_dim,
            heads,
            head_dim,
            None,
            slice_size,
        )?];
        let proj_out = linear(inner_dim, in_channels, vb.pp("proj_out"))?;
        Ok(Self {
            norm,
            proj_in,
            transformer_blocks,
            proj_out,
        })
    }

    /// `x`: `[B*F, C, H, W]` in frame-major order
    pub fn forward(&self, x: &Tensor, num_frames: usize) -> Result<Tensor> {
        let (bf, c, h, w) = x.dims4()?;
        let b = bf / num_frames;

        // Normalize over (C, F, H, W) of each video
        let video = x
            .reshape((b, num_frames, c, h, w))?
            .permute((0, 2, 1, 3, 4))?
            .contiguous()?;
        let normed = self.norm.forward(&video)?;

        let sequences = normed
            .permute((0, 3, 4, 2, 1))?
            .reshape((b * h * w, num_frames, c))?;
        let mut hidden = self.proj_in.forward(&sequences)?;
        for block in &self.transformer_blocks {
            hidden = block.forward(&hidden, None)?;
        }
        let hidden = self.proj_out.forward(&hidden)?;

        let hidden = hidden
            .reshape((b, h, w, num_frames, c))?
            .permute((0, 3, 4, 1, 2))?
            .reshape((bf, c, h, w))?;
        hidden + x
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::Pcg32;
    use candle_core::Device;

    #[test]
    fn test_zero_projection_temporal_transformer_is_identity() {
        let device = Device::Cpu;
        let vb = candle_nn::VarBuilder::zeros(DType::F32, &device);
        let model = TransformerTemporalModel::new(vb, 16, 2, 8, 4, None).unwrap();
        let x = Pcg32::from_seed(9).randn((4, 16, 2, 2), &device).unwrap();
        let y = model.forward(&x, 2).unwrap();
        let diff = (y - &x)
            .unwrap()
            .abs()
            .unwrap()
            .flatten_all()
            .unwrap()
            .max(0)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!(diff < 1e-6);
    }

    #[test]
    fn test_sliced_attention_matches_full() {
        let device = Device::Cpu;
        let varmap = candle_nn::VarMap::new();
        let vb = candle_nn::VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let full = Attention::new(vb.pp("attn"), 8, 2, 4, Some(6), None).unwrap();
        let sliced = Attention::new(vb.pp("attn"), 8, 2, 4, Some(6), Some(3)).unwrap();

        let mut rng = Pcg32::from_seed(2);
        let x = rng.randn((2, 7, 8), &device).unwrap();
        let ctx = rng.randn((2, 5, 6), &device).unwrap();
        let a = full.forward(&x, Some(&ctx)).unwrap();
        let b = sliced.forward(&x, Some(&ctx)).unwrap();
        assert_eq!(a.dims(), &[2, 7, 8]);
        let diff = (a - b)
            .unwrap()
            .abs()
            .unwrap()
            .flatten_all()
            .unwrap()
            .max(0)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!(diff < 1e-5, "diff {diff}");
    }

    #[test]
    fn test_spatial_transformer_keeps_shape() {
        let device = Device::Cpu;
        let vb = candle_nn::VarBuilder::zeros(DType::F32, &device);
        let model = Transformer2DModel::new(vb, 16, 2, 8, 12, 4, None).unwrap();
        let x = Tensor::ones((3, 16, 4, 4), DType::F32, &device).unwrap();
        let ctx = Tensor::ones((3, 5, 12), DType::F32, &device).unwrap();
        assert_eq!(model.forward(&x, &ctx).unwrap().dims(), &[3, 16, 4, 4]);
    }
}
