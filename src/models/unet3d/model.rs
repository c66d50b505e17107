//! `UNet3DConditionModel` for ModelScope text-to-video
//!
//! Operates on latent videos `[B, C, F, H, W]`. Frames are folded into the
//! batch axis for the spatial layers and unfolded again inside the temporal
//! ones.

use candle_core::{DType, Module, Result, Tensor};
use candle_nn::{Conv2d, Conv2dConfig, GroupNorm, Linear, VarBuilder, conv2d, linear};
use tracing::debug;

use super::blocks::{BlockInputs, DownBlock3D, UNetMidBlock3DCrossAttn, UpBlock3D};
use super::config::{DownBlockType, UNet3DConfig, UpBlockType};
use super::transformer::TransformerTemporalModel;

/// Sinusoidal timestep embeddings, cosine half first.
///
/// Frequencies are `exp(-ln(10000) * i / (half_dim - freq_shift))`.
pub fn get_timestep_embedding(
    timesteps: &Tensor,
    embedding_dim: usize,
    freq_shift: f64,
) -> Result<Tensor> {
    let half_dim = embedding_dim / 2;
    let exponent = Tensor::arange(0u32, half_dim as u32, timesteps.device())?
        .to_dtype(DType::F32)?;
    let freqs = (exponent * (-f64::ln(10000.0) / (half_dim as f64 - freq_shift)))?.exp()?;

    let args = timesteps
        .to_dtype(DType::F32)?
        .unsqueeze(1)?
        .broadcast_mul(&freqs.unsqueeze(0)?)?;
    Tensor::cat(&[args.cos()?, args.sin()?], 1)
}

/// Linear, SiLU, Linear
#[derive(Debug)]
pub struct TimestepEmbedding {
    linear_1: Linear,
    linear_2: Linear,
}

impl TimestepEmbedding {
    pub fn new(vb: VarBuilder, in_channels: usize, time_embed_dim: usize) -> Result<Self> {
        let linear_1 = linear(in_channels, time_embed_dim, vb.pp("linear_1"))?;
        let linear_2 = linear(time_embed_dim, time_embed_dim, vb.pp("linear_2"))?;
        Ok(Self { linear_1, linear_2 })
    }

    pub fn forward(&self, sample: &Tensor) -> Result<Tensor> {
        let sample = candle_nn::ops::silu(&self.linear_1.forward(sample)?)?;
        self.linear_2.forward(&sample)
    }
}

#[derive(Debug)]
pub struct UNet3DConditionModel {
    conv_in: Conv2d,
    time_proj_dim: usize,
    time_embedding: TimestepEmbedding,
    transformer_in: TransformerTemporalModel,
    down_blocks: Vec<DownBlock3D>,
    mid_block: UNetMidBlock3DCrossAttn,
    up_blocks: Vec<UpBlock3D>,
    conv_norm_out: GroupNorm,
    conv_out: Conv2d,
    config: UNet3DConfig,
}

impl UNet3DConditionModel {
    pub fn new(vb: VarBuilder, config: UNet3DConfig) -> Result<Self> {
        config
            .validate()
            .map_err(|e| candle_core::Error::Msg(e.to_string()))?;

        let channels = &config.block_out_channels;
        let first = channels[0];
        let last = channels[channels.len() - 1];
        let conv_cfg = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };

        let conv_in = conv2d(config.in_channels, first, 3, conv_cfg, vb.pp("conv_in"))?;
        let time_embedding =
            TimestepEmbedding::new(vb.pp("time_embedding"), first, config.time_embed_dim())?;
        let transformer_in = TransformerTemporalModel::new(
            vb.pp("transformer_in"),
            first,
            config.transformer_in_heads,
            config.attention_head_dim,
            config.norm_num_groups,
            config.sliced_attention_size,
        )?;

        let mut down_blocks = Vec::with_capacity(channels.len());
        let mut output_channels = first;
        for (i, block_type) in config.down_block_types.iter().enumerate() {
            let input_channels = output_channels;
            output_channels = channels[i];
            let is_final = i == channels.len() - 1;
            down_blocks.push(DownBlock3D::new(
                vb.pp("down_blocks").pp(i),
                input_channels,
                output_channels,
                *block_type == DownBlockType::CrossAttnDownBlock3D,
                !is_final,
                &config,
            )?);
        }

        let mid_block = UNetMidBlock3DCrossAttn::new(vb.pp("mid_block"), last, &config)?;

        let reversed: Vec<usize> = channels.iter().rev().copied().collect();
        let mut up_blocks = Vec::with_capacity(channels.len());
        let mut output_channels = reversed[0];
        for (i, block_type) in config.up_block_types.iter().enumerate() {
            let prev_output_channels = output_channels;
            output_channels = reversed[i];
            let input_channels = reversed[(i + 1).min(reversed.len() - 1)];
            let is_final = i == reversed.len() - 1;
            up_blocks.push(UpBlock3D::new(
                vb.pp("up_blocks").pp(i),
                input_channels,
                output_channels,
                prev_output_channels,
                *block_type == UpBlockType::CrossAttnUpBlock3D,
                !is_final,
                &config,
            )?);
        }

        let conv_norm_out = candle_nn::group_norm(
            config.norm_num_groups,
            first,
            config.norm_eps,
            vb.pp("conv_norm_out"),
        )?;
        let conv_out = conv2d(first, config.out_channels, 3, conv_cfg, vb.pp("conv_out"))?;

        Ok(Self {
            conv_in,
            time_proj_dim: first,
            time_embedding,
            transformer_in,
            down_blocks,
            mid_block,
            up_blocks,
            conv_norm_out,
            conv_out,
            config,
        })
    }

    pub fn config(&self) -> &UNet3DConfig {
        &self.config
    }

    /// Predict noise for `sample` (`[B, C, F, H, W]`) at `timestep`.
    ///
    /// `encoder_hidden_states` is `[B, L, cross_attention_dim]`; it is shared
    /// by all frames of a video.
    pub fn forward(
        &self,
        sample: &Tensor,
        timestep: f64,
        encoder_hidden_states: &Tensor,
    ) -> Result<Tensor> {
        let (b, c, f, h, w) = sample.dims5()?;
        let dtype = sample.dtype();
        let device = sample.device();

        // Time embedding, one row per frame
        let timesteps = Tensor::full(timestep as f32, b, device)?;
        let t_emb = get_timestep_embedding(&timesteps, self.time_proj_dim, 0.0)?.to_dtype(dtype)?;
        let emb = self.time_embedding.forward(&t_emb)?;
        let emb = repeat_per_frame(&emb, f)?;
        let context = repeat_per_frame(encoder_hidden_states, f)?;

        let inputs = BlockInputs {
            temb: &emb,
            context: &context,
            num_frames: f,
        };

        let x = sample
            .permute((0, 2, 1, 3, 4))?
            .reshape((b * f, c, h, w))?;
        let x = self.conv_in.forward(&x)?;
        let x = self.transformer_in.forward(&x, f)?;

        let mut skips = vec![x.clone()];
        let mut x = x;
        for block in &self.down_blocks {
            let (h, res) = block.forward(&x, &inputs)?;
            x = h;
            skips.extend(res);
        }

        let mut x = self.mid_block.forward(&x, &inputs)?;

        for block in &self.up_blocks {
            x = block.forward(&x, &mut skips, &inputs)?;
        }

        let x = candle_nn::ops::silu(&self.conv_norm_out.forward(&x)?)?;
        let x = self.conv_out.forward(&x)?;
        debug!(timestep, frames = f, "unet3d evaluated");

        let out_c = x.dim(1)?;
        x.reshape((b, f, out_c, h, w))?.permute((0, 2, 1, 3, 4))?.contiguous()
    }
}

/// `[B, ...]` -> `[B*F, ...]` with each row repeated `num_frames` times
fn repeat_per_frame(x: &Tensor, num_frames: usize) -> Result<Tensor> {
    let mut dims = x.dims().to_vec();
    let b = dims[0];
    let mut repeats = vec![1; dims.len() + 1];
    repeats[1] = num_frames;
    let repeated = x.unsqueeze(1)?.repeat(repeats.as_slice())?;
    dims[0] = b * num_frames;
    repeated.reshape(dims)
}
