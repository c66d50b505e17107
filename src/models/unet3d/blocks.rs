//! Down, mid and up blocks of the 3D UNet
//!
//! Every layer of a block runs a per-frame ResNet, a temporal convolution,
//! and for cross-attention blocks a spatial transformer followed by a
//! temporal transformer.

use candle_core::{Module, Result, Tensor};
use candle_nn::{Conv2d, Conv2dConfig, VarBuilder, conv2d};

use super::config::UNet3DConfig;
use super::resnet::{ResnetBlock2D, TemporalConvLayer};
use super::transformer::{Transformer2DModel, TransformerTemporalModel};

/// Inputs shared by every layer of one UNet evaluation
#[derive(Debug, Clone, Copy)]
pub struct BlockInputs<'a> {
    /// `[B*F, time_embed_dim]`
    pub temb: &'a Tensor,
    /// `[B*F, L, cross_attention_dim]`
    pub context: &'a Tensor,
    pub num_frames: usize,
}

#[derive(Debug)]
pub struct Downsample2D {
    conv: Conv2d,
}

impl Downsample2D {
    pub fn new(vb: VarBuilder, channels: usize) -> Result<Self> {
        let conv = conv2d(
            channels,
            channels,
            3,
            Conv2dConfig {
                stride: 2,
                padding: 1,
                ..Default::default()
            },
            vb.pp("conv"),
        )?;
        Ok(Self { conv })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        self.conv.forward(x)
    }
}

/// Nearest-neighbour 2x upsampling followed by a 3x3 convolution
#[derive(Debug)]
pub struct Upsample2D {
    conv: Conv2d,
}

impl Upsample2D {
    pub fn new(vb: VarBuilder, channels: usize) -> Result<Self> {
        let conv = conv2d(
            channels,
            channels,
            3,
            Conv2dConfig {
                padding: 1,
                ..Default::default()
            },
            vb.pp("conv"),
        )?;
        Ok(Self { conv })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let (_, _, h, w) = x.dims4()?;
        self.conv.forward(&x.upsample_nearest2d(h * 2, w * 2)?)
    }
}

/// Spatial and temporal transformer pair of a cross-attention layer
#[derive(Debug)]
struct AttentionPair {
    attn: Transformer2DModel,
    temp_attn: TransformerTemporalModel,
}

impl AttentionPair {
    fn new(vb: &VarBuilder, index: usize, channels: usize, config: &UNet3DConfig) -> Result<Self> {
        let heads = config.heads_for(channels);
        let head_dim = config.attention_head_dim;
        Ok(Self {
            attn: Transformer2DModel::new(
                vb.pp("attentions").pp(index),
                channels,
                heads,
                head_dim,
                config.cross_attention_dim,
                config.norm_num_groups,
                config.sliced_attention_size,
            )?,
            temp_attn: TransformerTemporalModel::new(
                vb.pp("temp_attentions").pp(index),
                channels,
                heads,
                head_dim,
                config.norm_num_groups,
                config.sliced_attention_size,
            )?,
        })
    }

    fn forward(&self, x: &Tensor, inputs: &BlockInputs) -> Result<Tensor> {
        let h = self.attn.forward(x, inputs.context)?;
        self.temp_attn.forward(&h, inputs.num_frames)
    }
}

/// One `resnets.i` / `temp_convs.i` (/ `attentions.i` / `temp_attentions.i`) layer
#[derive(Debug)]
struct BlockLayer {
    resnet: ResnetBlock2D,
    temp_conv: TemporalConvLayer,
    attention: Option<AttentionPair>,
}

impl BlockLayer {
    fn new(
        vb: &VarBuilder,
        index: usize,
        in_channels: usize,
        out_channels: usize,
        with_attention: bool,
        config: &UNet3DConfig,
    ) -> Result<Self> {
        let resnet = ResnetBlock2D::new(
            vb.pp("resnets").pp(index),
            in_channels,
            out_channels,
            config.time_embed_dim(),
            config.norm_num_groups,
            config.norm_eps,
        )?;
        let temp_conv = TemporalConvLayer::new(
            vb.pp("temp_convs").pp(index),
            out_channels,
            config.norm_num_groups,
        )?;
        let attention = if with_attention {
            Some(AttentionPair::new(vb, index, out_channels, config)?)
        } else {
            None
        };
        Ok(Self {
            resnet,
            temp_conv,
            attention,
        })
    }

    fn forward(&self, x: &Tensor, inputs: &BlockInputs) -> Result<Tensor> {
        let h = self.resnet.forward(x, inputs.temb)?;
        let h = self.temp_conv.forward(&h, inputs.num_frames)?;
        match &self.attention {
            Some(attention) => attention.forward(&h, inputs),
            None => Ok(h),
        }
    }
}

/// `CrossAttnDownBlock3D` when built with attention, `DownBlock3D` otherwise
#[derive(Debug)]
pub struct DownBlock3D {
    layers: Vec<BlockLayer>,
    downsampler: Option<Downsample2D>,
}

impl DownBlock3D {
    pub fn new(
        vb: VarBuilder,
        in_channels: usize,
        out_channels: usize,
        with_attention: bool,
        add_downsample: bool,
        config: &UNet3DConfig,
    ) -> Result<Self> {
        let layers = (0..config.layers_per_block)
            .map(|i| {
                let in_ch = if i == 0 { in_channels } else { out_channels };
                BlockLayer::new(&vb, i, in_ch, out_channels, with_attention, config)
            })
            .collect::<Result<Vec<_>>>()?;
        let downsampler = if add_downsample {
            Some(Downsample2D::new(vb.pp("downsamplers").pp(0), out_channels)?)
        } else {
            None
        };
        Ok(Self {
            layers,
            downsampler,
        })
    }

    /// Returns the block output and the skip connections it produced
    pub fn forward(&self, x: &Tensor, inputs: &BlockInputs) -> Result<(Tensor, Vec<Tensor>)> {
        let mut h = x.clone();
        let mut skips = Vec::with_capacity(self.layers.len() + 1);
        for layer in &self.layers {
            h = layer.forward(&h, inputs)?;
            skips.push(h.clone());
        }
        if let Some(down) = &self.downsampler {
            h = down.forward(&h)?;
            skips.push(h.clone());
        }
        Ok((h, skips))
    }
}

/// `UNetMidBlock3DCrossAttn`
#[derive(Debug)]
pub struct UNetMidBlock3DCrossAttn {
    first: BlockLayer,
    attention: AttentionPair,
    second: BlockLayer,
}

impl UNetMidBlock3DCrossAttn {
    pub fn new(vb: VarBuilder, channels: usize, config: &UNet3DConfig) -> Result<Self> {
        // resnets.0/temp_convs.0, then attentions.0/temp_attentions.0,
        // then resnets.1/temp_convs.1
        Ok(Self {
            first: BlockLayer::new(&vb, 0, channels, channels, false, config)?,
            attention: AttentionPair::new(&vb, 0, channels, config)?,
            second: BlockLayer::new(&vb, 1, channels, channels, false, config)?,
        })
    }

    pub fn forward(&self, x: &Tensor, inputs: &BlockInputs) -> Result<Tensor> {
        let h = self.first.forward(x, inputs)?;
        let h = self.attention.forward(&h, inputs)?;
        self.second.forward(&h, inputs)
    }
}

/// `CrossAttnUpBlock3D` when built with attention, `UpBlock3D` otherwise
#[derive(Debug)]
pub struct UpBlock3D {
    layers: Vec<BlockLayer>,
    upsampler: Option<Upsample2D>,
}

impl UpBlock3D {
    /// `in_channels` is the channel count of the matching down block input,
    /// `prev_output_channels` the output of the previous up block.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        vb: VarBuilder,
        in_channels: usize,
        out_channels: usize,
        prev_output_channels: usize,
        with_attention: bool,
        add_upsample: bool,
        config: &UNet3DConfig,
    ) -> Result<Self> {
        let num_layers = config.layers_per_block + 1;
        let layers = (0..num_layers)
            .map(|i| {
                let skip_ch = if i == num_layers - 1 {
                    in_channels
                } else {
                    out_channels
                };
                let resnet_in = if i == 0 {
                    prev_output_channels
                } else {
                    out_channels
                };
                BlockLayer::new(&vb, i, resnet_in + skip_ch, out_channels, with_attention, config)
            })
            .collect::<Result<Vec<_>>>()?;
        let upsampler = if add_upsample {
            Some(Upsample2D::new(vb.pp("upsamplers").pp(0), out_channels)?)
        } else {
            None
        };
        Ok(Self { layers, upsampler })
    }

    /// Consumes one skip connection per layer from the top of `skips`
    pub fn forward(
        &self,
        x: &Tensor,
        skips: &mut Vec<Tensor>,
        inputs: &BlockInputs,
    ) -> Result<Tensor> {
        let mut h = x.clone();
        for layer in &self.layers {
            let Some(skip) = skips.pop() else {
                candle_core::bail!("up block ran out of skip connections");
            };
            h = Tensor::cat(&[&h, &skip], 1)?;
            h = layer.forward(&h, inputs)?;
        }
        if let Some(up) = &self.upsampler {
            h = up.forward(&h)?;
        }
        Ok(h)
    }
}
