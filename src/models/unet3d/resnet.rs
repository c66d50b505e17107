//! Residual blocks of the 3D UNet
//!
//! Spatial mixing is a regular 2D ResNet block applied to every frame.
//! Temporal mixing is a stack of 3x1x1 convolutions over the frame axis.

use candle_core::{Module, Result, Tensor};
use candle_nn::{Conv2d, Conv2dConfig, GroupNorm, Linear, VarBuilder, conv2d};

/// Per-frame ResNet block (diffusers `ResnetBlock2D`)
#[derive(Debug)]
pub struct ResnetBlock2D {
    norm1: GroupNorm,
    conv1: Conv2d,
    norm2: GroupNorm,
    conv2: Conv2d,
    time_emb_proj: Linear,
    conv_shortcut: Option<Conv2d>,
}

impl ResnetBlock2D {
    pub fn new(
        vb: VarBuilder,
        in_channels: usize,
        out_channels: usize,
        temb_channels: usize,
        groups: usize,
        eps: f64,
    ) -> Result<Self> {
        let conv_cfg = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };
        let norm1 = candle_nn::group_norm(groups, in_channels, eps, vb.pp("norm1"))?;
        let conv1 = conv2d(in_channels, out_channels, 3, conv_cfg, vb.pp("conv1"))?;
        let time_emb_proj = candle_nn::linear(temb_channels, out_channels, vb.pp("time_emb_proj"))?;
        let norm2 = candle_nn::group_norm(groups, out_channels, eps, vb.pp("norm2"))?;
        let conv2 = conv2d(out_channels, out_channels, 3, conv_cfg, vb.pp("conv2"))?;

        let conv_shortcut = if in_channels != out_channels {
            Some(conv2d(
                in_channels,
                out_channels,
                1,
                Default::default(),
                vb.pp("conv_shortcut"),
            )?)
        } else {
            None
        };

        Ok(Self {
            norm1,
            conv1,
            norm2,
            conv2,
            time_emb_proj,
            conv_shortcut,
        })
    }

    /// `x`: `[B*F, C, H, W]`, `temb`: `[B*F, temb_channels]`
    pub fn forward(&self, x: &Tensor, temb: &Tensor) -> Result<Tensor> {
        let h = candle_nn::ops::silu(&self.norm1.forward(x)?)?;
        let h = self.conv1.forward(&h)?;

        let temb = self.time_emb_proj.forward(&candle_nn::ops::silu(temb)?)?;
        let h = h.broadcast_add(&temb.unsqueeze(2)?.unsqueeze(3)?)?;

        let h = candle_nn::ops::silu(&self.norm2.forward(&h)?)?;
        let h = self.conv2.forward(&h)?;

        match &self.conv_shortcut {
            Some(conv) => conv.forward(x)? + h,
            None => x + h,
        }
    }
}

/// Conv3d with a `(3, 1, 1)` kernel, evaluated as a 1D convolution over frames
#[derive(Debug)]
struct FrameConv {
    weight: Tensor,
    bias: Tensor,
}

impl FrameConv {
    fn new(vb: VarBuilder, in_channels: usize, out_channels: usize) -> Result<Self> {
        let weight = vb.get((out_channels, in_channels, 3, 1, 1), "weight")?;
        let bias = vb.get(out_channels, "bias")?;
        Ok(Self {
            weight: weight.squeeze(4)?.squeeze(3)?,
            bias,
        })
    }

    /// `x`: `[B, C, F, H, W]`
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let (b, c, f, h, w) = x.dims5()?;
        let out_ch = self.weight.dim(0)?;
        let x = x
            .permute((0, 3, 4, 1, 2))?
            .reshape((b * h * w, c, f))?
            .contiguous()?;
        let out = x.conv1d(&self.weight, 1, 1, 1, 1)?;
        let out = out.broadcast_add(&self.bias.reshape((1, out_ch, 1))?)?;
        out.reshape((b, h, w, out_ch, f))?
            .permute((0, 3, 4, 1, 2))?
            .contiguous()
    }
}

/// GroupNorm, SiLU, frame convolution
#[derive(Debug)]
struct TemporalConvStage {
    norm: GroupNorm,
    conv: FrameConv,
}

impl TemporalConvStage {
    /// `conv_index` is 2 for the first stage and 3 after it; the others carry
    /// a dropout at index 2.
    fn new(
        vb: VarBuilder,
        in_channels: usize,
        out_channels: usize,
        conv_index: usize,
        groups: usize,
    ) -> Result<Self> {
        Ok(Self {
            norm: candle_nn::group_norm(groups, in_channels, 1e-5, vb.pp("0"))?,
            conv: FrameConv::new(vb.pp(conv_index), in_channels, out_channels)?,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let h = candle_nn::ops::silu(&self.norm.forward(x)?)?;
        self.conv.forward(&h)
    }
}

/// Four temporal convolution stages with an identity skip
/// (diffusers `TemporalConvLayer`).
#[derive(Debug)]
pub struct TemporalConvLayer {
    stages: [TemporalConvStage; 4],
}

impl TemporalConvLayer {
    pub fn new(vb: VarBuilder, channels: usize, groups: usize) -> Result<Self> {
        Ok(Self {
            stages: [
                TemporalConvStage::new(vb.pp("conv1"), channels, channels, 2, groups)?,
                TemporalConvStage::new(vb.pp("conv2"), channels, channels, 3, groups)?,
                TemporalConvStage::new(vb.pp("conv3"), channels, channels, 3, groups)?,
                TemporalConvStage::new(vb.pp("conv4"), channels, channels, 3, groups)?,
            ],
        })
    }

    /// `x`: `[B*F, C, H, W]` in frame-major order
    pub fn forward(&self, x: &Tensor, num_frames: usize) -> Result<Tensor> {
        let (bf, c, h, w) = x.dims4()?;
        let b = bf / num_frames;
        let identity = x
            .reshape((b, num_frames, c, h, w))?
            .permute((0, 2, 1, 3, 4))?
            .contiguous()?;

        let mut hidden = identity.clone();
        for stage in &self.stages {
            hidden = stage.forward(&hidden)?;
        }
        (identity + hidden)?
            .permute((0, 2, 1, 3, 4))?
            .reshape((bf, c, h, w))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::Pcg32;
    use candle_core::{DType, Device};

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
        (a - b)
            .unwrap()
            .abs()
            .unwrap()
            .flatten_all()
            .unwrap()
            .max(0)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap()
    }

    #[test]
    fn test_zero_initialized_temporal_conv_is_identity() {
        let device = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &device);
        let layer = TemporalConvLayer::new(vb, 8, 4).unwrap();
        let x = Pcg32::from_seed(5).randn((6, 8, 3, 3), &device).unwrap();
        let y = layer.forward(&x, 3).unwrap();
        assert_eq!(y.dims(), x.dims());
        assert!(max_abs_diff(&x, &y) < 1e-6);
    }

    #[test]
    fn test_frame_conv_mixes_neighbouring_frames() {
        let device = Device::Cpu;
        // Kernel [1, 1, 1] over frames sums each frame with its neighbours
        let weight = Tensor::ones((1, 1, 3), DType::F32, &device).unwrap();
        let conv = FrameConv {
            weight,
            bias: Tensor::zeros(1, DType::F32, &device).unwrap(),
        };
        let x = Tensor::new(&[1f32, 2., 3., 4.], &device)
            .unwrap()
            .reshape((1, 1, 4, 1, 1))
            .unwrap();
        let y: Vec<f32> = conv.forward(&x).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(y, vec![3., 6., 9., 7.]);
    }

    #[test]
    fn test_resnet_shortcut_changes_channels() {
        let device = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &device);
        let block = ResnetBlock2D::new(vb, 8, 16, 32, 4, 1e-5).unwrap();
        let x = Tensor::ones((2, 8, 4, 4), DType::F32, &device).unwrap();
        let temb = Tensor::ones((2, 32), DType::F32, &device).unwrap();
        let y = block.forward(&x, &temb).unwrap();
        assert_eq!(y.dims(), &[2, 16, 4, 4]);
    }
}
