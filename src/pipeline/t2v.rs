//! ModelScope text-to-video pipeline driven as a next-frame predictor
//!
//! The conditioning window is encoded to latents and placed in the first
//! `F` frame slots of an `F + 1` frame latent video. Sampling then only has
//! to invent the last slot. At every DDIM timestep the conditioning slots
//! are overwritten with the conditioning latents noised to that timestep,
//! and each step is repeated `resample_iter` extra times by re-noising the
//! result back to the current timestep.

use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::stable_diffusion::{StableDiffusionConfig, vae::AutoEncoderKL};
use tracing::{debug, info};

use super::{VAE_SCALE, VideoGenerator, apply_cfg};
use crate::config::ResampleConfig;
use crate::error::Result;
use crate::loader::ComponentFiles;
use crate::models::text_encoder::ClipPromptEncoder;
use crate::models::unet3d::{UNet3DConditionModel, UNet3DConfig};
use crate::schedulers::{DdimScheduler, DdimSchedulerConfig};
use crate::utils::Pcg32;

/// Prompt embeddings batched as `[uncond, cond]`
#[derive(Debug, Clone)]
pub struct VideoPrompt {
    pub text: String,
    embeddings: Tensor,
}

impl VideoPrompt {
    pub fn embeddings(&self) -> &Tensor {
        &self.embeddings
    }
}

/// Denoiser and autoencoder of the video model
pub struct LatentVideoModel {
    unet: UNet3DConditionModel,
    vae: AutoEncoderKL,
    scheduler_config: DdimSchedulerConfig,
    device: Device,
    dtype: DType,
}

impl LatentVideoModel {
    pub(crate) fn from_parts(
        unet: UNet3DConditionModel,
        vae: AutoEncoderKL,
        device: &Device,
        dtype: DType,
    ) -> Self {
        Self {
            unet,
            vae,
            scheduler_config: DdimSchedulerConfig::default(),
            device: device.clone(),
            dtype,
        }
    }

    /// VAE latents of a normalized `[1, 3, F, H, W]` video, `[1, 4, F, H/8, W/8]` in f32
    pub fn encode_video(&self, vid: &Tensor) -> Result<Tensor> {
        let vid = vid.to_device(&self.device)?.to_dtype(self.dtype)?;
        let latents = map_frames(&vid, |frames| {
            self.vae.encode(frames)?.sample()? * VAE_SCALE
        })?;
        Ok(latents.to_dtype(DType::F32)?)
    }

    /// Guided noise prediction for f32 `latents` at timestep `t`
    fn predict_noise(
        &self,
        latents: &Tensor,
        t: usize,
        prompt: &VideoPrompt,
        guide_scale: f64,
    ) -> Result<Tensor> {
        let input = Tensor::cat(&[latents, latents], 0)?.to_dtype(self.dtype)?;
        let output = self.unet.forward(&input, t as f64, &prompt.embeddings)?;
        Ok(apply_cfg(&output, guide_scale)?.to_dtype(DType::F32)?)
    }

    /// Latent video `[1, 4, F + 1, h, w]` continuing the window `vid`
    pub fn sample(
        &self,
        prompt: &VideoPrompt,
        vid: &Tensor,
        resample: &ResampleConfig,
        rng: &mut Pcg32,
    ) -> Result<Tensor> {
        debug!(prompt = %prompt.text, frames = vid.dim(2)?, "sampling next frame");
        let scheduler = DdimScheduler::new(self.scheduler_config.clone(), resample.ddim_step);
        let cond = self.encode_video(vid)?;
        sample_with_vid_resample(&cond, &scheduler, resample, rng, |latents, t| {
            self.predict_noise(latents, t, prompt, resample.guide_scale)
        })
    }

    /// Decode latent frame `F - 1` to a normalized `[1, 3, H, W]` image
    pub fn decode_last_frame(&self, latents: &Tensor) -> Result<Tensor> {
        let f = latents.dim(2)?;
        let last = latents
            .narrow(2, f - 1, 1)?
            .squeeze(2)?
            .to_dtype(self.dtype)?;
        let image = self.vae.decode(&(last / VAE_SCALE)?)?;
        Ok(image.to_dtype(DType::F32)?)
    }
}

/// Apply a per-frame image op to a `[B, C, F, H, W]` video.
///
/// Frames are folded into the batch axis frame-major within each video and
/// unfolded again, so slot `j` of the result comes from frame `j`.
fn map_frames<F>(vid: &Tensor, op: F) -> candle_core::Result<Tensor>
where
    F: FnOnce(&Tensor) -> candle_core::Result<Tensor>,
{
    let (b, c, f, h, w) = vid.dims5()?;
    let frames = vid.permute((0, 2, 1, 3, 4))?.reshape((b * f, c, h, w))?;
    let out = op(&frames)?;
    let (_, oc, oh, ow) = out.dims4()?;
    out.reshape((b, f, oc, oh, ow))?
        .permute((0, 2, 1, 3, 4))?
        .contiguous()
}

pub struct TextToVideoPipeline {
    text_encoder: ClipPromptEncoder,
    model: LatentVideoModel,
}

impl TextToVideoPipeline {
    pub fn load(
        files: &ComponentFiles,
        unet_config: UNet3DConfig,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        // The text tower and the VAE share the Stable Diffusion 2.x architecture
        let sd = StableDiffusionConfig::v2_1(None, None, None);

        info!("Loading text encoder...");
        let text_encoder = ClipPromptEncoder::load(
            &sd.clip,
            &files.text_encoder,
            &files.tokenizer,
            device,
            dtype,
        )?;

        info!("Loading UNet3D...");
        let vs = unsafe { VarBuilder::from_mmaped_safetensors(&[&files.unet], dtype, device)? };
        let unet = UNet3DConditionModel::new(vs, unet_config)?;

        info!("Loading VAE...");
        let vae = sd.build_vae(&files.vae, device, dtype)?;

        Ok(Self {
            text_encoder,
            model: LatentVideoModel::from_parts(unet, vae, device, dtype),
        })
    }
}

impl VideoGenerator for TextToVideoPipeline {
    type Prompt = VideoPrompt;

    fn preprocess(&mut self, prompt: &str) -> Result<VideoPrompt> {
        let embeddings = self
            .text_encoder
            .encode_with_uncond(prompt)?
            .batched()?
            .to_dtype(self.model.dtype)?;
        Ok(VideoPrompt {
            text: prompt.to_string(),
            embeddings,
        })
    }

    fn forward_with_vid_resample(
        &mut self,
        prompt: &VideoPrompt,
        vid: &Tensor,
        resample: &ResampleConfig,
        rng: &mut Pcg32,
    ) -> Result<Tensor> {
        self.model.sample(prompt, vid, resample, rng)
    }

    fn decode_last_frame(&mut self, latents: &Tensor) -> Result<Tensor> {
        self.model.decode_last_frame(latents)
    }
}

/// Conditioning latents noised to each timestep of the schedule
enum NoisyConditioning {
    /// One DDPM forward trajectory, indexed like the timesteps
    Trajectory(Vec<Tensor>),
    /// Independent `q(x_t | x_0)` draws
    Fresh,
}

/// TI2V sampling loop over any noise predictor.
///
/// `cond` holds the clean conditioning latents `[1, C, F, h, w]`; the result
/// is `[1, C, F + 1, h, w]`. `predict` maps `(latents, t)` to the guided
/// noise estimate.
pub fn sample_with_vid_resample<P>(
    cond: &Tensor,
    scheduler: &DdimScheduler,
    resample: &ResampleConfig,
    rng: &mut Pcg32,
    mut predict: P,
) -> Result<Tensor>
where
    P: FnMut(&Tensor, usize) -> Result<Tensor>,
{
    let cond = cond.to_dtype(DType::F32)?;
    let (b, c, num_cond, h, w) = cond.dims5()?;
    let timesteps = scheduler.timesteps().to_vec();

    let noisy_cond = if resample.use_ddpm_inversion {
        NoisyConditioning::Trajectory(scheduler.forward_trajectory(&cond, rng)?)
    } else {
        NoisyConditioning::Fresh
    };

    let mut latents = match &noisy_cond {
        // The new slot starts where the last conditioning frame's
        // trajectory ends
        NoisyConditioning::Trajectory(levels) => {
            let top = &levels[0];
            Tensor::cat(&[top, &top.narrow(2, num_cond - 1, 1)?], 2)?
        }
        NoisyConditioning::Fresh => rng.randn((b, c, num_cond + 1, h, w), cond.device())?,
    };

    for (k, &t) in timesteps.iter().enumerate() {
        let t_prev = scheduler.prev_timestep(t);
        let cond_t = match &noisy_cond {
            NoisyConditioning::Trajectory(levels) => levels[k].clone(),
            NoisyConditioning::Fresh => scheduler.add_noise(&cond, &rng.randn_like(&cond)?, t)?,
        };

        for r in 0..=resample.resample_iter {
            if resample.add_vid_cond {
                let new_slot = latents.narrow(2, num_cond, 1)?;
                latents = Tensor::cat(&[&cond_t, &new_slot], 2)?;
            }
            let noise_pred = predict(&latents, t)?;
            latents = scheduler.step(&noise_pred, t, &latents)?.prev_sample;

            if r < resample.resample_iter {
                let noise = rng.randn_like(&latents)?;
                latents = scheduler.renoise(&latents, t_prev, t, &noise)?;
            }
        }
        debug!(step = k, t, t_prev, "ddim step done");
    }
    Ok(latents)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cond_latents() -> Tensor {
        Pcg32::from_seed(1)
            .randn((1, 4, 3, 2, 2), &Device::Cpu)
            .unwrap()
    }

    fn run(resample: &ResampleConfig, seed: u64) -> (Tensor, Vec<usize>) {
        let scheduler = DdimScheduler::new(DdimSchedulerConfig::default(), resample.ddim_step);
        let mut rng = Pcg32::from_seed(seed);
        let mut calls = Vec::new();
        let out = sample_with_vid_resample(&cond_latents(), &scheduler, resample, &mut rng, |x, t| {
            calls.push(t);
            Ok(x.zeros_like()?)
        })
        .unwrap();
        (out, calls)
    }

    #[test]
    fn test_output_has_one_more_frame() {
        let (out, _) = run(&ResampleConfig::default(), 0);
        assert_eq!(out.dims(), &[1, 4, 4, 2, 2]);
    }

    #[test]
    fn test_predictor_called_per_resample_pass() {
        let resample = ResampleConfig {
            resample_iter: 2,
            ddim_step: 5,
            ..Default::default()
        };
        let (_, calls) = run(&resample, 0);
        assert_eq!(calls.len(), 5 * 3);
        assert_eq!(&calls[..3], &[801, 801, 801]);
        assert_eq!(calls[calls.len() - 1], 1);
    }

    #[test]
    fn test_same_seed_same_latents() {
        for resample in [
            ResampleConfig::default(),
            ResampleConfig {
                use_ddpm_inversion: false,
                add_vid_cond: false,
                ..Default::default()
            },
        ] {
            let (a, _) = run(&resample, 7);
            let (b, _) = run(&resample, 7);
            let diff = (a - b)
                .unwrap()
                .abs()
                .unwrap()
                .sum_all()
                .unwrap()
                .to_scalar::<f32>()
                .unwrap();
            assert_eq!(diff, 0.0);
        }
    }

    #[test]
    fn test_conditioning_slots_are_overwritten() {
        // The first model call sees the trajectory top in the conditioning slots
        let resample = ResampleConfig {
            resample_iter: 0,
            ddim_step: 2,
            ..Default::default()
        };
        let scheduler = DdimScheduler::new(DdimSchedulerConfig::default(), 2);
        let cond = cond_latents();
        let expected_top = scheduler
            .forward_trajectory(&cond, &mut Pcg32::from_seed(3))
            .unwrap()
            .remove(0);

        let mut seen = Vec::new();
        sample_with_vid_resample(&cond, &scheduler, &resample, &mut Pcg32::from_seed(3), |x, _| {
            seen.push(x.narrow(2, 0, 3)?);
            Ok(x.zeros_like()?)
        })
        .unwrap();

        let diff = (&seen[0] - expected_top)
            .unwrap()
            .abs()
            .unwrap()
            .sum_all()
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert_eq!(diff, 0.0);
    }

    use crate::models::unet3d::{DownBlockType, UpBlockType};
    use candle_nn::VarMap;
    use candle_transformers::models::stable_diffusion::vae::AutoEncoderKLConfig;

    /// Randomly initialized UNet3D and VAE, latent stride 8
    fn tiny_model(varmap: &VarMap) -> LatentVideoModel {
        let device = Device::Cpu;
        let vb = VarBuilder::from_varmap(varmap, DType::F32, &device);
        let unet_config = UNet3DConfig {
            block_out_channels: vec![32, 64],
            down_block_types: vec![DownBlockType::CrossAttnDownBlock3D, DownBlockType::DownBlock3D],
            up_block_types: vec![UpBlockType::UpBlock3D, UpBlockType::CrossAttnUpBlock3D],
            layers_per_block: 1,
            cross_attention_dim: 16,
            attention_head_dim: 8,
            norm_num_groups: 8,
            transformer_in_heads: 2,
            ..Default::default()
        };
        let unet = UNet3DConditionModel::new(vb.pp("unet"), unet_config).unwrap();
        let vae_config = AutoEncoderKLConfig {
            block_out_channels: vec![8, 8, 8, 8],
            layers_per_block: 1,
            latent_channels: 4,
            norm_num_groups: 4,
            use_quant_conv: true,
            use_post_quant_conv: true,
        };
        let vae = AutoEncoderKL::new(vb.pp("vae"), 3, 3, vae_config).unwrap();
        LatentVideoModel::from_parts(unet, vae, &device, DType::F32)
    }

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
    fn test_map_frames_keeps_frame_order() {
        let device = Device::Cpu;
        // Frame j of video b is filled with 10 * b + j
        let values: Vec<f32> = (0..2)
            .flat_map(|b| (0..3).map(move |j| (10 * b + j) as f32))
            .collect();
        let vid = Tensor::from_vec(values, (2, 1, 3, 1, 1), &device)
            .unwrap()
            .broadcast_as((2, 3, 3, 4, 4))
            .unwrap()
            .contiguous()
            .unwrap();

        let out = map_frames(&vid, |frames| frames.mean_keepdim(1)?.avg_pool2d(2)).unwrap();
        assert_eq!(out.dims(), &[2, 1, 3, 2, 2]);
        let per_slot: Vec<f32> = out
            .mean_keepdim(4)
            .unwrap()
            .mean_keepdim(3)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        assert_eq!(per_slot, vec![0., 1., 2., 10., 11., 12.]);
    }

    #[test]
    fn test_encode_video_latent_layout() {
        let model = tiny_model(&VarMap::new());
        let vid = Pcg32::from_seed(4)
            .randn((1, 3, 3, 16, 16), &Device::Cpu)
            .unwrap();
        let latents = model.encode_video(&vid).unwrap();
        assert_eq!(latents.dims(), &[1, 4, 3, 2, 2]);
        assert_eq!(latents.dtype(), DType::F32);
    }

    #[test]
    fn test_decode_last_frame_uses_last_slot() {
        let model = tiny_model(&VarMap::new());
        let latents = Pcg32::from_seed(8)
            .randn((1, 4, 3, 2, 2), &Device::Cpu)
            .unwrap();

        let frame = model.decode_last_frame(&latents).unwrap();
        assert_eq!(frame.dims(), &[1, 3, 16, 16]);

        let decode_slot = |j: usize| {
            let slot = latents.narrow(2, j, 1).unwrap().squeeze(2).unwrap();
            model.vae.decode(&(slot / VAE_SCALE).unwrap()).unwrap()
        };
        assert!(max_abs_diff(&frame, &decode_slot(2)) < 1e-5);
        assert!(max_abs_diff(&frame, &decode_slot(0)) > 1e-4);
    }

    #[test]
    fn test_sample_continues_the_window_by_one_frame() {
        let model = tiny_model(&VarMap::new());
        let mut rng = Pcg32::from_seed(12);
        let prompt = VideoPrompt {
            text: "a kite.".to_string(),
            embeddings: rng.randn((2, 5, 16), &Device::Cpu).unwrap(),
        };
        let vid = rng.randn((1, 3, 3, 16, 16), &Device::Cpu).unwrap();
        let resample = ResampleConfig {
            resample_iter: 1,
            ddim_step: 2,
            ..Default::default()
        };

        let latents = model.sample(&prompt, &vid, &resample, &mut rng).unwrap();
        assert_eq!(latents.dims(), &[1, 4, 4, 2, 2]);
        let values: Vec<f32> = latents.flatten_all().unwrap().to_vec1().unwrap();
        assert!(values.iter().all(|v| v.is_finite()));

        let frame = model.decode_last_frame(&latents).unwrap();
        assert_eq!(frame.dims(), &[1, 3, 16, 16]);
    }
}
