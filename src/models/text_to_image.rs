//! Stable Diffusion 2.1 seed image generator
//!
//! UNet, VAE and CLIP come from `candle_transformers`; sampling uses
//! DPM-Solver++ with classifier-free guidance and v-prediction.

use candle_core::{DType, Device, Tensor};
use candle_transformers::models::stable_diffusion::{
    StableDiffusionConfig, unet_2d::UNet2DConditionModel, vae::AutoEncoderKL,
};
use image::RgbImage;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::text_encoder::ClipPromptEncoder;
use crate::error::{Error, Result};
use crate::frames::tensor_to_image;
use crate::loader::ComponentFiles;
use crate::pipeline::{ImageGenerator, VAE_SCALE, apply_cfg};
use crate::schedulers::{DpmSolverConfig, DpmSolverMultistepScheduler};
use crate::utils::Pcg32;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TextToImageConfig {
    pub height: usize,
    pub width: usize,
    pub num_inference_steps: usize,
    pub guidance_scale: f64,
    pub use_flash_attn: bool,
    pub sliced_attention_size: Option<usize>,
    pub seed: u64,
}

impl Default for TextToImageConfig {
    fn default() -> Self {
        Self {
            height: 768,
            width: 768,
            num_inference_steps: 50,
            guidance_scale: 7.5,
            use_flash_attn: false,
            sliced_attention_size: None,
            seed: 42,
        }
    }
}

pub struct StableDiffusion {
    text_encoder: ClipPromptEncoder,
    unet: UNet2DConditionModel,
    vae: AutoEncoderKL,
    config: TextToImageConfig,
    rng: Pcg32,
    device: Device,
    dtype: DType,
}

impl StableDiffusion {
    pub fn load(
        files: &ComponentFiles,
        config: TextToImageConfig,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        if config.height % 8 != 0 || config.width % 8 != 0 {
            return Err(Error::InvalidConfig(format!(
                "image size {}x{} must be a multiple of 8",
                config.width, config.height
            )));
        }
        let sd = StableDiffusionConfig::v2_1(
            config.sliced_attention_size,
            Some(config.height),
            Some(config.width),
        );

        info!("Loading Stable Diffusion text encoder...");
        let text_encoder = ClipPromptEncoder::load(
            &sd.clip,
            &files.text_encoder,
            &files.tokenizer,
            device,
            dtype,
        )?;
        info!("Loading Stable Diffusion UNet...");
        let unet = sd.build_unet(&files.unet, device, 4, config.use_flash_attn, dtype)?;
        info!("Loading Stable Diffusion VAE...");
        let vae = sd.build_vae(&files.vae, device, dtype)?;

        let rng = Pcg32::from_seed(config.seed);
        Ok(Self {
            text_encoder,
            unet,
            vae,
            config,
            rng,
            device: device.clone(),
            dtype,
        })
    }

    /// Denoised latents `[1, 4, H/8, W/8]` for `prompt`
    pub fn sample_latents(&mut self, prompt: &str) -> Result<Tensor> {
        let embeddings = self
            .text_encoder
            .encode_with_uncond(prompt)?
            .batched()?
            .to_dtype(self.dtype)?;

        let mut scheduler =
            DpmSolverMultistepScheduler::new(DpmSolverConfig::default(), self.config.num_inference_steps);
        let shape = (1, 4, self.config.height / 8, self.config.width / 8);
        let mut latents = (self.rng.randn(shape, &self.device)? * scheduler.init_noise_sigma())?;

        let timesteps = scheduler.timesteps().to_vec();
        for (i, &t) in timesteps.iter().enumerate() {
            let input = Tensor::cat(&[&latents, &latents], 0)?.to_dtype(self.dtype)?;
            let output = self.unet.forward(&input, t as f64, &embeddings)?;
            let guided = apply_cfg(&output, self.config.guidance_scale)?.to_dtype(DType::F32)?;
            latents = scheduler.step(&guided, &latents)?;
            debug!(step = i + 1, total = timesteps.len(), t, "image denoising step");
        }
        Ok(latents)
    }

    /// Decode latents to a normalized `[1, 3, H, W]` image
    pub fn decode(&self, latents: &Tensor) -> Result<Tensor> {
        let latents = (latents / VAE_SCALE)?.to_dtype(self.dtype)?;
        Ok(self.vae.decode(&latents)?.to_dtype(DType::F32)?)
    }
}

impl ImageGenerator for StableDiffusion {
    fn generate(&mut self, prompt: &str) -> Result<RgbImage> {
        info!(prompt, steps = self.config.num_inference_steps, "generating seed image");
        let latents = self.sample_latents(prompt)?;
        tensor_to_image(&self.decode(&latents)?)
    }
}
