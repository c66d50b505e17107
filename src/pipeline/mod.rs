//! Image and video generation services and the demo driver
//!
//! ```text
//! image prompt -> ImageGenerator -> seed image
//!                                       |
//!           crop/resize, window of N copies
//!                                       v
//! video prompt -> VideoGenerator::forward_with_vid_resample -> latent video
//!                        ^                                      |
//!                        |            decode_last_frame, write JPEG
//!                        +------ window.push(new frame) <-------+
//! ```
//!
//! The orchestration only talks to the two traits, so it runs equally on
//! the candle-backed models and on deterministic test doubles.

pub mod demo;
pub mod t2v;

pub use demo::{ImageToVideoDemo, SampleReport, generate_seed_image};
pub use t2v::{LatentVideoModel, TextToVideoPipeline, VideoPrompt};

use candle_core::{IndexOp, Tensor};
use image::RgbImage;

use crate::config::ResampleConfig;
use crate::error::Result;
use crate::utils::Pcg32;

/// Latent scaling factor shared by the Stable Diffusion and ModelScope VAEs
pub const VAE_SCALE: f64 = 0.18215;

/// Text-to-image model
pub trait ImageGenerator {
    fn generate(&mut self, prompt: &str) -> Result<RgbImage>;
}

/// Text-and-video conditioned next-frame model
pub trait VideoGenerator {
    /// Prompt representation reused for every frame of a run
    type Prompt;

    fn preprocess(&mut self, prompt: &str) -> Result<Self::Prompt>;

    /// Sample a latent video whose last frame continues `vid`.
    ///
    /// `vid` is the normalized conditioning window, `[1, 3, F, H, W]`. The
    /// result is `[1, C, F + 1, H / 8, W / 8]`.
    fn forward_with_vid_resample(
        &mut self,
        prompt: &Self::Prompt,
        vid: &Tensor,
        resample: &ResampleConfig,
        rng: &mut Pcg32,
    ) -> Result<Tensor>;

    /// Decode the last latent frame to a normalized `[1, 3, H, W]` image
    fn decode_last_frame(&mut self, latents: &Tensor) -> Result<Tensor>;
}

/// Classifier-free guidance on a `[uncond, cond]` batch
pub fn apply_cfg(model_output: &Tensor, guidance_scale: f64) -> candle_core::Result<Tensor> {
    let uncond = model_output.i(0..1)?;
    let cond = model_output.i(1..2)?;
    &uncond + ((cond - &uncond)? * guidance_scale)?
}
