//! Run configuration for the image-to-video demo

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Temporal resampling and DDIM conditioning parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResampleConfig {
    /// Extra re-noise/denoise passes per DDIM timestep
    pub resample_iter: usize,
    /// Number of DDIM sampling steps
    pub ddim_step: usize,
    /// Classifier-free guidance scale
    pub guide_scale: f64,
    /// Overwrite the conditioning slots with noisy conditioning latents at every step
    pub add_vid_cond: bool,
    /// Derive conditioning noise (and the new frame's starting noise) from a
    /// DDPM forward trajectory of the conditioning latents
    pub use_ddpm_inversion: bool,
}

impl Default for ResampleConfig {
    fn default() -> Self {
        Self {
            resample_iter: 2,
            ddim_step: 10,
            guide_scale: 9.0,
            add_vid_cond: true,
            use_ddpm_inversion: true,
        }
    }
}

/// Parameters of one demo invocation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DemoConfig {
    /// Where the generated seed image is written
    pub image_path: PathBuf,
    /// Directory receiving the GIF of every sample
    pub output_dir: PathBuf,
    /// Directory receiving one sub-directory of JPEG frames per sample
    pub output_img_dir: PathBuf,
    /// Side length of the square frames fed to the video model
    pub frame_size: usize,
    /// Clip length of the video model (conditioning frames + 1)
    pub num_frames: usize,
    /// Size of the rolling conditioning window
    pub num_cond_frames: usize,
    /// Frames to generate after the seed
    pub num_new_frames: usize,
    /// Samples generated one after another
    pub num_samples: usize,
    /// Playback rate of the exported GIF
    pub gif_fps: u32,
    /// Seed for every random draw of the run
    pub seed: u64,
    pub resample: ResampleConfig,
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            image_path: PathBuf::from("genimage.png"),
            output_dir: PathBuf::from("./example-video"),
            output_img_dir: PathBuf::from("./example-image"),
            frame_size: 256,
            num_frames: 16,
            num_cond_frames: 15,
            num_new_frames: 15,
            num_samples: 1,
            gif_fps: 8,
            seed: 42,
            resample: ResampleConfig::default(),
        }
    }
}

impl DemoConfig {
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_output_dirs(
        mut self,
        output_dir: impl Into<PathBuf>,
        output_img_dir: impl Into<PathBuf>,
    ) -> Self {
        self.output_dir = output_dir.into();
        self.output_img_dir = output_img_dir.into();
        self
    }

    pub fn with_frames(mut self, num_cond_frames: usize, num_new_frames: usize) -> Self {
        self.num_cond_frames = num_cond_frames;
        self.num_frames = num_cond_frames + 1;
        self.num_new_frames = num_new_frames;
        self
    }

    pub fn with_frame_size(mut self, frame_size: usize) -> Self {
        self.frame_size = frame_size;
        self
    }

    pub fn with_resample(mut self, resample: ResampleConfig) -> Self {
        self.resample = resample;
        self
    }

    /// Check the relations the video model relies on
    pub fn validate(&self) -> Result<()> {
        if self.num_cond_frames == 0 {
            return Err(Error::InvalidConfig(
                "num_cond_frames must be at least 1".to_string(),
            ));
        }
        if self.num_cond_frames + 1 != self.num_frames {
            return Err(Error::InvalidConfig(format!(
                "num_frames ({}) must equal num_cond_frames ({}) + 1",
                self.num_frames, self.num_cond_frames
            )));
        }
        if self.frame_size == 0 || self.frame_size % 8 != 0 {
            return Err(Error::InvalidConfig(format!(
                "frame_size ({}) must be a positive multiple of 8",
                self.frame_size
            )));
        }
        if self.resample.ddim_step == 0 {
            return Err(Error::InvalidConfig("ddim_step must be at least 1".to_string()));
        }
        if self.gif_fps == 0 {
            return Err(Error::InvalidConfig("gif_fps must be at least 1".to_string()));
        }
        Ok(())
    }
}
