//! Autoregressive image-to-video demo loop

use std::path::{Path, PathBuf};

use candle_core::{Device, Tensor};
use image::{ImageFormat, RgbImage};
use tracing::{debug, info};

use super::{ImageGenerator, VideoGenerator};
use crate::config::DemoConfig;
use crate::error::{Error, Result};
use crate::export::write_gif;
use crate::frames::{image_to_tensor, prepare_seed_frame, save_frame, tensor_to_image};
use crate::naming::{OutputNames, output_postfix};
use crate::utils::Pcg32;
use crate::window::{ConditioningWindow, FrameSequence};

/// Render the seed image for `prompt` and save it as PNG at `path`
pub fn generate_seed_image<G: ImageGenerator + ?Sized>(
    generator: &mut G,
    prompt: &str,
    path: &Path,
) -> Result<RgbImage> {
    let image = generator.generate(prompt)?;
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
    }
    image.save_with_format(path, ImageFormat::Png)?;
    info!(path = %path.display(), "seed image saved");
    Ok(image)
}

/// What one sample wrote to disk
#[derive(Debug, Clone)]
pub struct SampleReport {
    pub sample_idx: usize,
    pub video_name: String,
    pub frame_dir: PathBuf,
    /// JPEG frames in order, the seed first
    pub frame_files: Vec<PathBuf>,
    pub gif_path: PathBuf,
    /// Frames in the exported clip, seed included
    pub num_frames: usize,
}

#[derive(Debug, Clone)]
pub struct ImageToVideoDemo {
    config: DemoConfig,
}

impl ImageToVideoDemo {
    pub fn new(config: DemoConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &DemoConfig {
        &self.config
    }

    /// Extend `seed_image` into `num_samples` clips driven by `prompt`.
    ///
    /// The run postfix is drawn from `rng` first; every later draw of the
    /// video model comes from the same generator.
    pub fn run<V: VideoGenerator>(
        &self,
        video: &mut V,
        seed_image: &RgbImage,
        prompt: &str,
        rng: &mut Pcg32,
    ) -> Result<Vec<SampleReport>> {
        let config = &self.config;
        let resample = &config.resample;

        let postfix = output_postfix(
            resample.resample_iter,
            resample.ddim_step,
            rng.next_below(10_000),
        );
        info!(
            new_frames = config.num_new_frames,
            prompt,
            postfix = %postfix,
            video_cond = resample.add_vid_cond,
            ddpm_inv = resample.use_ddpm_inversion,
            resample_iter = resample.resample_iter,
            "starting image-to-video generation"
        );

        for dir in [&config.output_dir, &config.output_img_dir] {
            std::fs::create_dir_all(dir).map_err(|e| Error::io(dir, e))?;
        }

        let seed_frame = prepare_seed_frame(seed_image, config.frame_size);
        let seed_tensor = image_to_tensor(&seed_frame, &Device::Cpu)?;
        let processed = video.preprocess(prompt)?;

        let mut reports = Vec::with_capacity(config.num_samples);
        for sample_idx in 0..config.num_samples {
            reports.push(self.run_sample(
                video,
                &processed,
                (&seed_frame, &seed_tensor),
                prompt,
                &postfix,
                sample_idx,
                rng,
            )?);
        }
        Ok(reports)
    }

    #[allow(clippy::too_many_arguments)]
    fn run_sample<V: VideoGenerator>(
        &self,
        video: &mut V,
        processed: &V::Prompt,
        (seed_frame, seed_tensor): (&RgbImage, &Tensor),
        prompt: &str,
        postfix: &str,
        sample_idx: usize,
        rng: &mut Pcg32,
    ) -> Result<SampleReport> {
        let config = &self.config;
        let names = OutputNames::new(prompt, postfix, sample_idx, config.num_new_frames);
        let frame_dir = names.frame_dir(&config.output_img_dir);
        std::fs::create_dir_all(&frame_dir).map_err(|e| Error::io(&frame_dir, e))?;

        let mut window = ConditioningWindow::filled(seed_tensor, config.num_cond_frames)?;
        let mut sequence = FrameSequence::new(seed_tensor.clone());

        let mut frame_files = Vec::with_capacity(config.num_new_frames + 1);
        let seed_path = frame_dir.join(names.frame_file(0));
        save_frame(seed_frame, &seed_path)?;
        frame_files.push(seed_path);

        for i in 0..config.num_new_frames {
            info!(i, prompt, postfix = %names.sample_postfix, "generating frame");
            let vid = window.as_video()?;
            let latents =
                video.forward_with_vid_resample(processed, &vid, &config.resample, rng)?;
            let frame = video.decode_last_frame(&latents)?.to_device(&Device::Cpu)?;
            debug!(shape = ?frame.dims(), "decoded frame");

            let path = frame_dir.join(names.frame_file(i + 1));
            save_frame(&tensor_to_image(&frame)?, &path)?;
            frame_files.push(path);

            sequence.push(frame.clone());
            window.push(frame)?;
        }

        let gif_path = names.gif_path(&config.output_dir);
        write_gif(&sequence.to_images()?, &gif_path, config.gif_fps)?;
        info!(frames = %frame_dir.display(), "saving to");
        info!(video = %gif_path.display(), "saving video to");

        Ok(SampleReport {
            sample_idx,
            video_name: names.video_name,
            frame_dir,
            frame_files,
            gif_path,
            num_frames: sequence.len(),
        })
    }
}
