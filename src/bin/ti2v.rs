//! TI2V CLI - text to image to video
//!
//! Renders a seed image with Stable Diffusion 2.1, then extends it frame by
//! frame with the ModelScope text-to-video UNet. Prompts not given on the
//! command line are read from stdin.

use std::io::{BufRead, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use candle_core::DType;
use clap::Parser;
use tracing::info;

use candle_ti2v::config::{DemoConfig, ResampleConfig};
use candle_ti2v::console::read_prompt;
use candle_ti2v::loader::{self, ComponentFiles};
use candle_ti2v::models::{StableDiffusion, TextToImageConfig};
use candle_ti2v::pipeline::{ImageToVideoDemo, TextToVideoPipeline, generate_seed_image};
use candle_ti2v::utils::{Pcg32, select_device};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Generate an image from text, then extend it into a short video"
)]
struct Args {
    /// Prompt for the seed image (asked interactively when omitted)
    #[arg(long)]
    image_prompt: Option<String>,

    /// Prompt for the video (asked interactively when omitted)
    #[arg(long)]
    video_prompt: Option<String>,

    /// Local Stable Diffusion directory (unet/, vae/, text_encoder/)
    #[arg(long)]
    sd_weights: Option<PathBuf>,

    /// Hub repository used when --sd-weights is absent
    #[arg(long, default_value = loader::SD_REPO)]
    sd_model_id: String,

    /// Local text-to-video directory (unet/, vae/, text_encoder/)
    #[arg(long, default_value = "./weights")]
    weights: PathBuf,

    /// Hub repository used when --weights does not exist
    #[arg(long, default_value = loader::T2V_REPO)]
    t2v_model_id: String,

    /// Where the seed image is written
    #[arg(long, default_value = "genimage.png")]
    image_path: PathBuf,

    /// Output directory for GIFs
    #[arg(long, default_value = "./example-video")]
    output_dir: PathBuf,

    /// Output directory for per-frame JPEGs
    #[arg(long, default_value = "./example-image")]
    output_img_dir: PathBuf,

    /// Random seed
    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// Use CPU even when CUDA or Metal is available
    #[arg(long)]
    cpu: bool,

    /// Run in f32 even on GPU
    #[arg(long)]
    f32: bool,

    /// Frames generated after the seed
    #[arg(long, default_value_t = 15)]
    num_new_frames: usize,

    /// Size of the conditioning window
    #[arg(long, default_value_t = 15)]
    num_cond_frames: usize,

    /// Videos generated one after another
    #[arg(long, default_value_t = 1)]
    num_samples: usize,

    /// Side of the square video frames
    #[arg(long, default_value_t = 256)]
    frame_size: usize,

    /// Extra re-noise/denoise passes per DDIM step
    #[arg(long, default_value_t = 2)]
    resample_iter: usize,

    /// DDIM sampling steps for each new frame
    #[arg(long, default_value_t = 10)]
    ddim_step: usize,

    /// Classifier-free guidance scale of the video model
    #[arg(long, default_value_t = 9.0)]
    guide_scale: f64,

    /// Do not overwrite the conditioning frames during sampling
    #[arg(long)]
    no_vid_cond: bool,

    /// Noise the conditioning frames independently instead of along one DDPM trajectory
    #[arg(long)]
    no_ddpm_inversion: bool,

    /// GIF playback rate
    #[arg(long, default_value_t = 8)]
    fps: u32,

    /// Stable Diffusion sampling steps
    #[arg(long, default_value_t = 50)]
    sd_steps: usize,

    /// Stable Diffusion guidance scale
    #[arg(long, default_value_t = 7.5)]
    sd_guidance: f64,

    /// Seed image height
    #[arg(long, default_value_t = 768)]
    height: usize,

    /// Seed image width
    #[arg(long, default_value_t = 768)]
    width: usize,

    /// Use flash attention in the Stable Diffusion UNet
    #[arg(long)]
    use_flash_attn: bool,

    /// Attention query chunk length, bounds peak memory
    #[arg(long)]
    sliced_attention_size: Option<usize>,
}

fn prompt_or_ask(
    given: Option<String>,
    question: &str,
    stdin: &mut impl BufRead,
    stdout: &mut impl Write,
) -> Result<String> {
    match given {
        Some(prompt) => Ok(prompt),
        None => read_prompt(stdin, stdout, question).context("failed to read prompt"),
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("candle_ti2v=info".parse()?)
                .add_directive("ti2v=info".parse()?),
        )
        .init();

    let args = Args::parse();

    let device = select_device(args.cpu);
    // The CPU backend cannot be seeded; our own noise is seeded either way
    if !device.is_cpu() {
        device.set_seed(args.seed)?;
    }
    let dtype = if device.is_cpu() || args.f32 {
        DType::F32
    } else {
        DType::F16
    };
    info!("Dtype: {:?}", dtype);

    let demo_config = DemoConfig {
        image_path: args.image_path.clone(),
        num_samples: args.num_samples,
        gif_fps: args.fps,
        ..Default::default()
    }
    .with_seed(args.seed)
    .with_output_dirs(&args.output_dir, &args.output_img_dir)
    .with_frames(args.num_cond_frames, args.num_new_frames)
    .with_frame_size(args.frame_size)
    .with_resample(ResampleConfig {
        resample_iter: args.resample_iter,
        ddim_step: args.ddim_step,
        guide_scale: args.guide_scale,
        add_vid_cond: !args.no_vid_cond,
        use_ddpm_inversion: !args.no_ddpm_inversion,
    });
    let demo = ImageToVideoDemo::new(demo_config).context("invalid run configuration")?;

    let stdin = std::io::stdin();
    let mut stdin = stdin.lock();
    let mut stdout = std::io::stdout();

    // 1. Seed image
    let image_prompt = prompt_or_ask(
        args.image_prompt,
        "Give me the prompt for the image",
        &mut stdin,
        &mut stdout,
    )?;
    let seed_image = {
        let files = ComponentFiles::resolve(
            args.sd_weights.as_deref(),
            &args.sd_model_id,
            dtype == DType::F16,
        )
        .context("failed to locate Stable Diffusion weights")?;
        let mut sd = StableDiffusion::load(
            &files,
            TextToImageConfig {
                height: args.height,
                width: args.width,
                num_inference_steps: args.sd_steps,
                guidance_scale: args.sd_guidance,
                use_flash_attn: args.use_flash_attn,
                sliced_attention_size: args.sliced_attention_size,
                seed: args.seed,
            },
            &device,
            dtype,
        )
        .context("failed to load Stable Diffusion")?;
        generate_seed_image(&mut sd, &image_prompt, &demo.config().image_path)
            .context("seed image generation failed")?
    };

    // 2. Video
    let video_prompt = prompt_or_ask(
        args.video_prompt,
        "Give me the prompt for the video",
        &mut stdin,
        &mut stdout,
    )?;
    let files = ComponentFiles::resolve(Some(&args.weights), &args.t2v_model_id, dtype == DType::F16)
        .context("failed to locate text-to-video weights")?;
    let unet_config = loader::load_unet3d_config(&files)?
        .with_sliced_attention(args.sliced_attention_size);
    let mut pipeline = TextToVideoPipeline::load(&files, unet_config, &device, dtype)
        .context("failed to load text-to-video pipeline")?;

    let mut rng = Pcg32::from_seed(args.seed);
    let reports = demo
        .run(&mut pipeline, &seed_image, &video_prompt, &mut rng)
        .context("video generation failed")?;

    for report in &reports {
        info!(
            sample = report.sample_idx,
            frames = report.num_frames,
            gif = %report.gif_path.display(),
            "sample done"
        );
    }
    Ok(())
}
