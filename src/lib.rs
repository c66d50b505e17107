//! Candle-TI2V: text to image to video generation on the Candle framework.
//!
//! A Stable Diffusion 2.1 image is used as the seed of an autoregressive
//! video: a ModelScope text-to-video UNet predicts one new frame at a time
//! from a rolling window of previous frames (TI2V-Zero style conditioning
//! with temporal resampling).

pub mod config;
pub mod console;
pub mod error;
pub mod export;
pub mod frames;
pub mod loader;
pub mod models;
pub mod naming;
pub mod pipeline;
pub mod schedulers;
pub mod utils;
pub mod window;

pub use config::{DemoConfig, ResampleConfig};
pub use error::{Error, Result};
pub use pipeline::{
    ImageGenerator, ImageToVideoDemo, SampleReport, TextToVideoPipeline, VideoGenerator,
    generate_seed_image,
};
