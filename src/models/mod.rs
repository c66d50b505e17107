//! Neural network models
//!
//! - **text_encoder**: CLIP prompt embeddings for both diffusion models
//! - **text_to_image**: Stable Diffusion 2.1 seed image generation
//! - **unet3d**: ModelScope text-to-video denoiser

pub mod text_encoder;
pub mod text_to_image;
pub mod unet3d;

pub use text_encoder::{ClipPromptEncoder, PromptEmbeddings};
pub use text_to_image::{StableDiffusion, TextToImageConfig};
pub use unet3d::{UNet3DConditionModel, UNet3DConfig};
