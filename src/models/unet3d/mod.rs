//! ModelScope text-to-video 3D UNet
//!
//! Weight names follow the diffusers `UNet3DConditionModel` layout, so the
//! `unet/` folder of `damo-vilab/text-to-video-ms-1.7b` loads as is.

pub mod blocks;
pub mod config;
pub mod model;
pub mod resnet;
pub mod transformer;

pub use config::{DownBlockType, UNet3DConfig, UpBlockType};
pub use model::UNet3DConditionModel;
