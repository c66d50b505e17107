//! Frame preprocessing and conversion between pixels and tensors
//!
//! Video tensors use the `[N, C, F, H, W]` layout with values normalized to
//! `[-1, 1]` (per-channel mean 0.5, std 0.5). Single frames are `[1, C, H, W]`.

use std::path::Path;

use candle_core::{DType, Device, Tensor};
use image::{ImageFormat, RgbImage, imageops::FilterType};

use crate::error::{Error, Result};

/// Load an image from disk as RGB
pub fn load_image<P: AsRef<Path>>(path: P) -> Result<RgbImage> {
    Ok(image::open(path.as_ref())?.to_rgb8())
}

/// Crop the largest centered square out of `img`
pub fn center_crop(img: &RgbImage) -> RgbImage {
    let (w, h) = img.dimensions();
    let side = w.min(h);
    let x = (w - side) / 2;
    let y = (h - side) / 2;
    image::imageops::crop_imm(img, x, y, side, side).to_image()
}

/// Resize to `size x size` with bicubic filtering
pub fn resize_square(img: &RgbImage, size: usize) -> RgbImage {
    image::imageops::resize(img, size as u32, size as u32, FilterType::CatmullRom)
}

/// Center crop then resize, the preparation applied to the seed image
pub fn prepare_seed_frame(img: &RgbImage, size: usize) -> RgbImage {
    resize_square(&center_crop(img), size)
}

/// Convert an RGB image to a normalized `[1, 3, H, W]` f32 tensor
pub fn image_to_tensor(img: &RgbImage, device: &Device) -> Result<Tensor> {
    let (w, h) = img.dimensions();
    let data = img.as_raw().clone();
    let tensor = Tensor::from_vec(data, (h as usize, w as usize, 3), device)?
        .permute((2, 0, 1))?
        .to_dtype(DType::F32)?
        // (x / 255 - 0.5) / 0.5
        .affine(2.0 / 255.0, -1.0)?
        .unsqueeze(0)?;
    Ok(tensor)
}

/// Stack frames into a normalized `[1, 3, F, H, W]` video tensor
pub fn preprocess_vid(frames: &[RgbImage], device: &Device) -> Result<Tensor> {
    if frames.is_empty() {
        return Err(Error::InvalidConfig(
            "cannot build a video tensor from zero frames".to_string(),
        ));
    }
    let tensors = frames
        .iter()
        .map(|f| image_to_tensor(f, device))
        .collect::<Result<Vec<_>>>()?;
    // each [1, 3, H, W] -> stacked on a new frame axis
    Ok(Tensor::stack(&tensors, 2)?)
}

/// Convert a normalized `[1, 3, H, W]` or `[3, H, W]` tensor back to pixels
pub fn tensor_to_image(frame: &Tensor) -> Result<RgbImage> {
    let frame = match frame.rank() {
        4 => frame.squeeze(0)?,
        3 => frame.clone(),
        r => {
            return Err(Error::Candle(candle_core::Error::Msg(format!(
                "expected a 3D or 4D frame tensor, got rank {r}"
            ))));
        }
    };
    let (_c, h, w) = frame.dims3()?;

    let frame = frame
        .to_dtype(DType::F32)?
        .affine(0.5, 0.5)?
        .clamp(0f32, 1f32)?;
    let frame = (frame * 255.0)?.round()?.to_dtype(DType::U8)?;
    let data: Vec<u8> = frame.permute((1, 2, 0))?.flatten_all()?.to_vec1()?;

    RgbImage::from_raw(w as u32, h as u32, data).ok_or_else(|| {
        Error::Candle(candle_core::Error::Msg(
            "frame buffer does not match its dimensions".to_string(),
        ))
    })
}

/// Write a frame as JPEG, creating the parent directory when needed
pub fn save_frame<P: AsRef<Path>>(img: &RgbImage, path: P) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
    }
    img.save_with_format(path, ImageFormat::Jpeg)?;
    Ok(())
}
