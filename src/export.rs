//! Playable clip export

use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

use gif::{Encoder, Frame, Repeat};
use image::RgbImage;
use rayon::prelude::*;
use tracing::debug;

use crate::error::{Error, Result};

/// NeuQuant speed used for palette quantization (1 = best, 30 = fastest)
const QUANTIZE_SPEED: i32 = 10;

/// Write `frames` as an infinitely looping GIF played at `fps`.
///
/// All frames must share the dimensions of the first one.
pub fn write_gif<P: AsRef<Path>>(frames: &[RgbImage], path: P, fps: u32) -> Result<()> {
    let path = path.as_ref();
    let Some(first) = frames.first() else {
        return Err(Error::InvalidConfig("cannot write a GIF without frames".to_string()));
    };
    let (w, h) = first.dimensions();
    if frames.iter().any(|f| f.dimensions() != (w, h)) {
        return Err(Error::InvalidConfig(
            "all GIF frames must have the same dimensions".to_string(),
        ));
    }
    if w > u16::MAX as u32 || h > u16::MAX as u32 {
        return Err(Error::InvalidConfig(format!("frame {w}x{h} too large for GIF")));
    }

    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
    }

    let delay = (100 / fps.max(1)).max(1) as u16;
    let file = File::create(path).map_err(|e| Error::io(path, e))?;
    let mut encoder = Encoder::new(BufWriter::new(file), w as u16, h as u16, &[])?;
    encoder.set_repeat(Repeat::Infinite)?;

    // Quantize in parallel, write in order
    let encoded: Vec<Frame<'static>> = frames
        .par_iter()
        .map(|img| {
            let mut frame = Frame::from_rgb_speed(w as u16, h as u16, img.as_raw(), QUANTIZE_SPEED);
            frame.delay = delay;
            frame
        })
        .collect();

    for frame in &encoded {
        encoder.write_frame(frame)?;
    }
    debug!(path = %path.display(), frames = encoded.len(), "GIF written");
    Ok(())
}
