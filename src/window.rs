//! Rolling conditioning window and the growing output sequence

use std::collections::VecDeque;

use candle_core::Tensor;
use image::RgbImage;

use crate::error::{Error, Result};
use crate::frames::tensor_to_image;

/// Fixed-size window of the most recent frames, oldest first.
///
/// Every frame is a normalized `[1, 3, H, W]` tensor. The window is created
/// full and stays full: each `push` evicts the oldest frame.
#[derive(Debug, Clone)]
pub struct ConditioningWindow {
    frames: VecDeque<Tensor>,
    capacity: usize,
}

impl ConditioningWindow {
    /// Window holding `capacity` copies of `frame`
    pub fn filled(frame: &Tensor, capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(Error::InvalidConfig(
                "conditioning window needs at least one frame".to_string(),
            ));
        }
        let frames = std::iter::repeat_n(frame.clone(), capacity).collect();
        Ok(Self { frames, capacity })
    }

    /// Append the newest frame and drop the oldest one.
    ///
    /// Returns the evicted frame. Fails if the window no longer holds
    /// exactly `capacity` frames afterwards.
    pub fn push(&mut self, frame: Tensor) -> Result<Option<Tensor>> {
        self.frames.push_back(frame);
        let evicted = if self.frames.len() > self.capacity {
            self.frames.pop_front()
        } else {
            None
        };
        self.ensure_full()?;
        Ok(evicted)
    }

    pub fn ensure_full(&self) -> Result<()> {
        if self.frames.len() != self.capacity {
            return Err(Error::WindowLength {
                expected: self.capacity,
                actual: self.frames.len(),
            });
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Newest frame in the window
    pub fn latest(&self) -> Option<&Tensor> {
        self.frames.back()
    }

    /// The window as a `[1, 3, F, H, W]` video tensor
    pub fn as_video(&self) -> Result<Tensor> {
        let frames: Vec<&Tensor> = self.frames.iter().collect();
        Ok(Tensor::stack(&frames, 2)?)
    }
}

/// Seed frame followed by every generated frame
#[derive(Debug, Clone)]
pub struct FrameSequence {
    frames: Vec<Tensor>,
}

impl FrameSequence {
    pub fn new(seed: Tensor) -> Self {
        Self { frames: vec![seed] }
    }

    pub fn push(&mut self, frame: Tensor) {
        self.frames.push(frame);
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Number of frames generated after the seed
    pub fn generated(&self) -> usize {
        self.frames.len().saturating_sub(1)
    }

    pub fn frames(&self) -> &[Tensor] {
        &self.frames
    }

    pub fn to_images(&self) -> Result<Vec<RgbImage>> {
        self.frames.iter().map(tensor_to_image).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    fn frame(value: f64) -> Tensor {
        Tensor::full(value as f32, (1, 3, 4, 4), &Device::Cpu).unwrap()
    }

    fn first_value(t: &Tensor) -> f32 {
        t.flatten_all().unwrap().get(0).unwrap().to_scalar().unwrap()
    }

    #[test]
    fn test_filled_window_is_full() {
        let window = ConditioningWindow::filled(&frame(0.0), 15).unwrap();
        assert_eq!(window.len(), 15);
        assert!(window.ensure_full().is_ok());
        assert_eq!(window.as_video().unwrap().dims(), &[1, 3, 15, 4, 4]);
    }

    #[test]
    fn test_push_evicts_oldest() {
        let mut window = ConditioningWindow::filled(&frame(0.0), 3).unwrap();
        for i in 1..=5 {
            let evicted = window.push(frame(i as f64)).unwrap();
            assert!(evicted.is_some());
            assert_eq!(window.len(), 3);
        }
        // window now holds frames 3, 4, 5
        let video = window.as_video().unwrap().to_dtype(DType::F32).unwrap();
        let first = video.narrow(2, 0, 1).unwrap();
        let last = video.narrow(2, 2, 1).unwrap();
        assert_eq!(first_value(&first), 3.0);
        assert_eq!(first_value(&last), 5.0);
        assert_eq!(first_value(window.latest().unwrap()), 5.0);
    }

    #[test]
    fn test_zero_capacity_rejected() {
        assert!(ConditioningWindow::filled(&frame(0.0), 0).is_err());
    }

    #[test]
    fn test_sequence_counts() {
        let mut seq = FrameSequence::new(frame(0.0));
        assert_eq!(seq.generated(), 0);
        seq.push(frame(0.5));
        seq.push(frame(-0.5));
        assert_eq!(seq.len(), 3);
        assert_eq!(seq.generated(), 2);
        assert_eq!(seq.to_images().unwrap().len(), 3);
    }
}
