//! Seeded noise source
//!
//! Every random draw of a run (Gaussian latents, re-noising, the output
//! postfix) goes through one [`Pcg32`], so a fixed seed reproduces the run
//! bit for bit on the same device, independent of the backend RNG.

use candle_core::{DType, Device, Result, Shape, Tensor};

/// Stream selector used when only a seed is given
const DEFAULT_STREAM: u64 = 54;

/// PCG32 (XSH-RR) random number generator
#[derive(Debug, Clone)]
pub struct Pcg32 {
    state: u64,
    inc: u64,
}

impl Pcg32 {
    pub fn new(seed: u64, inc: u64) -> Self {
        let mut rng = Self {
            state: 0,
            inc: (inc << 1) | 1,
        };
        rng.next_u32();
        rng.state = rng.state.wrapping_add(seed);
        rng.next_u32();
        rng
    }

    pub fn from_seed(seed: u64) -> Self {
        Self::new(seed, DEFAULT_STREAM)
    }

    pub fn next_u32(&mut self) -> u32 {
        let oldstate = self.state;
        self.state = oldstate
            .wrapping_mul(6364136223846793005)
            .wrapping_add(self.inc);
        let xorshifted = (((oldstate >> 18) ^ oldstate) >> 27) as u32;
        let rot = (oldstate >> 59) as u32;
        xorshifted.rotate_right(rot)
    }

    /// Uniform integer in `0..bound` (Lemire's nearly divisionless method)
    pub fn next_below(&mut self, bound: u32) -> u32 {
        assert!(bound > 0, "bound must be positive");
        let threshold = bound.wrapping_neg() % bound;
        loop {
            let m = self.next_u32() as u64 * bound as u64;
            if (m as u32) >= threshold {
                return (m >> 32) as u32;
            }
        }
    }

    /// Uniform float in `[0, 1)` with 24 bits of precision
    pub fn next_f32(&mut self) -> f32 {
        (self.next_u32() >> 8) as f32 * 5.960_464_5e-8
    }

    /// Two independent standard normal samples (Box-Muller)
    pub fn next_gaussian(&mut self) -> (f32, f32) {
        let u1 = loop {
            let x = self.next_f32();
            if x > 1e-7 {
                break x;
            }
        };
        let u2 = self.next_f32();

        let mag = (-2.0 * u1.ln()).sqrt();
        let angle = 2.0 * std::f32::consts::PI * u2;
        (mag * angle.cos(), mag * angle.sin())
    }

    /// f32 tensor of standard normal noise
    pub fn randn(&mut self, shape: impl Into<Shape>, device: &Device) -> Result<Tensor> {
        let shape = shape.into();
        let elem_count = shape.elem_count();
        let mut data = Vec::with_capacity(elem_count + 1);
        while data.len() < elem_count {
            let (z0, z1) = self.next_gaussian();
            data.push(z0);
            data.push(z1);
        }
        data.truncate(elem_count);
        Tensor::from_vec(data, shape, device)
    }

    /// Noise with the shape, device and dtype of `t`
    pub fn randn_like(&mut self, t: &Tensor) -> Result<Tensor> {
        let noise = self.randn(t.dims(), t.device())?;
        if t.dtype() == DType::F32 {
            Ok(noise)
        } else {
            noise.to_dtype(t.dtype())
        }
    }
}
