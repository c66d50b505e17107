//! DDIM scheduler for the video model
//!
//! Timesteps are placed the ModelScope way: `1 + k * stride` for
//! `k * stride < T`, clamped to `T - 1`, visited in descending order, with
//! `stride = T / steps`. Stepping from `t` lands on `max(t - stride, 0)`.
//!
//! Besides the deterministic (eta = 0) step this scheduler exposes the
//! forward-noising operations the conditioning sampler needs: `add_noise`
//! (q-sample from clean latents), `renoise` (advance a sample from a lower
//! noise level to a higher one) and `forward_trajectory` (a DDPM forward
//! chain over the whole schedule).

use candle_core::{DType, Result, Tensor};
use serde::{Deserialize, Serialize};

use super::{BetaSchedule, PredictionType, alphas_cumprod, split_prediction};
use crate::utils::Pcg32;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DdimSchedulerConfig {
    pub num_train_timesteps: usize,
    pub beta_start: f64,
    pub beta_end: f64,
    pub beta_schedule: BetaSchedule,
    pub prediction_type: PredictionType,
}

impl Default for DdimSchedulerConfig {
    fn default() -> Self {
        Self {
            num_train_timesteps: 1000,
            beta_start: 0.00085,
            beta_end: 0.012,
            beta_schedule: BetaSchedule::ScaledLinear,
            prediction_type: PredictionType::Epsilon,
        }
    }
}

/// Output from a DDIM step
#[derive(Debug)]
pub struct DdimStepOutput {
    pub prev_sample: Tensor,
    pub pred_original_sample: Tensor,
}

#[derive(Debug, Clone)]
pub struct DdimScheduler {
    config: DdimSchedulerConfig,
    alphas_cumprod: Vec<f64>,
    timesteps: Vec<usize>,
    stride: usize,
}

impl DdimScheduler {
    pub fn new(config: DdimSchedulerConfig, num_inference_steps: usize) -> Self {
        let alphas_cumprod = alphas_cumprod(
            config.num_train_timesteps,
            config.beta_start,
            config.beta_end,
            config.beta_schedule,
        );
        let num_train = config.num_train_timesteps;
        let stride = (num_train / num_inference_steps.max(1)).max(1);
        let timesteps = (0..num_train)
            .step_by(stride)
            .map(|t| (t + 1).min(num_train - 1))
            .rev()
            .collect();

        Self {
            config,
            alphas_cumprod,
            timesteps,
            stride,
        }
    }

    pub fn config(&self) -> &DdimSchedulerConfig {
        &self.config
    }

    /// Descending inference timesteps
    pub fn timesteps(&self) -> &[usize] {
        &self.timesteps
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    /// Timestep a DDIM step from `t` lands on
    pub fn prev_timestep(&self, t: usize) -> usize {
        t.saturating_sub(self.stride)
    }

    /// Cumulative alpha at training timestep `t`
    pub fn alpha_bar(&self, t: usize) -> f64 {
        self.alphas_cumprod[t.min(self.alphas_cumprod.len() - 1)]
    }

    /// Deterministic DDIM step from `t` to `prev_timestep(t)`
    pub fn step(&self, model_output: &Tensor, t: usize, sample: &Tensor) -> Result<DdimStepOutput> {
        let original_dtype = sample.dtype();
        let sample = sample.to_dtype(DType::F32)?;
        let model_output = model_output.to_dtype(DType::F32)?;

        let alpha_t = self.alpha_bar(t);
        let alpha_prev = self.alpha_bar(self.prev_timestep(t));

        let (x0, eps) = split_prediction(
            &model_output,
            &sample,
            alpha_t,
            self.config.prediction_type,
        )?;

        let prev_sample = ((&x0 * alpha_prev.sqrt())? + (&eps * (1.0 - alpha_prev).sqrt())?)?;

        Ok(DdimStepOutput {
            prev_sample: prev_sample.to_dtype(original_dtype)?,
            pred_original_sample: x0.to_dtype(original_dtype)?,
        })
    }

    /// Sample `q(x_t | x_0)` with the given noise
    pub fn add_noise(&self, original: &Tensor, noise: &Tensor, t: usize) -> Result<Tensor> {
        let alpha = self.alpha_bar(t);
        (original * alpha.sqrt())? + (noise * (1.0 - alpha).sqrt())?
    }

    /// Move a sample at timestep `from` up to the noisier timestep `to`
    /// by sampling `q(x_to | x_from)`.
    pub fn renoise(&self, sample: &Tensor, from: usize, to: usize, noise: &Tensor) -> Result<Tensor> {
        let ratio = self.transition_ratio(Some(from), to);
        (sample * ratio.sqrt())? + (noise * (1.0 - ratio).sqrt())?
    }

    /// DDPM forward chain of `x0` over the schedule.
    ///
    /// Entry `k` is the sample at `timesteps()[k]`; each level is derived from
    /// the next cleaner one, so all levels share one consistent trajectory.
    pub fn forward_trajectory(&self, x0: &Tensor, rng: &mut Pcg32) -> Result<Vec<Tensor>> {
        let mut trajectory = Vec::with_capacity(self.timesteps.len());
        let mut current = x0.to_dtype(DType::F32)?;
        let mut from: Option<usize> = None;
        for &t in self.timesteps.iter().rev() {
            let ratio = self.transition_ratio(from, t);
            let noise = rng.randn(current.dims(), current.device())?;
            current = ((&current * ratio.sqrt())? + (noise * (1.0 - ratio).sqrt())?)?;
            trajectory.push(current.to_dtype(x0.dtype())?);
            from = Some(t);
        }
        trajectory.reverse();
        Ok(trajectory)
    }

    /// `alpha_bar(to) / alpha_bar(from)`; `from = None` is the clean sample
    fn transition_ratio(&self, from: Option<usize>, to: usize) -> f64 {
        let alpha_from = from.map_or(1.0, |f| self.alpha_bar(f));
        (self.alpha_bar(to) / alpha_from).min(1.0)
    }
}
