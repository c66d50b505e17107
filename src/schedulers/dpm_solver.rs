//! DPM-Solver++ multistep scheduler (data prediction, second order, midpoint)
//!
//! Used for the Stable Diffusion seed image. Timesteps follow linspace
//! spacing; the final step always drops to first order and lands on the
//! clean sample.

use candle_core::{DType, Result, Tensor};
use serde::{Deserialize, Serialize};

use super::{BetaSchedule, PredictionType, alphas_cumprod, split_prediction};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DpmSolverConfig {
    pub num_train_timesteps: usize,
    pub beta_start: f64,
    pub beta_end: f64,
    pub beta_schedule: BetaSchedule,
    pub prediction_type: PredictionType,
    /// 1 or 2
    pub solver_order: usize,
}

impl Default for DpmSolverConfig {
    /// Stable Diffusion 2.1 (768, v-prediction)
    fn default() -> Self {
        Self {
            num_train_timesteps: 1000,
            beta_start: 0.00085,
            beta_end: 0.012,
            beta_schedule: BetaSchedule::ScaledLinear,
            prediction_type: PredictionType::VPrediction,
            solver_order: 2,
        }
    }
}

#[derive(Debug)]
pub struct DpmSolverMultistepScheduler {
    config: DpmSolverConfig,
    alphas_cumprod: Vec<f64>,
    timesteps: Vec<usize>,
    /// Data predictions of the previous and current step
    model_outputs: Vec<Tensor>,
    lower_order_nums: usize,
    step_index: usize,
}

impl DpmSolverMultistepScheduler {
    pub fn new(config: DpmSolverConfig, num_inference_steps: usize) -> Self {
        let alphas_cumprod = alphas_cumprod(
            config.num_train_timesteps,
            config.beta_start,
            config.beta_end,
            config.beta_schedule,
        );

        // linspace(0, T - 1, n + 1).round(), reversed, last entry dropped
        let n = num_inference_steps.max(1);
        let last = (config.num_train_timesteps - 1) as f64;
        let timesteps = (1..=n)
            .rev()
            .map(|i| (last * i as f64 / n as f64).round() as usize)
            .collect();

        Self {
            config,
            alphas_cumprod,
            timesteps,
            model_outputs: Vec::with_capacity(2),
            lower_order_nums: 0,
            step_index: 0,
        }
    }

    pub fn timesteps(&self) -> &[usize] {
        &self.timesteps
    }

    /// Initial latents are unit Gaussians
    pub fn init_noise_sigma(&self) -> f64 {
        1.0
    }

    /// `(alpha_t, sigma_t)`; `None` is the clean terminal state
    fn alpha_sigma(&self, t: Option<usize>) -> (f64, f64) {
        match t {
            Some(t) => {
                let a = self.alphas_cumprod[t];
                (a.sqrt(), (1.0 - a).sqrt())
            }
            None => (1.0, 0.0),
        }
    }

    fn lambda(&self, t: usize) -> f64 {
        let (alpha, sigma) = self.alpha_sigma(Some(t));
        alpha.ln() - sigma.ln()
    }

    /// Advance `sample` by one solver step using `model_output` at the
    /// current timestep.
    pub fn step(&mut self, model_output: &Tensor, sample: &Tensor) -> Result<Tensor> {
        let i = self.step_index;
        if i >= self.timesteps.len() {
            candle_core::bail!("DPM-Solver stepped past its {} timesteps", self.timesteps.len());
        }
        let original_dtype = sample.dtype();
        let sample = sample.to_dtype(DType::F32)?;
        let model_output = model_output.to_dtype(DType::F32)?;

        let t = self.timesteps[i];
        let prev_t = self.timesteps.get(i + 1).copied();

        let alpha_bar = self.alphas_cumprod[t];
        let (x0, _eps) =
            split_prediction(&model_output, &sample, alpha_bar, self.config.prediction_type)?;

        if self.model_outputs.len() == 2 {
            self.model_outputs.remove(0);
        }
        self.model_outputs.push(x0);

        let is_final = prev_t.is_none();
        let first_order =
            self.config.solver_order < 2 || self.lower_order_nums < 1 || is_final;

        let (alpha_s, sigma_s) = self.alpha_sigma(Some(t));
        let (alpha_t, sigma_t) = self.alpha_sigma(prev_t);
        // exp(-h) with h = lambda_t - lambda_s, finite even at the clean state
        let exp_neg_h = (sigma_t * alpha_s) / (alpha_t * sigma_s);

        let m0 = &self.model_outputs[self.model_outputs.len() - 1];
        let first = ((&sample * (sigma_t / sigma_s))? - (m0 * (alpha_t * (exp_neg_h - 1.0)))?)?;

        let prev_sample = if first_order {
            first
        } else {
            let m1 = &self.model_outputs[0];
            let s1 = self.timesteps[i - 1];
            // prev_t is Some here since the final step is first order
            let lambda_t = self.lambda(prev_t.unwrap_or(t));
            let lambda_s0 = self.lambda(t);
            let lambda_s1 = self.lambda(s1);
            let h = lambda_t - lambda_s0;
            let h_0 = lambda_s0 - lambda_s1;
            let r0 = h_0 / h;
            let d1 = ((m0 - m1)? * (1.0 / r0))?;
            (first - (d1 * (0.5 * alpha_t * (exp_neg_h - 1.0)))?)?
        };

        if self.lower_order_nums < self.config.solver_order {
            self.lower_order_nums += 1;
        }
        self.step_index += 1;

        prev_sample.to_dtype(original_dtype)
    }
}
