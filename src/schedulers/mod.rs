//! Noise schedulers
//!
//! - **ddim**: deterministic DDIM sampling with forward-noising helpers used
//!   for video conditioning and temporal resampling
//! - **dpm_solver**: DPM-Solver++ multistep sampling for image generation

pub mod ddim;
pub mod dpm_solver;

pub use ddim::{DdimScheduler, DdimSchedulerConfig, DdimStepOutput};
pub use dpm_solver::{DpmSolverConfig, DpmSolverMultistepScheduler};

use candle_core::{Result, Tensor};
use serde::{Deserialize, Serialize};

/// How betas are spread over the training timesteps
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BetaSchedule {
    /// Linear in beta
    Linear,
    /// Linear in sqrt(beta), the Stable Diffusion schedule
    ScaledLinear,
}

/// What the denoiser predicts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PredictionType {
    Epsilon,
    VPrediction,
}

/// Cumulative product of `1 - beta` for every training timestep
pub fn alphas_cumprod(
    num_train_timesteps: usize,
    beta_start: f64,
    beta_end: f64,
    schedule: BetaSchedule,
) -> Vec<f64> {
    let denom = (num_train_timesteps.max(2) - 1) as f64;
    let betas = (0..num_train_timesteps).map(|i| {
        let t = i as f64 / denom;
        match schedule {
            BetaSchedule::Linear => beta_start + t * (beta_end - beta_start),
            BetaSchedule::ScaledLinear => {
                let start = beta_start.sqrt();
                let end = beta_end.sqrt();
                let b = start + t * (end - start);
                b * b
            }
        }
    });

    let mut cumprod = 1.0;
    betas
        .map(|beta| {
            cumprod *= 1.0 - beta;
            cumprod
        })
        .collect()
}

/// Recover `(x0, epsilon)` from a model output at noise level `alpha_bar`
pub(crate) fn split_prediction(
    model_output: &Tensor,
    sample: &Tensor,
    alpha_bar: f64,
    prediction_type: PredictionType,
) -> Result<(Tensor, Tensor)> {
    let sqrt_a = alpha_bar.sqrt();
    let sqrt_1m_a = (1.0 - alpha_bar).sqrt();
    match prediction_type {
        PredictionType::Epsilon => {
            let x0 = ((sample - (model_output * sqrt_1m_a)?)? / sqrt_a)?;
            Ok((x0, model_output.clone()))
        }
        PredictionType::VPrediction => {
            let x0 = ((sample * sqrt_a)? - (model_output * sqrt_1m_a)?)?;
            let eps = ((model_output * sqrt_a)? + (sample * sqrt_1m_a)?)?;
            Ok((x0, eps))
        }
    }
}
