//! Scheduler tests
//!
//! Covers:
//! - DDIM timestep placement and stride for the video model
//! - DDIM sampling along an exact noise oracle
//! - DPM-Solver++ timestep spacing
//! - DPM-Solver++ convergence with an exact data oracle (v-prediction)
//! - Error handling when stepping past the schedule

use candle_core::{Device, Result, Tensor};
use candle_ti2v::schedulers::{
    BetaSchedule, DdimScheduler, DdimSchedulerConfig, DpmSolverConfig,
    DpmSolverMultistepScheduler, alphas_cumprod,
};
use candle_ti2v::utils::Pcg32;

fn max_abs_diff(a: &Tensor, b: &Tensor) -> Result<f32> {
    (a - b)?.abs()?.flatten_all()?.max(0)?.to_scalar::<f32>()
}

// ============================================================================
// DDIM
// ============================================================================

#[test]
fn test_ddim_timesteps_fifty_steps() {
    let scheduler = DdimScheduler::new(DdimSchedulerConfig::default(), 50);
    let timesteps = scheduler.timesteps();

    assert_eq!(timesteps.len(), 50);
    assert_eq!(scheduler.stride(), 20);
    assert_eq!(timesteps[0], 981);
    assert_eq!(timesteps[49], 1);
    for w in timesteps.windows(2) {
        assert_eq!(w[0] - w[1], 20);
    }
}

#[test]
fn test_ddim_single_step_schedule() {
    let scheduler = DdimScheduler::new(DdimSchedulerConfig::default(), 1);
    assert_eq!(scheduler.timesteps(), &[1]);
    assert_eq!(scheduler.prev_timestep(1), 0);
}

#[test]
fn test_ddim_follows_noise_oracle_to_the_clean_end() -> Result<()> {
    let device = Device::Cpu;
    let scheduler = DdimScheduler::new(DdimSchedulerConfig::default(), 10);
    let mut rng = Pcg32::from_seed(3);
    let x0 = rng.randn((1, 4, 2, 4, 4), &device)?;
    let eps = rng.randn((1, 4, 2, 4, 4), &device)?;

    let mut sample = scheduler.add_noise(&x0, &eps, scheduler.timesteps()[0])?;
    for &t in scheduler.timesteps() {
        // Exact epsilon for the current sample
        let a = scheduler.alpha_bar(t);
        let oracle = ((&sample - (&x0 * a.sqrt())?)? / (1.0 - a).sqrt())?;
        sample = scheduler.step(&oracle, t, &sample)?.prev_sample;
    }

    // Deterministic DDIM stays on the trajectory and ends at t = 0
    let expected = scheduler.add_noise(&x0, &eps, 0)?;
    let err = max_abs_diff(&sample, &expected)?;
    assert!(err < 1e-3, "final sample error {err}");
    Ok(())
}

#[test]
fn test_ddim_renoise_matches_add_noise_statistics() -> Result<()> {
    let device = Device::Cpu;
    let scheduler = DdimScheduler::new(DdimSchedulerConfig::default(), 10);
    let mut rng = Pcg32::from_seed(9);
    let x0 = Tensor::zeros((8, 64, 64), candle_core::DType::F32, &device)?;

    let x_low = scheduler.add_noise(&x0, &rng.randn_like(&x0)?, 401)?;
    let x_high = scheduler.renoise(&x_low, 401, 501, &rng.randn_like(&x0)?)?;

    let v: Vec<f32> = x_high.flatten_all()?.to_vec1()?;
    let var = v.iter().map(|x| x * x).sum::<f32>() / v.len() as f32;
    let expected = 1.0 - scheduler.alpha_bar(501) as f32;
    assert!((var - expected).abs() < 0.02, "var={var} expected={expected}");
    Ok(())
}

// ============================================================================
// DPM-Solver++
// ============================================================================

#[test]
fn test_dpm_timesteps_linspace() {
    let scheduler = DpmSolverMultistepScheduler::new(DpmSolverConfig::default(), 50);
    let timesteps = scheduler.timesteps();

    assert_eq!(timesteps.len(), 50);
    assert_eq!(timesteps[0], 999);
    assert_eq!(timesteps[49], 20);
    for w in timesteps.windows(2) {
        assert!(w[0] > w[1]);
    }
    assert_eq!(scheduler.init_noise_sigma(), 1.0);
}

#[test]
fn test_dpm_converges_with_exact_data_oracle() -> Result<()> {
    let device = Device::Cpu;
    let config = DpmSolverConfig::default();
    let alphas = alphas_cumprod(
        config.num_train_timesteps,
        config.beta_start,
        config.beta_end,
        BetaSchedule::ScaledLinear,
    );
    let mut scheduler = DpmSolverMultistepScheduler::new(config, 20);
    let timesteps = scheduler.timesteps().to_vec();

    let mut rng = Pcg32::from_seed(21);
    let x0 = (rng.randn((1, 4, 8, 8), &device)? * 0.5)?;
    let mut sample = rng.randn((1, 4, 8, 8), &device)?;

    for &t in &timesteps {
        // v such that alpha * x - sigma * v == x0
        let a = alphas[t];
        let (alpha, sigma) = (a.sqrt(), (1.0 - a).sqrt());
        let v = (((&sample * alpha)? - &x0)? / sigma)?;
        sample = scheduler.step(&v, &sample)?;
    }

    let err = max_abs_diff(&sample, &x0)?;
    assert!(err < 1e-3, "final sample error {err}");
    Ok(())
}

#[test]
fn test_dpm_first_order_matches_second_order_on_constant_prediction() -> Result<()> {
    let device = Device::Cpu;
    let first = DpmSolverConfig {
        solver_order: 1,
        ..Default::default()
    };
    let mut a = DpmSolverMultistepScheduler::new(first, 5);
    let mut b = DpmSolverMultistepScheduler::new(DpmSolverConfig::default(), 5);
    let alphas = alphas_cumprod(1000, 0.00085, 0.012, BetaSchedule::ScaledLinear);

    let mut rng = Pcg32::from_seed(4);
    let x0 = rng.randn((1, 4, 4, 4), &device)?;
    let start = rng.randn((1, 4, 4, 4), &device)?;
    let (mut sa, mut sb) = (start.clone(), start);

    for t in a.timesteps().to_vec() {
        let alpha_bar = alphas[t];
        let (alpha, sigma) = (alpha_bar.sqrt(), (1.0 - alpha_bar).sqrt());
        let va = (((&sa * alpha)? - &x0)? / sigma)?;
        let vb = (((&sb * alpha)? - &x0)? / sigma)?;
        sa = a.step(&va, &sa)?;
        sb = b.step(&vb, &sb)?;
    }
    // A constant data prediction makes the second-order correction vanish
    assert!(max_abs_diff(&sa, &sb)? < 1e-4);
    Ok(())
}

#[test]
fn test_dpm_step_past_schedule_fails() -> Result<()> {
    let device = Device::Cpu;
    let mut scheduler = DpmSolverMultistepScheduler::new(DpmSolverConfig::default(), 2);
    let sample = Tensor::zeros((1, 4, 2, 2), candle_core::DType::F32, &device)?;
    let output = sample.zeros_like()?;

    scheduler.step(&output, &sample)?;
    scheduler.step(&output, &sample)?;
    assert!(scheduler.step(&output, &sample).is_err());
    Ok(())
}
