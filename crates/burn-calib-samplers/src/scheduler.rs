//! Variance schedules for SE(3) diffusion
//!
//! This module provides the noise schedule shared by forward noising and
//! reverse sampling, plus the prediction-type conversions between a noise
//! estimate and a clean-pose estimate.

use burn::prelude::*;
use burn_calib_core::{DiffusionError, Result};
use log::debug;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Upper clamp on a single step's beta
pub const MAX_BETA: f64 = 0.999;

// ============================================================================
// Prediction Type (epsilon vs clean pose)
// ============================================================================

/// Quantity the denoiser is trained to predict, in tangent space
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PredictionType {
    /// Model predicts the noise added to the clean pose's tangent vector
    #[default]
    Epsilon,
    /// Model predicts the clean pose's tangent vector directly
    Sample,
}

/// Convert a noise prediction to the implied clean tangent
///
/// x0 = (x_t - sqrt(1 - ᾱ_t) * ε) / sqrt(ᾱ_t)
pub fn epsilon_to_sample<B: Backend>(
    epsilon: Tensor<B, 2>,
    sample: Tensor<B, 2>,
    alpha_bar: f64,
) -> Tensor<B, 2> {
    (sample - epsilon.mul_scalar((1.0 - alpha_bar).sqrt())).div_scalar(alpha_bar.sqrt())
}

/// Convert a clean tangent prediction to the implied noise
///
/// ε = (x_t - sqrt(ᾱ_t) * x0) / sqrt(1 - ᾱ_t)
pub fn sample_to_epsilon<B: Backend>(
    pred_original: Tensor<B, 2>,
    sample: Tensor<B, 2>,
    alpha_bar: f64,
) -> Tensor<B, 2> {
    (sample - pred_original.mul_scalar(alpha_bar.sqrt())).div_scalar((1.0 - alpha_bar).sqrt())
}

/// Convert any prediction type to a clean tangent estimate
pub fn to_sample<B: Backend>(
    model_output: Tensor<B, 2>,
    sample: Tensor<B, 2>,
    alpha_bar: f64,
    prediction_type: PredictionType,
) -> Tensor<B, 2> {
    match prediction_type {
        PredictionType::Epsilon => epsilon_to_sample(model_output, sample, alpha_bar),
        PredictionType::Sample => model_output,
    }
}

/// Convert any prediction type to a noise estimate
pub fn to_epsilon<B: Backend>(
    model_output: Tensor<B, 2>,
    sample: Tensor<B, 2>,
    alpha_bar: f64,
    prediction_type: PredictionType,
) -> Tensor<B, 2> {
    match prediction_type {
        PredictionType::Epsilon => model_output,
        PredictionType::Sample => sample_to_epsilon(model_output, sample, alpha_bar),
    }
}

// ============================================================================
// Schedule Configuration
// ============================================================================

fn default_beta_1() -> f64 {
    1e-4
}

fn default_beta_t() -> f64 {
    0.02
}

fn default_cosine_offset() -> f64 {
    0.008
}

/// Noise schedule configuration
///
/// Field names follow the experiment configuration files (`beta_T`, `S`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleConfig {
    /// Number of diffusion steps T
    pub n_diff_steps: usize,
    /// `"linear"` or `"cosine"`
    pub schedule_type: String,
    /// First beta of the linear schedule
    #[serde(default = "default_beta_1")]
    pub beta_1: f64,
    /// Last beta of the linear schedule
    #[serde(rename = "beta_T", default = "default_beta_t")]
    pub beta_t: f64,
    /// Offset of the cosine schedule
    #[serde(rename = "S", default = "default_cosine_offset")]
    pub s: f64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self::linear(1000, default_beta_1(), default_beta_t())
    }
}

impl ScheduleConfig {
    pub fn linear(n_diff_steps: usize, beta_1: f64, beta_t: f64) -> Self {
        Self {
            n_diff_steps,
            schedule_type: "linear".to_string(),
            beta_1,
            beta_t,
            s: default_cosine_offset(),
        }
    }

    pub fn cosine(n_diff_steps: usize) -> Self {
        Self {
            n_diff_steps,
            schedule_type: "cosine".to_string(),
            beta_1: default_beta_1(),
            beta_t: default_beta_t(),
            s: default_cosine_offset(),
        }
    }

    /// Set the cosine offset
    pub fn with_offset(mut self, s: f64) -> Self {
        self.s = s;
        self
    }
}

/// Resolved schedule family with its parameters
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScheduleFamily {
    /// Betas on a grid of `T + 1` evenly spaced values from `beta_1` to
    /// `beta_t`; step `t` takes grid point `t - 1`
    Linear { beta_1: f64, beta_t: f64 },
    /// Betas from a squared-cosine ᾱ curve with offset `s`
    Cosine { s: f64 },
}

impl ScheduleFamily {
    /// Resolve and validate the family named by a config
    pub fn from_config(config: &ScheduleConfig) -> Result<Self> {
        match config.schedule_type.as_str() {
            "linear" => {
                let (beta_1, beta_t) = (config.beta_1, config.beta_t);
                for (name, value) in [("beta_1", beta_1), ("beta_T", beta_t)] {
                    if !(value > 0.0 && value <= MAX_BETA) {
                        return Err(DiffusionError::BetaOutOfRange { name, value });
                    }
                }
                if beta_1 > beta_t {
                    return Err(DiffusionError::InvalidBetaOrder { beta_1, beta_t });
                }
                Ok(Self::Linear { beta_1, beta_t })
            }
            "cosine" => {
                if !(config.s.is_finite() && config.s >= 0.0) {
                    return Err(DiffusionError::InvalidCosineOffset(config.s));
                }
                Ok(Self::Cosine { s: config.s })
            }
            other => Err(DiffusionError::UnknownScheduleFamily(other.to_string())),
        }
    }

    /// Betas for steps 1..=T
    fn betas(&self, num_steps: usize) -> Vec<f64> {
        match *self {
            // First T points of linspace(beta_1, beta_T, T + 1)
            Self::Linear { beta_1, beta_t } => {
                let delta = (beta_t - beta_1) / num_steps as f64;
                (0..num_steps).map(|i| beta_1 + delta * i as f64).collect()
            }
            Self::Cosine { s } => {
                let t_max = num_steps as f64;
                let f = |t: usize| {
                    ((t as f64 / t_max + s) / (1.0 + s) * std::f64::consts::FRAC_PI_2)
                        .cos()
                        .powi(2)
                };
                let f0 = f(0);
                let alpha_bars: Vec<f64> = (0..=num_steps).map(|t| f(t) / f0).collect();
                alpha_bars
                    .windows(2)
                    .map(|w| (1.0 - w[1] / w[0]).clamp(0.0, MAX_BETA))
                    .collect()
            }
        }
    }
}

// ============================================================================
// Noise Schedule
// ============================================================================

/// Precomputed, immutable diffusion schedule
///
/// Every array has `T + 1` entries indexed by diffusion step; index 0 is a
/// padding entry (β = 0, ᾱ = 1) so step `t` reads index `t`. The reverse
/// coefficients γ are zero at steps 0 and 1, where they are unused.
#[derive(Debug, Clone)]
pub struct NoiseSchedule {
    family: ScheduleFamily,
    betas: Vec<f64>,
    alphas: Vec<f64>,
    alpha_bars: Vec<f64>,
    gamma0: Vec<f64>,
    gamma1: Vec<f64>,
    gamma2: Vec<f64>,
}

impl NoiseSchedule {
    /// Build the schedule described by `config`
    pub fn new(config: &ScheduleConfig) -> Result<Self> {
        if config.n_diff_steps == 0 {
            return Err(DiffusionError::InvalidStepCount(config.n_diff_steps));
        }
        let family = ScheduleFamily::from_config(config)?;
        Ok(Self::from_family(family, config.n_diff_steps))
    }

    fn from_family(family: ScheduleFamily, num_steps: usize) -> Self {
        let betas: Vec<f64> = std::iter::once(0.0)
            .chain(family.betas(num_steps))
            .collect();
        let alphas: Vec<f64> = betas.iter().map(|b| 1.0 - b).collect();

        // Cumulative product, accumulated in log space
        let alpha_bars: Vec<f64> = alphas
            .iter()
            .scan(0.0f64, |acc, a| {
                *acc += a.ln();
                Some(acc.exp())
            })
            .collect();

        let mut gamma0 = vec![0.0; num_steps + 1];
        let mut gamma1 = vec![0.0; num_steps + 1];
        let mut gamma2 = vec![0.0; num_steps + 1];
        for t in 2..=num_steps {
            let denom = 1.0 - alpha_bars[t];
            gamma0[t] = betas[t] * alpha_bars[t - 1].sqrt() / denom;
            gamma1[t] = (1.0 - alpha_bars[t - 1]) * alphas[t].sqrt() / denom;
            gamma2[t] = (1.0 - alpha_bars[t - 1]) * betas[t] / denom;
        }

        debug!(
            "noise schedule {:?}: T={}, alpha_bar[T]={:.3e}",
            family, num_steps, alpha_bars[num_steps]
        );

        Self {
            family,
            betas,
            alphas,
            alpha_bars,
            gamma0,
            gamma1,
            gamma2,
        }
    }

    /// Number of diffusion steps T
    pub fn num_steps(&self) -> usize {
        self.betas.len() - 1
    }

    /// Schedule family and its parameters
    pub fn family(&self) -> ScheduleFamily {
        self.family
    }

    /// β per step, `T + 1` entries
    pub fn betas(&self) -> &[f64] {
        &self.betas
    }

    /// α = 1 - β per step
    pub fn alphas(&self) -> &[f64] {
        &self.alphas
    }

    /// Cumulative ᾱ per step
    pub fn alpha_bars(&self) -> &[f64] {
        &self.alpha_bars
    }

    /// Weight of the clean-pose estimate in the posterior mean
    pub fn gamma0(&self) -> &[f64] {
        &self.gamma0
    }

    /// Weight of the current pose in the posterior mean
    pub fn gamma1(&self) -> &[f64] {
        &self.gamma1
    }

    /// Posterior variance per step
    pub fn gamma2(&self) -> &[f64] {
        &self.gamma2
    }

    /// ᾱ at step `t`
    pub fn alpha_bar(&self, t: usize) -> f64 {
        self.alpha_bars[t]
    }

    /// Reverse-step coefficients `(γ0, γ1, γ2)` at step `t`
    pub fn posterior_coefficients(&self, t: usize) -> (f64, f64, f64) {
        (self.gamma0[t], self.gamma1[t], self.gamma2[t])
    }

    /// Reject timesteps outside `[1, T]`
    pub fn check_timestep(&self, t: usize) -> Result<()> {
        if t == 0 || t > self.num_steps() {
            return Err(DiffusionError::TimestepOutOfRange {
                timestep: t,
                num_steps: self.num_steps(),
            });
        }
        Ok(())
    }

    /// Draw `batch_size` training timesteps uniformly from `[1, T]`
    pub fn sample_timestep<R: Rng + ?Sized>(&self, batch_size: usize, rng: &mut R) -> Vec<usize> {
        (0..batch_size)
            .map(|_| rng.random_range(1..=self.num_steps()))
            .collect()
    }

    /// Reverse-process order: T, T-1, ..., 1
    pub fn reverse_timesteps(&self) -> Vec<usize> {
        (1..=self.num_steps()).rev().collect()
    }
}

/// Batch of timesteps as the `Int` tensor handed to a denoiser
pub fn timestep_tensor<B: Backend>(timesteps: &[usize], device: &B::Device) -> Tensor<B, 1, Int> {
    let values: Vec<i64> = timesteps.iter().map(|&t| t as i64).collect();
    Tensor::from_data(TensorData::new(values, [timesteps.len()]), device)
}

/// `[N, 1]` column of per-element coefficients
pub(crate) fn coefficient_column<B: Backend>(
    values: impl IntoIterator<Item = f64>,
    device: &B::Device,
) -> Tensor<B, 2> {
    let values: Vec<f32> = values.into_iter().map(|v| v as f32).collect();
    let n = values.len();
    Tensor::<B, 1>::from_floats(values.as_slice(), device).reshape([n, 1])
}
