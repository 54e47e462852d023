//! Diffusion orchestration for extrinsic calibration
//!
//! A [`Diffuser`] owns a denoiser, a training loss and two schedules: one
//! for the training loss (usually long) and one for sampling (usually much
//! shorter, for faster inference).

use std::time::Instant;

use burn::prelude::*;
use burn_calib_core::{CalibrationContext, Conditioning, DiffusionError, Pose, Result, TANGENT_DIM};
use burn_calib_samplers::{
    Denoiser, ForwardNoiser, NoiseSchedule, PredictionType, ReverseSampler, SampleOutput,
    SamplerConfig, ScheduleConfig, timestep_tensor,
};
use log::{debug, info};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::loss::PoseLoss;
use crate::metrics::{CalibrationMetrics, se3_error};

/// Diffuser configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiffuserConfig {
    /// Schedule used by the training loss
    pub train: ScheduleConfig,
    /// Schedule used for sampling
    #[serde(alias = "val")]
    pub eval: ScheduleConfig,
    #[serde(default)]
    /// What the denoiser predicts
    pub prediction: PredictionType,
    /// Log non-finite batch elements after every reverse step
    #[serde(default)]
    pub check_finite: bool,
}

impl Default for DiffuserConfig {
    fn default() -> Self {
        Self {
            train: ScheduleConfig::default(),
            eval: ScheduleConfig::linear(10, 1e-4, 0.02),
            prediction: PredictionType::Epsilon,
            check_finite: false,
        }
    }
}

/// SE(3) diffusion model around a denoiser `M` trained with loss `L`
#[derive(Debug, Clone)]
pub struct Diffuser<M, L> {
    model: M,
    loss: L,
    train_schedule: NoiseSchedule,
    eval_schedule: NoiseSchedule,
    sampler_config: SamplerConfig,
}

impl<M, L> Diffuser<M, L> {
    /// Build both schedules; fails on an invalid schedule configuration
    pub fn new(model: M, loss: L, config: &DiffuserConfig) -> Result<Self> {
        let train_schedule = NoiseSchedule::new(&config.train)?;
        let eval_schedule = NoiseSchedule::new(&config.eval)?;
        info!(
            "diffuser: train {} steps ({}), eval {} steps ({}), predicting {:?}",
            train_schedule.num_steps(),
            config.train.schedule_type,
            eval_schedule.num_steps(),
            config.eval.schedule_type,
            config.prediction
        );
        Ok(Self {
            model,
            loss,
            train_schedule,
            eval_schedule,
            sampler_config: SamplerConfig {
                prediction: config.prediction,
                check_finite: config.check_finite,
            },
        })
    }

    /// The wrapped denoiser
    pub fn model(&self) -> &M {
        &self.model
    }

    /// Mutable access to the denoiser, e.g. for an optimizer step
    pub fn model_mut(&mut self) -> &mut M {
        &mut self.model
    }

    /// Take the denoiser back
    pub fn into_model(self) -> M {
        self.model
    }

    /// Schedule the training loss noises with
    pub fn train_schedule(&self) -> &NoiseSchedule {
        &self.train_schedule
    }

    /// Schedule sampling runs over
    pub fn eval_schedule(&self) -> &NoiseSchedule {
        &self.eval_schedule
    }

    /// What the denoiser is trained to predict
    pub fn prediction(&self) -> PredictionType {
        self.sampler_config.prediction
    }

    /// Reverse sampler over the eval schedule
    pub fn sampler(&self) -> ReverseSampler<'_> {
        ReverseSampler::new(&self.eval_schedule, self.sampler_config)
    }

    /// Denoising loss at one random training timestep per batch element
    ///
    /// The target is the drawn noise for an epsilon-predicting model and the
    /// clean tangent for a sample-predicting one. Gradients flow through the
    /// model output.
    pub fn compute_training_loss<B, C, R>(
        &self,
        clean: &Pose<B>,
        context: &C,
        rng: &mut R,
    ) -> Result<Tensor<B, 1>>
    where
        B: Backend,
        C: Conditioning<B>,
        M: Denoiser<B, C>,
        L: PoseLoss<B>,
        R: Rng + ?Sized,
    {
        let n = clean.batch_size();
        if context.batch_size() != n {
            return Err(DiffusionError::shape(
                "conditioning context",
                [n],
                [context.batch_size()],
            ));
        }

        let timesteps = self.train_schedule.sample_timestep(n, rng);
        let (noisy, noise) = ForwardNoiser::new(&self.train_schedule).add_noise(clean, &timesteps)?;
        debug!("training loss at timesteps {timesteps:?}");

        let predicted = self
            .model
            .denoise(&noisy, context, timestep_tensor(&timesteps, &clean.device()));
        let dims = predicted.dims();
        if dims != [n, TANGENT_DIM] {
            return Err(DiffusionError::shape("denoiser output", [n, TANGENT_DIM], dims));
        }

        let target = match self.sampler_config.prediction {
            PredictionType::Epsilon => noise,
            PredictionType::Sample => clean.log(),
        };
        Ok(self.loss.loss(predicted, target))
    }

    /// Run the reverse process with the eval schedule
    pub fn sample<B, C>(&self, context: &C, return_intermediate: bool) -> Result<SampleOutput<B>>
    where
        B: Backend,
        C: Conditioning<B>,
        M: Denoiser<B, C>,
    {
        self.sampler().sample(&self.model, context, return_intermediate)
    }

    /// Calibrated extrinsic: the sampled correction applied after the
    /// context's initial extrinsic
    pub fn estimate_extrinsic<B>(&self, context: &CalibrationContext<B>) -> Result<Pose<B>>
    where
        B: Backend,
        M: Denoiser<B, CalibrationContext<B>>,
    {
        let correction = self.sample(context, false)?.into_final();
        correction.compose(&context.initial_extrinsic)
    }

    /// Sample one evaluation batch and accumulate its errors against the
    /// ground-truth correction
    ///
    /// Returns the full trajectory so callers can export it.
    pub fn evaluate_batch<B, C>(
        &self,
        context: &C,
        gt: &Pose<B>,
        metrics: &mut CalibrationMetrics,
    ) -> Result<SampleOutput<B>>
    where
        B: Backend,
        C: Conditioning<B>,
        M: Denoiser<B, C>,
    {
        let start = Instant::now();
        let output = self.sample(context, true)?;
        let elapsed = start.elapsed();

        let (rotation_err, translation_err) = se3_error(output.final_pose(), gt)?;
        metrics.update(rotation_err, translation_err, elapsed);
        Ok(output)
    }
}
