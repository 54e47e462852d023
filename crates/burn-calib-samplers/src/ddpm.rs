//! DDPM reverse sampler on SE(3)
//!
//! Starting from a pose drawn from an isotropic tangent-space Gaussian at
//! step T, each reverse step recovers a clean-pose estimate from the
//! denoiser and moves to step t-1:
//!
//! ```text
//! x̂₀      = to_sample(model(pose_t, ctx, t))
//! x_{t-1} = γ0[t] · x̂₀ + γ1[t] · log(pose_t) + sqrt(γ2[t]) · z
//! pose_{t-1} = exp(x_{t-1})
//! ```
//!
//! At t = 1 the clean estimate is returned as is, with no added noise.

use burn::prelude::*;
use burn::tensor::Distribution;
use burn_calib_core::{Conditioning, DiffusionError, Pose, Result, TANGENT_DIM};
use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::denoiser::Denoiser;
use crate::scheduler::{NoiseSchedule, PredictionType, timestep_tensor, to_sample};

/// Configuration for the reverse sampler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SamplerConfig {
    /// What the denoiser predicts
    #[serde(default)]
    pub prediction: PredictionType,
    /// Scan every step for non-finite batch elements and log them
    #[serde(default)]
    pub check_finite: bool,
}

/// Result of a sampling run
#[derive(Debug, Clone)]
pub enum SampleOutput<B: Backend> {
    /// Terminal pose only
    Final(Pose<B>),
    /// Initial noisy pose followed by every reverse state, in decreasing
    /// timestep order (T + 1 entries)
    Trajectory(Vec<Pose<B>>),
}

impl<B: Backend> SampleOutput<B> {
    /// Terminal pose of the run
    pub fn final_pose(&self) -> &Pose<B> {
        match self {
            Self::Final(pose) => pose,
            Self::Trajectory(poses) => &poses[poses.len() - 1],
        }
    }

    /// Take the terminal pose, dropping any intermediate states
    pub fn into_final(self) -> Pose<B> {
        match self {
            Self::Final(pose) => pose,
            Self::Trajectory(mut poses) => poses.swap_remove(poses.len() - 1),
        }
    }

    /// Every state held by the output
    pub fn poses(&self) -> &[Pose<B>] {
        match self {
            Self::Final(pose) => std::slice::from_ref(pose),
            Self::Trajectory(poses) => poses,
        }
    }

    /// Tangent vectors of every state, `[N, K, 6]`
    pub fn stacked_tangents(&self) -> Tensor<B, 3> {
        Tensor::stack(self.poses().iter().map(Pose::log).collect(), 1)
    }

    /// Tangent vectors of every state applied after `initial_extrinsic`,
    /// `[N, K, 6]`
    ///
    /// Each state is a correction; this is `log(state ∘ initial_extrinsic)`,
    /// the calibrated extrinsic at every step of the run.
    pub fn stacked_extrinsic_tangents(&self, initial_extrinsic: &Pose<B>) -> Result<Tensor<B, 3>> {
        let tangents = self
            .poses()
            .iter()
            .map(|state| Ok(state.compose(initial_extrinsic)?.log()))
            .collect::<Result<Vec<_>>>()?;
        Ok(Tensor::stack(tangents, 1))
    }
}

/// Ancestral DDPM sampler over a fixed schedule
#[derive(Debug, Clone, Copy)]
pub struct ReverseSampler<'a> {
    schedule: &'a NoiseSchedule,
    config: SamplerConfig,
}

impl<'a> ReverseSampler<'a> {
    /// Sampler over `schedule`
    pub fn new(schedule: &'a NoiseSchedule, config: SamplerConfig) -> Self {
        Self { schedule, config }
    }

    /// Schedule the sampler walks backwards through
    pub fn schedule(&self) -> &NoiseSchedule {
        self.schedule
    }

    /// Prediction type and finite-check setting
    pub fn config(&self) -> SamplerConfig {
        self.config
    }

    /// Draw the step-T pose from N(0, I₆) in the tangent space
    pub fn init_pose<B: Backend>(&self, batch_size: usize, device: &B::Device) -> Result<Pose<B>> {
        Pose::exp(Tensor::random(
            [batch_size, TANGENT_DIM],
            Distribution::Normal(0.0, 1.0),
            device,
        ))
    }

    /// One reverse step from `t` to `t - 1`
    pub fn step<B, C, M>(&self, model: &M, pose: &Pose<B>, context: &C, t: usize) -> Result<Pose<B>>
    where
        B: Backend,
        C: Conditioning<B>,
        M: Denoiser<B, C>,
    {
        self.schedule.check_timestep(t)?;
        let n = pose.batch_size();
        let device = pose.device();

        let output = model.denoise(pose, context, timestep_tensor(&vec![t; n], &device));
        let dims = output.dims();
        if dims != [n, TANGENT_DIM] {
            return Err(DiffusionError::shape("denoiser output", [n, TANGENT_DIM], dims));
        }

        let current = pose.log();
        let pred_original = to_sample(
            output,
            current.clone(),
            self.schedule.alpha_bar(t),
            self.config.prediction,
        );

        if t == 1 {
            return Ok(Pose::exp(pred_original)?.detach());
        }

        let (gamma0, gamma1, gamma2) = self.schedule.posterior_coefficients(t);
        let mean = pred_original.mul_scalar(gamma0) + current.mul_scalar(gamma1);
        let noise = Tensor::random([n, TANGENT_DIM], Distribution::Normal(0.0, 1.0), &device);
        Ok(Pose::exp(mean + noise.mul_scalar(gamma2.sqrt()))?.detach())
    }

    /// Sample from a fresh Gaussian start
    pub fn sample<B, C, M>(
        &self,
        model: &M,
        context: &C,
        return_intermediate: bool,
    ) -> Result<SampleOutput<B>>
    where
        B: Backend,
        C: Conditioning<B>,
        M: Denoiser<B, C>,
    {
        let initial = self.init_pose(context.batch_size(), &context.device())?;
        self.sample_from(model, context, initial, return_intermediate)
    }

    /// Sample starting from a caller-provided step-T pose
    pub fn sample_from<B, C, M>(
        &self,
        model: &M,
        context: &C,
        initial: Pose<B>,
        return_intermediate: bool,
    ) -> Result<SampleOutput<B>>
    where
        B: Backend,
        C: Conditioning<B>,
        M: Denoiser<B, C>,
    {
        let n = initial.batch_size();
        if context.batch_size() != n {
            return Err(DiffusionError::shape(
                "conditioning context",
                [n],
                [context.batch_size()],
            ));
        }

        let mut pose = initial.detach();
        let mut trajectory = Vec::new();
        let mut reported = vec![false; n];

        for t in self.schedule.reverse_timesteps() {
            debug!("reverse step t={t}, batch={n}");
            let next = self.step(model, &pose, context, t)?;
            if self.config.check_finite {
                self.report_non_finite(&next, t, &mut reported);
            }
            if return_intermediate {
                trajectory.push(pose);
            }
            pose = next;
        }

        if return_intermediate {
            trajectory.push(pose);
            Ok(SampleOutput::Trajectory(trajectory))
        } else {
            Ok(SampleOutput::Final(pose))
        }
    }

    fn report_non_finite<B: Backend>(&self, pose: &Pose<B>, t: usize, reported: &mut [bool]) {
        let fresh: Vec<usize> = pose
            .non_finite_rows()
            .into_iter()
            .filter(|&i| !reported[i])
            .collect();
        if fresh.is_empty() {
            return;
        }
        warn!("non-finite pose after reverse step t={t} in batch elements {fresh:?}");
        for i in fresh {
            reported[i] = true;
        }
    }
}
