//! Denoiser interface consumed by the samplers

use burn::prelude::*;
use burn_calib_core::{Conditioning, Pose};

/// A model mapping noisy poses to a tangent-space prediction
///
/// `timesteps` holds one diffusion step per batch element. The returned
/// `[N, 6]` tensor is either a noise estimate or a clean tangent estimate,
/// depending on the [`PredictionType`](crate::PredictionType) the caller
/// configures.
pub trait Denoiser<B: Backend, C: Conditioning<B>> {
    fn denoise(&self, pose: &Pose<B>, context: &C, timesteps: Tensor<B, 1, Int>) -> Tensor<B, 2>;
}

impl<B, C, F> Denoiser<B, C> for F
where
    B: Backend,
    C: Conditioning<B>,
    F: Fn(&Pose<B>, &C, Tensor<B, 1, Int>) -> Tensor<B, 2>,
{
    fn denoise(&self, pose: &Pose<B>, context: &C, timesteps: Tensor<B, 1, Int>) -> Tensor<B, 2> {
        self(pose, context, timesteps)
    }
}
