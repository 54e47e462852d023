//! Training losses over `[N, 6]` tangent predictions

use burn::nn::loss::{MseLoss as BurnMseLoss, Reduction};
use burn::prelude::*;
use serde::{Deserialize, Serialize};

/// Scalar loss between a prediction and its target
pub trait PoseLoss<B: Backend> {
    fn loss(&self, predicted: Tensor<B, 2>, target: Tensor<B, 2>) -> Tensor<B, 1>;
}

impl<B, F> PoseLoss<B> for F
where
    B: Backend,
    F: Fn(Tensor<B, 2>, Tensor<B, 2>) -> Tensor<B, 1>,
{
    fn loss(&self, predicted: Tensor<B, 2>, target: Tensor<B, 2>) -> Tensor<B, 1> {
        self(predicted, target)
    }
}

/// Mean squared error
#[derive(Debug, Clone, Copy, Default)]
pub struct MseLoss;

impl<B: Backend> PoseLoss<B> for MseLoss {
    fn loss(&self, predicted: Tensor<B, 2>, target: Tensor<B, 2>) -> Tensor<B, 1> {
        BurnMseLoss::new().forward(predicted, target, Reduction::Mean)
    }
}

/// Mean absolute error
#[derive(Debug, Clone, Copy, Default)]
pub struct L1Loss;

impl<B: Backend> PoseLoss<B> for L1Loss {
    fn loss(&self, predicted: Tensor<B, 2>, target: Tensor<B, 2>) -> Tensor<B, 1> {
        (predicted - target).abs().mean()
    }
}

/// Inner loss applied separately to the rotation and translation blocks
#[derive(Debug, Clone, Copy)]
pub struct WeightedPoseLoss<L> {
    /// Loss applied to each tangent half
    pub inner: L,
    /// Weights of the rotation and translation halves
    pub rotation_weight: f64,
    pub translation_weight: f64,
}

impl<L> WeightedPoseLoss<L> {
    pub fn new(inner: L, rotation_weight: f64, translation_weight: f64) -> Self {
        Self {
            inner,
            rotation_weight,
            translation_weight,
        }
    }
}

impl<B: Backend, L: PoseLoss<B>> PoseLoss<B> for WeightedPoseLoss<L> {
    fn loss(&self, predicted: Tensor<B, 2>, target: Tensor<B, 2>) -> Tensor<B, 1> {
        let [n, _] = predicted.dims();
        let rotation = self.inner.loss(
            predicted.clone().slice([0..n, 0..3]),
            target.clone().slice([0..n, 0..3]),
        );
        let translation = self
            .inner
            .loss(predicted.slice([0..n, 3..6]), target.slice([0..n, 3..6]));
        rotation.mul_scalar(self.rotation_weight) + translation.mul_scalar(self.translation_weight)
    }
}

/// Base loss selectable from configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LossKind {
    #[default]
    Mse,
    L1,
}

impl<B: Backend> PoseLoss<B> for LossKind {
    fn loss(&self, predicted: Tensor<B, 2>, target: Tensor<B, 2>) -> Tensor<B, 1> {
        match self {
            Self::Mse => MseLoss.loss(predicted, target),
            Self::L1 => L1Loss.loss(predicted, target),
        }
    }
}

fn default_weight() -> f64 {
    1.0
}

/// Loss configuration
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LossConfig {
    #[serde(default)]
    /// Per-element loss
    pub kind: LossKind,
    #[serde(default = "default_weight")]
    pub rotation_weight: f64,
    #[serde(default = "default_weight")]
    pub translation_weight: f64,
}

impl Default for LossConfig {
    fn default() -> Self {
        Self {
            kind: LossKind::Mse,
            rotation_weight: 1.0,
            translation_weight: 1.0,
        }
    }
}

impl LossConfig {
    /// Build the configured loss
    pub fn init(&self) -> WeightedPoseLoss<LossKind> {
        WeightedPoseLoss::new(self.kind, self.rotation_weight, self.translation_weight)
    }
}
