//! Calibration error metrics
//!
//! Errors are measured on the relative transform `gt⁻¹ ∘ pred`: its rotation
//! vector (degrees) and translation give per-axis errors, their norms give
//! the per-sample rotation / translation error used by the success rates.

use std::time::Duration;

use burn::prelude::*;
use burn_calib_core::{DiffusionError, Pose, Result};
use log::warn;
use serde::{Deserialize, Serialize};

/// Success thresholds `(degrees, translation)` of the 3d3c rate
pub const THRESHOLD_3D3C: (f64, f64) = (3.0, 0.03);
/// Success thresholds `(degrees, translation)` of the 5d5c rate
pub const THRESHOLD_5D5C: (f64, f64) = (5.0, 0.05);

/// Per-axis rotation error `[N, 3]` (radians) and translation error `[N, 3]`
pub fn se3_error<B: Backend>(pred: &Pose<B>, gt: &Pose<B>) -> Result<(Tensor<B, 2>, Tensor<B, 2>)> {
    let relative = gt.inverse().compose(pred)?;
    let n = relative.batch_size();
    let tangent = relative.log();
    Ok((
        tangent.clone().slice([0..n, 0..3]),
        tangent.slice([0..n, 3..6]),
    ))
}

/// Accumulates batch errors into dataset-level statistics
#[derive(Debug, Clone, Default)]
pub struct CalibrationMetrics {
    rotation_abs: [f64; 3],
    translation_abs: [f64; 3],
    rotation_norm: f64,
    translation_norm: f64,
    success_3d3c: usize,
    success_5d5c: usize,
    samples: usize,
    sampling_time: Duration,
    weighted_batch_time: f64,
    batches: usize,
    valid_batches: usize,
}

/// Dataset-level averages over every valid sample
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSummary {
    /// Mean absolute rotation error per axis, degrees
    pub rotation_deg: [f64; 3],
    /// Mean absolute translation error per axis
    pub translation: [f64; 3],
    /// Mean rotation error norm, degrees
    pub rotation_rmse_deg: f64,
    /// Mean translation error norm
    pub translation_rmse: f64,
    /// Fraction of samples under 3° and 3 cm
    pub success_3d3c: f64,
    /// Fraction of samples under 5° and 5 cm
    pub success_5d5c: f64,
    /// Mean wall time of one sampling batch, seconds, each batch weighted
    /// by its sample count
    pub time_per_batch: f64,
    /// Samples accumulated across valid batches
    pub samples: usize,
    /// Fraction of batches that produced finite errors
    pub valid_ratio: f64,
}

impl CalibrationMetrics {
    /// Empty accumulator
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one batch of errors from [`se3_error`]
    ///
    /// Batches holding a non-finite error are skipped and counted as
    /// invalid. Returns whether the batch was accumulated.
    pub fn update<B: Backend>(
        &mut self,
        rotation_err: Tensor<B, 2>,
        translation_err: Tensor<B, 2>,
        elapsed: Duration,
    ) -> bool {
        self.batches += 1;
        let rotation: Vec<f64> = rotation_err
            .into_data()
            .iter::<f32>()
            .map(|v| (v as f64).to_degrees())
            .collect();
        let translation: Vec<f64> = translation_err
            .into_data()
            .iter::<f32>()
            .map(|v| v as f64)
            .collect();

        if rotation.iter().chain(&translation).any(|v| !v.is_finite()) {
            warn!("non-finite calibration error in batch {}, skipping", self.batches - 1);
            return false;
        }

        let batch_n = rotation.len() / 3;
        for (r, t) in rotation.chunks(3).zip(translation.chunks(3)) {
            for axis in 0..3 {
                self.rotation_abs[axis] += r[axis].abs();
                self.translation_abs[axis] += t[axis].abs();
            }
            let r_norm = r.iter().map(|v| v * v).sum::<f64>().sqrt();
            let t_norm = t.iter().map(|v| v * v).sum::<f64>().sqrt();
            self.rotation_norm += r_norm;
            self.translation_norm += t_norm;
            if r_norm < THRESHOLD_3D3C.0 && t_norm < THRESHOLD_3D3C.1 {
                self.success_3d3c += 1;
            }
            if r_norm < THRESHOLD_5D5C.0 && t_norm < THRESHOLD_5D5C.1 {
                self.success_5d5c += 1;
            }
            self.samples += 1;
        }
        self.sampling_time += elapsed;
        self.weighted_batch_time += elapsed.as_secs_f64() * batch_n as f64;
        self.valid_batches += 1;
        true
    }

    /// Batches seen, valid or not
    pub fn batches(&self) -> usize {
        self.batches
    }

    /// Batches that were accumulated
    pub fn valid_batches(&self) -> usize {
        self.valid_batches
    }

    /// Fraction of batches that produced finite errors
    pub fn valid_ratio(&self) -> f64 {
        if self.batches == 0 {
            0.0
        } else {
            self.valid_batches as f64 / self.batches as f64
        }
    }

    /// Total sampling time over valid batches
    pub fn sampling_time(&self) -> Duration {
        self.sampling_time
    }

    /// Averages over every accumulated sample
    ///
    /// Fails with [`DiffusionError::NoValidBatch`] when nothing was accumulated.
    pub fn summary(&self) -> Result<MetricSummary> {
        if self.samples == 0 {
            return Err(DiffusionError::NoValidBatch);
        }
        let n = self.samples as f64;
        Ok(MetricSummary {
            rotation_deg: self.rotation_abs.map(|v| v / n),
            translation: self.translation_abs.map(|v| v / n),
            rotation_rmse_deg: self.rotation_norm / n,
            translation_rmse: self.translation_norm / n,
            success_3d3c: self.success_3d3c as f64 / n,
            success_5d5c: self.success_5d5c as f64 / n,
            time_per_batch: self.weighted_batch_time / n,
            samples: self.samples,
            valid_ratio: self.valid_ratio(),
        })
    }
}
