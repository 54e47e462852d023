//! Batched SE(3) poses and their tangent-space maps
//!
//! Poses use the decoupled SO(3) × R³ exponential: the rotation block of a
//! tangent vector goes through Rodrigues' formula and the translation block is
//! carried over linearly. Forward noising and reverse sampling both go through
//! [`Pose::exp`] / [`Pose::log`], so they always share the same convention.
//!
//! Tangent batches are `[N, 6]` tensors laid out as
//! `[ω_x, ω_y, ω_z, t_x, t_y, t_z]`.
//!
//! Every operation is row-wise: a non-finite batch element never leaks into
//! its neighbours.

use std::f32::consts::PI;
use std::ops::Range;

use burn::prelude::*;

use crate::error::{DiffusionError, Result};

/// Width of the tangent representation (3 rotation + 3 translation)
pub const TANGENT_DIM: usize = 6;

/// Below this angle the Rodrigues ratios use their Taylor expansions
const SMALL_ANGLE: f32 = 1e-4;

/// Within this distance of π the rotation axis is read from the symmetric part of R
const NEAR_PI: f32 = 1e-3;

/// A batch of rigid transforms
///
/// `rotation` is `[N, 3, 3]`, `translation` is `[N, 3]`. A point `p` maps to
/// `R p + t`.
#[derive(Debug, Clone)]
pub struct Pose<B: Backend> {
    rotation: Tensor<B, 3>,
    translation: Tensor<B, 2>,
}

impl<B: Backend> Pose<B> {
    /// Build a pose batch from its parts
    ///
    /// Only shapes are checked; the caller guarantees `rotation` holds proper
    /// rotations.
    pub fn new(rotation: Tensor<B, 3>, translation: Tensor<B, 2>) -> Result<Self> {
        let [n, rows, cols] = rotation.dims();
        if rows != 3 || cols != 3 {
            return Err(DiffusionError::shape("rotation", [n, 3, 3], [n, rows, cols]));
        }
        let [m, width] = translation.dims();
        if m != n || width != 3 {
            return Err(DiffusionError::shape("translation", [n, 3], [m, width]));
        }
        Ok(Self {
            rotation,
            translation,
        })
    }

    /// `batch_size` identity transforms
    pub fn identity(batch_size: usize, device: &B::Device) -> Self {
        Self {
            rotation: identity_rotations(batch_size, device),
            translation: Tensor::zeros([batch_size, 3], device),
        }
    }

    /// Split a batch of homogeneous `[N, 4, 4]` matrices
    pub fn from_matrix(matrix: Tensor<B, 3>) -> Result<Self> {
        let [n, rows, cols] = matrix.dims();
        if rows != 4 || cols != 4 {
            return Err(DiffusionError::shape(
                "homogeneous matrix",
                [n, 4, 4],
                [n, rows, cols],
            ));
        }
        let rotation = matrix.clone().slice([0..n, 0..3, 0..3]);
        let translation = matrix.slice([0..n, 0..3, 3..4]).reshape([n, 3]);
        Ok(Self {
            rotation,
            translation,
        })
    }

    /// Homogeneous `[N, 4, 4]` form
    pub fn to_matrix(&self) -> Tensor<B, 3> {
        let n = self.batch_size();
        let device = self.device();
        let top = Tensor::cat(
            vec![
                self.rotation.clone(),
                self.translation.clone().reshape([n, 3, 1]),
            ],
            2,
        );
        let bottom: Vec<f32> = (0..n).flat_map(|_| [0.0, 0.0, 0.0, 1.0]).collect();
        let bottom = Tensor::from_data(TensorData::new(bottom, [n, 1, 4]), &device);
        Tensor::cat(vec![top, bottom], 1)
    }

    /// `[N, 3, 3]` rotation matrices
    pub fn rotation(&self) -> &Tensor<B, 3> {
        &self.rotation
    }

    /// `[N, 3]` translations
    pub fn translation(&self) -> &Tensor<B, 2> {
        &self.translation
    }

    /// Take the rotation and translation tensors
    pub fn into_parts(self) -> (Tensor<B, 3>, Tensor<B, 2>) {
        (self.rotation, self.translation)
    }

    /// Number of transforms in the batch
    pub fn batch_size(&self) -> usize {
        self.translation.dims()[0]
    }

    /// Device holding both tensors
    pub fn device(&self) -> B::Device {
        self.translation.device()
    }

    /// Exponential map from `[N, 6]` tangent vectors
    pub fn exp(tangent: Tensor<B, 2>) -> Result<Self> {
        let [n, width] = tangent.dims();
        if width != TANGENT_DIM {
            return Err(DiffusionError::shape("tangent", [n, TANGENT_DIM], [n, width]));
        }
        let omega = tangent.clone().slice([0..n, 0..3]);
        let translation = tangent.slice([0..n, 3..6]);
        Ok(Self {
            rotation: so3_exp(omega),
            translation,
        })
    }

    /// Logarithm map to `[N, 6]` tangent vectors
    ///
    /// Inverse of [`Pose::exp`] for rotation angles below π.
    pub fn log(&self) -> Tensor<B, 2> {
        Tensor::cat(
            vec![so3_log(self.rotation.clone()), self.translation.clone()],
            1,
        )
    }

    /// Group product: applies `other` first, then `self`
    pub fn compose(&self, other: &Self) -> Result<Self> {
        let n = self.batch_size();
        if other.batch_size() != n {
            return Err(DiffusionError::shape(
                "composed pose batch",
                [n],
                [other.batch_size()],
            ));
        }
        let rotation = self.rotation.clone().matmul(other.rotation.clone());
        let translation =
            rotate(self.rotation.clone(), other.translation.clone()) + self.translation.clone();
        Ok(Self {
            rotation,
            translation,
        })
    }

    /// Group inverse, `(Rᵀ, -Rᵀ t)` per element
    pub fn inverse(&self) -> Self {
        let rotation = self.rotation.clone().transpose();
        let translation = rotate(rotation.clone(), self.translation.clone()).neg();
        Self {
            rotation,
            translation,
        }
    }

    /// Apply each transform to its own `[3, P]` point set
    pub fn transform_points(&self, points: Tensor<B, 3>) -> Result<Tensor<B, 3>> {
        let n = self.batch_size();
        let [m, dim, p] = points.dims();
        if m != n || dim != 3 {
            return Err(DiffusionError::shape("point cloud", [n, 3, p], [m, dim, p]));
        }
        Ok(self.rotation.clone().matmul(points) + self.translation.clone().reshape([n, 3, 1]))
    }

    /// Rotation angle of every element, in radians
    pub fn rotation_angle(&self) -> Tensor<B, 1> {
        let n = self.batch_size();
        so3_log(self.rotation.clone())
            .powf_scalar(2.0)
            .sum_dim(1)
            .sqrt()
            .reshape([n])
    }

    /// Sub-batch of the given element range
    pub fn slice_rows(&self, rows: Range<usize>) -> Self {
        Self {
            rotation: self.rotation.clone().slice([rows.clone(), 0..3, 0..3]),
            translation: self.translation.clone().slice([rows, 0..3]),
        }
    }

    /// Concatenate pose batches along the batch axis
    pub fn cat(poses: Vec<Self>) -> Self {
        let (rotations, translations): (Vec<_>, Vec<_>) =
            poses.into_iter().map(Self::into_parts).unzip();
        Self {
            rotation: Tensor::cat(rotations, 0),
            translation: Tensor::cat(translations, 0),
        }
    }

    /// Indices of batch elements holding a NaN or infinite entry
    pub fn non_finite_rows(&self) -> Vec<usize> {
        let rotation: Vec<f32> = self.rotation.clone().into_data().iter::<f32>().collect();
        let translation: Vec<f32> = self.translation.clone().into_data().iter::<f32>().collect();
        (0..self.batch_size())
            .filter(|&i| {
                rotation[9 * i..9 * i + 9]
                    .iter()
                    .chain(&translation[3 * i..3 * i + 3])
                    .any(|v| !v.is_finite())
            })
            .collect()
    }

    /// Drop autodiff history
    pub fn detach(self) -> Self {
        Self {
            rotation: self.rotation.detach(),
            translation: self.translation.detach(),
        }
    }
}

/// Rodrigues' formula for a batch of `[N, 3]` axis-angle vectors
pub fn so3_exp<B: Backend>(omega: Tensor<B, 2>) -> Tensor<B, 3> {
    let [n, _] = omega.dims();
    let device = omega.device();

    let theta_sq = omega.clone().powf_scalar(2.0).sum_dim(1);
    let theta = theta_sq.clone().sqrt();
    let small = theta.clone().lower_elem(SMALL_ANGLE);
    let theta = theta.clamp_min(SMALL_ANGLE);

    // sin(θ)/θ ≈ 1 - θ²/6
    let a = (theta.clone().sin() / theta.clone()).mask_where(
        small.clone(),
        theta_sq.clone().mul_scalar(-1.0 / 6.0).add_scalar(1.0),
    );
    // (1 - cos θ)/θ² ≈ 1/2 - θ²/24
    let b = (theta.clone().cos().neg().add_scalar(1.0) / theta.powf_scalar(2.0)).mask_where(
        small,
        theta_sq.mul_scalar(-1.0 / 24.0).add_scalar(0.5),
    );

    let k = skew(omega);
    let k_sq = k.clone().matmul(k.clone());
    identity_rotations(n, &device) + k * a.reshape([n, 1, 1]) + k_sq * b.reshape([n, 1, 1])
}

/// Axis-angle vectors `[N, 3]` of a batch of rotations
///
/// The angle is recovered host-side as `atan2(sin θ, cos θ)`, which stays
/// accurate at both ends of `[0, π]`. Near π the axis comes from the diagonal
/// of R because `R - Rᵀ` vanishes there.
pub fn so3_log<B: Backend>(rotation: Tensor<B, 3>) -> Tensor<B, 2> {
    let [n, _, _] = rotation.dims();
    let device = rotation.device();

    // vee(R - Rᵀ) = 2 sin(θ) · axis
    let asym = rotation.clone() - rotation.clone().transpose();
    let vee = Tensor::cat(
        vec![entry(&asym, 2, 1), entry(&asym, 0, 2), entry(&asym, 1, 0)],
        1,
    );
    let trace = entry(&rotation, 0, 0) + entry(&rotation, 1, 1) + entry(&rotation, 2, 2);

    let trace: Vec<f32> = trace.into_data().iter::<f32>().collect();
    let vee_host: Vec<f32> = vee.clone().into_data().iter::<f32>().collect();

    let mut factors = Vec::with_capacity(n);
    let mut near_pi = Vec::new();
    for i in 0..n {
        let v = &vee_host[3 * i..3 * i + 3];
        let sin_theta = 0.5 * (v[0] * v[0] + v[1] * v[1] + v[2] * v[2]).sqrt();
        let cos_theta = 0.5 * (trace[i] - 1.0);
        let theta = sin_theta.atan2(cos_theta);

        if theta < SMALL_ANGLE {
            // θ / (2 sin θ) ≈ 1/2 + θ²/12
            factors.push(0.5 + theta * theta / 12.0);
        } else if PI - theta < NEAR_PI {
            factors.push(0.0);
            near_pi.push((i, theta));
        } else {
            factors.push(theta / (2.0 * sin_theta));
        }
    }

    let factors = Tensor::<B, 1>::from_floats(factors.as_slice(), &device).reshape([n, 1]);
    let omega = vee * factors;
    if near_pi.is_empty() {
        return omega;
    }

    let r: Vec<f32> = rotation.into_data().iter::<f32>().collect();
    let mut values = vec![0.0f32; n * 3];
    let mut mask = vec![false; n * 3];
    for (i, theta) in near_pi {
        let axis = axis_near_pi(&r[9 * i..9 * i + 9]);
        for k in 0..3 {
            values[3 * i + k] = axis[k] * theta;
            mask[3 * i + k] = true;
        }
    }
    let values = Tensor::<B, 2>::from_data(TensorData::new(values, [n, 3]), &device);
    let mask = Tensor::<B, 2, Bool>::from_data(TensorData::new(mask, [n, 3]), &device);
    omega.mask_where(mask, values)
}

/// Unit rotation axis of a row-major 3x3 rotation close to a half turn
fn axis_near_pi(r: &[f32]) -> [f32; 3] {
    let xx = ((r[0] + 1.0) * 0.5).max(0.0).sqrt();
    let yy = ((r[4] + 1.0) * 0.5).max(0.0).sqrt();
    let zz = ((r[8] + 1.0) * 0.5).max(0.0).sqrt();
    let skew = [r[7] - r[5], r[2] - r[6], r[3] - r[1]];

    let mut axis = if xx >= yy && xx >= zz && xx > 1e-6 {
        [xx, (r[1] + r[3]) / (4.0 * xx), (r[2] + r[6]) / (4.0 * xx)]
    } else if yy >= zz && yy > 1e-6 {
        [(r[1] + r[3]) / (4.0 * yy), yy, (r[5] + r[7]) / (4.0 * yy)]
    } else if zz > 1e-6 {
        [(r[2] + r[6]) / (4.0 * zz), (r[5] + r[7]) / (4.0 * zz), zz]
    } else {
        skew
    };

    let norm = (axis[0] * axis[0] + axis[1] * axis[1] + axis[2] * axis[2]).sqrt();
    axis = if norm > 1e-8 {
        [axis[0] / norm, axis[1] / norm, axis[2] / norm]
    } else {
        [1.0, 0.0, 0.0]
    };

    // sign of the axis is fixed by the residual skew part
    if axis[0] * skew[0] + axis[1] * skew[1] + axis[2] * skew[2] < 0.0 {
        axis = [-axis[0], -axis[1], -axis[2]];
    }
    axis
}

fn identity_rotations<B: Backend>(n: usize, device: &B::Device) -> Tensor<B, 3> {
    let data: Vec<f32> = (0..n)
        .flat_map(|_| [1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0])
        .collect();
    Tensor::from_data(TensorData::new(data, [n, 3, 3]), device)
}

/// `[N, 3]` -> `[N, 3, 3]` cross-product matrices
fn skew<B: Backend>(omega: Tensor<B, 2>) -> Tensor<B, 3> {
    let [n, _] = omega.dims();
    let x = omega.clone().slice([0..n, 0..1]);
    let y = omega.clone().slice([0..n, 1..2]);
    let z = omega.slice([0..n, 2..3]);
    let zero = x.zeros_like();

    let rows = vec![
        Tensor::cat(vec![zero.clone(), z.clone().neg(), y.clone()], 1),
        Tensor::cat(vec![z, zero.clone(), x.clone().neg()], 1),
        Tensor::cat(vec![y.neg(), x, zero], 1),
    ];
    Tensor::stack(rows, 1)
}

/// Column `[N, 1]` holding `m[:, row, col]`
fn entry<B: Backend>(m: &Tensor<B, 3>, row: usize, col: usize) -> Tensor<B, 2> {
    let [n, _, _] = m.dims();
    m.clone()
        .slice([0..n, row..row + 1, col..col + 1])
        .reshape([n, 1])
}

fn rotate<B: Backend>(rotation: Tensor<B, 3>, v: Tensor<B, 2>) -> Tensor<B, 2> {
    let [n, _] = v.dims();
    rotation.matmul(v.reshape([n, 3, 1])).reshape([n, 3])
}
