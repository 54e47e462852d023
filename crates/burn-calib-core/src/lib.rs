//! Core types for SE(3) diffusion calibration
//!
//! This crate provides the pieces shared by the schedule, the samplers and
//! the orchestration layer of burn-calib.
//!
//! # Modules
//!
//! - [`se3`] - Batched rigid transforms, exponential / logarithm maps,
//!   composition and inversion
//! - [`context`] - Conditioning context (image, point cloud, initial extrinsic,
//!   intrinsics) passed to the denoiser
//! - [`error`] - Configuration and shape errors
//!
//! # Example
//!
//! ```ignore
//! use burn_calib_core::Pose;
//!
//! // Perturb a pose in the tangent space and map it back
//! let tangent = pose.log() + delta;
//! let perturbed = Pose::exp(tangent)?;
//! ```

pub mod context;
pub mod error;
pub mod se3;

pub use context::{CalibrationContext, CameraInfo, Conditioning};
pub use error::{DiffusionError, Result};
pub use se3::{Pose, TANGENT_DIM, so3_exp, so3_log};
