//! burn-calib: Camera-LiDAR extrinsic calibration by SE(3) diffusion
//!
//! A perturbed LiDAR-to-camera extrinsic is corrected by denoising a pose
//! through a learned diffusion process on SE(3), conditioned on the camera
//! image and the point cloud.
//!
//! # Crates
//!
//! - [`core`]: batched SE(3) poses, conditioning context, errors
//! - [`samplers`]: noise schedules, forward noising, DDPM reverse sampling
//!
//! This crate adds the [`Diffuser`] orchestrator, training losses and
//! evaluation metrics.
//!
//! # Backend Selection
//!
//! - `ndarray` (default): CPU backend
//! - `wgpu`: WebGPU backend
//!
//! # Example
//!
//! ```ignore
//! use burn_calib::{Diffuser, DiffuserConfig, MseLoss, backends::DefaultBackend};
//!
//! let config: DiffuserConfig = serde_json::from_str(&std::fs::read_to_string("diffuser.json")?)?;
//! let diffuser = Diffuser::new(model, MseLoss, &config)?;
//!
//! let loss = diffuser.compute_training_loss(&gt_correction, &context, &mut rng)?;
//! let extrinsic = diffuser.estimate_extrinsic(&context)?;
//! ```

pub mod backends;
pub mod diffuser;
pub mod loss;
pub mod metrics;

pub use burn_calib_core as core;
pub use burn_calib_samplers as samplers;

pub use burn_calib_core::{
    CalibrationContext, CameraInfo, Conditioning, DiffusionError, Pose, Result, TANGENT_DIM,
};
pub use burn_calib_samplers::{
    Denoiser, ForwardNoiser, NoiseSchedule, PredictionType, ReverseSampler, SampleOutput,
    SamplerConfig, ScheduleConfig,
};

pub use diffuser::{Diffuser, DiffuserConfig};
pub use loss::{L1Loss, LossConfig, LossKind, MseLoss, PoseLoss, WeightedPoseLoss};
pub use metrics::{CalibrationMetrics, MetricSummary, se3_error};
