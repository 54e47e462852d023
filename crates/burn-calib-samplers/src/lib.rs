//! Diffusion schedule and samplers for SE(3) extrinsic calibration
//!
//! - [`NoiseSchedule`]: immutable linear / cosine variance schedule
//! - [`ForwardNoiser`]: tangent-space forward noising used for training
//! - [`ReverseSampler`]: DDPM reverse process driven by a [`Denoiser`]

pub mod ddpm;
pub mod denoiser;
pub mod noising;
pub mod scheduler;

pub use ddpm::{ReverseSampler, SampleOutput, SamplerConfig};
pub use denoiser::Denoiser;
pub use noising::ForwardNoiser;
pub use scheduler::{
    MAX_BETA, NoiseSchedule, PredictionType, ScheduleConfig, ScheduleFamily, epsilon_to_sample,
    sample_to_epsilon, timestep_tensor, to_epsilon, to_sample,
};
