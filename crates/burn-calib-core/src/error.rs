//! Error taxonomy shared by the schedule, the samplers and the orchestrator

/// Errors raised by schedule construction and at batch call boundaries
///
/// Non-finite values produced during sampling are not errors: they are
/// reported per batch element through [`Pose::non_finite_rows`](crate::se3::Pose::non_finite_rows).
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DiffusionError {
    /// Schedule family name is not one of `linear` / `cosine`
    #[error("unknown schedule family: {0}")]
    UnknownScheduleFamily(String),

    /// Number of diffusion steps must be positive
    #[error("invalid diffusion step count: {0} (must be > 0)")]
    InvalidStepCount(usize),

    /// A beta bound is outside (0, 0.999]
    #[error("{name} = {value} is outside (0, 0.999]")]
    BetaOutOfRange { name: &'static str, value: f64 },

    /// Linear schedule bounds are reversed
    #[error("beta_1 ({beta_1}) must not exceed beta_T ({beta_t})")]
    InvalidBetaOrder { beta_1: f64, beta_t: f64 },

    /// Cosine schedule offset must be finite and non-negative
    #[error("invalid cosine schedule offset: {0}")]
    InvalidCosineOffset(f64),

    /// Tensor or batch shape disagrees with what the call expects
    #[error("shape mismatch for {what}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        what: &'static str,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    /// Diffusion timestep outside `[1, num_steps]`
    #[error("timestep {timestep} outside [1, {num_steps}]")]
    TimestepOutOfRange { timestep: usize, num_steps: usize },

    /// Evaluation finished without a single finite batch
    #[error("no valid batch: every evaluated batch produced non-finite errors")]
    NoValidBatch,
}

impl DiffusionError {
    /// Build a [`DiffusionError::ShapeMismatch`]
    pub fn shape(
        what: &'static str,
        expected: impl Into<Vec<usize>>,
        actual: impl Into<Vec<usize>>,
    ) -> Self {
        Self::ShapeMismatch {
            what,
            expected: expected.into(),
            actual: actual.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, DiffusionError>;
