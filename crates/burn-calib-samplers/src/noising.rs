//! Forward diffusion on SE(3)
//!
//! A clean pose is noised in the tangent space:
//!
//! ```text
//! x_t = sqrt(ᾱ_t) · log(pose) + sqrt(1 - ᾱ_t) · ε,   ε ~ N(0, I₆)
//! ```
//!
//! and mapped back through the exponential, so the noisy pose is always a
//! valid rigid transform.

use burn::prelude::*;
use burn::tensor::Distribution;
use burn_calib_core::{DiffusionError, Pose, Result, TANGENT_DIM};

use crate::scheduler::{NoiseSchedule, coefficient_column};

/// Forward noising process driven by a schedule
#[derive(Debug, Clone, Copy)]
pub struct ForwardNoiser<'a> {
    schedule: &'a NoiseSchedule,
}

impl<'a> ForwardNoiser<'a> {
    /// Noiser over `schedule`
    pub fn new(schedule: &'a NoiseSchedule) -> Self {
        Self { schedule }
    }

    pub fn schedule(&self) -> &NoiseSchedule {
        self.schedule
    }

    /// Noise each batch element at its own timestep
    ///
    /// Returns the noisy pose and the standard-normal tangent noise that was
    /// drawn, which is the regression target of an epsilon-predicting model.
    pub fn add_noise<B: Backend>(
        &self,
        clean: &Pose<B>,
        timesteps: &[usize],
    ) -> Result<(Pose<B>, Tensor<B, 2>)> {
        let noise = Tensor::random(
            [clean.batch_size(), TANGENT_DIM],
            Distribution::Normal(0.0, 1.0),
            &clean.device(),
        );
        let noisy = self.add_given_noise(clean, timesteps, noise.clone())?;
        Ok((noisy, noise))
    }

    /// Noise every batch element at the same timestep
    pub fn add_noise_at<B: Backend>(
        &self,
        clean: &Pose<B>,
        timestep: usize,
    ) -> Result<(Pose<B>, Tensor<B, 2>)> {
        self.add_noise(clean, &vec![timestep; clean.batch_size()])
    }

    /// Deterministic variant of [`ForwardNoiser::add_noise`] with caller-supplied noise
    pub fn add_given_noise<B: Backend>(
        &self,
        clean: &Pose<B>,
        timesteps: &[usize],
        noise: Tensor<B, 2>,
    ) -> Result<Pose<B>> {
        let n = clean.batch_size();
        if timesteps.len() != n {
            return Err(DiffusionError::shape("timesteps", [n], [timesteps.len()]));
        }
        let [m, width] = noise.dims();
        if m != n || width != TANGENT_DIM {
            return Err(DiffusionError::shape("noise", [n, TANGENT_DIM], [m, width]));
        }
        for &t in timesteps {
            self.schedule.check_timestep(t)?;
        }

        let device = clean.device();
        let signal = coefficient_column::<B>(
            timesteps.iter().map(|&t| self.schedule.alpha_bar(t).sqrt()),
            &device,
        );
        let sigma = coefficient_column::<B>(
            timesteps
                .iter()
                .map(|&t| (1.0 - self.schedule.alpha_bar(t)).sqrt()),
            &device,
        );

        Pose::exp(clean.log() * signal + noise * sigma)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::ScheduleConfig;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    fn clean_pose(device: &<TestBackend as Backend>::Device) -> Pose<TestBackend> {
        let v = Tensor::<TestBackend, 2>::from_floats(
            [[0.1, -0.05, 0.2, 0.3, -0.1, 0.05], [0.0, 0.3, 0.0, -0.2, 0.0, 0.4]],
            device,
        );
        Pose::exp(v).unwrap()
    }

    #[test]
    fn test_given_noise_matches_closed_form() {
        let device = Default::default();
        let schedule = NoiseSchedule::new(&ScheduleConfig::linear(10, 1e-4, 0.02)).unwrap();
        let noiser = ForwardNoiser::new(&schedule);
        let clean = clean_pose(&device);
        let noise = Tensor::<TestBackend, 2>::from_floats(
            [[0.1, 0.0, -0.1, 1.0, 0.0, 0.0], [0.0, 0.2, 0.0, 0.0, -1.0, 0.5]],
            &device,
        );

        let noisy = noiser
            .add_given_noise(&clean, &[3, 7], noise.clone())
            .unwrap();
        let got: Vec<f32> = noisy.log().into_data().to_vec().unwrap();
        let x0: Vec<f32> = clean.log().into_data().to_vec().unwrap();
        let eps: Vec<f32> = noise.into_data().to_vec().unwrap();
        for (row, t) in [3usize, 7].into_iter().enumerate() {
            let ab = schedule.alpha_bar(t);
            for k in 0..6 {
                let i = row * 6 + k;
                let expected = ab.sqrt() as f32 * x0[i] + (1.0 - ab).sqrt() as f32 * eps[i];
                assert!((got[i] - expected).abs() < 1e-5, "row {row} col {k}");
            }
        }
    }

    #[test]
    fn test_add_noise_returns_drawn_noise() {
        let device = Default::default();
        let schedule = NoiseSchedule::new(&ScheduleConfig::cosine(50)).unwrap();
        let noiser = ForwardNoiser::new(&schedule);
        let clean = clean_pose(&device);
        let (noisy, noise) = noiser.add_noise_at(&clean, 20).unwrap();
        assert_eq!(noise.dims(), [2, 6]);

        let replay = noiser.add_given_noise(&clean, &[20, 20], noise).unwrap();
        let a: Vec<f32> = noisy.log().into_data().to_vec().unwrap();
        let b: Vec<f32> = replay.log().into_data().to_vec().unwrap();
        for (x, y) in a.iter().zip(&b) {
            assert!((x - y).abs() < 1e-5);
        }
    }

    #[test]
    fn test_rejects_invalid_timesteps() {
        let device = Default::default();
        let schedule = NoiseSchedule::new(&ScheduleConfig::linear(10, 1e-4, 0.02)).unwrap();
        let noiser = ForwardNoiser::new(&schedule);
        let clean = clean_pose(&device);

        assert_eq!(
            noiser.add_noise(&clean, &[0, 1]).unwrap_err(),
            DiffusionError::TimestepOutOfRange {
                timestep: 0,
                num_steps: 10
            }
        );
        assert!(noiser.add_noise(&clean, &[1, 11]).is_err());
        assert!(matches!(
            noiser.add_noise(&clean, &[1]),
            Err(DiffusionError::ShapeMismatch { what: "timesteps", .. })
        ));
    }
}
