//! End-to-end behaviour of the diffuser with oracle denoisers

use burn::prelude::*;
use burn::tensor::Bool;
use burn_calib::metrics::THRESHOLD_3D3C;
use burn_calib::{
    CalibrationContext, CalibrationMetrics, CameraInfo, Diffuser, DiffuserConfig, DiffusionError,
    MseLoss, NoiseSchedule, Pose, PredictionType, ScheduleConfig, se3_error,
};
use burn_ndarray::NdArray;
use rand::{SeedableRng, rngs::StdRng};

type TestBackend = NdArray<f32>;
type Device = <TestBackend as Backend>::Device;

const GT: [[f32; 6]; 2] = [
    [0.05, -0.03, 0.1, 0.1, -0.05, 0.2],
    [-0.12, 0.08, 0.02, -0.3, 0.15, 0.05],
];

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn gt_tangent(device: &Device) -> Tensor<TestBackend, 2> {
    Tensor::from_floats(GT, device)
}

fn context(device: &Device) -> CalibrationContext<TestBackend> {
    let initial = Pose::exp(Tensor::from_floats(
        [[0.0, 0.0, 0.3, 0.5, 0.0, 0.0], [0.1, 0.0, 0.0, 0.0, -0.2, 0.1]],
        device,
    ))
    .unwrap();
    CalibrationContext::new(
        Tensor::zeros([2, 3, 8, 16], device),
        Tensor::ones([2, 3, 32], device),
        initial,
        CameraInfo::kitti(),
    )
    .unwrap()
}

fn config(eval_steps: usize, prediction: PredictionType) -> DiffuserConfig {
    DiffuserConfig {
        train: ScheduleConfig::linear(20, 1e-4, 0.02),
        eval: ScheduleConfig::linear(eval_steps, 1e-4, 0.02),
        prediction,
        check_finite: true,
    }
}

type OracleFn =
    Box<dyn Fn(&Pose<TestBackend>, &CalibrationContext<TestBackend>, Tensor<TestBackend, 1, Int>) -> Tensor<TestBackend, 2>>;

/// Denoiser that returns the exact noise separating each pose from the
/// ground truth, optionally poisoning batch element 0 at one timestep
fn oracle(schedule: NoiseSchedule, x0: Tensor<TestBackend, 2>, nan_at: Option<usize>) -> OracleFn {
    Box::new(move |pose: &Pose<TestBackend>, _: &CalibrationContext<TestBackend>, timesteps: Tensor<TestBackend, 1, Int>| {
        let device = pose.device();
        let [n, _] = x0.dims();
        let ts: Vec<usize> = timesteps
            .into_data()
            .iter::<i64>()
            .map(|t| t as usize)
            .collect();
        let column = |f: &dyn Fn(f64) -> f64| {
            let values: Vec<f32> = ts.iter().map(|&t| f(schedule.alpha_bar(t)) as f32).collect();
            Tensor::<TestBackend, 1>::from_floats(values.as_slice(), &device).reshape([n, 1])
        };
        let signal = column(&|ab| ab.sqrt());
        let sigma = column(&|ab| (1.0 - ab).sqrt());
        let eps = (pose.log() - x0.clone() * signal) / sigma;

        match nan_at {
            Some(step) if ts[0] == step => {
                let mut mask = vec![false; n * 6];
                mask[..6].fill(true);
                let mask = Tensor::<TestBackend, 2, Bool>::from_data(TensorData::new(mask, [n, 6]), &device);
                eps.mask_fill(mask, f32::NAN)
            }
            _ => eps,
        }
    })
}

fn errors_of(pred: &Pose<TestBackend>, gt: &Pose<TestBackend>) -> (Vec<f32>, Vec<f32>) {
    let (r, t) = se3_error(pred, gt).unwrap();
    let r: Vec<f32> = r.into_data().to_vec().unwrap();
    let t: Vec<f32> = t.into_data().to_vec().unwrap();
    (r, t)
}

#[test]
fn oracle_noise_recovers_ground_truth() {
    init_logger();
    let device = Default::default();
    let config = config(10, PredictionType::Epsilon);
    let schedule = NoiseSchedule::new(&config.eval).unwrap();
    let diffuser = Diffuser::new(oracle(schedule, gt_tangent(&device), None), MseLoss, &config).unwrap();

    let pose = diffuser.sample(&context(&device), false).unwrap().into_final();
    let gt = Pose::exp(gt_tangent(&device)).unwrap();
    let (r, t) = errors_of(&pose, &gt);
    for v in &r {
        assert!(v.to_degrees().abs() < 0.1, "rotation error {r:?}");
    }
    for v in &t {
        assert!(v.abs() < 1e-4, "translation error {t:?}");
    }
}

#[test]
fn single_step_returns_model_prediction() {
    init_logger();
    let device = Default::default();
    let config = config(1, PredictionType::Sample);
    let target = gt_tangent(&device);
    let model = {
        let target = target.clone();
        move |_: &Pose<TestBackend>, _: &CalibrationContext<TestBackend>, _: Tensor<TestBackend, 1, Int>| {
            target.clone()
        }
    };
    let diffuser = Diffuser::new(model, MseLoss, &config).unwrap();

    let out = diffuser.sample(&context(&device), true).unwrap();
    assert_eq!(out.poses().len(), 2);
    let got: Vec<f32> = out.final_pose().log().into_data().to_vec().unwrap();
    let expected: Vec<f32> = target.into_data().to_vec().unwrap();
    for (g, e) in got.iter().zip(&expected) {
        assert!((g - e).abs() < 1e-5, "got {got:?}");
    }
}

#[test]
fn non_finite_output_stays_in_its_batch_element() {
    init_logger();
    let device = Default::default();
    let config = config(10, PredictionType::Epsilon);
    let schedule = NoiseSchedule::new(&config.eval).unwrap();
    let diffuser =
        Diffuser::new(oracle(schedule, gt_tangent(&device), Some(5)), MseLoss, &config).unwrap();

    let pose = diffuser.sample(&context(&device), false).unwrap().into_final();
    assert_eq!(pose.non_finite_rows(), vec![0]);

    let gt = Pose::exp(gt_tangent(&device)).unwrap();
    let (r, t) = errors_of(&pose.slice_rows(1..2), &gt.slice_rows(1..2));
    assert!(r.iter().all(|v| v.to_degrees().abs() < 0.1), "rotation error {r:?}");
    assert!(t.iter().all(|v| v.abs() < 1e-4), "translation error {t:?}");
}

#[test]
fn training_loss_vanishes_for_oracle() {
    init_logger();
    let device = Default::default();
    let config = config(10, PredictionType::Epsilon);
    let schedule = NoiseSchedule::new(&config.train).unwrap();
    let diffuser = Diffuser::new(oracle(schedule, gt_tangent(&device), None), MseLoss, &config).unwrap();
    let clean = Pose::exp(gt_tangent(&device)).unwrap();
    let mut rng = StdRng::seed_from_u64(42);

    for _ in 0..5 {
        let loss: f32 = diffuser
            .compute_training_loss(&clean, &context(&device), &mut rng)
            .unwrap()
            .into_scalar();
        assert!(loss.is_finite() && loss < 1e-6, "loss {loss}");
    }
}

#[test]
fn training_loss_targets_clean_pose_for_sample_prediction() {
    init_logger();
    let device = Default::default();
    let config = config(10, PredictionType::Sample);
    let zero = |pose: &Pose<TestBackend>, _: &CalibrationContext<TestBackend>, _: Tensor<TestBackend, 1, Int>| {
        Tensor::zeros([pose.batch_size(), 6], &pose.device())
    };
    let diffuser = Diffuser::new(zero, MseLoss, &config).unwrap();
    let clean = Pose::exp(gt_tangent(&device)).unwrap();
    let mut rng = StdRng::seed_from_u64(0);

    let loss: f32 = diffuser
        .compute_training_loss(&clean, &context(&device), &mut rng)
        .unwrap()
        .into_scalar();
    let expected = GT.iter().flatten().map(|v| v * v).sum::<f32>() / 12.0;
    assert!((loss - expected).abs() < 1e-6, "loss {loss}, expected {expected}");
}

#[test]
fn training_loss_rejects_batch_disagreement() {
    let device = Default::default();
    let config = config(10, PredictionType::Epsilon);
    let schedule = NoiseSchedule::new(&config.train).unwrap();
    let diffuser = Diffuser::new(oracle(schedule, gt_tangent(&device), None), MseLoss, &config).unwrap();
    let clean = Pose::<TestBackend>::identity(3, &device);
    let mut rng = StdRng::seed_from_u64(1);

    let err = diffuser
        .compute_training_loss(&clean, &context(&device), &mut rng)
        .unwrap_err();
    assert!(matches!(err, DiffusionError::ShapeMismatch { .. }));
}

#[test]
fn estimate_extrinsic_applies_correction_after_initial_guess() {
    init_logger();
    let device = Default::default();
    let config = config(3, PredictionType::Sample);
    let model = move |pose: &Pose<TestBackend>, _: &CalibrationContext<TestBackend>, _: Tensor<TestBackend, 1, Int>| {
        gt_tangent(&pose.device())
    };
    let diffuser = Diffuser::new(model, MseLoss, &config).unwrap();
    let ctx = context(&device);

    let extrinsic = diffuser.estimate_extrinsic(&ctx).unwrap();
    let expected = Pose::exp(gt_tangent(&device))
        .unwrap()
        .compose(&ctx.initial_extrinsic)
        .unwrap();
    let (r, t) = errors_of(&extrinsic, &expected);
    assert!(r.iter().chain(&t).all(|v| v.abs() < 1e-5));
}

#[test]
fn evaluation_accumulates_metrics_and_skips_nan_batches() {
    init_logger();
    let device = Default::default();
    let config = config(10, PredictionType::Epsilon);
    let schedule = NoiseSchedule::new(&config.eval).unwrap();
    let gt = Pose::exp(gt_tangent(&device)).unwrap();
    let ctx = context(&device);

    let poisoned = Diffuser::new(
        oracle(schedule.clone(), gt_tangent(&device), Some(3)),
        MseLoss,
        &config,
    )
    .unwrap();
    let mut metrics = CalibrationMetrics::new();
    poisoned.evaluate_batch(&ctx, &gt, &mut metrics).unwrap();
    assert_eq!(metrics.valid_batches(), 0);
    assert_eq!(metrics.summary().unwrap_err(), DiffusionError::NoValidBatch);

    let exact = Diffuser::new(oracle(schedule, gt_tangent(&device), None), MseLoss, &config).unwrap();
    let trajectory = exact.evaluate_batch(&ctx, &gt, &mut metrics).unwrap();
    assert_eq!(trajectory.stacked_tangents().dims(), [2, 11, 6]);

    // exported states are full extrinsics: the last one is the calibrated pose
    let exported = trajectory
        .stacked_extrinsic_tangents(&ctx.initial_extrinsic)
        .unwrap();
    assert_eq!(exported.dims(), [2, 11, 6]);
    let last: Vec<f32> = exported.slice([0..2, 10..11, 0..6]).into_data().to_vec().unwrap();
    let calibrated: Vec<f32> = gt
        .compose(&ctx.initial_extrinsic)
        .unwrap()
        .log()
        .into_data()
        .to_vec()
        .unwrap();
    for (got, want) in last.iter().zip(&calibrated) {
        assert!((got - want).abs() < 1e-4, "{got} vs {want}");
    }

    let summary = metrics.summary().unwrap();
    assert_eq!(summary.samples, 2);
    assert_eq!(summary.valid_ratio, 0.5);
    assert_eq!(summary.success_3d3c, 1.0);
    assert!(summary.rotation_rmse_deg < 0.1 && summary.rotation_rmse_deg < THRESHOLD_3D3C.0);
    assert!(summary.translation_rmse < 1e-4);
}

#[test]
fn config_accepts_experiment_field_names() {
    init_logger();
    let json = r#"{
        "train": {"n_diff_steps": 1000, "schedule_type": "cosine", "S": 0.008},
        "val": {"n_diff_steps": 10, "schedule_type": "linear", "beta_1": 1e-4, "beta_T": 0.02},
        "prediction": "sample"
    }"#;
    let config: DiffuserConfig = serde_json::from_str(json).unwrap();
    assert_eq!(config.eval, ScheduleConfig::linear(10, 1e-4, 0.02));
    assert_eq!(config.prediction, PredictionType::Sample);
    assert!(!config.check_finite);

    let model = |pose: &Pose<TestBackend>, _: &CalibrationContext<TestBackend>, _: Tensor<TestBackend, 1, Int>| {
        Tensor::<TestBackend, 2>::zeros([pose.batch_size(), 6], &pose.device())
    };
    let diffuser = Diffuser::new(model, MseLoss, &config).unwrap();
    assert_eq!(diffuser.train_schedule().num_steps(), 1000);
    assert_eq!(diffuser.eval_schedule().num_steps(), 10);
}

#[test]
fn unknown_schedule_family_is_a_configuration_error() {
    let json = r#"{
        "train": {"n_diff_steps": 100, "schedule_type": "sigmoid"},
        "eval": {"n_diff_steps": 10, "schedule_type": "linear"}
    }"#;
    let config: DiffuserConfig = serde_json::from_str(json).unwrap();
    let model = |pose: &Pose<TestBackend>, _: &CalibrationContext<TestBackend>, _: Tensor<TestBackend, 1, Int>| {
        Tensor::<TestBackend, 2>::zeros([pose.batch_size(), 6], &pose.device())
    };
    let Err(err) = Diffuser::new(model, MseLoss, &config) else {
        panic!("sigmoid schedule should be rejected");
    };
    assert_eq!(err, DiffusionError::UnknownScheduleFamily("sigmoid".to_string()));
}
