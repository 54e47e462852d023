//! Conditioning context handed unchanged to the denoiser at every step

use burn::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::{DiffusionError, Result};
use crate::se3::Pose;

/// Anything a denoiser can be conditioned on
///
/// The samplers only need to know how many batch elements the context
/// describes and where its tensors live.
pub trait Conditioning<B: Backend> {
    fn batch_size(&self) -> usize;

    fn device(&self) -> B::Device;
}

/// Pinhole camera parameters of the image sensor
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CameraInfo {
    /// Focal lengths and principal point, pixels
    pub fx: f32,
    pub fy: f32,
    pub cx: f32,
    pub cy: f32,
    /// Image size, pixels
    pub sensor_h: usize,
    pub sensor_w: usize,
}

impl CameraInfo {
    /// KITTI left color camera, cropped to 376 x 1241
    pub fn kitti() -> Self {
        Self {
            fx: 718.856,
            fy: 718.856,
            cx: 607.1928,
            cy: 185.2157,
            sensor_h: 376,
            sensor_w: 1241,
        }
    }

    /// `[3, 3]` intrinsic matrix
    pub fn intrinsic_matrix<B: Backend>(&self, device: &B::Device) -> Tensor<B, 2> {
        let k = vec![self.fx, 0.0, self.cx, 0.0, self.fy, self.cy, 0.0, 0.0, 1.0];
        Tensor::from_data(TensorData::new(k, [3, 3]), device)
    }

    /// Project camera-frame points `[N, 3, P]` to pixel coordinates `[N, 2, P]`
    ///
    /// Points at or behind the image plane yield meaningless coordinates;
    /// filter them with their depth before rasterising.
    pub fn project_points<B: Backend>(&self, points: Tensor<B, 3>) -> Result<Tensor<B, 3>> {
        let [n, dim, p] = points.dims();
        if dim != 3 {
            return Err(DiffusionError::shape("point cloud", [n, 3, p], [n, dim, p]));
        }
        let x = points.clone().slice([0..n, 0..1, 0..p]);
        let y = points.clone().slice([0..n, 1..2, 0..p]);
        let z = points.slice([0..n, 2..3, 0..p]);
        let u = (x / z.clone()).mul_scalar(self.fx).add_scalar(self.cx);
        let v = (y / z).mul_scalar(self.fy).add_scalar(self.cy);
        Ok(Tensor::cat(vec![u, v], 1))
    }
}

/// Image, point cloud and initial extrinsic guess of one calibration batch
#[derive(Debug, Clone)]
pub struct CalibrationContext<B: Backend> {
    /// `[N, C, H, W]`
    pub image: Tensor<B, 4>,
    /// `[N, 3, P]`, LiDAR frame
    pub point_cloud: Tensor<B, 3>,
    /// Perturbed LiDAR-to-camera extrinsic the correction is applied to
    pub initial_extrinsic: Pose<B>,
    /// Intrinsics of the camera the image came from
    pub camera: CameraInfo,
}

impl<B: Backend> CalibrationContext<B> {
    /// Bundle one batch; fails when the batch sizes disagree
    pub fn new(
        image: Tensor<B, 4>,
        point_cloud: Tensor<B, 3>,
        initial_extrinsic: Pose<B>,
        camera: CameraInfo,
    ) -> Result<Self> {
        let n = image.dims()[0];
        let [m, dim, p] = point_cloud.dims();
        if m != n || dim != 3 {
            return Err(DiffusionError::shape("point cloud", [n, 3, p], [m, dim, p]));
        }
        if initial_extrinsic.batch_size() != n {
            return Err(DiffusionError::shape(
                "initial extrinsic",
                [n],
                [initial_extrinsic.batch_size()],
            ));
        }
        Ok(Self {
            image,
            point_cloud,
            initial_extrinsic,
            camera,
        })
    }

    /// Point cloud moved into the camera frame by the initial extrinsic
    pub fn camera_frame_points(&self) -> Result<Tensor<B, 3>> {
        self.initial_extrinsic
            .transform_points(self.point_cloud.clone())
    }
}

impl<B: Backend> Conditioning<B> for CalibrationContext<B> {
    fn batch_size(&self) -> usize {
        self.image.dims()[0]
    }

    fn device(&self) -> B::Device {
        self.image.device()
    }
}
