//! Backend selection for burn-calib
//!
//! Enable the desired backend via feature flags:
//!
//! - `ndarray` (default): CPU backend, no GPU required
//! - `wgpu`: WebGPU backend
//!
//! ```toml
//! [dependencies]
//! burn-calib = { version = "0.1", default-features = false, features = ["wgpu"] }
//! ```
//!
//! ```ignore
//! use burn_calib::backends::{DefaultBackend, default_device};
//!
//! let device = default_device();
//! let pose = burn_calib::Pose::<DefaultBackend>::identity(4, &device);
//! ```

#[cfg(feature = "ndarray")]
pub use burn_ndarray::{NdArray, NdArrayDevice};

#[cfg(feature = "wgpu")]
pub use burn_wgpu::{Wgpu, WgpuDevice};

/// Default backend with the ndarray feature
#[cfg(feature = "ndarray")]
pub type DefaultBackend = NdArray<f32>;

/// Default backend with only the wgpu feature
#[cfg(all(feature = "wgpu", not(feature = "ndarray")))]
pub type DefaultBackend = Wgpu;

/// Device of [`DefaultBackend`]
#[cfg(feature = "ndarray")]
pub fn default_device() -> NdArrayDevice {
    NdArrayDevice::default()
}

/// Device of [`DefaultBackend`]
#[cfg(all(feature = "wgpu", not(feature = "ndarray")))]
pub fn default_device() -> WgpuDevice {
    WgpuDevice::default()
}
