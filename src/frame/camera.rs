//! Pinhole camera model with optional rectified stereo baseline.

use nalgebra::{Matrix3, Vector3};

/// Pinhole intrinsics of the (rectified, undistorted) left camera.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CameraModel {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
    /// Stereo baseline in meters; 0 for monocular.
    pub baseline: f64,
    /// Image width in pixels.
    pub width: f64,
    /// Image height in pixels.
    pub height: f64,
}

impl CameraModel {
    pub fn new(fx: f64, fy: f64, cx: f64, cy: f64, width: f64, height: f64) -> Self {
        Self {
            fx,
            fy,
            cx,
            cy,
            baseline: 0.0,
            width,
            height,
        }
    }

    pub fn with_baseline(mut self, baseline: f64) -> Self {
        self.baseline = baseline;
        self
    }

    /// Focal length times baseline, the disparity-depth constant.
    pub fn bf(&self) -> f64 {
        self.fx * self.baseline
    }

    /// Intrinsic matrix K.
    #[rustfmt::skip]
    pub fn k_matrix(&self) -> Matrix3<f64> {
        Matrix3::new(
            self.fx, 0.0, self.cx,
            0.0, self.fy, self.cy,
            0.0, 0.0, 1.0,
        )
    }

    /// Project a camera-frame point to pixel coordinates.
    ///
    /// Returns `None` for points at or behind the camera.
    pub fn project(&self, p_cam: &Vector3<f64>) -> Option<(f64, f64)> {
        if p_cam.z <= 0.0 {
            return None;
        }
        let inv_z = 1.0 / p_cam.z;
        Some((
            self.fx * p_cam.x * inv_z + self.cx,
            self.fy * p_cam.y * inv_z + self.cy,
        ))
    }

    /// Horizontal coordinate of a point in the right rectified image.
    pub fn right_u(&self, u: f64, depth: f64) -> f64 {
        u - self.bf() / depth
    }

    /// Whether a pixel lies inside the image bounds.
    pub fn is_in_image(&self, u: f64, v: f64) -> bool {
        u >= 0.0 && u < self.width && v >= 0.0 && v < self.height
    }
}
