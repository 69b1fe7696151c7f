//! Sim3: 7-DOF similarity transformation (rotation + translation + scale).
//!
//! Loop detection and map merging hand the matcher a similarity between two
//! map frames, because monocular maps drift in scale. The matcher only ever
//! applies these transforms to points; estimating them is the caller's job.

use nalgebra::{UnitQuaternion, Vector3};

use super::SE3;

/// Similarity transformation: p' = s * R * p + t.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sim3 {
    pub rotation: UnitQuaternion<f64>,
    pub translation: Vector3<f64>,
    pub scale: f64,
}

impl Sim3 {
    pub fn new(rotation: UnitQuaternion<f64>, translation: Vector3<f64>, scale: f64) -> Self {
        Self {
            rotation,
            translation,
            scale,
        }
    }

    pub fn identity() -> Self {
        Self::new(UnitQuaternion::identity(), Vector3::zeros(), 1.0)
    }

    /// Lift a rigid transform to a similarity with unit scale.
    pub fn from_se3(se3: &SE3) -> Self {
        Self::new(se3.rotation, se3.translation, 1.0)
    }

    /// [(1/s) R^T | -(1/s) R^T t]
    pub fn inverse(&self) -> Self {
        let r_inv = self.rotation.inverse();
        let s_inv = 1.0 / self.scale;
        Self::new(r_inv, -(r_inv * self.translation) * s_inv, s_inv)
    }

    /// `self ∘ other`: apply `other` first.
    pub fn compose(&self, other: &Sim3) -> Self {
        Self::new(
            self.rotation * other.rotation,
            self.scale * (self.rotation * other.translation) + self.translation,
            self.scale * other.scale,
        )
    }

    pub fn transform_point(&self, p: &Vector3<f64>) -> Vector3<f64> {
        self.scale * (self.rotation * p) + self.translation
    }

    /// Rigid part of a world-to-camera similarity, with the translation
    /// divided by the scale: `R p + t / s`.
    ///
    /// This is the camera-frame position of a world point up to the global
    /// scale factor, so it projects to the same pixel.
    pub fn to_se3_unscaled(&self) -> SE3 {
        SE3 {
            rotation: self.rotation,
            translation: self.translation / self.scale,
        }
    }

    /// Point mapped to the origin, i.e. the camera center of a
    /// world-to-camera similarity.
    pub fn camera_center(&self) -> Vector3<f64> {
        -(self.rotation.inverse() * self.translation) / self.scale
    }
}

impl Default for Sim3 {
    fn default() -> Self {
        Self::identity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn sample_sim3() -> Sim3 {
        Sim3::new(
            UnitQuaternion::from_axis_angle(&Vector3::z_axis(), std::f64::consts::FRAC_PI_2),
            Vector3::new(1.0, 2.0, 3.0),
            2.0,
        )
    }

    #[test]
    fn test_inverse() {
        let sim3 = sample_sim3();
        let composed = sim3.compose(&sim3.inverse());

        assert_relative_eq!(composed.scale, 1.0, epsilon = 1e-10);
        assert_relative_eq!(composed.translation.norm(), 0.0, epsilon = 1e-10);

        let p = Vector3::new(1.0, 2.0, 3.0);
        let p_back = sim3.inverse().transform_point(&sim3.transform_point(&p));
        assert_relative_eq!(p_back, p, epsilon = 1e-10);
    }

    #[test]
    fn test_transform_point_with_scale() {
        let sim3 = Sim3::new(UnitQuaternion::identity(), Vector3::new(1.0, 0.0, 0.0), 2.0);

        // p' = 2 * I * (1,1,1) + (1,0,0) = (3, 2, 2)
        let p_transformed = sim3.transform_point(&Vector3::new(1.0, 1.0, 1.0));
        assert_relative_eq!(p_transformed, Vector3::new(3.0, 2.0, 2.0), epsilon = 1e-10);
    }

    #[test]
    fn test_camera_center_maps_to_origin() {
        let sim3 = sample_sim3();
        let center = sim3.camera_center();
        assert_relative_eq!(sim3.transform_point(&center), Vector3::zeros(), epsilon = 1e-10);
    }

    #[test]
    fn test_unscaled_pose_projects_like_similarity() {
        // Scaling a camera-frame point does not change its pixel projection.
        let sim3 = sample_sim3();
        let p = Vector3::new(0.5, -0.3, 4.0);
        let a = sim3.transform_point(&p);
        let b = sim3.to_se3_unscaled().transform_point(&p);
        assert_relative_eq!(a.x / a.z, b.x / b.z, epsilon = 1e-10);
        assert_relative_eq!(a.y / a.z, b.y / b.z, epsilon = 1e-10);
    }
}
