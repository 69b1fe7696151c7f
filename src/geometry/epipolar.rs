//! Two-view epipolar geometry used to verify candidate correspondences.
//!
//! Convention: `F12` relates pixels of view 1 and view 2 so that
//! `x1^T * F12 * x2 = 0`. The line in view 2 induced by a pixel `x1` is
//! therefore `F12^T * x1`.

use nalgebra::{Matrix3, Point2, Vector3};

use super::SE3;

/// Build the 3x3 skew-symmetric (cross product) matrix of `v`.
#[rustfmt::skip]
pub fn skew_symmetric(v: &Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(
        0.0, -v.z, v.y,
        v.z, 0.0, -v.x,
        -v.y, v.x, 0.0,
    )
}

/// Fundamental matrix between two calibrated views.
///
/// # Arguments
/// * `pose1` - Camera-to-world pose of view 1 (T_wc)
/// * `pose2` - Camera-to-world pose of view 2 (T_wc)
/// * `k1`, `k2` - Intrinsic matrices
///
/// # Returns
/// `F12 = K1^-T [t12]x R12 K2^-1`, or `None` when an intrinsic matrix is singular.
pub fn compute_f12(
    pose1: &SE3,
    pose2: &SE3,
    k1: &Matrix3<f64>,
    k2: &Matrix3<f64>,
) -> Option<Matrix3<f64>> {
    let t1w = pose1.inverse();
    let t2w = pose2.inverse();

    let r1w = t1w.rotation_matrix();
    let r2w = t2w.rotation_matrix();
    let r12 = r1w * r2w.transpose();
    let t12 = -r12 * t2w.translation + t1w.translation;

    let k1_inv = k1.try_inverse()?;
    let k2_inv = k2.try_inverse()?;

    Some(k1_inv.transpose() * skew_symmetric(&t12) * r12 * k2_inv)
}

/// Epipolar line coefficients (a, b, c) in view 2 for pixel `p1` of view 1.
pub fn epipolar_line(p1: &Point2<f64>, f12: &Matrix3<f64>) -> Vector3<f64> {
    f12.transpose() * Vector3::new(p1.x, p1.y, 1.0)
}

/// Squared perpendicular distance of `p2` to the epipolar line of `p1`.
///
/// Returns `None` for a degenerate line (zero normal), which callers treat
/// as a failed check.
pub fn epipolar_distance_sq(
    p1: &Point2<f64>,
    p2: &Point2<f64>,
    f12: &Matrix3<f64>,
) -> Option<f64> {
    let line = epipolar_line(p1, f12);
    let den = line.x * line.x + line.y * line.y;
    if den == 0.0 {
        return None;
    }
    let num = line.x * p2.x + line.y * p2.y + line.z;
    Some(num * num / den)
}
