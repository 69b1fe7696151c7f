//! Geometry utilities: SE3 and Sim3 transforms, epipolar relations.

pub mod epipolar;
pub mod se3;
pub mod sim3;

pub use epipolar::{compute_f12, epipolar_distance_sq, epipolar_line, skew_symmetric};
pub use se3::SE3;
pub use sim3::Sim3;
