//! Frame-level data: camera model, ORB features, spatial grid, tracking frame.

pub mod camera;
pub mod features;
pub mod grid;
pub mod tracking_frame;

pub use camera::CameraModel;
pub use features::{
    descriptor_distance, Descriptor, FeatureSet, DESCRIPTOR_BYTES, KeyPoint, ScalePyramid, MAX_DESCRIPTOR_DISTANCE,
    TH_HIGH, TH_LOW,
};
pub use grid::FeatureGrid;
pub use tracking_frame::{Frame, FrustumProjection};
