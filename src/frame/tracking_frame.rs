//! Tracking `Frame` representation.
//!
//! A `Frame` is the transient view being tracked: it owns its features,
//! optional stereo depth, an optional pose estimate, a Bag-of-Words
//! representation and the per-keypoint landmark association table that
//! projection and BoW searches fill in.

use nalgebra::Vector3;

use crate::geometry::SE3;
use crate::map::{MapPoint, MapPointId};
use crate::vocabulary::{BowVector, FeatureVector, OrbVocabulary};

use super::camera::CameraModel;
use super::features::{Descriptor, FeatureSet, KeyPoint, ScalePyramid};
use super::grid::FeatureGrid;

/// Where a landmark is expected to appear in a frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrustumProjection {
    /// Projected pixel x.
    pub u: f64,
    /// Projected pixel y.
    pub v: f64,
    /// Projected x in the right image, when the camera has a stereo baseline.
    pub u_right: Option<f64>,
    /// Depth in the camera frame.
    pub depth: f64,
    /// Predicted pyramid level.
    pub predicted_level: usize,
    /// Cosine between the viewing ray and the landmark's mean normal.
    pub view_cos: f64,
}

/// A frame being tracked (not yet a KeyFrame).
#[derive(Clone)]
pub struct Frame {
    pub id: u64,
    /// Timestamp in nanoseconds.
    pub timestamp_ns: u64,
    /// Visual features (left image in stereo).
    pub features: FeatureSet,
    /// 3D points in camera frame (from stereo triangulation).
    /// None if the point couldn't be triangulated.
    pub points_cam: Vec<Option<Vector3<f64>>>,
    pub camera: CameraModel,
    pub pyramid: ScalePyramid,
    /// Camera-to-world pose estimate (T_wc), once one is available.
    pub pose: Option<SE3>,
    pub bow_vector: Option<BowVector>,
    pub feature_vector: Option<FeatureVector>,
    /// Temporary MapPoint associations for tracking:
    /// map_point_matches[i] = Some(mp_id) if feature i is associated.
    pub map_point_matches: Vec<Option<MapPointId>>,
    /// Associations rejected by pose optimization.
    pub outliers: Vec<bool>,
    grid: FeatureGrid,
}

impl Frame {
    /// Construct a new tracking frame.
    ///
    /// `points_cam` is padded with `None` to the number of keypoints.
    pub fn new(
        id: u64,
        timestamp_ns: u64,
        camera: CameraModel,
        pyramid: ScalePyramid,
        features: FeatureSet,
        mut points_cam: Vec<Option<Vector3<f64>>>,
    ) -> Self {
        let n_feats = features.len();
        points_cam.resize(n_feats, None);
        let grid = FeatureGrid::new(&features.keypoints, camera.width, camera.height);
        Self {
            id,
            timestamp_ns,
            features,
            points_cam,
            camera,
            pyramid,
            pose: None,
            bow_vector: None,
            feature_vector: None,
            map_point_matches: vec![None; n_feats],
            outliers: vec![false; n_feats],
            grid,
        }
    }

    pub fn with_pose(mut self, pose: SE3) -> Self {
        self.pose = Some(pose);
        self
    }

    /// Number of features in this frame.
    pub fn num_features(&self) -> usize {
        self.features.len()
    }

    pub fn keypoints(&self) -> &[KeyPoint] {
        &self.features.keypoints
    }

    pub fn keypoint(&self, idx: usize) -> Option<&KeyPoint> {
        self.features.keypoints.get(idx)
    }

    pub fn descriptor(&self, idx: usize) -> Option<&Descriptor> {
        self.features.descriptors.get(idx)
    }

    pub fn depth(&self, idx: usize) -> Option<f64> {
        self.points_cam.get(idx).copied().flatten().map(|p| p.z)
    }

    /// Horizontal coordinate of keypoint `idx` in the right image.
    pub fn right_u(&self, idx: usize) -> Option<f64> {
        let kp = self.keypoint(idx)?;
        let depth = self.depth(idx)?;
        (depth > 0.0).then(|| self.camera.right_u(kp.x, depth))
    }

    /// World-to-camera transform, if the pose is known.
    pub fn pose_cw(&self) -> Option<SE3> {
        self.pose.map(|p| p.inverse())
    }

    pub fn camera_center(&self) -> Option<Vector3<f64>> {
        self.pose.map(|p| p.translation)
    }

    /// Compute and store the Bag-of-Words representation.
    pub fn compute_bow(&mut self, vocabulary: &OrbVocabulary, levels_up: usize) {
        if self.feature_vector.is_some() {
            return;
        }
        let (bow, fv) = vocabulary.transform(&self.features.descriptors, levels_up);
        self.bow_vector = Some(bow);
        self.feature_vector = Some(fv);
    }

    /// Number of keypoints currently associated with a landmark.
    pub fn num_tracked(&self) -> usize {
        self.map_point_matches.iter().filter(|m| m.is_some()).count()
    }

    /// Get features within a radius around a point, optionally level-filtered.
    pub fn get_features_in_area(
        &self,
        u: f64,
        v: f64,
        radius: f64,
        min_level: Option<usize>,
        max_level: Option<usize>,
    ) -> Vec<usize> {
        self.grid
            .get_features_in_area(u, v, radius, min_level, max_level, &self.features.keypoints)
    }

    /// Check whether a landmark should be visible from this frame.
    ///
    /// Requires a pose. The landmark must be in front of the camera, project
    /// inside the image, lie within its scale-invariance distance range and be
    /// viewed at an angle whose cosine to its mean normal is at least
    /// `view_cos_limit`.
    pub fn is_in_frustum(&self, mp: &MapPoint, view_cos_limit: f64) -> Option<FrustumProjection> {
        let pose = self.pose?;
        let p_cam = pose.inverse().transform_point(&mp.position);
        let (u, v) = self.camera.project(&p_cam)?;
        if !self.camera.is_in_image(u, v) {
            return None;
        }

        let po = mp.position - pose.translation;
        let distance = po.norm();
        if distance < mp.min_distance_invariance() || distance > mp.max_distance_invariance() {
            return None;
        }

        let view_cos = po.dot(&mp.normal) / distance;
        if view_cos < view_cos_limit {
            return None;
        }

        let u_right = (self.camera.baseline > 0.0).then(|| self.camera.right_u(u, p_cam.z));

        Some(FrustumProjection {
            u,
            v,
            u_right,
            depth: p_cam.z,
            predicted_level: mp.predict_scale(distance, &self.pyramid),
            view_cos,
        })
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("id", &self.id)
            .field("num_features", &self.num_features())
            .field("num_tracked", &self.num_tracked())
            .field("has_pose", &self.pose.is_some())
            .finish()
    }
}
