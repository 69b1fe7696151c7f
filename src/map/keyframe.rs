//! KeyFrame - A stored camera view with pose, features and landmark associations.

use nalgebra::Vector3;

use crate::frame::{CameraModel, Descriptor, FeatureGrid, FeatureSet, KeyPoint, ScalePyramid};
use crate::geometry::SE3;
use crate::vocabulary::{BowVector, FeatureVector};

use super::types::{KeyFrameId, MapPointId};

/// A KeyFrame in the map.
#[derive(Clone)]
pub struct KeyFrame {
    /// Unique identifier for this KeyFrame.
    pub id: KeyFrameId,

    /// Pose: transform from camera to world (T_wc).
    /// To transform a point from camera to world: p_world = pose.transform_point(p_cam)
    pub pose: SE3,

    /// Intrinsics of the camera that captured this view.
    pub camera: CameraModel,

    /// Scale pyramid the features were extracted with.
    pub pyramid: ScalePyramid,

    // ─────────────────────────────────────────────────────────────────────────
    // Visual Features
    // ─────────────────────────────────────────────────────────────────────────
    /// Keypoints and descriptors (left image in stereo).
    pub features: FeatureSet,

    /// 3D points in camera frame (from stereo or depth).
    /// None if the keypoint has no depth measurement.
    pub points_cam: Vec<Option<Vector3<f64>>>,

    /// Bag-of-Words representation.
    pub bow_vector: Option<BowVector>,

    /// Feature indices grouped by vocabulary node, used for BoW-restricted search.
    pub feature_vector: Option<FeatureVector>,

    grid: FeatureGrid,

    // ─────────────────────────────────────────────────────────────────────────
    // Map Associations
    // ─────────────────────────────────────────────────────────────────────────
    /// Feature index → MapPoint association.
    pub map_point_ids: Vec<Option<MapPointId>>,

    /// Whether this KeyFrame is marked as bad.
    pub is_bad: bool,
}

impl KeyFrame {
    /// Create a new KeyFrame.
    ///
    /// # Arguments
    /// * `id` - Unique identifier
    /// * `pose` - Camera-to-world transform (T_wc)
    /// * `camera` - Camera intrinsics
    /// * `pyramid` - Scale pyramid of the feature extractor
    /// * `features` - Keypoints and descriptors
    /// * `points_cam` - Per-keypoint 3D points in camera frame (may be empty for monocular)
    pub fn new(
        id: KeyFrameId,
        pose: SE3,
        camera: CameraModel,
        pyramid: ScalePyramid,
        features: FeatureSet,
        mut points_cam: Vec<Option<Vector3<f64>>>,
    ) -> Self {
        let num_features = features.len();
        points_cam.resize(num_features, None);
        let grid = FeatureGrid::new(&features.keypoints, camera.width, camera.height);

        Self {
            id,
            pose,
            camera,
            pyramid,
            features,
            points_cam,
            bow_vector: None,
            feature_vector: None,
            grid,
            map_point_ids: vec![None; num_features],
            is_bad: false,
        }
    }

    /// Get the camera position in world frame.
    pub fn camera_center(&self) -> Vector3<f64> {
        self.pose.translation
    }

    /// Get the world-to-camera transform (T_cw).
    pub fn pose_cw(&self) -> SE3 {
        self.pose.inverse()
    }

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

    /// Depth of keypoint `idx`, if it has a stereo/depth measurement.
    pub fn depth(&self, idx: usize) -> Option<f64> {
        self.points_cam.get(idx).copied().flatten().map(|p| p.z)
    }

    /// Horizontal coordinate of keypoint `idx` in the right image.
    pub fn right_u(&self, idx: usize) -> Option<f64> {
        let kp = self.keypoint(idx)?;
        let depth = self.depth(idx)?;
        (depth > 0.0).then(|| self.camera.right_u(kp.x, depth))
    }

    /// Store the Bag-of-Words representation computed by a vocabulary.
    pub fn set_bow(&mut self, bow: BowVector, feature_vector: FeatureVector) {
        self.bow_vector = Some(bow);
        self.feature_vector = Some(feature_vector);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Map Point Associations
    // ─────────────────────────────────────────────────────────────────────────

    /// Get the MapPoint ID for a given feature index.
    pub fn get_map_point(&self, feature_idx: usize) -> Option<MapPointId> {
        self.map_point_ids.get(feature_idx).copied().flatten()
    }

    /// Associate a feature with a MapPoint.
    ///
    /// Returns the previous MapPoint ID if there was one.
    pub fn set_map_point(&mut self, feature_idx: usize, mp_id: MapPointId) -> Option<MapPointId> {
        self.map_point_ids.get_mut(feature_idx)?.replace(mp_id)
    }

    /// Remove the association for a feature.
    pub fn erase_map_point(&mut self, feature_idx: usize) -> Option<MapPointId> {
        self.map_point_ids.get_mut(feature_idx)?.take()
    }

    /// Get all associated MapPoint IDs with their feature indices.
    pub fn get_map_point_indices(&self) -> impl Iterator<Item = (usize, MapPointId)> + '_ {
        self.map_point_ids
            .iter()
            .enumerate()
            .filter_map(|(idx, mp)| mp.map(|id| (idx, id)))
    }

    /// Count the number of associated MapPoints.
    pub fn num_map_points(&self) -> usize {
        self.map_point_ids.iter().filter(|mp| mp.is_some()).count()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Spatial Queries
    // ─────────────────────────────────────────────────────────────────────────

    /// Get features within a radius around a point.
    ///
    /// # Arguments
    /// * `u` - X coordinate in image
    /// * `v` - Y coordinate in image
    /// * `radius` - Search radius in pixels
    /// * `min_level` - Minimum pyramid level (inclusive), or None for no minimum
    /// * `max_level` - Maximum pyramid level (inclusive), or None for no maximum
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
}

impl std::fmt::Debug for KeyFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyFrame")
            .field("id", &self.id)
            .field("num_features", &self.num_features())
            .field("num_map_points", &self.num_map_points())
            .field("has_bow", &self.feature_vector.is_some())
            .field("is_bad", &self.is_bad)
            .finish()
    }
}
