//! MapPoint - A 3D landmark observed by KeyFrames.
//!
//! The matcher reads a landmark's position, representative descriptor,
//! viewing normal and scale-invariance distance range. Observations are
//! only changed through [`Map`](super::Map) so both sides stay in sync.

use std::collections::HashMap;

use nalgebra::Vector3;

use crate::frame::{Descriptor, ScalePyramid};

use super::types::{KeyFrameId, MapPointId};

/// A 3D map point (landmark) observed by one or more KeyFrames.
#[derive(Clone)]
pub struct MapPoint {
    /// Unique identifier for this MapPoint.
    pub id: MapPointId,

    /// 3D position in world frame.
    pub position: Vector3<f64>,

    /// Representative ORB descriptor: the observation with the smallest
    /// summed distance to all other observations.
    pub descriptor: Descriptor,

    /// KeyFrames observing this point, mapped to feature index in that KeyFrame.
    pub observations: HashMap<KeyFrameId, usize>,

    /// Mean viewing direction (unit vector, world frame).
    pub normal: Vector3<f64>,

    /// Minimum distance at which this point can be reliably observed.
    pub min_distance: f64,

    /// Maximum distance at which this point can be reliably observed.
    pub max_distance: f64,

    /// KeyFrame that first created this MapPoint (reference frame).
    pub first_kf_id: KeyFrameId,

    /// Whether this point is marked as bad.
    pub is_bad: bool,

    /// Landmark that absorbed this one in a merge.
    pub replaced_by: Option<MapPointId>,
}

impl MapPoint {
    /// Create a new MapPoint.
    ///
    /// # Arguments
    /// * `id` - Unique identifier
    /// * `position` - 3D position in world frame
    /// * `descriptor` - ORB descriptor of the creating observation
    /// * `first_kf_id` - KeyFrame that created this point
    pub fn new(
        id: MapPointId,
        position: Vector3<f64>,
        descriptor: Descriptor,
        first_kf_id: KeyFrameId,
    ) -> Self {
        Self {
            id,
            position,
            descriptor,
            observations: HashMap::new(),
            normal: Vector3::zeros(),
            min_distance: 0.0,
            max_distance: f64::INFINITY,
            first_kf_id,
            is_bad: false,
            replaced_by: None,
        }
    }

    pub fn add_observation(&mut self, kf_id: KeyFrameId, feature_idx: usize) {
        self.observations.insert(kf_id, feature_idx);
    }

    /// Remove an observation.
    ///
    /// Returns true if the observation existed and was removed.
    pub fn erase_observation(&mut self, kf_id: KeyFrameId) -> bool {
        self.observations.remove(&kf_id).is_some()
    }

    pub fn num_observations(&self) -> usize {
        self.observations.len()
    }

    /// Whether a keyframe already observes this point.
    pub fn is_in_keyframe(&self, kf_id: KeyFrameId) -> bool {
        self.observations.contains_key(&kf_id)
    }

    /// Feature index of this point in a keyframe, if observed there.
    pub fn index_in_keyframe(&self, kf_id: KeyFrameId) -> Option<usize> {
        self.observations.get(&kf_id).copied()
    }

    pub fn set_bad(&mut self) {
        self.is_bad = true;
    }

    /// Update the mean normal and the scale-invariance distance range.
    ///
    /// # Arguments
    /// * `observer_centers` - Camera centers of every observing KeyFrame
    /// * `reference_center` - Camera center of the reference KeyFrame
    /// * `reference_level` - Pyramid level of the reference observation
    /// * `pyramid` - Scale pyramid of the reference KeyFrame
    pub fn update_normal_and_depth<'a>(
        &mut self,
        observer_centers: impl Iterator<Item = &'a Vector3<f64>>,
        reference_center: &Vector3<f64>,
        reference_level: usize,
        pyramid: &ScalePyramid,
    ) {
        let mut normal_sum = Vector3::zeros();
        let mut n = 0usize;

        for center in observer_centers {
            let dir = self.position - center;
            let dist = dir.norm();
            if dist > 1e-10 {
                normal_sum += dir / dist;
                n += 1;
            }
        }

        if n > 0 {
            self.normal = normal_sum / n as f64;
        }

        let dist = (self.position - reference_center).norm();
        self.max_distance = dist * pyramid.scale(reference_level);
        self.min_distance = self.max_distance / pyramid.max_scale();
    }

    /// Check if a viewing distance is within the valid range.
    pub fn is_in_distance_range(&self, distance: f64) -> bool {
        distance >= self.min_distance && distance <= self.max_distance
    }

    /// Pyramid level at which this point is expected to appear from `distance`.
    pub fn predict_scale(&self, distance: f64, pyramid: &ScalePyramid) -> usize {
        let ratio = self.max_distance / distance;
        if ratio.is_nan() || ratio <= 1.0 {
            return 0;
        }
        if ratio.is_infinite() {
            return pyramid.max_level();
        }
        let level = (ratio.ln() / pyramid.log_scale_factor()).ceil();
        if level <= 0.0 {
            0
        } else {
            (level as usize).min(pyramid.max_level())
        }
    }

    /// Minimum distance actually used for frustum tests (with ORB-SLAM slack).
    pub fn min_distance_invariance(&self) -> f64 {
        0.8 * self.min_distance
    }

    /// Maximum distance actually used for frustum tests (with ORB-SLAM slack).
    pub fn max_distance_invariance(&self) -> f64 {
        1.2 * self.max_distance
    }
}

impl std::fmt::Debug for MapPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MapPoint")
            .field("id", &self.id)
            .field("position", &self.position)
            .field("observations", &self.observations.len())
            .field("is_bad", &self.is_bad)
            .field("replaced_by", &self.replaced_by)
            .finish()
    }
}
