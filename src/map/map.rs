//! Map - Container for KeyFrames and MapPoints.
//!
//! The Map owns every KeyFrame and MapPoint and keeps the bipartite
//! KeyFrame ↔ MapPoint association consistent in both directions. Matching
//! code receives it by reference and resolves handles through it.

use std::collections::HashMap;

use nalgebra::Vector3;

use crate::frame::{descriptor_distance, CameraModel, Descriptor, FeatureSet, KeyPoint, ScalePyramid};
use crate::geometry::SE3;

use super::keyframe::KeyFrame;
use super::map_point::MapPoint;
use super::types::{KeyFrameId, MapPointId};

/// The map containing KeyFrames and MapPoints.
pub struct Map {
    keyframes: HashMap<KeyFrameId, KeyFrame>,
    map_points: HashMap<MapPointId, MapPoint>,
    next_kf_id: u64,
    next_mp_id: u64,
}

impl Map {
    pub fn new() -> Self {
        Self {
            keyframes: HashMap::new(),
            map_points: HashMap::new(),
            next_kf_id: 0,
            next_mp_id: 0,
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // KeyFrame Operations
    // ─────────────────────────────────────────────────────────────────────────

    /// Create and add a new KeyFrame to the map.
    ///
    /// Returns the ID of the created KeyFrame.
    pub fn create_keyframe(
        &mut self,
        pose: SE3,
        camera: CameraModel,
        pyramid: ScalePyramid,
        features: FeatureSet,
        points_cam: Vec<Option<Vector3<f64>>>,
    ) -> KeyFrameId {
        let id = KeyFrameId::new(self.next_kf_id);
        self.next_kf_id += 1;
        let kf = KeyFrame::new(id, pose, camera, pyramid, features, points_cam);
        self.keyframes.insert(id, kf);
        id
    }

    pub fn get_keyframe(&self, id: KeyFrameId) -> Option<&KeyFrame> {
        self.keyframes.get(&id)
    }

    pub fn get_keyframe_mut(&mut self, id: KeyFrameId) -> Option<&mut KeyFrame> {
        self.keyframes.get_mut(&id)
    }

    pub fn num_keyframes(&self) -> usize {
        self.keyframes.len()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // MapPoint Operations
    // ─────────────────────────────────────────────────────────────────────────

    /// Create and add a new MapPoint to the map.
    ///
    /// The point has no observations yet; call [`Map::associate`] to add them.
    pub fn create_map_point(
        &mut self,
        position: Vector3<f64>,
        descriptor: Descriptor,
        first_kf_id: KeyFrameId,
    ) -> MapPointId {
        let id = MapPointId::new(self.next_mp_id);
        self.next_mp_id += 1;
        self.map_points
            .insert(id, MapPoint::new(id, position, descriptor, first_kf_id));
        id
    }

    /// Get a MapPoint by ID, including points marked bad.
    pub fn get_map_point(&self, id: MapPointId) -> Option<&MapPoint> {
        self.map_points.get(&id)
    }

    /// Get a MapPoint by ID only if it is still valid (not bad).
    pub fn get_valid_map_point(&self, id: MapPointId) -> Option<&MapPoint> {
        self.map_points.get(&id).filter(|mp| !mp.is_bad)
    }

    pub fn get_map_point_mut(&mut self, id: MapPointId) -> Option<&mut MapPoint> {
        self.map_points.get_mut(&id)
    }

    pub fn num_map_points(&self) -> usize {
        self.map_points.len()
    }

    /// Follow `replaced_by` links to the landmark that currently stands for `id`.
    pub fn resolve_map_point(&self, id: MapPointId) -> Option<MapPointId> {
        let mut current = id;
        // Bounded walk; a merge chain can never be longer than the map.
        for _ in 0..=self.map_points.len() {
            let mp = self.map_points.get(&current)?;
            match mp.replaced_by {
                Some(next) if mp.is_bad => current = next,
                _ => return (!mp.is_bad).then_some(current),
            }
        }
        None
    }

    /// Mark a MapPoint bad and drop all of its observations.
    pub fn set_map_point_bad(&mut self, mp_id: MapPointId) {
        let observations: Vec<(KeyFrameId, usize)> = match self.map_points.get_mut(&mp_id) {
            Some(mp) => {
                mp.set_bad();
                mp.observations.drain().collect()
            }
            None => return,
        };

        for (kf_id, feat_idx) in observations {
            if let Some(kf) = self.keyframes.get_mut(&kf_id) {
                if kf.get_map_point(feat_idx) == Some(mp_id) {
                    kf.erase_map_point(feat_idx);
                }
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Association (KF ↔ MP)
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a bidirectional association between a KeyFrame feature and a MapPoint.
    ///
    /// Returns true if the association was created. Fails when either entity is
    /// missing, the MapPoint is bad, or the feature index is out of range.
    pub fn associate(&mut self, kf_id: KeyFrameId, feature_idx: usize, mp_id: MapPointId) -> bool {
        let valid_index = self
            .keyframes
            .get(&kf_id)
            .is_some_and(|kf| feature_idx < kf.num_features());
        if !valid_index {
            return false;
        }

        match self.map_points.get_mut(&mp_id) {
            Some(mp) if !mp.is_bad => mp.add_observation(kf_id, feature_idx),
            _ => return false,
        }

        if let Some(kf) = self.keyframes.get_mut(&kf_id) {
            kf.set_map_point(feature_idx, mp_id);
        }
        true
    }

    /// Remove the association between a KeyFrame feature and its MapPoint.
    ///
    /// Returns the MapPoint ID that was disassociated, if any.
    pub fn disassociate(&mut self, kf_id: KeyFrameId, feature_idx: usize) -> Option<MapPointId> {
        let mp_id = self.keyframes.get_mut(&kf_id)?.erase_map_point(feature_idx)?;
        if let Some(mp) = self.map_points.get_mut(&mp_id) {
            mp.erase_observation(kf_id);
        }
        Some(mp_id)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Map Maintenance
    // ─────────────────────────────────────────────────────────────────────────

    /// The reference observation of a MapPoint: the one in `first_kf_id` when
    /// that KeyFrame still observes it, otherwise the lowest-id observer.
    pub fn reference_observation(&self, mp: &MapPoint) -> Option<(&KeyFrame, usize)> {
        let kf_id = if mp.observations.contains_key(&mp.first_kf_id) {
            mp.first_kf_id
        } else {
            *mp.observations.keys().min()?
        };
        let idx = *mp.observations.get(&kf_id)?;
        Some((self.keyframes.get(&kf_id)?, idx))
    }

    /// Keypoint of the reference observation of a MapPoint.
    pub fn reference_keypoint(&self, mp_id: MapPointId) -> Option<&KeyPoint> {
        let (kf, idx) = self.reference_observation(self.map_points.get(&mp_id)?)?;
        kf.keypoint(idx)
    }

    /// Update the normal and depth bounds for a MapPoint, using the pyramid
    /// level of its reference observation.
    pub fn update_map_point_normal_and_depth(&mut self, mp_id: MapPointId) {
        let Some(mp) = self.map_points.get(&mp_id) else {
            return;
        };
        if mp.is_bad || mp.observations.is_empty() {
            return;
        }

        let centers: Vec<Vector3<f64>> = mp
            .observations
            .keys()
            .filter_map(|kf_id| self.keyframes.get(kf_id))
            .map(|kf| kf.camera_center())
            .collect();

        let reference = self.reference_observation(mp).and_then(|(kf, idx)| {
            let level = kf.keypoint(idx)?.octave;
            Some((kf.camera_center(), level, kf.pyramid.clone()))
        });

        let Some((ref_center, ref_level, pyramid)) = reference else {
            return;
        };

        if let Some(mp) = self.map_points.get_mut(&mp_id) {
            mp.update_normal_and_depth(centers.iter(), &ref_center, ref_level, &pyramid);
        }
    }

    /// Recompute the representative descriptor of a MapPoint.
    ///
    /// Picks the observation descriptor with the smallest summed distance to
    /// all other observation descriptors, the earliest observation winning a
    /// tie. Returns true if it changed.
    pub fn compute_distinctive_descriptor(&mut self, mp_id: MapPointId) -> bool {
        let Some(mp) = self.map_points.get(&mp_id) else {
            return false;
        };
        if mp.is_bad {
            return false;
        }

        let mut observations: Vec<(KeyFrameId, usize)> =
            mp.observations.iter().map(|(&kf, &idx)| (kf, idx)).collect();
        observations.sort();

        let descriptors: Vec<Descriptor> = observations
            .iter()
            .filter_map(|(kf_id, idx)| {
                let kf = self.keyframes.get(kf_id)?;
                if kf.is_bad {
                    return None;
                }
                kf.descriptor(*idx).copied()
            })
            .collect();

        if descriptors.is_empty() {
            return false;
        }

        let mut best_sum = u32::MAX;
        let mut best_idx = 0;
        for (i, di) in descriptors.iter().enumerate() {
            let sum: u32 = descriptors.iter().map(|dj| descriptor_distance(di, dj)).sum();
            if sum < best_sum {
                best_sum = sum;
                best_idx = i;
            }
        }

        let best = descriptors[best_idx];
        match self.map_points.get_mut(&mp_id) {
            Some(mp) if mp.descriptor != best => {
                mp.descriptor = best;
                true
            }
            _ => false,
        }
    }

    /// Merge `goner` into `keeper`.
    ///
    /// Every observation of `goner` moves to `keeper`, except in KeyFrames
    /// that already observe `keeper`, where the duplicate feature is released.
    /// `goner` is marked bad and linked to `keeper` via `replaced_by`.
    ///
    /// Returns true if the merge happened.
    pub fn merge_map_points(&mut self, keeper: MapPointId, goner: MapPointId) -> bool {
        if keeper == goner {
            return false;
        }
        let keeper_valid = self.get_valid_map_point(keeper).is_some();
        let observations: Vec<(KeyFrameId, usize)> = match self.map_points.get_mut(&goner) {
            Some(mp) if keeper_valid && !mp.is_bad => {
                mp.set_bad();
                mp.replaced_by = Some(keeper);
                mp.observations.drain().collect()
            }
            _ => return false,
        };

        for (kf_id, feat_idx) in observations {
            let keeper_seen = self
                .map_points
                .get(&keeper)
                .is_some_and(|mp| mp.is_in_keyframe(kf_id));

            let Some(kf) = self.keyframes.get_mut(&kf_id) else {
                continue;
            };
            if keeper_seen {
                if kf.get_map_point(feat_idx) == Some(goner) {
                    kf.erase_map_point(feat_idx);
                }
            } else {
                kf.set_map_point(feat_idx, keeper);
                if let Some(mp) = self.map_points.get_mut(&keeper) {
                    mp.add_observation(kf_id, feat_idx);
                }
            }
        }

        self.compute_distinctive_descriptor(keeper);
        self.update_map_point_normal_and_depth(keeper);
        true
    }

    /// Merge two landmarks found to be duplicates, keeping the better observed one.
    ///
    /// Returns the surviving landmark.
    pub fn fuse_duplicates(&mut self, a: MapPointId, b: MapPointId) -> Option<MapPointId> {
        let obs_a = self.get_valid_map_point(a)?.num_observations();
        let obs_b = self.get_valid_map_point(b)?.num_observations();
        let (keeper, goner) = if obs_a >= obs_b { (a, b) } else { (b, a) };
        self.merge_map_points(keeper, goner).then_some(keeper)
    }
}

impl Default for Map {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Map {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Map")
            .field("num_keyframes", &self.keyframes.len())
            .field("num_map_points", &self.map_points.len())
            .finish()
    }
}
