//! Vocabulary-restricted search.
//!
//! Only descriptors filed under the same vocabulary node are compared, so a
//! pose is not needed. Used for relocalization and loop detection, and as
//! the candidate source for triangulation.

use tracing::debug;

use crate::frame::{descriptor_distance, Frame};
use crate::map::{KeyFrame, Map, MapPointId};
use crate::vocabulary::FeatureVector;

use super::{BestTwo, OrbMatcher, TargetClaims};

/// Feature index lists of every node present in both feature vectors, in
/// node order.
pub(crate) fn shared_nodes<'a>(
    a: &'a FeatureVector,
    b: &'a FeatureVector,
) -> impl Iterator<Item = (&'a [usize], &'a [usize])> + 'a {
    a.iter()
        .filter_map(move |(node, indices_a)| b.get(node).map(|indices_b| (indices_a.as_slice(), indices_b.as_slice())))
}

impl OrbMatcher {
    /// Match a keyframe's landmarks to the keypoints of a frame.
    ///
    /// Requires both feature vectors. The keyframe's keypoint descriptors
    /// are compared; matches within `th_low` that pass the ratio test are
    /// written into `frame.map_point_matches`.
    ///
    /// # Returns
    /// Number of new associations.
    pub fn search_by_bow_frame(&self, kf: &KeyFrame, frame: &mut Frame, map: &Map) -> usize {
        let (Some(fv_kf), Some(fv_frame)) = (kf.feature_vector.as_ref(), frame.feature_vector.as_ref())
        else {
            debug!("[SearchByBoW] kf={} frame={}: missing feature vector", kf.id, frame.id);
            return 0;
        };

        let tracked: std::collections::HashSet<MapPointId> = frame
            .map_point_matches
            .iter()
            .flatten()
            .filter(|id| map.get_valid_map_point(**id).is_some())
            .copied()
            .collect();
        let mut claims = TargetClaims::new(frame.num_features());

        for (kf_indices, frame_indices) in shared_nodes(fv_kf, fv_frame) {
            for &idx_kf in kf_indices {
                let Some(mp_id) = kf.get_map_point(idx_kf) else {
                    continue;
                };
                if tracked.contains(&mp_id) || map.get_valid_map_point(mp_id).is_none() {
                    continue;
                }
                let Some(d_kf) = kf.descriptor(idx_kf) else {
                    continue;
                };

                let mut best = BestTwo::new();
                for &idx_f in frame_indices {
                    let occupied = frame
                        .map_point_matches
                        .get(idx_f)
                        .copied()
                        .flatten()
                        .is_some_and(|id| map.get_valid_map_point(id).is_some());
                    if occupied {
                        continue;
                    }
                    let (Some(kp), Some(d_f)) = (frame.keypoint(idx_f), frame.descriptor(idx_f)) else {
                        continue;
                    };
                    best.update(idx_f, descriptor_distance(d_kf, d_f), kp.octave);
                }

                let Some(best_idx) = best.best_idx else {
                    continue;
                };
                if best.best_dist <= self.config.th_low && self.passes_strict_ratio(best.best_dist, best.second_dist) {
                    claims.claim(best_idx, idx_kf, best.best_dist);
                }
            }
        }

        let mut matches = claims.into_matches();
        let rejected = self.filter_orientation(&mut matches, |m| {
            Some(kf.keypoint(m.source)?.angle - frame.keypoint(m.target)?.angle)
        });

        for m in &matches {
            if let Some(slot) = frame.map_point_matches.get_mut(m.target) {
                *slot = kf.get_map_point(m.source);
            }
        }

        debug!(
            "[SearchByBoW] kf={} frame={}: {} matched, {} rejected by rotation",
            kf.id,
            frame.id,
            matches.len(),
            rejected
        );
        matches.len()
    }

    /// Match landmarks between two keyframes.
    ///
    /// Only keypoints that carry a valid landmark on both sides take part.
    ///
    /// # Returns
    /// A vector indexed by `kf1`'s keypoints holding the matched landmark of `kf2`.
    pub fn search_by_bow_keyframes(&self, kf1: &KeyFrame, kf2: &KeyFrame, map: &Map) -> Vec<Option<MapPointId>> {
        let mut matches12 = vec![None; kf1.num_features()];
        let (Some(fv1), Some(fv2)) = (kf1.feature_vector.as_ref(), kf2.feature_vector.as_ref()) else {
            debug!("[SearchByBoW] kf={} kf={}: missing feature vector", kf1.id, kf2.id);
            return matches12;
        };

        let has_valid_landmark =
            |kf: &KeyFrame, idx: usize| kf.get_map_point(idx).is_some_and(|id| map.get_valid_map_point(id).is_some());
        let mut claims = TargetClaims::new(kf2.num_features());

        for (indices1, indices2) in shared_nodes(fv1, fv2) {
            for &idx1 in indices1 {
                if !has_valid_landmark(kf1, idx1) {
                    continue;
                }
                let Some(d1) = kf1.descriptor(idx1) else {
                    continue;
                };

                let mut best = BestTwo::new();
                for &idx2 in indices2 {
                    if !has_valid_landmark(kf2, idx2) {
                        continue;
                    }
                    let (Some(kp2), Some(d2)) = (kf2.keypoint(idx2), kf2.descriptor(idx2)) else {
                        continue;
                    };
                    best.update(idx2, descriptor_distance(d1, d2), kp2.octave);
                }

                let Some(best_idx) = best.best_idx else {
                    continue;
                };
                if best.best_dist <= self.config.th_low && self.passes_strict_ratio(best.best_dist, best.second_dist) {
                    claims.claim(best_idx, idx1, best.best_dist);
                }
            }
        }

        let mut matches = claims.into_matches();
        let rejected = self.filter_orientation(&mut matches, |m| {
            Some(kf1.keypoint(m.source)?.angle - kf2.keypoint(m.target)?.angle)
        });

        for m in &matches {
            matches12[m.source] = kf2.get_map_point(m.target);
        }

        debug!(
            "[SearchByBoW] kf={} kf={}: {} matched, {} rejected by rotation",
            kf1.id,
            kf2.id,
            matches.len(),
            rejected
        );
        matches12
    }
}
