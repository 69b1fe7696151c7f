//! Bidirectional projection search under a similarity transform.

use tracing::debug;

use nalgebra::Vector3;

use crate::frame::descriptor_distance;
use crate::geometry::Sim3;
use crate::map::{KeyFrame, Map, MapPointId};

use super::OrbMatcher;

impl OrbMatcher {
    /// Extend landmark matches between two keyframes related by `s12`.
    ///
    /// Landmarks of `kf1` not yet matched are projected into `kf2` through
    /// S21, and landmarks of `kf2` into `kf1` through S12. A pair is kept
    /// only when both directions agree.
    ///
    /// # Arguments
    /// * `kf1`, `kf2` - Keyframes being aligned
    /// * `map` - Map resolving the landmark handles
    /// * `matches12` - Per-keypoint matches of `kf1` into `kf2`'s landmarks, extended in place
    /// * `s12` - Similarity mapping `kf2` camera coordinates into `kf1` camera coordinates
    /// * `th` - Window multiplier
    ///
    /// # Returns
    /// Number of new matches.
    pub fn search_by_sim3(
        &self,
        kf1: &KeyFrame,
        kf2: &KeyFrame,
        map: &Map,
        matches12: &mut Vec<Option<MapPointId>>,
        s12: &Sim3,
        th: f64,
    ) -> usize {
        let n1 = kf1.num_features();
        let n2 = kf2.num_features();
        if matches12.len() < n1 {
            matches12.resize(n1, None);
        }
        let s21 = s12.inverse();

        let mut already_matched1 = vec![false; n1];
        let mut already_matched2 = vec![false; n2];
        for (i1, m) in matches12.iter().enumerate().take(n1) {
            if let Some(mp_id) = m {
                already_matched1[i1] = true;
                let idx2 = map
                    .get_map_point(*mp_id)
                    .and_then(|mp| mp.index_in_keyframe(kf2.id));
                if let Some(slot) = idx2.and_then(|i2| already_matched2.get_mut(i2)) {
                    *slot = true;
                }
            }
        }

        let match1 = self.project_for_sim3(kf1, kf2, map, &s21, &already_matched1, th);
        let match2 = self.project_for_sim3(kf2, kf1, map, s12, &already_matched2, th);

        let mut num_found = 0;
        for (i1, m) in match1.iter().enumerate() {
            let Some(i2) = *m else {
                continue;
            };
            if match2.get(i2).copied().flatten() == Some(i1) {
                if let Some(mp2) = kf2.get_map_point(i2) {
                    matches12[i1] = Some(mp2);
                    num_found += 1;
                }
            }
        }

        debug!(
            "[SearchBySim3] kf={} kf={} scale={:.3}: {} new matches",
            kf1.id,
            kf2.id,
            s12.scale,
            num_found
        );
        num_found
    }

    /// Project the unmatched landmarks of `from` into `to` through `s_to_from`
    /// (mapping `from` camera coordinates into `to` camera coordinates).
    ///
    /// Returns, per keypoint of `from`, the best keypoint of `to` within `th_high`.
    fn project_for_sim3(
        &self,
        from: &KeyFrame,
        to: &KeyFrame,
        map: &Map,
        s_to_from: &Sim3,
        skip: &[bool],
        th: f64,
    ) -> Vec<Option<usize>> {
        let from_cw = from.pose_cw();
        let mut result = vec![None; from.num_features()];

        for (idx, mp_id) in from.get_map_point_indices() {
            if skip.get(idx).copied().unwrap_or(false) {
                continue;
            }
            let Some(mp) = map.get_valid_map_point(mp_id) else {
                continue;
            };

            let p_from: Vector3<f64> = from_cw.transform_point(&mp.position);
            let p_to = s_to_from.transform_point(&p_from);
            let Some((u, v)) = to.camera.project(&p_to) else {
                continue;
            };
            if !to.camera.is_in_image(u, v) {
                continue;
            }

            let dist = p_to.norm();
            if dist < mp.min_distance_invariance() || dist > mp.max_distance_invariance() {
                continue;
            }

            let level = mp.predict_scale(dist, &to.pyramid);
            let radius = th * to.pyramid.scale(level);
            let indices =
                to.get_features_in_area(u, v, radius, Some(level.saturating_sub(1)), Some(level));

            let mut best: Option<(usize, u32)> = None;
            for i in indices {
                let Some(d) = to.descriptor(i) else {
                    continue;
                };
                let dist = descriptor_distance(&mp.descriptor, d);
                if best.map_or(true, |(_, b)| dist < b) {
                    best = Some((i, dist));
                }
            }

            if let Some((i, d)) = best {
                if d <= self.config.th_high {
                    result[idx] = Some(i);
                }
            }
        }
        result
    }
}
