//! Search for new keypoint pairs to triangulate between two keyframes.

use tracing::debug;

use crate::frame::descriptor_distance;
use crate::geometry::compute_f12;
use crate::map::{KeyFrame, Map};

use super::bow::shared_nodes;
use super::{OrbMatcher, TargetClaims};

impl OrbMatcher {
    /// Find unmatched keypoint pairs between two keyframes that satisfy the
    /// epipolar constraint.
    ///
    /// Candidates come from shared vocabulary nodes, and keypoints that
    /// already carry a valid landmark are skipped on both sides. Pairs within
    /// `th_low` must lie in the epipolar band of `kf2`. When neither keypoint
    /// has depth, candidates too close to the epipole are also rejected
    /// (their parallax is too small), unless `coarse` is set.
    ///
    /// # Arguments
    /// * `kf1`, `kf2` - Keyframes with feature vectors
    /// * `map` - Map resolving landmark validity
    /// * `only_stereo` - Require depth on at least one of the two keypoints
    /// * `coarse` - Skip the near-epipole rejection
    ///
    /// # Returns
    /// `(idx1, idx2)` pairs ordered by `idx1`.
    pub fn search_for_triangulation(
        &self,
        kf1: &KeyFrame,
        kf2: &KeyFrame,
        map: &Map,
        only_stereo: bool,
        coarse: bool,
    ) -> Vec<(usize, usize)> {
        let (Some(fv1), Some(fv2)) = (kf1.feature_vector.as_ref(), kf2.feature_vector.as_ref()) else {
            debug!("[SearchForTriangulation] kf={} kf={}: missing feature vector", kf1.id, kf2.id);
            return Vec::new();
        };
        let Some(f12) = compute_f12(&kf1.pose, &kf2.pose, &kf1.camera.k_matrix(), &kf2.camera.k_matrix())
        else {
            return Vec::new();
        };

        // Camera center of kf1 seen from kf2; none when it lies behind kf2
        let epipole = kf2.camera.project(&kf2.pose_cw().transform_point(&kf1.camera_center()));
        let min_epipole_dist_sq = self.config.min_epipole_distance * self.config.min_epipole_distance;

        let has_valid_landmark = |kf: &KeyFrame, idx: usize| {
            kf.get_map_point(idx)
                .is_some_and(|id| map.get_valid_map_point(id).is_some())
        };
        let mut claims = TargetClaims::new(kf2.num_features());

        for (indices1, indices2) in shared_nodes(fv1, fv2) {
            for &idx1 in indices1 {
                if has_valid_landmark(kf1, idx1) {
                    continue;
                }
                let (Some(kp1), Some(d1)) = (kf1.keypoint(idx1), kf1.descriptor(idx1)) else {
                    continue;
                };
                let stereo1 = kf1.depth(idx1).is_some();

                let mut best: Option<(usize, u32)> = None;
                for &idx2 in indices2 {
                    if has_valid_landmark(kf2, idx2) {
                        continue;
                    }
                    let (Some(kp2), Some(d2)) = (kf2.keypoint(idx2), kf2.descriptor(idx2)) else {
                        continue;
                    };
                    let stereo2 = kf2.depth(idx2).is_some();
                    if only_stereo && !stereo1 && !stereo2 {
                        continue;
                    }

                    let dist = descriptor_distance(d1, d2);
                    if dist > self.config.th_low || best.is_some_and(|(_, d)| dist >= d) {
                        continue;
                    }

                    if !coarse && !stereo1 && !stereo2 {
                        if let Some((ex, ey)) = epipole {
                            let dx = ex - kp2.x;
                            let dy = ey - kp2.y;
                            if dx * dx + dy * dy < min_epipole_dist_sq * kf2.pyramid.scale(kp2.octave) {
                                continue;
                            }
                        }
                    }

                    if !self.check_dist_epipolar_line(kp1, kp2, &f12, &kf2.pyramid) {
                        continue;
                    }
                    best = Some((idx2, dist));
                }

                if let Some((idx2, dist)) = best {
                    claims.claim(idx2, idx1, dist);
                }
            }
        }

        let mut matches = claims.into_matches();
        let rejected = self.filter_orientation(&mut matches, |m| {
            Some(kf1.keypoint(m.source)?.angle - kf2.keypoint(m.target)?.angle)
        });

        debug!(
            "[SearchForTriangulation] kf={} kf={}: {} pairs, {} rejected by rotation",
            kf1.id,
            kf2.id,
            matches.len(),
            rejected
        );
        matches.into_iter().map(|m| (m.source, m.target)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use nalgebra::Vector3;

    use crate::frame::ScalePyramid;
    use crate::geometry::SE3;
    use crate::map::KeyFrameId;
    use crate::test_support::*;

    fn two_views(
        positions: &[Vector3<f64>],
        pose2: SE3,
        points_cam1: Vec<Option<Vector3<f64>>>,
    ) -> (Map, KeyFrameId, KeyFrameId) {
        let mut map = Map::new();
        let n = positions.len();
        let pose1 = SE3::identity();
        let kf1 = map.create_keyframe(
            pose1,
            camera(),
            ScalePyramid::default(),
            observe(&camera(), &pose1, positions, 0.0),
            points_cam1,
        );
        let kf2 = map.create_keyframe(
            pose2,
            camera(),
            ScalePyramid::default(),
            observe(&camera(), &pose2, positions, 0.0),
            vec![],
        );
        for kf in [kf1, kf2] {
            map.get_keyframe_mut(kf)
                .unwrap()
                .set_bow(HashMap::new(), one_node_per_feature(n, 0));
        }
        (map, kf1, kf2)
    }

    fn search(map: &Map, kf1: KeyFrameId, kf2: KeyFrameId, only_stereo: bool, coarse: bool) -> Vec<(usize, usize)> {
        OrbMatcher::default().search_for_triangulation(
            map.get_keyframe(kf1).unwrap(),
            map.get_keyframe(kf2).unwrap(),
            map,
            only_stereo,
            coarse,
        )
    }

    #[test]
    fn test_true_pairs_found() {
        let positions = scene_points(10);
        let (map, kf1, kf2) = two_views(&positions, SE3::from_translation(Vector3::new(0.5, 0.0, 0.0)), vec![]);
        let pairs = search(&map, kf1, kf2, false, false);
        assert_eq!(pairs, (0..10).map(|i| (i, i)).collect::<Vec<(usize, usize)>>());
    }

    #[test]
    fn test_pair_off_epipolar_line_rejected() {
        let positions = scene_points(10);
        let (mut map, kf1, kf2) =
            two_views(&positions, SE3::from_translation(Vector3::new(0.5, 0.0, 0.0)), vec![]);
        // Identical descriptor, but 10 px off the (horizontal) epipolar line
        map.get_keyframe_mut(kf2).unwrap().features.keypoints[3].y += 10.0;

        let pairs = search(&map, kf1, kf2, false, false);
        assert_eq!(pairs.len(), 9);
        assert!(!pairs.contains(&(3, 3)));
    }

    #[test]
    fn test_keypoints_with_landmarks_are_skipped() {
        let positions = scene_points(6);
        let (mut map, kf1, kf2) =
            two_views(&positions, SE3::from_translation(Vector3::new(0.5, 0.0, 0.0)), vec![]);
        let mp1 = map.create_map_point(positions[0], descriptor(1), kf1);
        map.associate(kf1, 0, mp1);
        let mp2 = map.create_map_point(positions[4], descriptor(5), kf2);
        map.associate(kf2, 4, mp2);

        let pairs = search(&map, kf1, kf2, false, false);
        assert_eq!(pairs, vec![(1, 1), (2, 2), (3, 3), (5, 5)]);

        // A bad landmark frees its keypoint again
        map.set_map_point_bad(mp2);
        assert_eq!(search(&map, kf1, kf2, false, false).len(), 5);
    }

    #[test]
    fn test_near_epipole_rejected_unless_coarse() {
        // Forward motion puts the epipole at the principal point.
        let positions = vec![Vector3::new(0.0, 0.05, 5.0), Vector3::new(1.0, 0.5, 5.0)];
        let (map, kf1, kf2) = two_views(&positions, SE3::from_translation(Vector3::new(0.0, 0.0, -1.0)), vec![]);

        assert_eq!(search(&map, kf1, kf2, false, false), vec![(1, 1)]);
        assert_eq!(search(&map, kf1, kf2, false, true), vec![(0, 0), (1, 1)]);
    }

    #[test]
    fn test_only_stereo() {
        let positions = scene_points(5);
        let mut points_cam1 = vec![None; 5];
        points_cam1[2] = Some(positions[2]);
        let (map, kf1, kf2) =
            two_views(&positions, SE3::from_translation(Vector3::new(0.5, 0.0, 0.0)), points_cam1);

        assert_eq!(search(&map, kf1, kf2, true, false), vec![(2, 2)]);
        assert_eq!(search(&map, kf1, kf2, false, false).len(), 5);
    }

    #[test]
    fn test_missing_feature_vector() {
        let positions = scene_points(5);
        let (mut map, kf1, kf2) =
            two_views(&positions, SE3::from_translation(Vector3::new(0.5, 0.0, 0.0)), vec![]);
        map.get_keyframe_mut(kf2).unwrap().feature_vector = None;
        assert!(search(&map, kf1, kf2, false, false).is_empty());
    }
}
