//! Projection-based search.
//!
//! Landmarks are projected into a view through a known pose (or a
//! similarity) and compared only against keypoints inside a radius window
//! at plausible pyramid levels. Keypoints that already carry a valid
//! landmark when the call starts are never reassigned, except by the Sim3
//! variants when the new landmark is strictly closer in descriptor space.

use std::collections::HashSet;

use tracing::debug;

use crate::frame::{descriptor_distance, Frame};
use crate::geometry::Sim3;
use crate::map::{KeyFrame, KeyFrameId, Map, MapPointId};

use super::{BestTwo, MatchPair, OrbMatcher, TargetClaims};

/// Valid landmarks the frame already tracks.
fn tracked_landmarks(frame: &Frame, map: &Map) -> HashSet<MapPointId> {
    frame
        .map_point_matches
        .iter()
        .flatten()
        .filter(|id| map.get_valid_map_point(**id).is_some())
        .copied()
        .collect()
}

/// Whether keypoint `idx` carries a landmark that is still valid.
fn is_occupied(matches: &[Option<MapPointId>], idx: usize, map: &Map) -> bool {
    matches
        .get(idx)
        .copied()
        .flatten()
        .is_some_and(|id| map.get_valid_map_point(id).is_some())
}

/// Write accepted matches into a frame's association table.
fn record<F>(frame: &mut Frame, matches: &[MatchPair], id_of: F)
where
    F: Fn(usize) -> Option<MapPointId>,
{
    for m in matches {
        if let Some(slot) = frame.map_point_matches.get_mut(m.target) {
            *slot = id_of(m.source);
        }
    }
}

impl OrbMatcher {
    /// Match local-map landmarks into a frame with a pose estimate.
    ///
    /// Each landmark that passes the frame's frustum test is searched in a
    /// window of `th * radius_by_viewing_cos * scale(level)` pixels at its
    /// predicted level and the one below. Stereo keypoints must also agree
    /// on the right-image coordinate. A best match within `th_high` is
    /// rejected as ambiguous only when the second best sits on the same
    /// level.
    ///
    /// # Arguments
    /// * `frame` - Frame receiving the associations
    /// * `map` - Map resolving the landmark handles
    /// * `points` - Candidate landmarks
    /// * `th` - Window multiplier
    /// * `far_points` - Skip landmarks deeper than this, if set
    ///
    /// # Returns
    /// Number of new associations written into `frame.map_point_matches`.
    pub fn search_by_projection_local_map(
        &self,
        frame: &mut Frame,
        map: &Map,
        points: &[MapPointId],
        th: f64,
        far_points: Option<f64>,
    ) -> usize {
        let tracked = tracked_landmarks(frame, map);
        let mut claims = TargetClaims::new(frame.num_features());
        let mut num_visible = 0;

        for (source, &mp_id) in points.iter().enumerate() {
            if tracked.contains(&mp_id) {
                continue;
            }
            let Some(mp) = map.get_valid_map_point(mp_id) else {
                continue;
            };
            let Some(proj) = frame.is_in_frustum(mp, self.config.view_cos_limit) else {
                continue;
            };
            if far_points.is_some_and(|max_depth| proj.depth > max_depth) {
                continue;
            }
            num_visible += 1;

            let level = proj.predicted_level;
            let radius = th * Self::radius_by_viewing_cos(proj.view_cos) * frame.pyramid.scale(level);
            let indices = frame.get_features_in_area(
                proj.u,
                proj.v,
                radius,
                Some(level.saturating_sub(1)),
                Some(level),
            );

            let mut best = BestTwo::new();
            for idx in indices {
                if is_occupied(&frame.map_point_matches, idx, map) {
                    continue;
                }
                if let (Some(projected_ur), Some(ur)) = (proj.u_right, frame.right_u(idx)) {
                    if (projected_ur - ur).abs() > radius {
                        continue;
                    }
                }
                let (Some(kp), Some(desc)) = (frame.keypoint(idx), frame.descriptor(idx)) else {
                    continue;
                };
                best.update(idx, descriptor_distance(&mp.descriptor, desc), kp.octave);
            }

            let Some(best_idx) = best.best_idx else {
                continue;
            };
            if best.best_dist > self.config.th_high {
                continue;
            }
            if best.best_level == best.second_level && self.is_ambiguous(best.best_dist, best.second_dist) {
                continue;
            }
            claims.claim(best_idx, source, best.best_dist);
        }

        let mut matches = claims.into_matches();
        let rejected = self.filter_orientation(&mut matches, |m| {
            let mp_id = *points.get(m.source)?;
            Some(map.reference_keypoint(mp_id)?.angle - frame.keypoint(m.target)?.angle)
        });
        record(frame, &matches, |source| points.get(source).copied());

        debug!(
            "[SearchByProjection/LocalMap] frame={}: {} visible, {} matched, {} rejected by rotation",
            frame.id,
            num_visible,
            matches.len(),
            rejected
        );
        matches.len()
    }

    /// Carry the last frame's associations into the current frame.
    ///
    /// Landmarks tracked by `last` (outliers excluded) are projected with the
    /// current pose estimate. For stereo input the pyramid levels searched
    /// follow the camera motion: moving forward only looks at the same or
    /// coarser levels, moving backward at the same or finer.
    ///
    /// # Returns
    /// Number of new associations written into `current.map_point_matches`.
    pub fn search_by_projection_last_frame(
        &self,
        current: &mut Frame,
        last: &Frame,
        map: &Map,
        th: f64,
        monocular: bool,
    ) -> usize {
        let (Some(pose_cw), Some(center), Some(last_cw)) =
            (current.pose_cw(), current.camera_center(), last.pose_cw())
        else {
            debug!("[SearchByProjection/LastFrame] missing pose, skipping");
            return 0;
        };

        // Current camera center in the last camera frame
        let tlc = last_cw.transform_point(&center);
        let baseline = current.camera.baseline;
        let forward = !monocular && tlc.z > baseline;
        let backward = !monocular && -tlc.z > baseline;

        let tracked = tracked_landmarks(current, map);
        let mut claims = TargetClaims::new(current.num_features());

        for (source, slot) in last.map_point_matches.iter().enumerate() {
            let Some(mp_id) = *slot else {
                continue;
            };
            if last.outliers.get(source).copied().unwrap_or(false) || tracked.contains(&mp_id) {
                continue;
            }
            let Some(mp) = map.get_valid_map_point(mp_id) else {
                continue;
            };
            let Some(last_kp) = last.keypoint(source) else {
                continue;
            };

            let p_cam = pose_cw.transform_point(&mp.position);
            let Some((u, v)) = current.camera.project(&p_cam) else {
                continue;
            };
            if !current.camera.is_in_image(u, v) {
                continue;
            }

            let octave = last_kp.octave;
            let radius = th * current.pyramid.scale(octave);
            let (min_level, max_level) = if forward {
                (Some(octave), None)
            } else if backward {
                (Some(0), Some(octave))
            } else {
                (Some(octave.saturating_sub(1)), Some(octave + 1))
            };
            let indices = current.get_features_in_area(u, v, radius, min_level, max_level);
            let projected_ur = (baseline > 0.0).then(|| current.camera.right_u(u, p_cam.z));

            let mut best = BestTwo::new();
            for idx in indices {
                if is_occupied(&current.map_point_matches, idx, map) {
                    continue;
                }
                if let (Some(pur), Some(ur)) = (projected_ur, current.right_u(idx)) {
                    if (pur - ur).abs() > radius {
                        continue;
                    }
                }
                let (Some(kp), Some(desc)) = (current.keypoint(idx), current.descriptor(idx)) else {
                    continue;
                };
                best.update(idx, descriptor_distance(&mp.descriptor, desc), kp.octave);
            }

            let Some(best_idx) = best.best_idx else {
                continue;
            };
            if best.best_dist > self.config.th_high || self.is_ambiguous(best.best_dist, best.second_dist) {
                continue;
            }
            claims.claim(best_idx, source, best.best_dist);
        }

        let mut matches = claims.into_matches();
        let rejected = self.filter_orientation(&mut matches, |m| {
            Some(last.keypoint(m.source)?.angle - current.keypoint(m.target)?.angle)
        });
        record(current, &matches, |source| last.map_point_matches.get(source).copied().flatten());

        debug!(
            "[SearchByProjection/LastFrame] frame={} from frame={}: {} matched, {} rejected by rotation",
            current.id,
            last.id,
            matches.len(),
            rejected
        );
        matches.len()
    }

    /// Relocalization: project a candidate keyframe's landmarks into a frame.
    ///
    /// # Arguments
    /// * `current` - Frame with a pose hypothesis
    /// * `kf` - Candidate keyframe whose landmarks are projected
    /// * `map` - Map resolving the landmark handles
    /// * `already_found` - Landmarks matched by an earlier pass, skipped here
    /// * `th` - Window multiplier
    /// * `orb_dist` - Hamming threshold
    pub fn search_by_projection_keyframe(
        &self,
        current: &mut Frame,
        kf: &KeyFrame,
        map: &Map,
        already_found: &HashSet<MapPointId>,
        th: f64,
        orb_dist: u32,
    ) -> usize {
        let (Some(pose_cw), Some(center)) = (current.pose_cw(), current.camera_center()) else {
            debug!("[SearchByProjection/KeyFrame] frame={} has no pose", current.id);
            return 0;
        };

        let tracked = tracked_landmarks(current, map);
        let mut claims = TargetClaims::new(current.num_features());

        for (source, mp_id) in kf.get_map_point_indices() {
            if already_found.contains(&mp_id) || tracked.contains(&mp_id) {
                continue;
            }
            let Some(mp) = map.get_valid_map_point(mp_id) else {
                continue;
            };

            let p_cam = pose_cw.transform_point(&mp.position);
            let Some((u, v)) = current.camera.project(&p_cam) else {
                continue;
            };
            if !current.camera.is_in_image(u, v) {
                continue;
            }

            let dist = (mp.position - center).norm();
            if dist < mp.min_distance_invariance() || dist > mp.max_distance_invariance() {
                continue;
            }

            let level = mp.predict_scale(dist, &current.pyramid);
            let radius = th * current.pyramid.scale(level);
            let indices = current.get_features_in_area(
                u,
                v,
                radius,
                Some(level.saturating_sub(1)),
                Some(level + 1),
            );

            let mut best = BestTwo::new();
            for idx in indices {
                if is_occupied(&current.map_point_matches, idx, map) {
                    continue;
                }
                let (Some(kp), Some(desc)) = (current.keypoint(idx), current.descriptor(idx)) else {
                    continue;
                };
                best.update(idx, descriptor_distance(&mp.descriptor, desc), kp.octave);
            }

            let Some(best_idx) = best.best_idx else {
                continue;
            };
            if best.best_dist > orb_dist || self.is_ambiguous(best.best_dist, best.second_dist) {
                continue;
            }
            claims.claim(best_idx, source, best.best_dist);
        }

        let mut matches = claims.into_matches();
        let rejected = self.filter_orientation(&mut matches, |m| {
            Some(kf.keypoint(m.source)?.angle - current.keypoint(m.target)?.angle)
        });
        record(current, &matches, |source| kf.get_map_point(source));

        debug!(
            "[SearchByProjection/KeyFrame] frame={} kf={}: {} matched, {} rejected by rotation",
            current.id,
            kf.id,
            matches.len(),
            rejected
        );
        matches.len()
    }

    /// Loop detection: project landmarks into a keyframe through a similarity.
    ///
    /// `matched` is indexed by the keyframe's keypoints. Landmarks already in
    /// `matched` are not searched again. A preset entry is replaced only when
    /// a searched landmark matches its keypoint with a strictly smaller
    /// distance than the preset landmark's.
    ///
    /// # Arguments
    /// * `kf` - Keyframe receiving the projections
    /// * `map` - Map resolving the landmark handles
    /// * `scw` - World-to-camera similarity of `kf`
    /// * `points` - Candidate landmarks
    /// * `matched` - Per-keypoint landmark matches, extended in place
    /// * `th` - Window multiplier
    /// * `ratio_hamming` - Fraction of `th_low` a match must stay within
    ///
    /// # Returns
    /// Number of new matches.
    #[allow(clippy::too_many_arguments)]
    pub fn search_by_projection_sim3(
        &self,
        kf: &KeyFrame,
        map: &Map,
        scw: &Sim3,
        points: &[MapPointId],
        matched: &mut Vec<Option<MapPointId>>,
        th: f64,
        ratio_hamming: f64,
    ) -> usize {
        if matched.len() < kf.num_features() {
            matched.resize(kf.num_features(), None);
        }
        let (matches, rejected) = self.sim3_projection_matches(kf, map, scw, points, matched, th, ratio_hamming);
        for m in &matches {
            matched[m.target] = points.get(m.source).copied();
        }

        debug!(
            "[SearchByProjection/Sim3] kf={}: {} candidates, {} matched, {} rejected by rotation",
            kf.id,
            points.len(),
            matches.len(),
            rejected
        );
        matches.len()
    }

    /// As [`OrbMatcher::search_by_projection_sim3`], also recording which
    /// keyframe each matched landmark came from.
    ///
    /// `points_kfs[i]` is the source keyframe of `points[i]`.
    #[allow(clippy::too_many_arguments)]
    pub fn search_by_projection_sim3_merge(
        &self,
        kf: &KeyFrame,
        map: &Map,
        scw: &Sim3,
        points: &[MapPointId],
        points_kfs: &[KeyFrameId],
        matched: &mut Vec<Option<MapPointId>>,
        matched_kf: &mut Vec<Option<KeyFrameId>>,
        th: f64,
        ratio_hamming: f64,
    ) -> usize {
        let n = kf.num_features();
        if matched.len() < n {
            matched.resize(n, None);
        }
        if matched_kf.len() < n {
            matched_kf.resize(n, None);
        }
        let (matches, rejected) = self.sim3_projection_matches(kf, map, scw, points, matched, th, ratio_hamming);
        for m in &matches {
            matched[m.target] = points.get(m.source).copied();
            matched_kf[m.target] = points_kfs.get(m.source).copied();
        }

        debug!(
            "[SearchByProjection/Sim3Merge] kf={}: {} candidates, {} matched, {} rejected by rotation",
            kf.id,
            points.len(),
            matches.len(),
            rejected
        );
        matches.len()
    }

    /// Shared body of the Sim3 variants. Returns the accepted matches and
    /// the number removed by the orientation filter.
    #[allow(clippy::too_many_arguments)]
    fn sim3_projection_matches(
        &self,
        kf: &KeyFrame,
        map: &Map,
        scw: &Sim3,
        points: &[MapPointId],
        matched: &[Option<MapPointId>],
        th: f64,
        ratio_hamming: f64,
    ) -> (Vec<MatchPair>, usize) {
        let pose_cw = scw.to_se3_unscaled();
        let center = scw.camera_center();
        let max_dist = self.config.th_low as f64 * ratio_hamming;

        let already: HashSet<MapPointId> = matched.iter().flatten().copied().collect();
        // Distance a newcomer must beat to take over a preset keypoint
        let preset_dist: Vec<Option<u32>> = (0..kf.num_features())
            .map(|idx| {
                let mp = map.get_valid_map_point(matched.get(idx).copied().flatten()?)?;
                Some(descriptor_distance(&mp.descriptor, kf.descriptor(idx)?))
            })
            .collect();
        let mut claims = TargetClaims::new(kf.num_features());

        for (source, &mp_id) in points.iter().enumerate() {
            if already.contains(&mp_id) {
                continue;
            }
            let Some(mp) = map.get_valid_map_point(mp_id) else {
                continue;
            };

            let p_cam = pose_cw.transform_point(&mp.position);
            let Some((u, v)) = kf.camera.project(&p_cam) else {
                continue;
            };
            if !kf.camera.is_in_image(u, v) {
                continue;
            }

            let po = mp.position - center;
            let dist = po.norm();
            if dist < mp.min_distance_invariance() || dist > mp.max_distance_invariance() {
                continue;
            }
            if po.dot(&mp.normal) < self.config.view_cos_limit * dist {
                continue;
            }

            let level = mp.predict_scale(dist, &kf.pyramid);
            let radius = th * kf.pyramid.scale(level);
            let indices =
                kf.get_features_in_area(u, v, radius, Some(level.saturating_sub(1)), Some(level));

            let mut best = BestTwo::new();
            for idx in indices {
                let (Some(kp), Some(desc)) = (kf.keypoint(idx), kf.descriptor(idx)) else {
                    continue;
                };
                let d = descriptor_distance(&mp.descriptor, desc);
                if preset_dist.get(idx).copied().flatten().is_some_and(|held| d >= held) {
                    continue;
                }
                best.update(idx, d, kp.octave);
            }

            if let Some(best_idx) = best.best_idx {
                if (best.best_dist as f64) <= max_dist {
                    claims.claim(best_idx, source, best.best_dist);
                }
            }
        }

        let mut matches = claims.into_matches();
        let rejected = self.filter_orientation(&mut matches, |m| {
            let mp_id = *points.get(m.source)?;
            Some(map.reference_keypoint(mp_id)?.angle - kf.keypoint(m.target)?.angle)
        });
        (matches, rejected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{FeatureSet, KeyPoint, ScalePyramid};
    use crate::geometry::SE3;
    use crate::test_support::*;
    use nalgebra::{UnitQuaternion, Vector3};

    fn rotated_about_y(angle: f64) -> SE3 {
        SE3 {
            rotation: UnitQuaternion::from_axis_angle(&Vector3::y_axis(), angle),
            translation: Vector3::zeros(),
        }
    }

    #[test]
    fn test_local_map_matches_every_landmark() {
        let positions = scene_points(20);
        let (map, _, ids) = map_with_keyframe(SE3::identity(), &positions);
        let mut frame = frame_observing(1, SE3::identity(), &positions);

        let matcher = OrbMatcher::default();
        let n = matcher.search_by_projection_local_map(&mut frame, &map, &ids, 1.0, None);

        assert_eq!(n, 20);
        for (i, id) in ids.iter().enumerate() {
            assert_eq!(frame.map_point_matches[i], Some(*id));
        }
    }

    #[test]
    fn test_no_match_behind_camera_or_outside_image() {
        let positions = scene_points(20);
        let (map, _, ids) = map_with_keyframe(SE3::identity(), &positions);
        let matcher = OrbMatcher::default();

        // Facing away from the landmarks
        let mut frame = frame_observing(1, SE3::identity(), &positions);
        frame.pose = Some(rotated_about_y(std::f64::consts::PI));
        assert_eq!(matcher.search_by_projection_local_map(&mut frame, &map, &ids, 1.0, None), 0);

        // Shifted so every landmark projects left of the image
        let mut frame = frame_observing(2, SE3::identity(), &positions);
        frame.pose = Some(SE3::from_translation(Vector3::new(10.0, 0.0, 0.0)));
        assert_eq!(matcher.search_by_projection_local_map(&mut frame, &map, &ids, 1.0, None), 0);
        assert_eq!(frame.num_tracked(), 0);
    }

    #[test]
    fn test_local_map_keeps_occupied_keypoints() {
        let positions = scene_points(20);
        let (mut map, kf, ids) = map_with_keyframe(SE3::identity(), &positions);
        let other = map.create_map_point(Vector3::new(0.0, 0.0, 9.0), descriptor(200), kf);

        let mut frame = frame_observing(1, SE3::identity(), &positions);
        frame.map_point_matches[3] = Some(other);
        // Already tracked: landmark 7 must not land on a second keypoint
        frame.map_point_matches[8] = Some(ids[7]);

        let matcher = OrbMatcher::default();
        let n = matcher.search_by_projection_local_map(&mut frame, &map, &ids, 1.0, None);

        assert_eq!(n, 17);
        assert_eq!(frame.map_point_matches[3], Some(other));
        assert_eq!(frame.map_point_matches[7], None);
        assert_eq!(frame.map_point_matches[8], Some(ids[7]));

        // No landmark assigned twice
        let mut seen = HashSet::new();
        assert!(frame.map_point_matches.iter().flatten().all(|id| seen.insert(*id)));
    }

    #[test]
    fn test_local_map_is_idempotent_on_equal_inputs() {
        let positions = scene_points(15);
        let (map, _, ids) = map_with_keyframe(SE3::identity(), &positions);
        let frame = frame_observing(1, SE3::from_translation(Vector3::new(0.02, 0.0, 0.0)), &positions);
        let matcher = OrbMatcher::default();

        let mut a = frame.clone();
        let mut b = frame.clone();
        let na = matcher.search_by_projection_local_map(&mut a, &map, &ids, 3.0, None);
        let nb = matcher.search_by_projection_local_map(&mut b, &map, &ids, 3.0, None);
        assert_eq!(na, nb);
        assert_eq!(a.map_point_matches, b.map_point_matches);
    }

    #[test]
    fn test_local_map_far_point_cutoff() {
        let positions = scene_points(10);
        let (map, _, ids) = map_with_keyframe(SE3::identity(), &positions);
        let mut frame = frame_observing(1, SE3::identity(), &positions);

        let matcher = OrbMatcher::default();
        assert_eq!(matcher.search_by_projection_local_map(&mut frame, &map, &ids, 1.0, Some(4.0)), 0);
        assert_eq!(matcher.search_by_projection_local_map(&mut frame, &map, &ids, 1.0, Some(6.0)), 10);
    }

    #[test]
    fn test_local_map_stereo_gate() {
        let positions = scene_points(10);
        let (map, _, ids) = map_with_keyframe(SE3::identity(), &positions);

        let cam = stereo_camera();
        let features = observe(&cam, &SE3::identity(), &positions, 0.0);
        let mut points_cam = depths(&SE3::identity(), &positions);
        // Wrong depth: right coordinate off by 8 px, outside the 2.5 px window
        points_cam[0] = Some(positions[0] * 0.5);
        let mut frame = Frame::new(1, 0, cam, ScalePyramid::default(), features, points_cam)
            .with_pose(SE3::identity());

        let matcher = OrbMatcher::default();
        assert_eq!(matcher.search_by_projection_local_map(&mut frame, &map, &ids, 1.0, None), 9);
        assert_eq!(frame.map_point_matches[0], None);
    }

    #[test]
    fn test_local_map_rejects_ambiguous_same_level() {
        let positions = scene_points(1);
        let (map, _, ids) = map_with_keyframe(SE3::identity(), &positions);

        let cam = camera();
        let (u, v) = cam.project(&positions[0]).unwrap();
        let d = descriptor(1);
        let features = FeatureSet::new(
            vec![KeyPoint::new(u, v, 0.0, 0), KeyPoint::new(u + 1.0, v, 0.0, 0)],
            vec![perturb(&d, 10), perturb(&d, 12)],
        );
        let mut frame =
            Frame::new(1, 0, cam, ScalePyramid::default(), features, vec![]).with_pose(SE3::identity());

        let matcher = OrbMatcher::default();
        // 10 > 0.6 * 12
        assert_eq!(matcher.search_by_projection_local_map(&mut frame, &map, &ids, 1.0, None), 0);

        let relaxed = OrbMatcher::new(0.9, true);
        assert_eq!(relaxed.search_by_projection_local_map(&mut frame, &map, &ids, 1.0, None), 1);
        assert_eq!(frame.map_point_matches[0], Some(ids[0]));
    }

    /// Same scene, but keypoints 5, 10 and 15 rotated by 90°, 180° and 270°.
    fn rotated_features(positions: &[Vector3<f64>]) -> FeatureSet {
        let mut features = observe(&camera(), &SE3::identity(), positions, 0.0);
        features.keypoints[5].angle = 90.0;
        features.keypoints[10].angle = 180.0;
        features.keypoints[15].angle = 270.0;
        features
    }

    fn assert_subset(filtered: &[Option<MapPointId>], unfiltered: &[Option<MapPointId>]) {
        for (a, b) in filtered.iter().zip(unfiltered) {
            if a.is_some() {
                assert_eq!(a, b);
            }
        }
    }

    #[test]
    fn test_local_map_orientation_filter_removes_subset() {
        let positions = scene_points(20);
        let (map, _, ids) = map_with_keyframe(SE3::identity(), &positions);
        let frame = Frame::new(1, 0, camera(), ScalePyramid::default(), rotated_features(&positions), vec![])
            .with_pose(SE3::identity());

        let mut filtered = frame.clone();
        let mut unfiltered = frame.clone();
        let n_on = OrbMatcher::new(0.6, true).search_by_projection_local_map(&mut filtered, &map, &ids, 1.0, None);
        let n_off =
            OrbMatcher::new(0.6, false).search_by_projection_local_map(&mut unfiltered, &map, &ids, 1.0, None);

        assert_eq!(n_off, 20);
        assert_eq!(n_on, 19);
        assert_eq!(filtered.map_point_matches[5], None);
        assert_subset(&filtered.map_point_matches, &unfiltered.map_point_matches);
    }

    fn last_frame_with_matches(positions: &[Vector3<f64>], ids: &[MapPointId]) -> Frame {
        let mut last = frame_observing(1, SE3::identity(), positions);
        for (i, id) in ids.iter().enumerate() {
            last.map_point_matches[i] = Some(*id);
        }
        last
    }

    #[test]
    fn test_last_frame_tracks_motion() {
        let positions = scene_points(20);
        let (map, _, ids) = map_with_keyframe(SE3::identity(), &positions);
        let mut last = last_frame_with_matches(&positions, &ids);
        last.outliers[2] = true;

        let pose = SE3::from_translation(Vector3::new(0.05, 0.0, 0.0));
        let mut current = frame_observing(2, pose, &positions);

        let matcher = OrbMatcher::default();
        let n = matcher.search_by_projection_last_frame(&mut current, &last, &map, 7.0, true);

        assert_eq!(n, 19);
        assert_eq!(current.map_point_matches[2], None);
        assert_eq!(current.map_point_matches[5], Some(ids[5]));
    }

    #[test]
    fn test_last_frame_orientation_filter_removes_subset() {
        let positions = scene_points(20);
        let (map, _, ids) = map_with_keyframe(SE3::identity(), &positions);
        let last = last_frame_with_matches(&positions, &ids);

        let cam = camera();
        let mut features = observe(&cam, &SE3::identity(), &positions, 0.0);
        features.keypoints[5].angle = 90.0;
        features.keypoints[10].angle = 180.0;
        features.keypoints[15].angle = 270.0;
        let current = Frame::new(2, 0, cam, ScalePyramid::default(), features, vec![])
            .with_pose(SE3::identity());

        let mut filtered = current.clone();
        let mut unfiltered = current.clone();
        let n_on = OrbMatcher::new(0.6, true).search_by_projection_last_frame(&mut filtered, &last, &map, 3.0, true);
        let n_off = OrbMatcher::new(0.6, false).search_by_projection_last_frame(&mut unfiltered, &last, &map, 3.0, true);

        assert_eq!(n_off, 20);
        assert_eq!(n_on, 19);
        // Delta -90° lands in the 270° bin, the last of three single-entry bins
        assert_eq!(filtered.map_point_matches[5], None);
        for (a, b) in filtered.map_point_matches.iter().zip(&unfiltered.map_point_matches) {
            if a.is_some() {
                assert_eq!(a, b);
            }
        }
    }

    #[test]
    fn test_last_frame_no_match_behind_camera_or_outside_image() {
        let positions = scene_points(20);
        let (map, _, ids) = map_with_keyframe(SE3::identity(), &positions);
        let last = last_frame_with_matches(&positions, &ids);
        let matcher = OrbMatcher::default();

        let mut current = frame_observing(2, SE3::identity(), &positions);
        current.pose = Some(rotated_about_y(std::f64::consts::PI));
        assert_eq!(matcher.search_by_projection_last_frame(&mut current, &last, &map, 7.0, true), 0);

        let mut current = frame_observing(3, SE3::identity(), &positions);
        current.pose = Some(SE3::from_translation(Vector3::new(10.0, 0.0, 0.0)));
        assert_eq!(matcher.search_by_projection_last_frame(&mut current, &last, &map, 7.0, true), 0);
        assert_eq!(current.num_tracked(), 0);
    }

    #[test]
    fn test_last_frame_without_pose() {
        let positions = scene_points(5);
        let (map, _, ids) = map_with_keyframe(SE3::identity(), &positions);
        let last = last_frame_with_matches(&positions, &ids);
        let mut current = frame_observing(2, SE3::identity(), &positions);
        current.pose = None;

        let matcher = OrbMatcher::default();
        assert_eq!(matcher.search_by_projection_last_frame(&mut current, &last, &map, 7.0, false), 0);
    }

    #[test]
    fn test_keyframe_relocalization() {
        let positions = scene_points(20);
        let (map, kf_id, ids) = map_with_keyframe(SE3::identity(), &positions);
        let kf = map.get_keyframe(kf_id).unwrap();
        let mut frame = frame_observing(1, SE3::from_translation(Vector3::new(0.0, 0.02, 0.0)), &positions);

        let already: HashSet<MapPointId> = [ids[0], ids[1]].into_iter().collect();
        let matcher = OrbMatcher::new(0.9, true);
        let n = matcher.search_by_projection_keyframe(&mut frame, kf, &map, &already, 10.0, 64);

        assert_eq!(n, 18);
        assert_eq!(frame.map_point_matches[0], None);
        assert_eq!(frame.map_point_matches[4], Some(ids[4]));
    }

    #[test]
    fn test_keyframe_no_match_behind_camera_or_outside_image() {
        let positions = scene_points(20);
        let (map, kf_id, _) = map_with_keyframe(SE3::identity(), &positions);
        let kf = map.get_keyframe(kf_id).unwrap();
        let matcher = OrbMatcher::new(0.9, true);

        let mut frame = frame_observing(1, SE3::identity(), &positions);
        frame.pose = Some(rotated_about_y(std::f64::consts::PI));
        assert_eq!(matcher.search_by_projection_keyframe(&mut frame, kf, &map, &HashSet::new(), 10.0, 64), 0);

        let mut frame = frame_observing(2, SE3::identity(), &positions);
        frame.pose = Some(SE3::from_translation(Vector3::new(10.0, 0.0, 0.0)));
        assert_eq!(matcher.search_by_projection_keyframe(&mut frame, kf, &map, &HashSet::new(), 10.0, 64), 0);
        assert_eq!(frame.num_tracked(), 0);
    }

    #[test]
    fn test_sim3_projection_keeps_preset_matches() {
        let positions = scene_points(20);
        let (map, kf_id, ids) = map_with_keyframe(SE3::identity(), &positions);
        let kf = map.get_keyframe(kf_id).unwrap();

        let mut matched = vec![None; 20];
        matched[4] = Some(ids[4]);
        // Scale alone does not move camera-frame points when t = 0
        let scw = Sim3::new(nalgebra::UnitQuaternion::identity(), Vector3::zeros(), 2.0);

        let matcher = OrbMatcher::default();
        let n = matcher.search_by_projection_sim3(kf, &map, &scw, &ids, &mut matched, 10.0, 1.0);

        assert_eq!(n, 19);
        assert_eq!(matched.iter().flatten().count(), 20);
        assert_eq!(matched[4], Some(ids[4]));

        // Same landmarks again: everything is already matched
        assert_eq!(matcher.search_by_projection_sim3(kf, &map, &scw, &ids, &mut matched, 10.0, 1.0), 0);
    }

    #[test]
    fn test_sim3_projection_replaces_worse_preset() {
        let positions = scene_points(10);
        let (map, kf_id, ids) = map_with_keyframe(SE3::identity(), &positions);
        let kf = map.get_keyframe(kf_id).unwrap();

        // Landmark 9 preset on keypoint 4 (128 bits away); landmark 4 fits it exactly
        let mut matched = vec![None; 10];
        matched[4] = Some(ids[9]);

        let matcher = OrbMatcher::default();
        let n = matcher.search_by_projection_sim3(kf, &map, &Sim3::identity(), &ids[..9], &mut matched, 10.0, 1.0);

        assert_eq!(n, 9);
        assert_eq!(matched[4], Some(ids[4]));
        assert_eq!(matched[9], None);
    }

    #[test]
    fn test_sim3_projection_keeps_equal_preset() {
        let positions = scene_points(5);
        let (mut map, kf_id, ids) = map_with_keyframe(SE3::identity(), &positions);
        let twin = map.create_map_point(positions[2], descriptor(3), kf_id);
        let kf = map.get_keyframe(kf_id).unwrap();

        let mut matched = vec![None; 5];
        matched[2] = Some(twin);
        let n = OrbMatcher::default().search_by_projection_sim3(kf, &map, &Sim3::identity(), &ids, &mut matched, 10.0, 1.0);

        // Landmark 2 ties the preset at distance zero, so the caller's entry stands
        assert_eq!(n, 4);
        assert_eq!(matched[2], Some(twin));
    }

    #[test]
    fn test_sim3_projection_orientation_filter_removes_subset() {
        let positions = scene_points(20);
        let (mut map, _, ids) = map_with_keyframe(SE3::identity(), &positions);
        let target = map.create_keyframe(
            SE3::identity(),
            camera(),
            ScalePyramid::default(),
            rotated_features(&positions),
            vec![],
        );
        let kf = map.get_keyframe(target).unwrap();

        let mut filtered = vec![];
        let mut unfiltered = vec![];
        let n_on = OrbMatcher::new(0.6, true)
            .search_by_projection_sim3(kf, &map, &Sim3::identity(), &ids, &mut filtered, 10.0, 1.0);
        let n_off = OrbMatcher::new(0.6, false)
            .search_by_projection_sim3(kf, &map, &Sim3::identity(), &ids, &mut unfiltered, 10.0, 1.0);

        assert_eq!(n_off, 20);
        assert_eq!(n_on, 19);
        assert_eq!(filtered[5], None);
        assert_subset(&filtered, &unfiltered);
    }

    #[test]
    fn test_sim3_projection_does_not_shrink_matched() {
        let positions = scene_points(5);
        let (map, kf_id, ids) = map_with_keyframe(SE3::identity(), &positions);
        let kf = map.get_keyframe(kf_id).unwrap();

        let mut matched = vec![None; 8];
        let mut matched_kf = vec![None; 8];
        let n = OrbMatcher::default().search_by_projection_sim3_merge(
            kf,
            &map,
            &Sim3::identity(),
            &ids,
            &[kf_id; 5],
            &mut matched,
            &mut matched_kf,
            10.0,
            1.0,
        );
        assert_eq!(n, 5);
        assert_eq!(matched.len(), 8);
        assert_eq!(matched_kf.len(), 8);
        assert_eq!(matched[4], Some(ids[4]));
    }

    #[test]
    fn test_sim3_projection_behind_camera() {
        let positions = scene_points(10);
        let (map, kf_id, ids) = map_with_keyframe(SE3::identity(), &positions);
        let kf = map.get_keyframe(kf_id).unwrap();

        let rot = rotated_about_y(std::f64::consts::PI);
        let scw = Sim3::from_se3(&rot);
        let mut matched = vec![];
        let matcher = OrbMatcher::default();
        assert_eq!(matcher.search_by_projection_sim3(kf, &map, &scw, &ids, &mut matched, 10.0, 1.0), 0);
        assert_eq!(matched.len(), 10);
    }

    #[test]
    fn test_sim3_merge_records_source_keyframes() {
        let positions = scene_points(8);
        let (map, kf_id, ids) = map_with_keyframe(SE3::identity(), &positions);
        let kf = map.get_keyframe(kf_id).unwrap();
        let source_kfs = vec![KeyFrameId::new(42); ids.len()];

        let mut matched = vec![];
        let mut matched_kf = vec![];
        let matcher = OrbMatcher::default();
        let n = matcher.search_by_projection_sim3_merge(
            kf,
            &map,
            &Sim3::identity(),
            &ids,
            &source_kfs,
            &mut matched,
            &mut matched_kf,
            10.0,
            1.0,
        );

        assert_eq!(n, 8);
        for i in 0..8 {
            assert_eq!(matched[i], Some(ids[i]));
            assert_eq!(matched_kf[i], Some(KeyFrameId::new(42)));
        }
    }
}
