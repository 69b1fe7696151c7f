//! Duplicate landmark fusion.
//!
//! Landmarks are projected into a keyframe. When the best keypoint is free
//! the landmark is attached to it; when it already carries another valid
//! landmark the pair is reported as a replacement for the caller to merge
//! (see [`Map::merge_map_points`] and [`Map::fuse_duplicates`]).

use nalgebra::Vector3;
use tracing::debug;

use crate::frame::descriptor_distance;
use crate::geometry::{Sim3, SE3};
use crate::map::{KeyFrame, KeyFrameId, Map, MapPointId};

use super::{OrbMatcher, TargetClaims};

/// Result of a fusion pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FuseOutcome {
    /// Landmarks that were attached or found to duplicate an existing one.
    pub num_fused: usize,
    /// `replacements[i]` is the landmark already sitting on the keypoint
    /// that `points[i]` matched, if any.
    pub replacements: Vec<Option<MapPointId>>,
}

impl OrbMatcher {
    /// Fuse landmarks into a keyframe, gating candidates on reprojection error.
    ///
    /// The squared pixel error (including the right-image coordinate for
    /// stereo keypoints) scaled by the keypoint level's inverse variance must
    /// stay below the 2-DOF (mono) or 3-DOF (stereo) chi-square bound.
    ///
    /// Newly attached landmarks gain an observation; their normal and
    /// descriptor are left for the caller to refresh.
    pub fn fuse(&self, map: &mut Map, kf_id: KeyFrameId, points: &[MapPointId], th: f64) -> FuseOutcome {
        let Some(kf) = map.get_keyframe(kf_id) else {
            return FuseOutcome {
                num_fused: 0,
                replacements: vec![None; points.len()],
            };
        };
        let candidates = self.fuse_candidates(map, kf, &kf.pose_cw(), &kf.camera_center(), points, th, true);
        let outcome = apply_fusion(map, kf_id, points, &candidates);

        debug!(
            "[Fuse] kf={}: {} candidates, {} fused, {} replacements",
            kf_id,
            points.len(),
            outcome.num_fused,
            outcome.replacements.iter().flatten().count()
        );
        outcome
    }

    /// Fuse landmarks into a keyframe placed by a world-to-camera similarity.
    ///
    /// Used after loop correction, so no reprojection gate is applied.
    pub fn fuse_sim3(
        &self,
        map: &mut Map,
        kf_id: KeyFrameId,
        scw: &Sim3,
        points: &[MapPointId],
        th: f64,
    ) -> FuseOutcome {
        let Some(kf) = map.get_keyframe(kf_id) else {
            return FuseOutcome {
                num_fused: 0,
                replacements: vec![None; points.len()],
            };
        };
        let pose_cw = scw.to_se3_unscaled();
        let candidates = self.fuse_candidates(map, kf, &pose_cw, &scw.camera_center(), points, th, false);
        let outcome = apply_fusion(map, kf_id, points, &candidates);

        debug!(
            "[Fuse/Sim3] kf={} scale={:.3}: {} fused, {} replacements",
            kf_id,
            scw.scale,
            outcome.num_fused,
            outcome.replacements.iter().flatten().count()
        );
        outcome
    }

    /// Best keypoint and distance for each landmark, read-only.
    #[allow(clippy::too_many_arguments)]
    fn fuse_candidates(
        &self,
        map: &Map,
        kf: &KeyFrame,
        pose_cw: &SE3,
        center: &Vector3<f64>,
        points: &[MapPointId],
        th: f64,
        reprojection_gate: bool,
    ) -> Vec<Option<(usize, u32)>> {
        let stereo = kf.camera.baseline > 0.0;

        points
            .iter()
            .map(|&mp_id| {
                let mp = map.get_valid_map_point(mp_id)?;
                if mp.is_in_keyframe(kf.id) {
                    return None;
                }

                let p_cam = pose_cw.transform_point(&mp.position);
                let (u, v) = kf.camera.project(&p_cam)?;
                if !kf.camera.is_in_image(u, v) {
                    return None;
                }
                let projected_ur = kf.camera.right_u(u, p_cam.z);

                let po = mp.position - center;
                let dist = po.norm();
                if dist < mp.min_distance_invariance() || dist > mp.max_distance_invariance() {
                    return None;
                }
                if po.dot(&mp.normal) < self.config.view_cos_limit * dist {
                    return None;
                }

                let level = mp.predict_scale(dist, &kf.pyramid);
                let radius = th * kf.pyramid.scale(level);
                let indices =
                    kf.get_features_in_area(u, v, radius, Some(level.saturating_sub(1)), Some(level));

                let mut best: Option<(usize, u32)> = None;
                for idx in indices {
                    let (Some(kp), Some(desc)) = (kf.keypoint(idx), kf.descriptor(idx)) else {
                        continue;
                    };

                    if reprojection_gate {
                        let ex = u - kp.x;
                        let ey = v - kp.y;
                        let inv_sigma2 = kf.pyramid.inv_sigma2(kp.octave);
                        match kf.right_u(idx).filter(|_| stereo) {
                            Some(ur) => {
                                let er = projected_ur - ur;
                                if (ex * ex + ey * ey + er * er) * inv_sigma2 > self.config.fuse_chi2_stereo {
                                    continue;
                                }
                            }
                            None => {
                                if (ex * ex + ey * ey) * inv_sigma2 > self.config.fuse_chi2_mono {
                                    continue;
                                }
                            }
                        }
                    }

                    let d = descriptor_distance(&mp.descriptor, desc);
                    if best.map_or(true, |(_, b)| d < b) {
                        best = Some((idx, d));
                    }
                }

                best.filter(|&(_, d)| d <= self.config.th_low)
            })
            .collect()
    }
}

/// Attach landmarks to free keypoints and collect replacements.
///
/// Free keypoints contested by several landmarks go to the smallest
/// distance; the others are reported as duplicates of the winner.
fn apply_fusion(
    map: &mut Map,
    kf_id: KeyFrameId,
    points: &[MapPointId],
    candidates: &[Option<(usize, u32)>],
) -> FuseOutcome {
    let mut outcome = FuseOutcome {
        num_fused: 0,
        replacements: vec![None; points.len()],
    };
    let Some(kf) = map.get_keyframe(kf_id) else {
        return outcome;
    };

    let mut claims = TargetClaims::new(kf.num_features());
    let mut claimed: Vec<(usize, usize)> = Vec::new();

    for (source, candidate) in candidates.iter().enumerate() {
        let Some((idx, dist)) = *candidate else {
            continue;
        };
        let existing = kf
            .get_map_point(idx)
            .filter(|id| map.get_valid_map_point(*id).is_some());
        match existing {
            Some(existing) if existing == points[source] => {}
            Some(existing) => {
                outcome.replacements[source] = Some(existing);
                outcome.num_fused += 1;
            }
            None => {
                claims.claim(idx, source, dist);
                claimed.push((source, idx));
            }
        }
    }

    let winners = claims.into_matches();
    let mut owner = std::collections::HashMap::new();
    for m in &winners {
        owner.insert(m.target, points[m.source]);
        if map.associate(kf_id, m.target, points[m.source]) {
            outcome.num_fused += 1;
        }
    }
    for (source, idx) in claimed {
        match owner.get(&idx) {
            Some(&winner) if winner != points[source] => {
                outcome.replacements[source] = Some(winner);
                outcome.num_fused += 1;
            }
            _ => {}
        }
    }
    outcome
}
