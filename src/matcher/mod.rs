//! ORB descriptor correspondence search.
//!
//! [`OrbMatcher`] answers "which keypoint in this view is the same physical
//! point as that keypoint or landmark?" for every stage of the pipeline:
//!
//! - **Projection** (`projection`): landmarks projected into a frame or
//!   keyframe through a pose or similarity, searched in a radius window.
//! - **Bag-of-Words** (`bow`): descriptors compared only under shared
//!   vocabulary nodes.
//! - **Initialization** (`initialization`): windowed search between the first
//!   two monocular frames.
//! - **Triangulation** (`triangulation`): unmatched keypoint pairs verified
//!   against the epipolar constraint.
//! - **Sim3** (`sim3`): bidirectional projection under a similarity.
//! - **Fusion** (`fuse`): duplicate landmark detection and attachment.
//!
//! Every search prunes geometrically (grid window, level range, vocabulary
//! node, epipolar band) before comparing descriptors, and resolves every
//! target keypoint to at most one source within a call.

pub mod bow;
pub mod fuse;
pub mod histogram;
pub mod initialization;
pub mod projection;
pub mod sim3;
pub mod triangulation;

use nalgebra::Matrix3;

use crate::config::MatcherConfig;
use crate::frame::{KeyPoint, ScalePyramid};
use crate::geometry::epipolar_distance_sq;

pub use fuse::FuseOutcome;
pub use histogram::RotationHistogram;

/// Correspondence search engine. Holds only immutable tuning, so one
/// instance can serve any number of threads.
#[derive(Debug, Clone)]
pub struct OrbMatcher {
    config: MatcherConfig,
}

impl OrbMatcher {
    /// Create a matcher with default thresholds.
    ///
    /// # Arguments
    /// * `nn_ratio` - Best/second-best ratio, typically 0.6-0.9
    /// * `check_orientation` - Enable the rotation-consistency filter
    pub fn new(nn_ratio: f64, check_orientation: bool) -> Self {
        Self {
            config: MatcherConfig {
                nn_ratio,
                check_orientation,
                ..MatcherConfig::default()
            },
        }
    }

    pub fn from_config(config: MatcherConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &MatcherConfig {
        &self.config
    }

    /// Search-radius multiplier for a landmark seen at the given viewing cosine.
    ///
    /// Near-frontal views get a tighter window.
    pub fn radius_by_viewing_cos(view_cos: f64) -> f64 {
        if view_cos > 0.998 {
            2.5
        } else {
            4.0
        }
    }

    /// Whether `kp2` lies within the epipolar band of `kp1`.
    ///
    /// The band is the 1-DOF chi-square bound scaled by the variance of
    /// `kp2`'s pyramid level.
    pub fn check_dist_epipolar_line(
        &self,
        kp1: &KeyPoint,
        kp2: &KeyPoint,
        f12: &Matrix3<f64>,
        pyramid2: &ScalePyramid,
    ) -> bool {
        self.check_dist_epipolar_line_with_uncertainty(kp1, kp2, f12, pyramid2.sigma2(kp2.octave))
    }

    /// Epipolar band check with a caller-supplied measurement variance.
    pub fn check_dist_epipolar_line_with_uncertainty(
        &self,
        kp1: &KeyPoint,
        kp2: &KeyPoint,
        f12: &Matrix3<f64>,
        variance: f64,
    ) -> bool {
        match epipolar_distance_sq(&kp1.pt(), &kp2.pt(), f12) {
            Some(dsqr) => dsqr < self.config.epipolar_chi2 * variance,
            None => false,
        }
    }

    /// Best/second-best ambiguity test of the projection searches. A best
    /// exactly at `nn_ratio * second` still passes.
    fn is_ambiguous(&self, best: u32, second: u32) -> bool {
        best as f64 > self.config.nn_ratio * second as f64
    }

    /// Ratio test of the vocabulary and initialization searches: the best
    /// must stay strictly below `nn_ratio * second`.
    fn passes_strict_ratio(&self, best: u32, second: u32) -> bool {
        (best as f64) < self.config.nn_ratio * second as f64
    }

    /// Drop matches whose orientation delta falls outside the dominant
    /// histogram bins. Returns the number removed.
    ///
    /// `angle_delta` yields the source angle minus the target angle in
    /// degrees, or `None` when either keypoint is missing.
    fn filter_orientation<F>(&self, matches: &mut Vec<MatchPair>, angle_delta: F) -> usize
    where
        F: Fn(&MatchPair) -> Option<f64>,
    {
        if !self.config.check_orientation || matches.is_empty() {
            return 0;
        }

        let mut hist = RotationHistogram::new(self.config.histogram_bins);
        for (i, m) in matches.iter().enumerate() {
            if let Some(rot) = angle_delta(m) {
                hist.add(rot, i);
            }
        }

        let rejected = hist.rejected(self.config.min_peak_ratio);
        if rejected.is_empty() {
            return 0;
        }
        let mut i = 0;
        matches.retain(|_| {
            let keep = rejected.binary_search(&i).is_err();
            i += 1;
            keep
        });
        rejected.len()
    }
}

impl Default for OrbMatcher {
    fn default() -> Self {
        Self::from_config(MatcherConfig::default())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Call-scoped bookkeeping shared by the searches
// ─────────────────────────────────────────────────────────────────────────────

/// A correspondence from a source index to a target keypoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct MatchPair {
    pub source: usize,
    pub target: usize,
    pub distance: u32,
}

/// Best and second-best candidate of one source.
#[derive(Debug, Clone, Copy)]
pub(crate) struct BestTwo {
    pub best_dist: u32,
    pub best_idx: Option<usize>,
    pub best_level: Option<usize>,
    pub second_dist: u32,
    pub second_level: Option<usize>,
}

impl BestTwo {
    pub fn new() -> Self {
        Self {
            best_dist: u32::MAX,
            best_idx: None,
            best_level: None,
            second_dist: u32::MAX,
            second_level: None,
        }
    }

    pub fn update(&mut self, idx: usize, dist: u32, level: usize) {
        if dist < self.best_dist {
            self.second_dist = self.best_dist;
            self.second_level = self.best_level;
            self.best_dist = dist;
            self.best_idx = Some(idx);
            self.best_level = Some(level);
        } else if dist < self.second_dist {
            self.second_dist = dist;
            self.second_level = Some(level);
        }
    }
}

/// Owner of each target keypoint within one call.
///
/// A strictly smaller distance takes a target over; the displaced source is
/// left unmatched.
pub(crate) struct TargetClaims {
    owners: Vec<Option<(usize, u32)>>,
}

impl TargetClaims {
    pub fn new(num_targets: usize) -> Self {
        Self {
            owners: vec![None; num_targets],
        }
    }

    /// Try to take `target` for `source`. Returns true if it now owns it.
    pub fn claim(&mut self, target: usize, source: usize, distance: u32) -> bool {
        let Some(slot) = self.owners.get_mut(target) else {
            return false;
        };
        match slot {
            Some((_, held)) if *held <= distance => false,
            _ => {
                *slot = Some((source, distance));
                true
            }
        }
    }

    /// Surviving matches ordered by source index.
    pub fn into_matches(self) -> Vec<MatchPair> {
        let mut matches: Vec<MatchPair> = self
            .owners
            .into_iter()
            .enumerate()
            .filter_map(|(target, owner)| {
                owner.map(|(source, distance)| MatchPair {
                    source,
                    target,
                    distance,
                })
            })
            .collect();
        matches.sort_by_key(|m| m.source);
        matches
    }
}
