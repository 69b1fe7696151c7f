//! Windowed search between the first two frames of a monocular map.

use nalgebra::Point2;
use tracing::debug;

use crate::frame::{descriptor_distance, Frame};

use super::{MatchPair, OrbMatcher};

impl OrbMatcher {
    /// Match the finest-level keypoints of `f1` into `f2`.
    ///
    /// Each keypoint of `f1` is searched in a window of `window_size` pixels
    /// around `prev_matched[i]` (its position in the previous attempt, or its
    /// own position the first time), among `f2` keypoints on the same level.
    /// A candidate is only considered when it beats the distance of whoever
    /// currently holds it; the previous holder is then unmatched.
    ///
    /// # Arguments
    /// * `f1` - Reference frame
    /// * `f2` - Current frame
    /// * `prev_matched` - Per-keypoint search centers, updated with the matched positions in `f2`
    /// * `window_size` - Search radius in pixels
    ///
    /// # Returns
    /// `matches12[i]` = index in `f2` matched to keypoint `i` of `f1`.
    pub fn search_for_initialization(
        &self,
        f1: &Frame,
        f2: &Frame,
        prev_matched: &mut Vec<Point2<f64>>,
        window_size: f64,
    ) -> Vec<Option<usize>> {
        let n1 = f1.num_features();
        let n2 = f2.num_features();
        if prev_matched.len() < n1 {
            let start = prev_matched.len();
            prev_matched.extend(f1.keypoints()[start..].iter().map(|kp| kp.pt()));
        }

        let mut matches12: Vec<Option<usize>> = vec![None; n1];
        let mut matches21: Vec<Option<usize>> = vec![None; n2];
        let mut matched_distance = vec![u32::MAX; n2];

        for (i1, kp1) in f1.keypoints().iter().enumerate() {
            if kp1.octave > 0 {
                continue;
            }
            let Some(d1) = f1.descriptor(i1) else {
                continue;
            };
            let center = prev_matched[i1];
            let indices = f2.get_features_in_area(
                center.x,
                center.y,
                window_size,
                Some(kp1.octave),
                Some(kp1.octave),
            );

            let mut best_dist = u32::MAX;
            let mut second_dist = u32::MAX;
            let mut best_idx = None;
            for i2 in indices {
                let Some(d2) = f2.descriptor(i2) else {
                    continue;
                };
                let dist = descriptor_distance(d1, d2);
                if matched_distance[i2] <= dist {
                    continue;
                }
                if dist < best_dist {
                    second_dist = best_dist;
                    best_dist = dist;
                    best_idx = Some(i2);
                } else if dist < second_dist {
                    second_dist = dist;
                }
            }

            let Some(i2) = best_idx else {
                continue;
            };
            if best_dist > self.config.th_low || !self.passes_strict_ratio(best_dist, second_dist) {
                continue;
            }

            if let Some(previous) = matches21[i2] {
                matches12[previous] = None;
            }
            matches12[i1] = Some(i2);
            matches21[i2] = Some(i1);
            matched_distance[i2] = best_dist;
        }

        let mut matches: Vec<MatchPair> = matches12
            .iter()
            .enumerate()
            .filter_map(|(i1, m)| {
                m.map(|i2| MatchPair {
                    source: i1,
                    target: i2,
                    distance: matched_distance[i2],
                })
            })
            .collect();
        let rejected = self.filter_orientation(&mut matches, |m| {
            Some(f1.keypoint(m.source)?.angle - f2.keypoint(m.target)?.angle)
        });

        let mut filtered: Vec<Option<usize>> = vec![None; n1];
        for m in &matches {
            filtered[m.source] = Some(m.target);
            if let Some(kp2) = f2.keypoint(m.target) {
                prev_matched[m.source] = kp2.pt();
            }
        }

        debug!(
            "[SearchForInitialization] frames {} -> {}: {} matched, {} rejected by rotation",
            f1.id,
            f2.id,
            matches.len(),
            rejected
        );
        filtered
    }
}
