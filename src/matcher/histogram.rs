//! Rotation histogram for orientation-consistency filtering.
//!
//! Correct matches between two views share roughly the same in-plane
//! rotation, so their keypoint angle differences pile up in a few bins.
//! Matches outside the dominant bins are dropped.

/// Call-scoped histogram of keypoint angle differences.
#[derive(Debug, Clone)]
pub struct RotationHistogram {
    bins: Vec<Vec<usize>>,
}

impl RotationHistogram {
    /// Create a histogram with `num_bins` equal-width bins over [0°, 360°).
    pub fn new(num_bins: usize) -> Self {
        Self {
            bins: vec![Vec::new(); num_bins.max(1)],
        }
    }

    pub fn num_bins(&self) -> usize {
        self.bins.len()
    }

    /// Bin of an angle difference in degrees (any sign, any magnitude).
    pub fn bin_of(&self, rotation_deg: f64) -> usize {
        let len = self.bins.len();
        if !rotation_deg.is_finite() {
            return 0;
        }
        let rot = rotation_deg.rem_euclid(360.0);
        ((rot * len as f64 / 360.0).floor() as usize) % len
    }

    /// Record the angle difference of the match identified by `match_idx`.
    pub fn add(&mut self, rotation_deg: f64, match_idx: usize) {
        let bin = self.bin_of(rotation_deg);
        self.bins[bin].push(match_idx);
    }

    /// The three most populated non-empty bins, ties broken by lower index.
    ///
    /// When `min_peak_ratio` is positive, the second and third peaks are
    /// dropped if they hold fewer than `min_peak_ratio * max` entries.
    pub fn three_maxima(&self, min_peak_ratio: f64) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.bins.len())
            .filter(|&b| !self.bins[b].is_empty())
            .collect();
        // Stable sort keeps lower indices first among equal counts.
        order.sort_by(|&a, &b| self.bins[b].len().cmp(&self.bins[a].len()));
        order.truncate(3);

        if let Some(&first) = order.first() {
            let floor = min_peak_ratio * self.bins[first].len() as f64;
            let mut kept = 1;
            for &bin in order.iter().skip(1) {
                if (self.bins[bin].len() as f64) < floor {
                    break;
                }
                kept += 1;
            }
            order.truncate(kept);
        }
        order
    }

    /// Every recorded match that falls outside the dominant bins.
    pub fn rejected(&self, min_peak_ratio: f64) -> Vec<usize> {
        let keep = self.three_maxima(min_peak_ratio);
        let mut rejected: Vec<usize> = self
            .bins
            .iter()
            .enumerate()
            .filter(|(bin, _)| !keep.contains(bin))
            .flat_map(|(_, entries)| entries.iter().copied())
            .collect();
        rejected.sort_unstable();
        rejected
    }
}
