//! Matcher configuration, loadable from YAML.
//!
//! Every field has a default matching the usual ORB-SLAM tuning, so a YAML
//! file only needs to list what it overrides:
//!
//! ```yaml
//! nn_ratio: 0.75
//! check_orientation: false
//! ```

use std::fs::File;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::frame::{MAX_DESCRIPTOR_DISTANCE, TH_HIGH, TH_LOW};

/// Tunable thresholds for correspondence search.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MatcherConfig {
    /// Best/second-best distance ratio; a match needs `best <= nn_ratio * second`.
    pub nn_ratio: f64,
    /// Reject matches whose orientation delta falls outside the dominant histogram bins.
    pub check_orientation: bool,
    /// Strict Hamming threshold.
    pub th_low: u32,
    /// Relaxed Hamming threshold.
    pub th_high: u32,
    /// Number of bins of the rotation histogram.
    pub histogram_bins: usize,
    /// Secondary histogram peaks holding fewer than this fraction of the
    /// largest peak are dropped. 0 keeps the three largest unconditionally.
    pub min_peak_ratio: f64,
    /// Minimum cosine between viewing ray and landmark normal.
    pub view_cos_limit: f64,
    /// 1-DOF chi-square threshold of the epipolar band.
    pub epipolar_chi2: f64,
    /// Keypoints closer than this (px, scaled by level) to the epipole are
    /// rejected for triangulation.
    pub min_epipole_distance: f64,
    /// 2-DOF chi-square gate of monocular fusion.
    pub fuse_chi2_mono: f64,
    /// 3-DOF chi-square gate of stereo fusion.
    pub fuse_chi2_stereo: f64,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            nn_ratio: 0.6,
            check_orientation: true,
            th_low: TH_LOW,
            th_high: TH_HIGH,
            histogram_bins: 30,
            min_peak_ratio: 0.0,
            view_cos_limit: 0.5,
            epipolar_chi2: 3.84,
            min_epipole_distance: 10.0,
            fuse_chi2_mono: 5.99,
            fuse_chi2_stereo: 7.8,
        }
    }
}

impl MatcherConfig {
    /// Load and validate a configuration file.
    pub fn load_from_yaml<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).with_context(|| format!("Failed to open {:?}", path))?;
        let config: Self = serde_yaml::from_reader(file)
            .with_context(|| format!("Failed to parse matcher config {:?}", path))?;
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate a configuration from a YAML string.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml).context("Failed to parse matcher config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.nn_ratio > 0.0 && self.nn_ratio <= 1.0) {
            bail!("nn_ratio must be in (0, 1], got {}", self.nn_ratio);
        }
        if self.th_low > self.th_high {
            bail!("th_low ({}) must not exceed th_high ({})", self.th_low, self.th_high);
        }
        if self.th_high > MAX_DESCRIPTOR_DISTANCE {
            bail!("th_high ({}) exceeds the descriptor length", self.th_high);
        }
        if self.histogram_bins == 0 {
            bail!("histogram_bins must be positive");
        }
        if !(0.0..=1.0).contains(&self.min_peak_ratio) {
            bail!("min_peak_ratio must be in [0, 1], got {}", self.min_peak_ratio);
        }
        if !(-1.0..=1.0).contains(&self.view_cos_limit) {
            bail!("view_cos_limit must be a cosine, got {}", self.view_cos_limit);
        }
        for (name, value) in [
            ("epipolar_chi2", self.epipolar_chi2),
            ("fuse_chi2_mono", self.fuse_chi2_mono),
            ("fuse_chi2_stereo", self.fuse_chi2_stereo),
        ] {
            if !(value > 0.0) {
                bail!("{} must be positive, got {}", name, value);
            }
        }
        if self.min_epipole_distance < 0.0 {
            bail!("min_epipole_distance must not be negative");
        }
        Ok(())
    }
}
