//! ORB keypoints, binary descriptors and the image scale pyramid.

use nalgebra::Point2;

/// ORB-SLAM matching thresholds.
pub const TH_HIGH: u32 = 100; // Relaxed descriptor distance for acceptance
pub const TH_LOW: u32 = 50; // Strict threshold

/// Largest possible Hamming distance between two 256-bit descriptors.
pub const MAX_DESCRIPTOR_DISTANCE: u32 = 256;

/// Bytes in one ORB descriptor.
pub const DESCRIPTOR_BYTES: usize = 32;

/// A 256-bit ORB descriptor.
pub type Descriptor = [u8; DESCRIPTOR_BYTES];

/// A detected keypoint.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KeyPoint {
    /// Pixel x coordinate (undistorted).
    pub x: f64,
    /// Pixel y coordinate (undistorted).
    pub y: f64,
    /// Dominant orientation in degrees, [0, 360).
    pub angle: f64,
    /// Pyramid level the keypoint was detected at.
    pub octave: usize,
}

impl KeyPoint {
    pub fn new(x: f64, y: f64, angle: f64, octave: usize) -> Self {
        Self { x, y, angle, octave }
    }

    pub fn pt(&self) -> Point2<f64> {
        Point2::new(self.x, self.y)
    }
}

/// A set of ORB features extracted from an image.
#[derive(Debug, Clone, Default)]
pub struct FeatureSet {
    pub keypoints: Vec<KeyPoint>,
    pub descriptors: Vec<Descriptor>,
}

impl FeatureSet {
    pub fn new(keypoints: Vec<KeyPoint>, descriptors: Vec<Descriptor>) -> Self {
        Self {
            keypoints,
            descriptors,
        }
    }

    pub fn len(&self) -> usize {
        self.keypoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keypoints.is_empty()
    }
}

/// Compute Hamming distance between two ORB descriptors.
/// Returns the number of differing bits.
#[inline]
pub fn descriptor_distance(a: &Descriptor, b: &Descriptor) -> u32 {
    a.iter().zip(b.iter()).map(|(x, y)| (x ^ y).count_ones()).sum()
}

/// Per-level scale information of the ORB image pyramid.
///
/// Level `n` is downsampled by `scale_factor^n`; its keypoint position
/// variance grows with the square of that factor.
#[derive(Debug, Clone)]
pub struct ScalePyramid {
    scale_factor: f64,
    log_scale_factor: f64,
    scale_factors: Vec<f64>,
    inv_scale_factors: Vec<f64>,
    level_sigma2: Vec<f64>,
    inv_level_sigma2: Vec<f64>,
}

impl ScalePyramid {
    /// Build a pyramid with `num_levels` levels (at least one).
    pub fn new(scale_factor: f64, num_levels: usize) -> Self {
        let num_levels = num_levels.max(1);
        let scale_factors: Vec<f64> = (0..num_levels)
            .map(|level| scale_factor.powi(level as i32))
            .collect();
        let level_sigma2: Vec<f64> = scale_factors.iter().map(|s| s * s).collect();

        Self {
            scale_factor,
            log_scale_factor: scale_factor.ln(),
            inv_scale_factors: scale_factors.iter().map(|s| 1.0 / s).collect(),
            inv_level_sigma2: level_sigma2.iter().map(|s| 1.0 / s).collect(),
            scale_factors,
            level_sigma2,
        }
    }

    pub fn num_levels(&self) -> usize {
        self.scale_factors.len()
    }

    pub fn scale_factor(&self) -> f64 {
        self.scale_factor
    }

    pub fn log_scale_factor(&self) -> f64 {
        self.log_scale_factor
    }

    /// Scale factor of a level; levels past the top clamp to the top level.
    pub fn scale(&self, level: usize) -> f64 {
        self.scale_factors[self.clamp_level(level)]
    }

    pub fn inv_scale(&self, level: usize) -> f64 {
        self.inv_scale_factors[self.clamp_level(level)]
    }

    pub fn sigma2(&self, level: usize) -> f64 {
        self.level_sigma2[self.clamp_level(level)]
    }

    pub fn inv_sigma2(&self, level: usize) -> f64 {
        self.inv_level_sigma2[self.clamp_level(level)]
    }

    /// Ratio between the finest and coarsest level scale.
    pub fn max_scale(&self) -> f64 {
        self.scale(self.num_levels() - 1)
    }

    /// Index of the top (coarsest) level.
    pub fn max_level(&self) -> usize {
        self.num_levels() - 1
    }

    fn clamp_level(&self, level: usize) -> usize {
        level.min(self.scale_factors.len() - 1)
    }
}

impl Default for ScalePyramid {
    fn default() -> Self {
        Self::new(1.2, 8)
    }
}
