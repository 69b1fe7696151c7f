//! Spatial grid over keypoints for windowed candidate lookup.

use super::features::KeyPoint;

/// Spatial grid for O(1) feature lookup.
///
/// The grid divides the image into GRID_COLS × GRID_ROWS cells.
/// Each cell stores indices of features whose keypoints fall within that cell,
/// so a radius query only touches the cells overlapping the search window.
#[derive(Debug, Clone)]
pub struct FeatureGrid {
    /// Grid cells stored row-major: cell[row * grid_cols + col]
    cells: Vec<Vec<usize>>,
    grid_element_width_inv: f64,
    grid_element_height_inv: f64,
    grid_cols: usize,
    grid_rows: usize,
}

impl FeatureGrid {
    pub const GRID_COLS: usize = 64;
    pub const GRID_ROWS: usize = 48;

    /// Create a new feature grid from keypoints.
    ///
    /// Keypoints outside the image are clamped into the border cells.
    pub fn new(keypoints: &[KeyPoint], img_width: f64, img_height: f64) -> Self {
        let grid_element_width_inv = Self::GRID_COLS as f64 / img_width.max(1.0);
        let grid_element_height_inv = Self::GRID_ROWS as f64 / img_height.max(1.0);

        let mut cells: Vec<Vec<usize>> = vec![Vec::new(); Self::GRID_COLS * Self::GRID_ROWS];

        for (idx, kp) in keypoints.iter().enumerate() {
            let cell_x = ((kp.x * grid_element_width_inv).max(0.0) as usize).min(Self::GRID_COLS - 1);
            let cell_y = ((kp.y * grid_element_height_inv).max(0.0) as usize).min(Self::GRID_ROWS - 1);
            cells[cell_y * Self::GRID_COLS + cell_x].push(idx);
        }

        Self {
            cells,
            grid_element_width_inv,
            grid_element_height_inv,
            grid_cols: Self::GRID_COLS,
            grid_rows: Self::GRID_ROWS,
        }
    }

    /// Get feature indices within a circular search region.
    ///
    /// # Arguments
    /// * `x`, `y` - Query pixel
    /// * `r` - Search radius in pixels
    /// * `min_level` - Minimum pyramid level (inclusive), or None for no minimum
    /// * `max_level` - Maximum pyramid level (inclusive), or None for no maximum
    /// * `keypoints` - The keypoints this grid was built from
    ///
    /// # Returns
    /// Indices of keypoints within radius `r` of (x, y), ascending.
    pub fn get_features_in_area(
        &self,
        x: f64,
        y: f64,
        r: f64,
        min_level: Option<usize>,
        max_level: Option<usize>,
        keypoints: &[KeyPoint],
    ) -> Vec<usize> {
        if !(x.is_finite() && y.is_finite() && r >= 0.0) {
            return Vec::new();
        }

        let min_cell_x = ((x - r) * self.grid_element_width_inv).floor();
        let max_cell_x = ((x + r) * self.grid_element_width_inv).ceil();
        let min_cell_y = ((y - r) * self.grid_element_height_inv).floor();
        let max_cell_y = ((y + r) * self.grid_element_height_inv).ceil();

        if max_cell_x < 0.0 || max_cell_y < 0.0 {
            return Vec::new();
        }
        if min_cell_x >= self.grid_cols as f64 || min_cell_y >= self.grid_rows as f64 {
            return Vec::new();
        }

        let min_cell_x = min_cell_x.max(0.0) as usize;
        let max_cell_x = (max_cell_x as usize).min(self.grid_cols - 1);
        let min_cell_y = min_cell_y.max(0.0) as usize;
        let max_cell_y = (max_cell_y as usize).min(self.grid_rows - 1);

        let r_sq = r * r;
        let mut indices = Vec::new();

        for cell_y in min_cell_y..=max_cell_y {
            for cell_x in min_cell_x..=max_cell_x {
                for &idx in &self.cells[cell_y * self.grid_cols + cell_x] {
                    let Some(kp) = keypoints.get(idx) else {
                        continue;
                    };
                    if min_level.is_some_and(|min| kp.octave < min) {
                        continue;
                    }
                    if max_level.is_some_and(|max| kp.octave > max) {
                        continue;
                    }
                    let dx = kp.x - x;
                    let dy = kp.y - y;
                    if dx * dx + dy * dy <= r_sq {
                        indices.push(idx);
                    }
                }
            }
        }

        indices.sort_unstable();
        indices
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keypoints() -> Vec<KeyPoint> {
        vec![
            KeyPoint::new(100.0, 100.0, 0.0, 0),
            KeyPoint::new(103.0, 104.0, 0.0, 1),
            KeyPoint::new(110.0, 100.0, 0.0, 2),
            KeyPoint::new(600.0, 400.0, 0.0, 0),
        ]
    }

    #[test]
    fn test_radius_query() {
        let kps = keypoints();
        let grid = FeatureGrid::new(&kps, 640.0, 480.0);

        assert_eq!(grid.get_features_in_area(100.0, 100.0, 5.0, None, None, &kps), vec![0, 1]);
        assert_eq!(
            grid.get_features_in_area(100.0, 100.0, 10.0, None, None, &kps),
            vec![0, 1, 2]
        );
        assert!(grid.get_features_in_area(300.0, 300.0, 5.0, None, None, &kps).is_empty());
    }

    #[test]
    fn test_level_filter() {
        let kps = keypoints();
        let grid = FeatureGrid::new(&kps, 640.0, 480.0);

        assert_eq!(
            grid.get_features_in_area(100.0, 100.0, 10.0, Some(1), None, &kps),
            vec![1, 2]
        );
        assert_eq!(
            grid.get_features_in_area(100.0, 100.0, 10.0, None, Some(1), &kps),
            vec![0, 1]
        );
        assert_eq!(
            grid.get_features_in_area(100.0, 100.0, 10.0, Some(1), Some(1), &kps),
            vec![1]
        );
    }

    #[test]
    fn test_query_outside_image() {
        let kps = keypoints();
        let grid = FeatureGrid::new(&kps, 640.0, 480.0);
        assert!(grid.get_features_in_area(-100.0, -100.0, 5.0, None, None, &kps).is_empty());
        assert!(grid.get_features_in_area(2000.0, 100.0, 5.0, None, None, &kps).is_empty());
        assert_eq!(grid.get_features_in_area(-2.0, 100.0, 8.0, None, None, &kps).len(), 0);
        assert_eq!(grid.get_features_in_area(640.0, 480.0, 100.0, None, None, &kps), vec![3]);
    }
}
