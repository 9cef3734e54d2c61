//! Vegetation patch structure
//!
//! Thresholds a vegetation index into a binary mask, labels connected
//! patches and summarises patch size and boundary density.

use crate::types::{Raster, Sample};
use ndarray::{Array2, ArrayView2};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Pixel neighbourhood used to connect patches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Connectivity {
    /// N/S/E/W neighbours only
    Four,
    /// Includes diagonals
    Eight,
}

impl Connectivity {
    fn offsets(&self) -> &'static [(isize, isize)] {
        static FOUR: [(isize, isize); 4] = [(-1, 0), (1, 0), (0, -1), (0, 1)];
        static EIGHT: [(isize, isize); 8] = [
            (-1, -1),
            (-1, 0),
            (-1, 1),
            (0, -1),
            (0, 1),
            (1, -1),
            (1, 0),
            (1, 1),
        ];
        match self {
            Connectivity::Four => &FOUR,
            Connectivity::Eight => &EIGHT,
        }
    }
}

/// Patch analysis parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PatchParams {
    /// Index values strictly above this are vegetation
    pub threshold: Sample,
    pub connectivity: Connectivity,
}

impl Default for PatchParams {
    fn default() -> Self {
        Self {
            threshold: 0.3,
            connectivity: Connectivity::Four,
        }
    }
}

/// Connected-component labels; 0 is background, patches are 1..=count
#[derive(Debug, Clone)]
pub struct LabeledPatches {
    pub labels: Array2<u32>,
    /// Pixel count of patch `i + 1` at index `i`
    pub sizes: Vec<usize>,
}

impl LabeledPatches {
    pub fn count(&self) -> usize {
        self.sizes.len()
    }

    /// Arithmetic mean patch size, NaN when there are no patches
    pub fn mean_size(&self) -> f64 {
        if self.sizes.is_empty() {
            return f64::NAN;
        }
        self.sizes.iter().sum::<usize>() as f64 / self.sizes.len() as f64
    }
}

/// Fixed-shape summary of vegetation structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatchStatistics {
    /// Non-missing index pixels
    pub total_pixels: usize,
    pub vegetation_pixels: usize,
    pub patch_count: usize,
    /// NaN when there are no patches
    pub mean_patch_size: f64,
    /// Boundary pixels divided by the full raster size
    pub edge_density: f64,
}

impl PatchStatistics {
    /// Vegetation share of valid pixels, NaN when nothing is valid
    pub fn vegetation_fraction(&self) -> f64 {
        if self.total_pixels == 0 {
            return f64::NAN;
        }
        self.vegetation_pixels as f64 / self.total_pixels as f64
    }
}

/// Vegetation where index > threshold; missing samples are never vegetation
pub fn vegetation_mask(index: ArrayView2<Sample>, threshold: Sample) -> Array2<bool> {
    index.mapv(|v| v > threshold)
}

/// Label connected true-valued regions by breadth-first flood fill
pub fn label_patches(mask: ArrayView2<bool>, connectivity: Connectivity) -> LabeledPatches {
    let (rows, cols) = mask.dim();
    let mut labels = Array2::<u32>::zeros((rows, cols));
    let mut sizes = Vec::new();
    let mut queue = VecDeque::new();
    let offsets = connectivity.offsets();

    for start_row in 0..rows {
        for start_col in 0..cols {
            if !mask[[start_row, start_col]] || labels[[start_row, start_col]] != 0 {
                continue;
            }

            let label = sizes.len() as u32 + 1;
            let mut size = 0usize;
            labels[[start_row, start_col]] = label;
            queue.push_back((start_row, start_col));

            while let Some((row, col)) = queue.pop_front() {
                size += 1;
                for &(dr, dc) in offsets {
                    let nr = row as isize + dr;
                    let nc = col as isize + dc;
                    if nr < 0 || nc < 0 || nr >= rows as isize || nc >= cols as isize {
                        continue;
                    }
                    let (nr, nc) = (nr as usize, nc as usize);
                    if mask[[nr, nc]] && labels[[nr, nc]] == 0 {
                        labels[[nr, nc]] = label;
                        queue.push_back((nr, nc));
                    }
                }
            }

            sizes.push(size);
        }
    }

    LabeledPatches { labels, sizes }
}

/// Pixels where the 3x3 kernel [[1,1,1],[1,-8,1],[1,1,1]] applied to the
/// 0/1 mask with zero padding is non-zero. Counts both sides of every
/// boundary: edge vegetation pixels and the background pixels touching them.
pub fn edge_pixel_count(mask: ArrayView2<bool>) -> usize {
    let (rows, cols) = mask.dim();
    let mut count = 0usize;

    for row in 0..rows {
        for col in 0..cols {
            let mut response: i32 = if mask[[row, col]] { -8 } else { 0 };
            for dr in -1isize..=1 {
                for dc in -1isize..=1 {
                    if dr == 0 && dc == 0 {
                        continue;
                    }
                    let nr = row as isize + dr;
                    let nc = col as isize + dc;
                    if nr < 0 || nc < 0 || nr >= rows as isize || nc >= cols as isize {
                        continue;
                    }
                    if mask[[nr as usize, nc as usize]] {
                        response += 1;
                    }
                }
            }
            if response != 0 {
                count += 1;
            }
        }
    }

    count
}

/// Summarise patch structure of a vegetation index grid.
///
/// Edge density divides by every pixel of the grid, missing ones included,
/// so heavily cropped or partially covered zones read lower.
pub fn analyze_patches(index: ArrayView2<Sample>, params: &PatchParams) -> PatchStatistics {
    let total_pixels = index.iter().filter(|v| !v.is_nan()).count();
    let mask = vegetation_mask(index, params.threshold);
    let vegetation_pixels = mask.iter().filter(|&&v| v).count();

    let patches = label_patches(mask.view(), params.connectivity);
    let edges = edge_pixel_count(mask.view());
    let edge_density = if mask.is_empty() {
        f64::NAN
    } else {
        edges as f64 / mask.len() as f64
    };

    log::debug!(
        "Patch analysis: {} valid, {} vegetation, {} patches, {} edge pixels",
        total_pixels,
        vegetation_pixels,
        patches.count(),
        edges
    );

    PatchStatistics {
        total_pixels,
        vegetation_pixels,
        patch_count: patches.count(),
        mean_patch_size: patches.mean_size(),
        edge_density,
    }
}

pub fn analyze_raster(index: &Raster, params: &PatchParams) -> PatchStatistics {
    analyze_patches(index.data.view(), params)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn test_empty_mask_has_no_patches_and_nan_mean() {
        let mask = Array2::from_elem((5, 5), false);
        let patches = label_patches(mask.view(), Connectivity::Four);
        assert_eq!(patches.count(), 0);
        assert!(patches.mean_size().is_nan());
        assert_eq!(edge_pixel_count(mask.view()), 0);
    }

    #[test]
    fn test_single_blob() {
        let mut mask = Array2::from_elem((6, 6), false);
        for r in 1..4 {
            for c in 1..5 {
                mask[[r, c]] = true;
            }
        }
        mask[[4, 2]] = true;
        let patches = label_patches(mask.view(), Connectivity::Four);
        assert_eq!(patches.sizes, vec![13]);
        assert!(edge_pixel_count(mask.view()) > 0);
    }

    #[test]
    fn test_diagonal_pixels_depend_on_connectivity() {
        let mask = array![[true, false], [false, true]];
        let four = label_patches(mask.view(), Connectivity::Four);
        assert_eq!(four.count(), 2);
        assert_eq!(four.labels, array![[1u32, 0], [0, 2]]);

        let eight = label_patches(mask.view(), Connectivity::Eight);
        assert_eq!(eight.count(), 1);
        assert_eq!(eight.sizes, vec![2]);
    }

    #[test]
    fn test_interior_pixels_are_not_edges() {
        let mask = Array2::from_elem((3, 3), true);
        // Only the centre has all eight neighbours set
        assert_eq!(edge_pixel_count(mask.view()), 8);
    }

    #[test]
    fn test_corner_block_statistics() {
        let index = array![
            [0.8f32, 0.7, 0.1, 0.0],
            [0.6, 0.9, 0.2, 0.1],
            [0.1, 0.2, 0.0, 0.1],
            [0.0, 0.1, 0.2, 0.3],
        ];
        let stats = analyze_patches(index.view(), &PatchParams::default());
        assert_eq!(stats.total_pixels, 16);
        assert_eq!(stats.vegetation_pixels, 4);
        assert_eq!(stats.patch_count, 1);
        assert_abs_diff_eq!(stats.mean_patch_size, 4.0);
        // 4 block pixels plus 5 touching background pixels
        assert_abs_diff_eq!(stats.edge_density, 9.0 / 16.0);
        assert_abs_diff_eq!(stats.vegetation_fraction(), 0.25);
    }

    #[test]
    fn test_threshold_is_strict() {
        let index = array![[0.3f32, 0.31]];
        let mask = vegetation_mask(index.view(), 0.3);
        assert_eq!(mask, array![[false, true]]);
    }

    #[test]
    fn test_missing_pixels_are_background_but_count_in_edge_denominator() {
        let nan = Sample::NAN;
        let index = array![
            [0.9f32, nan, nan, nan],
            [nan, nan, nan, nan],
        ];
        let stats = analyze_patches(index.view(), &PatchParams::default());
        assert_eq!(stats.total_pixels, 1);
        assert_eq!(stats.patch_count, 1);
        // Vegetation pixel plus its three in-bounds neighbours, over all 8 pixels
        assert_abs_diff_eq!(stats.edge_density, 4.0 / 8.0);
        assert_abs_diff_eq!(stats.vegetation_fraction(), 1.0);
    }
}
