//! Tidy per-pixel feature table for clustering
//!
//! One row per pixel with a complete feature vector, in row-major pixel
//! order, carrying the pixel centre coordinates.

use crate::types::{MultiBandRaster, Sample, VerdureError, VerdureResult};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureMatrixParams {
    /// Band names excluded from the feature vector (e.g. thermal bands)
    pub drop_bands: Vec<String>,
}

impl FeatureMatrixParams {
    /// Drop bands by number, naming them the way HLS granules do (`B10`)
    pub fn dropping_band_numbers(numbers: &[u32]) -> Self {
        Self {
            drop_bands: numbers.iter().map(|n| format!("B{:02}", n)).collect(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FeatureMatrix {
    /// (x, y) pixel centre of each row
    pub coords: Vec<(f64, f64)>,
    pub band_names: Vec<String>,
    /// rows x bands
    pub values: Array2<Sample>,
}

impl FeatureMatrix {
    pub fn n_rows(&self) -> usize {
        self.values.nrows()
    }

    pub fn n_features(&self) -> usize {
        self.values.ncols()
    }

    /// Write `x, y` then one column per band
    pub fn write_csv<P: AsRef<Path>>(&self, path: P) -> VerdureResult<()> {
        let mut writer = csv::Writer::from_path(path.as_ref())?;

        let mut header = vec!["x".to_string(), "y".to_string()];
        header.extend(self.band_names.iter().cloned());
        writer.write_record(&header)?;

        for (row, &(x, y)) in self.values.outer_iter().zip(&self.coords) {
            let mut fields = Vec::with_capacity(row.len() + 2);
            fields.push(x.to_string());
            fields.push(y.to_string());
            fields.extend(row.iter().map(|v| v.to_string()));
            writer.write_record(&fields)?;
        }

        writer.flush()?;
        log::info!(
            "Wrote feature table {} ({} rows, {} features)",
            path.as_ref().display(),
            self.n_rows(),
            self.n_features()
        );
        Ok(())
    }
}

/// Flatten a composite into a feature matrix, dropping pixels where any kept band is missing
pub fn build_feature_matrix(composite: &MultiBandRaster, params: &FeatureMatrixParams) -> VerdureResult<FeatureMatrix> {
    let kept: Vec<(usize, String)> = composite
        .band_names
        .iter()
        .enumerate()
        .filter(|(_, name)| !params.drop_bands.contains(*name))
        .map(|(i, name)| (i, name.clone()))
        .collect();

    if kept.is_empty() {
        return Err(VerdureError::Processing(
            "Every band was excluded from the feature matrix".to_string(),
        ));
    }

    let (rows, cols) = composite.shape();
    let gt = composite.geo_transform;
    let mut coords = Vec::new();
    let mut flat: Vec<Sample> = Vec::new();
    let mut pixel = Vec::with_capacity(kept.len());

    for row in 0..rows {
        for col in 0..cols {
            pixel.clear();
            pixel.extend(kept.iter().map(|&(b, _)| composite.data[[b, row, col]]));
            if pixel.iter().any(|v| v.is_nan()) {
                continue;
            }
            coords.push(gt.pixel_center(row, col));
            flat.extend_from_slice(&pixel);
        }
    }

    let n_rows = coords.len();
    let values = Array2::from_shape_vec((n_rows, kept.len()), flat)
        .map_err(|e| VerdureError::Processing(format!("Feature matrix shape error: {}", e)))?;

    log::info!(
        "Feature matrix: {} of {} pixels complete across {} bands",
        n_rows,
        rows * cols,
        kept.len()
    );

    Ok(FeatureMatrix {
        coords,
        band_names: kept.into_iter().map(|(_, name)| name).collect(),
        values,
    })
}
