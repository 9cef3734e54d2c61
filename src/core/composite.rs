use crate::types::{
    GeoTransform, MultiBandRaster, Raster, Sample, SampleImage, Tile, VerdureError, VerdureResult,
};
use chrono::NaiveDate;
use ndarray::{s, ArrayView2, Zip};
use num_traits::Float;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Per-pixel reduction across acquisition dates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompositeStatistic {
    /// Robust to residual cloud and shadow outliers
    Median,
    Mean,
}

/// Temporal composite parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompositeParams {
    /// Samples at or below this value are retrieval artifacts and excluded
    pub validity_threshold: Sample,
    pub statistic: CompositeStatistic,
}

impl Default for CompositeParams {
    fn default() -> Self {
        Self {
            validity_threshold: 0.0,
            statistic: CompositeStatistic::Median,
        }
    }
}

/// Result of compositing several bands; failed bands do not stop the others
#[derive(Debug)]
pub struct CompositeOutcome {
    pub composite: Option<MultiBandRaster>,
    pub failures: Vec<(String, VerdureError)>,
}

/// Output grid covering a set of rasters
#[derive(Debug, Clone, Copy)]
struct UnionGrid {
    geo_transform: GeoTransform,
    shape: (usize, usize),
}

impl UnionGrid {
    fn covering(rasters: &[&Raster]) -> VerdureResult<Self> {
        let first = rasters.first().ok_or_else(|| {
            VerdureError::Processing("Cannot build a grid from zero rasters".to_string())
        })?;
        let reference = first.geo_transform;
        if reference.is_rotated() {
            return Err(VerdureError::Processing(
                "Rotated rasters cannot be merged".to_string(),
            ));
        }

        let mut extent = first.extent();
        for raster in &rasters[1..] {
            raster.ensure_same_crs(&first.crs)?;
            if !raster.geo_transform.same_resolution(&reference) || raster.geo_transform.is_rotated() {
                return Err(VerdureError::Processing(format!(
                    "Resolution mismatch: {}x{} vs {}x{}",
                    raster.geo_transform.pixel_width,
                    raster.geo_transform.pixel_height,
                    reference.pixel_width,
                    reference.pixel_height
                )));
            }
            extent = extent.union(&raster.extent());
        }

        let top_left_x = if reference.pixel_width > 0.0 { extent.min_x } else { extent.max_x };
        let top_left_y = if reference.pixel_height < 0.0 { extent.max_y } else { extent.min_y };
        let cols = (extent.width() / reference.pixel_width.abs()).round() as usize;
        let rows = (extent.height() / reference.pixel_height.abs()).round() as usize;

        Ok(Self {
            geo_transform: GeoTransform {
                top_left_x,
                top_left_y,
                ..reference
            },
            shape: (rows, cols),
        })
    }

    /// Pixel offset of a raster's top-left corner inside this grid
    fn offset_of(&self, raster: &Raster) -> (usize, usize) {
        let (col, row) = self
            .geo_transform
            .world_to_pixel(raster.geo_transform.top_left_x, raster.geo_transform.top_left_y);
        (row.round().max(0.0) as usize, col.round().max(0.0) as usize)
    }

    /// Write a raster's valid samples into `target`
    fn paint(&self, target: &mut SampleImage, raster: &Raster) {
        let (row_off, col_off) = self.offset_of(raster);
        let (rows, cols) = raster.shape();
        let row_end = (row_off + rows).min(self.shape.0);
        let col_end = (col_off + cols).min(self.shape.1);
        if row_off >= row_end || col_off >= col_end {
            return;
        }

        let mut window = target.slice_mut(s![row_off..row_end, col_off..col_end]);
        let source = raster.data.slice(s![..row_end - row_off, ..col_end - col_off]);
        Zip::from(&mut window).and(&source).for_each(|out, &value| {
            if !value.is_nan() {
                *out = value;
            }
        });
    }

    fn realign(&self, raster: &Raster) -> Raster {
        if raster.geo_transform == self.geo_transform && raster.shape() == self.shape {
            return raster.clone();
        }
        let mut data = SampleImage::from_elem(self.shape, Sample::NAN);
        self.paint(&mut data, raster);
        Raster {
            data,
            geo_transform: self.geo_transform,
            crs: raster.crs.clone(),
            nodata: raster.nodata,
        }
    }
}

/// Spatially merge same-band, same-date tiles into one raster over their union.
///
/// Overlaps resolve in input order: a later tile overwrites an earlier one
/// wherever the later tile has a valid sample.
pub fn merge_tiles(rasters: &[Raster]) -> VerdureResult<Raster> {
    let refs: Vec<&Raster> = rasters.iter().collect();
    let grid = UnionGrid::covering(&refs)?;
    log::debug!(
        "Merging {} tiles into {}x{} grid",
        rasters.len(),
        grid.shape.0,
        grid.shape.1
    );

    let mut data = SampleImage::from_elem(grid.shape, Sample::NAN);
    for raster in rasters {
        grid.paint(&mut data, raster);
    }

    Ok(Raster {
        data,
        geo_transform: grid.geo_transform,
        crs: rasters[0].crs.clone(),
        nodata: rasters[0].nodata,
    })
}

/// Median of a slice, averaging the two middle values for even lengths.
/// Reorders the slice. Returns NaN when empty.
pub fn median_of<T: Float>(values: &mut [T]) -> T {
    let n = values.len();
    if n == 0 {
        return T::nan();
    }
    values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    if n % 2 == 1 {
        values[n / 2]
    } else {
        let two = T::one() + T::one();
        (values[n / 2 - 1] + values[n / 2]) / two
    }
}

fn mean_of<T: Float>(values: &[T]) -> T {
    if values.is_empty() {
        return T::nan();
    }
    let sum = values.iter().fold(T::zero(), |acc, &v| acc + v);
    sum / <T as num_traits::NumCast>::from(values.len()).unwrap_or_else(T::one)
}

/// Per-pixel reduction of same-shape layers
pub fn composite_layers(layers: &[ArrayView2<Sample>], params: &CompositeParams) -> VerdureResult<SampleImage> {
    let shape = layers
        .first()
        .map(|l| l.dim())
        .ok_or_else(|| VerdureError::Processing("Cannot composite zero layers".to_string()))?;
    if let Some(bad) = layers.iter().find(|l| l.dim() != shape) {
        return Err(VerdureError::ShapeMismatch {
            expected: shape,
            found: bad.dim(),
        });
    }

    let threshold = params.validity_threshold;
    let statistic = params.statistic;
    let mut data = SampleImage::from_elem(shape, Sample::NAN);

    Zip::indexed(&mut data).par_for_each(|(row, col), out| {
        let mut valid: Vec<Sample> = layers
            .iter()
            .map(|l| l[[row, col]])
            .filter(|v| v.is_finite() && *v > threshold)
            .collect();
        *out = match statistic {
            CompositeStatistic::Median => median_of(&mut valid),
            CompositeStatistic::Mean => mean_of(&valid),
        };
    });

    Ok(data)
}

/// Reduce per-date rasters of one band to a single composite.
///
/// Samples that are missing or at/below the validity threshold are excluded
/// before reduction; a pixel with no valid date stays missing.
pub fn temporal_composite(rasters: &[Raster], params: &CompositeParams) -> VerdureResult<Raster> {
    let refs: Vec<&Raster> = rasters.iter().collect();
    let grid = UnionGrid::covering(&refs)?;
    let aligned: Vec<Raster> = rasters.iter().map(|r| grid.realign(r)).collect();

    log::debug!(
        "Compositing {} dates over {}x{} pixels ({:?})",
        aligned.len(),
        grid.shape.0,
        grid.shape.1,
        params.statistic
    );

    let layers: Vec<ArrayView2<Sample>> = aligned.iter().map(|r| r.data.view()).collect();
    let data = composite_layers(&layers, params)?;

    Ok(Raster {
        data,
        geo_transform: grid.geo_transform,
        crs: rasters[0].crs.clone(),
        nodata: rasters[0].nodata,
    })
}

/// Merge tiles per date, then composite across dates, for one band
pub fn composite_band(tiles: &[&Tile], band: &str, params: &CompositeParams) -> VerdureResult<Raster> {
    let mut by_date: BTreeMap<NaiveDate, Vec<Raster>> = BTreeMap::new();
    for tile in tiles.iter().filter(|t| t.band == band) {
        by_date.entry(tile.acquired).or_default().push(tile.raster.clone());
    }

    if by_date.is_empty() {
        return Err(VerdureError::MissingBand(band.to_string()));
    }

    let per_date = by_date
        .iter()
        .map(|(date, rasters)| {
            log::debug!("Band {} on {}: merging {} tiles", band, date, rasters.len());
            merge_tiles(rasters)
        })
        .collect::<VerdureResult<Vec<_>>>()?;

    temporal_composite(&per_date, params)
}

/// Composite every requested band; a band with no tiles is reported, not fatal
pub fn composite_bands(tiles: &[Tile], bands: &[String], params: &CompositeParams) -> CompositeOutcome {
    log::info!(
        "🧩 Compositing {} bands from {} tiles",
        bands.len(),
        tiles.len()
    );
    let tile_refs: Vec<&Tile> = tiles.iter().collect();

    let results: Vec<(String, VerdureResult<Raster>)> = bands
        .par_iter()
        .map(|band| (band.clone(), composite_band(&tile_refs, band, params)))
        .collect();

    let mut successes = Vec::new();
    let mut failures = Vec::new();
    for (band, result) in results {
        match result {
            Ok(raster) => successes.push((band, raster)),
            Err(e) => {
                log::warn!("Band {} not composited: {}", band, e);
                failures.push((band, e));
            }
        }
    }

    let composite = if successes.is_empty() {
        None
    } else {
        match stack_on_common_grid(successes) {
            Ok(stack) => Some(stack),
            Err(e) => {
                log::error!("Could not stack composited bands: {}", e);
                failures.push(("*".to_string(), e));
                None
            }
        }
    };

    CompositeOutcome { composite, failures }
}

fn stack_on_common_grid(bands: Vec<(String, Raster)>) -> VerdureResult<MultiBandRaster> {
    let refs: Vec<&Raster> = bands.iter().map(|(_, r)| r).collect();
    let grid = UnionGrid::covering(&refs)?;
    let aligned = bands
        .into_iter()
        .map(|(name, raster)| (name, grid.realign(&raster)))
        .collect();
    MultiBandRaster::from_bands(aligned)
}
