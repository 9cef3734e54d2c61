//! Zone rasterization and zonal statistics
//!
//! Zones are matched to pixels by pixel centre, except for
//! [`clip_touching_geometry`] which keeps every pixel the zone overlaps.
//! Geometries must already be in the raster's CRS.

use crate::types::{Raster, Sample, VerdureResult, Zone};
use crate::types::GeoTransform;
use geo::{BoundingRect, Contains, Intersects, LineString, MultiPolygon, Point, Polygon};
use ndarray::{Array2, Zip};
use serde::{Deserialize, Serialize};

/// Statistics of index values inside one zone
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZonalSummary {
    pub zone: String,
    pub count: usize,
    pub sum: f64,
    pub mean: f64,
    pub min: f64,
    pub max: f64,
    pub std_dev: f64,
}

fn centre_inside(geometry: &MultiPolygon<f64>, x: f64, y: f64) -> bool {
    geometry.contains(&Point::new(x, y))
}

/// Set pixels whose centre lies outside the geometry to missing
pub fn clip_to_geometry(raster: &Raster, geometry: &MultiPolygon<f64>) -> Raster {
    let gt = raster.geo_transform;
    let mut data = raster.data.clone();
    Zip::indexed(&mut data).par_for_each(|(row, col), value| {
        let (x, y) = gt.pixel_center(row, col);
        if !centre_inside(geometry, x, y) {
            *value = Sample::NAN;
        }
    });
    raster.with_data(data)
}

/// Footprint of a pixel, inset so that a shared edge or corner alone does
/// not count as overlap
fn pixel_footprint(gt: &GeoTransform, row: usize, col: usize) -> Polygon<f64> {
    const INSET: f64 = 1e-6;
    let corner = |c: f64, r: f64| {
        (
            gt.top_left_x + c * gt.pixel_width + r * gt.rotation_x,
            gt.top_left_y + c * gt.rotation_y + r * gt.pixel_height,
        )
    };
    let (c0, r0) = (col as f64 + INSET, row as f64 + INSET);
    let (c1, r1) = (col as f64 + 1.0 - INSET, row as f64 + 1.0 - INSET);
    Polygon::new(
        LineString::from(vec![corner(c0, r0), corner(c1, r0), corner(c1, r1), corner(c0, r1), corner(c0, r0)]),
        vec![],
    )
}

/// Set pixels the geometry does not overlap at all to missing.
///
/// Boundary pixels are kept even when their centre is outside, so a zone
/// keeps every pixel it touches.
pub fn clip_touching_geometry(raster: &Raster, geometry: &MultiPolygon<f64>) -> Raster {
    let gt = raster.geo_transform;
    let Some(bounds) = geometry.bounding_rect() else {
        return raster.with_data(Array2::from_elem(raster.shape(), Sample::NAN));
    };
    let mut data = raster.data.clone();
    Zip::indexed(&mut data).par_for_each(|(row, col), value| {
        let footprint = pixel_footprint(&gt, row, col);
        let touched = footprint.bounding_rect().map_or(false, |r| r.intersects(&bounds))
            && geometry.intersects(&footprint);
        if !touched {
            *value = Sample::NAN;
        }
    });
    raster.with_data(data)
}

/// Zone index raster: pixel = position of the first containing zone + 1, 0 = none
pub fn rasterize_zones(zones: &[Zone], grid: &Raster) -> Array2<u32> {
    let gt = grid.geo_transform;
    let bounds: Vec<_> = zones.iter().map(|z| z.geometry.bounding_rect()).collect();
    let mut labels = Array2::<u32>::zeros(grid.shape());

    Zip::indexed(&mut labels).par_for_each(|(row, col), label| {
        let (x, y) = gt.pixel_center(row, col);
        for (i, zone) in zones.iter().enumerate() {
            let Some(rect) = bounds[i] else { continue };
            if x < rect.min().x || x > rect.max().x || y < rect.min().y || y > rect.max().y {
                continue;
            }
            if centre_inside(&zone.geometry, x, y) {
                *label = i as u32 + 1;
                break;
            }
        }
    });

    log::debug!(
        "Rasterized {} zones, {} pixels assigned",
        zones.len(),
        labels.iter().filter(|&&l| l != 0).count()
    );
    labels
}

/// Per-zone statistics of non-missing values; zones with no pixels are omitted
pub fn zonal_summary(values: &Raster, zone_labels: &Array2<u32>, zones: &[Zone]) -> VerdureResult<Vec<ZonalSummary>> {
    if values.shape() != zone_labels.dim() {
        return Err(crate::types::VerdureError::ShapeMismatch {
            expected: zone_labels.dim(),
            found: values.shape(),
        });
    }

    let mut buckets: Vec<Vec<f64>> = vec![Vec::new(); zones.len()];
    Zip::from(&values.data).and(zone_labels).for_each(|&v, &label| {
        if label == 0 || v.is_nan() {
            return;
        }
        if let Some(bucket) = buckets.get_mut(label as usize - 1) {
            bucket.push(v as f64);
        }
    });

    let summaries = zones
        .iter()
        .zip(buckets)
        .filter(|(_, vals)| !vals.is_empty())
        .map(|(zone, vals)| {
            let count = vals.len();
            let sum: f64 = vals.iter().sum();
            let mean = sum / count as f64;
            let var = vals.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / count as f64;
            let min = vals.iter().cloned().fold(f64::INFINITY, f64::min);
            let max = vals.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
            ZonalSummary {
                zone: zone.id.clone(),
                count,
                sum,
                mean,
                min,
                max,
                std_dev: var.sqrt(),
            }
        })
        .collect();

    Ok(summaries)
}
