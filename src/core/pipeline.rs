//! Stage orchestration and run reporting
//!
//! Every unit (granule, band, zone) succeeds, is skipped or fails on its
//! own; the [`RunReport`] lists what did not complete and why.

use crate::core::composite::{composite_bands, merge_tiles, CompositeParams};
use crate::core::ledger::{retry_with_policy, LedgerRun, RetryPolicy, ZoneState};
use crate::core::patch_analysis::{analyze_raster, PatchParams};
use crate::core::quality_mask::{apply_usable_mask, decode_usable_mask, QualityMaskParams};
use crate::core::spectral_index::ndvi;
use crate::core::zonal::{clip_touching_geometry, rasterize_zones, zonal_summary, ZonalSummary};
use crate::io::catalog::{CatalogSearch, Granule};
use crate::io::tile_reader::{reproject_geometry, RegionOfInterest, TileReader, TileSource};
use crate::io::zones::ZoneLayer;
use crate::types::{
    Crs, MultiBandRaster, Raster, Tile, UsableMask, VerdureError, VerdureResult, ZonalRecord, Zone,
};
use std::collections::BTreeSet;
use std::fmt;

#[cfg(feature = "parallel")]
use rayon::prelude::*;

/// HLS surface reflectance scale factor
pub const HLS_REFLECTANCE_SCALE: f64 = 0.0001;

/// NAIP band order is red, green, blue, near-infrared
pub const NAIP_RED_BAND: isize = 1;
pub const NAIP_NIR_BAND: isize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitStatus {
    Completed,
    Skipped,
    Failed,
}

#[derive(Debug, Clone)]
pub struct UnitOutcome {
    pub unit: String,
    pub status: UnitStatus,
    pub reason: Option<String>,
}

/// Per-unit outcomes of a batch
#[derive(Debug, Clone, Default)]
pub struct RunReport {
    pub outcomes: Vec<UnitOutcome>,
}

impl RunReport {
    pub fn completed(&mut self, unit: impl Into<String>) {
        self.outcomes.push(UnitOutcome {
            unit: unit.into(),
            status: UnitStatus::Completed,
            reason: None,
        });
    }

    /// Skippable errors are recorded as skipped, everything else as failed
    pub fn record_error(&mut self, unit: impl Into<String>, error: &VerdureError) {
        let unit = unit.into();
        let status = if error.is_skippable() {
            log::warn!("Skipping {}: {}", unit, error);
            UnitStatus::Skipped
        } else {
            log::error!("{} failed: {}", unit, error);
            UnitStatus::Failed
        };
        self.outcomes.push(UnitOutcome {
            unit,
            status,
            reason: Some(error.to_string()),
        });
    }

    /// Fold a ledger run in, one outcome per zone
    pub fn add_ledger_run(&mut self, run: &LedgerRun) {
        for (zone, state) in &run.states {
            let (status, reason) = match state {
                ZoneState::Committed => (UnitStatus::Completed, None),
                ZoneState::Skipped => (UnitStatus::Skipped, Some("already in ledger".to_string())),
                ZoneState::Failed(reason) => (UnitStatus::Failed, Some(reason.clone())),
                ZoneState::Pending | ZoneState::Computing => {
                    (UnitStatus::Failed, Some("not processed".to_string()))
                }
            };
            self.outcomes.push(UnitOutcome {
                unit: format!("zone {}", zone),
                status,
                reason,
            });
        }
    }

    pub fn extend(&mut self, other: RunReport) {
        self.outcomes.extend(other.outcomes);
    }

    fn with_status(&self, status: UnitStatus) -> Vec<&UnitOutcome> {
        self.outcomes.iter().filter(|o| o.status == status).collect()
    }

    pub fn skipped(&self) -> Vec<&UnitOutcome> {
        self.with_status(UnitStatus::Skipped)
    }

    pub fn failed(&self) -> Vec<&UnitOutcome> {
        self.with_status(UnitStatus::Failed)
    }

    pub fn completed_count(&self) -> usize {
        self.with_status(UnitStatus::Completed).len()
    }

    pub fn is_clean(&self) -> bool {
        self.failed().is_empty()
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} units: {} completed, {} skipped, {} failed",
            self.outcomes.len(),
            self.completed_count(),
            self.skipped().len(),
            self.failed().len()
        )?;
        for outcome in self.outcomes.iter().filter(|o| o.status != UnitStatus::Completed) {
            writeln!(
                f,
                "  {:?} {}: {}",
                outcome.status,
                outcome.unit,
                outcome.reason.as_deref().unwrap_or("")
            )?;
        }
        Ok(())
    }
}

/// Tiles read from one granule and the band files that were skipped
#[derive(Debug, Default)]
pub struct GranuleTiles {
    pub tiles: Vec<Tile>,
    /// (tile unit, reason) per band file that could not be read
    pub skipped: Vec<(String, VerdureError)>,
}

/// Read each band of `granule` with `read` and apply the granule's mask.
///
/// A band file that is unavailable or misses the region is skipped on its
/// own; the granule's other bands are kept.
pub fn mask_granule_bands<F>(granule: &Granule, mask: &UsableMask, mut read: F) -> VerdureResult<GranuleTiles>
where
    F: FnMut(&TileSource) -> VerdureResult<Raster>,
{
    let mut out = GranuleTiles::default();
    for (band_id, source) in &granule.bands {
        let raster = match read(source) {
            Ok(raster) => raster,
            Err(e) if e.is_skippable() => {
                out.skipped.push((format!("tile {} {}", granule.label(), band_id), e));
                continue;
            }
            Err(e) => return Err(e),
        };
        out.tiles.push(Tile {
            band: band_id.clone(),
            acquired: granule.acquired,
            tile_id: granule.tile_id.clone(),
            raster: apply_usable_mask(&raster, mask)?,
        });
    }
    Ok(out)
}

/// Read, quality-mask and scale every spectral band of one granule
pub fn process_granule(
    reader: &TileReader,
    granule: &Granule,
    roi: &RegionOfInterest,
    quality: &QualityMaskParams,
) -> VerdureResult<GranuleTiles> {
    let quality_source = granule.quality.as_ref().ok_or_else(|| VerdureError::SourceUnavailable {
        source_id: granule.label(),
        reason: "granule has no quality layer".to_string(),
    })?;

    let flags = reader.read_quality(quality_source, roi)?;
    let mask = decode_usable_mask(&flags, &quality.mask_bits)?;

    let granule_tiles = mask_granule_bands(granule, &mask, |source| {
        reader.read_band(source, roi, 1, Some(HLS_REFLECTANCE_SCALE))
    })?;

    log::debug!(
        "Granule {}: {} bands read, {} skipped, {} of {} pixels usable",
        granule.label(),
        granule_tiles.tiles.len(),
        granule_tiles.skipped.len(),
        mask.usable_count(),
        mask.data.len()
    );
    Ok(granule_tiles)
}

/// Process granules independently; failures are reported per granule and
/// per band file
pub fn process_granules(
    reader: &TileReader,
    granules: &[Granule],
    roi: &RegionOfInterest,
    quality: &QualityMaskParams,
) -> (Vec<Tile>, RunReport) {
    log::info!("📡 Processing {} granules", granules.len());

    #[cfg(feature = "parallel")]
    let results: Vec<VerdureResult<GranuleTiles>> = granules
        .par_iter()
        .map(|g| process_granule(reader, g, roi, quality))
        .collect();
    #[cfg(not(feature = "parallel"))]
    let results: Vec<VerdureResult<GranuleTiles>> = granules
        .iter()
        .map(|g| process_granule(reader, g, roi, quality))
        .collect();

    let (tiles, report) = collect_granule_results(granules, results);
    log::info!(
        "Granules done: {} tiles, {} completed, {} skipped, {} failed",
        tiles.len(),
        report.completed_count(),
        report.skipped().len(),
        report.failed().len()
    );
    (tiles, report)
}

fn collect_granule_results(
    granules: &[Granule],
    results: Vec<VerdureResult<GranuleTiles>>,
) -> (Vec<Tile>, RunReport) {
    let mut tiles = Vec::new();
    let mut report = RunReport::default();
    for (granule, result) in granules.iter().zip(results) {
        let unit = format!("granule {}", granule.label());
        match result {
            Ok(granule_tiles) => {
                for (tile_unit, e) in &granule_tiles.skipped {
                    report.record_error(tile_unit.clone(), e);
                }
                tiles.extend(granule_tiles.tiles);
                report.completed(unit);
            }
            Err(e) => report.record_error(unit, &e),
        }
    }
    (tiles, report)
}

/// Every spectral band id listed by the granules, sorted
pub fn requested_bands(granules: &[Granule]) -> Vec<String> {
    granules
        .iter()
        .flat_map(|g| g.bands.keys().cloned())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Merge and composite each of `bands`; a band with no surviving tiles is
/// reported as missing
pub fn composite_reflectance(
    tiles: &[Tile],
    bands: &[String],
    params: &CompositeParams,
    report: &mut RunReport,
) -> VerdureResult<MultiBandRaster> {
    let outcome = composite_bands(tiles, bands, params);
    for (band, error) in &outcome.failures {
        report.record_error(format!("band {}", band), error);
    }

    let composite = outcome
        .composite
        .ok_or_else(|| VerdureError::Processing("No band could be composited".to_string()))?;
    for band in &composite.band_names {
        report.completed(format!("band {}", band));
    }

    log::info!(
        "✅ Composite ready: {} bands, {}x{} pixels",
        composite.band_count(),
        composite.shape().0,
        composite.shape().1
    );
    Ok(composite)
}

/// NDVI of one NAIP tile over the zone, keeping every pixel the zone touches
fn zone_tile_ndvi(reader: &TileReader, source: &TileSource, zone: &Zone, zone_crs: &Crs) -> VerdureResult<Raster> {
    let roi = RegionOfInterest::new(zone.geometry.clone(), zone_crs.clone());
    let bands = reader.read_bands(source, &roi, &[NAIP_RED_BAND, NAIP_NIR_BAND], None)?;
    let index = ndvi(&bands[0], &bands[1])?;
    let outline = reproject_geometry(&zone.geometry, zone_crs, &index.crs)?;
    Ok(clip_touching_geometry(&index, &outline))
}

/// Vegetation statistics of one zone from catalog imagery.
///
/// The catalog search is retried on transient failures; tiles that cannot be
/// opened or miss the zone are skipped.
pub fn zone_vegetation_record(
    reader: &TileReader,
    catalog: &dyn CatalogSearch,
    zone: &Zone,
    zone_crs: &Crs,
    retry: &RetryPolicy,
    patch: &PatchParams,
) -> VerdureResult<ZonalRecord> {
    let entries = retry_with_policy(retry, &format!("catalog search for zone {}", zone.id), |_| {
        catalog.search(zone)
    })?;
    log::debug!("Zone {}: {} catalog entries", zone.id, entries.len());

    let mut clipped = Vec::with_capacity(entries.len());
    for entry in &entries {
        match zone_tile_ndvi(reader, &entry.source, zone, zone_crs) {
            Ok(index) => clipped.push(index),
            Err(e) if e.is_skippable() => log::warn!("Zone {}: skipping {}: {}", zone.id, entry.source, e),
            Err(e) => return Err(e),
        }
    }

    if clipped.is_empty() {
        return Err(VerdureError::EmptyIntersection {
            source_id: format!("zone {}", zone.id),
        });
    }

    let merged = merge_tiles(&clipped)?;
    Ok(record_from_index(&zone.id, &merged, patch))
}

/// Ledger row from a zone's vegetation index raster
pub fn record_from_index(zone_id: &str, index: &Raster, patch: &PatchParams) -> ZonalRecord {
    let stats = analyze_raster(index, patch);
    ZonalRecord {
        zone: zone_id.to_string(),
        total_pixels: stats.total_pixels as u64,
        frac_veg: stats.vegetation_fraction(),
        mean_patch_size: stats.mean_patch_size,
        edge_density: stats.edge_density,
    }
}

/// Per-zone summary of an index raster over a zone layer
pub fn zone_index_summary(index: &Raster, layer: &ZoneLayer) -> VerdureResult<Vec<ZonalSummary>> {
    let projected = layer.reprojected(&index.crs)?;
    let labels = rasterize_zones(&projected.zones, index);
    zonal_summary(index, &labels, &projected.zones)
}
