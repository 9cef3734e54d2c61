//! Catalog search results and HLS granule naming
//!
//! HLS granules (Landsat `L30` and Sentinel-2 `S30`) ship one GeoTIFF per
//! band, named like `HLS.L30.T15RYP.2023150T163131.v2.0.B04.tif`.

use crate::io::tile_reader::TileSource;
use crate::types::{VerdureResult, Zone};
use chrono::NaiveDate;
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::OnceLock;

/// Band id of the HLS quality layer
pub const QUALITY_BAND: &str = "Fmask";

/// One file returned by a catalog search
#[derive(Debug, Clone, PartialEq)]
pub struct CatalogEntry {
    pub acquired: NaiveDate,
    pub tile_id: String,
    pub band_id: String,
    pub source: TileSource,
}

/// Fields encoded in an HLS file name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HlsName {
    pub tile_id: String,
    pub acquired: NaiveDate,
    pub band_id: String,
}

fn hls_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| {
            Regex::new(
                r"HLS\.(?:L30|S30)\.(?P<tile_id>T[0-9A-Z]+)\.(?P<date>\d+)T\d+\.v\d+\.\d+\.(?P<band_id>[A-Za-z0-9]+)\.tif",
            )
            .ok()
        })
        .as_ref()
}

/// Parse tile id, `yyyyjjj` acquisition date and band id from a file name or URL
pub fn parse_hls_name(name: &str) -> Option<HlsName> {
    let caps = hls_pattern()?.captures(name)?;
    let date = &caps["date"];
    if date.len() != 7 {
        return None;
    }
    let year: i32 = date[..4].parse().ok()?;
    let ordinal: u32 = date[4..].parse().ok()?;

    Some(HlsName {
        tile_id: caps["tile_id"].to_string(),
        acquired: NaiveDate::from_yo_opt(year, ordinal)?,
        band_id: caps["band_id"].to_string(),
    })
}

/// Build catalog entries from result locations; unrecognised names are skipped
pub fn entries_from_locations<S: AsRef<str>>(locations: &[S]) -> Vec<CatalogEntry> {
    locations
        .iter()
        .filter_map(|location| {
            let location = location.as_ref();
            match parse_hls_name(location) {
                Some(name) => Some(CatalogEntry {
                    acquired: name.acquired,
                    tile_id: name.tile_id,
                    band_id: name.band_id,
                    source: TileSource::from_location(location),
                }),
                None => {
                    log::debug!("Ignoring unrecognised catalog entry {}", location);
                    None
                }
            }
        })
        .collect()
}

/// Integer band number of a spectral band id (`B05` -> 5)
pub fn band_number(band_id: &str) -> Option<u32> {
    band_id.strip_prefix('B')?.parse().ok()
}

pub fn is_spectral(band_id: &str) -> bool {
    band_id.starts_with('B')
}

/// All files of one acquisition over one tile
#[derive(Debug, Clone)]
pub struct Granule {
    pub acquired: NaiveDate,
    pub tile_id: String,
    pub quality: Option<TileSource>,
    /// Spectral bands by band id
    pub bands: BTreeMap<String, TileSource>,
}

impl Granule {
    pub fn label(&self) -> String {
        format!("{} {}", self.tile_id, self.acquired)
    }
}

/// Group entries by (date, tile). Output is sorted by date, then tile.
pub fn group_granules(entries: Vec<CatalogEntry>) -> Vec<Granule> {
    let mut groups: BTreeMap<(NaiveDate, String), Granule> = BTreeMap::new();

    for entry in entries {
        let granule = groups
            .entry((entry.acquired, entry.tile_id.clone()))
            .or_insert_with(|| Granule {
                acquired: entry.acquired,
                tile_id: entry.tile_id.clone(),
                quality: None,
                bands: BTreeMap::new(),
            });

        if entry.band_id == QUALITY_BAND {
            granule.quality = Some(entry.source);
        } else if is_spectral(&entry.band_id) {
            granule.bands.insert(entry.band_id, entry.source);
        } else {
            log::debug!("Ignoring non-spectral layer {} of {}", entry.band_id, granule.label());
        }
    }

    log::info!("Grouped catalog entries into {} granules", groups.len());
    groups.into_values().collect()
}

/// Imagery search for a zone. Implementations report transient service
/// failures as [`crate::types::VerdureError::TransientCatalogFailure`].
pub trait CatalogSearch {
    fn search(&self, zone: &Zone) -> VerdureResult<Vec<CatalogEntry>>;
}

/// Fixed result list returned for every zone
#[derive(Debug, Clone, Default)]
pub struct StaticCatalog {
    pub entries: Vec<CatalogEntry>,
}

impl CatalogSearch for StaticCatalog {
    fn search(&self, _zone: &Zone) -> VerdureResult<Vec<CatalogEntry>> {
        Ok(self.entries.clone())
    }
}
