use crate::core::ledger::{retry_with_policy, RetryPolicy};
use crate::types::{
    BoundingBox, Crs, GeoTransform, QualityFlagSet, Raster, Sample, SampleImage, VerdureError,
    VerdureResult,
};
use gdal::spatial_ref::{CoordTransform, SpatialRef};
use gdal::Dataset;
use geo::{BoundingRect, Coord, LineString, MultiPolygon, Polygon};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Write;
use std::path::PathBuf;
use tempfile::NamedTempFile;

/// Where a tile's bytes come from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TileSource {
    Path(PathBuf),
    /// Fetched over HTTP(S) before opening
    Url(String),
    /// In-memory stream, e.g. handed over by a search client
    Bytes { name: String, bytes: Vec<u8> },
}

impl TileSource {
    /// Parse a location string: http(s) URLs become `Url`, everything else a path
    pub fn from_location(location: &str) -> Self {
        if location.starts_with("http://") || location.starts_with("https://") {
            TileSource::Url(location.to_string())
        } else {
            TileSource::Path(PathBuf::from(location))
        }
    }

    /// Identifier used in logs and errors
    pub fn id(&self) -> String {
        match self {
            TileSource::Path(p) => p.display().to_string(),
            TileSource::Url(u) => u.clone(),
            TileSource::Bytes { name, .. } => name.clone(),
        }
    }

    /// Final path segment of the location
    pub fn file_name(&self) -> String {
        let id = self.id();
        id.rsplit(|c: char| c == '/' || c == '\\')
            .next()
            .unwrap_or(id.as_str())
            .to_string()
    }
}

impl fmt::Display for TileSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id())
    }
}

/// Tile accessor settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AccessorConfig {
    /// Retry of HTTP fetches
    pub retry: RetryPolicy,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    /// Apply the band's scale/offset metadata
    pub mask_and_scale: bool,
}

impl Default for AccessorConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            http_timeout_secs: 300,
            user_agent: format!("verdure/{}", env!("CARGO_PKG_VERSION")),
            mask_and_scale: true,
        }
    }
}

/// Region of interest polygon with its CRS
#[derive(Debug, Clone)]
pub struct RegionOfInterest {
    pub geometry: MultiPolygon<f64>,
    pub crs: Crs,
}

impl RegionOfInterest {
    pub fn new(geometry: MultiPolygon<f64>, crs: Crs) -> Self {
        Self { geometry, crs }
    }

    /// Axis-aligned rectangle as a region of interest
    pub fn from_bbox(bbox: BoundingBox, crs: Crs) -> Self {
        let ring = LineString::from(vec![
            (bbox.min_x, bbox.min_y),
            (bbox.max_x, bbox.min_y),
            (bbox.max_x, bbox.max_y),
            (bbox.min_x, bbox.max_y),
            (bbox.min_x, bbox.min_y),
        ]);
        Self::new(MultiPolygon(vec![Polygon::new(ring, vec![])]), crs)
    }

    pub fn bounds(&self) -> Option<BoundingBox> {
        self.geometry
            .bounding_rect()
            .map(|r| BoundingBox::new(r.min().x, r.min().y, r.max().x, r.max().y))
    }
}

/// Pixel window of a read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelWindow {
    pub col_off: usize,
    pub row_off: usize,
    pub width: usize,
    pub height: usize,
}

/// Pixel window covering `bbox`, clamped to the raster. None when nothing overlaps.
///
/// Any pixel the box touches is included, matching a clip to the box.
pub fn crop_window(gt: &GeoTransform, raster_size: (usize, usize), bbox: &BoundingBox) -> Option<PixelWindow> {
    let (width, height) = raster_size;
    let (c0, r0) = gt.world_to_pixel(bbox.min_x, bbox.max_y);
    let (c1, r1) = gt.world_to_pixel(bbox.max_x, bbox.min_y);

    let col_start = c0.min(c1).floor().max(0.0);
    let col_end = c0.max(c1).ceil().min(width as f64);
    let row_start = r0.min(r1).floor().max(0.0);
    let row_end = r0.max(r1).ceil().min(height as f64);

    if !(col_end > col_start && row_end > row_start) {
        return None;
    }

    Some(PixelWindow {
        col_off: col_start as usize,
        row_off: row_start as usize,
        width: (col_end - col_start) as usize,
        height: (row_end - row_start) as usize,
    })
}

/// Convert the nodata sentinel to missing, then apply `value * scale + offset`
pub fn mask_and_scale(raw: Array2<Sample>, nodata: Option<f64>, scale: f64, offset: f64) -> SampleImage {
    let identity = scale == 1.0 && offset == 0.0;
    raw.mapv(|v| {
        let is_nodata = match nodata {
            Some(nd) if nd.is_nan() => v.is_nan(),
            Some(nd) => v as f64 == nd,
            None => false,
        };
        if is_nodata {
            Sample::NAN
        } else if identity {
            v
        } else {
            (v as f64 * scale + offset) as Sample
        }
    })
}

/// GDAL spatial reference with x/y in easting/northing (lon/lat) order
pub fn spatial_ref(crs: &Crs) -> VerdureResult<SpatialRef> {
    let srs = match crs {
        Crs::Epsg(code) => SpatialRef::from_epsg(*code)?,
        Crs::Wkt(wkt) => SpatialRef::from_wkt(wkt)?,
    };
    srs.set_axis_mapping_strategy(gdal_sys::OSRAxisMappingStrategy::OAMS_TRADITIONAL_GIS_ORDER);
    Ok(srs)
}

fn crs_of(dataset: &Dataset) -> VerdureResult<Crs> {
    let srs = dataset.spatial_ref()?;
    if let (Ok(name), Ok(code)) = (srs.auth_name(), srs.auth_code()) {
        if name.eq_ignore_ascii_case("EPSG") && code > 0 {
            return Ok(Crs::Epsg(code as u32));
        }
    }
    Ok(Crs::Wkt(srs.to_wkt()?))
}

/// Reproject every vertex of a multipolygon
pub fn reproject_geometry(geometry: &MultiPolygon<f64>, from: &Crs, to: &Crs) -> VerdureResult<MultiPolygon<f64>> {
    if from == to {
        return Ok(geometry.clone());
    }

    let transform = CoordTransform::new(&spatial_ref(from)?, &spatial_ref(to)?)?;

    let rings = |p: &Polygon<f64>| -> Vec<LineString<f64>> {
        std::iter::once(p.exterior().clone())
            .chain(p.interiors().iter().cloned())
            .collect()
    };

    let mut xs = Vec::new();
    let mut ys = Vec::new();
    for polygon in &geometry.0 {
        for ring in rings(polygon) {
            for c in ring.coords() {
                xs.push(c.x);
                ys.push(c.y);
            }
        }
    }
    transform.transform_coords(&mut xs, &mut ys, &mut [])?;

    let mut next = xs.into_iter().zip(ys);
    let mut projected = Vec::with_capacity(geometry.0.len());
    for polygon in &geometry.0 {
        let mut out_rings: Vec<LineString<f64>> = rings(polygon)
            .iter()
            .map(|ring| {
                ring.coords()
                    .filter_map(|_| next.next().map(|(x, y)| Coord { x, y }))
                    .collect::<Vec<_>>()
                    .into()
            })
            .collect();
        let exterior = out_rings.remove(0);
        projected.push(Polygon::new(exterior, out_rings));
    }

    log::debug!("Reprojected {} polygons from {} to {}", projected.len(), from, to);
    Ok(MultiPolygon(projected))
}

/// An open GDAL dataset; keeps any temporary file alive while open
pub struct OpenedTile {
    pub source_id: String,
    pub dataset: Dataset,
    pub crs: Crs,
    pub geo_transform: GeoTransform,
    _temp: Option<NamedTempFile>,
}

impl OpenedTile {
    pub fn raster_size(&self) -> (usize, usize) {
        self.dataset.raster_size()
    }

    pub fn band_count(&self) -> isize {
        self.dataset.raster_count()
    }
}

/// Opens tiles and reads ROI-cropped windows from them
pub struct TileReader {
    config: AccessorConfig,
}

impl TileReader {
    pub fn new(config: AccessorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &AccessorConfig {
        &self.config
    }

    fn unavailable(source: &TileSource, reason: impl fmt::Display) -> VerdureError {
        VerdureError::SourceUnavailable {
            source_id: source.id(),
            reason: reason.to_string(),
        }
    }

    /// Single HTTP fetch; server-side and network failures are transient
    fn fetch_once(&self, client: &reqwest::blocking::Client, url: &str) -> VerdureResult<Vec<u8>> {
        let response = client
            .get(url)
            .send()
            .map_err(|e| VerdureError::TransientCatalogFailure(format!("HTTP request failed: {}", e)))?;

        let status = response.status();
        if status.is_server_error() || status.as_u16() == 429 {
            return Err(VerdureError::TransientCatalogFailure(format!(
                "HTTP {} for {}",
                status.as_u16(),
                url
            )));
        }
        if !status.is_success() {
            return Err(VerdureError::SourceUnavailable {
                source_id: url.to_string(),
                reason: format!("HTTP {}", status.as_u16()),
            });
        }

        let bytes = response
            .bytes()
            .map_err(|e| VerdureError::TransientCatalogFailure(format!("Failed to read response body: {}", e)))?;
        log::debug!("Downloaded {} bytes from {}", bytes.len(), url);
        Ok(bytes.to_vec())
    }

    fn download(&self, source: &TileSource, url: &str) -> VerdureResult<Vec<u8>> {
        let client = reqwest::blocking::Client::builder()
            .timeout(std::time::Duration::from_secs(self.config.http_timeout_secs))
            .user_agent(self.config.user_agent.clone())
            .build()
            .map_err(|e| VerdureError::Processing(format!("Failed to create HTTP client: {}", e)))?;

        retry_with_policy(&self.config.retry, &format!("download {}", url), |_| {
            self.fetch_once(&client, url)
        })
        .map_err(|e| match e {
            VerdureError::RetriesExhausted { .. } => Self::unavailable(source, e),
            other => other,
        })
    }

    fn spill_to_temp(source: &TileSource, bytes: &[u8]) -> VerdureResult<NamedTempFile> {
        let mut temp_file = NamedTempFile::new()?;
        temp_file.write_all(bytes)?;
        temp_file.flush()?;
        log::debug!("Staged {} bytes of {} at {}", bytes.len(), source, temp_file.path().display());
        Ok(temp_file)
    }

    /// Open a source with GDAL. Any failure to open is `SourceUnavailable`.
    pub fn open_dataset(&self, source: &TileSource) -> VerdureResult<OpenedTile> {
        let (dataset, temp) = match source {
            TileSource::Path(path) => {
                let dataset = Dataset::open(path).map_err(|e| Self::unavailable(source, e))?;
                (dataset, None)
            }
            TileSource::Url(url) => {
                let bytes = self.download(source, url)?;
                let temp = Self::spill_to_temp(source, &bytes)?;
                let dataset = Dataset::open(temp.path()).map_err(|e| Self::unavailable(source, e))?;
                (dataset, Some(temp))
            }
            TileSource::Bytes { bytes, .. } => {
                let temp = Self::spill_to_temp(source, bytes)?;
                let dataset = Dataset::open(temp.path()).map_err(|e| Self::unavailable(source, e))?;
                (dataset, Some(temp))
            }
        };

        let crs = crs_of(&dataset).map_err(|e| Self::unavailable(source, format!("no CRS: {}", e)))?;
        let geo_transform = GeoTransform::from_gdal(dataset.geo_transform()?);
        let (width, height) = dataset.raster_size();
        log::debug!(
            "Opened {}: {}x{} px, {} bands, {}",
            source,
            width,
            height,
            dataset.raster_count(),
            crs
        );

        Ok(OpenedTile {
            source_id: source.id(),
            dataset,
            crs,
            geo_transform,
            _temp: temp,
        })
    }

    /// Bounding box of the ROI in `target` CRS. The ROI moves, never the raster.
    pub fn project_roi(&self, roi: &RegionOfInterest, target: &Crs) -> VerdureResult<BoundingBox> {
        let geometry = reproject_geometry(&roi.geometry, &roi.crs, target)?;
        geometry
            .bounding_rect()
            .map(|r| BoundingBox::new(r.min().x, r.min().y, r.max().x, r.max().y))
            .ok_or_else(|| VerdureError::InvalidFormat("Region of interest has no vertices".to_string()))
    }

    fn window(&self, tile: &OpenedTile, roi: &RegionOfInterest) -> VerdureResult<PixelWindow> {
        let bbox = self.project_roi(roi, &tile.crs)?;
        let window = crop_window(&tile.geo_transform, tile.raster_size(), &bbox).ok_or_else(|| {
            VerdureError::EmptyIntersection {
                source_id: tile.source_id.clone(),
            }
        })?;
        log::debug!("{}: crop window {:?}", tile.source_id, window);
        Ok(window)
    }

    fn read_window<T: Copy + gdal::raster::GdalType>(
        tile: &OpenedTile,
        band: isize,
        window: &PixelWindow,
    ) -> VerdureResult<Array2<T>> {
        let rasterband = tile.dataset.rasterband(band)?;
        let buffer = rasterband.read_as::<T>(
            (window.col_off as isize, window.row_off as isize),
            (window.width, window.height),
            (window.width, window.height),
            None,
        )?;
        Array2::from_shape_vec((window.height, window.width), buffer.data)
            .map_err(|e| VerdureError::Processing(format!("Failed to reshape band {}: {}", band, e)))
    }

    fn read_opened_band(
        &self,
        tile: &OpenedTile,
        window: &PixelWindow,
        band: isize,
        scale: Option<f64>,
    ) -> VerdureResult<Raster> {
        let raw = Self::read_window::<f32>(tile, band, window)?;
        let rasterband = tile.dataset.rasterband(band)?;
        let nodata = rasterband.no_data_value();

        let (band_scale, band_offset) = if self.config.mask_and_scale {
            (rasterband.scale().unwrap_or(1.0), rasterband.offset().unwrap_or(0.0))
        } else {
            (1.0, 0.0)
        };
        let data = mask_and_scale(raw, nodata, scale.unwrap_or(band_scale), band_offset);

        Ok(Raster {
            data,
            geo_transform: tile.geo_transform.windowed(window.col_off, window.row_off),
            crs: tile.crs.clone(),
            nodata,
        })
    }

    /// Read one band cropped to the ROI's bounding box.
    ///
    /// `scale` overrides the band's own scale metadata.
    pub fn read_band(
        &self,
        source: &TileSource,
        roi: &RegionOfInterest,
        band: isize,
        scale: Option<f64>,
    ) -> VerdureResult<Raster> {
        let tile = self.open_dataset(source)?;
        let window = self.window(&tile, roi)?;
        self.read_opened_band(&tile, &window, band, scale)
    }

    /// Read several bands of one source over the same window
    pub fn read_bands(
        &self,
        source: &TileSource,
        roi: &RegionOfInterest,
        bands: &[isize],
        scale: Option<f64>,
    ) -> VerdureResult<Vec<Raster>> {
        let tile = self.open_dataset(source)?;
        if let Some(&missing) = bands.iter().find(|&&b| b < 1 || b > tile.band_count()) {
            return Err(VerdureError::MissingBand(format!("{} band {}", tile.source_id, missing)));
        }
        let window = self.window(&tile, roi)?;
        bands
            .iter()
            .map(|&band| self.read_opened_band(&tile, &window, band, scale))
            .collect()
    }

    /// Read an 8-bit quality band without scaling or masking
    pub fn read_quality(&self, source: &TileSource, roi: &RegionOfInterest) -> VerdureResult<QualityFlagSet> {
        let tile = self.open_dataset(source)?;
        let window = self.window(&tile, roi)?;
        let data = Self::read_window::<u8>(&tile, 1, &window)?;
        let nodata = tile
            .dataset
            .rasterband(1)?
            .no_data_value()
            .filter(|nd| (0.0..=255.0).contains(nd) && nd.fract() == 0.0)
            .map(|nd| nd as u8);

        Ok(QualityFlagSet {
            data,
            nodata,
            geo_transform: tile.geo_transform.windowed(window.col_off, window.row_off),
            crs: tile.crs.clone(),
        })
    }
}
