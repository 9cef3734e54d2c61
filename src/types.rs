use chrono::NaiveDate;
use geo::MultiPolygon;
use ndarray::{Array2, Array3};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Real-valued sample (reflectance, index value). Missing samples are NaN.
pub type Sample = f32;

/// 2D sample grid (rows x cols)
pub type SampleImage = Array2<Sample>;

/// 3D sample stack (band x rows x cols)
pub type SampleCube = Array3<Sample>;

/// Coordinate reference system of a raster or vector layer
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Crs {
    /// Authority code, e.g. EPSG:32615
    Epsg(u32),
    /// Full WKT definition as reported by the data source
    Wkt(String),
}

impl fmt::Display for Crs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Crs::Epsg(code) => write!(f, "EPSG:{}", code),
            Crs::Wkt(wkt) => {
                let head: String = wkt.chars().take(48).collect();
                write!(f, "WKT({}...)", head)
            }
        }
    }
}

/// Axis-aligned bounding box in the coordinates of its own CRS
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl BoundingBox {
    pub fn new(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Self {
        Self { min_x, min_y, max_x, max_y }
    }

    pub fn width(&self) -> f64 {
        self.max_x - self.min_x
    }

    pub fn height(&self) -> f64 {
        self.max_y - self.min_y
    }

    /// True when the box encloses no area
    pub fn is_empty(&self) -> bool {
        !(self.width() > 0.0 && self.height() > 0.0)
    }

    pub fn union(&self, other: &BoundingBox) -> BoundingBox {
        BoundingBox {
            min_x: self.min_x.min(other.min_x),
            min_y: self.min_y.min(other.min_y),
            max_x: self.max_x.max(other.max_x),
            max_y: self.max_y.max(other.max_y),
        }
    }

    pub fn intersects(&self, other: &BoundingBox) -> bool {
        self.min_x < other.max_x
            && other.min_x < self.max_x
            && self.min_y < other.max_y
            && other.min_y < self.max_y
    }
}

/// Affine pixel-to-world transform (GDAL coefficient order)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoTransform {
    pub top_left_x: f64,
    pub pixel_width: f64,
    pub rotation_x: f64,
    pub top_left_y: f64,
    pub rotation_y: f64,
    pub pixel_height: f64,
}

impl GeoTransform {
    /// North-up transform without rotation
    pub fn north_up(top_left_x: f64, top_left_y: f64, pixel_width: f64, pixel_height: f64) -> Self {
        Self {
            top_left_x,
            pixel_width,
            rotation_x: 0.0,
            top_left_y,
            rotation_y: 0.0,
            pixel_height: -pixel_height.abs(),
        }
    }

    pub fn from_gdal(coeffs: [f64; 6]) -> Self {
        Self {
            top_left_x: coeffs[0],
            pixel_width: coeffs[1],
            rotation_x: coeffs[2],
            top_left_y: coeffs[3],
            rotation_y: coeffs[4],
            pixel_height: coeffs[5],
        }
    }

    pub fn to_gdal(&self) -> [f64; 6] {
        [
            self.top_left_x,
            self.pixel_width,
            self.rotation_x,
            self.top_left_y,
            self.rotation_y,
            self.pixel_height,
        ]
    }

    pub fn is_rotated(&self) -> bool {
        self.rotation_x != 0.0 || self.rotation_y != 0.0
    }

    /// World coordinate of a pixel centre
    pub fn pixel_center(&self, row: usize, col: usize) -> (f64, f64) {
        let c = col as f64 + 0.5;
        let r = row as f64 + 0.5;
        (
            self.top_left_x + c * self.pixel_width + r * self.rotation_x,
            self.top_left_y + c * self.rotation_y + r * self.pixel_height,
        )
    }

    /// Fractional (col, row) of a world coordinate. Ignores rotation.
    pub fn world_to_pixel(&self, x: f64, y: f64) -> (f64, f64) {
        (
            (x - self.top_left_x) / self.pixel_width,
            (y - self.top_left_y) / self.pixel_height,
        )
    }

    /// Transform of a sub-window starting at (col_off, row_off)
    pub fn windowed(&self, col_off: usize, row_off: usize) -> GeoTransform {
        let c = col_off as f64;
        let r = row_off as f64;
        GeoTransform {
            top_left_x: self.top_left_x + c * self.pixel_width + r * self.rotation_x,
            top_left_y: self.top_left_y + c * self.rotation_y + r * self.pixel_height,
            ..*self
        }
    }

    /// Extent covered by a grid of `rows` x `cols` pixels
    pub fn extent(&self, rows: usize, cols: usize) -> BoundingBox {
        let x0 = self.top_left_x;
        let x1 = self.top_left_x + cols as f64 * self.pixel_width;
        let y0 = self.top_left_y;
        let y1 = self.top_left_y + rows as f64 * self.pixel_height;
        BoundingBox::new(x0.min(x1), y0.min(y1), x0.max(x1), y0.max(y1))
    }

    /// Same pixel size within a relative tolerance
    pub fn same_resolution(&self, other: &GeoTransform) -> bool {
        let close = |a: f64, b: f64| (a - b).abs() <= 1e-9 * a.abs().max(b.abs()).max(1.0);
        close(self.pixel_width, other.pixel_width) && close(self.pixel_height, other.pixel_height)
    }
}

/// Single-band georeferenced raster. Missing samples are NaN, never zero.
#[derive(Debug, Clone)]
pub struct Raster {
    pub data: SampleImage,
    pub geo_transform: GeoTransform,
    pub crs: Crs,
    /// Nodata sentinel of the source, already converted to NaN in `data`
    pub nodata: Option<f64>,
}

impl Raster {
    pub fn new(data: SampleImage, geo_transform: GeoTransform, crs: Crs) -> Self {
        Self {
            data,
            geo_transform,
            crs,
            nodata: None,
        }
    }

    /// (rows, cols)
    pub fn shape(&self) -> (usize, usize) {
        self.data.dim()
    }

    pub fn extent(&self) -> BoundingBox {
        let (rows, cols) = self.shape();
        self.geo_transform.extent(rows, cols)
    }

    /// Number of non-missing samples
    pub fn valid_count(&self) -> usize {
        self.data.iter().filter(|v| !v.is_nan()).count()
    }

    /// New raster on the same grid and CRS with different samples
    pub fn with_data(&self, data: SampleImage) -> Raster {
        Raster {
            data,
            geo_transform: self.geo_transform,
            crs: self.crs.clone(),
            nodata: self.nodata,
        }
    }

    pub fn ensure_same_crs(&self, crs: &Crs) -> VerdureResult<()> {
        if &self.crs != crs {
            return Err(VerdureError::CrsMismatch {
                expected: crs.to_string(),
                found: self.crs.to_string(),
            });
        }
        Ok(())
    }

    /// Same CRS, shape and transform
    pub fn ensure_same_grid(&self, other: &Raster) -> VerdureResult<()> {
        self.ensure_same_crs(&other.crs)?;
        if self.shape() != other.shape() {
            return Err(VerdureError::ShapeMismatch {
                expected: other.shape(),
                found: self.shape(),
            });
        }
        if self.geo_transform != other.geo_transform {
            return Err(VerdureError::Processing(format!(
                "Grid transforms differ: {:?} vs {:?}",
                self.geo_transform, other.geo_transform
            )));
        }
        Ok(())
    }
}

/// Multi-band raster sharing one grid (band x rows x cols)
#[derive(Debug, Clone)]
pub struct MultiBandRaster {
    pub band_names: Vec<String>,
    pub data: SampleCube,
    pub geo_transform: GeoTransform,
    pub crs: Crs,
}

impl MultiBandRaster {
    /// Stack single-band rasters that already share a grid
    pub fn from_bands(bands: Vec<(String, Raster)>) -> VerdureResult<Self> {
        let (_, first) = bands.first().ok_or_else(|| {
            VerdureError::Processing("Cannot stack an empty band list".to_string())
        })?;
        let (rows, cols) = first.shape();
        let geo_transform = first.geo_transform;
        let crs = first.crs.clone();

        let mut data = SampleCube::from_elem((bands.len(), rows, cols), Sample::NAN);
        let mut band_names = Vec::with_capacity(bands.len());
        for (i, (name, raster)) in bands.iter().enumerate() {
            raster.ensure_same_grid(first)?;
            data.index_axis_mut(ndarray::Axis(0), i).assign(&raster.data);
            band_names.push(name.clone());
        }

        Ok(Self {
            band_names,
            data,
            geo_transform,
            crs,
        })
    }

    pub fn band_count(&self) -> usize {
        self.band_names.len()
    }

    /// (rows, cols)
    pub fn shape(&self) -> (usize, usize) {
        let (_, rows, cols) = self.data.dim();
        (rows, cols)
    }

    /// Copy one band out as a single-band raster
    pub fn band(&self, name: &str) -> Option<Raster> {
        let idx = self.band_names.iter().position(|b| b == name)?;
        Some(Raster::new(
            self.data.index_axis(ndarray::Axis(0), idx).to_owned(),
            self.geo_transform,
            self.crs.clone(),
        ))
    }
}

/// 8-bit-per-pixel quality flags (e.g. HLS Fmask)
#[derive(Debug, Clone)]
pub struct QualityFlagSet {
    pub data: Array2<u8>,
    pub nodata: Option<u8>,
    pub geo_transform: GeoTransform,
    pub crs: Crs,
}

/// True where a pixel carries none of the disqualifying flags
#[derive(Debug, Clone)]
pub struct UsableMask {
    pub data: Array2<bool>,
    pub geo_transform: GeoTransform,
    pub crs: Crs,
}

impl UsableMask {
    pub fn usable_count(&self) -> usize {
        self.data.iter().filter(|&&v| v).count()
    }
}

/// One band of one acquisition over one footprint
#[derive(Debug, Clone)]
pub struct Tile {
    pub band: String,
    pub acquired: NaiveDate,
    pub tile_id: String,
    pub raster: Raster,
}

/// Ordered redlining grade
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Grade {
    A,
    B,
    C,
    D,
}

impl Grade {
    /// Parse a grade label; anything outside A-D is treated as missing
    pub fn parse(label: &str) -> Option<Grade> {
        match label.trim().to_uppercase().as_str() {
            "A" => Some(Grade::A),
            "B" => Some(Grade::B),
            "C" => Some(Grade::C),
            "D" => Some(Grade::D),
            _ => None,
        }
    }

    /// Category code in ordered position (A = 0)
    pub fn code(&self) -> u8 {
        *self as u8
    }
}

impl fmt::Display for Grade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Grade::A => "A",
            Grade::B => "B",
            Grade::C => "C",
            Grade::D => "D",
        };
        write!(f, "{}", label)
    }
}

/// Polygonal spatial unit from an external vector layer
#[derive(Debug, Clone)]
pub struct Zone {
    pub id: String,
    pub grade: Option<Grade>,
    pub geometry: MultiPolygon<f64>,
}

/// Per-zone vegetation statistics, one ledger row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZonalRecord {
    pub zone: String,
    pub total_pixels: u64,
    pub frac_veg: f64,
    pub mean_patch_size: f64,
    pub edge_density: f64,
}

/// Which side of a zone join lacked a partner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JoinSide {
    /// A ledger record whose id matches no zone
    RecordWithoutZone,
    /// A zone with no ledger record
    ZoneWithoutRecord,
}

impl fmt::Display for JoinSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JoinSide::RecordWithoutZone => write!(f, "record without zone"),
            JoinSide::ZoneWithoutRecord => write!(f, "zone without record"),
        }
    }
}

/// Error types for the ingestion and analysis pipeline
#[derive(Debug, thiserror::Error)]
pub enum VerdureError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("GDAL error: {0}")]
    Gdal(#[from] gdal::errors::GdalError),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid data format: {0}")]
    InvalidFormat(String),

    #[error("Processing error: {0}")]
    Processing(String),

    #[error("Source unavailable: {source_id}: {reason}")]
    SourceUnavailable { source_id: String, reason: String },

    #[error("Region of interest does not intersect {source_id}")]
    EmptyIntersection { source_id: String },

    #[error("Band {0} has no contributing tiles")]
    MissingBand(String),

    #[error("Transient catalog failure: {0}")]
    TransientCatalogFailure(String),

    #[error("Join mismatch for zone {zone_id}: {side}")]
    JoinMismatch { zone_id: String, side: JoinSide },

    #[error("CRS mismatch: expected {expected}, found {found}")]
    CrsMismatch { expected: String, found: String },

    #[error("Shape mismatch: expected {expected:?}, found {found:?}")]
    ShapeMismatch {
        expected: (usize, usize),
        found: (usize, usize),
    },

    #[error("Gave up after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },
}

impl VerdureError {
    /// Errors worth another attempt after a pause
    pub fn is_transient(&self) -> bool {
        matches!(self, VerdureError::TransientCatalogFailure(_))
    }

    /// Per-unit conditions that a batch loop records and skips
    pub fn is_skippable(&self) -> bool {
        matches!(
            self,
            VerdureError::SourceUnavailable { .. } | VerdureError::EmptyIntersection { .. }
        )
    }
}

/// Result type for pipeline operations
pub type VerdureResult<T> = Result<T, VerdureError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extent_north_up() {
        let gt = GeoTransform::north_up(100.0, 200.0, 10.0, 10.0);
        let bbox = gt.extent(3, 4);
        assert_eq!(bbox, BoundingBox::new(100.0, 170.0, 140.0, 200.0));
    }

    #[test]
    fn test_windowed_transform() {
        let gt = GeoTransform::north_up(0.0, 100.0, 30.0, 30.0);
        let sub = gt.windowed(2, 1);
        assert_eq!(sub.top_left_x, 60.0);
        assert_eq!(sub.top_left_y, 70.0);
        assert_eq!(sub.pixel_height, -30.0);
    }

    #[test]
    fn test_grade_order_and_parse() {
        assert!(Grade::A < Grade::D);
        assert_eq!(Grade::parse(" c"), Some(Grade::C));
        assert_eq!(Grade::parse("E"), None);
        assert_eq!(Grade::parse(""), None);
        assert_eq!(Grade::B.code(), 1);
    }

    #[test]
    fn test_crs_mismatch_is_reported() {
        let raster = Raster::new(
            SampleImage::zeros((2, 2)),
            GeoTransform::north_up(0.0, 0.0, 1.0, 1.0),
            Crs::Epsg(32615),
        );
        let err = raster.ensure_same_crs(&Crs::Epsg(4326)).unwrap_err();
        assert!(matches!(err, VerdureError::CrsMismatch { .. }));
    }

    #[test]
    fn test_error_classification() {
        assert!(VerdureError::TransientCatalogFailure("503".into()).is_transient());
        assert!(!VerdureError::MissingBand("B02".into()).is_transient());
        assert!(VerdureError::EmptyIntersection { source_id: "t".into() }.is_skippable());
    }
}
