//! verdure: cloud-masked satellite compositing and vegetation patch statistics
//!
//! Reads HLS and NAIP tiles, masks them with Fmask quality bits, builds
//! median reflectance composites and summarises vegetation structure per
//! zone into a resumable ledger.

pub mod types;
pub mod io;
pub mod core;
pub mod config;

#[cfg(feature = "python")]
mod python;

// Re-export main types and functions for easier access
pub use types::{
    BoundingBox, Crs, GeoTransform, Grade, MultiBandRaster, QualityFlagSet, Raster, Tile,
    UsableMask, VerdureError, VerdureResult, ZonalRecord, Zone,
};

pub use config::PipelineConfig;
pub use io::{TileReader, TileSource, ZoneLayer};
pub use core::{Ledger, RunReport};
