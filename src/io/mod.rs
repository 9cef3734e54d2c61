//! Raster, catalog, vector and cache input/output

pub mod tile_reader;
pub mod catalog;
pub mod zones;
pub mod cache;

pub use tile_reader::{AccessorConfig, RegionOfInterest, TileReader, TileSource};
pub use catalog::{group_granules, parse_hls_name, CatalogEntry, CatalogSearch, Granule, StaticCatalog};
pub use zones::ZoneLayer;
pub use cache::{CacheStore, Cached, FsCacheStore, MemoryCacheStore};
