//! Core raster analysis modules

pub mod quality_mask;
pub mod composite;
pub mod spectral_index;
pub mod patch_analysis;
pub mod zonal;
pub mod ledger;
pub mod feature_matrix;
pub mod pipeline;

// Re-export main types
pub use quality_mask::{decode_usable_mask, apply_usable_mask, QualityMaskParams};
pub use composite::{merge_tiles, temporal_composite, composite_bands, CompositeParams, CompositeStatistic, CompositeOutcome};
pub use spectral_index::{ndvi, normalized_difference};
pub use patch_analysis::{analyze_patches, analyze_raster, Connectivity, PatchParams, PatchStatistics};
pub use zonal::{clip_to_geometry, clip_touching_geometry, rasterize_zones, zonal_summary, ZonalSummary};
pub use ledger::{join_records, retry_with_policy, JoinedTable, Ledger, LedgerConfig, LedgerRun, RetryPolicy, ZoneState};
pub use feature_matrix::{build_feature_matrix, FeatureMatrix, FeatureMatrixParams};
pub use pipeline::{composite_reflectance, process_granules, zone_vegetation_record, RunReport};
