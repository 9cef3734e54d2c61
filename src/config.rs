use crate::core::composite::CompositeParams;
use crate::core::feature_matrix::FeatureMatrixParams;
use crate::core::ledger::LedgerConfig;
use crate::core::patch_analysis::PatchParams;
use crate::core::quality_mask::QualityMaskParams;
use crate::io::tile_reader::AccessorConfig;
use crate::types::VerdureResult;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Settings for every stage; fields missing from a config file keep their defaults
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub accessor: AccessorConfig,
    pub quality: QualityMaskParams,
    pub composite: CompositeParams,
    pub patch: PatchParams,
    pub ledger: LedgerConfig,
    pub feature: FeatureMatrixParams,
}

impl PipelineConfig {
    pub fn from_json_str(text: &str) -> VerdureResult<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn from_json_file<P: AsRef<Path>>(path: P) -> VerdureResult<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let config = Self::from_json_str(&text)?;
        log::info!("Loaded pipeline configuration from {}", path.as_ref().display());
        Ok(config)
    }

    pub fn to_json_file<P: AsRef<Path>>(&self, path: P) -> VerdureResult<()> {
        std::fs::write(path.as_ref(), serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}
