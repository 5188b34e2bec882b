//! Tunable parameters of the registry pipeline.

use crate::anomaly::AnomalyParams;
use crate::error::{RegistryError, Result};
use crate::overhang::OverhangParams;
use crate::projection::LccParams;
use crate::tilt::TiltParams;
use serde::Deserialize;
use std::path::Path;

/// Parameters for the full registry pipeline.
///
/// Defaults: `buffer_m` = 0.3, `free_standing_epsilon_sqm` = 1e-6,
/// `min_overhang_area_sqm` = 1.0, `anomaly_threshold` = 1.1,
/// `full_cover_epsilon` = 1e-6,
/// `default_tilt_deg` = 30, `max_tilt_deg` = 50, `sqm_per_kwp` = 6.5,
/// `geocode_rate_per_sec` = 10, projection = ETRS89 / LCC Germany.
///
/// The two area thresholds and the anomaly ratio are empirical and were
/// calibrated on 10 cm aerial imagery; re-check them for other resolutions.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineParams {
    // -- aggregation --
    /// Buffer applied to every detection polygon before dissolving (meters).
    /// Gaps narrower than twice this value are bridged.
    pub buffer_m: f64,

    // -- overhang reconciliation --
    /// A remainder counts as bordering a rooftop only if
    /// `raw_area - area_diff` exceeds this (m²).
    pub free_standing_epsilon_sqm: f64,
    /// Remainders at or below this area are discarded (m²).
    pub min_overhang_area_sqm: f64,

    // -- anomaly filter --
    /// Groups whose summed intersect share exceeds this ratio are corrected.
    pub anomaly_threshold: f64,
    /// Fragments whose intersect share is within this of 1 count as full
    /// coverage when an anomalous group is corrected.
    pub full_cover_epsilon: f64,

    // -- tilt correction --
    /// Tilt substituted for flat, missing or implausible values (degrees).
    pub default_tilt_deg: f64,
    /// Tilts at or above this are considered implausible (degrees).
    pub max_tilt_deg: f64,

    // -- registry --
    /// Module area needed for one kWp of nameplate capacity (m²).
    pub sqm_per_kwp: f64,
    /// Upper bound on geocoding requests per second.
    pub geocode_rate_per_sec: u32,

    /// Metric CRS used for every area, buffer and distance computation.
    pub projection: LccParams,
}

impl Default for PipelineParams {
    fn default() -> Self {
        Self {
            buffer_m: 0.3,
            free_standing_epsilon_sqm: 1e-6,
            min_overhang_area_sqm: 1.0,
            anomaly_threshold: 1.1,
            full_cover_epsilon: 1e-6,
            default_tilt_deg: 30.0,
            max_tilt_deg: 50.0,
            sqm_per_kwp: 6.5,
            geocode_rate_per_sec: 10,
            projection: LccParams::default(),
        }
    }
}

impl PipelineParams {
    /// Load parameters from a TOML file. Missing keys keep their defaults.
    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|source| RegistryError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text).map_err(|message| RegistryError::Config {
            path: path.to_path_buf(),
            message,
        })
    }

    /// Parse parameters from TOML text.
    pub fn from_toml_str(text: &str) -> std::result::Result<Self, String> {
        toml::from_str(text).map_err(|e| e.to_string())
    }

    pub fn overhang(&self) -> OverhangParams {
        OverhangParams {
            free_standing_epsilon_sqm: self.free_standing_epsilon_sqm,
            min_overhang_area_sqm: self.min_overhang_area_sqm,
        }
    }

    pub fn anomaly(&self) -> AnomalyParams {
        AnomalyParams {
            threshold: self.anomaly_threshold,
            full_cover_epsilon: self.full_cover_epsilon,
        }
    }

    pub fn tilt(&self) -> TiltParams {
        TiltParams {
            default_tilt_deg: self.default_tilt_deg,
            max_tilt_deg: self.max_tilt_deg,
        }
    }
}
