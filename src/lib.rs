//! # pvregistry — rooftop PV registry from aerial detections
//!
//! Reconciles photovoltaic panel polygons detected on aerial imagery with
//! cadastral rooftop polygons and rolls the result up into two registries:
//! one row per rooftop and one row per street address, each with raw and
//! tilt-corrected module area and the derived nameplate capacity.
//!
//! This crate provides:
//! - **Stages**: `dissolve_detections`, `overlay_rooftops`,
//!   `reconcile_overhangs`, `filter_area_anomalies`, `correct_tilt`,
//!   `rooftop_registry`, `address_registry`, `geocode_addresses`
//! - **Driver**: `create_registries` runs them in order
//! - **I/O**: detection CSV/WKT and rooftop GeoJSON readers, GeoJSON and CSV
//!   writers
//!
//! All geometry math happens in a metric Lambert Conformal Conic CRS
//! (ETRS89 / LCC Germany by default); inputs and outputs are WGS84.

pub mod aggregation;
pub mod anomaly;
pub mod error;
pub mod geocode;
pub mod io;
pub mod model;
pub mod overhang;
pub mod overlay;
pub mod params;
pub mod pipeline;
pub mod projection;
pub mod registry;
pub mod tilt;

pub use error::{RecordError, RegistryError, Result};
pub use geocode::{Geocoder, NominatimGeocoder, Throttled};
pub use model::*;
pub use params::PipelineParams;
pub use pipeline::{create_registries, PipelineStats, Registries};
pub use projection::{LambertConformalConic, MetricProjection};
