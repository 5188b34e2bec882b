//! End-to-end registry creation.
//!
//! ```text
//! detections ─► dissolve ─► overlay ─► overhangs ─► anomalies ─► tilt ─► rollups ─► geocode
//!                             ▲
//! rooftops ───────────────────┘
//! ```
//!
//! Every stage is a pure function of its inputs and [`PipelineParams`], so the
//! same inputs always give the same registries. Only geocoding talks to the
//! outside world and it is optional.

use crate::aggregation::dissolve_detections;
use crate::anomaly::{filter_area_anomalies, AnomalyReport};
use crate::geocode::Geocoder;
use crate::model::{RawDetection, RawInstallation, RooftopRecord, TiltedFragment};
use crate::overhang::{reconcile_overhangs, OverhangStats};
use crate::overlay::overlay_rooftops;
use crate::params::PipelineParams;
use crate::projection::{to_metric, LambertConformalConic};
use crate::registry::{
    address_registry, geocode_addresses, rooftop_registry, AddressRegistryRow, GeocodeStatus,
    RooftopRegistryRow,
};
use crate::tilt::correct_tilt;
use std::time::Instant;
use tracing::info;

/// Counts collected along the pipeline.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PipelineStats {
    pub detections: usize,
    pub rooftops: usize,
    pub installations: usize,
    /// Installation ∩ rooftop fragments before overhang reconciliation.
    pub intersections: usize,
    pub overhangs: OverhangStats,
    /// Rescued overhangs whose nearest fragment belongs to another installation.
    pub rescued_cross_installation: usize,
    pub anomalies: AnomalyReport,
    pub fragments: usize,
    pub rooftop_rows: usize,
    pub address_rows: usize,
    pub geocoded: usize,
    pub geocode_failed: usize,
}

/// Everything a run produces. Geometries are in the metric CRS of
/// `projection`.
#[derive(Debug, Clone)]
pub struct Registries {
    pub projection: LambertConformalConic,
    pub installations: Vec<RawInstallation>,
    /// Attributed, anomaly-filtered, tilt-corrected fragments.
    pub fragments: Vec<TiltedFragment>,
    pub rooftops: Vec<RooftopRegistryRow>,
    pub addresses: Vec<AddressRegistryRow>,
    pub stats: PipelineStats,
}

/// Run the full pipeline on WGS84 inputs.
///
/// Without a geocoder every address row stays [`GeocodeStatus::NotRequested`].
/// Zero detections or zero rooftops give empty registries.
pub fn create_registries(
    detections: &[RawDetection],
    rooftops: &[RooftopRecord],
    params: &PipelineParams,
    geocoder: Option<&dyn Geocoder>,
) -> Registries {
    let t0 = Instant::now();
    let projection = LambertConformalConic::new(&params.projection);
    let mut stats = PipelineStats {
        detections: detections.len(),
        rooftops: rooftops.len(),
        ..Default::default()
    };

    let metric_rooftops: Vec<RooftopRecord> = rooftops
        .iter()
        .map(|r| RooftopRecord {
            attributes: r.attributes.clone(),
            geometry: to_metric(&r.geometry, &projection),
        })
        .collect();

    // 1. detections → installations
    let installations = dissolve_detections(detections, &projection, params.buffer_m);
    stats.installations = installations.len();

    // 2. installations × rooftops
    let overlay = overlay_rooftops(&installations, &metric_rooftops);
    stats.intersections = overlay.on_rooftop.len();

    // 3. overhangs
    let (attributed, overhang_stats) = reconcile_overhangs(
        &installations,
        overlay.on_rooftop,
        &overlay.overhangs,
        &params.overhang(),
        &projection,
    );
    stats.overhangs = overhang_stats;
    stats.rescued_cross_installation = attributed
        .iter()
        .filter(|f| f.rescued_from_same_installation() == Some(false))
        .count();

    // 4. anomalies
    let (filtered, report) = filter_area_anomalies(attributed, &params.anomaly());
    stats.anomalies = report;

    // 5. tilt
    let fragments = correct_tilt(filtered, &params.tilt());
    stats.fragments = fragments.len();

    // 6. rollups
    let rooftop_rows = rooftop_registry(&fragments, params.sqm_per_kwp);
    let mut address_rows = address_registry(&fragments, params.sqm_per_kwp);
    stats.rooftop_rows = rooftop_rows.len();
    stats.address_rows = address_rows.len();

    // 7. geocoding
    if let Some(geocoder) = geocoder {
        address_rows = geocode_addresses(address_rows, geocoder);
        stats.geocoded = address_rows
            .iter()
            .filter(|r| matches!(r.geocode, GeocodeStatus::Resolved(_)))
            .count();
        stats.geocode_failed = address_rows
            .iter()
            .filter(|r| matches!(r.geocode, GeocodeStatus::Failed(_)))
            .count();
    }

    info!(
        "registries created in {:.2}s: {} installations, {} fragments, {} rooftops, {} addresses",
        t0.elapsed().as_secs_f64(),
        stats.installations,
        stats.fragments,
        stats.rooftop_rows,
        stats.address_rows
    );

    Registries {
        projection,
        installations,
        fragments,
        rooftops: rooftop_rows,
        addresses: address_rows,
        stats,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geocode::{Coordinate, GeocodeError};
    use crate::model::fixtures::{attrs, rect};
    use crate::projection::to_wgs84;

    const X0: f64 = -243_000.0;
    const Y0: f64 = 50_000.0;

    fn wgs84_rect(x0: f64, y0: f64, x1: f64, y1: f64) -> geo::MultiPolygon<f64> {
        to_wgs84(
            &rect(X0 + x0, Y0 + y0, X0 + x1, Y0 + y1),
            &LambertConformalConic::default(),
        )
    }

    fn detection(tile: &str, x0: f64, y0: f64, x1: f64, y1: f64) -> RawDetection {
        RawDetection {
            tile_id: tile.to_string(),
            image_cell_origin: "POINT (7.0 51.4)".to_string(),
            polygon: wgs84_rect(x0, y0, x1, y1),
        }
    }

    /// Two panels split across image cells with a 0.5 m seam over one roof
    /// that overhang its eastern edge, plus a free-standing ground array.
    fn fixture() -> (Vec<RawDetection>, Vec<RooftopRecord>) {
        let detections = vec![
            detection("tile_1", 0.0, 0.0, 5.0, 5.0),
            detection("tile_2", 5.5, 0.0, 10.5, 5.0),
            detection("tile_2", 200.0, 0.0, 203.0, 3.0),
        ];
        let rooftops = vec![RooftopRecord {
            attributes: attrs("R1", "Lindenallee", "10", Some(25.0)),
            geometry: wgs84_rect(-1.0, -1.0, 8.5, 6.0),
        }];
        (detections, rooftops)
    }

    #[test]
    fn test_end_to_end() {
        let (detections, rooftops) = fixture();
        let out = create_registries(&detections, &rooftops, &PipelineParams::default(), None);

        assert_eq!(out.installations.len(), 2);
        assert_eq!(out.stats.overhangs.free_standing, 1);
        assert_eq!(out.stats.overhangs.rescued, 1);
        assert_eq!(out.stats.rescued_cross_installation, 0);
        assert!(out.stats.anomalies.flagged.is_empty());

        // Intersection plus rescued overhang, both from installation 0.
        assert_eq!(out.fragments.len(), 2);
        assert!(out.fragments.iter().all(|f| f.fragment.identifier.0 == 0));

        assert_eq!(out.rooftops.len(), 1);
        let row = &out.rooftops[0];
        assert_eq!(row.roof_top_id, "R1");
        assert_eq!(row.fragment_count, 2);
        let raw = out.installations[0].raw_area_sqm;
        assert!((row.area_inter_sqm - raw).abs() / raw < 1e-6);
        let expected_tilted = row.area_inter_sqm / 25f64.to_radians().cos();
        assert!((row.area_tilted_sqm - expected_tilted).abs() < 1e-6);
        assert!((row.capacity_not_tilted_kwp - row.area_inter_sqm / 6.5).abs() < 1e-9);

        assert_eq!(out.addresses.len(), 1);
        assert_eq!(out.addresses[0].street_address, "Lindenallee 10");
        assert_eq!(out.addresses[0].geocode, GeocodeStatus::NotRequested);
    }

    #[test]
    fn test_identical_runs_identical_output() {
        let (detections, rooftops) = fixture();
        let params = PipelineParams::default();
        let a = create_registries(&detections, &rooftops, &params, None);
        let b = create_registries(&detections, &rooftops, &params, None);
        assert_eq!(a.rooftops, b.rooftops);
        assert_eq!(a.addresses, b.addresses);
        assert_eq!(a.stats, b.stats);
    }

    #[test]
    fn test_no_detections() {
        let (_, rooftops) = fixture();
        let out = create_registries(&[], &rooftops, &PipelineParams::default(), None);
        assert!(out.installations.is_empty());
        assert!(out.rooftops.is_empty());
        assert!(out.addresses.is_empty());
    }

    #[test]
    fn test_no_rooftops() {
        let (detections, _) = fixture();
        let out = create_registries(&detections, &[], &PipelineParams::default(), None);
        assert_eq!(out.installations.len(), 2);
        assert!(out.fragments.is_empty());
        assert!(out.rooftops.is_empty());
        assert!(out.addresses.is_empty());
    }

    struct FixedGeocoder;

    impl Geocoder for FixedGeocoder {
        fn resolve(&self, address: &str) -> Result<Coordinate, GeocodeError> {
            if address.starts_with("Lindenallee") {
                Ok(Coordinate { lat: 51.45, lon: 7.01 })
            } else {
                Err(GeocodeError::NotFound)
            }
        }
    }

    #[test]
    fn test_geocoding_stage() {
        let (detections, rooftops) = fixture();
        let out = create_registries(
            &detections,
            &rooftops,
            &PipelineParams::default(),
            Some(&FixedGeocoder as &dyn Geocoder),
        );
        assert_eq!(out.stats.geocoded, 1);
        assert_eq!(out.stats.geocode_failed, 0);
        assert_eq!(
            out.addresses[0].geocode.coordinate(),
            Some(Coordinate { lat: 51.45, lon: 7.01 })
        );
    }
}
