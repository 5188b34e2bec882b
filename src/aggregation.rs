//! Dissolve raw detection polygons into distinct installations.
//!
//! Pipeline: project → buffer → union (dissolve) → split into connected
//! components (explode) → number components.

use crate::model::{InstallationId, RawDetection, RawInstallation};
use crate::projection::{to_metric, MetricProjection};
use geo::{unary_union, Area, BoundingRect, Buffer, MultiPolygon, Polygon};
use std::cmp::Ordering;
use tracing::{debug, info};

/// Merge detections into installations.
///
/// Each detection is projected into the metric CRS and grown by `buffer_m`
/// so that polygons split across image cells or tiles touch again. The
/// buffered polygons are unioned and the union is exploded into its
/// connected parts. Parts are numbered from 0 in order of the lower-left
/// corner of their bounding box (x first, then y), so identical input always
/// yields identical identifiers.
///
/// A non-positive `buffer_m` disables buffering. Empty input gives an empty
/// result.
pub fn dissolve_detections<P>(
    detections: &[RawDetection],
    projection: &P,
    buffer_m: f64,
) -> Vec<RawInstallation>
where
    P: MetricProjection + ?Sized,
{
    if detections.is_empty() {
        info!("no detections to dissolve");
        return Vec::new();
    }

    let mut pieces: Vec<Polygon<f64>> = Vec::with_capacity(detections.len());
    for det in detections {
        let metric: MultiPolygon<f64> = to_metric(&det.polygon, projection);
        let grown = if buffer_m > 0.0 {
            metric.buffer(buffer_m)
        } else {
            metric
        };
        pieces.extend(grown.0);
    }

    let dissolved = unary_union(&pieces);
    let mut components: Vec<Polygon<f64>> = dissolved
        .0
        .into_iter()
        .filter(|p| p.unsigned_area() > 0.0)
        .collect();
    components.sort_by(lower_left_cmp);

    let installations: Vec<RawInstallation> = components
        .into_iter()
        .enumerate()
        .map(|(i, polygon)| {
            let geometry = MultiPolygon::new(vec![polygon]);
            let raw_area_sqm = geometry.unsigned_area();
            RawInstallation {
                identifier: InstallationId(i as u64),
                geometry,
                raw_area_sqm,
            }
        })
        .collect();

    debug!(
        pieces = pieces.len(),
        components = installations.len(),
        buffer_m,
        "dissolved detection polygons"
    );
    info!(
        "{} detections merged into {} installations",
        detections.len(),
        installations.len()
    );
    installations
}

fn lower_left_cmp(a: &Polygon<f64>, b: &Polygon<f64>) -> Ordering {
    let key = |p: &Polygon<f64>| {
        p.bounding_rect()
            .map(|r| (r.min().x, r.min().y))
            .unwrap_or((f64::INFINITY, f64::INFINITY))
    };
    let (ax, ay) = key(a);
    let (bx, by) = key(b);
    ax.total_cmp(&bx).then_with(|| ay.total_cmp(&by))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::fixtures::rect;
    use crate::projection::{to_wgs84, LambertConformalConic};

    const X0: f64 = -243_000.0;
    const Y0: f64 = 50_000.0;

    fn detection(proj: &LambertConformalConic, x0: f64, y0: f64, x1: f64, y1: f64) -> RawDetection {
        RawDetection {
            tile_id: "tile_0".into(),
            image_cell_origin: "POINT (7.0 51.4)".into(),
            polygon: to_wgs84(&rect(X0 + x0, Y0 + y0, X0 + x1, Y0 + y1), proj),
        }
    }

    #[test]
    fn test_empty_input() {
        let proj = LambertConformalConic::default();
        assert!(dissolve_detections(&[], &proj, 0.3).is_empty());
    }

    #[test]
    fn test_tile_split_is_bridged() {
        let proj = LambertConformalConic::default();
        // One panel split at a tile edge with a 0.2 m seam.
        let dets = vec![
            detection(&proj, 0.0, 0.0, 4.0, 2.0),
            detection(&proj, 4.2, 0.0, 8.0, 2.0),
        ];
        let inst = dissolve_detections(&dets, &proj, 0.3);
        assert_eq!(inst.len(), 1);
        // Buffered outline: roughly (8 + 0.6) x (2 + 0.6) minus rounded corners.
        assert!(inst[0].raw_area_sqm > 16.0 && inst[0].raw_area_sqm < 8.6 * 2.6);
    }

    #[test]
    fn test_distant_panels_stay_apart_and_are_numbered_west_to_east() {
        let proj = LambertConformalConic::default();
        let dets = vec![
            detection(&proj, 50.0, 0.0, 53.0, 3.0),
            detection(&proj, 0.0, 0.0, 5.0, 5.0),
        ];
        let inst = dissolve_detections(&dets, &proj, 0.3);
        assert_eq!(inst.len(), 2);
        assert_eq!(inst[0].identifier, InstallationId(0));
        assert_eq!(inst[1].identifier, InstallationId(1));
        // The western (larger) panel gets the lower identifier.
        assert!(inst[0].raw_area_sqm > inst[1].raw_area_sqm);
    }

    #[test]
    fn test_zero_buffer_keeps_exact_area() {
        let proj = LambertConformalConic::default();
        let dets = vec![detection(&proj, 0.0, 0.0, 5.0, 5.0)];
        let inst = dissolve_detections(&dets, &proj, 0.0);
        assert_eq!(inst.len(), 1);
        assert!((inst[0].raw_area_sqm - 25.0).abs() < 1e-4);
    }

    #[test]
    fn test_repeatable_identifiers() {
        let proj = LambertConformalConic::default();
        let dets = vec![
            detection(&proj, 20.0, 0.0, 23.0, 3.0),
            detection(&proj, 0.0, 10.0, 3.0, 13.0),
            detection(&proj, 0.0, 0.0, 3.0, 3.0),
        ];
        let a = dissolve_detections(&dets, &proj, 0.3);
        let b = dissolve_detections(&dets, &proj, 0.3);
        let areas_a: Vec<(InstallationId, f64)> = a.iter().map(|i| (i.identifier, i.raw_area_sqm)).collect();
        let areas_b: Vec<(InstallationId, f64)> = b.iter().map(|i| (i.identifier, i.raw_area_sqm)).collect();
        assert_eq!(areas_a, areas_b);
    }
}
