//! Overlay installations against rooftops.
//!
//! Intersection yields one attributed fragment per (installation, rooftop)
//! pair; difference yields at most one remainder per installation.

use crate::model::{
    FragmentOrigin, OverhangFragment, RawInstallation, RooftopFragment, RooftopRecord,
};
use geo::{unary_union, Area, BooleanOps, BoundingRect, Centroid, MultiPolygon, Rect};
use rstar::primitives::{GeomWithData, Rectangle};
use rstar::{RTree, AABB};
use tracing::{debug, info};

/// Result of [`overlay_rooftops`].
#[derive(Debug, Clone, Default)]
pub struct OverlayResult {
    /// Installation ∩ rooftop pieces, with rooftop attributes.
    pub on_rooftop: Vec<RooftopFragment>,
    /// Installation − ⋃ rooftops, for installations with a non-empty remainder.
    pub overhangs: Vec<OverhangFragment>,
}

type RooftopEnvelope = GeomWithData<Rectangle<[f64; 2]>, usize>;

/// Spatial index over rooftop bounding boxes.
pub struct RooftopIndex<'a> {
    rooftops: &'a [RooftopRecord],
    tree: RTree<RooftopEnvelope>,
}

impl<'a> RooftopIndex<'a> {
    /// Index metric rooftops. Rooftops without extent are left out.
    pub fn new(rooftops: &'a [RooftopRecord]) -> Self {
        let envelopes: Vec<RooftopEnvelope> = rooftops
            .iter()
            .enumerate()
            .filter_map(|(i, r)| {
                r.geometry
                    .bounding_rect()
                    .map(|rect| GeomWithData::new(rectangle(&rect), i))
            })
            .collect();
        Self {
            rooftops,
            tree: RTree::bulk_load(envelopes),
        }
    }

    /// Rooftops whose bounding box meets `rect`, in input order.
    pub fn candidates(&self, rect: &Rect<f64>) -> Vec<&'a RooftopRecord> {
        let query = AABB::from_corners([rect.min().x, rect.min().y], [rect.max().x, rect.max().y]);
        let mut hits: Vec<usize> = self
            .tree
            .locate_in_envelope_intersecting(&query)
            .map(|e| e.data)
            .collect();
        hits.sort_unstable();
        hits.into_iter().map(|i| &self.rooftops[i]).collect()
    }
}

fn rectangle(rect: &Rect<f64>) -> Rectangle<[f64; 2]> {
    Rectangle::from_corners([rect.min().x, rect.min().y], [rect.max().x, rect.max().y])
}

/// Split every installation into on-rooftop fragments and an off-rooftop
/// remainder. Both `installations` and `rooftops` must be in the metric CRS.
///
/// An installation touching no rooftop passes through whole as its own
/// remainder, so its remainder area equals its raw area exactly.
pub fn overlay_rooftops(installations: &[RawInstallation], rooftops: &[RooftopRecord]) -> OverlayResult {
    let index = RooftopIndex::new(rooftops);
    let mut result = OverlayResult::default();

    for inst in installations {
        let Some(bbox) = inst.geometry.bounding_rect() else {
            continue;
        };

        let mut touched: Vec<&RooftopRecord> = Vec::new();
        for rooftop in index.candidates(&bbox) {
            let piece: MultiPolygon<f64> = inst.geometry.intersection(&rooftop.geometry);
            let area = piece.unsigned_area();
            if area <= 0.0 {
                continue;
            }
            let Some(centroid) = piece.centroid() else {
                continue;
            };
            touched.push(rooftop);
            result.on_rooftop.push(RooftopFragment {
                identifier: inst.identifier,
                rooftop: rooftop.attributes.clone(),
                geometry: piece,
                centroid,
                area_inter_sqm: area,
                raw_area_sqm: inst.raw_area_sqm,
                origin: FragmentOrigin::Intersection,
            });
        }

        let remainder = if touched.is_empty() {
            inst.geometry.clone()
        } else {
            let roofs = unary_union(touched.iter().flat_map(|r| r.geometry.0.iter()));
            inst.geometry.difference(&roofs)
        };
        let area_diff_sqm = remainder.unsigned_area();
        if area_diff_sqm > 0.0 {
            result.overhangs.push(OverhangFragment {
                identifier: inst.identifier,
                geometry: remainder,
                area_diff_sqm,
            });
        }

        debug!(
            identifier = %inst.identifier,
            rooftops = touched.len(),
            area_diff_sqm,
            "overlaid installation"
        );
    }

    info!(
        "overlay: {} on-rooftop fragments, {} remainders from {} installations",
        result.on_rooftop.len(),
        result.overhangs.len(),
        installations.len()
    );
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::fixtures::{attrs, rect};
    use crate::model::InstallationId;
    use std::collections::HashMap;

    fn installation(id: u64, geometry: MultiPolygon<f64>) -> RawInstallation {
        let raw_area_sqm = geometry.unsigned_area();
        RawInstallation {
            identifier: InstallationId(id),
            geometry,
            raw_area_sqm,
        }
    }

    fn rooftop(id: &str, geometry: MultiPolygon<f64>) -> RooftopRecord {
        RooftopRecord {
            attributes: attrs(id, "Hauptstr.", "1", Some(35.0)),
            geometry,
        }
    }

    #[test]
    fn test_installation_over_two_roofs() {
        let inst = vec![installation(0, rect(0.0, 0.0, 10.0, 4.0))];
        let roofs = vec![
            rooftop("R1", rect(-5.0, -5.0, 4.0, 10.0)),
            rooftop("R2", rect(4.0, -5.0, 8.0, 10.0)),
        ];
        let out = overlay_rooftops(&inst, &roofs);
        assert_eq!(out.on_rooftop.len(), 2);
        assert_eq!(out.on_rooftop[0].rooftop.roof_top_id, "R1");
        assert_eq!(out.on_rooftop[1].rooftop.roof_top_id, "R2");
        assert!((out.on_rooftop[0].area_inter_sqm - 16.0).abs() < 1e-6);
        assert!((out.on_rooftop[1].area_inter_sqm - 16.0).abs() < 1e-6);
        assert_eq!(out.overhangs.len(), 1);
        assert!((out.overhangs[0].area_diff_sqm - 8.0).abs() < 1e-6);
    }

    #[test]
    fn test_free_standing_passes_through() {
        let inst = vec![installation(3, rect(100.0, 100.0, 103.0, 103.0))];
        let roofs = vec![rooftop("R1", rect(0.0, 0.0, 10.0, 10.0))];
        let out = overlay_rooftops(&inst, &roofs);
        assert!(out.on_rooftop.is_empty());
        assert_eq!(out.overhangs.len(), 1);
        assert_eq!(out.overhangs[0].area_diff_sqm, inst[0].raw_area_sqm);
    }

    #[test]
    fn test_bbox_overlap_without_contact() {
        // L-shaped rooftop whose bounding box covers the panel.
        let roof_l = MultiPolygon::new(vec![geo::Polygon::new(
            vec![(0.0, 0.0), (10.0, 0.0), (10.0, 2.0), (2.0, 2.0), (2.0, 10.0), (0.0, 10.0), (0.0, 0.0)].into(),
            vec![],
        )]);
        let inst = vec![installation(0, rect(5.0, 5.0, 8.0, 8.0))];
        let out = overlay_rooftops(&inst, &[rooftop("L", roof_l)]);
        assert!(out.on_rooftop.is_empty());
        assert_eq!(out.overhangs[0].area_diff_sqm, inst[0].raw_area_sqm);
    }

    #[test]
    fn test_area_conservation() {
        let inst = vec![
            installation(0, rect(0.0, 0.0, 7.3, 3.1)),
            installation(1, rect(20.0, 0.0, 26.0, 6.0)),
            installation(2, rect(50.0, 50.0, 52.0, 52.0)),
        ];
        let roofs = vec![
            rooftop("R1", rect(-1.0, -1.0, 5.2, 2.5)),
            rooftop("R2", rect(21.5, 1.5, 30.0, 30.0)),
            rooftop("R3", rect(6.0, -3.0, 9.0, 1.0)),
        ];
        let out = overlay_rooftops(&inst, &roofs);

        let mut inter: HashMap<InstallationId, f64> = HashMap::new();
        for f in &out.on_rooftop {
            *inter.entry(f.identifier).or_insert(0.0) += f.area_inter_sqm;
        }
        let mut diff: HashMap<InstallationId, f64> = HashMap::new();
        for o in &out.overhangs {
            *diff.entry(o.identifier).or_insert(0.0) += o.area_diff_sqm;
        }
        for i in &inst {
            let total = inter.get(&i.identifier).copied().unwrap_or(0.0)
                + diff.get(&i.identifier).copied().unwrap_or(0.0);
            assert!(
                ((total - i.raw_area_sqm) / i.raw_area_sqm).abs() < 1e-6,
                "{}: {} vs {}",
                i.identifier,
                total,
                i.raw_area_sqm
            );
        }
    }

    #[test]
    fn test_no_rooftops() {
        let inst = vec![installation(0, rect(0.0, 0.0, 2.0, 2.0))];
        let out = overlay_rooftops(&inst, &[]);
        assert!(out.on_rooftop.is_empty());
        assert_eq!(out.overhangs.len(), 1);
    }
}
