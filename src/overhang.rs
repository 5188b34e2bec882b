//! Overhang reconciliation: rescue remainders that border a rooftop.
//!
//! Pipeline: border check (`raw_area − area_diff > ε`) → join check and
//! centroid → sibling and minimum-area check → nearest on-rooftop fragment.
//!
//! A remainder is registered iff its installation also produced at least one
//! on-rooftop fragment AND its area exceeds the minimum overhang area. The
//! rescued record keeps its own polygon, area and identifier and borrows the
//! rooftop attributes of the nearest on-rooftop fragment centroid.

use crate::model::{
    FragmentOrigin, InstallationId, OverhangFragment, RawInstallation, RooftopFragment,
};
use crate::projection::MetricProjection;
use geo::{Centroid, Distance, Geodesic, MultiPolygon, Point};
use rstar::primitives::GeomWithData;
use rstar::RTree;
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Thresholds for [`reconcile_overhangs`].
#[derive(Debug, Clone, Copy)]
pub struct OverhangParams {
    /// `raw_area − area_diff` must exceed this for the remainder to count as
    /// bordering a rooftop (m²).
    pub free_standing_epsilon_sqm: f64,
    /// Remainders must be strictly larger than this (m²).
    pub min_overhang_area_sqm: f64,
}

impl Default for OverhangParams {
    fn default() -> Self {
        Self {
            free_standing_epsilon_sqm: 1e-6,
            min_overhang_area_sqm: 1.0,
        }
    }
}

/// A remainder that survived the border and join checks.
#[derive(Debug, Clone)]
pub struct OverhangCandidate {
    pub identifier: InstallationId,
    pub centroid: Point<f64>,
    /// Original remainder outline, restored on the rescued record.
    pub geometry: MultiPolygon<f64>,
    pub area_diff_sqm: f64,
    pub raw_area_sqm: f64,
}

/// Counts of remainders removed at each step.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OverhangStats {
    pub remainders: usize,
    pub free_standing: usize,
    pub missing_join_key: usize,
    pub without_centroid: usize,
    pub without_rooftop_sibling: usize,
    pub below_min_area: usize,
    pub rescued: usize,
}

/// Identifier → indices of its on-rooftop fragments.
pub type FragmentsByInstallation = BTreeMap<InstallationId, Vec<usize>>;

/// Group on-rooftop fragments by installation identifier.
pub fn fragments_by_installation(on_rooftop: &[RooftopFragment]) -> FragmentsByInstallation {
    let mut map: FragmentsByInstallation = BTreeMap::new();
    for (i, f) in on_rooftop.iter().enumerate() {
        map.entry(f.identifier).or_default().push(i);
    }
    map
}

// ---------------------------------------------------------------------------
// Steps 1–3: candidate selection
// ---------------------------------------------------------------------------

/// Select the remainders eligible for rescue.
///
/// 1. Keep remainders with `raw_area − area_diff > ε`; an installation that
///    touches no rooftop has `area_diff == raw_area` and is free-standing.
/// 2. Drop remainders whose identifier has no installation, and remainders
///    without a centroid.
/// 3. Keep remainders whose identifier is in `siblings` and whose area
///    exceeds the minimum.
pub fn select_candidates(
    installations: &[RawInstallation],
    overhangs: &[OverhangFragment],
    siblings: &FragmentsByInstallation,
    params: &OverhangParams,
    stats: &mut OverhangStats,
) -> Vec<OverhangCandidate> {
    let raw_area: HashMap<InstallationId, f64> = installations
        .iter()
        .map(|i| (i.identifier, i.raw_area_sqm))
        .collect();

    stats.remainders += overhangs.len();
    let mut candidates = Vec::new();

    for rem in overhangs {
        let Some(&raw_area_sqm) = raw_area.get(&rem.identifier) else {
            debug!(identifier = %rem.identifier, "remainder without installation dropped");
            stats.missing_join_key += 1;
            continue;
        };

        let checker = raw_area_sqm - rem.area_diff_sqm;
        if checker <= params.free_standing_epsilon_sqm {
            stats.free_standing += 1;
            continue;
        }

        let Some(centroid) = rem.geometry.centroid() else {
            stats.without_centroid += 1;
            continue;
        };

        if !siblings.contains_key(&rem.identifier) {
            stats.without_rooftop_sibling += 1;
            continue;
        }
        if rem.area_diff_sqm <= params.min_overhang_area_sqm {
            stats.below_min_area += 1;
            continue;
        }

        candidates.push(OverhangCandidate {
            identifier: rem.identifier,
            centroid,
            geometry: rem.geometry.clone(),
            area_diff_sqm: rem.area_diff_sqm,
            raw_area_sqm,
        });
    }
    candidates
}

// ---------------------------------------------------------------------------
// Step 4: nearest on-rooftop fragment
// ---------------------------------------------------------------------------

type IndexedCentroid = GeomWithData<[f64; 2], usize>;

/// Exact nearest-neighbor index over on-rooftop fragment centroids (planar,
/// metric coordinates).
pub struct CentroidIndex {
    tree: RTree<IndexedCentroid>,
}

impl CentroidIndex {
    pub fn new(on_rooftop: &[RooftopFragment]) -> Self {
        let points: Vec<IndexedCentroid> = on_rooftop
            .iter()
            .enumerate()
            .map(|(i, f)| GeomWithData::new([f.centroid.x(), f.centroid.y()], i))
            .collect();
        Self {
            tree: RTree::bulk_load(points),
        }
    }

    /// Index of the fragment whose centroid is closest to `point`.
    pub fn nearest(&self, point: Point<f64>) -> Option<usize> {
        self.tree
            .nearest_neighbor(&[point.x(), point.y()])
            .map(|hit| hit.data)
    }

    pub fn is_empty(&self) -> bool {
        self.tree.size() == 0
    }
}

/// Geodesic distance in meters between two metric points.
pub fn geodesic_distance_m<P>(a: Point<f64>, b: Point<f64>, projection: &P) -> f64
where
    P: MetricProjection + ?Sized,
{
    let a = Point::from(projection.inverse(a.0));
    let b = Point::from(projection.inverse(b.0));
    Geodesic.distance(a, b)
}

/// Run all four reconciliation steps and return the on-rooftop table with
/// rescued remainders appended after the original fragments.
pub fn reconcile_overhangs<P>(
    installations: &[RawInstallation],
    on_rooftop: Vec<RooftopFragment>,
    overhangs: &[OverhangFragment],
    params: &OverhangParams,
    projection: &P,
) -> (Vec<RooftopFragment>, OverhangStats)
where
    P: MetricProjection + ?Sized,
{
    let mut stats = OverhangStats::default();
    let siblings = fragments_by_installation(&on_rooftop);
    let candidates = select_candidates(installations, overhangs, &siblings, params, &mut stats);

    let index = CentroidIndex::new(&on_rooftop);
    let mut rescued: Vec<RooftopFragment> = Vec::with_capacity(candidates.len());

    if !index.is_empty() {
        for cand in candidates {
            let Some(nearest) = index.nearest(cand.centroid) else {
                continue;
            };
            let matched = &on_rooftop[nearest];
            let distance_m = geodesic_distance_m(cand.centroid, matched.centroid, projection);
            if matched.identifier != cand.identifier {
                debug!(
                    identifier = %cand.identifier,
                    matched = %matched.identifier,
                    distance_m,
                    "overhang matched a fragment of another installation"
                );
            }
            rescued.push(RooftopFragment {
                identifier: cand.identifier,
                rooftop: matched.rooftop.clone(),
                geometry: cand.geometry,
                centroid: cand.centroid,
                area_inter_sqm: cand.area_diff_sqm,
                raw_area_sqm: cand.raw_area_sqm,
                origin: FragmentOrigin::Rescued {
                    matched_identifier: matched.identifier,
                    distance_m,
                },
            });
        }
    }

    stats.rescued = rescued.len();
    info!(
        "overhangs: {} remainders, {} free-standing, {} without rooftop fragment, {} ≤ min area, {} rescued",
        stats.remainders,
        stats.free_standing,
        stats.without_rooftop_sibling,
        stats.below_min_area,
        stats.rescued
    );

    let mut combined = on_rooftop;
    combined.extend(rescued);
    (combined, stats)
}
