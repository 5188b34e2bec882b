//! Correct installations whose attributed area exceeds their raw area.
//!
//! Overlapping rooftop segments and overlay numerics can attribute the same
//! area twice. For installations whose summed intersect share exceeds the
//! threshold, only full-coverage fragments are kept, one per installation.
//! A fragment counts as full coverage when its share is within
//! `full_cover_epsilon` of 1, since the overlay rarely returns a contained
//! polygon with its exact area. This is a corrective heuristic, not a proof
//! that the remaining row is the right one.

use crate::model::{sort_canonical, InstallationId, RooftopFragment};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use tracing::{info, warn};

/// Thresholds for [`filter_area_anomalies`].
#[derive(Debug, Clone, Copy)]
pub struct AnomalyParams {
    /// Installations whose summed share exceeds this are corrected.
    pub threshold: f64,
    /// Shares of at least `1 - full_cover_epsilon` count as full coverage.
    pub full_cover_epsilon: f64,
}

impl Default for AnomalyParams {
    fn default() -> Self {
        Self {
            threshold: 1.1,
            full_cover_epsilon: 1e-6,
        }
    }
}

/// Outcome of [`filter_area_anomalies`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AnomalyReport {
    /// Installations whose summed share exceeded the threshold.
    pub flagged: Vec<InstallationId>,
    /// Rows of flagged installations with an individual share below 1.
    pub dropped_partial: usize,
    /// Further rows of flagged installations beyond the first kept one.
    pub dropped_duplicates: usize,
}

/// Summed `area_inter / raw_area` per installation.
pub fn intersect_share_by_installation(fragments: &[RooftopFragment]) -> BTreeMap<InstallationId, f64> {
    let mut sums: BTreeMap<InstallationId, f64> = BTreeMap::new();
    for f in fragments {
        *sums.entry(f.identifier).or_insert(0.0) += f.percentage_intersect();
    }
    sums
}

/// Drop anomalous rows.
///
/// Rows are first put in canonical order (see [`sort_canonical`]). For every
/// installation whose summed share exceeds `params.threshold`:
/// 1. rows with an individual share below `1 - params.full_cover_epsilon`
///    are dropped;
/// 2. of the remaining rows only the first in canonical order is kept.
///
/// Rows of unflagged installations are untouched. The result stays in
/// canonical order.
pub fn filter_area_anomalies(
    fragments: Vec<RooftopFragment>,
    params: &AnomalyParams,
) -> (Vec<RooftopFragment>, AnomalyReport) {
    let fragments = sort_canonical(fragments);
    let flagged: BTreeSet<InstallationId> = intersect_share_by_installation(&fragments)
        .into_iter()
        .filter(|(_, share)| *share > params.threshold)
        .map(|(id, _)| id)
        .collect();

    let mut report = AnomalyReport {
        flagged: flagged.iter().copied().collect(),
        ..Default::default()
    };
    if flagged.is_empty() {
        return (fragments, report);
    }

    let full_cover = 1.0 - params.full_cover_epsilon;
    let mut kept_flagged: HashSet<InstallationId> = HashSet::new();
    let mut kept = Vec::with_capacity(fragments.len());
    for f in fragments {
        if !flagged.contains(&f.identifier) {
            kept.push(f);
            continue;
        }
        if f.percentage_intersect() < full_cover {
            report.dropped_partial += 1;
            continue;
        }
        if !kept_flagged.insert(f.identifier) {
            report.dropped_duplicates += 1;
            continue;
        }
        kept.push(f);
    }

    for id in &report.flagged {
        if !kept_flagged.contains(id) {
            warn!(identifier = %id, "anomalous installation lost all its fragments");
        }
    }
    info!(
        "anomaly filter: {} installations flagged, {} partial and {} duplicate rows dropped",
        report.flagged.len(),
        report.dropped_partial,
        report.dropped_duplicates
    );
    (kept, report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::fixtures::{attrs, fragment, rect};

    #[test]
    fn test_overlapping_fragments_lower_share_dropped() {
        // Raw area 10: a full-cover fragment (share 1.0) and a 2 m² sliver
        // from an overlapping roof segment (share 0.2) → sum 1.2.
        let rows = vec![
            fragment(4, attrs("R2", "A", "1", None), rect(0.0, 0.0, 1.0, 2.0), 10.0),
            fragment(4, attrs("R1", "A", "1", None), rect(0.0, 0.0, 5.0, 2.0), 10.0),
        ];
        let (kept, report) = filter_area_anomalies(rows, &AnomalyParams::default());
        assert_eq!(report.flagged, vec![InstallationId(4)]);
        assert_eq!(report.dropped_partial, 1);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].rooftop.roof_top_id, "R1");
    }

    #[test]
    fn test_duplicate_full_fragments_keep_first() {
        let rows = vec![
            fragment(1, attrs("R9", "A", "1", None), rect(0.0, 0.0, 5.0, 2.0), 10.0),
            fragment(1, attrs("R3", "A", "1", None), rect(0.0, 0.0, 5.0, 2.0), 10.0),
        ];
        let (kept, report) = filter_area_anomalies(rows, &AnomalyParams::default());
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].rooftop.roof_top_id, "R3");
        assert_eq!(report.dropped_duplicates, 1);
        let ids: HashSet<InstallationId> = kept.iter().map(|f| f.identifier).collect();
        assert_eq!(ids.len(), kept.len());
    }

    #[test]
    fn test_unflagged_rows_untouched() {
        // 0.6 + 0.45 = 1.05: under the threshold, both rows stay.
        let rows = vec![
            fragment(2, attrs("R1", "A", "1", None), rect(0.0, 0.0, 3.0, 2.0), 10.0),
            fragment(2, attrs("R2", "A", "1", None), rect(0.0, 0.0, 2.25, 2.0), 10.0),
            fragment(3, attrs("R1", "A", "1", None), rect(0.0, 0.0, 1.0, 1.0), 10.0),
        ];
        let (kept, report) = filter_area_anomalies(rows, &AnomalyParams::default());
        assert!(report.flagged.is_empty());
        assert_eq!(kept.len(), 3);
    }

    #[test]
    fn test_share_sums() {
        let rows = vec![
            fragment(0, attrs("R1", "A", "1", None), rect(0.0, 0.0, 2.0, 2.0), 8.0),
            fragment(0, attrs("R2", "A", "1", None), rect(0.0, 0.0, 2.0, 1.0), 8.0),
        ];
        let sums = intersect_share_by_installation(&rows);
        assert!((sums[&InstallationId(0)] - 0.75).abs() < 1e-12);
    }

    #[test]
    fn test_empty_table() {
        let (kept, report) = filter_area_anomalies(Vec::new(), &AnomalyParams::default());
        assert!(kept.is_empty());
        assert!(report.flagged.is_empty());
    }

    #[test]
    fn test_near_full_share_counts_as_full_cover() {
        // Contained panel whose overlay area came back a hair short.
        let raw = 10.0 * (1.0 + 1e-11);
        let rows = vec![
            fragment(6, attrs("R1", "A", "1", None), rect(0.0, 0.0, 5.0, 2.0), raw),
            fragment(6, attrs("R2", "A", "1", None), rect(0.0, 0.0, 3.0, 2.0), raw),
        ];
        assert!(rows[0].percentage_intersect() < 1.0);
        let (kept, report) = filter_area_anomalies(rows, &AnomalyParams::default());
        assert_eq!(report.flagged, vec![InstallationId(6)]);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].rooftop.roof_top_id, "R1");
    }

    #[test]
    fn test_panel_on_overlapping_rooftops_survives() {
        use crate::model::{RawInstallation, RooftopRecord};
        use crate::overlay::overlay_rooftops;
        use geo::Area;

        // Metric coordinates far from the origin, as in real projected data.
        let (x0, y0) = (-243_000.0, 50_000.0);
        for step in 0..20 {
            let dx = x0 + step as f64 * 0.137;
            let dy = y0 + step as f64 * 0.071;
            let geometry = rect(dx + 0.3, dy + 0.3, dx + 5.3, dy + 5.3);
            let installation = RawInstallation {
                identifier: InstallationId(0),
                raw_area_sqm: geometry.unsigned_area(),
                geometry,
            };
            let rooftops = vec![
                RooftopRecord {
                    attributes: attrs("A", "Lindenallee", "10", None),
                    geometry: rect(dx - 1.0, dy - 1.0, dx + 7.0, dy + 7.0),
                },
                RooftopRecord {
                    attributes: attrs("B", "Lindenallee", "10", None),
                    geometry: rect(dx + 2.8, dy - 1.0, dx + 9.0, dy + 7.0),
                },
            ];
            let overlay = overlay_rooftops(&[installation], &rooftops);
            assert_eq!(overlay.on_rooftop.len(), 2);

            let (kept, report) = filter_area_anomalies(overlay.on_rooftop, &AnomalyParams::default());
            assert_eq!(report.flagged, vec![InstallationId(0)]);
            assert_eq!(kept.len(), 1, "offset step {}", step);
            assert_eq!(kept[0].rooftop.roof_top_id, "A");
        }
    }
}
