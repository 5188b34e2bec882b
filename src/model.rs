//! Records passed between pipeline stages.
//!
//! Each stage consumes one collection and returns a new one; nothing here is
//! mutated after construction. Geometries are in the metric CRS except for
//! [`RawDetection`] and [`RooftopRecord`] as loaded from disk, which are WGS84.

use geo::{MultiPolygon, Point};
use std::cmp::Ordering;
use std::fmt;

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Identifier of a raw installation, assigned once by the aggregator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InstallationId(pub u64);

impl fmt::Display for InstallationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "polygon_{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Inputs
// ---------------------------------------------------------------------------

/// One positively segmented image cell, as produced by the detector.
#[derive(Debug, Clone)]
pub struct RawDetection {
    pub tile_id: String,
    /// WKT of the image cell's upper-left corner, kept verbatim.
    pub image_cell_origin: String,
    /// Detected PV outline in WGS84.
    pub polygon: MultiPolygon<f64>,
}

/// Descriptive attributes of a cadastral rooftop segment.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RooftopAttributes {
    pub roof_top_id: String,
    pub building_id: String,
    pub rooftop_type: String,
    pub street: String,
    pub street_number: String,
    pub postal_code: String,
    pub city: String,
    /// Rooftop area as delivered with the dataset (m²).
    pub area: Option<f64>,
    pub azimuth: Option<f64>,
    /// Roof inclination in degrees; `None` when absent from the dataset.
    pub tilt: Option<f64>,
}

impl RooftopAttributes {
    /// `Street StreetNumber`, the key of the address registry.
    pub fn street_address(&self) -> String {
        format!("{} {}", self.street, self.street_number)
    }
}

/// A rooftop segment with its outline.
#[derive(Debug, Clone)]
pub struct RooftopRecord {
    pub attributes: RooftopAttributes,
    pub geometry: MultiPolygon<f64>,
}

// ---------------------------------------------------------------------------
// Stage outputs
// ---------------------------------------------------------------------------

/// A connected cluster of detected PV area.
#[derive(Debug, Clone)]
pub struct RawInstallation {
    pub identifier: InstallationId,
    pub geometry: MultiPolygon<f64>,
    /// Area at creation (m²). Every later ratio refers to this value.
    pub raw_area_sqm: f64,
}

/// Part of an installation lying outside every rooftop.
#[derive(Debug, Clone)]
pub struct OverhangFragment {
    pub identifier: InstallationId,
    pub geometry: MultiPolygon<f64>,
    pub area_diff_sqm: f64,
}

/// How an attributed fragment came to carry rooftop attributes.
#[derive(Debug, Clone, PartialEq)]
pub enum FragmentOrigin {
    /// Direct intersection of an installation with a rooftop.
    Intersection,
    /// Overhang re-attributed to the nearest on-rooftop fragment.
    Rescued {
        /// Installation owning the matched on-rooftop fragment.
        matched_identifier: InstallationId,
        /// Geodesic distance between the two centroids (m).
        distance_m: f64,
    },
}

impl FragmentOrigin {
    fn rank(&self) -> u8 {
        match self {
            FragmentOrigin::Intersection => 0,
            FragmentOrigin::Rescued { .. } => 1,
        }
    }

    pub fn is_rescued(&self) -> bool {
        matches!(self, FragmentOrigin::Rescued { .. })
    }
}

/// A fragment attributed to a rooftop: an on-rooftop intersection or a
/// rescued overhang.
#[derive(Debug, Clone)]
pub struct RooftopFragment {
    pub identifier: InstallationId,
    pub rooftop: RooftopAttributes,
    pub geometry: MultiPolygon<f64>,
    /// Centroid of `geometry`, cached for the nearest-neighbor index.
    pub centroid: Point<f64>,
    pub area_inter_sqm: f64,
    /// Raw area of the installation this fragment belongs to.
    pub raw_area_sqm: f64,
    pub origin: FragmentOrigin,
}

impl RooftopFragment {
    /// Share of the installation's raw area covered by this fragment.
    pub fn percentage_intersect(&self) -> f64 {
        self.area_inter_sqm / self.raw_area_sqm
    }

    /// `Some(true)` when a rescued overhang borrowed its rooftop from its own
    /// installation, `None` for intersections.
    pub fn rescued_from_same_installation(&self) -> Option<bool> {
        match self.origin {
            FragmentOrigin::Intersection => None,
            FragmentOrigin::Rescued {
                matched_identifier, ..
            } => Some(matched_identifier == self.identifier),
        }
    }
}

/// An attributed fragment after tilt correction.
#[derive(Debug, Clone)]
pub struct TiltedFragment {
    pub fragment: RooftopFragment,
    /// Tilt after clipping (degrees).
    pub tilt_deg: f64,
    pub area_tilted_sqm: f64,
}

// ---------------------------------------------------------------------------
// Canonical ordering
// ---------------------------------------------------------------------------

/// Put fragments in the order used by every "first observed" rule:
/// identifier ascending, intersections before rescued overhangs, then
/// RoofTopID ascending. The sort is stable, so remaining ties keep their
/// input order.
pub fn sort_canonical(mut fragments: Vec<RooftopFragment>) -> Vec<RooftopFragment> {
    fragments.sort_by(canonical_cmp);
    fragments
}

fn canonical_cmp(a: &RooftopFragment, b: &RooftopFragment) -> Ordering {
    a.identifier
        .cmp(&b.identifier)
        .then_with(|| a.origin.rank().cmp(&b.origin.rank()))
        .then_with(|| a.rooftop.roof_top_id.cmp(&b.rooftop.roof_top_id))
}

#[cfg(test)]
pub(crate) mod fixtures {
    //! Shared builders for unit tests. Coordinates are metric unless noted.

    use super::*;
    use geo::{Area, Centroid, LineString, Polygon};

    pub fn rect(x0: f64, y0: f64, x1: f64, y1: f64) -> MultiPolygon<f64> {
        let ring = LineString::from(vec![(x0, y0), (x1, y0), (x1, y1), (x0, y1), (x0, y0)]);
        MultiPolygon::new(vec![Polygon::new(ring, vec![])])
    }

    pub fn attrs(roof_top_id: &str, street: &str, number: &str, tilt: Option<f64>) -> RooftopAttributes {
        RooftopAttributes {
            roof_top_id: roof_top_id.to_string(),
            building_id: format!("B-{}", roof_top_id),
            rooftop_type: "Satteldach".to_string(),
            street: street.to_string(),
            street_number: number.to_string(),
            postal_code: "45127".to_string(),
            city: "Essen".to_string(),
            area: Some(120.0),
            azimuth: Some(180.0),
            tilt,
        }
    }

    pub fn fragment(
        id: u64,
        rooftop: RooftopAttributes,
        geometry: MultiPolygon<f64>,
        raw_area_sqm: f64,
    ) -> RooftopFragment {
        let area = geometry.unsigned_area();
        RooftopFragment {
            identifier: InstallationId(id),
            rooftop,
            centroid: geometry.centroid().unwrap_or_else(|| Point::new(0.0, 0.0)),
            geometry,
            area_inter_sqm: area,
            raw_area_sqm,
            origin: FragmentOrigin::Intersection,
        }
    }
}
