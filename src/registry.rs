//! Rooftop- and address-level rollups with derived capacity.
//!
//! Both rollups read the same tilt-corrected table, in canonical order, and
//! are independent of each other. Areas are summed; descriptive fields take
//! the first value observed in a group.

use crate::geocode::{Coordinate, GeocodeError, Geocoder};
use crate::model::TiltedFragment;
use geo::{unary_union, MultiPolygon, Polygon};
use std::collections::{BTreeMap, HashMap};
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// One rooftop segment carrying PV.
#[derive(Debug, Clone, PartialEq)]
pub struct RooftopRegistryRow {
    pub roof_top_id: String,
    pub area_inter_sqm: f64,
    pub area_tilted_sqm: f64,
    pub capacity_not_tilted_kwp: f64,
    pub capacity_tilted_kwp: f64,
    pub street: String,
    pub street_address: String,
    pub city: String,
    pub postal_code: String,
    pub fragment_count: usize,
    /// Dissolved outline of all contributing fragments (metric CRS).
    pub geometry: MultiPolygon<f64>,
}

/// Outcome of geocoding one address row.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum GeocodeStatus {
    /// No geocoder was configured.
    #[default]
    NotRequested,
    Resolved(Coordinate),
    Failed(GeocodeError),
}

impl GeocodeStatus {
    pub fn coordinate(&self) -> Option<Coordinate> {
        match self {
            GeocodeStatus::Resolved(c) => Some(*c),
            _ => None,
        }
    }

    /// Short status label for output files.
    pub fn label(&self) -> String {
        match self {
            GeocodeStatus::NotRequested => "NOT_REQUESTED".to_string(),
            GeocodeStatus::Resolved(_) => "OK".to_string(),
            GeocodeStatus::Failed(e) => e.to_string(),
        }
    }
}

/// One street address carrying PV.
#[derive(Debug, Clone, PartialEq)]
pub struct AddressRegistryRow {
    pub street_address: String,
    pub area_inter_sqm: f64,
    pub area_tilted_sqm: f64,
    pub capacity_not_tilted_kwp: f64,
    pub capacity_tilted_kwp: f64,
    pub street: String,
    pub city: String,
    pub postal_code: String,
    pub fragment_count: usize,
    pub geocode: GeocodeStatus,
}

impl AddressRegistryRow {
    /// Free-text query sent to the geocoder.
    pub fn geocode_query(&self) -> String {
        format!("{} {}", self.street_address, self.city)
    }
}

/// Nameplate capacity (kWp) for a module area.
pub fn capacity_kwp(area_sqm: f64, sqm_per_kwp: f64) -> f64 {
    area_sqm / sqm_per_kwp
}

// ---------------------------------------------------------------------------
// Rollups
// ---------------------------------------------------------------------------

struct Group<'a> {
    first: &'a TiltedFragment,
    area_inter_sqm: f64,
    area_tilted_sqm: f64,
    members: Vec<&'a TiltedFragment>,
}

fn group_by<'a, F>(fragments: &'a [TiltedFragment], key: F) -> BTreeMap<String, Group<'a>>
where
    F: Fn(&TiltedFragment) -> String,
{
    let mut groups: BTreeMap<String, Group<'a>> = BTreeMap::new();
    for f in fragments {
        let g = groups.entry(key(f)).or_insert_with(|| Group {
            first: f,
            area_inter_sqm: 0.0,
            area_tilted_sqm: 0.0,
            members: Vec::new(),
        });
        g.area_inter_sqm += f.fragment.area_inter_sqm;
        g.area_tilted_sqm += f.area_tilted_sqm;
        g.members.push(f);
    }
    groups
}

/// Roll fragments up by RoofTopID. Rows are sorted by RoofTopID.
pub fn rooftop_registry(fragments: &[TiltedFragment], sqm_per_kwp: f64) -> Vec<RooftopRegistryRow> {
    let rows: Vec<RooftopRegistryRow> = group_by(fragments, |f| f.fragment.rooftop.roof_top_id.clone())
        .into_iter()
        .map(|(roof_top_id, g)| {
            let roof = &g.first.fragment.rooftop;
            let parts: Vec<&Polygon<f64>> = g
                .members
                .iter()
                .flat_map(|m| m.fragment.geometry.0.iter())
                .collect();
            RooftopRegistryRow {
                roof_top_id,
                area_inter_sqm: g.area_inter_sqm,
                area_tilted_sqm: g.area_tilted_sqm,
                capacity_not_tilted_kwp: capacity_kwp(g.area_inter_sqm, sqm_per_kwp),
                capacity_tilted_kwp: capacity_kwp(g.area_tilted_sqm, sqm_per_kwp),
                street: roof.street.clone(),
                street_address: roof.street_address(),
                city: roof.city.clone(),
                postal_code: roof.postal_code.clone(),
                fragment_count: g.members.len(),
                geometry: unary_union(parts),
            }
        })
        .collect();
    info!("rooftop registry: {} rows", rows.len());
    rows
}

/// Roll fragments up by `Street StreetNumber`. Rows are sorted by address.
pub fn address_registry(fragments: &[TiltedFragment], sqm_per_kwp: f64) -> Vec<AddressRegistryRow> {
    let rows: Vec<AddressRegistryRow> = group_by(fragments, |f| f.fragment.rooftop.street_address())
        .into_iter()
        .map(|(street_address, g)| {
            let roof = &g.first.fragment.rooftop;
            AddressRegistryRow {
                street_address,
                area_inter_sqm: g.area_inter_sqm,
                area_tilted_sqm: g.area_tilted_sqm,
                capacity_not_tilted_kwp: capacity_kwp(g.area_inter_sqm, sqm_per_kwp),
                capacity_tilted_kwp: capacity_kwp(g.area_tilted_sqm, sqm_per_kwp),
                street: roof.street.clone(),
                city: roof.city.clone(),
                postal_code: roof.postal_code.clone(),
                fragment_count: g.members.len(),
                geocode: GeocodeStatus::NotRequested,
            }
        })
        .collect();
    info!("address registry: {} rows", rows.len());
    rows
}

/// Geocode every address row, querying each distinct address once.
///
/// Failures are recorded on the row and logged; they never abort the batch.
pub fn geocode_addresses<G>(rows: Vec<AddressRegistryRow>, geocoder: &G) -> Vec<AddressRegistryRow>
where
    G: Geocoder + ?Sized,
{
    let total = rows.len();
    let mut cache: HashMap<String, GeocodeStatus> = HashMap::new();
    let mut failed = 0usize;

    let rows: Vec<AddressRegistryRow> = rows
        .into_iter()
        .enumerate()
        .map(|(i, mut row)| {
            let query = row.geocode_query();
            let status = cache
                .entry(query)
                .or_insert_with_key(|query| {
                    info!("geocoding address {}/{}: {}", i + 1, total, query);
                    match geocoder.resolve(query) {
                        Ok(c) => GeocodeStatus::Resolved(c),
                        Err(e) => {
                            warn!(address = %query, status = %e, "geocoding failed");
                            GeocodeStatus::Failed(e)
                        }
                    }
                })
                .clone();
            if matches!(status, GeocodeStatus::Failed(_)) {
                failed += 1;
            }
            row.geocode = status;
            row
        })
        .collect();

    info!(
        "geocoded {} addresses ({} queries, {} failed)",
        total,
        cache.len(),
        failed
    );
    rows
}
