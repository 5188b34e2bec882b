//! Reading detections and rooftops, writing registries.
//!
//! Inputs:
//!   detections — headerless `tileId;imageCellOriginWKT;polygonWKT` rows, WGS84
//!   rooftops   — GeoJSON FeatureCollection with the cadastral rooftop fields
//!
//! Outputs are GeoJSON FeatureCollections in WGS84, plus optional CSV exports.
//! Bad records are logged and skipped; only file-level failures are errors.

use crate::error::{RecordError, RegistryError, Result};
use crate::model::{RawDetection, RooftopAttributes, RooftopRecord, TiltedFragment};
use crate::projection::{to_wgs84, MetricProjection};
use crate::registry::{AddressRegistryRow, RooftopRegistryRow};
use geo::{Area, CoordsIter, Geometry, LineString, MultiPolygon, Polygon};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use tracing::{info, warn};
use wkt::{ToWkt, TryFromWkt};

// ---------------------------------------------------------------------------
// Detections
// ---------------------------------------------------------------------------

/// Load raw detections from a `;`-delimited file.
pub fn read_detections(path: &Path) -> Result<Vec<RawDetection>> {
    let file = File::open(path).map_err(|source| RegistryError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let detections = parse_detections(BufReader::new(file)).map_err(|source| RegistryError::Csv {
        path: path.to_path_buf(),
        source,
    })?;
    info!("{} detections loaded from '{}'", detections.len(), path.display());
    Ok(detections)
}

/// Parse detection rows. Rows with a missing column or a malformed polygon
/// are skipped; only an I/O failure of `reader` is an error.
pub fn parse_detections<R: Read>(reader: R) -> std::result::Result<Vec<RawDetection>, csv::Error> {
    let mut rdr = csv::ReaderBuilder::new()
        .delimiter(b';')
        .has_headers(false)
        .flexible(true)
        .from_reader(reader);

    let mut detections = Vec::new();
    let mut skipped = 0usize;
    for (i, record) in rdr.records().enumerate() {
        let record = match record {
            Ok(r) => r,
            Err(e) if e.is_io_error() => return Err(e),
            Err(e) => {
                warn!(line = i + 1, error = %e, "unreadable detection row skipped");
                skipped += 1;
                continue;
            }
        };
        match detection_from_record(&record) {
            Ok(det) => detections.push(det),
            Err(e) => {
                warn!(line = i + 1, error = %e, "detection skipped");
                skipped += 1;
            }
        }
    }
    if skipped > 0 {
        warn!("{} detection rows skipped", skipped);
    }
    Ok(detections)
}

fn detection_from_record(record: &csv::StringRecord) -> std::result::Result<RawDetection, RecordError> {
    let tile_id = record.get(0).ok_or(RecordError::MissingField("tileId"))?;
    let origin = record.get(1).ok_or(RecordError::MissingField("imageCellOrigin"))?;
    let polygon = record.get(2).ok_or(RecordError::MissingField("polygon"))?;
    Ok(RawDetection {
        tile_id: tile_id.trim().to_string(),
        image_cell_origin: origin.trim().to_string(),
        polygon: parse_polygon_wkt(polygon)?,
    })
}

/// Parse a WGS84 `POLYGON` or `MULTIPOLYGON` and reject degenerate shapes.
pub fn parse_polygon_wkt(text: &str) -> std::result::Result<MultiPolygon<f64>, RecordError> {
    let geometry = Geometry::<f64>::try_from_wkt_str(text.trim())
        .map_err(|e| RecordError::MalformedGeometry(e.to_string()))?;
    let polygons = match geometry {
        Geometry::Polygon(p) => MultiPolygon::new(vec![p]),
        Geometry::MultiPolygon(mp) => mp,
        _ => {
            return Err(RecordError::MalformedGeometry(
                "expected POLYGON or MULTIPOLYGON".to_string(),
            ))
        }
    };
    validate_wgs84(polygons)
}

fn validate_wgs84(polygons: MultiPolygon<f64>) -> std::result::Result<MultiPolygon<f64>, RecordError> {
    if polygons.0.is_empty() {
        return Err(RecordError::MalformedGeometry("empty polygon".to_string()));
    }
    if polygons.0.iter().any(|p| p.exterior().0.len() < 4) {
        return Err(RecordError::MalformedGeometry("ring with fewer than 4 points".to_string()));
    }
    let in_range = polygons.coords_iter().all(|c| {
        c.x.is_finite() && c.y.is_finite() && c.x.abs() <= 180.0 && c.y.abs() <= 90.0
    });
    if !in_range {
        return Err(RecordError::MalformedGeometry(
            "coordinate outside WGS84 range".to_string(),
        ));
    }
    if polygons.unsigned_area() <= 0.0 {
        return Err(RecordError::MalformedGeometry("zero area".to_string()));
    }
    Ok(polygons)
}

// ---------------------------------------------------------------------------
// Rooftops (GeoJSON)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct FeatureCollection {
    features: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct Feature {
    #[serde(default)]
    properties: Map<String, Value>,
    geometry: Option<GeoJsonGeometry>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum GeoJsonGeometry {
    Polygon { coordinates: Vec<Vec<Vec<f64>>> },
    MultiPolygon { coordinates: Vec<Vec<Vec<Vec<f64>>>> },
}

/// Load rooftops from a GeoJSON FeatureCollection.
pub fn read_rooftops(path: &Path) -> Result<Vec<RooftopRecord>> {
    let file = File::open(path).map_err(|source| RegistryError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let rooftops = parse_rooftops(BufReader::new(file)).map_err(|source| RegistryError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    info!("{} rooftops loaded from '{}'", rooftops.len(), path.display());
    Ok(rooftops)
}

/// Parse a rooftop FeatureCollection. Features with an unsupported or
/// degenerate geometry, or without a RoofTopID, are skipped.
pub fn parse_rooftops<R: Read>(reader: R) -> serde_json::Result<Vec<RooftopRecord>> {
    let collection: FeatureCollection = serde_json::from_reader(reader)?;
    let mut rooftops = Vec::with_capacity(collection.features.len());
    let mut skipped = 0usize;
    for (i, value) in collection.features.into_iter().enumerate() {
        match rooftop_from_feature(value) {
            Ok(r) => rooftops.push(r),
            Err(e) => {
                warn!(feature = i, error = %e, "rooftop skipped");
                skipped += 1;
            }
        }
    }
    if skipped > 0 {
        warn!("{} rooftop features skipped", skipped);
    }
    Ok(rooftops)
}

fn rooftop_from_feature(value: Value) -> std::result::Result<RooftopRecord, RecordError> {
    let feature: Feature =
        serde_json::from_value(value).map_err(|e| RecordError::MalformedGeometry(e.to_string()))?;
    let geometry = match feature.geometry {
        Some(GeoJsonGeometry::Polygon { coordinates }) => MultiPolygon::new(vec![polygon_from(&coordinates)?]),
        Some(GeoJsonGeometry::MultiPolygon { coordinates }) => MultiPolygon::new(
            coordinates
                .iter()
                .map(|p| polygon_from(p))
                .collect::<std::result::Result<Vec<_>, _>>()?,
        ),
        None => return Err(RecordError::MissingField("geometry")),
    };
    let geometry = validate_wgs84(geometry)?;

    let props = &feature.properties;
    let roof_top_id = text(props, "RoofTopID");
    if roof_top_id.is_empty() {
        return Err(RecordError::MissingField("RoofTopID"));
    }
    let attributes = RooftopAttributes {
        roof_top_id,
        building_id: text(props, "Building_I"),
        rooftop_type: text(props, "RooftopTyp"),
        street: text(props, "Street"),
        street_number: text(props, "StreetNumb"),
        postal_code: text(props, "PostalCode"),
        city: text(props, "City"),
        area: number(props, "Area"),
        azimuth: number(props, "Azimuth"),
        tilt: number(props, "Tilt"),
    };
    Ok(RooftopRecord { attributes, geometry })
}

fn polygon_from(rings: &[Vec<Vec<f64>>]) -> std::result::Result<Polygon<f64>, RecordError> {
    let mut rings = rings.iter().map(|ring| {
        ring.iter()
            .map(|pos| match pos.as_slice() {
                [x, y, ..] => Ok((*x, *y)),
                _ => Err(RecordError::MalformedGeometry("position with fewer than 2 values".to_string())),
            })
            .collect::<std::result::Result<Vec<(f64, f64)>, _>>()
            .map(LineString::from)
    });
    let exterior = rings
        .next()
        .ok_or_else(|| RecordError::MalformedGeometry("polygon without rings".to_string()))??;
    let interiors = rings.collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(Polygon::new(exterior, interiors))
}

/// String property; numbers are rendered, missing/null gives "".
fn text(props: &Map<String, Value>, key: &str) -> String {
    match props.get(key) {
        Some(Value::String(s)) => s.trim().to_string(),
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::Bool(b)) => b.to_string(),
        _ => String::new(),
    }
}

/// Numeric property; numeric strings are accepted.
fn number(props: &Map<String, Value>, key: &str) -> Option<f64> {
    match props.get(key) {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().replace(',', ".").parse().ok(),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// GeoJSON output
// ---------------------------------------------------------------------------

fn multipolygon_json(mp: &MultiPolygon<f64>) -> Value {
    let polygons: Vec<Vec<Vec<[f64; 2]>>> = mp
        .0
        .iter()
        .map(|p| {
            std::iter::once(p.exterior())
                .chain(p.interiors())
                .map(|ring| ring.coords().map(|c| [c.x, c.y]).collect())
                .collect()
        })
        .collect();
    json!({ "type": "MultiPolygon", "coordinates": polygons })
}

fn feature_collection(features: Vec<Value>) -> Value {
    json!({ "type": "FeatureCollection", "features": features })
}

fn write_json(path: &Path, value: &Value) -> Result<()> {
    let write_err = |source: std::io::Error| RegistryError::Write {
        path: path.to_path_buf(),
        source,
    };
    let file = File::create(path).map_err(write_err)?;
    let mut out = BufWriter::new(file);
    serde_json::to_writer(&mut out, value).map_err(|e| write_err(e.into()))?;
    out.flush().map_err(write_err)
}

/// Rooftop registry as GeoJSON; geometry is the dissolved fragment outline.
pub fn rooftop_registry_geojson<P>(rows: &[RooftopRegistryRow], projection: &P) -> Value
where
    P: MetricProjection + ?Sized,
{
    let features = rows
        .iter()
        .map(|r| {
            json!({
                "type": "Feature",
                "geometry": multipolygon_json(&to_wgs84(&r.geometry, projection)),
                "properties": {
                    "RoofTopID": r.roof_top_id,
                    "areaInter": r.area_inter_sqm,
                    "areaTilted": r.area_tilted_sqm,
                    "capacity_not_tilted": r.capacity_not_tilted_kwp,
                    "capacity_tilted": r.capacity_tilted_kwp,
                    "Street": r.street,
                    "Street_Address": r.street_address,
                    "City": r.city,
                    "PostalCode": r.postal_code,
                    "fragments": r.fragment_count,
                }
            })
        })
        .collect();
    feature_collection(features)
}

/// Address registry as GeoJSON; geometry is the geocoded point or null.
pub fn address_registry_geojson(rows: &[AddressRegistryRow]) -> Value {
    let features = rows
        .iter()
        .map(|r| {
            let geometry = match r.geocode.coordinate() {
                Some(c) => json!({ "type": "Point", "coordinates": [c.lon, c.lat] }),
                None => Value::Null,
            };
            json!({
                "type": "Feature",
                "geometry": geometry,
                "properties": {
                    "Street_Address": r.street_address,
                    "areaInter": r.area_inter_sqm,
                    "areaTilted": r.area_tilted_sqm,
                    "capacity_not_tilted": r.capacity_not_tilted_kwp,
                    "capacity_tilted": r.capacity_tilted_kwp,
                    "Street": r.street,
                    "City": r.city,
                    "PostalCode": r.postal_code,
                    "fragments": r.fragment_count,
                    "geocode_status": r.geocode.label(),
                }
            })
        })
        .collect();
    feature_collection(features)
}

/// Corrected fragment table as GeoJSON, one feature per fragment.
pub fn fragments_geojson<P>(fragments: &[TiltedFragment], projection: &P) -> Value
where
    P: MetricProjection + ?Sized,
{
    let features = fragments
        .iter()
        .map(|t| {
            let f = &t.fragment;
            let (origin, matched, distance) = match &f.origin {
                crate::model::FragmentOrigin::Intersection => ("intersection", Value::Null, Value::Null),
                crate::model::FragmentOrigin::Rescued {
                    matched_identifier,
                    distance_m,
                } => ("overhang", json!(matched_identifier.to_string()), json!(distance_m)),
            };
            json!({
                "type": "Feature",
                "geometry": multipolygon_json(&to_wgs84(&f.geometry, projection)),
                "properties": {
                    "identifier": f.identifier.to_string(),
                    "RoofTopID": f.rooftop.roof_top_id,
                    "Building_I": f.rooftop.building_id,
                    "RooftopTyp": f.rooftop.rooftop_type,
                    "Street": f.rooftop.street,
                    "StreetNumb": f.rooftop.street_number,
                    "PostalCode": f.rooftop.postal_code,
                    "City": f.rooftop.city,
                    "Area": f.rooftop.area,
                    "Azimuth": f.rooftop.azimuth,
                    "Tilt": t.tilt_deg,
                    "raw_area": f.raw_area_sqm,
                    "area_inter": f.area_inter_sqm,
                    "area_tilted": t.area_tilted_sqm,
                    "percentage_intersect": f.percentage_intersect(),
                    "origin": origin,
                    "matched_identifier": matched,
                    "calc_dist": distance,
                    "same_installation": f.rescued_from_same_installation(),
                }
            })
        })
        .collect();
    feature_collection(features)
}

pub fn write_rooftop_registry<P>(path: &Path, rows: &[RooftopRegistryRow], projection: &P) -> Result<()>
where
    P: MetricProjection + ?Sized,
{
    write_json(path, &rooftop_registry_geojson(rows, projection))?;
    info!("{} rooftop rows written to '{}'", rows.len(), path.display());
    Ok(())
}

pub fn write_address_registry(path: &Path, rows: &[AddressRegistryRow]) -> Result<()> {
    write_json(path, &address_registry_geojson(rows))?;
    info!("{} address rows written to '{}'", rows.len(), path.display());
    Ok(())
}

pub fn write_fragments<P>(path: &Path, fragments: &[TiltedFragment], projection: &P) -> Result<()>
where
    P: MetricProjection + ?Sized,
{
    write_json(path, &fragments_geojson(fragments, projection))?;
    info!("{} fragments written to '{}'", fragments.len(), path.display());
    Ok(())
}

// ---------------------------------------------------------------------------
// CSV export
// ---------------------------------------------------------------------------

fn csv_writer(path: &Path) -> Result<csv::Writer<BufWriter<File>>> {
    let file = File::create(path).map_err(|source| RegistryError::Write {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(csv::Writer::from_writer(BufWriter::new(file)))
}

/// Address registry as CSV: one row per address with lat/lon when geocoded.
pub fn export_address_csv(path: &Path, rows: &[AddressRegistryRow]) -> Result<()> {
    let csv_err = |source: csv::Error| RegistryError::Csv {
        path: path.to_path_buf(),
        source,
    };
    let mut wtr = csv_writer(path)?;
    wtr.write_record([
        "Street_Address",
        "Street",
        "City",
        "PostalCode",
        "areaInter",
        "areaTilted",
        "capacity_not_tilted",
        "capacity_tilted",
        "lat",
        "lon",
        "geocode_status",
    ])
    .map_err(csv_err)?;

    for r in rows {
        let (lat, lon) = match r.geocode.coordinate() {
            Some(c) => (format!("{:.7}", c.lat), format!("{:.7}", c.lon)),
            None => (String::new(), String::new()),
        };
        wtr.write_record([
            r.street_address.as_str(),
            r.street.as_str(),
            r.city.as_str(),
            r.postal_code.as_str(),
            format!("{:.3}", r.area_inter_sqm).as_str(),
            format!("{:.3}", r.area_tilted_sqm).as_str(),
            format!("{:.3}", r.capacity_not_tilted_kwp).as_str(),
            format!("{:.3}", r.capacity_tilted_kwp).as_str(),
            lat.as_str(),
            lon.as_str(),
            r.geocode.label().as_str(),
        ])
        .map_err(csv_err)?;
    }
    wtr.flush().map_err(|source| RegistryError::Write {
        path: path.to_path_buf(),
        source,
    })?;
    info!("{} address rows exported to '{}'", rows.len(), path.display());
    Ok(())
}

/// Rooftop registry as CSV with the dissolved outline as WGS84 WKT.
pub fn export_rooftop_csv<P>(path: &Path, rows: &[RooftopRegistryRow], projection: &P) -> Result<()>
where
    P: MetricProjection + ?Sized,
{
    let csv_err = |source: csv::Error| RegistryError::Csv {
        path: path.to_path_buf(),
        source,
    };
    let mut wtr = csv_writer(path)?;
    wtr.write_record([
        "RoofTopID",
        "Street_Address",
        "City",
        "PostalCode",
        "areaInter",
        "areaTilted",
        "capacity_not_tilted",
        "capacity_tilted",
        "geometry_wkt",
    ])
    .map_err(csv_err)?;

    for r in rows {
        let outline = to_wgs84(&r.geometry, projection).wkt_string();
        wtr.write_record([
            r.roof_top_id.as_str(),
            r.street_address.as_str(),
            r.city.as_str(),
            r.postal_code.as_str(),
            format!("{:.3}", r.area_inter_sqm).as_str(),
            format!("{:.3}", r.area_tilted_sqm).as_str(),
            format!("{:.3}", r.capacity_not_tilted_kwp).as_str(),
            format!("{:.3}", r.capacity_tilted_kwp).as_str(),
            outline.as_str(),
        ])
        .map_err(csv_err)?;
    }
    wtr.flush().map_err(|source| RegistryError::Write {
        path: path.to_path_buf(),
        source,
    })?;
    info!("{} rooftop rows exported to '{}'", rows.len(), path.display());
    Ok(())
}
