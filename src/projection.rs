//! Metric projection of WGS84 geometry, analogous to a single fixed CRS
//! transform.
//!
//! All area, buffer and nearest-neighbor math runs on projected coordinates
//! (easting, northing in meters). Geometries travel through the pipeline in
//! that metric space and are mapped back to longitude/latitude on output.

use geo::{Coord, MapCoords};
use serde::Deserialize;
use std::f64::consts::{FRAC_PI_2, FRAC_PI_4};

/// A reversible mapping between WGS84 (`x` = longitude, `y` = latitude, degrees)
/// and a planar metric CRS (`x` = easting, `y` = northing, meters).
pub trait MetricProjection {
    /// Longitude/latitude → easting/northing.
    fn forward(&self, lonlat: Coord<f64>) -> Coord<f64>;
    /// Easting/northing → longitude/latitude.
    fn inverse(&self, en: Coord<f64>) -> Coord<f64>;
}

/// Project a WGS84 geometry into the metric CRS.
pub fn to_metric<G, P>(geometry: &G, projection: &P) -> G::Output
where
    G: MapCoords<f64, f64>,
    P: MetricProjection + ?Sized,
{
    geometry.map_coords(|c| projection.forward(c))
}

/// Map a metric geometry back to WGS84.
pub fn to_wgs84<G, P>(geometry: &G, projection: &P) -> G::Output
where
    G: MapCoords<f64, f64>,
    P: MetricProjection + ?Sized,
{
    geometry.map_coords(|c| projection.inverse(c))
}

// ---------------------------------------------------------------------------
// Lambert Conformal Conic (2SP) on an ellipsoid
// ---------------------------------------------------------------------------

/// Definition of a Lambert Conformal Conic projection.
///
/// Defaults reproduce ETRS89 / LCC Germany (E-N), EPSG:5243, on GRS80.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct LccParams {
    /// Latitude of false origin (degrees).
    pub lat0_deg: f64,
    /// Longitude of false origin (degrees).
    pub lon0_deg: f64,
    /// First standard parallel (degrees).
    pub lat1_deg: f64,
    /// Second standard parallel (degrees).
    pub lat2_deg: f64,
    pub false_easting_m: f64,
    pub false_northing_m: f64,
    /// Ellipsoid semi-major axis (meters).
    pub semi_major_m: f64,
    pub inverse_flattening: f64,
}

impl Default for LccParams {
    fn default() -> Self {
        Self {
            lat0_deg: 51.0,
            lon0_deg: 10.5,
            lat1_deg: 48.0 + 40.0 / 60.0,
            lat2_deg: 53.0 + 40.0 / 60.0,
            false_easting_m: 0.0,
            false_northing_m: 0.0,
            semi_major_m: 6_378_137.0,
            inverse_flattening: 298.257_222_101,
        }
    }
}

/// Prepared Lambert Conformal Conic projection with its cone constants.
#[derive(Debug, Clone)]
pub struct LambertConformalConic {
    e: f64,
    n: f64,
    /// `a * F`.
    af: f64,
    /// Radius at the latitude of origin.
    rho0: f64,
    lon0: f64,
    false_easting: f64,
    false_northing: f64,
}

impl LambertConformalConic {
    pub fn new(params: &LccParams) -> Self {
        let a = params.semi_major_m;
        let f = 1.0 / params.inverse_flattening;
        let e = (2.0 * f - f * f).sqrt();

        let phi0 = params.lat0_deg.to_radians();
        let phi1 = params.lat1_deg.to_radians();
        let phi2 = params.lat2_deg.to_radians();

        let m1 = m(phi1, e);
        let m2 = m(phi2, e);
        let t0 = t(phi0, e);
        let t1 = t(phi1, e);
        let t2 = t(phi2, e);

        // Tangent cone when both parallels coincide.
        let n = if (phi1 - phi2).abs() < 1e-12 {
            phi1.sin()
        } else {
            (m1.ln() - m2.ln()) / (t1.ln() - t2.ln())
        };
        let big_f = m1 / (n * t1.powf(n));
        let af = a * big_f;

        Self {
            e,
            n,
            af,
            rho0: af * t0.powf(n),
            lon0: params.lon0_deg.to_radians(),
            false_easting: params.false_easting_m,
            false_northing: params.false_northing_m,
        }
    }
}

impl Default for LambertConformalConic {
    fn default() -> Self {
        Self::new(&LccParams::default())
    }
}

impl MetricProjection for LambertConformalConic {
    fn forward(&self, lonlat: Coord<f64>) -> Coord<f64> {
        let phi = lonlat.y.to_radians();
        let lambda = lonlat.x.to_radians();
        let rho = self.af * t(phi, self.e).powf(self.n);
        let theta = self.n * (lambda - self.lon0);
        Coord {
            x: self.false_easting + rho * theta.sin(),
            y: self.false_northing + self.rho0 - rho * theta.cos(),
        }
    }

    fn inverse(&self, en: Coord<f64>) -> Coord<f64> {
        let dx = en.x - self.false_easting;
        let dy = self.rho0 - (en.y - self.false_northing);
        let sign = self.n.signum();
        let rho = sign * (dx * dx + dy * dy).sqrt();
        let theta = (sign * dx).atan2(sign * dy);
        let t_val = (rho / self.af).powf(1.0 / self.n);

        // Fixed-point iteration for the conformal latitude; converges in a
        // handful of steps for e ~ 0.08.
        let mut phi = FRAC_PI_2 - 2.0 * t_val.atan();
        for _ in 0..15 {
            let es = self.e * phi.sin();
            let next = FRAC_PI_2 - 2.0 * (t_val * ((1.0 - es) / (1.0 + es)).powf(self.e / 2.0)).atan();
            let done = (next - phi).abs() < 1e-14;
            phi = next;
            if done {
                break;
            }
        }

        Coord {
            x: (theta / self.n + self.lon0).to_degrees(),
            y: phi.to_degrees(),
        }
    }
}

fn m(phi: f64, e: f64) -> f64 {
    let es = e * phi.sin();
    phi.cos() / (1.0 - es * es).sqrt()
}

fn t(phi: f64, e: f64) -> f64 {
    let es = e * phi.sin();
    (FRAC_PI_4 - phi / 2.0).tan() / ((1.0 - es) / (1.0 + es)).powf(e / 2.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::{Area, Polygon};

    #[test]
    fn test_origin_maps_to_false_origin() {
        let proj = LambertConformalConic::default();
        let c = proj.forward(Coord { x: 10.5, y: 51.0 });
        assert!(c.x.abs() < 1e-6);
        assert!(c.y.abs() < 1e-6);
    }

    #[test]
    fn test_round_trip_essen() {
        let proj = LambertConformalConic::default();
        let lonlat = Coord { x: 7.0116, y: 51.4556 };
        let back = proj.inverse(proj.forward(lonlat));
        assert!((back.x - lonlat.x).abs() < 1e-10);
        assert!((back.y - lonlat.y).abs() < 1e-10);
    }

    #[test]
    fn test_west_of_meridian_is_negative_easting() {
        let proj = LambertConformalConic::default();
        let c = proj.forward(Coord { x: 7.0, y: 51.0 });
        // ~3.5° of longitude at 51°N is roughly 245 km.
        assert!(c.x < -240_000.0 && c.x > -250_000.0, "{}", c.x);
    }

    #[test]
    fn test_metric_square_keeps_area_after_round_trip() {
        let proj = LambertConformalConic::default();
        let (x0, y0) = (-243_000.0, 50_000.0);
        let square: Polygon<f64> = Polygon::new(
            vec![
                (x0, y0),
                (x0 + 10.0, y0),
                (x0 + 10.0, y0 + 10.0),
                (x0, y0 + 10.0),
                (x0, y0),
            ]
            .into(),
            vec![],
        );
        let back = to_metric(&to_wgs84(&square, &proj), &proj);
        assert!((back.unsigned_area() - 100.0).abs() < 1e-4);
    }
}
