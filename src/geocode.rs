//! Address geocoding behind a capability trait.
//!
//! The registry only depends on [`Geocoder`]; [`NominatimGeocoder`] is the
//! HTTP implementation used by the binary and [`Throttled`] caps its request
//! rate. Calls are sequential and every failure is local to one address.

use governor::clock::{Clock, DefaultClock};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use serde::Deserialize;
use std::num::NonZeroU32;
use std::time::Duration;
use thiserror::Error;

/// WGS84 position of a geocoded address.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Coordinate {
    pub lat: f64,
    pub lon: f64,
}

/// Why an address could not be resolved.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GeocodeError {
    /// The service answered but found nothing.
    #[error("no result for address")]
    NotFound,

    /// The service answered with a non-success status.
    #[error("service returned status {0}")]
    Status(u16),

    /// Network or protocol failure.
    #[error("request failed: {0}")]
    Transport(String),

    /// The service answered with something that is not a coordinate.
    #[error("unexpected response: {0}")]
    InvalidResponse(String),
}

/// Resolve a free-text address to a coordinate.
pub trait Geocoder {
    fn resolve(&self, address: &str) -> Result<Coordinate, GeocodeError>;
}

impl<G: Geocoder + ?Sized> Geocoder for &G {
    fn resolve(&self, address: &str) -> Result<Coordinate, GeocodeError> {
        (**self).resolve(address)
    }
}

// ---------------------------------------------------------------------------
// Rate limiting
// ---------------------------------------------------------------------------

/// Wraps a geocoder and blocks so that at most `per_second` requests are
/// issued per second.
pub struct Throttled<G> {
    inner: G,
    limiter: DefaultDirectRateLimiter,
    clock: DefaultClock,
}

impl<G: Geocoder> Throttled<G> {
    pub fn new(inner: G, per_second: u32) -> Self {
        let rate = NonZeroU32::new(per_second).unwrap_or(NonZeroU32::MIN);
        // Burst of one: requests are spread evenly instead of front-loaded.
        let quota = Quota::per_second(rate).allow_burst(NonZeroU32::MIN);
        Self {
            inner,
            limiter: RateLimiter::direct(quota),
            clock: DefaultClock::default(),
        }
    }

    fn wait_for_slot(&self) {
        while let Err(not_until) = self.limiter.check() {
            std::thread::sleep(not_until.wait_time_from(self.clock.now()));
        }
    }
}

impl<G: Geocoder> Geocoder for Throttled<G> {
    fn resolve(&self, address: &str) -> Result<Coordinate, GeocodeError> {
        self.wait_for_slot();
        self.inner.resolve(address)
    }
}

// ---------------------------------------------------------------------------
// Nominatim
// ---------------------------------------------------------------------------

/// Geocoder for the Nominatim search API (OpenStreetMap or self-hosted).
pub struct NominatimGeocoder {
    client: reqwest::blocking::Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct NominatimPlace {
    lat: String,
    lon: String,
}

impl NominatimGeocoder {
    pub const PUBLIC_URL: &'static str = "https://nominatim.openstreetmap.org";

    pub fn new(base_url: &str) -> Result<Self, GeocodeError> {
        let client = reqwest::blocking::Client::builder()
            .user_agent(concat!("pvregistry/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(20))
            .build()
            .map_err(|e| GeocodeError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

impl Geocoder for NominatimGeocoder {
    fn resolve(&self, address: &str) -> Result<Coordinate, GeocodeError> {
        let response = self
            .client
            .get(format!("{}/search", self.base_url))
            .query(&[("q", address), ("format", "json"), ("limit", "1")])
            .send()
            .map_err(|e| GeocodeError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(GeocodeError::Status(status.as_u16()));
        }
        let places: Vec<NominatimPlace> = response
            .json()
            .map_err(|e| GeocodeError::InvalidResponse(e.to_string()))?;
        let place = places.into_iter().next().ok_or(GeocodeError::NotFound)?;
        parse_place(&place)
    }
}

fn parse_place(place: &NominatimPlace) -> Result<Coordinate, GeocodeError> {
    let lat: f64 = place
        .lat
        .parse()
        .map_err(|_| GeocodeError::InvalidResponse(format!("lat '{}'", place.lat)))?;
    let lon: f64 = place
        .lon
        .parse()
        .map_err(|_| GeocodeError::InvalidResponse(format!("lon '{}'", place.lon)))?;
    Ok(Coordinate { lat, lon })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::time::Instant;

    struct Counting {
        calls: Cell<usize>,
    }

    impl Geocoder for Counting {
        fn resolve(&self, _address: &str) -> Result<Coordinate, GeocodeError> {
            self.calls.set(self.calls.get() + 1);
            Ok(Coordinate { lat: 51.45, lon: 7.01 })
        }
    }

    #[test]
    fn test_throttle_spaces_requests() {
        let geo = Throttled::new(Counting { calls: Cell::new(0) }, 20);
        let start = Instant::now();
        for _ in 0..4 {
            geo.resolve("Hauptstr. 1 Essen").unwrap();
        }
        // First call is immediate, the next three wait ~50 ms each.
        assert!(start.elapsed() >= Duration::from_millis(120));
        assert_eq!(geo.inner.calls.get(), 4);
    }

    #[test]
    fn test_parse_place() {
        let place: Vec<NominatimPlace> =
            serde_json::from_str(r#"[{"lat":"51.4556","lon":"7.0116","display_name":"Essen"}]"#).unwrap();
        let c = parse_place(&place[0]).unwrap();
        assert_eq!(c, Coordinate { lat: 51.4556, lon: 7.0116 });
    }

    #[test]
    fn test_parse_place_rejects_garbage() {
        let place = NominatimPlace {
            lat: "north".into(),
            lon: "7.0".into(),
        };
        assert!(matches!(parse_place(&place), Err(GeocodeError::InvalidResponse(_))));
    }
}
