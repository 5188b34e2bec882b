//! Roof tilt correction.
//!
//! Detections are a top-down projection of the module surface; dividing by
//! `cos(tilt)` recovers the inclined area, assuming the modules lie flush
//! with the roof.

use crate::model::{RooftopFragment, TiltedFragment};
use tracing::debug;

/// Tilt limits for [`correct_tilt`].
#[derive(Debug, Clone, Copy)]
pub struct TiltParams {
    /// Substitute for flat, missing or implausible tilts (degrees).
    pub default_tilt_deg: f64,
    /// Tilts at or above this are replaced (degrees).
    pub max_tilt_deg: f64,
}

impl Default for TiltParams {
    fn default() -> Self {
        Self {
            default_tilt_deg: 30.0,
            max_tilt_deg: 50.0,
        }
    }
}

/// Clip a rooftop tilt into `(0, max)`.
///
/// Flat roofs (0°) are assumed to carry racked modules at the default tilt;
/// steeper than `max` is treated as a data error. Missing, negative and
/// non-finite values are replaced as well.
pub fn clip_tilt(tilt: Option<f64>, params: &TiltParams) -> f64 {
    match tilt {
        Some(t) if t.is_finite() && t > 0.0 && t < params.max_tilt_deg => t,
        _ => params.default_tilt_deg,
    }
}

/// `area / cos(tilt)`.
pub fn tilted_area(area_sqm: f64, tilt_deg: f64) -> f64 {
    area_sqm / tilt_deg.to_radians().cos()
}

/// Attach clipped tilt and tilted area to every fragment.
pub fn correct_tilt(fragments: Vec<RooftopFragment>, params: &TiltParams) -> Vec<TiltedFragment> {
    let mut clipped = 0usize;
    let out: Vec<TiltedFragment> = fragments
        .into_iter()
        .map(|fragment| {
            let tilt_deg = clip_tilt(fragment.rooftop.tilt, params);
            if fragment.rooftop.tilt != Some(tilt_deg) {
                clipped += 1;
            }
            let area_tilted_sqm = tilted_area(fragment.area_inter_sqm, tilt_deg);
            TiltedFragment {
                fragment,
                tilt_deg,
                area_tilted_sqm,
            }
        })
        .collect();
    debug!(fragments = out.len(), clipped, "tilt correction applied");
    out
}
