//! Great-circle distance and initial bearing on a spherical Earth.

use serde::{Deserialize, Serialize};

use crate::coordinate::Coordinate;

/// IUGG mean Earth radius.
pub const EARTH_MEAN_RADIUS_METERS: f64 = 6_371_008.8;

/// Below this the azimuth components carry no direction.
const DEGENERATE_EPSILON: f64 = 1e-12;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DistanceBearingResult {
    pub distance_meters: f64,
    /// Clockwise from true north, in [0, 360).
    pub bearing_degrees: f64,
}

pub fn compute_distance_bearing(a: Coordinate, b: Coordinate) -> DistanceBearingResult {
    DistanceBearingResult {
        distance_meters: distance_meters(a, b),
        bearing_degrees: initial_bearing(a, b),
    }
}

/// Haversine distance. The haversine term is clamped so rounding can never
/// push it outside [0, 1] for coincident or antipodal points.
pub fn distance_meters(a: Coordinate, b: Coordinate) -> f64 {
    let lat1 = a.latitude().to_radians();
    let lat2 = b.latitude().to_radians();
    let d_lat = lat2 - lat1;
    let d_lon = (b.longitude() - a.longitude()).to_radians();

    let h = (d_lat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (d_lon / 2.0).sin().powi(2);
    let h = h.clamp(0.0, 1.0);
    let central_angle = 2.0 * h.sqrt().atan2((1.0 - h).sqrt());

    EARTH_MEAN_RADIUS_METERS * central_angle
}

/// Forward azimuth from `a` to `b`.
///
/// Coincident and antipodal pairs have no defined azimuth; both yield 0.
pub fn initial_bearing(a: Coordinate, b: Coordinate) -> f64 {
    let lat1 = a.latitude().to_radians();
    let lat2 = b.latitude().to_radians();
    let d_lon = (b.longitude() - a.longitude()).to_radians();

    let y = d_lon.sin() * lat2.cos();
    let x = lat1.cos() * lat2.sin() - lat1.sin() * lat2.cos() * d_lon.cos();

    if y.hypot(x) < DEGENERATE_EPSILON {
        return 0.0;
    }

    normalize_degrees(y.atan2(x).to_degrees())
}

fn normalize_degrees(degrees: f64) -> f64 {
    let normalized = degrees.rem_euclid(360.0);
    // rem_euclid rounds tiny negative inputs up to exactly 360.
    if normalized >= 360.0 {
        0.0
    } else {
        normalized
    }
}
