use std::fmt;

use geo_types::Point;
use serde::{Deserialize, Serialize};

pub const MAX_LATITUDE: f64 = 90.0;
pub const MAX_LONGITUDE: f64 = 180.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Axis {
    Latitude,
    Longitude,
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Axis::Latitude => write!(f, "latitude"),
            Axis::Longitude => write!(f, "longitude"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, thiserror::Error)]
#[error("invalid coordinate: {axis} {value} is outside [-{limit}, {limit}]")]
pub struct InvalidCoordinate {
    pub axis: Axis,
    pub value: f64,
    pub limit: f64,
}

/// A point on the globe in decimal degrees.
///
/// Only constructible through [`Coordinate::new`], so latitude is always in
/// [-90, 90] and longitude in [-180, 180].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawCoordinate")]
pub struct Coordinate {
    latitude: f64,
    longitude: f64,
}

#[derive(Deserialize)]
struct RawCoordinate {
    latitude: f64,
    longitude: f64,
}

impl Coordinate {
    pub fn new(latitude: f64, longitude: f64) -> Result<Self, InvalidCoordinate> {
        check_axis(Axis::Latitude, latitude, MAX_LATITUDE)?;
        check_axis(Axis::Longitude, longitude, MAX_LONGITUDE)?;

        Ok(Self { latitude, longitude })
    }

    pub fn latitude(&self) -> f64 {
        self.latitude
    }

    pub fn longitude(&self) -> f64 {
        self.longitude
    }
}

// NaN fails the range check as well.
fn check_axis(axis: Axis, value: f64, limit: f64) -> Result<(), InvalidCoordinate> {
    if (-limit..=limit).contains(&value) {
        Ok(())
    } else {
        Err(InvalidCoordinate { axis, value, limit })
    }
}

impl TryFrom<RawCoordinate> for Coordinate {
    type Error = InvalidCoordinate;

    fn try_from(raw: RawCoordinate) -> Result<Self, Self::Error> {
        Coordinate::new(raw.latitude, raw.longitude)
    }
}

impl TryFrom<Point> for Coordinate {
    type Error = InvalidCoordinate;

    fn try_from(point: Point) -> Result<Self, Self::Error> {
        Coordinate::new(point.y(), point.x())
    }
}

impl From<Coordinate> for Point {
    fn from(coordinate: Coordinate) -> Self {
        Point::new(coordinate.longitude, coordinate.latitude)
    }
}

impl fmt::Display for Coordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.latitude, self.longitude)
    }
}

#[test]
fn accepts_the_closed_range() {
    assert!(Coordinate::new(90.0, 180.0).is_ok());
    assert!(Coordinate::new(-90.0, -180.0).is_ok());
    assert!(Coordinate::new(0.0, 0.0).is_ok());
}

#[test]
fn rejects_out_of_range_values() {
    let err = Coordinate::new(90.5, 0.0).unwrap_err();
    assert_eq!(err.axis, Axis::Latitude);
    assert_eq!(err.value, 90.5);

    let err = Coordinate::new(0.0, -180.01).unwrap_err();
    assert_eq!(err.axis, Axis::Longitude);

    assert!(Coordinate::new(f64::NAN, 0.0).is_err());
    assert!(Coordinate::new(0.0, f64::INFINITY).is_err());
}

#[test]
fn point_conversion_swaps_axes() {
    let coordinate = Coordinate::new(56.15, 10.2).unwrap();
    let point: Point = coordinate.into();
    assert_eq!(point.x(), 10.2);
    assert_eq!(point.y(), 56.15);
    assert_eq!(Coordinate::try_from(point).unwrap(), coordinate);

    assert!(Coordinate::try_from(Point::new(0.0, 91.0)).is_err());
}
