use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{coordinate::Coordinate, geodesic::{compute_distance_bearing, DistanceBearingResult}};

/// One distance/bearing lookup as it is kept in the history.
///
/// The computed result is not part of the record; it is derived again from the
/// coordinates whenever it is needed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalculationRecord {
    origin: Coordinate,
    destination: Coordinate,
    timestamp: DateTime<Utc>,
}

impl CalculationRecord {
    pub fn new(origin: Coordinate, destination: Coordinate, timestamp: DateTime<Utc>) -> Self {
        Self {
            origin,
            destination,
            timestamp,
        }
    }

    pub fn origin(&self) -> Coordinate {
        self.origin
    }

    pub fn destination(&self) -> Coordinate {
        self.destination
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn compute(&self) -> DistanceBearingResult {
        compute_distance_bearing(self.origin, self.destination)
    }
}

#[test]
fn recomputes_from_coordinates() {
    let origin = Coordinate::new(90.0, 0.0).unwrap();
    let destination = Coordinate::new(-90.0, 0.0).unwrap();
    let record = CalculationRecord::new(origin, destination, Utc::now());

    assert_eq!(record.compute(), compute_distance_bearing(origin, destination));
}
