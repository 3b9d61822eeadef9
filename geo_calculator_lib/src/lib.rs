pub mod coordinate;
pub mod calculation_record;
pub mod geodesic;
pub mod units;

pub use coordinate::{Axis, Coordinate, InvalidCoordinate};
pub use calculation_record::CalculationRecord;
pub use geodesic::{compute_distance_bearing, DistanceBearingResult, EARTH_MEAN_RADIUS_METERS};
pub use units::{BearingUnit, DisplaySettings, DisplayUnit, DistanceUnit, UnitParseError};
