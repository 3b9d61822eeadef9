use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::geodesic::DistanceBearingResult;

pub const METERS_PER_KILOMETER: f64 = 1000.0;
pub const MILES_PER_METER: f64 = 0.000621371;
pub const MILS_PER_DEGREE: f64 = 6400.0 / 360.0;

/// A unit a raw engine value can be rendered in.
pub trait DisplayUnit: Copy {
    /// Converts the engine's native value (meters or degrees) into this unit.
    fn convert(self, value: f64) -> f64;

    fn label(self) -> &'static str;

    /// Two decimals, rounded half to even. No unit suffix.
    fn format(self, value: f64) -> String {
        format!("{:.2}", round_half_even_2dp(self.convert(value)))
    }
}

fn round_half_even_2dp(value: f64) -> f64 {
    // Adding 0.0 turns a rounded -0.0 into 0.0.
    (value * 100.0).round_ties_even() / 100.0 + 0.0
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind} unit: {input:?}")]
pub struct UnitParseError {
    pub kind: &'static str,
    pub input: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DistanceUnit {
    #[default]
    Kilometers,
    Miles,
}

impl DisplayUnit for DistanceUnit {
    fn convert(self, meters: f64) -> f64 {
        match self {
            DistanceUnit::Kilometers => meters / METERS_PER_KILOMETER,
            DistanceUnit::Miles => meters * MILES_PER_METER,
        }
    }

    fn label(self) -> &'static str {
        match self {
            DistanceUnit::Kilometers => "kilometers",
            DistanceUnit::Miles => "miles",
        }
    }
}

impl FromStr for DistanceUnit {
    type Err = UnitParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "kilometers" | "km" => Ok(DistanceUnit::Kilometers),
            "miles" | "mi" => Ok(DistanceUnit::Miles),
            _ => Err(UnitParseError { kind: "distance", input: s.to_string() }),
        }
    }
}

impl fmt::Display for DistanceUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BearingUnit {
    #[default]
    Degrees,
    Mils,
}

impl DisplayUnit for BearingUnit {
    fn convert(self, degrees: f64) -> f64 {
        match self {
            BearingUnit::Degrees => degrees,
            BearingUnit::Mils => degrees * MILS_PER_DEGREE,
        }
    }

    fn label(self) -> &'static str {
        match self {
            BearingUnit::Degrees => "degrees",
            BearingUnit::Mils => "mils",
        }
    }
}

impl FromStr for BearingUnit {
    type Err = UnitParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "degrees" | "deg" => Ok(BearingUnit::Degrees),
            "mils" | "mil" => Ok(BearingUnit::Mils),
            _ => Err(UnitParseError { kind: "bearing", input: s.to_string() }),
        }
    }
}

impl fmt::Display for BearingUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// The unit pair a presentation layer renders results in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DisplaySettings {
    pub distance_units: DistanceUnit,
    pub bearing_units: BearingUnit,
}

impl DisplaySettings {
    pub fn new(distance_units: DistanceUnit, bearing_units: BearingUnit) -> Self {
        Self {
            distance_units,
            bearing_units,
        }
    }

    /// Returns (distance, bearing) formatted in the configured units.
    pub fn render(&self, result: &DistanceBearingResult) -> (String, String) {
        (
            self.distance_units.format(result.distance_meters),
            self.bearing_units.format(result.bearing_degrees),
        )
    }
}
