//! Wire shape of a history entry.
//!
//! ```text
//! { "timestamp": "2017-01-23T18:04:05.123Z",
//!   "origLat": 42.96, "origLng": -85.67, "destLat": 41.88, "destLng": -87.63 }
//! ```
//!
//! Only the coordinates and the timestamp are stored. Distance and bearing are
//! always recomputed, so changing the unit policy never touches stored data.

use chrono::{DateTime, SecondsFormat, Utc};
use geo_calculator_lib::{CalculationRecord, Coordinate, InvalidCoordinate};
use serde_json::{Map, Value};

pub type FieldMap = Map<String, Value>;

pub const TIMESTAMP: &str = "timestamp";
pub const ORIG_LAT: &str = "origLat";
pub const ORIG_LNG: &str = "origLng";
pub const DEST_LAT: &str = "destLat";
pub const DEST_LNG: &str = "destLng";

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("entry is not an object")]
    NotAnObject,
    #[error("missing field `{0}`")]
    MissingField(&'static str),
    #[error("field `{field}` is not a {expected}")]
    WrongType {
        field: &'static str,
        expected: &'static str,
    },
    #[error("field `timestamp` is not an ISO-8601 instant: {value:?}")]
    MalformedTimestamp {
        value: String,
        #[source]
        source: chrono::ParseError,
    },
    #[error(transparent)]
    InvalidCoordinate(#[from] InvalidCoordinate),
}

pub fn encode_record(record: &CalculationRecord) -> FieldMap {
    let mut fields = FieldMap::new();
    fields.insert(TIMESTAMP.into(), Value::from(encode_timestamp(record.timestamp())));
    fields.insert(ORIG_LAT.into(), Value::from(record.origin().latitude()));
    fields.insert(ORIG_LNG.into(), Value::from(record.origin().longitude()));
    fields.insert(DEST_LAT.into(), Value::from(record.destination().latitude()));
    fields.insert(DEST_LNG.into(), Value::from(record.destination().longitude()));
    fields
}

pub fn encode_timestamp(timestamp: DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Decodes one child of the history namespace, checking every field.
pub fn decode_record(value: &Value) -> Result<CalculationRecord, DecodeError> {
    let fields = value.as_object().ok_or(DecodeError::NotAnObject)?;

    let timestamp = decode_timestamp(fields)?;
    let origin = Coordinate::new(number(fields, ORIG_LAT)?, number(fields, ORIG_LNG)?)?;
    let destination = Coordinate::new(number(fields, DEST_LAT)?, number(fields, DEST_LNG)?)?;

    Ok(CalculationRecord::new(origin, destination, timestamp))
}

fn field<'a>(fields: &'a FieldMap, name: &'static str) -> Result<&'a Value, DecodeError> {
    match fields.get(name) {
        Some(Value::Null) | None => Err(DecodeError::MissingField(name)),
        Some(value) => Ok(value),
    }
}

fn number(fields: &FieldMap, name: &'static str) -> Result<f64, DecodeError> {
    field(fields, name)?.as_f64().ok_or(DecodeError::WrongType {
        field: name,
        expected: "number",
    })
}

fn decode_timestamp(fields: &FieldMap) -> Result<DateTime<Utc>, DecodeError> {
    let raw = field(fields, TIMESTAMP)?.as_str().ok_or(DecodeError::WrongType {
        field: TIMESTAMP,
        expected: "string",
    })?;

    DateTime::parse_from_rfc3339(raw)
        .map(|timestamp| timestamp.with_timezone(&Utc))
        .map_err(|source| DecodeError::MalformedTimestamp {
            value: raw.to_string(),
            source,
        })
}
