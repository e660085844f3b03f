use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{EvalError, EvalResult};
use crate::granularity::Granularity;

/// Cumulative location state after one assistant turn. Empty = not revealed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocationSnapshot {
    pub country: String,
    pub city: String,
    pub neighborhood: String,
    pub exact_location_name: String,
    pub latitude: String,
    pub longitude: String,
}

impl LocationSnapshot {
    /// Builds a snapshot from an annotation's `location_data` object.
    ///
    /// Missing keys read as empty. Coordinates may be JSON strings or numbers.
    pub fn from_location_data(value: &Value, context: &str) -> EvalResult<Self> {
        let object = value.as_object().ok_or_else(|| {
            EvalError::schema(context, "location_data must be a JSON object")
        })?;

        let text_field = |key: &str| -> EvalResult<String> {
            match object.get(key) {
                None | Some(Value::Null) => Ok(String::new()),
                Some(Value::String(text)) => Ok(text.clone()),
                Some(other) => Err(EvalError::schema(
                    context,
                    format!("field `{key}` must be a string, found {other}"),
                )),
            }
        };
        let coordinate_field = |key: &str| -> EvalResult<String> {
            match object.get(key) {
                None | Some(Value::Null) => Ok(String::new()),
                Some(Value::String(text)) => Ok(text.trim().to_string()),
                Some(Value::Number(number)) => Ok(number.to_string()),
                Some(other) => Err(EvalError::schema(
                    context,
                    format!("field `{key}` must be a string or number, found {other}"),
                )),
            }
        };

        Ok(Self {
            country: text_field("country")?,
            city: text_field("city")?,
            neighborhood: text_field("neighborhood")?,
            exact_location_name: text_field("exact_location_name")?,
            latitude: coordinate_field("latitude")?,
            longitude: coordinate_field("longitude")?,
        })
    }

    pub fn has_coordinates(&self) -> bool {
        !self.latitude.is_empty() && !self.longitude.is_empty()
    }

    fn coordinates(&self, context: &str) -> EvalResult<(f64, f64)> {
        Ok((
            parse_coordinate(&self.latitude, "latitude", context)?,
            parse_coordinate(&self.longitude, "longitude", context)?,
        ))
    }
}

/// One persisted `{dialogue_turn_no, granularity, ground_truth}` line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroundTruthRecord {
    pub dialogue_turn_no: usize,
    pub granularity: Granularity,
    pub ground_truth: bool,
}

fn parse_coordinate(raw: &str, key: &str, context: &str) -> EvalResult<f64> {
    raw.parse::<f64>()
        .map_err(|_| EvalError::schema(context, format!("{key} is not numeric: {raw:?}")))
}

/// Whether the single level `level` changed between two snapshots.
fn level_changed(
    current: &LocationSnapshot,
    previous: &LocationSnapshot,
    level: Granularity,
    context: &str,
) -> EvalResult<bool> {
    let changed = match level {
        Granularity::Country => current.country != previous.country,
        Granularity::City => current.city != previous.city,
        Granularity::Neighborhood => current.neighborhood != previous.neighborhood,
        Granularity::ExactLocationName => {
            current.exact_location_name != previous.exact_location_name
        }
        Granularity::ExactGpsCoordinates => {
            if !current.has_coordinates() {
                false
            } else if !previous.has_coordinates() {
                true
            } else {
                let (lat, lon) = current.coordinates(context)?;
                let (prev_lat, prev_lon) = previous.coordinates(context)?;
                lat != prev_lat || lon != prev_lon
            }
        }
    };
    Ok(changed)
}

/// Whether `current` discloses new information at `granularity` relative to
/// `previous`. A change at any finer level counts, since it implies the
/// coarser one.
pub fn reveals_at(
    current: &LocationSnapshot,
    previous: &LocationSnapshot,
    granularity: Granularity,
    context: &str,
) -> EvalResult<bool> {
    for level in granularity.at_or_finer() {
        if level_changed(current, previous, *level, context)? {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Per-turn reveal flags for one granularity. Turn 1 is compared with an
/// all-empty snapshot.
pub fn derive_turn_reveals(
    snapshots: &[LocationSnapshot],
    granularity: Granularity,
) -> EvalResult<Vec<bool>> {
    let empty = LocationSnapshot::default();
    let mut previous = &empty;
    let mut reveals = Vec::with_capacity(snapshots.len());

    for (idx, current) in snapshots.iter().enumerate() {
        let context = format!("turn {}", idx + 1);
        reveals.push(reveals_at(current, previous, granularity, &context)?);
        previous = current;
    }

    Ok(reveals)
}

/// Every turn crossed with every granularity, turn-major.
pub fn derive_dialogue_records(snapshots: &[LocationSnapshot]) -> EvalResult<Vec<GroundTruthRecord>> {
    let reveals = Granularity::ALL
        .iter()
        .map(|granularity| derive_turn_reveals(snapshots, *granularity))
        .collect::<EvalResult<Vec<_>>>()?;

    let mut records = Vec::with_capacity(snapshots.len() * Granularity::ALL.len());
    for turn in 1..=snapshots.len() {
        for (granularity, flags) in Granularity::ALL.into_iter().zip(&reveals) {
            records.push(GroundTruthRecord {
                dialogue_turn_no: turn,
                granularity,
                ground_truth: flags[turn - 1],
            });
        }
    }

    Ok(records)
}
