use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::TransitError;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub latitude: f64,
    pub longitude: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stop {
    pub id: String,
    pub coordinate: Coordinate,
    pub name: String,
    pub onestop_id: Option<String>,
}

/// Visible map viewport, as reported by the map view after a pan or zoom settles.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Region {
    pub latitude: f64,
    pub longitude: f64,
    pub latitude_delta: f64,
    pub longitude_delta: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub min_lon: f64,
    pub min_lat: f64,
    pub max_lon: f64,
    pub max_lat: f64,
}

impl Region {
    pub fn bounding_box(&self) -> Result<BoundingBox, TransitError> {
        let fields = [
            self.latitude,
            self.longitude,
            self.latitude_delta,
            self.longitude_delta,
        ];
        if fields.iter().any(|v| !v.is_finite()) {
            return Err(TransitError::InvalidRegion(
                "region values must be finite".to_string(),
            ));
        }
        if self.latitude_delta == 0.0 || self.longitude_delta == 0.0 {
            return Err(TransitError::InvalidRegion(
                "region deltas must be non-zero".to_string(),
            ));
        }

        let half_lat = self.latitude_delta.abs() / 2.0;
        let half_lon = self.longitude_delta.abs() / 2.0;

        Ok(BoundingBox {
            min_lon: self.longitude - half_lon,
            min_lat: self.latitude - half_lat,
            max_lon: self.longitude + half_lon,
            max_lat: self.latitude + half_lat,
        })
    }
}

// Wire order expected by the bbox query parameter.
impl fmt::Display for BoundingBox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{},{},{},{}",
            self.min_lon, self.min_lat, self.max_lon, self.max_lat
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScheduleRelationship {
    /// Timetable only, no vehicle is being tracked.
    Static,
    Scheduled,
    Added,
    Canceled,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Arrival {
    pub id: String,
    pub scheduled_arrival: Option<String>,
    pub scheduled_departure: Option<String>,
    pub estimated_arrival: Option<String>,
    pub estimated_departure: Option<String>,
    pub minutes_until_departure: i64,
    pub schedule_relationship: ScheduleRelationship,
    pub trip_headsign: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IncomingTrip {
    pub trip_id: Option<String>,
    pub route_id: Option<String>,
    pub stop_id: String,
    pub delay_seconds: i64,
    pub expected_arrival: DateTime<Utc>,
}

/// Snapshot handed to the rendering layer: the data, whether a call is in
/// flight, and the last user-facing error.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ViewState<T> {
    pub data: T,
    pub loading: bool,
    pub error: Option<String>,
}

impl<T: Default> Default for ViewState<T> {
    fn default() -> Self {
        Self {
            data: T::default(),
            loading: false,
            error: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounding_box_is_centered_on_region() {
        let region = Region {
            latitude: 53.35,
            longitude: -6.26,
            latitude_delta: 0.02,
            longitude_delta: 0.04,
        };
        let bbox = region.bounding_box().unwrap();
        assert!((bbox.min_lat - 53.34).abs() < 1e-9);
        assert!((bbox.max_lat - 53.36).abs() < 1e-9);
        assert!((bbox.min_lon + 6.28).abs() < 1e-9);
        assert!((bbox.max_lon + 6.24).abs() < 1e-9);
    }

    #[test]
    fn bounding_box_renders_lon_lat_order() {
        let bbox = BoundingBox {
            min_lon: -6.5,
            min_lat: 53.0,
            max_lon: -6.0,
            max_lat: 53.5,
        };
        assert_eq!(bbox.to_string(), "-6.5,53,-6,53.5");
    }

    #[test]
    fn zero_or_nan_deltas_are_rejected() {
        let flat = Region {
            latitude: 53.35,
            longitude: -6.26,
            latitude_delta: 0.0,
            longitude_delta: 0.04,
        };
        assert!(matches!(
            flat.bounding_box(),
            Err(TransitError::InvalidRegion(_))
        ));

        let nan = Region {
            longitude_delta: f64::NAN,
            ..flat
        };
        assert!(nan.bounding_box().is_err());
    }

    #[test]
    fn unknown_relationship_tags_deserialize() {
        let rel: ScheduleRelationship = serde_json::from_str("\"STATIC\"").unwrap();
        assert_eq!(rel, ScheduleRelationship::Static);
        let rel: ScheduleRelationship = serde_json::from_str("\"DUPLICATED\"").unwrap();
        assert_eq!(rel, ScheduleRelationship::Unknown);
    }
}
