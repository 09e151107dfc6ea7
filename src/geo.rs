//! Coordinates and the spherical math used to move them

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::LocsimError;

/// Mean earth radius in meters
pub const EARTH_RADIUS: f64 = 6_371_000.0;

/// A validated WGS84 position in degrees
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawCoordinate")]
pub struct Coordinate {
    latitude: f64,
    longitude: f64,
}

/// Unchecked wire form; deserializing goes through [`Coordinate::new`]
#[derive(Deserialize)]
struct RawCoordinate {
    latitude: f64,
    longitude: f64,
}

impl TryFrom<RawCoordinate> for Coordinate {
    type Error = LocsimError;

    fn try_from(raw: RawCoordinate) -> Result<Self, Self::Error> {
        Self::new(raw.latitude, raw.longitude)
    }
}

impl Coordinate {
    /// # Errors
    /// `InvalidCoordinate` unless both values are finite, latitude is within ±90
    /// and longitude within ±180
    pub fn new(latitude: f64, longitude: f64) -> Result<Self, LocsimError> {
        if !latitude.is_finite()
            || !longitude.is_finite()
            || !(-90.0..=90.0).contains(&latitude)
            || !(-180.0..=180.0).contains(&longitude)
        {
            return Err(LocsimError::InvalidCoordinate(latitude, longitude));
        }
        Ok(Self {
            latitude,
            longitude,
        })
    }

    pub fn latitude(&self) -> f64 {
        self.latitude
    }

    pub fn longitude(&self) -> f64 {
        self.longitude
    }

    /// Great-circle distance in meters (haversine)
    pub fn distance_to(&self, other: &Coordinate) -> f64 {
        let (lat1, lat2) = (self.latitude.to_radians(), other.latitude.to_radians());
        let d_lat = lat2 - lat1;
        let d_lng = (other.longitude - self.longitude).to_radians();

        let a = (d_lat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (d_lng / 2.0).sin().powi(2);
        2.0 * EARTH_RADIUS * a.sqrt().atan2((1.0 - a).sqrt())
    }

    /// Initial bearing towards `other`, degrees clockwise from north in `[0, 360)`
    pub fn heading_to(&self, other: &Coordinate) -> f64 {
        let (lat1, lat2) = (self.latitude.to_radians(), other.latitude.to_radians());
        let d_lng = (other.longitude - self.longitude).to_radians();

        let y = d_lng.sin() * lat2.cos();
        let x = lat1.cos() * lat2.sin() - lat1.sin() * lat2.cos() * d_lng.cos();
        y.atan2(x).to_degrees().rem_euclid(360.0)
    }

    /// The point `distance` meters away along `heading` degrees
    pub fn offset(&self, distance: f64, heading: f64) -> Coordinate {
        let angular = distance / EARTH_RADIUS;
        let bearing = heading.to_radians();
        let lat1 = self.latitude.to_radians();
        let lng1 = self.longitude.to_radians();

        let lat2 =
            (lat1.sin() * angular.cos() + lat1.cos() * angular.sin() * bearing.cos()).asin();
        let lng2 = lng1
            + (bearing.sin() * angular.sin() * lat1.cos())
                .atan2(angular.cos() - lat1.sin() * lat2.sin());

        Coordinate {
            latitude: lat2.to_degrees(),
            // Normalise into [-180, 180]
            longitude: (lng2.to_degrees() + 540.0).rem_euclid(360.0) - 180.0,
        }
    }
}

impl fmt::Display for Coordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.latitude, self.longitude)
    }
}

/// How fast a simulated user moves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum MoveType {
    #[default]
    Walk,
    Cycle,
    Drive,
}

impl MoveType {
    /// Speed in meters per second
    pub fn speed(self) -> f64 {
        match self {
            // 5 km/h
            Self::Walk => 1.39,
            // 15 km/h
            Self::Cycle => 4.167,
            // 40 km/h
            Self::Drive => 11.112,
        }
    }
}
