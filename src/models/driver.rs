// src/models/driver.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Availability {
    Active,   // Online and free to take offers
    Inactive, // Off shift
    Assigned, // Committed to a ride
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
}

impl GeoPoint {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }

    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lon.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lon)
    }

    /// Great-circle distance in meters.
    pub fn distance_m(&self, other: &GeoPoint) -> f64 {
        let earth_radius_m = 6_371_000.0;
        let lat1_rad = self.lat.to_radians();
        let lat2_rad = other.lat.to_radians();
        let delta_lat = (other.lat - self.lat).to_radians();
        let delta_lon = (other.lon - self.lon).to_radians();

        let a = (delta_lat / 2.0).sin().powi(2)
            + lat1_rad.cos() * lat2_rad.cos() * (delta_lon / 2.0).sin().powi(2);
        let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());

        earth_radius_m * c
    }

    /// Parse a `"lat,lon"` pair. Returns None for anything else.
    pub fn parse(text: &str) -> Option<GeoPoint> {
        let (lat, lon) = text.split_once(',')?;
        let point = GeoPoint {
            lat: lat.trim().parse().ok()?,
            lon: lon.trim().parse().ok()?,
        };
        point.is_valid().then_some(point)
    }
}

/// Read-only view of a driver as served by the index. The engine never moves
/// a driver; it only flips availability on assignment and release.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct DriverSnapshot {
    pub id: String,
    pub position: GeoPoint,
    pub vehicle_type: crate::models::dispatch::VehicleType,
    pub availability: Availability,
    pub push_address: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriverLocationUpdate {
    pub driver_id: String,
    pub lat: f64,
    pub lon: f64,
    pub vehicle_type: String,
    pub push_address: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriverAvailabilityUpdate {
    pub driver_id: String,
    pub availability: Availability,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_latlon_pair() {
        let p = GeoPoint::parse("5.6037, -0.1870").unwrap();
        assert!((p.lat - 5.6037).abs() < 1e-9);
        assert!((p.lon + 0.1870).abs() < 1e-9);

        assert!(GeoPoint::parse("Accra Mall").is_none());
        assert!(GeoPoint::parse("91.0,0.0").is_none());
        assert!(GeoPoint::parse("5.0").is_none());
    }

    #[test]
    fn haversine_sanity() {
        // Accra to Tema is roughly 25 km.
        let accra = GeoPoint::new(5.6037, -0.1870);
        let tema = GeoPoint::new(5.6698, 0.0166);
        let d = accra.distance_m(&tema);
        assert!(d > 20_000.0 && d < 30_000.0, "got {}", d);

        assert_eq!(accra.distance_m(&accra), 0.0);
    }
}
