//! Geographic primitives.

use serde::{Deserialize, Serialize};

/// Mean Earth radius in meters, as used by the haversine formula.
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// A WGS-84 coordinate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

impl GeoPoint {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }

    /// Whether the coordinate lies on the globe.
    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lng.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lng)
    }

    /// The integer-degree grid cell containing this point.
    ///
    /// Latitude floors to −90..=90 (181 rows), longitude to −180..=180
    /// (361 columns).
    pub fn cell(&self) -> (i16, i16) {
        (self.lat.floor() as i16, self.lng.floor() as i16)
    }

    /// Great-circle distance to `other`, rounded to whole meters.
    pub fn haversine_m(&self, other: &GeoPoint) -> f64 {
        let lat1 = self.lat.to_radians();
        let lat2 = other.lat.to_radians();
        let dlat = (other.lat - self.lat).to_radians();
        let dlng = (other.lng - self.lng).to_radians();

        let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlng / 2.0).sin().powi(2);
        let c = 2.0 * a.sqrt().asin();
        (EARTH_RADIUS_M * c).round()
    }

    /// Great-circle distance in kilometers.
    pub fn haversine_km(&self, other: &GeoPoint) -> f64 {
        self.haversine_m(other) / 1000.0
    }

    /// Point a fraction `t` of the way toward `other`, linearly
    /// interpolated in degree space. Route legs are short enough (bounded
    /// by the checkpoint step limit) that the flat approximation holds.
    pub fn lerp(&self, other: &GeoPoint, t: f64) -> GeoPoint {
        GeoPoint {
            lat: self.lat + (other.lat - self.lat) * t,
            lng: self.lng + (other.lng - self.lng) * t,
        }
    }
}

/// Persistable counters of one grid cell. The saturation window is
/// transient and deliberately absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellSnapshot {
    pub lat: i16,
    pub lng: i16,
    pub active_contracts: u32,
    pub successes: u64,
    pub failures: u64,
    pub last_activity: Option<f64>,
    pub success_rate: f64,
    pub avg_duration_secs: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validity_bounds() {
        assert!(GeoPoint::new(-23.55, -46.63).is_valid());
        assert!(GeoPoint::new(90.0, 180.0).is_valid());
        assert!(!GeoPoint::new(90.1, 0.0).is_valid());
        assert!(!GeoPoint::new(0.0, -180.5).is_valid());
        assert!(!GeoPoint::new(f64::NAN, 0.0).is_valid());
    }

    #[test]
    fn cell_floors_coordinates() {
        assert_eq!(GeoPoint::new(-23.55, -46.63).cell(), (-24, -47));
        assert_eq!(GeoPoint::new(0.0, 0.0).cell(), (0, 0));
        assert_eq!(GeoPoint::new(90.0, 180.0).cell(), (90, 180));
    }

    #[test]
    fn haversine_sao_paulo_block() {
        // Pickup and delivery from the delivery happy-path scenario; the
        // points are ~1.5 km apart.
        let pickup = GeoPoint::new(-23.55, -46.63);
        let delivery = GeoPoint::new(-23.56, -46.64);
        let distance = pickup.haversine_m(&delivery);
        assert!((1_400.0..1_600.0).contains(&distance), "got {distance}");
    }

    #[test]
    fn haversine_is_symmetric_and_zero_on_self() {
        let a = GeoPoint::new(48.85, 2.35);
        let b = GeoPoint::new(51.50, -0.12);
        assert_eq!(a.haversine_m(&b), b.haversine_m(&a));
        assert_eq!(a.haversine_m(&a), 0.0);
    }

    #[test]
    fn lerp_endpoints() {
        let a = GeoPoint::new(0.0, 0.0);
        let b = GeoPoint::new(1.0, 2.0);
        assert_eq!(a.lerp(&b, 0.0), a);
        assert_eq!(a.lerp(&b, 1.0), b);
        let mid = a.lerp(&b, 0.5);
        assert_eq!(mid, GeoPoint::new(0.5, 1.0));
    }
}
