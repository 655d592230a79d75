//! Geofence gate: great-circle distance from a reference point.

use serde::{Deserialize, Serialize};

/// Mean Earth radius in meters.
const EARTH_RADIUS_M: f64 = 6_371_000.0;

const DEFAULT_LATITUDE: f64 = 13.786888889;
const DEFAULT_LONGITUDE: f64 = 100.499083333;
const DEFAULT_MAX_DISTANCE_M: f64 = 200.0;

/// Process-wide geofence: a reference coordinate and an allowed radius.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeofencePolicy {
    pub latitude: f64,
    pub longitude: f64,
    pub max_distance_m: f64,
}

impl Default for GeofencePolicy {
    fn default() -> Self {
        Self {
            latitude: DEFAULT_LATITUDE,
            longitude: DEFAULT_LONGITUDE,
            max_distance_m: DEFAULT_MAX_DISTANCE_M,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GeofenceVerdict {
    pub allowed: bool,
    /// Distance to the reference point, rounded to one decimal.
    pub distance_m: f64,
    pub max_distance_m: f64,
    pub message: String,
    /// Thai rendering of `message` shown to staff.
    pub message_th: String,
}

impl GeofencePolicy {
    /// Accept iff the unrounded distance is within the radius (inclusive).
    pub fn check(&self, latitude: f64, longitude: f64) -> GeofenceVerdict {
        let distance = haversine_m(latitude, longitude, self.latitude, self.longitude);
        let allowed = distance <= self.max_distance_m;
        let rounded = (distance * 10.0).round() / 10.0;

        let (message, message_th) = if allowed {
            (
                format!("within the allowed area ({rounded:.0} m)"),
                format!("อยู่ในระยะที่อนุญาต ({rounded:.0} ม.)"),
            )
        } else {
            let limit = self.max_distance_m;
            (
                format!("you are {rounded:.0} m from the workplace (limit {limit:.0} m)"),
                format!("คุณอยู่ห่างจากที่ทำงาน {rounded:.0} เมตร (เกิน {limit:.0} ม.)"),
            )
        };

        tracing::debug!(latitude, longitude, distance, allowed, "geofence checked");

        GeofenceVerdict {
            allowed,
            distance_m: rounded,
            max_distance_m: self.max_distance_m,
            message,
            message_th,
        }
    }
}

/// Haversine great-circle distance between two WGS84 points, in meters.
pub fn haversine_m(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let phi1 = lat1.to_radians();
    let phi2 = lat2.to_radians();
    let d_phi = (lat2 - lat1).to_radians();
    let d_lambda = (lon2 - lon1).to_radians();

    let a = (d_phi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (d_lambda / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());

    EARTH_RADIUS_M * c
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_distance() {
        assert_eq!(haversine_m(13.7, 100.5, 13.7, 100.5), 0.0);
    }

    #[test]
    fn test_one_degree_of_latitude() {
        let d = haversine_m(0.0, 0.0, 1.0, 0.0);
        let expected = EARTH_RADIUS_M * std::f64::consts::PI / 180.0;
        assert!((d - expected).abs() < 1e-6, "{d} vs {expected}");
    }

    #[test]
    fn test_symmetric() {
        let a = haversine_m(13.786888889, 100.499083333, 13.75, 100.51);
        let b = haversine_m(13.75, 100.51, 13.786888889, 100.499083333);
        assert!((a - b).abs() < 1e-9);
    }

    #[test]
    fn test_boundary_is_inclusive() {
        let (lat, lon) = (13.7880, 100.4995);
        let distance = haversine_m(lat, lon, DEFAULT_LATITUDE, DEFAULT_LONGITUDE);

        let exact = GeofencePolicy { max_distance_m: distance, ..GeofencePolicy::default() };
        assert!(exact.check(lat, lon).allowed);

        // User 0.1 m beyond the radius.
        let short = GeofencePolicy { max_distance_m: distance - 0.1, ..GeofencePolicy::default() };
        let verdict = short.check(lat, lon);
        assert!(!verdict.allowed);
        assert_eq!(verdict.max_distance_m, distance - 0.1);
    }

    #[test]
    fn test_far_point_denied_with_rounded_distance() {
        let policy = GeofencePolicy::default();
        let verdict = policy.check(13.80, 100.499083333);
        assert!(!verdict.allowed);
        assert_eq!(verdict.distance_m, (verdict.distance_m * 10.0).round() / 10.0);
        assert!(verdict.distance_m > 1400.0 && verdict.distance_m < 1500.0);
        assert!(verdict.message.contains("limit 200 m"));
        assert!(verdict.message_th.starts_with("คุณอยู่ห่างจากที่ทำงาน"));
        assert!(verdict.message_th.ends_with("(เกิน 200 ม.)"));
    }

    #[test]
    fn test_office_point_allowed() {
        let verdict = GeofencePolicy::default().check(DEFAULT_LATITUDE, DEFAULT_LONGITUDE);
        assert!(verdict.allowed);
        assert_eq!(verdict.distance_m, 0.0);
        assert_eq!(verdict.message_th, "อยู่ในระยะที่อนุญาต (0 ม.)");
    }
}
