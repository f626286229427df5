//! Heading normalization and short-range distance math.

use crate::state::Coords2D;

/// Meters per second to miles per hour.
pub const MPH_PER_METER_PER_SECOND: f64 = 2.23694;

const MILES_PER_DEGREE: f64 = 69.172;
const FEET_PER_MILE: f64 = 5280.0;

/// Wraps a heading in degrees into [0, 360).
pub fn normalize_heading(degrees: f64) -> f64 {
    degrees.rem_euclid(360.0)
}

/// Planar distance between two geodetic points in feet, using an
/// equirectangular approximation. Only valid at short (sub-regional)
/// range; not a substitute for a geodesic solver.
pub fn distance_to_target_ft(vehicle: Coords2D, target: Coords2D) -> f64 {
    let lat_rad = vehicle.latitude.to_radians();
    let dx_ft =
        (target.longitude - vehicle.longitude) * lat_rad.cos() * MILES_PER_DEGREE * FEET_PER_MILE;
    let dy_ft = (target.latitude - vehicle.latitude) * MILES_PER_DEGREE * FEET_PER_MILE;
    (dx_ft * dx_ft + dy_ft * dy_ft).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heading_wraps_into_range() {
        assert_eq!(normalize_heading(-10.0), 350.0);
        assert_eq!(normalize_heading(370.0), 10.0);
        assert_eq!(normalize_heading(0.0), 0.0);
        assert_eq!(normalize_heading(360.0), 0.0);
        assert_eq!(normalize_heading(359.9), 359.9);

        for raw in [-720.5, -180.0, -0.001, 45.0, 719.9, 10_000.0] {
            let normalized = normalize_heading(raw);
            assert!((0.0..360.0).contains(&normalized), "raw {raw} -> {normalized}");
        }
    }

    #[test]
    fn longitude_offset_distance_at_equator() {
        let vehicle = Coords2D::new(0.0, 0.0);
        let target = Coords2D::new(0.0, 0.01);

        let expected = 0.01 * 69.172 * 5280.0;
        let actual = distance_to_target_ft(vehicle, target);

        assert!((actual - expected).abs() / expected < 0.001);
    }

    #[test]
    fn coincident_points_have_zero_distance() {
        let here = Coords2D::new(38.147, -76.427);
        assert_eq!(distance_to_target_ft(here, here), 0.0);
    }

    #[test]
    fn latitude_shrinks_longitude_distance() {
        let equator = distance_to_target_ft(Coords2D::new(0.0, 0.0), Coords2D::new(0.0, 0.01));
        let at_60 = distance_to_target_ft(Coords2D::new(60.0, 0.0), Coords2D::new(60.0, 0.01));

        // cos(60 deg) = 0.5
        assert!((at_60 / equator - 0.5).abs() < 0.001);
    }
}
