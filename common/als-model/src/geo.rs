//! Geodetic helpers shared by the location table updater (digest + canonical point
//! derivation) and by spatial cache invalidation (rectangle membership).

use serde::{Deserialize, Serialize};

/// Meters per degree of latitude/longitude under a flat-earth approximation,
/// `6_371_000 * pi / 180`.
pub const METERS_PER_DEGREE: f64 = 6_371_000.0 * std::f64::consts::PI / 180.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub lat: f64,
    pub lon: f64,
}

/// A lat/lon rectangle as received from a spatial-invalidation request. Longitude
/// may cross the antimeridian, encoded either as `max_lon >= 180` or as an inverted
/// range (`min_lon > max_lon`) that must be normalized before use.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Rectangle {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lon: f64,
    pub max_lon: f64,
}

impl Rectangle {
    /// True if the longitude range wraps across +/-180.
    pub fn crosses_antimeridian(&self) -> bool {
        self.min_lon > self.max_lon
    }

    /// Splits an antimeridian-crossing rectangle into two halves, each within
    /// [-180, 180], so downstream geometry (PostGIS polygons, in-process checks)
    /// never has to reason about wraparound.
    pub fn split_halves(&self) -> Vec<Rectangle> {
        if !self.crosses_antimeridian() {
            return vec![*self];
        }
        vec![
            Rectangle {
                min_lat: self.min_lat,
                max_lat: self.max_lat,
                min_lon: self.min_lon,
                max_lon: 180.0,
            },
            Rectangle {
                min_lat: self.min_lat,
                max_lat: self.max_lat,
                min_lon: -180.0,
                max_lon: self.max_lon,
            },
        ]
    }

    pub fn contains(&self, p: Point) -> bool {
        if p.lat < self.min_lat || p.lat > self.max_lat {
            return false;
        }
        if self.crosses_antimeridian() {
            self.split_halves().iter().any(|half| {
                p.lon >= half.min_lon && p.lon <= half.max_lon
            })
        } else {
            p.lon >= self.min_lon && p.lon <= self.max_lon
        }
    }
}

/// True if `point` falls within the union of `rects`.
pub fn point_in_any(point: Point, rects: &[Rectangle]) -> bool {
    rects.iter().any(|r| r.contains(point))
}

/// Great-circle-free, flat-earth distance in meters between two points, adequate for
/// the small uncertainty radii (tens of km at most) these computations deal with.
pub fn flat_earth_distance_m(a: Point, b: Point) -> f64 {
    let mean_lat_rad = ((a.lat + b.lat) / 2.0).to_radians();
    let dy = (a.lat - b.lat) * METERS_PER_DEGREE;
    let dx = (a.lon - b.lon) * METERS_PER_DEGREE * mean_lat_rad.cos();
    (dx * dx + dy * dy).sqrt()
}

/// Shifts a sequence of longitudes that may straddle the antimeridian into the same
/// 360-degree slice anchored at the first vertex, so centroid/extent computations
/// don't wrap around incorrectly.
pub fn unwrap_longitudes_anchored(lons: &[f64]) -> Vec<f64> {
    let Some(&anchor) = lons.first() else {
        return Vec::new();
    };
    lons.iter()
        .map(|&lon| {
            let mut shifted = lon;
            while shifted - anchor > 180.0 {
                shifted -= 360.0;
            }
            while shifted - anchor < -180.0 {
                shifted += 360.0;
            }
            shifted
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rectangle_antimeridian_crossing() {
        let rect = Rectangle {
            min_lat: -1.0,
            max_lat: 1.0,
            min_lon: 179.0,
            max_lon: -179.0,
        };
        assert!(rect.contains(Point { lat: 0.0, lon: 179.5 }));
        assert!(rect.contains(Point { lat: 0.0, lon: -179.5 }));
        assert!(!rect.contains(Point { lat: 0.0, lon: 0.0 }));
    }

    #[test]
    fn rectangle_ordinary() {
        let rect = Rectangle {
            min_lat: 10.0,
            max_lat: 20.0,
            min_lon: 30.0,
            max_lon: 40.0,
        };
        assert!(rect.contains(Point { lat: 15.0, lon: 35.0 }));
        assert!(!rect.contains(Point { lat: 25.0, lon: 35.0 }));
        assert!(!rect.contains(Point { lat: 15.0, lon: 45.0 }));
    }

    #[test]
    fn unwrap_longitudes_keeps_vertices_contiguous() {
        let lons = vec![179.0, -179.0, 179.5];
        let unwrapped = unwrap_longitudes_anchored(&lons);
        assert_eq!(unwrapped[0], 179.0);
        assert!((unwrapped[1] - 181.0).abs() < 1e-9);
        assert!((unwrapped[2] - 179.5).abs() < 1e-9);
    }
}
