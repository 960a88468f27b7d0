//! Derives a single canonical point and uncertainty radius from an
//! ellipse/radialPolygon/linearPolygon location payload, shared by the
//! `location` table updater and by the response-cache store's coordinate
//! extraction at cache-update time.

use serde_json::Value;

use crate::geo::{unwrap_longitudes_anchored, Point, METERS_PER_DEGREE};

#[derive(Debug, Clone, PartialEq)]
pub struct LocationData {
    pub center: Point,
    pub uncertainty_m: f64,
    pub location_type: String,
    pub deployment_kind: Option<String>,
    pub height_m: Option<f64>,
    pub height_uncertainty_m: Option<f64>,
    pub height_type: Option<String>,
}

/// Parses one of the three supported location shapes. Unrecognized shapes are
/// rejected at the message-parsing boundary (JSON format error), so this is
/// infallible over well-formed ALS/AFC location payloads.
pub fn derive(location_json: &Value) -> Option<LocationData> {
    let height = location_json.get("height");
    let height_m = height.and_then(|h| h.get("height")).and_then(Value::as_f64);
    let height_uncertainty_m = height
        .and_then(|h| h.get("verticalUncertainty"))
        .and_then(Value::as_f64);
    let height_type = height
        .and_then(|h| h.get("heightType"))
        .and_then(Value::as_str)
        .map(str::to_string);
    let deployment_kind = location_json
        .get("indoorDeployment")
        .and_then(Value::as_i64)
        .map(|v| v.to_string());

    if let Some(ellipse) = location_json.get("ellipse") {
        let center = point_of(ellipse.get("center")?)?;
        let major = ellipse.get("majorAxis").and_then(Value::as_f64)?;
        return Some(LocationData {
            center,
            uncertainty_m: major,
            location_type: "ellipse".to_string(),
            deployment_kind,
            height_m,
            height_uncertainty_m,
            height_type,
        });
    }

    if let Some(radial) = location_json.get("radialPolygon") {
        let center = point_of(radial.get("center")?)?;
        let max_radius = radial
            .get("outerBoundary")?
            .as_array()?
            .iter()
            .filter_map(|v| v.get("length").and_then(Value::as_f64))
            .fold(0.0_f64, f64::max);
        return Some(LocationData {
            center,
            uncertainty_m: max_radius,
            location_type: "radialPolygon".to_string(),
            deployment_kind,
            height_m,
            height_uncertainty_m,
            height_type,
        });
    }

    if let Some(polygon) = location_json.get("linearPolygon") {
        let vertices: Vec<Point> = polygon
            .get("outerBoundary")?
            .as_array()?
            .iter()
            .filter_map(point_of)
            .collect();
        if vertices.is_empty() {
            return None;
        }
        let lons: Vec<f64> = vertices.iter().map(|p| p.lon).collect();
        let unwrapped_lons = unwrap_longitudes_anchored(&lons);
        let n = vertices.len() as f64;
        let centroid_lat = vertices.iter().map(|p| p.lat).sum::<f64>() / n;
        let centroid_lon_unwrapped = unwrapped_lons.iter().sum::<f64>() / n;
        let centroid = Point {
            lat: centroid_lat,
            lon: normalize_lon(centroid_lon_unwrapped),
        };
        let max_dist = vertices
            .iter()
            .zip(unwrapped_lons.iter())
            .map(|(p, &lon)| flat_earth_m(p.lat, lon, centroid_lat, centroid_lon_unwrapped))
            .fold(0.0_f64, f64::max);
        return Some(LocationData {
            center: centroid,
            uncertainty_m: max_dist,
            location_type: "linearPolygon".to_string(),
            deployment_kind,
            height_m,
            height_uncertainty_m,
            height_type,
        });
    }

    None
}

fn point_of(v: &Value) -> Option<Point> {
    Some(Point {
        lat: v.get("latitude")?.as_f64()?,
        lon: v.get("longitude")?.as_f64()?,
    })
}

fn flat_earth_m(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let mean_lat_rad = ((lat1 + lat2) / 2.0).to_radians();
    let dy = (lat1 - lat2) * METERS_PER_DEGREE;
    let dx = (lon1 - lon2) * METERS_PER_DEGREE * mean_lat_rad.cos();
    (dx * dx + dy * dy).sqrt()
}

fn normalize_lon(lon: f64) -> f64 {
    let mut l = lon;
    while l > 180.0 {
        l -= 360.0;
    }
    while l < -180.0 {
        l += 360.0;
    }
    l
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn derives_ellipse_center_and_radius() {
        let loc = json!({
            "ellipse": {"center": {"latitude": 40.0, "longitude": -74.0}, "majorAxis": 30.0}
        });
        let data = derive(&loc).unwrap();
        assert_eq!(data.center, Point { lat: 40.0, lon: -74.0 });
        assert_eq!(data.uncertainty_m, 30.0);
        assert_eq!(data.location_type, "ellipse");
    }

    #[test]
    fn derives_linear_polygon_centroid_across_antimeridian() {
        let loc = json!({
            "linearPolygon": {"outerBoundary": [
                {"latitude": 0.0, "longitude": 179.0},
                {"latitude": 0.0, "longitude": -179.0},
            ]}
        });
        let data = derive(&loc).unwrap();
        assert!((data.center.lon - 180.0).abs() < 1e-6 || (data.center.lon + 180.0).abs() < 1e-6);
    }

    #[test]
    fn unrecognized_shape_returns_none() {
        assert!(derive(&json!({"unknown": {}})).is_none());
    }
}
