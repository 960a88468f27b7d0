//! `location` (C4): persists the canonical point/uncertainty/deployment data
//! derived by `als_model::location::derive` (§4.4).

pub use als_model::location::{derive, LocationData};
use serde_json::Value;
use sqlx::{PgConnection, Row};
use uuid::Uuid;

pub fn digest_for(location_json: &Value) -> Uuid {
    als_model::digest::uuid_for_json(location_json)
}

/// Upserts one row per `(digest, location)` pair not already present; returns
/// digests newly inserted this call.
pub async fn update_db(
    conn: &mut PgConnection,
    items: &[(Uuid, LocationData)],
    month_idx: i32,
) -> Result<Vec<Uuid>, sqlx::Error> {
    if items.is_empty() {
        return Ok(Vec::new());
    }
    let ids: Vec<Uuid> = items.iter().map(|(id, _)| *id).collect();
    let lats: Vec<f64> = items.iter().map(|(_, d)| d.center.lat).collect();
    let lons: Vec<f64> = items.iter().map(|(_, d)| d.center.lon).collect();
    let radii: Vec<f64> = items.iter().map(|(_, d)| d.uncertainty_m).collect();
    let types: Vec<&str> = items.iter().map(|(_, d)| d.location_type.as_str()).collect();
    let deployment_kinds: Vec<Option<&str>> =
        items.iter().map(|(_, d)| d.deployment_kind.as_deref()).collect();
    let height_ms: Vec<Option<f64>> = items.iter().map(|(_, d)| d.height_m).collect();
    let height_uncertainty_ms: Vec<Option<f64>> =
        items.iter().map(|(_, d)| d.height_uncertainty_m).collect();
    let height_types: Vec<Option<&str>> =
        items.iter().map(|(_, d)| d.height_type.as_deref()).collect();
    let months: Vec<i32> = items.iter().map(|_| month_idx).collect();

    let rows = sqlx::query(
        "INSERT INTO location \
         (id, lat, lon, uncertainty_m, location_type, deployment_kind, height_m, height_uncertainty_m, height_type, month_idx) \
         SELECT * FROM UNNEST($1::uuid[], $2::float8[], $3::float8[], $4::float8[], $5::text[], \
                              $6::text[], $7::float8[], $8::float8[], $9::text[], $10::int[]) \
         ON CONFLICT (id) DO NOTHING \
         RETURNING id",
    )
    .bind(&ids)
    .bind(&lats)
    .bind(&lons)
    .bind(&radii)
    .bind(&types)
    .bind(&deployment_kinds)
    .bind(&height_ms)
    .bind(&height_uncertainty_ms)
    .bind(&height_types)
    .bind(&months)
    .fetch_all(&mut *conn)
    .await?;

    rows.into_iter().map(|r| r.try_get("id")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use als_model::geo::Point;
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
}
