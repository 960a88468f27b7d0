//! Spatial invalidation (C10): PostGIS `ST_Intersects` against the union of
//! antimeridian-split rectangle polygons on the `coordinates` geography column.

use als_model::cache::Beam;
use als_model::geo::Rectangle;
use sqlx::PgPool;

fn polygon_wkt(rect: &Rectangle) -> String {
    format!(
        "POLYGON(({} {}, {} {}, {} {}, {} {}, {} {}))",
        rect.min_lon,
        rect.min_lat,
        rect.max_lon,
        rect.min_lat,
        rect.max_lon,
        rect.max_lat,
        rect.min_lon,
        rect.max_lat,
        rect.min_lon,
        rect.min_lat,
    )
}

fn union_geography_sql(rects: &[Rectangle]) -> String {
    let halves: Vec<Rectangle> = rects.iter().flat_map(Rectangle::split_halves).collect();
    let polygons: Vec<String> = halves
        .iter()
        .map(|r| format!("ST_GeogFromText('SRID=4326;{}')", polygon_wkt(r)))
        .collect();
    format!("ST_Union(ARRAY[{}])", polygons.join(", "))
}

/// Invalidates every cache row whose coordinates fall within the union of
/// `rects`; returns the number of rows updated for telemetry.
pub async fn invalidate(pool: &PgPool, rects: &[Rectangle]) -> Result<u64, sqlx::Error> {
    if rects.is_empty() {
        return Ok(0);
    }
    let sql = format!(
        "UPDATE response_cache SET state = 'invalid' \
         WHERE state != 'invalid' AND ST_Intersects(coordinates, {})",
        union_geography_sql(rects)
    );
    let result = sqlx::query(&sql).execute(pool).await?;
    Ok(result.rows_affected())
}

/// Substitutes a beam's endpoints into an opaque, deployment-supplied PostGIS
/// template, producing a geography expression for one keyhole shape. The
/// template names its placeholders `{rx_lat}`/`{rx_lon}` (always present) plus
/// either `{tx_lat}`/`{tx_lon}` or `{azimuth_to_tx}` depending on which form
/// of direction the deployment's template expects.
fn keyhole_geography_sql(template: &str, beam: &Beam) -> String {
    let mut sql = template
        .replace("{rx_lat}", &beam.rx.lat.to_string())
        .replace("{rx_lon}", &beam.rx.lon.to_string());
    if let Some(tx) = beam.tx_point {
        sql = sql
            .replace("{tx_lat}", &tx.lat.to_string())
            .replace("{tx_lon}", &tx.lon.to_string());
    }
    if let Some(azimuth) = beam.azimuth_to_tx_deg {
        sql = sql.replace("{azimuth_to_tx}", &azimuth.to_string());
    }
    sql
}

/// Directional ("beam") invalidation: invalidates every cache row whose
/// coordinates fall within any beam's keyhole shape, as rendered by
/// `keyhole_template`. Malformed beams (neither or both of TX point/azimuth
/// set) are dropped; an empty template or beam list is a no-op.
pub async fn invalidate_directional(
    pool: &PgPool,
    beams: &[Beam],
    keyhole_template: &str,
) -> Result<u64, sqlx::Error> {
    if beams.is_empty() || keyhole_template.is_empty() {
        return Ok(0);
    }
    let shapes: Vec<String> = beams
        .iter()
        .filter(|b| b.is_well_formed())
        .map(|b| keyhole_geography_sql(keyhole_template, b))
        .collect();
    if shapes.is_empty() {
        return Ok(0);
    }
    let predicate = shapes
        .iter()
        .map(|shape| format!("ST_Intersects(coordinates, {shape})"))
        .collect::<Vec<_>>()
        .join(" OR ");
    let sql = format!("UPDATE response_cache SET state = 'invalid' WHERE state != 'invalid' AND ({predicate})");
    let result = sqlx::query(&sql).execute(pool).await?;
    Ok(result.rows_affected())
}

#[cfg(test)]
mod tests {
    use super::*;
    use als_model::geo::Point;

    #[test]
    fn keyhole_template_substitutes_rx_and_tx_point() {
        let beam = Beam {
            rx: Point { lat: 1.0, lon: 2.0 },
            tx_point: Some(Point { lat: 3.0, lon: 4.0 }),
            azimuth_to_tx_deg: None,
        };
        let template = "ST_MakeLine(ST_MakePoint({rx_lon}, {rx_lat}), ST_MakePoint({tx_lon}, {tx_lat}))";
        let sql = keyhole_geography_sql(template, &beam);
        assert_eq!(sql, "ST_MakeLine(ST_MakePoint(2, 1), ST_MakePoint(4, 3))");
    }

    #[test]
    fn keyhole_template_substitutes_azimuth() {
        let beam = Beam {
            rx: Point { lat: 1.0, lon: 2.0 },
            tx_point: None,
            azimuth_to_tx_deg: Some(45.0),
        };
        let template = "keyhole({rx_lat}, {rx_lon}, {azimuth_to_tx})";
        let sql = keyhole_geography_sql(template, &beam);
        assert_eq!(sql, "keyhole(1, 2, 45)");
    }

    #[test]
    fn malformed_beams_are_dropped_before_querying() {
        let malformed = Beam { rx: Point { lat: 0.0, lon: 0.0 }, tx_point: None, azimuth_to_tx_deg: None };
        assert!(!malformed.is_well_formed());
    }

    #[test]
    fn splits_antimeridian_crossing_rectangle_before_union() {
        let rect = Rectangle { min_lat: -1.0, max_lat: 1.0, min_lon: 179.0, max_lon: -179.0 };
        let sql = union_geography_sql(&[rect]);
        assert_eq!(sql.matches("ST_GeogFromText").count(), 2);
    }

    #[test]
    fn ordinary_rectangle_contributes_one_polygon() {
        let rect = Rectangle { min_lat: 10.0, max_lat: 20.0, min_lon: 30.0, max_lon: 40.0 };
        let sql = union_geography_sql(&[rect]);
        assert_eq!(sql.matches("ST_GeogFromText").count(), 1);
    }
}
