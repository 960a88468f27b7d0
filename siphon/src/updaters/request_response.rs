//! `request_response` (C4): the central normalized table, one row per distinct
//! `{request-without-id, response-without-id-or-expiry, config-text, customer,
//! uls_id, geo_id}` tuple. Foreign keys point to every other normalized table;
//! PSD/EIRP child rows are inserted only for newly-inserted parents.

use als_model::message::inspect;
use serde_json::Value;
use sqlx::{PgConnection, Row};
use uuid::Uuid;

use crate::lookups::Lookups;
use crate::updaters::{compressed_json, device_descriptor, location, psd_eirp};

pub struct RequestResponseInput {
    pub request_item: Value,
    pub response_item: Value,
    pub config_text: String,
    pub customer: String,
    pub uls_id: String,
    pub geo_data_version: String,
}

/// request-without-id, response-without-id-or-expiry: the content shared across
/// transactions, independent of per-delivery metadata.
fn sanitized_request(request_item: &Value) -> Value {
    let mut v = request_item.clone();
    if let Value::Object(ref mut map) = v {
        map.remove("requestId");
    }
    v
}

fn sanitized_response(response_item: &Value) -> Value {
    let mut v = response_item.clone();
    if let Value::Object(ref mut map) = v {
        map.remove("requestId");
        map.remove("availabilityExpireTime");
    }
    v
}

pub fn digest_for(input: &RequestResponseInput) -> Uuid {
    let tuple = serde_json::json!({
        "request": sanitized_request(&input.request_item),
        "response": sanitized_response(&input.response_item),
        "config_text": input.config_text,
        "customer": input.customer,
        "uls_id": input.uls_id,
        "geo_data_version": input.geo_data_version,
    });
    als_model::digest::uuid_for_json(&tuple)
}

/// Pre-cascade + build + bulk upsert + post-cascade for one batch of
/// `request_response` rows. Returns the set of digests newly inserted.
pub async fn update_db(
    conn: &mut PgConnection,
    lookups: &Lookups,
    items: &[(Uuid, RequestResponseInput)],
    month_idx: i32,
) -> Result<Vec<Uuid>, sqlx::Error> {
    if items.is_empty() {
        return Ok(Vec::new());
    }

    // Pre-cascade: string lookups for the free-form dimensions.
    let customers: Vec<String> = items.iter().map(|(_, i)| i.customer.clone()).collect();
    let uls_ids: Vec<String> = items.iter().map(|(_, i)| i.uls_id.clone()).collect();
    let geo_versions: Vec<String> = items.iter().map(|(_, i)| i.geo_data_version.clone()).collect();
    lookups.customer.update_db(&mut *conn, &customers, month_idx).await?;
    lookups.uls_data_version.update_db(&mut *conn, &uls_ids, month_idx).await?;
    lookups.geo_data_version.update_db(&mut *conn, &geo_versions, month_idx).await?;

    // Pre-cascade: config text digest lookup.
    let config_items: Vec<(Uuid, Value)> = items
        .iter()
        .map(|(_, i)| {
            (
                als_model::digest::uuid_for_text(&i.config_text),
                Value::String(i.config_text.clone()),
            )
        })
        .collect();
    let config_ids: Vec<Uuid> = config_items.iter().map(|(id, _)| *id).collect();
    let missing_config = lookups.afc_config.missing(&config_ids);
    if !missing_config.is_empty() {
        let to_insert: Vec<&(Uuid, Value)> =
            config_items.iter().filter(|(id, _)| missing_config.contains(id)).collect();
        insert_afc_config(&mut *conn, &to_insert, month_idx).await?;
        lookups.afc_config.mark_present(missing_config);
    }

    // Pre-cascade: device descriptor + location + compressed JSON for request and response.
    let device_items: Vec<(Uuid, Value)> = items
        .iter()
        .filter_map(|(_, i)| {
            let dd = inspect::device_descriptor(&i.request_item)?;
            Some((device_descriptor::digest_for(dd), dd.clone()))
        })
        .collect();
    device_descriptor::update_db(&mut *conn, lookups, &device_items, month_idx).await?;

    let mut location_items: Vec<(Uuid, location::LocationData)> = Vec::new();
    for (_, i) in items {
        if let Some(loc) = inspect::location(&i.request_item) {
            if let Some(parsed) = location::derive(loc) {
                location_items.push((location::digest_for(loc), parsed));
            }
        }
    }
    location::update_db(&mut *conn, &location_items, month_idx).await?;

    let mut json_items: Vec<(Uuid, Value)> = Vec::new();
    for (_, i) in items {
        json_items.push((compressed_json::digest_for(&i.request_item), i.request_item.clone()));
        let stored_response = sanitized_response(&i.response_item);
        json_items.push((compressed_json::digest_for(&stored_response), stored_response));
    }
    compressed_json::update_db(&mut *conn, &json_items, month_idx).await?;

    // Build rows.
    let ids: Vec<Uuid> = items.iter().map(|(id, _)| *id).collect();
    let config_digests: Vec<Uuid> = items
        .iter()
        .map(|(_, i)| als_model::digest::uuid_for_text(&i.config_text))
        .collect();
    let request_json_ids: Vec<Uuid> = items
        .iter()
        .map(|(_, i)| compressed_json::digest_for(&i.request_item))
        .collect();
    let response_json_ids: Vec<Uuid> = items
        .iter()
        .map(|(_, i)| compressed_json::digest_for(&sanitized_response(&i.response_item)))
        .collect();
    let device_digests: Vec<Option<Uuid>> = items
        .iter()
        .map(|(_, i)| inspect::device_descriptor(&i.request_item).map(device_descriptor::digest_for))
        .collect();
    let location_digests: Vec<Option<Uuid>> = items
        .iter()
        .map(|(_, i)| inspect::location(&i.request_item).map(location::digest_for))
        .collect();
    let months: Vec<i32> = items.iter().map(|_| month_idx).collect();

    let rows = sqlx::query(
        "INSERT INTO request_response \
         (id, config_id, request_json_id, response_json_id, device_descriptor_id, location_id, month_idx) \
         SELECT * FROM UNNEST($1::uuid[], $2::uuid[], $3::uuid[], $4::uuid[], $5::uuid[], $6::uuid[], $7::int[]) \
         ON CONFLICT (id) DO NOTHING \
         RETURNING id",
    )
    .bind(&ids)
    .bind(&config_digests)
    .bind(&request_json_ids)
    .bind(&response_json_ids)
    .bind(&device_digests)
    .bind(&location_digests)
    .bind(&months)
    .fetch_all(&mut *conn)
    .await?;

    let inserted: Vec<Uuid> = rows
        .into_iter()
        .map(|r| r.try_get("id"))
        .collect::<Result<_, _>>()?;

    // Post-cascade: PSD/EIRP child rows only for freshly-inserted parents.
    for (id, input) in items {
        if !inserted.contains(id) {
            continue;
        }
        let eirp = psd_eirp::eirp_rows(&input.response_item);
        psd_eirp::insert_eirp_rows(&mut *conn, *id, &eirp).await?;
        let psd = psd_eirp::psd_rows(&input.response_item);
        psd_eirp::insert_psd_rows(&mut *conn, *id, &psd).await?;
    }

    Ok(inserted)
}

async fn insert_afc_config(
    conn: &mut PgConnection,
    items: &[&(Uuid, Value)],
    month_idx: i32,
) -> Result<(), sqlx::Error> {
    let ids: Vec<Uuid> = items.iter().map(|(id, _)| *id).collect();
    let texts: Vec<String> = items
        .iter()
        .map(|(_, v)| v.as_str().unwrap_or_default().to_string())
        .collect();
    let months: Vec<i32> = items.iter().map(|_| month_idx).collect();
    sqlx::query(
        "INSERT INTO afc_config (id, config_text, month_idx) \
         SELECT * FROM UNNEST($1::uuid[], $2::text[], $3::int[]) \
         ON CONFLICT (id) DO NOTHING",
    )
    .bind(&ids)
    .bind(&texts)
    .bind(&months)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn digest_ignores_request_id_and_expiry() {
        let base = RequestResponseInput {
            request_item: json!({"requestId": "r1", "a": 1}),
            response_item: json!({"requestId": "r1", "availabilityExpireTime": "t1", "b": 2}),
            config_text: "cfg".into(),
            customer: "acme".into(),
            uls_id: "u1".into(),
            geo_data_version: "g1".into(),
        };
        let varied = RequestResponseInput {
            request_item: json!({"requestId": "r2", "a": 1}),
            response_item: json!({"requestId": "r2", "availabilityExpireTime": "t2", "b": 2}),
            config_text: "cfg".into(),
            customer: "acme".into(),
            uls_id: "u1".into(),
            geo_data_version: "g1".into(),
        };
        assert_eq!(digest_for(&base), digest_for(&varied));
    }

    #[test]
    fn digest_depends_on_config_text() {
        let mk = |cfg: &str| RequestResponseInput {
            request_item: json!({"a": 1}),
            response_item: json!({"b": 2}),
            config_text: cfg.to_string(),
            customer: "acme".into(),
            uls_id: "u1".into(),
            geo_data_version: "g1".into(),
        };
        assert_ne!(digest_for(&mk("cfg1")), digest_for(&mk("cfg2")));
    }
}
