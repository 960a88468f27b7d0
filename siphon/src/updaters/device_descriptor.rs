//! `device_descriptor` (C4): keyed by digest of the device-descriptor JSON;
//! references the `certification` list by its own digest (C3 lookup).
//!
//! `certification` is keyed `(list-digest, index-in-list)`, one row per
//! `(ruleset, cert_id)` pair — the semantic key is the *ordered list*, not a
//! single JSON blob, so index order is part of each row's identity.

use als_model::message::inspect;
use serde_json::Value;
use sqlx::{PgConnection, Row};
use uuid::Uuid;

use crate::lookups::Lookups;

pub fn digest_for(device_descriptor: &Value) -> Uuid {
    als_model::digest::uuid_for_json(device_descriptor)
}

pub fn certification_digest_for(device_descriptor: &Value) -> Uuid {
    let certs = inspect::certification_ids(device_descriptor);
    als_model::digest::uuid_for_json(&serde_json::to_value(certs).expect("cert list serializes"))
}

/// Pre-cascade: upserts each device descriptor's certification list before the
/// device row itself references it.
pub async fn update_db(
    conn: &mut PgConnection,
    lookups: &Lookups,
    items: &[(Uuid, Value)],
    month_idx: i32,
) -> Result<Vec<Uuid>, sqlx::Error> {
    if items.is_empty() {
        return Ok(Vec::new());
    }

    let cert_lists: Vec<(Uuid, Vec<(String, String)>)> = items
        .iter()
        .map(|(_, dd)| (certification_digest_for(dd), inspect::certification_ids(dd)))
        .collect();
    let missing_certs = lookups.certification.missing(&cert_lists.iter().map(|(id, _)| *id).collect::<Vec<_>>());
    if !missing_certs.is_empty() {
        let to_insert: Vec<&(Uuid, Vec<(String, String)>)> =
            cert_lists.iter().filter(|(id, _)| missing_certs.contains(id)).collect();
        insert_certifications(conn, &to_insert, month_idx).await?;
        lookups.certification.mark_present(missing_certs);
    }

    let ids: Vec<Uuid> = items.iter().map(|(id, _)| *id).collect();
    let serials: Vec<Option<String>> = items
        .iter()
        .map(|(_, dd)| dd.get("serialNumber").and_then(Value::as_str).map(str::to_string))
        .collect();
    let cert_digests: Vec<Uuid> = cert_lists.iter().map(|(id, _)| *id).collect();
    let months: Vec<i32> = items.iter().map(|_| month_idx).collect();

    let rows = sqlx::query(
        "INSERT INTO device_descriptor (id, serial_number, certification_digest, month_idx) \
         SELECT * FROM UNNEST($1::uuid[], $2::text[], $3::uuid[], $4::int[]) \
         ON CONFLICT (id) DO NOTHING \
         RETURNING id",
    )
    .bind(&ids)
    .bind(&serials)
    .bind(&cert_digests)
    .bind(&months)
    .fetch_all(&mut *conn)
    .await?;

    rows.into_iter().map(|r| r.try_get("id")).collect()
}

async fn insert_certifications(
    conn: &mut PgConnection,
    items: &[&(Uuid, Vec<(String, String)>)],
    month_idx: i32,
) -> Result<(), sqlx::Error> {
    let mut list_digests: Vec<Uuid> = Vec::new();
    let mut idxs: Vec<i32> = Vec::new();
    let mut rulesets: Vec<String> = Vec::new();
    let mut cert_ids: Vec<String> = Vec::new();
    let mut months: Vec<i32> = Vec::new();
    for (digest, certs) in items {
        for (idx, (ruleset, cert_id)) in certs.iter().enumerate() {
            list_digests.push(*digest);
            idxs.push(idx as i32);
            rulesets.push(ruleset.clone());
            cert_ids.push(cert_id.clone());
            months.push(month_idx);
        }
    }
    if list_digests.is_empty() {
        return Ok(());
    }
    sqlx::query(
        "INSERT INTO certification (list_digest, idx, ruleset, cert_id, month_idx) \
         SELECT * FROM UNNEST($1::uuid[], $2::int[], $3::text[], $4::text[], $5::int[]) \
         ON CONFLICT (list_digest, idx) DO NOTHING",
    )
    .bind(&list_digests)
    .bind(&idxs)
    .bind(&rulesets)
    .bind(&cert_ids)
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
    fn digest_is_stable_under_key_permutation() {
        let a = json!({"serialNumber": "SN1", "certificationId": []});
        let b = json!({"certificationId": [], "serialNumber": "SN1"});
        assert_eq!(digest_for(&a), digest_for(&b));
    }

    #[test]
    fn certification_digest_depends_only_on_certification_list() {
        let a = json!({"serialNumber": "SN1", "certificationId": [{"rulesetId": "US", "id": "c1"}]});
        let b = json!({"serialNumber": "SN2", "certificationId": [{"rulesetId": "US", "id": "c1"}]});
        assert_eq!(certification_digest_for(&a), certification_digest_for(&b));
    }
}
