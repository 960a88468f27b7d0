//! `compressed_json` (C4): content-addressed, LZ4-compressed JSON blobs. The
//! digest that keys a row is always computed over the *uncompressed* canonical
//! bytes, so two logically identical payloads with different whitespace collapse
//! to one row regardless of compression framing.

use als_model::digest::canonical_bytes;
use serde_json::Value;
use sqlx::{PgConnection, Row};
use uuid::Uuid;

pub fn digest_for(value: &Value) -> Uuid {
    als_model::digest::uuid_for_json(value)
}

pub fn compress(value: &Value) -> Vec<u8> {
    lz4_flex::compress_prepend_size(&canonical_bytes(value))
}

pub fn decompress(blob: &[u8]) -> Result<Value, anyhow::Error> {
    let raw = lz4_flex::decompress_size_prepended(blob)?;
    Ok(serde_json::from_slice(&raw)?)
}

/// Upserts one row per `(digest, value)` pair not already present; returns the
/// digests that were newly inserted this call (the post-cascade signal for
/// callers that attach child rows to a `compressed_json` parent).
pub async fn update_db(
    conn: &mut PgConnection,
    items: &[(Uuid, Value)],
    month_idx: i32,
) -> Result<Vec<Uuid>, sqlx::Error> {
    if items.is_empty() {
        return Ok(Vec::new());
    }
    let ids: Vec<Uuid> = items.iter().map(|(id, _)| *id).collect();
    let blobs: Vec<Vec<u8>> = items.iter().map(|(_, v)| compress(v)).collect();
    let months: Vec<i32> = items.iter().map(|_| month_idx).collect();

    let rows = sqlx::query(
        "INSERT INTO compressed_json (id, blob, month_idx) \
         SELECT * FROM UNNEST($1::uuid[], $2::bytea[], $3::int[]) \
         ON CONFLICT (id) DO NOTHING \
         RETURNING id",
    )
    .bind(&ids)
    .bind(&blobs)
    .bind(&months)
    .fetch_all(&mut *conn)
    .await?;

    rows.into_iter().map(|r| r.try_get("id")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn compress_round_trips() {
        let value = json!({"a": 1, "b": [1, 2, 3], "c": "hello"});
        let blob = compress(&value);
        let restored = decompress(&blob).unwrap();
        assert_eq!(restored, value);
    }

    #[test]
    fn digest_ignores_key_order() {
        let a = json!({"a": 1, "b": 2});
        let b = json!({"b": 2, "a": 1});
        assert_eq!(digest_for(&a), digest_for(&b));
    }
}
