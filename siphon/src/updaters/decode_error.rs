//! `decode_error`: records malformed messages and expired bundles, per §7's
//! Protocol error / JSON format error handling. Offsets for rows written here
//! are marked processed regardless of the error, so a poison message can never
//! block the partition.

use sqlx::PgPool;

pub struct DecodeErrorRow {
    pub kind: &'static str,
    pub detail: String,
    pub raw_payload: Option<Vec<u8>>,
}

pub async fn insert(pool: &PgPool, row: &DecodeErrorRow) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO decode_error (kind, detail, raw_payload, occurred_at) \
         VALUES ($1, $2, $3, now())",
    )
    .bind(row.kind)
    .bind(&row.detail)
    .bind(&row.raw_payload)
    .execute(pool)
    .await?;
    Ok(())
}
