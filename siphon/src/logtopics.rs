//! JSON-log side channel (§6.1): any Kafka topic matching the ALS-exclusion
//! pattern is mirrored verbatim into a table named after the topic, auto-created
//! on first write.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use sqlx::{PgPool, Row};

#[derive(Debug, Deserialize)]
struct LogRecord {
    #[serde(rename = "afcServer")]
    afc_server: String,
    time: DateTime<Utc>,
    #[serde(rename = "jsonData")]
    json_data: Value,
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Table names are derived from Kafka topic names, which aren't guaranteed to be
/// valid SQL identifiers by themselves; callers must already have filtered the
/// topic through the exclusion pattern before reaching here.
fn table_name(topic: &str) -> String {
    let sanitized: String = topic
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    quote_ident(&sanitized)
}

async fn ensure_table(conn: &mut sqlx::PgConnection, topic: &str) -> Result<(), sqlx::Error> {
    let table = table_name(topic);
    let ddl = format!(
        "CREATE TABLE IF NOT EXISTS {table} (source text, time timestamptz, log jsonb)"
    );
    sqlx::query(&ddl).execute(conn).await?;
    Ok(())
}

/// Parses and persists one batch of raw Kafka record values for a single
/// JSON-log topic, in one transaction: table creation and the batch insert
/// either both land or both roll back. Malformed records are skipped; the
/// caller is expected to mark their Kafka offsets processed regardless, since a
/// poison log record must never block the partition.
pub async fn flush_batch(pool: &PgPool, topic: &str, raw_values: &[Vec<u8>]) -> Result<usize, sqlx::Error> {
    if raw_values.is_empty() {
        return Ok(0);
    }

    let records: Vec<LogRecord> = raw_values
        .iter()
        .filter_map(|raw| serde_json::from_slice(raw).ok())
        .collect();
    if records.is_empty() {
        return Ok(0);
    }

    let sources: Vec<String> = records.iter().map(|r| r.afc_server.clone()).collect();
    let times: Vec<DateTime<Utc>> = records.iter().map(|r| r.time).collect();
    let logs: Vec<Value> = records.iter().map(|r| r.json_data.clone()).collect();

    let table = table_name(topic);
    let insert = format!(
        "INSERT INTO {table} (source, time, log) SELECT * FROM UNNEST($1::text[], $2::timestamptz[], $3::jsonb[])"
    );

    let mut tx = pool.begin().await?;
    ensure_table(&mut tx, topic).await?;
    sqlx::query(&insert)
        .bind(&sources)
        .bind(&times)
        .bind(&logs)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;

    Ok(records.len())
}

/// Row-count helper used by integration tests to confirm a flush landed.
pub async fn row_count(pool: &PgPool, topic: &str) -> Result<i64, sqlx::Error> {
    let table = table_name(topic);
    let row = sqlx::query(&format!("SELECT count(*) as n FROM {table}"))
        .fetch_one(pool)
        .await?;
    row.try_get("n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_name_sanitizes_non_identifier_chars() {
        assert_eq!(table_name("logs.foo-bar"), "\"logs_foo_bar\"");
    }

    #[test]
    fn table_name_escapes_embedded_quotes() {
        assert_eq!(table_name("weird\"name"), "\"weird\"\"name\"");
    }
}
