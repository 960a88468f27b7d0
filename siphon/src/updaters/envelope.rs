//! `rx_envelope`, `tx_envelope` (C4): keyed by digest of the enclosing
//! Request/Response message stripped of the per-request array — the invariant
//! transport envelope shared across every inner request/response in a message.

use serde_json::Value;
use sqlx::{PgConnection, Row};
use uuid::Uuid;

/// Strips the per-request array so the envelope digest only reflects the
/// invariant transport wrapper (vendor extensions, protocol version, ...).
pub fn strip_request_array(request: &Value) -> Value {
    let mut stripped = request.clone();
    if let Value::Object(ref mut map) = stripped {
        map.remove("availableSpectrumInquiryRequests");
    }
    stripped
}

pub fn strip_response_array(response: &Value) -> Value {
    let mut stripped = response.clone();
    if let Value::Object(ref mut map) = stripped {
        map.remove("availableSpectrumInquiryResponses");
    }
    stripped
}

pub fn digest_for(envelope_json: &Value) -> Uuid {
    als_model::digest::uuid_for_json(envelope_json)
}

async fn update_one(
    conn: &mut PgConnection,
    table: &str,
    items: &[(Uuid, Value)],
    month_idx: i32,
) -> Result<Vec<Uuid>, sqlx::Error> {
    if items.is_empty() {
        return Ok(Vec::new());
    }
    let ids: Vec<Uuid> = items.iter().map(|(id, _)| *id).collect();
    let blobs: Vec<Value> = items.iter().map(|(_, v)| v.clone()).collect();
    let months: Vec<i32> = items.iter().map(|_| month_idx).collect();
    let query = format!(
        "INSERT INTO {table} (id, envelope, month_idx) \
         SELECT * FROM UNNEST($1::uuid[], $2::jsonb[], $3::int[]) \
         ON CONFLICT (id) DO NOTHING \
         RETURNING id"
    );
    let rows = sqlx::query(&query)
        .bind(&ids)
        .bind(&blobs)
        .bind(&months)
        .fetch_all(&mut *conn)
        .await?;
    rows.into_iter().map(|r| r.try_get("id")).collect()
}

pub async fn update_rx(
    conn: &mut PgConnection,
    items: &[(Uuid, Value)],
    month_idx: i32,
) -> Result<Vec<Uuid>, sqlx::Error> {
    update_one(conn, "rx_envelope", items, month_idx).await
}

pub async fn update_tx(
    conn: &mut PgConnection,
    items: &[(Uuid, Value)],
    month_idx: i32,
) -> Result<Vec<Uuid>, sqlx::Error> {
    update_one(conn, "tx_envelope", items, month_idx).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn strip_request_array_removes_inner_requests_only() {
        let req = json!({
            "version": "1.4",
            "availableSpectrumInquiryRequests": [{"requestId": "r1"}],
        });
        let stripped = strip_request_array(&req);
        assert!(stripped.get("availableSpectrumInquiryRequests").is_none());
        assert_eq!(stripped["version"], "1.4");
    }

    #[test]
    fn envelope_digest_insensitive_to_request_contents() {
        let r1 = json!({"version": "1.4", "availableSpectrumInquiryRequests": [{"requestId": "a"}]});
        let r2 = json!({"version": "1.4", "availableSpectrumInquiryRequests": [{"requestId": "b"}]});
        assert_eq!(
            digest_for(&strip_request_array(&r1)),
            digest_for(&strip_request_array(&r2))
        );
    }
}
