//! `max_psd`, `max_eirp` (C4): per-entry child rows keyed by the owning
//! `request_response` digest (a one-to-many relationship, one row per channel or
//! frequency range in the response).

use serde_json::Value;
use sqlx::PgConnection;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct EirpRow {
    pub channel_center_freq_mhz: f64,
    pub channel_width_mhz: f64,
    pub eirp_dbm: f64,
}

#[derive(Debug, Clone)]
pub struct PsdRow {
    pub low_freq_mhz: f64,
    pub high_freq_mhz: f64,
    pub psd_dbm_per_mhz: f64,
}

pub fn eirp_rows(response_item: &Value) -> Vec<EirpRow> {
    response_item
        .pointer("/availableChannelInfo")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .flat_map(|info| {
            let center_freqs = info.get("channelCfi").and_then(Value::as_array);
            let eirps = info.get("maxEirp").and_then(Value::as_array);
            let width = info
                .get("globalOperatingClass")
                .and_then(Value::as_f64)
                .unwrap_or(0.0);
            center_freqs
                .into_iter()
                .flatten()
                .zip(eirps.into_iter().flatten())
                .filter_map(move |(cfi, eirp)| {
                    Some(EirpRow {
                        channel_center_freq_mhz: cfi.as_f64()?,
                        channel_width_mhz: width,
                        eirp_dbm: eirp.as_f64()?,
                    })
                })
        })
        .collect()
}

pub fn psd_rows(response_item: &Value) -> Vec<PsdRow> {
    response_item
        .pointer("/availableFrequencyInfo")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|info| {
            let range = info.get("frequencyRange")?;
            Some(PsdRow {
                low_freq_mhz: range.get("lowFrequency")?.as_f64()?,
                high_freq_mhz: range.get("highFrequency")?.as_f64()?,
                psd_dbm_per_mhz: info.get("maxPsd")?.as_f64()?,
            })
        })
        .collect()
}

/// Bulk-inserts EIRP child rows for newly-inserted `request_response` parents.
/// No conflict handling is needed: the caller only invokes this for parent keys
/// it just confirmed were freshly inserted.
pub async fn insert_eirp_rows(
    conn: &mut PgConnection,
    parent_id: Uuid,
    rows: &[EirpRow],
) -> Result<(), sqlx::Error> {
    if rows.is_empty() {
        return Ok(());
    }
    let parents: Vec<Uuid> = rows.iter().map(|_| parent_id).collect();
    let freqs: Vec<f64> = rows.iter().map(|r| r.channel_center_freq_mhz).collect();
    let widths: Vec<f64> = rows.iter().map(|r| r.channel_width_mhz).collect();
    let eirps: Vec<f64> = rows.iter().map(|r| r.eirp_dbm).collect();
    sqlx::query(
        "INSERT INTO max_eirp (request_response_id, channel_center_freq_mhz, channel_width_mhz, eirp_dbm) \
         SELECT * FROM UNNEST($1::uuid[], $2::float8[], $3::float8[], $4::float8[])",
    )
    .bind(&parents)
    .bind(&freqs)
    .bind(&widths)
    .bind(&eirps)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub async fn insert_psd_rows(
    conn: &mut PgConnection,
    parent_id: Uuid,
    rows: &[PsdRow],
) -> Result<(), sqlx::Error> {
    if rows.is_empty() {
        return Ok(());
    }
    let parents: Vec<Uuid> = rows.iter().map(|_| parent_id).collect();
    let lows: Vec<f64> = rows.iter().map(|r| r.low_freq_mhz).collect();
    let highs: Vec<f64> = rows.iter().map(|r| r.high_freq_mhz).collect();
    let psds: Vec<f64> = rows.iter().map(|r| r.psd_dbm_per_mhz).collect();
    sqlx::query(
        "INSERT INTO max_psd (request_response_id, low_freq_mhz, high_freq_mhz, psd_dbm_per_mhz) \
         SELECT * FROM UNNEST($1::uuid[], $2::float8[], $3::float8[], $4::float8[])",
    )
    .bind(&parents)
    .bind(&lows)
    .bind(&highs)
    .bind(&psds)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn extracts_psd_rows_from_frequency_info() {
        let resp = json!({
            "availableFrequencyInfo": [
                {"frequencyRange": {"lowFrequency": 5925.0, "highFrequency": 5945.0}, "maxPsd": 23.0}
            ]
        });
        let rows = psd_rows(&resp);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].psd_dbm_per_mhz, 23.0);
    }

    #[test]
    fn missing_frequency_info_yields_empty() {
        assert!(psd_rows(&json!({})).is_empty());
        assert!(eirp_rows(&json!({})).is_empty());
    }
}
