//! Response cache store (C7): keyed lookup/update/invalidate over the
//! `response_cache` table, built on `als_model::cache::{CacheEntry, CacheState}`.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use als_model::cache::{Beam, CacheEntry, CacheState};
use als_model::geo::{Point, Rectangle};
use als_model::message::inspect;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::spatial;

/// One `(request-json, response-json, req_cfg_digest)` triple submitted to `/update`.
#[derive(Debug, Clone)]
pub struct UpdateTriple {
    pub request: Value,
    pub response: Value,
    pub req_cfg_digest: String,
}

struct QueuedUpdate {
    triple: UpdateTriple,
    enqueued_at: Instant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RcacheStatus {
    pub up_time_seconds: u64,
    pub valid_count: i64,
    pub invalid_count: i64,
    pub update_queue_len: usize,
    pub update_rate_ema: f64,
    pub precompute_rate_ema: f64,
    pub scheduling_lag_ms: f64,
}

struct Ema {
    value: f64,
    alpha: f64,
}

impl Ema {
    fn new(alpha: f64) -> Self {
        Self { value: 0.0, alpha }
    }

    fn observe(&mut self, sample: f64) {
        self.value = self.alpha * sample + (1.0 - self.alpha) * self.value;
    }
}

#[derive(Clone)]
enum PendingInvalidation {
    Blanket { ruleset_ids: Option<Vec<String>> },
    Spatial { rects: Vec<Rectangle> },
    Directional { beams: Vec<Beam> },
}

#[derive(Clone)]
pub struct CacheStore {
    pool: PgPool,
    update_tx: mpsc::Sender<QueuedUpdate>,
    queue_len: Arc<AtomicUsize>,
    invalidation_enabled: Arc<AtomicBool>,
    update_enabled: Arc<AtomicBool>,
    pending_invalidations: Arc<Mutex<VecDeque<PendingInvalidation>>>,
    started_at: Instant,
    update_rate: Arc<Mutex<Ema>>,
    scheduling_lag: Arc<Mutex<Ema>>,
    keyhole_template: Arc<String>,
}

const WRITER_MAX_BATCH: usize = 500;

impl CacheStore {
    pub fn new(pool: PgPool, queue_capacity: usize, keyhole_template: String) -> Self {
        let (tx, rx) = mpsc::channel(queue_capacity);
        let queue_len = Arc::new(AtomicUsize::new(0));
        let update_enabled = Arc::new(AtomicBool::new(true));
        let update_rate = Arc::new(Mutex::new(Ema::new(0.3)));
        let scheduling_lag = Arc::new(Mutex::new(Ema::new(0.3)));

        tokio::spawn(Self::writer_loop(
            rx,
            pool.clone(),
            queue_len.clone(),
            update_enabled.clone(),
            update_rate.clone(),
            scheduling_lag.clone(),
        ));

        Self {
            pool,
            update_tx: tx,
            queue_len,
            invalidation_enabled: Arc::new(AtomicBool::new(true)),
            update_enabled,
            pending_invalidations: Arc::new(Mutex::new(VecDeque::new())),
            started_at: Instant::now(),
            update_rate,
            scheduling_lag,
            keyhole_template: Arc::new(keyhole_template),
        }
    }

    /// `lookup(digest)`: `SELECT` filtered to `state = valid`, patched with the
    /// current time at read time.
    pub async fn lookup(&self, digest: &str) -> Result<Option<Value>, sqlx::Error> {
        let map = lookup_batch(&self.pool, std::slice::from_ref(&digest.to_string())).await?;
        Ok(map.into_values().next())
    }

    pub fn enqueue_update(&self, batch: Vec<UpdateTriple>) -> usize {
        let mut accepted = 0;
        for triple in batch {
            let item = QueuedUpdate { triple, enqueued_at: Instant::now() };
            match self.update_tx.try_send(item) {
                Ok(()) => {
                    self.queue_len.fetch_add(1, Ordering::SeqCst);
                    accepted += 1;
                }
                Err(_) => warn!("response cache update queue full, dropping newest item"),
            }
        }
        accepted
    }

    pub fn set_update_enabled(&self, enabled: bool) {
        self.update_enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn set_invalidation_enabled(&self, enabled: bool) {
        self.invalidation_enabled.store(enabled, Ordering::SeqCst);
        if !enabled {
            return;
        }
        let pending: Vec<PendingInvalidation> = {
            let mut queue = self.pending_invalidations.lock().unwrap();
            queue.drain(..).collect()
        };
        if pending.is_empty() {
            return;
        }
        let pool = self.pool.clone();
        let keyhole_template = self.keyhole_template.clone();
        tokio::spawn(async move {
            for item in pending {
                let result = match item {
                    PendingInvalidation::Blanket { ruleset_ids } => {
                        invalidate_blanket(&pool, ruleset_ids.as_deref()).await
                    }
                    PendingInvalidation::Spatial { rects } => spatial::invalidate(&pool, &rects).await,
                    PendingInvalidation::Directional { beams } => {
                        spatial::invalidate_directional(&pool, &beams, &keyhole_template).await
                    }
                };
                if let Err(e) = result {
                    error!(error = %e, "deferred invalidation failed after re-enable");
                }
            }
        });
    }

    /// Blanket or ruleset-scoped invalidation. Queued (not executed) while
    /// invalidation is disabled; fulfilled when re-enabled.
    pub async fn invalidate_blanket(&self, ruleset_ids: Option<Vec<String>>) -> Result<u64, sqlx::Error> {
        if !self.invalidation_enabled.load(Ordering::SeqCst) {
            self.pending_invalidations
                .lock()
                .unwrap()
                .push_back(PendingInvalidation::Blanket { ruleset_ids });
            return Ok(0);
        }
        invalidate_blanket(&self.pool, ruleset_ids.as_deref()).await
    }

    pub async fn invalidate_spatial(&self, rects: Vec<Rectangle>) -> Result<u64, sqlx::Error> {
        if !self.invalidation_enabled.load(Ordering::SeqCst) {
            self.pending_invalidations
                .lock()
                .unwrap()
                .push_back(PendingInvalidation::Spatial { rects });
            return Ok(0);
        }
        spatial::invalidate(&self.pool, &rects).await
    }

    /// Directional (beam) invalidation (C7). Queued while invalidation is
    /// disabled, fulfilled when re-enabled, same as the blanket/spatial forms.
    pub async fn invalidate_directional(&self, beams: Vec<Beam>) -> Result<u64, sqlx::Error> {
        if !self.invalidation_enabled.load(Ordering::SeqCst) {
            self.pending_invalidations
                .lock()
                .unwrap()
                .push_back(PendingInvalidation::Directional { beams });
            return Ok(0);
        }
        spatial::invalidate_directional(&self.pool, &beams, &self.keyhole_template).await
    }

    pub async fn status(&self) -> Result<RcacheStatus, sqlx::Error> {
        let row = sqlx::query(
            "SELECT \
               count(*) FILTER (WHERE state = 'valid') AS valid_count, \
               count(*) FILTER (WHERE state = 'invalid') AS invalid_count \
             FROM response_cache",
        )
        .fetch_one(&self.pool)
        .await?;
        let valid_count: i64 = row.try_get("valid_count")?;
        let invalid_count: i64 = row.try_get("invalid_count")?;
        common_metrics::gauge("rcache_cache_valid_count", &[], valid_count as f64);
        common_metrics::gauge("rcache_cache_invalid_count", &[], invalid_count as f64);

        Ok(RcacheStatus {
            up_time_seconds: self.started_at.elapsed().as_secs(),
            valid_count,
            invalid_count,
            update_queue_len: self.queue_len.load(Ordering::SeqCst),
            update_rate_ema: self.update_rate.lock().unwrap().value,
            precompute_rate_ema: 0.0,
            scheduling_lag_ms: self.scheduling_lag.lock().unwrap().value,
        })
    }

    async fn writer_loop(
        mut rx: mpsc::Receiver<QueuedUpdate>,
        pool: PgPool,
        queue_len: Arc<AtomicUsize>,
        update_enabled: Arc<AtomicBool>,
        update_rate: Arc<Mutex<Ema>>,
        scheduling_lag: Arc<Mutex<Ema>>,
    ) {
        loop {
            if !update_enabled.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_millis(200)).await;
                continue;
            }
            let Some(first) = rx.recv().await else { return };
            let mut batch = vec![first];
            while batch.len() < WRITER_MAX_BATCH {
                match rx.try_recv() {
                    Ok(item) => batch.push(item),
                    Err(_) => break,
                }
            }
            queue_len.fetch_sub(batch.len(), Ordering::SeqCst);

            let now = Instant::now();
            {
                let mut lag = scheduling_lag.lock().unwrap();
                for item in &batch {
                    lag.observe(now.duration_since(item.enqueued_at).as_secs_f64() * 1000.0);
                }
            }

            let batch_len = batch.len();
            let triples: Vec<UpdateTriple> = batch.into_iter().map(|q| q.triple).collect();
            match upsert_batch(&pool, &triples).await {
                Ok(n) => info!(written = n, "flushed response cache update batch"),
                Err(e) => error!(error = %e, "failed to flush response cache update batch"),
            }
            update_rate.lock().unwrap().observe(batch_len as f64);
        }
    }
}

fn entry_from_row(row: &PgRow) -> Result<CacheEntry, sqlx::Error> {
    let rulesets_joined: String = row.try_get("rulesets")?;
    let cert_ids_joined: String = row.try_get("cert_ids")?;
    let state_text: String = row.try_get("state")?;
    let state = match state_text.as_str() {
        "valid" => CacheState::Valid,
        "precomp" => CacheState::Precomp,
        _ => CacheState::Invalid,
    };
    Ok(CacheEntry {
        fingerprint: row.try_get("req_cfg_digest")?,
        serial_number: row.try_get("serial_number")?,
        rulesets: rulesets_joined.split('|').map(str::to_string).collect(),
        cert_ids: cert_ids_joined.split('|').map(str::to_string).collect(),
        state,
        config_ruleset: row.try_get("config_ruleset")?,
        coordinates: Point { lat: row.try_get("lat")?, lon: row.try_get("lon")? },
        last_update: row.try_get("last_update")?,
        validity_period_seconds: row.try_get("validity_period_seconds")?,
        request: row.try_get("request")?,
        response: row.try_get("response")?,
    })
}

/// Batched digest lookup shared by `CacheStore::lookup` and the C6 cache
/// batcher's fetch function.
pub async fn lookup_batch(pool: &PgPool, digests: &[String]) -> Result<HashMap<String, Value>, sqlx::Error> {
    if digests.is_empty() {
        return Ok(HashMap::new());
    }
    let query_start = Instant::now();
    let rows = sqlx::query(
        "SELECT serial_number, rulesets, cert_ids, req_cfg_digest, state, config_ruleset, \
                lat, lon, last_update, validity_period_seconds, request, response \
         FROM response_cache WHERE req_cfg_digest = ANY($1::text[]) AND state = 'valid'",
    )
    .bind(digests)
    .fetch_all(pool)
    .await?;
    common_metrics::histogram(
        "rcache_db_round_trip_ms",
        &[("op".to_string(), "lookup_batch".to_string())],
        query_start.elapsed().as_secs_f64() * 1000.0,
    );

    let now = Utc::now();
    let mut out = HashMap::with_capacity(rows.len());
    for row in &rows {
        let entry = entry_from_row(row)?;
        out.insert(entry.fingerprint.clone(), entry.patch_response_at(now));
    }
    common_metrics::inc("rcache_cache_hits_total", &[], out.len() as u64);
    common_metrics::inc("rcache_cache_misses_total", &[], (digests.len() - out.len()) as u64);
    Ok(out)
}

async fn invalidate_blanket(pool: &PgPool, ruleset_ids: Option<&[String]>) -> Result<u64, sqlx::Error> {
    let result = match ruleset_ids {
        None => {
            sqlx::query("UPDATE response_cache SET state = 'invalid' WHERE state != 'invalid'")
                .execute(pool)
                .await?
        }
        Some(ids) => {
            sqlx::query(
                "UPDATE response_cache SET state = 'invalid' \
                 WHERE state != 'invalid' AND EXISTS ( \
                   SELECT 1 FROM unnest(string_to_array(rulesets, '|')) AS r(ruleset) \
                   WHERE r.ruleset = ANY($1::text[]) \
                 )",
            )
            .bind(ids)
            .execute(pool)
            .await?
        }
    };
    Ok(result.rows_affected())
}

async fn upsert_batch(pool: &PgPool, triples: &[UpdateTriple]) -> Result<usize, sqlx::Error> {
    let mut serials = Vec::new();
    let mut rulesets = Vec::new();
    let mut cert_ids = Vec::new();
    let mut digests = Vec::new();
    let mut config_rulesets = Vec::new();
    let mut lats = Vec::new();
    let mut lons = Vec::new();
    let mut validity: Vec<Option<i64>> = Vec::new();
    let mut requests = Vec::new();
    let mut responses = Vec::new();
    let mut update_times: Vec<DateTime<Utc>> = Vec::new();
    let now = Utc::now();

    for triple in triples {
        // Updates with unsuccessful response codes are dropped.
        if !inspect::response_code_success(&triple.response) {
            continue;
        }
        let Some(serial) = inspect::serial_number(&triple.request) else {
            continue;
        };
        let certs = inspect::certification_ids(&triple.request);
        if certs.is_empty() {
            continue;
        }
        let Some(location) = inspect::location(&triple.request).and_then(als_model::location::derive)
        else {
            continue;
        };

        let rulesets_joined = certs.iter().map(|(r, _)| r.as_str()).collect::<Vec<_>>().join("|");
        let cert_ids_joined = certs.iter().map(|(_, c)| c.as_str()).collect::<Vec<_>>().join("|");
        let validity_secs = inspect::availability_expire_time(&triple.response)
            .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
            .map(|expire| (expire.with_timezone(&Utc) - now).num_seconds());

        serials.push(serial.to_string());
        rulesets.push(rulesets_joined);
        cert_ids.push(cert_ids_joined);
        digests.push(triple.req_cfg_digest.clone());
        config_rulesets.push(certs[0].0.clone());
        lats.push(location.center.lat);
        lons.push(location.center.lon);
        validity.push(validity_secs);
        requests.push(triple.request.clone());
        responses.push(triple.response.clone());
        update_times.push(now);
    }

    if serials.is_empty() {
        return Ok(0);
    }

    let states: Vec<&str> = serials.iter().map(|_| "valid").collect();

    let query_start = Instant::now();
    sqlx::query(
        "INSERT INTO response_cache \
         (serial_number, rulesets, cert_ids, req_cfg_digest, state, config_ruleset, lat, lon, \
          last_update, validity_period_seconds, request, response) \
         SELECT * FROM UNNEST($1::text[], $2::text[], $3::text[], $4::text[], $5::text[], $6::text[], \
                              $7::float8[], $8::float8[], $9::timestamptz[], $10::bigint[], \
                              $11::jsonb[], $12::jsonb[]) \
         ON CONFLICT (serial_number, rulesets, cert_ids) DO UPDATE SET \
           req_cfg_digest = EXCLUDED.req_cfg_digest, \
           state = EXCLUDED.state, \
           config_ruleset = EXCLUDED.config_ruleset, \
           lat = EXCLUDED.lat, \
           lon = EXCLUDED.lon, \
           last_update = EXCLUDED.last_update, \
           validity_period_seconds = EXCLUDED.validity_period_seconds, \
           request = EXCLUDED.request, \
           response = EXCLUDED.response",
    )
    .bind(&serials)
    .bind(&rulesets)
    .bind(&cert_ids)
    .bind(&digests)
    .bind(&states)
    .bind(&config_rulesets)
    .bind(&lats)
    .bind(&lons)
    .bind(&update_times)
    .bind(&validity)
    .bind(&requests)
    .bind(&responses)
    .execute(pool)
    .await?;
    common_metrics::histogram(
        "rcache_db_round_trip_ms",
        &[("op".to_string(), "upsert_batch".to_string())],
        query_start.elapsed().as_secs_f64() * 1000.0,
    );

    Ok(serials.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn dropped_when_response_code_unsuccessful() {
        let response = json!({"response": {"responseCode": -1}});
        assert!(!inspect::response_code_success(&response));
    }
}
