//! Siphon loop (C5): poll Kafka, dispatch ALS vs. log messages, drive the
//! bundle assembler and table updaters, advance Kafka watermarks, commit
//! offsets, and emit periodic progress reports.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use als_model::message::AlsMessage;
use als_model::month::current_month_idx;
use chrono::Utc;
use common_health::HealthHandle;
use common_kafka::kafka_consumer::TrackedConsumer;
use regex::Regex;
use sqlx::PgPool;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::assembler::BundleAssembler;
use crate::lookups::Lookups;
use crate::logtopics;
use crate::position::KafkaPositions;
use crate::updaters::decode_error::{self, DecodeErrorRow};
use crate::updaters::message::MessageUpdater;

const MAX_RECORDS_PER_POLL: usize = 1000;
const IDLE_POLL: Duration = Duration::from_secs(1);
const WATERMARK_FETCH_TIMEOUT: Duration = Duration::from_secs(2);

/// One health handle per component named in the health-reporting surface:
/// `kafka_consumer` degrades on repeated poll failures, `database` on
/// repeated table-update failures, `bundle_assembler` reports healthy every
/// iteration the assembler runs (it has no failure mode of its own).
pub struct SiphonHealth {
    pub kafka_consumer: HealthHandle,
    pub database: HealthHandle,
    pub bundle_assembler: HealthHandle,
}

pub struct SiphonLoop {
    consumer: Arc<TrackedConsumer>,
    pool: PgPool,
    lookups: Lookups,
    positions: KafkaPositions,
    assembler: BundleAssembler,
    als_topic: String,
    exclude_re: Regex,
    max_age: chrono::Duration,
    max_bundles_per_batch: usize,
    progress_interval: Duration,
    health: Option<SiphonHealth>,
    last_commits: HashMap<(String, i32), i64>,
}

#[derive(Default, Debug)]
struct ProgressCounters {
    messages: u64,
    bundles_persisted: u64,
    bundles_expired: u64,
    decode_errors: u64,
}

impl SiphonLoop {
    pub fn new(
        consumer: Arc<TrackedConsumer>,
        pool: PgPool,
        als_topic: String,
        exclude_pattern: &str,
        max_age_sec: u64,
        max_bundles_per_batch: usize,
        progress_interval: Duration,
        health: Option<SiphonHealth>,
    ) -> Result<Self, regex::Error> {
        Ok(Self {
            consumer,
            pool,
            lookups: Lookups::new(),
            positions: KafkaPositions::new(),
            assembler: BundleAssembler::new(),
            als_topic,
            exclude_re: Regex::new(exclude_pattern)?,
            max_age: chrono::Duration::seconds(max_age_sec as i64),
            max_bundles_per_batch,
            progress_interval,
            health,
            last_commits: HashMap::new(),
        })
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let mut counters = ProgressCounters::default();
        let mut last_report = Instant::now();
        let mut idle = true;

        loop {
            if *shutdown.borrow() {
                info!("siphon loop shutting down");
                return Ok(());
            }

            let records = if idle {
                tokio::select! {
                    _ = shutdown.changed() => continue,
                    records = self.poll_once(true) => records,
                }
            } else {
                self.poll_once(false).await
            };
            if let Some(health) = &self.health {
                health.kafka_consumer.report_healthy().await;
            }

            let now = Utc::now();
            let mut log_buffers: HashMap<String, Vec<Vec<u8>>> = HashMap::new();
            let mut log_positions: HashMap<String, Vec<crate::position::KafkaPosition>> = HashMap::new();

            for record in &records {
                counters.messages += 1;
                let pos = self.positions.add(&record.topic, record.partition, record.offset);

                if record.topic == self.als_topic {
                    let Some(payload) = &record.payload else {
                        self.positions.mark_processed(pos);
                        continue;
                    };
                    match AlsMessage::parse(payload) {
                        Ok(msg) => {
                            let key = record.key.clone().unwrap_or_default();
                            if let Some((bad_bundle, err)) = self.assembler.ingest(key, msg, pos, now) {
                                counters.decode_errors += 1;
                                common_metrics::inc("siphon_decode_errors_total", &[], 1);
                                self.record_decode_error("config_index_out_of_range", &err.to_string(), None)
                                    .await;
                                for bad_pos in &bad_bundle.positions {
                                    self.positions.mark_processed(*bad_pos);
                                }
                            }
                        }
                        Err(e) => {
                            counters.decode_errors += 1;
                            common_metrics::inc("siphon_decode_errors_total", &[], 1);
                            self.record_decode_error("parse_error", &e.to_string(), record.payload.clone())
                                .await;
                            self.positions.mark_processed(pos);
                        }
                    }
                } else if self.exclude_re.is_match(&record.topic) {
                    if let Some(payload) = &record.payload {
                        log_buffers.entry(record.topic.clone()).or_default().push(payload.clone());
                    }
                    log_positions.entry(record.topic.clone()).or_default().push(pos);
                } else {
                    // Neither the ALS topic nor a log-exclusion match; nothing
                    // in this deployment subscribes to it, so just advance past it.
                    self.positions.mark_processed(pos);
                }
            }

            for (topic, values) in log_buffers {
                match logtopics::flush_batch(&self.pool, &topic, &values).await {
                    Ok(n) => info!(topic, count = n, "flushed log topic batch"),
                    Err(e) => error!(topic, error = %e, "failed to flush log topic batch"),
                }
                if let Some(positions) = log_positions.remove(&topic) {
                    for pos in positions {
                        self.positions.mark_processed(pos);
                    }
                }
            }

            let complete = self.assembler.fetch_complete(self.max_bundles_per_batch, usize::MAX);
            if !complete.is_empty() {
                let month_idx = current_month_idx();
                let db_call_start = Instant::now();
                let db_result = MessageUpdater::update_db(&self.pool, &self.lookups, &complete, month_idx).await;
                common_metrics::histogram(
                    "siphon_db_round_trip_ms",
                    &[("op".to_string(), "bundle_update".to_string())],
                    db_call_start.elapsed().as_secs_f64() * 1000.0,
                );
                let commit_positions = match db_result {
                    Ok(()) => {
                        counters.bundles_persisted += complete.len() as u64;
                        common_metrics::inc("siphon_bundles_persisted_total", &[], complete.len() as u64);
                        if let Some(health) = &self.health {
                            health.database.report_healthy().await;
                        }
                        true
                    }
                    Err(e) if common_database::is_transient_error(&e) => {
                        // Leave this batch's offsets uncommitted: Kafka redelivers the
                        // same messages, the bundle reassembles identically, and the
                        // content-digest upserts make re-insertion a no-op.
                        warn!(error = %e, "transient table update failure, leaving bundle uncommitted for retry");
                        self.lookups.invalidate_all();
                        false
                    }
                    Err(e) => {
                        warn!(error = %e, "table update failed, rolling back and invalidating lookups");
                        self.lookups.invalidate_all();
                        counters.decode_errors += 1;
                        common_metrics::inc("siphon_decode_errors_total", &[], 1);
                        self.record_decode_error("table_update_failed", &e.to_string(), None).await;
                        true
                    }
                };
                if commit_positions {
                    for bundle in &complete {
                        for pos in &bundle.positions {
                            self.positions.mark_processed(*pos);
                        }
                    }
                }
            }

            let expired = self.assembler.expire(now, self.max_age);
            if !expired.is_empty() {
                counters.bundles_expired += expired.len() as u64;
                common_metrics::inc("siphon_bundles_expired_total", &[], expired.len() as u64);
                for bundle in &expired {
                    self.record_decode_error(
                        "bundle_expired",
                        &format!("bundle for key {:?} expired incomplete", bundle.key),
                        None,
                    )
                    .await;
                    for pos in &bundle.positions {
                        self.positions.mark_processed(*pos);
                    }
                }
            }

            let commits = self.positions.drain_commits();
            if !commits.is_empty() {
                if let Err(e) = self.consumer.commit(&commits) {
                    warn!(error = ?e, "kafka commit failed, will retry next iteration");
                } else {
                    for (topic, partition, offset) in &commits {
                        self.last_commits.insert((topic.clone(), *partition), *offset);
                    }
                }
            }

            if let Some(health) = &self.health {
                health.bundle_assembler.report_healthy().await;
            }

            common_metrics::gauge("siphon_bundle_queue_depth", &[], self.assembler.len() as f64);

            if last_report.elapsed() >= self.progress_interval {
                info!(
                    messages = counters.messages,
                    bundles_persisted = counters.bundles_persisted,
                    bundles_expired = counters.bundles_expired,
                    decode_errors = counters.decode_errors,
                    in_flight_bundles = self.assembler.len(),
                    "siphon progress report"
                );
                self.report_kafka_lag().await;
                last_report = Instant::now();
            }

            idle = records.is_empty() && complete.is_empty() && expired.is_empty();
        }
    }

    async fn poll_once(&self, long: bool) -> Vec<common_kafka::kafka_consumer::OwnedRecord> {
        let mut records = Vec::new();
        if long {
            if let Some(first) = self.consumer.recv_timeout(IDLE_POLL).await {
                match first {
                    Ok(record) => records.push(record),
                    Err(e) => {
                        warn!(error = ?e, "kafka receive error");
                        return records;
                    }
                }
            } else {
                return records;
            }
        }
        let remaining = MAX_RECORDS_PER_POLL.saturating_sub(records.len());
        for result in self.consumer.poll_batch(remaining).await {
            match result {
                Ok(record) => records.push(record),
                Err(e) => warn!(error = ?e, "kafka receive error"),
            }
        }
        records
    }

    /// Fetches the broker high watermark for every partition we've committed
    /// against and reports `high - committed` as consumer lag. One blocking
    /// metadata round-trip per partition, so this only runs on the progress
    /// report cadence rather than every loop iteration.
    async fn report_kafka_lag(&self) {
        for ((topic, partition), committed) in self.last_commits.clone() {
            let consumer = self.consumer.clone();
            let topic_for_fetch = topic.clone();
            let result = tokio::task::spawn_blocking(move || {
                consumer.fetch_watermarks(&topic_for_fetch, partition, WATERMARK_FETCH_TIMEOUT)
            })
            .await;
            match result {
                Ok(Ok((_low, high))) => {
                    let lag = (high - committed).max(0) as f64;
                    common_metrics::gauge(
                        "siphon_kafka_consumer_lag",
                        &[("topic".to_string(), topic), ("partition".to_string(), partition.to_string())],
                        lag,
                    );
                }
                Ok(Err(e)) => warn!(topic, partition, error = ?e, "failed to fetch kafka watermarks"),
                Err(e) => warn!(topic, partition, error = ?e, "watermark fetch task panicked"),
            }
        }
    }

    async fn record_decode_error(&self, kind: &'static str, detail: &str, raw_payload: Option<Vec<u8>>) {
        let row = DecodeErrorRow {
            kind,
            detail: detail.to_string(),
            raw_payload,
        };
        if let Err(e) = decode_error::insert(&self.pool, &row).await {
            error!(error = %e, "failed to record decode_error row");
        }
    }
}
