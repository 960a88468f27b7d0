//! Consumer-side cache-write path (C9 fingerprinting + C7 update), active only
//! when `update_on_send = false`: rather than waiting on a producer to POST
//! `/update` with an already-computed digest, rcache consumes the ALS topic
//! itself, reassembles complete request/response/config bundles, computes each
//! inner request's fingerprint, and writes `response_cache` rows directly.
//!
//! Bundle assembly mirrors siphon's assembler (C2) and message updater's
//! request/response fan-out, pared down to what a cache write needs: no
//! per-message Kafka-position tracking, no `decode_error` table, no log-topic
//! handling — those are siphon's concerns.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use als_model::digest::fingerprint;
use als_model::message::{inspect, AlsMessage, AlsParseError, AlsPayload};
use chrono::{DateTime, Utc};
use common_health::HealthHandle;
use common_kafka::kafka_consumer::{OwnedRecord, TrackedConsumer};
use serde_json::Value;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::store::{CacheStore, UpdateTriple};

const MAX_RECORDS_PER_POLL: usize = 1000;
const IDLE_POLL: Duration = Duration::from_secs(1);

struct Bundle {
    request: Option<AlsMessage>,
    response: Option<AlsMessage>,
    /// `None` index = catch-all config (applies to every request).
    configs: HashMap<Option<usize>, AlsMessage>,
    last_update: DateTime<Utc>,
}

impl Bundle {
    fn new(now: DateTime<Utc>) -> Self {
        Self { request: None, response: None, configs: HashMap::new(), last_update: now }
    }

    fn request_count(&self) -> usize {
        match &self.request {
            Some(AlsMessage { payload: AlsPayload::Request(v), .. }) => inspect::request_count(v),
            _ => 0,
        }
    }

    fn is_complete(&self) -> bool {
        if self.request.is_none() || self.response.is_none() {
            return false;
        }
        let n = self.request_count();
        if self.configs.contains_key(&None) {
            return self.configs.len() == 1;
        }
        if self.configs.len() != n {
            return false;
        }
        (0..n).all(|i| self.configs.contains_key(&Some(i)))
    }

    fn ingest(&mut self, msg: AlsMessage, now: DateTime<Utc>) -> Result<(), AlsParseError> {
        self.last_update = now;
        match &msg.payload {
            AlsPayload::Request(_) => {
                if self.request.is_none() {
                    self.request = Some(msg);
                }
            }
            AlsPayload::Response(_) => {
                if self.response.is_none() {
                    self.response = Some(msg);
                }
            }
            AlsPayload::Config(_) => {
                let idx = if msg.envelope.request_indexes.is_empty() {
                    None
                } else {
                    for i in &msg.envelope.request_indexes[1..] {
                        self.configs.insert(Some(*i), msg.clone());
                    }
                    Some(msg.envelope.request_indexes[0])
                };
                self.configs.insert(idx, msg);
            }
        }
        self.check_config_indexes()
    }

    fn check_config_indexes(&self) -> Result<(), AlsParseError> {
        let count = self.request_count();
        if self.request.is_none() || count == 0 {
            return Ok(());
        }
        let out_of_range: Vec<usize> = self.configs.keys().filter_map(|k| *k).filter(|i| *i >= count).collect();
        if out_of_range.is_empty() {
            Ok(())
        } else {
            Err(AlsParseError::ConfigIndexOutOfRange { indexes: out_of_range, count })
        }
    }
}

/// Splits a complete bundle into one `(request_item, response_item, config_text)`
/// triple per inner request, the same fan-out siphon's message updater performs.
fn inner_triples(bundle: &Bundle) -> Vec<(Value, Value, String)> {
    let Some(AlsMessage { payload: AlsPayload::Request(req_json), .. }) = &bundle.request else {
        return Vec::new();
    };
    let Some(AlsMessage { payload: AlsPayload::Response(resp_json), .. }) = &bundle.response else {
        return Vec::new();
    };

    let requests = req_json
        .get("availableSpectrumInquiryRequests")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_else(|| vec![req_json.clone()]);
    let responses = resp_json
        .get("availableSpectrumInquiryResponses")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_else(|| vec![resp_json.clone()]);

    requests
        .into_iter()
        .zip(responses)
        .enumerate()
        .filter_map(|(idx, (request_item, response_item))| {
            let config = bundle.configs.get(&Some(idx)).or_else(|| bundle.configs.get(&None))?;
            let AlsPayload::Config(config_json) = &config.payload else {
                return None;
            };
            let config_text = serde_json::to_string(config_json).ok()?;
            Some((request_item, response_item, config_text))
        })
        .collect()
}

/// Keyed bundle-in-progress tracker. Unlike siphon's `BundleAssembler`, offsets
/// aren't tracked per message: a bundle contributes to the next Kafka commit as
/// soon as any of its messages have been polled, since losing a half-built
/// bundle on restart just means it's rebuilt from Kafka's retained history
/// (cache population is a best-effort side channel, not the system of record).
struct BundleTracker {
    bundles: HashMap<Vec<u8>, Bundle>,
    order: Vec<Vec<u8>>,
}

impl BundleTracker {
    fn new() -> Self {
        Self { bundles: HashMap::new(), order: Vec::new() }
    }

    fn ingest(&mut self, key: Vec<u8>, msg: AlsMessage, now: DateTime<Utc>) {
        if !self.bundles.contains_key(&key) {
            self.order.push(key.clone());
            self.bundles.insert(key.clone(), Bundle::new(now));
        }
        let bundle = self.bundles.get_mut(&key).expect("just inserted");
        if let Err(e) = bundle.ingest(msg, now) {
            warn!(error = %e, "dropping bundle with out-of-range config index on cache-write consumer path");
            self.bundles.remove(&key);
            self.order.retain(|k| k != &key);
        }
    }

    fn fetch_complete(&mut self) -> Vec<Bundle> {
        let mut out = Vec::new();
        let mut remaining = Vec::with_capacity(self.order.len());
        for key in self.order.drain(..) {
            match self.bundles.get(&key) {
                Some(b) if b.is_complete() => out.push(self.bundles.remove(&key).expect("checked above")),
                Some(_) => remaining.push(key),
                None => {}
            }
        }
        self.order = remaining;
        out
    }

    fn expire(&mut self, now: DateTime<Utc>, max_age: chrono::Duration) {
        let cutoff = now - max_age;
        let mut remaining = Vec::with_capacity(self.order.len());
        for key in self.order.drain(..) {
            match self.bundles.get(&key) {
                Some(b) if b.last_update < cutoff => {
                    self.bundles.remove(&key);
                }
                Some(_) => remaining.push(key),
                None => {}
            }
        }
        self.order = remaining;
    }

    fn len(&self) -> usize {
        self.bundles.len()
    }
}

/// Drives the consumer-side cache write when `update_on_send = false`.
pub struct CacheConsumerLoop {
    consumer: Arc<TrackedConsumer>,
    store: CacheStore,
    als_topic: String,
    max_age: chrono::Duration,
    health: Option<HealthHandle>,
}

impl CacheConsumerLoop {
    pub fn new(
        consumer: Arc<TrackedConsumer>,
        store: CacheStore,
        als_topic: String,
        max_age_sec: u64,
        health: Option<HealthHandle>,
    ) -> Self {
        Self {
            consumer,
            store,
            als_topic,
            max_age: chrono::Duration::seconds(max_age_sec as i64),
            health,
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut tracker = BundleTracker::new();
        let mut idle = true;

        loop {
            if *shutdown.borrow() {
                info!("rcache consumer loop shutting down");
                return;
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
                health.report_healthy().await;
            }

            let now = Utc::now();
            let mut watermarks: HashMap<(String, i32), i64> = HashMap::new();
            for record in &records {
                watermarks
                    .entry((record.topic.clone(), record.partition))
                    .and_modify(|o| *o = (*o).max(record.offset))
                    .or_insert(record.offset);

                if record.topic != self.als_topic {
                    continue;
                }
                let Some(payload) = &record.payload else { continue };
                match AlsMessage::parse(payload) {
                    Ok(msg) => tracker.ingest(record.key.clone().unwrap_or_default(), msg, now),
                    Err(e) => warn!(error = %e, "failed to parse ALS message on cache-write consumer path"),
                }
            }

            let complete = tracker.fetch_complete();
            let mut accepted_total = 0usize;
            for bundle in &complete {
                let triples: Vec<UpdateTriple> = inner_triples(bundle)
                    .into_iter()
                    .map(|(request, response, config_text)| UpdateTriple {
                        req_cfg_digest: fingerprint(&request, &config_text),
                        request,
                        response,
                    })
                    .collect();
                accepted_total += self.store.enqueue_update(triples);
            }
            if accepted_total > 0 {
                common_metrics::inc("rcache_consumer_cache_writes_total", &[], accepted_total as u64);
            }

            tracker.expire(now, self.max_age);
            common_metrics::gauge("rcache_consumer_bundle_queue_depth", &[], tracker.len() as f64);

            if !watermarks.is_empty() {
                let commits: Vec<(String, i32, i64)> =
                    watermarks.into_iter().map(|((topic, partition), offset)| (topic, partition, offset)).collect();
                if let Err(e) = self.consumer.commit(&commits) {
                    warn!(error = ?e, "kafka commit failed on cache-write consumer path, will retry next iteration");
                }
            }

            idle = records.is_empty() && complete.is_empty();
        }
    }

    async fn poll_once(&self, long: bool) -> Vec<OwnedRecord> {
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
}

#[cfg(test)]
mod tests {
    use super::*;
    use als_model::message::{AlsDataType, AlsEnvelope};
    use serde_json::json;

    fn msg(data_type: &str, json_data: Value, indexes: Vec<usize>) -> AlsMessage {
        let data_type = match data_type {
            "req" => AlsDataType::AfcRequest,
            "resp" => AlsDataType::AfcResponse,
            _ => AlsDataType::AfcConfig,
        };
        let payload = match data_type {
            AlsDataType::AfcRequest => AlsPayload::Request(json_data),
            AlsDataType::AfcResponse => AlsPayload::Response(json_data),
            AlsDataType::AfcConfig => AlsPayload::Config(json_data),
        };
        AlsMessage {
            envelope: AlsEnvelope {
                version: "1.0".into(),
                afc_server: "srv".into(),
                time: Utc::now(),
                data_type,
                json_data: String::new(),
                customer: Some("acme".into()),
                geo_data_version: Some("g1".into()),
                uls_id: Some("u1".into()),
                request_indexes: indexes,
            },
            payload,
        }
    }

    #[test]
    fn single_request_bundle_completes_and_splits_into_one_triple() {
        let mut tracker = BundleTracker::new();
        let now = Utc::now();
        let key = b"k1".to_vec();
        tracker.ingest(key.clone(), msg("req", json!({"requestId": "r1"}), vec![]), now);
        tracker.ingest(key.clone(), msg("cfg", json!({"regionStr": "US"}), vec![]), now);
        tracker.ingest(key.clone(), msg("resp", json!({"response": {"responseCode": 0}}), vec![]), now);

        let complete = tracker.fetch_complete();
        assert_eq!(complete.len(), 1);
        let triples = inner_triples(&complete[0]);
        assert_eq!(triples.len(), 1);
        assert_eq!(triples[0].0["requestId"], "r1");
    }

    #[test]
    fn multi_request_bundle_pairs_by_index() {
        let mut tracker = BundleTracker::new();
        let now = Utc::now();
        let key = b"k2".to_vec();
        let two_requests = json!({"availableSpectrumInquiryRequests": [{"requestId": "a"}, {"requestId": "b"}]});
        let two_responses = json!({"availableSpectrumInquiryResponses": [{"response": {"responseCode": 0}}, {"response": {"responseCode": 0}}]});
        tracker.ingest(key.clone(), msg("req", two_requests, vec![]), now);
        tracker.ingest(key.clone(), msg("resp", two_responses, vec![]), now);
        tracker.ingest(key.clone(), msg("cfg", json!({"regionStr": "US"}), vec![0]), now);
        tracker.ingest(key.clone(), msg("cfg", json!({"regionStr": "CA"}), vec![1]), now);

        let complete = tracker.fetch_complete();
        assert_eq!(complete.len(), 1);
        let triples = inner_triples(&complete[0]);
        assert_eq!(triples.len(), 2);
        assert_eq!(triples[0].0["requestId"], "a");
        assert!(triples[0].2.contains("US"));
        assert_eq!(triples[1].0["requestId"], "b");
        assert!(triples[1].2.contains("CA"));
    }

    #[test]
    fn fingerprint_is_computed_per_inner_request() {
        let mut tracker = BundleTracker::new();
        let now = Utc::now();
        let key = b"k3".to_vec();
        tracker.ingest(key.clone(), msg("req", json!({"requestId": "r1", "a": 1}), vec![]), now);
        tracker.ingest(key.clone(), msg("cfg", json!({"regionStr": "US"}), vec![]), now);
        tracker.ingest(key.clone(), msg("resp", json!({"response": {"responseCode": 0}}), vec![]), now);

        let complete = tracker.fetch_complete();
        let (request, _, config_text) = inner_triples(&complete[0]).into_iter().next().unwrap();
        let fp1 = fingerprint(&request, &config_text);
        let differently_ordered = json!({"a": 1, "requestId": "different"});
        let fp2 = fingerprint(&differently_ordered, &config_text);
        assert_eq!(fp1, fp2);
    }

    #[test]
    fn out_of_range_config_index_drops_bundle() {
        let mut tracker = BundleTracker::new();
        let now = Utc::now();
        let key = b"k4".to_vec();
        let two_requests = json!({"availableSpectrumInquiryRequests": [{}, {}]});
        tracker.ingest(key.clone(), msg("req", two_requests, vec![]), now);
        tracker.ingest(key.clone(), msg("cfg", json!({}), vec![5]), now);
        assert!(tracker.bundles.is_empty());
    }

    #[test]
    fn incomplete_bundle_expires_after_max_age() {
        let mut tracker = BundleTracker::new();
        let now = Utc::now();
        let key = b"k5".to_vec();
        tracker.ingest(key.clone(), msg("req", json!({}), vec![]), now);

        tracker.expire(now, chrono::Duration::seconds(1000));
        assert_eq!(tracker.len(), 1);

        let later = now + chrono::Duration::seconds(1001);
        tracker.expire(later, chrono::Duration::seconds(1000));
        assert_eq!(tracker.len(), 0);
    }
}
