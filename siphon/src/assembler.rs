//! Bundle assembler (C2): groups Request/Response/Config messages sharing a Kafka
//! key into complete transaction bundles, and ages out incomplete ones.

use std::collections::HashMap;

use als_model::message::{inspect, AlsMessage, AlsParseError, AlsPayload};
use chrono::{DateTime, Utc};

use crate::position::KafkaPosition;

#[derive(Debug, Clone)]
pub struct Bundle {
    pub key: Vec<u8>,
    pub request: Option<AlsMessage>,
    pub response: Option<AlsMessage>,
    /// `None` index = catch-all config (applies to every request).
    pub configs: HashMap<Option<usize>, AlsMessage>,
    pub last_update: DateTime<Utc>,
    pub positions: Vec<KafkaPosition>,
}

impl Bundle {
    fn new(key: Vec<u8>, now: DateTime<Utc>) -> Self {
        Self {
            key,
            request: None,
            response: None,
            configs: HashMap::new(),
            last_update: now,
            positions: Vec::new(),
        }
    }

    fn request_count(&self) -> usize {
        match &self.request {
            Some(AlsMessage {
                payload: AlsPayload::Request(v),
                ..
            }) => inspect::request_count(v),
            _ => 0,
        }
    }

    /// Complete per §3.1: exactly one request, exactly one response, and a config
    /// set that is either a single catch-all or indexed `0..request_count`.
    pub fn is_complete(&self) -> bool {
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

    /// Returns `Err` the moment a config's `requestIndexes` is known to exceed
    /// the bundle's request count, whether that's discovered on the config's
    /// own arrival or revealed later by the request arriving.
    fn ingest(
        &mut self,
        msg: AlsMessage,
        pos: KafkaPosition,
        now: DateTime<Utc>,
    ) -> Result<(), AlsParseError> {
        self.last_update = now;
        self.positions.push(pos);
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
                    // One config message may carry several indexes; store once per
                    // index so completeness checking can look each up directly.
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

    /// Validates every currently-stored config index against the request count,
    /// if the request is already known; a no-op until then.
    fn check_config_indexes(&self) -> Result<(), AlsParseError> {
        let count = self.request_count();
        if self.request.is_none() || count == 0 {
            return Ok(());
        }
        let out_of_range: Vec<usize> = self
            .configs
            .keys()
            .filter_map(|k| *k)
            .filter(|i| *i >= count)
            .collect();
        if out_of_range.is_empty() {
            Ok(())
        } else {
            Err(AlsParseError::ConfigIndexOutOfRange {
                indexes: out_of_range,
                count,
            })
        }
    }
}

pub struct BundleAssembler {
    bundles: HashMap<Vec<u8>, Bundle>,
    /// Insertion order, used to give `expire` a stable iteration order.
    order: Vec<Vec<u8>>,
}

impl Default for BundleAssembler {
    fn default() -> Self {
        Self::new()
    }
}

impl BundleAssembler {
    pub fn new() -> Self {
        Self {
            bundles: HashMap::new(),
            order: Vec::new(),
        }
    }

    /// Ingests one message into its bundle. Returns `Some((bundle, error))` if
    /// this ingestion revealed an out-of-range config index — the bundle is
    /// dropped immediately (removed from the tracker) rather than left to
    /// expire, matching the caller's decode-error-and-commit handling for
    /// rejected messages.
    pub fn ingest(
        &mut self,
        key: Vec<u8>,
        msg: AlsMessage,
        pos: KafkaPosition,
        now: DateTime<Utc>,
    ) -> Option<(Bundle, AlsParseError)> {
        if !self.bundles.contains_key(&key) {
            self.order.push(key.clone());
            self.bundles.insert(key.clone(), Bundle::new(key.clone(), now));
        }
        let bundle = self.bundles.get_mut(&key).expect("just inserted");
        match bundle.ingest(msg, pos, now) {
            Ok(()) => None,
            Err(e) => {
                let bad = self.bundles.remove(&key).expect("just fetched");
                self.order.retain(|k| k != &key);
                Some((bad, e))
            }
        }
    }

    /// Removes and returns up to `max_bundles` complete bundles, capped at
    /// `max_requests` cumulative inner requests across the returned set.
    pub fn fetch_complete(&mut self, max_bundles: usize, max_requests: usize) -> Vec<Bundle> {
        let mut out = Vec::new();
        let mut request_budget = max_requests;
        let mut remaining_order = Vec::with_capacity(self.order.len());

        for key in self.order.drain(..) {
            if out.len() >= max_bundles {
                remaining_order.push(key);
                continue;
            }
            let Some(bundle) = self.bundles.get(&key) else {
                continue;
            };
            if !bundle.is_complete() {
                remaining_order.push(key);
                continue;
            }
            let n = bundle.request_count().max(1);
            if n > request_budget && !out.is_empty() {
                remaining_order.push(key);
                continue;
            }
            request_budget = request_budget.saturating_sub(n);
            out.push(self.bundles.remove(&key).expect("checked above"));
        }
        self.order = remaining_order;
        out
    }

    /// Removes and returns bundles whose last-update predates `now - max_age`.
    pub fn expire(&mut self, now: DateTime<Utc>, max_age: chrono::Duration) -> Vec<Bundle> {
        let cutoff = now - max_age;
        let mut expired = Vec::new();
        let mut remaining_order = Vec::with_capacity(self.order.len());
        for key in self.order.drain(..) {
            match self.bundles.get(&key) {
                Some(bundle) if bundle.last_update < cutoff => {
                    expired.push(self.bundles.remove(&key).expect("checked above"));
                }
                Some(_) => remaining_order.push(key),
                None => {}
            }
        }
        self.order = remaining_order;
        expired
    }

    pub fn len(&self) -> usize {
        self.bundles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bundles.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn msg(data_type: &str, json_data: serde_json::Value, indexes: Vec<usize>) -> AlsMessage {
        use als_model::message::{AlsDataType, AlsEnvelope};
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

    fn pos(offset: i64) -> KafkaPosition {
        KafkaPosition {
            topic_idx: 0,
            partition: 0,
            offset,
        }
    }

    #[test]
    fn single_request_catch_all_config_is_complete() {
        let mut assembler = BundleAssembler::new();
        let now = Utc::now();
        let key = b"k1".to_vec();
        assembler.ingest(key.clone(), msg("req", json!({"requestId": "r1"}), vec![]), pos(0), now);
        assembler.ingest(key.clone(), msg("cfg", json!({}), vec![]), pos(1), now);
        assembler.ingest(key.clone(), msg("resp", json!({}), vec![]), pos(2), now);

        let complete = assembler.fetch_complete(10, 10);
        assert_eq!(complete.len(), 1);
        assert_eq!(complete[0].key, key);
    }

    #[test]
    fn per_request_configs_require_full_index_coverage() {
        let mut assembler = BundleAssembler::new();
        let now = Utc::now();
        let key = b"k2".to_vec();
        let two_requests = json!({"availableSpectrumInquiryRequests": [{}, {}]});
        assembler.ingest(key.clone(), msg("req", two_requests, vec![]), pos(0), now);
        assembler.ingest(key.clone(), msg("cfg", json!({}), vec![0]), pos(1), now);
        assembler.ingest(key.clone(), msg("resp", json!({}), vec![]), pos(2), now);
        assert!(assembler.fetch_complete(10, 10).is_empty());

        assembler.ingest(key.clone(), msg("cfg", json!({}), vec![1]), pos(3), now);
        let complete = assembler.fetch_complete(10, 10);
        assert_eq!(complete.len(), 1);
    }

    #[test]
    fn out_of_range_config_index_drops_bundle_immediately() {
        let mut assembler = BundleAssembler::new();
        let now = Utc::now();
        let key = b"k5".to_vec();
        let two_requests = json!({"availableSpectrumInquiryRequests": [{}, {}]});
        assembler.ingest(key.clone(), msg("req", two_requests, vec![]), pos(0), now);
        let result = assembler.ingest(key.clone(), msg("cfg", json!({}), vec![5]), pos(1), now);
        let (bad_bundle, err) = result.expect("index 5 on a 2-request bundle must be rejected");
        assert_eq!(bad_bundle.key, key);
        assert!(matches!(err, AlsParseError::ConfigIndexOutOfRange { count: 2, .. }));
        assert!(assembler.is_empty());
        assert!(assembler.fetch_complete(10, 10).is_empty());
    }

    #[test]
    fn duplicate_request_is_discarded() {
        let mut assembler = BundleAssembler::new();
        let now = Utc::now();
        let key = b"k3".to_vec();
        assembler.ingest(key.clone(), msg("req", json!({"requestId": "first"}), vec![]), pos(0), now);
        assembler.ingest(key.clone(), msg("req", json!({"requestId": "second"}), vec![]), pos(1), now);
        assembler.ingest(key.clone(), msg("cfg", json!({}), vec![]), pos(2), now);
        assembler.ingest(key.clone(), msg("resp", json!({}), vec![]), pos(3), now);

        let complete = assembler.fetch_complete(10, 10);
        let req = complete[0].request.as_ref().unwrap();
        match &req.payload {
            AlsPayload::Request(v) => assert_eq!(v["requestId"], "first"),
            _ => unreachable!(),
        }
    }

    #[test]
    fn incomplete_bundle_expires_after_max_age() {
        let mut assembler = BundleAssembler::new();
        let now = Utc::now();
        let key = b"k4".to_vec();
        assembler.ingest(key.clone(), msg("req", json!({}), vec![]), pos(0), now);

        assert!(assembler.expire(now, chrono::Duration::seconds(1000)).is_empty());

        let later = now + chrono::Duration::seconds(1001);
        let expired = assembler.expire(later, chrono::Duration::seconds(1000));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].key, key);
        assert!(assembler.is_empty());
    }
}
