//! Precomputation hook: invalidated cache rows are optionally recomputed in
//! the background by dispatching fresh AFC requests, bounded by a
//! configurable concurrency quota. Orthogonal to lookup/update/invalidate;
//! the `Precomp` cache state and this quota-guarded launcher are the only
//! points where it touches the rest of the store.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use als_model::cache::CacheEntry;
use reqwest::Client;
use serde_json::Value;
use tokio::sync::Semaphore;
use tracing::{error, warn};

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
pub struct Precomputer {
    enabled: Arc<AtomicBool>,
    semaphore: Arc<tokio::sync::Mutex<Arc<Semaphore>>>,
    rate: Arc<Mutex<Ema>>,
    client: Client,
    afc_req_url: String,
    vendor_extension_keys: Vec<String>,
}

impl Precomputer {
    pub fn new(afc_req_url: String, quota: usize, vendor_extension_keys: Vec<String>) -> Self {
        Self {
            enabled: Arc::new(AtomicBool::new(true)),
            semaphore: Arc::new(tokio::sync::Mutex::new(Arc::new(Semaphore::new(quota.max(1))))),
            rate: Arc::new(Mutex::new(Ema::new(0.3))),
            client: Client::new(),
            afc_req_url,
            vendor_extension_keys,
        }
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub async fn set_quota(&self, quota: usize) {
        let mut guard = self.semaphore.lock().await;
        *guard = Arc::new(Semaphore::new(quota.max(1)));
    }

    pub fn rate_ema(&self) -> f64 {
        self.rate.lock().unwrap().value
    }

    /// Dispatches recomputation for one invalidated entry. No-ops if
    /// precomputation is disabled or no `afc_req_url` is configured.
    pub fn dispatch(&self, entry: CacheEntry) {
        if !self.enabled.load(Ordering::SeqCst) || self.afc_req_url.is_empty() {
            return;
        }
        let semaphore = self.semaphore.clone();
        let client = self.client.clone();
        let url = self.afc_req_url.clone();
        let vendor_keys = self.vendor_extension_keys.clone();
        let rate = self.rate.clone();
        tokio::spawn(async move {
            let current = semaphore.lock().await.clone();
            let Ok(_permit) = current.acquire_owned().await else {
                return;
            };
            let request = build_recompute_request(&entry, &vendor_keys);
            match client.post(&url).json(&request).send().await {
                Ok(resp) if resp.status().is_success() => rate.lock().unwrap().observe(1.0),
                Ok(resp) => warn!(status = %resp.status(), "precomputation request rejected"),
                Err(e) => error!(error = %e, "precomputation request failed"),
            }
        });
    }
}

/// Carries forward vendor-extension keys from the stale response into the
/// recomputation request, per `afc_state_vendor_extensions`.
fn build_recompute_request(entry: &CacheEntry, vendor_extension_keys: &[String]) -> Value {
    let mut request = entry.request.clone();
    if let Value::Object(ref mut map) = request {
        if let Value::Object(response_map) = &entry.response {
            for key in vendor_extension_keys {
                if let Some(v) = response_map.get(key) {
                    map.insert(key.clone(), v.clone());
                }
            }
        }
    }
    request
}

#[cfg(test)]
mod tests {
    use super::*;
    use als_model::cache::CacheState;
    use chrono::Utc;
    use serde_json::json;

    fn entry() -> CacheEntry {
        CacheEntry {
            fingerprint: "fp".into(),
            serial_number: "sn".into(),
            rulesets: vec!["US_47_CFR_PART_15_SUBPART_E".into()],
            cert_ids: vec!["cert1".into()],
            state: CacheState::Precomp,
            config_ruleset: "US_47_CFR_PART_15_SUBPART_E".into(),
            coordinates: als_model::geo::Point { lat: 1.0, lon: 2.0 },
            last_update: Utc::now(),
            validity_period_seconds: Some(3600),
            request: json!({"requestId": "r1"}),
            response: json!({"requestId": "r1", "vendorExtension": "x"}),
        }
    }

    #[test]
    fn propagates_configured_vendor_extension_keys() {
        let request = build_recompute_request(&entry(), &["vendorExtension".to_string()]);
        assert_eq!(request["vendorExtension"], "x");
    }

    #[test]
    fn leaves_request_untouched_when_no_keys_configured() {
        let request = build_recompute_request(&entry(), &[]);
        assert!(request.get("vendorExtension").is_none());
    }
}
