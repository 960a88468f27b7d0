//! Response cache and certification-resolver domain types shared between the
//! batcher, the cache store, and the certification resolver.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::geo::Point;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheState {
    Valid,
    Invalid,
    /// Invalidated but reserved for background recomputation rather than
    /// immediate reuse; see the precomputation quota launcher.
    Precomp,
}

/// Directed (point plus direction) spatial invalidation request: an FS/PR
/// receive point plus either a transmit point or a true azimuth toward it.
/// Exactly one of `tx_point`/`azimuth_to_tx_deg` must be set.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Beam {
    pub rx: Point,
    pub tx_point: Option<Point>,
    pub azimuth_to_tx_deg: Option<f64>,
}

impl Beam {
    /// True if the beam carries exactly one of a TX point or an azimuth, as
    /// the wire format requires.
    pub fn is_well_formed(&self) -> bool {
        self.tx_point.is_some() != self.azimuth_to_tx_deg.is_some()
    }
}

/// One ordered `(ruleset, cert_id)` pair taken from a request's certification list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Hash)]
pub struct RulesetCert {
    pub ruleset: String,
    pub cert_id: String,
}

/// Primary key material for `CacheEntry`: `(serial_number, rulesets, cert_ids)`
/// where `rulesets`/`cert_ids` are pipe-joined in certification-list order.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub serial_number: String,
    pub certs: Vec<RulesetCert>,
}

impl CacheKey {
    pub fn rulesets_joined(&self) -> String {
        self.certs
            .iter()
            .map(|c| c.ruleset.as_str())
            .collect::<Vec<_>>()
            .join("|")
    }

    pub fn cert_ids_joined(&self) -> String {
        self.certs
            .iter()
            .map(|c| c.cert_id.as_str())
            .collect::<Vec<_>>()
            .join("|")
    }
}

/// A single cached request/response pair, keyed by `req_cfg_digest`.
///
/// Invariants: `coordinates` is always present; `validity_period_seconds` is
/// `Some` only when the stored response carries a successful response code.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub fingerprint: String,
    pub serial_number: String,
    pub rulesets: Vec<String>,
    pub cert_ids: Vec<String>,
    pub state: CacheState,
    pub config_ruleset: String,
    pub coordinates: Point,
    pub last_update: DateTime<Utc>,
    pub validity_period_seconds: Option<i64>,
    pub request: serde_json::Value,
    pub response: serde_json::Value,
}

impl CacheEntry {
    /// Patches `response.availabilityExpireTime` to `now + validity_period_seconds`,
    /// formatted `YYYY-MM-DDTHH:MM:SSZ`. Omits the field entirely when no validity
    /// period is recorded, leaving the stored response otherwise untouched.
    pub fn patch_response_at(&self, now: DateTime<Utc>) -> serde_json::Value {
        let mut response = self.response.clone();
        let Some(secs) = self.validity_period_seconds else {
            if let serde_json::Value::Object(ref mut map) = response {
                map.remove("availabilityExpireTime");
            }
            return response;
        };
        let expire = now + chrono::Duration::seconds(secs);
        let formatted = expire.format("%Y-%m-%dT%H:%M:%SZ").to_string();
        if let serde_json::Value::Object(ref mut map) = response {
            map.insert(
                "availabilityExpireTime".to_string(),
                serde_json::Value::String(formatted),
            );
        }
        response
    }
}

/// Per-certification verdict returned by the certification resolver (C8).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CertVerdict {
    pub ruleset: String,
    pub cert_id: String,
    pub location_flags: Option<serde_json::Value>,
    pub cert_undefined: bool,
    pub cert_denied: bool,
    pub serial_denied: bool,
}

impl CertVerdict {
    /// A certification is denied when undefined, explicitly listed as denied, or
    /// the serial itself is on the deny list for that certification.
    pub fn is_denied(&self) -> bool {
        self.cert_undefined || self.cert_denied || self.serial_denied
    }
}

/// Aggregate allow/deny result for one `(serial, {(ruleset, cert_id)})` query.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AllowDeny {
    pub allowed: Vec<CertVerdict>,
    pub denied: Vec<CertVerdict>,
}

impl AllowDeny {
    pub fn from_verdicts(verdicts: Vec<CertVerdict>) -> Self {
        let mut out = AllowDeny::default();
        for v in verdicts {
            if v.is_denied() {
                out.denied.push(v);
            } else {
                out.allowed.push(v);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry(validity: Option<i64>) -> CacheEntry {
        CacheEntry {
            fingerprint: "fp".into(),
            serial_number: "sn".into(),
            rulesets: vec!["US_47_CFR_PART_15_SUBPART_E".into()],
            cert_ids: vec!["cert1".into()],
            state: CacheState::Valid,
            config_ruleset: "US_47_CFR_PART_15_SUBPART_E".into(),
            coordinates: Point { lat: 1.0, lon: 2.0 },
            last_update: Utc::now(),
            validity_period_seconds: validity,
            request: json!({}),
            response: json!({"availabilityExpireTime": "stale"}),
        }
    }

    #[test]
    fn patch_sets_expiry_from_validity_period() {
        let e = entry(Some(3600));
        let now = Utc::now();
        let patched = e.patch_response_at(now);
        let expected = (now + chrono::Duration::seconds(3600))
            .format("%Y-%m-%dT%H:%M:%SZ")
            .to_string();
        assert_eq!(patched["availabilityExpireTime"], expected);
    }

    #[test]
    fn patch_omits_expiry_when_no_validity_period() {
        let e = entry(None);
        let patched = e.patch_response_at(Utc::now());
        assert!(patched.get("availabilityExpireTime").is_none());
    }

    #[test]
    fn beam_requires_exactly_one_of_tx_point_or_azimuth() {
        let rx = Point { lat: 1.0, lon: 2.0 };
        let neither = Beam { rx, tx_point: None, azimuth_to_tx_deg: None };
        let both = Beam {
            rx,
            tx_point: Some(Point { lat: 3.0, lon: 4.0 }),
            azimuth_to_tx_deg: Some(45.0),
        };
        let azimuth_only = Beam { rx, tx_point: None, azimuth_to_tx_deg: Some(45.0) };
        assert!(!neither.is_well_formed());
        assert!(!both.is_well_formed());
        assert!(azimuth_only.is_well_formed());
    }

    #[test]
    fn cache_key_joins_in_cert_list_order() {
        let key = CacheKey {
            serial_number: "sn".into(),
            certs: vec![
                RulesetCert { ruleset: "A".into(), cert_id: "1".into() },
                RulesetCert { ruleset: "B".into(), cert_id: "2".into() },
            ],
        };
        assert_eq!(key.rulesets_joined(), "A|B");
        assert_eq!(key.cert_ids_joined(), "1|2");
    }

    #[test]
    fn allow_deny_partitions_verdicts() {
        let v1 = CertVerdict {
            ruleset: "A".into(),
            cert_id: "1".into(),
            location_flags: None,
            cert_undefined: false,
            cert_denied: false,
            serial_denied: false,
        };
        let mut v2 = v1.clone();
        v2.cert_undefined = true;
        let result = AllowDeny::from_verdicts(vec![v1, v2]);
        assert_eq!(result.allowed.len(), 1);
        assert_eq!(result.denied.len(), 1);
    }
}
