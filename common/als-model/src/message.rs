use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One of the three message kinds making up an ALS transaction bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlsDataType {
    AfcRequest,
    AfcResponse,
    AfcConfig,
}

/// The wire envelope of an ALS Kafka record (see ```OVERVIEW / 6.1 Kafka```).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AlsEnvelope {
    pub version: String,
    #[serde(rename = "afcServer")]
    pub afc_server: String,
    pub time: DateTime<Utc>,
    #[serde(rename = "dataType")]
    pub data_type: AlsDataType,
    #[serde(rename = "jsonData")]
    pub json_data: String,
    pub customer: Option<String>,
    #[serde(rename = "geoDataVersion")]
    pub geo_data_version: Option<String>,
    #[serde(rename = "ulsId")]
    pub uls_id: Option<String>,
    #[serde(rename = "requestIndexes", default)]
    pub request_indexes: Vec<usize>,
}

/// Kind-specific payload, parsed out of `jsonData`. Payloads are treated as opaque
/// JSON except for the handful of fields the core inspects (see GLOSSARY /
/// "Dynamic typing of JSON payloads").
#[derive(Debug, Clone)]
pub enum AlsPayload {
    Request(Value),
    Response(Value),
    Config(Value),
}

/// A single parsed ALS message, ready for bundle assembly.
#[derive(Debug, Clone)]
pub struct AlsMessage {
    pub envelope: AlsEnvelope,
    pub payload: AlsPayload,
}

#[derive(Debug, thiserror::Error)]
pub enum AlsParseError {
    #[error("malformed JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unsupported ALS protocol version {0:?}, expected 1.0")]
    VersionMismatch(String),
    #[error("config requestIndexes {indexes:?} out of range for request count {count}")]
    ConfigIndexOutOfRange { indexes: Vec<usize>, count: usize },
    #[error("missing required field: {0}")]
    MissingField(&'static str),
}

pub const SUPPORTED_VERSION: &str = "1.0";

impl AlsMessage {
    /// Parses a raw Kafka record value into an envelope + typed payload. Returns a
    /// `Protocol error` / `JSON format error` per §7 on any malformation; these are
    /// converted by the caller into `decode_error` rows before reaching the bundle
    /// assembler.
    pub fn parse(raw: &[u8]) -> Result<Self, AlsParseError> {
        let envelope: AlsEnvelope = serde_json::from_slice(raw)?;
        if envelope.version != SUPPORTED_VERSION {
            return Err(AlsParseError::VersionMismatch(envelope.version.clone()));
        }
        let inner: Value = serde_json::from_str(&envelope.json_data)?;
        let payload = match envelope.data_type {
            AlsDataType::AfcRequest => AlsPayload::Request(inner),
            AlsDataType::AfcResponse => AlsPayload::Response(inner),
            AlsDataType::AfcConfig => AlsPayload::Config(inner),
        };
        let msg = AlsMessage { envelope, payload };
        msg.validate()?;
        Ok(msg)
    }

    fn validate(&self) -> Result<(), AlsParseError> {
        if let AlsPayload::Config(_) = &self.payload {
            if self.envelope.customer.is_none() {
                return Err(AlsParseError::MissingField("customer"));
            }
            if self.envelope.geo_data_version.is_none() {
                return Err(AlsParseError::MissingField("geoDataVersion"));
            }
            if self.envelope.uls_id.is_none() {
                return Err(AlsParseError::MissingField("ulsId"));
            }
        }
        Ok(())
    }

    pub fn is_request(&self) -> bool {
        matches!(self.payload, AlsPayload::Request(_))
    }

    pub fn is_response(&self) -> bool {
        matches!(self.payload, AlsPayload::Response(_))
    }

    pub fn is_config(&self) -> bool {
        matches!(self.payload, AlsPayload::Config(_))
    }
}

/// Accessors over the inspected sub-paths of request/response/config payloads.
/// Everything else in the payload passes through as opaque bytes for storage.
pub mod inspect {
    use serde_json::Value;

    /// The `availableRequests`/`requestInfo` array length of an AFC request payload.
    /// Falls back to 1 (a single implicit request) when no array is present, which
    /// matches how a bare single-request transaction is represented on the wire.
    pub fn request_count(request: &Value) -> usize {
        request
            .get("availableSpectrumInquiryRequests")
            .and_then(Value::as_array)
            .map(|a| a.len())
            .unwrap_or(1)
    }

    pub fn response_code_success(response_item: &Value) -> bool {
        response_item
            .pointer("/response/responseCode")
            .and_then(Value::as_i64)
            .map(|code| code == 0)
            .unwrap_or(false)
    }

    pub fn availability_expire_time(response_item: &Value) -> Option<&str> {
        response_item
            .get("availabilityExpireTime")
            .and_then(Value::as_str)
    }

    pub fn certification_ids(request_item: &Value) -> Vec<(String, String)> {
        request_item
            .pointer("/deviceDescriptor/certificationId")
            .and_then(Value::as_array)
            .map(|arr| {
                arr.iter()
                    .filter_map(|c| {
                        let ruleset = c.get("rulesetId")?.as_str()?.to_string();
                        let id = c.get("id")?.as_str()?.to_string();
                        Some((ruleset, id))
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn device_descriptor(request_item: &Value) -> Option<&Value> {
        request_item.get("deviceDescriptor")
    }

    pub fn location(request_item: &Value) -> Option<&Value> {
        request_item.get("location")
    }

    pub fn serial_number(request_item: &Value) -> Option<&str> {
        request_item
            .pointer("/deviceDescriptor/serialNumber")
            .and_then(Value::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wrap(data_type: &str, json_data: &str, extra: &str) -> Vec<u8> {
        format!(
            r#"{{"version":"1.0","afcServer":"srv1","time":"2024-01-01T00:00:00Z","dataType":"{data_type}","jsonData":{json_data}{extra}}}"#,
        )
        .into_bytes()
    }

    #[test]
    fn parses_minimal_request() {
        let raw = wrap("AFC_REQUEST", r#""{\"requestId\":\"r1\"}""#, "");
        let msg = AlsMessage::parse(&raw).unwrap();
        assert!(msg.is_request());
    }

    #[test]
    fn rejects_bad_json_data() {
        let raw = wrap("AFC_REQUEST", r#""{oops""#, "");
        assert!(AlsMessage::parse(&raw).is_err());
    }

    #[test]
    fn rejects_version_mismatch() {
        let raw = br#"{"version":"2.0","afcServer":"s","time":"2024-01-01T00:00:00Z","dataType":"AFC_REQUEST","jsonData":"{}"}"#;
        assert!(matches!(
            AlsMessage::parse(raw),
            Err(AlsParseError::VersionMismatch(_))
        ));
    }

    #[test]
    fn config_requires_customer_geo_uls() {
        let raw = wrap("AFC_CONFIG", r#""{}""#, "");
        assert!(matches!(
            AlsMessage::parse(&raw),
            Err(AlsParseError::MissingField(_))
        ));
    }

    #[test]
    fn config_parses_with_required_fields() {
        let raw = wrap(
            "AFC_CONFIG",
            r#""{}""#,
            r#","customer":"acme","geoDataVersion":"g1","ulsId":"u1","requestIndexes":[0,1]"#,
        );
        let msg = AlsMessage::parse(&raw).unwrap();
        assert!(msg.is_config());
        assert_eq!(msg.envelope.request_indexes, vec![0, 1]);
    }
}
