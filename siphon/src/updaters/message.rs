//! `afc_message` + `request_response_in_message` (C4): the top-level per-bundle
//! entry point. Ties a complete `Bundle` to its envelope rows and fans out each
//! inner request/response pair to the `request_response` updater.

use als_model::message::{inspect, AlsMessage, AlsPayload};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{Connection, PgPool, Row};
use uuid::Uuid;

use crate::assembler::Bundle;
use crate::lookups::Lookups;
use crate::updaters::{envelope, request_response};
use crate::updaters::request_response::RequestResponseInput;

pub struct MessageUpdater;

struct BundleEnvelopes {
    rx_digest: Uuid,
    tx_digest: Uuid,
    rx_time: DateTime<Utc>,
    tx_time: DateTime<Utc>,
    afc_server: String,
}

fn envelopes_for(bundle: &Bundle) -> Option<BundleEnvelopes> {
    let request = bundle.request.as_ref()?;
    let response = bundle.response.as_ref()?;
    let AlsPayload::Request(req_json) = &request.payload else {
        return None;
    };
    let AlsPayload::Response(resp_json) = &response.payload else {
        return None;
    };
    Some(BundleEnvelopes {
        rx_digest: envelope::digest_for(&envelope::strip_request_array(req_json)),
        tx_digest: envelope::digest_for(&envelope::strip_response_array(resp_json)),
        rx_time: request.envelope.time,
        tx_time: response.envelope.time,
        afc_server: response.envelope.afc_server.clone(),
    })
}

/// A single inner request/response pair plus the config text that applies to it.
struct InnerTransaction {
    index: usize,
    request_item: Value,
    response_item: Value,
    config_text: String,
    customer: String,
    uls_id: String,
    geo_data_version: String,
}

fn inner_transactions(bundle: &Bundle) -> Vec<InnerTransaction> {
    let Some(AlsMessage {
        payload: AlsPayload::Request(req_json),
        ..
    }) = &bundle.request
    else {
        return Vec::new();
    };
    let Some(AlsMessage {
        payload: AlsPayload::Response(resp_json),
        ..
    }) = &bundle.response
    else {
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
            let config = bundle
                .configs
                .get(&Some(idx))
                .or_else(|| bundle.configs.get(&None))?;
            let AlsPayload::Config(config_json) = &config.payload else {
                return None;
            };
            Some(InnerTransaction {
                index: idx,
                request_item,
                response_item,
                config_text: serde_json::to_string(config_json).ok()?,
                customer: config.envelope.customer.clone().unwrap_or_default(),
                uls_id: config.envelope.uls_id.clone().unwrap_or_default(),
                geo_data_version: config.envelope.geo_data_version.clone().unwrap_or_default(),
            })
        })
        .collect()
}

impl MessageUpdater {
    /// Persists a batch of complete bundles. The batch-wide lookup pre-cascade
    /// (`afc_server`, both envelope tables) runs against a single acquired
    /// connection; each bundle's own cascade — its `afc_message` row and every
    /// inner `request_response`/`request_response_in_message` row it fans out
    /// to — runs inside its own transaction, so a failure partway through one
    /// bundle's cascade rolls back only that bundle, never a partial commit of
    /// an unrelated one.
    pub async fn update_db(
        pool: &PgPool,
        lookups: &Lookups,
        bundles: &[Bundle],
        month_idx: i32,
    ) -> Result<(), sqlx::Error> {
        if bundles.is_empty() {
            return Ok(());
        }

        let mut conn = pool.acquire().await?;

        let envelopes: Vec<Option<BundleEnvelopes>> = bundles.iter().map(envelopes_for).collect();

        let afc_servers: Vec<String> = envelopes
            .iter()
            .filter_map(|e| e.as_ref().map(|e| e.afc_server.clone()))
            .collect();
        lookups.afc_server.update_db(&mut conn, &afc_servers, month_idx).await?;

        let rx_items: Vec<(Uuid, Value)> = bundles
            .iter()
            .filter_map(|b| match &b.request {
                Some(AlsMessage {
                    payload: AlsPayload::Request(v),
                    ..
                }) => Some((envelope::digest_for(&envelope::strip_request_array(v)), envelope::strip_request_array(v))),
                _ => None,
            })
            .collect();
        envelope::update_rx(&mut conn, &rx_items, month_idx).await?;

        let tx_items: Vec<(Uuid, Value)> = bundles
            .iter()
            .filter_map(|b| match &b.response {
                Some(AlsMessage {
                    payload: AlsPayload::Response(v),
                    ..
                }) => Some((envelope::digest_for(&envelope::strip_response_array(v)), envelope::strip_response_array(v))),
                _ => None,
            })
            .collect();
        envelope::update_tx(&mut conn, &tx_items, month_idx).await?;

        for (bundle, env) in bundles.iter().zip(envelopes.iter()) {
            let Some(env) = env else { continue };
            let afc_server_id = lookups
                .afc_server
                .key_for(&env.afc_server)
                .ok_or_else(|| sqlx::Error::RowNotFound)?;

            let mut tx = conn.begin().await?;

            let message_id: i32 = sqlx::query(
                "INSERT INTO afc_message (rx_envelope_id, tx_envelope_id, rx_time, tx_time, afc_server_id, month_idx) \
                 VALUES ($1, $2, $3, $4, $5, $6) \
                 ON CONFLICT (rx_envelope_id, tx_envelope_id, rx_time, tx_time, afc_server_id) DO UPDATE \
                   SET rx_envelope_id = EXCLUDED.rx_envelope_id \
                 RETURNING id",
            )
            .bind(env.rx_digest)
            .bind(env.tx_digest)
            .bind(env.rx_time)
            .bind(env.tx_time)
            .bind(afc_server_id)
            .bind(month_idx)
            .fetch_one(&mut *tx)
            .await?
            .try_get("id")?;

            let transactions = inner_transactions(bundle);
            let rr_inputs: Vec<(Uuid, RequestResponseInput)> = transactions
                .iter()
                .map(|t| {
                    let input = RequestResponseInput {
                        request_item: t.request_item.clone(),
                        response_item: t.response_item.clone(),
                        config_text: t.config_text.clone(),
                        customer: t.customer.clone(),
                        uls_id: t.uls_id.clone(),
                        geo_data_version: t.geo_data_version.clone(),
                    };
                    (request_response::digest_for(&input), input)
                })
                .collect();
            request_response::update_db(&mut *tx, lookups, &rr_inputs, month_idx).await?;

            for (transaction, (rr_id, _)) in transactions.iter().zip(rr_inputs.iter()) {
                let expire_time = if inspect::response_code_success(&transaction.response_item) {
                    inspect::availability_expire_time(&transaction.response_item)
                        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                        .map(|dt| dt.with_timezone(&Utc))
                } else {
                    None
                };
                sqlx::query(
                    "INSERT INTO request_response_in_message \
                     (message_id, request_index, request_response_id, expire_time) \
                     VALUES ($1, $2, $3, $4) \
                     ON CONFLICT (message_id, request_index) DO NOTHING",
                )
                .bind(message_id)
                .bind(transaction.index as i32)
                .bind(rr_id)
                .bind(expire_time)
                .execute(&mut *tx)
                .await?;
            }

            tx.commit().await?;
        }

        Ok(())
    }
}
