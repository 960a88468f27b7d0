//! Axum router assembly for the response-cache REST interface (§6.3).

use std::sync::Arc;

use als_model::cache::{AllowDeny, Beam};
use als_model::geo::{Point, Rectangle};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use common_health::HealthRegistry;
use serde::Deserialize;
use serde_json::Value;
use sqlx::PgPool;
use tower_http::trace::TraceLayer;

use crate::batcher::Batcher;
use crate::error::RcacheError;
use crate::fetchers::{CacheLookupFetcher, CertLookupFetcher, ConfigLookupFetcher};
use crate::precompute::Precomputer;
use crate::resolver::CertQuery;
use crate::store::{CacheStore, UpdateTriple};

#[derive(Clone)]
pub struct AppState {
    pub store: CacheStore,
    pub cache_batcher: Batcher<String, Value>,
    pub cert_batcher: Batcher<CertQuery, AllowDeny>,
    pub config_batcher: Batcher<String, Value>,
    pub precomputer: Precomputer,
    pub health: HealthRegistry,
}

impl AppState {
    pub fn new(
        pool: PgPool,
        store: CacheStore,
        precomputer: Precomputer,
        max_batch: usize,
        health: HealthRegistry,
    ) -> Self {
        Self {
            store,
            cache_batcher: Batcher::new(
                Arc::new(CacheLookupFetcher { pool: pool.clone() }),
                max_batch,
                "cache_lookup",
            ),
            cert_batcher: Batcher::new(
                Arc::new(CertLookupFetcher { pool: pool.clone() }),
                max_batch,
                "cert_lookup",
            ),
            config_batcher: Batcher::new(
                Arc::new(ConfigLookupFetcher { pool }),
                max_batch,
                "config_lookup",
            ),
            precomputer,
            health,
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthcheck", get(healthcheck))
        .route("/status", get(status))
        .route("/update", post(update))
        .route("/invalidate", post(invalidate))
        .route("/spatial_invalidate", post(spatial_invalidate))
        .route("/directional_invalidate", post(directional_invalidate))
        .route("/invalidation_state/:enabled", post(invalidation_state))
        .route("/update_state/:enabled", post(update_state))
        .route("/precomputation_state/:enabled", post(precomputation_state))
        .route("/precomputation_quota/:quota", post(precomputation_quota))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn healthcheck(State(state): State<AppState>) -> impl IntoResponse {
    state.health.get_status()
}

async fn status(State(state): State<AppState>) -> Result<Json<crate::store::RcacheStatus>, RcacheError> {
    let mut snapshot = state.store.status().await?;
    snapshot.precompute_rate_ema = state.precomputer.rate_ema();
    Ok(Json(snapshot))
}

#[derive(Deserialize)]
struct UpdateKey {
    afc_req: Value,
    afc_resp: Value,
    req_cfg_digest: String,
}

#[derive(Deserialize)]
struct UpdateRequest {
    req_resp_keys: Vec<UpdateKey>,
}

async fn update(State(state): State<AppState>, Json(body): Json<UpdateRequest>) -> Json<Value> {
    let triples = body
        .req_resp_keys
        .into_iter()
        .map(|k| UpdateTriple {
            request: k.afc_req,
            response: k.afc_resp,
            req_cfg_digest: k.req_cfg_digest,
        })
        .collect();
    let accepted = state.store.enqueue_update(triples);
    Json(serde_json::json!({ "accepted": accepted }))
}

#[derive(Deserialize)]
struct InvalidateRequest {
    ruleset_ids: Option<Vec<String>>,
}

async fn invalidate(
    State(state): State<AppState>,
    Json(body): Json<InvalidateRequest>,
) -> Result<Json<Value>, RcacheError> {
    let rows = state.store.invalidate_blanket(body.ruleset_ids).await?;
    Ok(Json(serde_json::json!({ "invalidated": rows })))
}

#[derive(Deserialize)]
struct TileRect {
    min_lat: f64,
    max_lat: f64,
    min_lon: f64,
    max_lon: f64,
}

#[derive(Deserialize)]
struct SpatialInvalidateRequest {
    tiles: Vec<TileRect>,
}

async fn spatial_invalidate(
    State(state): State<AppState>,
    Json(body): Json<SpatialInvalidateRequest>,
) -> Result<Json<Value>, RcacheError> {
    let rects: Vec<Rectangle> = body
        .tiles
        .into_iter()
        .map(|t| Rectangle { min_lat: t.min_lat, max_lat: t.max_lat, min_lon: t.min_lon, max_lon: t.max_lon })
        .collect();
    let rows = state.store.invalidate_spatial(rects).await?;
    Ok(Json(serde_json::json!({ "invalidated": rows })))
}

#[derive(Deserialize)]
struct BeamReq {
    rx_lat: f64,
    rx_lon: f64,
    tx_lat: Option<f64>,
    tx_lon: Option<f64>,
    azimuth_to_tx: Option<f64>,
}

#[derive(Deserialize)]
struct DirectionalInvalidateRequest {
    beams: Vec<BeamReq>,
}

async fn directional_invalidate(
    State(state): State<AppState>,
    Json(body): Json<DirectionalInvalidateRequest>,
) -> Result<Json<Value>, RcacheError> {
    let beams: Vec<Beam> = body
        .beams
        .into_iter()
        .map(|b| Beam {
            rx: Point { lat: b.rx_lat, lon: b.rx_lon },
            tx_point: match (b.tx_lat, b.tx_lon) {
                (Some(lat), Some(lon)) => Some(Point { lat, lon }),
                _ => None,
            },
            azimuth_to_tx_deg: b.azimuth_to_tx,
        })
        .collect();
    let rows = state.store.invalidate_directional(beams).await?;
    Ok(Json(serde_json::json!({ "invalidated": rows })))
}

async fn invalidation_state(State(state): State<AppState>, Path(enabled): Path<bool>) -> StatusCode {
    state.store.set_invalidation_enabled(enabled);
    StatusCode::OK
}

async fn update_state(State(state): State<AppState>, Path(enabled): Path<bool>) -> StatusCode {
    state.store.set_update_enabled(enabled);
    StatusCode::OK
}

async fn precomputation_state(State(state): State<AppState>, Path(enabled): Path<bool>) -> StatusCode {
    state.precomputer.set_enabled(enabled);
    StatusCode::OK
}

async fn precomputation_quota(State(state): State<AppState>, Path(quota): Path<usize>) -> StatusCode {
    state.precomputer.set_quota(quota).await;
    StatusCode::OK
}
