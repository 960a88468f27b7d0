//! `BatchFetcher` implementations wiring the store/resolver batched queries
//! into the generic C6 request batcher.

use std::collections::HashMap;

use als_model::cache::AllowDeny;
use async_trait::async_trait;
use futures::future::join_all;
use serde_json::Value;
use sqlx::PgPool;
use tracing::error;

use crate::batcher::BatchFetcher;
use crate::resolver::{self, CertQuery};
use crate::store;

pub struct CacheLookupFetcher {
    pub pool: PgPool,
}

#[async_trait]
impl BatchFetcher<String, Value> for CacheLookupFetcher {
    async fn fetch_batch(&self, keys: Vec<String>) -> HashMap<String, Value> {
        match store::lookup_batch(&self.pool, &keys).await {
            Ok(map) => map,
            Err(e) => {
                error!(error = %e, "cache batch lookup failed");
                HashMap::new()
            }
        }
    }
}

pub struct CertLookupFetcher {
    pub pool: PgPool,
}

#[async_trait]
impl BatchFetcher<CertQuery, AllowDeny> for CertLookupFetcher {
    async fn fetch_batch(&self, keys: Vec<CertQuery>) -> HashMap<CertQuery, AllowDeny> {
        match resolver::resolve_batch(&self.pool, &keys).await {
            Ok(results) => keys.into_iter().zip(results).collect(),
            Err(e) => {
                error!(error = %e, "certification batch lookup failed");
                HashMap::new()
            }
        }
    }
}

pub struct ConfigLookupFetcher {
    pub pool: PgPool,
}

#[async_trait]
impl BatchFetcher<String, Value> for ConfigLookupFetcher {
    async fn fetch_batch(&self, keys: Vec<String>) -> HashMap<String, Value> {
        let futures = keys.iter().map(|ruleset| resolver::resolve_config(&self.pool, ruleset));
        let results = join_all(futures).await;
        keys.into_iter()
            .zip(results)
            .filter_map(|(ruleset, result)| match result {
                Ok(Some(config)) => Some((ruleset, config)),
                Ok(None) => None,
                Err(e) => {
                    error!(error = %e, ruleset, "config batch lookup failed");
                    None
                }
            })
            .collect()
    }
}
