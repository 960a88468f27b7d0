//! Generic per-kind request batcher (C6): coalesces concurrent lookups for the
//! same key into a single batched DB call, and tolerates promises whose caller
//! has already timed out.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::warn;

use crate::error::RcacheError;

#[async_trait]
pub trait BatchFetcher<K, V>: Send + Sync
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Issues one batched lookup for `keys`. Keys absent from the returned map
    /// are reported to their callers as a miss, never as an error.
    async fn fetch_batch(&self, keys: Vec<K>) -> HashMap<K, V>;
}

enum WorkItem<K> {
    Key(K),
    Shutdown,
}

type InFlight<K, V> = Arc<DashMap<K, Vec<oneshot::Sender<Option<V>>>>>;

pub struct Batcher<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    tx: mpsc::UnboundedSender<WorkItem<K>>,
    in_flight: InFlight<K, V>,
    name: &'static str,
}

impl<K, V> Clone for Batcher<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            in_flight: self.in_flight.clone(),
            name: self.name,
        }
    }
}

impl<K, V> Batcher<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new(fetcher: Arc<dyn BatchFetcher<K, V>>, max_batch: usize, name: &'static str) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let in_flight: InFlight<K, V> = Arc::new(DashMap::new());
        tokio::spawn(Self::worker(rx, in_flight.clone(), fetcher, max_batch, name));
        Self { tx, in_flight, name }
    }

    /// Looks up `key`, coalescing with any other in-flight lookup for the same
    /// key. Returns `Err(Timeout)` if `deadline` is already past, or expires
    /// before the batch completes; `Ok(None)` for a confirmed miss.
    pub async fn get(&self, key: K, deadline: Instant) -> Result<Option<V>, RcacheError> {
        if deadline <= Instant::now() {
            return Err(RcacheError::Timeout);
        }
        let (resp_tx, resp_rx) = oneshot::channel();
        let should_enqueue = {
            let mut entry = self.in_flight.entry(key.clone()).or_default();
            entry.push(resp_tx);
            entry.len() == 1
        };
        if should_enqueue {
            common_metrics::gauge(
                "rcache_batcher_queue_depth",
                &[("batcher".to_string(), self.name.to_string())],
                self.in_flight.len() as f64,
            );
            if self.tx.send(WorkItem::Key(key)).is_err() {
                warn!(batcher = self.name, "batcher worker is gone, dropping request");
                return Err(RcacheError::Timeout);
            }
        }
        match tokio::time::timeout_at(deadline, resp_rx).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => Ok(None),
            Err(_) => Err(RcacheError::Timeout),
        }
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(WorkItem::Shutdown);
    }

    async fn worker(
        mut rx: mpsc::UnboundedReceiver<WorkItem<K>>,
        in_flight: InFlight<K, V>,
        fetcher: Arc<dyn BatchFetcher<K, V>>,
        max_batch: usize,
        name: &'static str,
    ) {
        loop {
            let first = match rx.recv().await {
                Some(WorkItem::Key(k)) => k,
                Some(WorkItem::Shutdown) | None => {
                    Self::cancel_all(&in_flight);
                    return;
                }
            };
            let mut batch = vec![first];
            while batch.len() < max_batch {
                match rx.try_recv() {
                    Ok(WorkItem::Key(k)) => batch.push(k),
                    Ok(WorkItem::Shutdown) => {
                        Self::cancel_all(&in_flight);
                        return;
                    }
                    Err(_) => break,
                }
            }

            let results = fetcher.fetch_batch(batch.clone()).await;
            if results.is_empty() {
                warn!(batcher = name, batch_size = batch.len(), "batched lookup returned no results");
            }
            for key in &batch {
                let Some((_, promises)) = in_flight.remove(key) else {
                    continue;
                };
                let value = results.get(key).cloned();
                // Promises whose caller already timed out are simply dropped
                // receivers; `send` on them is a harmless no-op.
                for promise in promises {
                    let _ = promise.send(value.clone());
                }
            }
            common_metrics::gauge(
                "rcache_batcher_queue_depth",
                &[("batcher".to_string(), name.to_string())],
                in_flight.len() as f64,
            );
        }
    }

    fn cancel_all(in_flight: &InFlight<K, V>) {
        for mut entry in in_flight.iter_mut() {
            for promise in entry.value_mut().drain(..) {
                let _ = promise.send(None);
            }
        }
        in_flight.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct CountingFetcher {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl BatchFetcher<String, String> for CountingFetcher {
        async fn fetch_batch(&self, keys: Vec<String>) -> HashMap<String, String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            keys.into_iter().map(|k| (k.clone(), format!("value-{k}"))).collect()
        }
    }

    #[tokio::test]
    async fn coalesces_concurrent_lookups_for_same_key() {
        let calls = Arc::new(AtomicUsize::new(0));
        let fetcher = Arc::new(CountingFetcher { calls: calls.clone() });
        let batcher: Batcher<String, String> = Batcher::new(fetcher, 1000, "test");

        let deadline = Instant::now() + Duration::from_secs(1);
        let mut handles = Vec::new();
        for _ in 0..100 {
            let batcher = batcher.clone();
            let key = "k1".to_string();
            handles.push(tokio::spawn(async move { batcher.get(key, deadline).await }));
        }
        for h in handles {
            assert_eq!(h.await.unwrap().unwrap(), Some("value-k1".to_string()));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn zero_deadline_times_out_immediately() {
        let fetcher = Arc::new(CountingFetcher { calls: Arc::new(AtomicUsize::new(0)) });
        let batcher: Batcher<String, String> = Batcher::new(fetcher, 1000, "test");
        let past = Instant::now() - Duration::from_millis(1);
        let result = batcher.get("k1".to_string(), past).await;
        assert!(matches!(result, Err(RcacheError::Timeout)));
    }

    #[tokio::test]
    async fn missing_key_resolves_to_none_not_error() {
        struct EmptyFetcher;
        #[async_trait]
        impl BatchFetcher<String, String> for EmptyFetcher {
            async fn fetch_batch(&self, _keys: Vec<String>) -> HashMap<String, String> {
                HashMap::new()
            }
        }
        let batcher: Batcher<String, String> = Batcher::new(Arc::new(EmptyFetcher), 1000, "test");
        let deadline = Instant::now() + Duration::from_secs(1);
        let result = batcher.get("missing".to_string(), deadline).await;
        assert_eq!(result.unwrap(), None);
    }
}
