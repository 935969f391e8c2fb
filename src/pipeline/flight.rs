//! Shared in-flight work.
//!
//! A `FlightMap` holds at most one running future per key. The first caller
//! launches the work on a detached task; later callers subscribe to its
//! broadcast result. A caller that hits its deadline simply stops listening —
//! the task keeps running and settles the other subscribers. The key is
//! removed from the map *before* the result is broadcast, so settlement and
//! a fresh launch can never interleave on the same key.
//!
//! The map is a cheap handle: clones share the same state.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::sync::broadcast;

use crate::error::ApiError;

type FlightResult = Result<Value, ApiError>;

pub struct FlightMap<K> {
    inflight: Arc<Mutex<HashMap<K, broadcast::Sender<FlightResult>>>>,
    launches: Arc<AtomicU64>,
    joins: Arc<AtomicU64>,
}

impl<K> Clone for FlightMap<K> {
    fn clone(&self) -> Self {
        Self {
            inflight: Arc::clone(&self.inflight),
            launches: Arc::clone(&self.launches),
            joins: Arc::clone(&self.joins),
        }
    }
}

impl<K> Default for FlightMap<K> {
    fn default() -> Self {
        Self {
            inflight: Arc::new(Mutex::new(HashMap::new())),
            launches: Arc::new(AtomicU64::new(0)),
            joins: Arc::new(AtomicU64::new(0)),
        }
    }
}

impl<K: Eq + Hash + Clone + Send + 'static> FlightMap<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to the in-flight work for `key`, launching `work` if none
    /// exists. The returned receiver yields exactly one result.
    pub fn join<F, Fut>(&self, key: K, work: F) -> broadcast::Receiver<FlightResult>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = FlightResult> + Send + 'static,
    {
        let mut inflight = self.inflight.lock().expect("flight lock");
        if let Some(tx) = inflight.get(&key) {
            self.joins.fetch_add(1, Ordering::Relaxed);
            return tx.subscribe();
        }

        let (tx, rx) = broadcast::channel(1);
        inflight.insert(key.clone(), tx.clone());
        drop(inflight);
        self.launches.fetch_add(1, Ordering::Relaxed);

        let map = self.clone();
        let fut = work();
        tokio::spawn(async move {
            let result = fut.await;
            // Remove before sending: a caller that misses the broadcast
            // becomes a fresh leader instead of waiting forever.
            map.inflight.lock().expect("flight lock").remove(&key);
            let _ = tx.send(result);
        });
        rx
    }

    pub fn in_flight(&self) -> usize {
        self.inflight.lock().expect("flight lock").len()
    }

    pub fn stats(&self) -> (u64, u64) {
        (
            self.launches.load(Ordering::Relaxed),
            self.joins.load(Ordering::Relaxed),
        )
    }
}

/// Await a flight result. Lag/closure (leader panic) maps to an internal
/// error rather than a hang.
pub async fn outcome(mut rx: broadcast::Receiver<FlightResult>) -> FlightResult {
    rx.recv()
        .await
        .unwrap_or_else(|_| Err(ApiError::internal("shared in-flight work aborted")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn concurrent_joins_share_one_execution() {
        let flights: FlightMap<String> = FlightMap::new();
        let counter = Arc::new(AtomicU64::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let flights = flights.clone();
            let counter = Arc::clone(&counter);
            handles.push(tokio::spawn(async move {
                let rx = flights.join("k".to_string(), move || async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    Ok(serde_json::json!(42))
                });
                outcome(rx).await
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), serde_json::json!(42));
        }
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(flights.in_flight(), 0);
    }

    #[tokio::test]
    async fn caller_detach_does_not_cancel_shared_work() {
        let flights: FlightMap<String> = FlightMap::new();
        let counter = Arc::new(AtomicU64::new(0));

        let c = Arc::clone(&counter);
        let rx1 = flights.join("k".to_string(), move || async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            c.fetch_add(1, Ordering::SeqCst);
            Ok(serde_json::json!("done"))
        });
        // First caller gives up immediately.
        drop(rx1);

        // Second caller joins the same flight and still gets the result.
        let rx2 = flights.join("k".to_string(), || async {
            panic!("work must not be relaunched while in flight")
        });
        let result = outcome(rx2).await.unwrap();
        assert_eq!(result, serde_json::json!("done"));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn settled_key_launches_fresh_work() {
        let flights: FlightMap<String> = FlightMap::new();
        let rx = flights.join("k".to_string(), || async { Ok(serde_json::json!(1)) });
        assert_eq!(
            outcome(rx).await.unwrap(),
            serde_json::json!(1)
        );

        let rx = flights.join("k".to_string(), || async { Ok(serde_json::json!(2)) });
        assert_eq!(
            outcome(rx).await.unwrap(),
            serde_json::json!(2)
        );
        let (launches, _) = flights.stats();
        assert_eq!(launches, 2);
    }

    #[tokio::test]
    async fn errors_fan_out_to_all_subscribers() {
        let flights: FlightMap<&'static str> = FlightMap::new();
        let rx1 = flights.join("k", || async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            Err(ApiError::internal("boom"))
        });
        let rx2 = flights.join("k", || async { unreachable!() });
        assert!(outcome(rx1).await.is_err());
        assert!(outcome(rx2).await.is_err());
    }
}
