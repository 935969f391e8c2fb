//! Access tracking, prefetch, and background cache refresh.
//!
//! The tracker records which cache keys are read and how often (capped, LRU).
//! Every refresh interval the engine scans the `values` and `spreadsheet`
//! namespaces for entries nearing expiry, reconstructs the original request
//! from the cache key, scores it, and re-fetches the highest-priority
//! entries through a small bounded-concurrency queue. Refresh failures only
//! log — the entry just expires on schedule.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::a1::A1Range;
use crate::cache::{
    parse_spreadsheet_key, parse_values_key, CacheManager, DependencyTag, ExpiringEntry,
    NS_SPREADSHEET, NS_VALUES,
};
use crate::config::Config;
use crate::sheets::client::{CallContext, SheetsClient};

/// Most entries refreshed per tick; bounds burst starvation of later scans.
const MAX_PER_TICK: usize = 32;
/// Predicted ranges prefetched when a spreadsheet is first touched.
const PREFETCH_RANGE_LIMIT: usize = 3;

// ── Access tracker ───────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct AccessRecord {
    pub cache_key: String,
    pub access_count: u64,
    pub last_accessed_at: Instant,
    pub spreadsheet_id: String,
    pub range: Option<String>,
    /// Whole-spreadsheet read (metadata or comprehensive fetch).
    pub comprehensive: bool,
}

pub struct AccessTracker {
    records: Mutex<HashMap<String, AccessRecord>>,
    cap: usize,
}

impl AccessTracker {
    pub fn new(cap: usize) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            cap,
        }
    }

    pub fn record(
        &self,
        cache_key: &str,
        spreadsheet_id: &str,
        range: Option<&str>,
        comprehensive: bool,
    ) {
        let mut records = self.records.lock().expect("tracker lock");
        match records.get_mut(cache_key) {
            Some(rec) => {
                rec.access_count += 1;
                rec.last_accessed_at = Instant::now();
            }
            None => {
                if records.len() >= self.cap {
                    // LRU eviction.
                    if let Some(oldest) = records
                        .values()
                        .min_by_key(|r| r.last_accessed_at)
                        .map(|r| r.cache_key.clone())
                    {
                        records.remove(&oldest);
                    }
                }
                records.insert(
                    cache_key.to_string(),
                    AccessRecord {
                        cache_key: cache_key.to_string(),
                        access_count: 1,
                        last_accessed_at: Instant::now(),
                        spreadsheet_id: spreadsheet_id.to_string(),
                        range: range.map(str::to_string),
                        comprehensive,
                    },
                );
            }
        }
    }

    pub fn get(&self, cache_key: &str) -> Option<AccessRecord> {
        self.records.lock().expect("tracker lock").get(cache_key).cloned()
    }

    /// Most-accessed bounded ranges for a spreadsheet — prefetch predictions.
    pub fn top_ranges(&self, spreadsheet_id: &str, limit: usize) -> Vec<String> {
        let records = self.records.lock().expect("tracker lock");
        let mut ranged: Vec<&AccessRecord> = records
            .values()
            .filter(|r| r.spreadsheet_id == spreadsheet_id && r.range.is_some())
            .collect();
        ranged.sort_by(|a, b| b.access_count.cmp(&a.access_count));
        ranged
            .into_iter()
            .take(limit)
            .filter_map(|r| r.range.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.lock().expect("tracker lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ── Refresh engine ───────────────────────────────────────────────────────

pub struct RefreshEngine {
    cache: Arc<CacheManager>,
    client: Arc<SheetsClient>,
    tracker: Arc<AccessTracker>,
    config: Arc<Config>,
    total_refreshes: Arc<AtomicU64>,
    successful_refreshes: Arc<AtomicU64>,
    failed_refreshes: Arc<AtomicU64>,
    prefetched: Mutex<HashSet<String>>,
}

impl RefreshEngine {
    pub fn new(
        cache: Arc<CacheManager>,
        client: Arc<SheetsClient>,
        tracker: Arc<AccessTracker>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            cache,
            client,
            tracker,
            config,
            total_refreshes: Arc::new(AtomicU64::new(0)),
            successful_refreshes: Arc::new(AtomicU64::new(0)),
            failed_refreshes: Arc::new(AtomicU64::new(0)),
            prefetched: Mutex::new(HashSet::new()),
        }
    }

    pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            if !self.config.refresh_enabled {
                return;
            }
            tracing::info!(
                interval_secs = self.config.refresh_interval.as_secs(),
                "refresh engine started"
            );
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        tracing::info!("refresh engine stopping");
                        return;
                    }
                    _ = tokio::time::sleep(self.config.refresh_interval) => {
                        self.tick().await;
                    }
                }
            }
        })
    }

    /// One scan-score-refresh round. Public so tests can drive it directly.
    pub async fn tick(&self) {
        let entries = self
            .cache
            .expiring(self.config.refresh_expiry_threshold, &[NS_VALUES, NS_SPREADSHEET])
            .await;
        if entries.is_empty() {
            return;
        }

        // Score, order by priority (FIFO on ties via scan order), cap the tick.
        let mut scored: Vec<(f64, usize, ExpiringEntry)> = entries
            .into_iter()
            .enumerate()
            .map(|(seq, e)| (self.priority(&e), seq, e))
            .collect();
        scored.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.1.cmp(&b.1))
        });
        scored.truncate(MAX_PER_TICK);

        let semaphore = Arc::new(Semaphore::new(self.config.refresh_concurrency.max(1)));
        let mut handles = Vec::new();
        for (priority, _, entry) in scored {
            let permit = Arc::clone(&semaphore)
                .acquire_owned()
                .await
                .expect("semaphore open");
            let this = self.clone_refs();
            handles.push(tokio::spawn(async move {
                let _permit = permit;
                this.refresh_entry(&entry, priority).await;
            }));
        }
        futures_util::future::join_all(handles).await;
    }

    // Workers get a cheap bundle of the fields they need rather than a
    // clone of the engine itself.
    fn clone_refs(&self) -> RefreshWorker {
        RefreshWorker {
            cache: Arc::clone(&self.cache),
            client: Arc::clone(&self.client),
            config: Arc::clone(&self.config),
            total: Arc::clone(&self.total_refreshes),
            ok: Arc::clone(&self.successful_refreshes),
            failed: Arc::clone(&self.failed_refreshes),
        }
    }

    /// `min(10, freq + recency + urgency)` per the scoring table.
    pub fn priority(&self, entry: &ExpiringEntry) -> f64 {
        let record = self.tracker.get(&entry.key);
        let freq = record
            .as_ref()
            .map(|r| (r.access_count as f64).min(5.0))
            .unwrap_or(0.0);
        let recency = match record.as_ref().map(|r| r.last_accessed_at.elapsed()) {
            Some(age) if age < Duration::from_secs(60) => 3.0,
            Some(age) if age < Duration::from_secs(300) => 2.0,
            Some(age) if age < Duration::from_secs(600) => 1.0,
            _ => 0.0,
        };
        let urgency = if entry.expires_in < Duration::from_secs(30) {
            2.0
        } else if entry.expires_in < Duration::from_secs(60) {
            1.0
        } else if entry.expires_in < Duration::from_secs(120) {
            0.5
        } else {
            0.0
        };
        (freq + recency + urgency).min(10.0)
    }

    /// Schedule low-priority warm-up reads the first time a spreadsheet is
    /// touched: workbook metadata plus the tracker's predicted ranges.
    pub fn prefetch_spreadsheet(&self, spreadsheet_id: &str) {
        if !self.config.prefetch_enabled {
            return;
        }
        {
            let mut seen = self.prefetched.lock().expect("prefetch lock");
            if !seen.insert(spreadsheet_id.to_string()) {
                return;
            }
        }
        let cache = Arc::clone(&self.cache);
        let client = Arc::clone(&self.client);
        let config = Arc::clone(&self.config);
        let tracker = Arc::clone(&self.tracker);
        let id = spreadsheet_id.to_string();
        tokio::spawn(async move {
            let ctx = CallContext::default();
            match client.spreadsheet_get(&id, &ctx).await {
                Ok(meta) => {
                    cache
                        .set(
                            NS_SPREADSHEET,
                            &crate::cache::spreadsheet_key(&id),
                            serde_json::to_value(&meta).unwrap_or(Value::Null),
                            config.cache_ttl_spreadsheet,
                            Vec::new(),
                        )
                        .await;
                }
                Err(e) => {
                    tracing::debug!(spreadsheet_id = %id, "prefetch metadata failed: {e}");
                    return;
                }
            }
            for range in tracker.top_ranges(&id, PREFETCH_RANGE_LIMIT) {
                let key = crate::cache::values_key(&id, &range, "FORMATTED_VALUE", "ROWS");
                if let Ok(vr) = client
                    .values_get(&id, &range, "FORMATTED_VALUE", "ROWS", &ctx)
                    .await
                {
                    let tags = A1Range::parse(&range)
                        .ok()
                        .map(|r| {
                            vec![DependencyTag {
                                spreadsheet_id: id.clone(),
                                range: r,
                            }]
                        })
                        .unwrap_or_default();
                    cache
                        .set(
                            NS_VALUES,
                            &key,
                            serde_json::to_value(&vr).unwrap_or(Value::Null),
                            config.cache_ttl_values,
                            tags,
                        )
                        .await;
                }
            }
        });
    }

    pub fn metrics_json(&self) -> Value {
        let total = self.total_refreshes.load(Ordering::Relaxed);
        let ok = self.successful_refreshes.load(Ordering::Relaxed);
        json!({
            "total_refreshes": total,
            "successful_refreshes": ok,
            "failed_refreshes": self.failed_refreshes.load(Ordering::Relaxed),
            "refresh_hit_rate": if total > 0 { ok as f64 / total as f64 } else { 0.0 },
            "tracked_keys": self.tracker.len(),
        })
    }
}

struct RefreshWorker {
    cache: Arc<CacheManager>,
    client: Arc<SheetsClient>,
    config: Arc<Config>,
    total: Arc<AtomicU64>,
    ok: Arc<AtomicU64>,
    failed: Arc<AtomicU64>,
}

impl RefreshWorker {
    async fn refresh_entry(&self, entry: &ExpiringEntry, priority: f64) {
        self.total.fetch_add(1, Ordering::Relaxed);
        let ctx = CallContext::default();

        let outcome: Result<(), crate::error::ApiError> = if let Some(parts) =
            parse_values_key(&entry.key)
        {
            match self
                .client
                .values_get(
                    &parts.spreadsheet_id,
                    &parts.range,
                    &parts.value_render,
                    &parts.major_dimension,
                    &ctx,
                )
                .await
            {
                Ok(vr) => {
                    let tags = A1Range::parse(&parts.range)
                        .ok()
                        .map(|r| {
                            vec![DependencyTag {
                                spreadsheet_id: parts.spreadsheet_id.clone(),
                                range: r,
                            }]
                        })
                        .unwrap_or_default();
                    self.cache
                        .set(
                            NS_VALUES,
                            &entry.key,
                            serde_json::to_value(&vr).unwrap_or(Value::Null),
                            self.config.cache_ttl_values,
                            tags,
                        )
                        .await;
                    Ok(())
                }
                Err(e) => Err(e),
            }
        } else if let Some(spreadsheet_id) = parse_spreadsheet_key(&entry.key) {
            match self.client.spreadsheet_get(&spreadsheet_id, &ctx).await {
                Ok(meta) => {
                    self.cache
                        .set(
                            NS_SPREADSHEET,
                            &entry.key,
                            serde_json::to_value(&meta).unwrap_or(Value::Null),
                            self.config.cache_ttl_spreadsheet,
                            Vec::new(),
                        )
                        .await;
                    Ok(())
                }
                Err(e) => Err(e),
            }
        } else {
            // Unparseable key — nothing to reconstruct; let it expire.
            return;
        };

        match outcome {
            Ok(()) => {
                self.ok.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(key = %entry.key, priority, "cache entry refreshed");
            }
            Err(e) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(key = %entry.key, "refresh failed (entry will expire): {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::TokenSource;
    use crate::resilience::{BreakerConfig, BreakerRegistry, RetryPolicy, TokenBucket};
    use crate::sheets::mock::MockSheets;
    use serde_json::json;

    fn test_client(mock: Arc<MockSheets>) -> Arc<SheetsClient> {
        Arc::new(SheetsClient::new(
            mock,
            Arc::new(TokenSource::fixed(reqwest::Client::new(), "t")),
            Arc::new(BreakerRegistry::new(BreakerConfig::default())),
            RetryPolicy::new(0, Duration::from_millis(1), Duration::from_millis(2)),
            Arc::new(TokenBucket::new("reads", 1000.0, 1000.0)),
            Arc::new(TokenBucket::new("writes", 1000.0, 1000.0)),
        ))
    }

    fn engine(mock: Arc<MockSheets>) -> Arc<RefreshEngine> {
        let config = Arc::new(Config::for_tests());
        Arc::new(RefreshEngine::new(
            Arc::new(CacheManager::new(1024 * 1024, None)),
            test_client(mock),
            Arc::new(AccessTracker::new(1000)),
            config,
        ))
    }

    #[test]
    fn tracker_caps_at_limit_with_lru_eviction() {
        let tracker = AccessTracker::new(3);
        for i in 0..5 {
            tracker.record(&format!("k{i}"), "ss1", None, false);
        }
        assert_eq!(tracker.len(), 3);
        // Most recent keys survive.
        assert!(tracker.get("k4").is_some());
        assert!(tracker.get("k0").is_none());
    }

    #[test]
    fn tracker_counts_repeat_access() {
        let tracker = AccessTracker::new(10);
        for _ in 0..7 {
            tracker.record("k", "ss1", Some("Sheet1!A1:B2"), false);
        }
        assert_eq!(tracker.get("k").unwrap().access_count, 7);
        assert_eq!(tracker.top_ranges("ss1", 5), vec!["Sheet1!A1:B2".to_string()]);
    }

    #[tokio::test]
    async fn priority_combines_frequency_recency_urgency() {
        let mock = Arc::new(MockSheets::new());
        let e = engine(mock);

        // Hot key accessed 10x just now, expiring in 20s: 5 + 3 + 2 = 10.
        for _ in 0..10 {
            e.tracker.record("hot", "ss1", None, false);
        }
        let hot = ExpiringEntry {
            namespace: NS_VALUES.to_string(),
            key: "hot".to_string(),
            expires_in: Duration::from_secs(20),
            age: Duration::from_secs(240),
        };
        assert_eq!(e.priority(&hot), 10.0);

        // Never-accessed key expiring in 90s: 0 + 0 + 0.5.
        let cold = ExpiringEntry {
            namespace: NS_VALUES.to_string(),
            key: "cold".to_string(),
            expires_in: Duration::from_secs(90),
            age: Duration::from_secs(240),
        };
        assert_eq!(e.priority(&cold), 0.5);
    }

    #[tokio::test]
    async fn tick_refreshes_expiring_values_entries() {
        let mock = Arc::new(MockSheets::new());
        mock.seed_sheet("ss1", "Sheet1", vec![vec![json!("fresh")]]);
        let e = engine(Arc::clone(&mock));

        let key = crate::cache::values_key("ss1", "Sheet1!A1:B2", "FORMATTED_VALUE", "ROWS");
        e.cache
            .set(NS_VALUES, &key, json!({ "values": [["stale"]] }), Duration::from_secs(5), vec![])
            .await;
        e.tracker.record(&key, "ss1", Some("Sheet1!A1:B2"), false);

        e.tick().await;

        assert_eq!(mock.calls_for("values.get"), 1);
        let refreshed = e.cache.get(NS_VALUES, &key).await.unwrap();
        assert_eq!(refreshed["values"][0][0], "fresh");
        let metrics = e.metrics_json();
        assert_eq!(metrics["total_refreshes"], 1);
        assert_eq!(metrics["successful_refreshes"], 1);
    }

    #[tokio::test]
    async fn refresh_failure_only_logs() {
        let mock = Arc::new(MockSheets::new());
        mock.seed_sheet("ss1", "Sheet1", vec![]);
        mock.push_failures(
            "values.get",
            crate::sheets::types::UpstreamError::new(
                crate::sheets::types::UpstreamErrorKind::Internal,
                "down",
            ),
            5,
        );
        let e = engine(Arc::clone(&mock));
        let key = crate::cache::values_key("ss1", "Sheet1!A1", "FORMATTED_VALUE", "ROWS");
        e.cache
            .set(NS_VALUES, &key, json!({}), Duration::from_secs(5), vec![])
            .await;

        e.tick().await;

        assert_eq!(e.metrics_json()["failed_refreshes"], 1);
    }
}
