//! Namespaced TTL cache with range-dependency invalidation.
//!
//! Namespaces: `values` (range reads), `spreadsheet` (workbook metadata),
//! `resolver` (semantic reference resolutions), `capability` (peer
//! capability descriptors). Every entry carries dependency tags —
//! `(spreadsheet_id, range)` pairs — so a write can invalidate exactly the
//! reads it clobbers. Expired entries are misses for `get` but stay visible
//! to the expiry scan until an eviction pass removes them; the refresh
//! engine depends on seeing them.
//!
//! Cache keys are deterministic and parseable back into the request that
//! produced them (see `values_key` / `parse_values_key`).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tokio::sync::RwLock;

use crate::a1::A1Range;
use crate::distributed::DistributedBackend;

pub const NS_VALUES: &str = "values";
pub const NS_SPREADSHEET: &str = "spreadsheet";
pub const NS_RESOLVER: &str = "resolver";
pub const NS_CAPABILITY: &str = "capability";

#[derive(Debug, Clone)]
pub struct DependencyTag {
    pub spreadsheet_id: String,
    pub range: A1Range,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: Value,
    created_at: Instant,
    expires_at: Instant,
    size_estimate: usize,
    dependency_tags: Vec<DependencyTag>,
    last_accessed: Instant,
}

#[derive(Default)]
struct NamespaceStore {
    entries: HashMap<String, CacheEntry>,
    total_size: usize,
}

/// An entry surfaced by the expiry scan.
#[derive(Debug, Clone)]
pub struct ExpiringEntry {
    pub namespace: String,
    pub key: String,
    pub expires_in: Duration,
    pub age: Duration,
}

pub struct CacheManager {
    namespaces: RwLock<HashMap<String, NamespaceStore>>,
    namespace_budget: usize,
    distributed: Option<Arc<dyn DistributedBackend>>,
    hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
    invalidations: AtomicU64,
    evictions: AtomicU64,
}

impl CacheManager {
    pub fn new(namespace_budget: usize, distributed: Option<Arc<dyn DistributedBackend>>) -> Self {
        Self {
            namespaces: RwLock::new(HashMap::new()),
            namespace_budget,
            distributed,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            sets: AtomicU64::new(0),
            invalidations: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    pub async fn get(&self, namespace: &str, key: &str) -> Option<Value> {
        {
            let mut map = self.namespaces.write().await;
            if let Some(ns) = map.get_mut(namespace) {
                if let Some(entry) = ns.entries.get_mut(key) {
                    if Instant::now() < entry.expires_at {
                        entry.last_accessed = Instant::now();
                        self.hits.fetch_add(1, Ordering::Relaxed);
                        return Some(entry.value.clone());
                    }
                    // Expired: a miss, but the entry stays for the expiry scan.
                }
            }
        }
        self.misses.fetch_add(1, Ordering::Relaxed);

        // Tier 2: distributed mirror. Failures are logged, never surfaced.
        if let Some(backend) = &self.distributed {
            if let Some(raw) = backend.get(namespace, key).await {
                if let Ok(value) = serde_json::from_str::<Value>(&raw) {
                    return Some(value);
                }
            }
        }
        None
    }

    /// Last successful value for a key even if expired — fallback data for
    /// an open circuit.
    pub async fn get_stale(&self, namespace: &str, key: &str) -> Option<Value> {
        let map = self.namespaces.read().await;
        map.get(namespace)
            .and_then(|ns| ns.entries.get(key))
            .map(|e| e.value.clone())
    }

    pub async fn set(
        &self,
        namespace: &str,
        key: &str,
        value: Value,
        ttl: Duration,
        dependency_tags: Vec<DependencyTag>,
    ) {
        let size_estimate = estimate_size(&value);
        let now = Instant::now();
        let entry = CacheEntry {
            value: value.clone(),
            created_at: now,
            expires_at: now + ttl,
            size_estimate,
            dependency_tags,
            last_accessed: now,
        };

        {
            let mut map = self.namespaces.write().await;
            let ns = map.entry(namespace.to_string()).or_default();
            if let Some(old) = ns.entries.insert(key.to_string(), entry) {
                ns.total_size = ns.total_size.saturating_sub(old.size_estimate);
            }
            ns.total_size += size_estimate;
            if ns.total_size > self.namespace_budget {
                self.evictions
                    .fetch_add(evict_lru(ns, self.namespace_budget), Ordering::Relaxed);
            }
        }
        self.sets.fetch_add(1, Ordering::Relaxed);

        if let Some(backend) = &self.distributed {
            let backend = Arc::clone(backend);
            let (ns, k) = (namespace.to_string(), key.to_string());
            let raw = value.to_string();
            tokio::spawn(async move {
                backend.set(&ns, &k, raw, ttl).await;
            });
        }
    }

    pub async fn invalidate(&self, namespace: &str, key: &str) {
        let removed = {
            let mut map = self.namespaces.write().await;
            map.get_mut(namespace).and_then(|ns| {
                ns.entries.remove(key).inspect(|e| {
                    ns.total_size = ns.total_size.saturating_sub(e.size_estimate);
                })
            })
        };
        if removed.is_some() {
            self.invalidations.fetch_add(1, Ordering::Relaxed);
        }
        if let Some(backend) = &self.distributed {
            let backend = Arc::clone(backend);
            let (ns, k) = (namespace.to_string(), key.to_string());
            tokio::spawn(async move {
                backend.delete(&ns, &k).await;
            });
        }
    }

    /// Remove every entry whose dependency tags overlap the written range.
    /// Runs across all namespaces; overlap is computed on grid coordinates
    /// with unbounded axes treated as maximal.
    pub async fn invalidate_range(&self, spreadsheet_id: &str, range: &A1Range) {
        let mut removed_keys: Vec<(String, String)> = Vec::new();
        {
            let mut map = self.namespaces.write().await;
            for (ns_name, ns) in map.iter_mut() {
                let doomed: Vec<String> = ns
                    .entries
                    .iter()
                    .filter(|(_, e)| {
                        e.dependency_tags.iter().any(|tag| {
                            tag.spreadsheet_id == spreadsheet_id && tag.range.overlaps(range)
                        })
                    })
                    .map(|(k, _)| k.clone())
                    .collect();
                for key in doomed {
                    if let Some(e) = ns.entries.remove(&key) {
                        ns.total_size = ns.total_size.saturating_sub(e.size_estimate);
                    }
                    removed_keys.push((ns_name.clone(), key));
                }
            }
        }
        let count = removed_keys.len() as u64;
        if count > 0 {
            self.invalidations.fetch_add(count, Ordering::Relaxed);
            tracing::debug!(
                spreadsheet_id,
                range = %range.to_a1(),
                entries = count,
                "range invalidation"
            );
        }
        if let Some(backend) = &self.distributed {
            let backend = Arc::clone(backend);
            tokio::spawn(async move {
                for (ns, key) in removed_keys {
                    backend.delete(&ns, &key).await;
                }
            });
        }
    }

    /// Entries in the given namespaces that expire within `threshold`
    /// (expired-but-unevicted entries included).
    pub async fn expiring(&self, threshold: Duration, namespaces: &[&str]) -> Vec<ExpiringEntry> {
        let now = Instant::now();
        let map = self.namespaces.read().await;
        let mut out = Vec::new();
        for ns_name in namespaces {
            if let Some(ns) = map.get(*ns_name) {
                for (key, entry) in &ns.entries {
                    let expires_in = entry.expires_at.saturating_duration_since(now);
                    if expires_in <= threshold {
                        out.push(ExpiringEntry {
                            namespace: ns_name.to_string(),
                            key: key.clone(),
                            expires_in,
                            age: now.duration_since(entry.created_at),
                        });
                    }
                }
            }
        }
        out
    }

    pub async fn stats(&self) -> Value {
        let map = self.namespaces.read().await;
        let mut per_ns = serde_json::Map::new();
        for (name, ns) in map.iter() {
            per_ns.insert(
                name.clone(),
                json!({ "entries": ns.entries.len(), "size_bytes": ns.total_size }),
            );
        }
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        json!({
            "namespaces": per_ns,
            "hits": hits,
            "misses": misses,
            "hit_rate": if total > 0 { hits as f64 / total as f64 } else { 0.0 },
            "sets": self.sets.load(Ordering::Relaxed),
            "invalidations": self.invalidations.load(Ordering::Relaxed),
            "evictions": self.evictions.load(Ordering::Relaxed),
            "distributed": self.distributed.is_some(),
        })
    }
}

/// Evict expired entries first, then least-recently-accessed, until the
/// namespace fits its budget again. Returns the number of entries removed.
fn evict_lru(ns: &mut NamespaceStore, budget: usize) -> u64 {
    let now = Instant::now();
    let mut removed = 0u64;

    let expired: Vec<String> = ns
        .entries
        .iter()
        .filter(|(_, e)| now >= e.expires_at)
        .map(|(k, _)| k.clone())
        .collect();
    for key in expired {
        if let Some(e) = ns.entries.remove(&key) {
            ns.total_size = ns.total_size.saturating_sub(e.size_estimate);
            removed += 1;
        }
    }

    while ns.total_size > budget && !ns.entries.is_empty() {
        let oldest = ns
            .entries
            .iter()
            .min_by_key(|(_, e)| e.last_accessed)
            .map(|(k, _)| k.clone())
            .expect("non-empty namespace");
        if let Some(e) = ns.entries.remove(&oldest) {
            ns.total_size = ns.total_size.saturating_sub(e.size_estimate);
            removed += 1;
        }
    }
    removed
}

/// Cheap size estimate: serialized length. Good enough for budget pressure.
fn estimate_size(value: &Value) -> usize {
    value.to_string().len()
}

// ── Deterministic cache keys ─────────────────────────────────────────────

/// `values|<spreadsheet>|<range>|<render>|<dimension>` — parseable so the
/// refresh engine can reconstruct the original read.
pub fn values_key(
    spreadsheet_id: &str,
    range: &str,
    value_render: &str,
    major_dimension: &str,
) -> String {
    format!("values|{spreadsheet_id}|{range}|{value_render}|{major_dimension}")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValuesKeyParts {
    pub spreadsheet_id: String,
    pub range: String,
    pub value_render: String,
    pub major_dimension: String,
}

pub fn parse_values_key(key: &str) -> Option<ValuesKeyParts> {
    let mut parts = key.splitn(5, '|');
    if parts.next()? != "values" {
        return None;
    }
    Some(ValuesKeyParts {
        spreadsheet_id: parts.next()?.to_string(),
        range: parts.next()?.to_string(),
        value_render: parts.next()?.to_string(),
        major_dimension: parts.next()?.to_string(),
    })
}

pub fn spreadsheet_key(spreadsheet_id: &str) -> String {
    format!("spreadsheet|{spreadsheet_id}")
}

pub fn parse_spreadsheet_key(key: &str) -> Option<String> {
    key.strip_prefix("spreadsheet|").map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tag(id: &str, range: &str) -> DependencyTag {
        DependencyTag {
            spreadsheet_id: id.to_string(),
            range: A1Range::parse(range).unwrap(),
        }
    }

    fn cache() -> CacheManager {
        CacheManager::new(1024 * 1024, None)
    }

    #[tokio::test]
    async fn get_respects_ttl() {
        let c = cache();
        c.set(NS_VALUES, "k", json!(1), Duration::from_millis(10), vec![])
            .await;
        assert_eq!(c.get(NS_VALUES, "k").await, Some(json!(1)));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(c.get(NS_VALUES, "k").await, None);
        // Expired entries remain visible to the scan and to stale reads.
        assert_eq!(c.get_stale(NS_VALUES, "k").await, Some(json!(1)));
        assert_eq!(
            c.expiring(Duration::from_secs(60), &[NS_VALUES]).await.len(),
            1
        );
    }

    #[tokio::test]
    async fn range_invalidation_removes_overlapping_entries() {
        let c = cache();
        c.set(
            NS_VALUES,
            "a",
            json!(1),
            Duration::from_secs(60),
            vec![tag("ss1", "Sheet1!A1:B10")],
        )
        .await;
        c.set(
            NS_VALUES,
            "b",
            json!(2),
            Duration::from_secs(60),
            vec![tag("ss1", "Sheet1!F1:G10")],
        )
        .await;
        c.set(
            NS_VALUES,
            "c",
            json!(3),
            Duration::from_secs(60),
            vec![tag("ss2", "Sheet1!A1:B10")],
        )
        .await;

        c.invalidate_range("ss1", &A1Range::parse("Sheet1!B5:C20").unwrap())
            .await;

        assert_eq!(c.get(NS_VALUES, "a").await, None); // overlapped
        assert_eq!(c.get(NS_VALUES, "b").await, Some(json!(2))); // disjoint cols
        assert_eq!(c.get(NS_VALUES, "c").await, Some(json!(3))); // other spreadsheet
    }

    #[tokio::test]
    async fn whole_column_write_invalidates_bounded_reads() {
        let c = cache();
        c.set(
            NS_VALUES,
            "a",
            json!(1),
            Duration::from_secs(60),
            vec![tag("ss1", "Sheet1!B100:B200")],
        )
        .await;
        c.invalidate_range("ss1", &A1Range::parse("Sheet1!B:B").unwrap())
            .await;
        assert_eq!(c.get(NS_VALUES, "a").await, None);
    }

    #[tokio::test]
    async fn lru_eviction_keeps_namespace_under_budget() {
        let c = CacheManager::new(200, None);
        for i in 0..20 {
            c.set(
                NS_VALUES,
                &format!("k{i}"),
                json!("xxxxxxxxxxxxxxxxxxxx"),
                Duration::from_secs(60),
                vec![],
            )
            .await;
        }
        let stats = c.stats().await;
        assert!(stats["namespaces"][NS_VALUES]["size_bytes"].as_u64().unwrap() <= 200);
        assert!(stats["evictions"].as_u64().unwrap() > 0);
    }

    #[test]
    fn values_key_round_trips() {
        let key = values_key("ss1", "Sheet1!A1:B2", "FORMATTED_VALUE", "ROWS");
        let parts = parse_values_key(&key).unwrap();
        assert_eq!(parts.spreadsheet_id, "ss1");
        assert_eq!(parts.range, "Sheet1!A1:B2");
        assert_eq!(parts.major_dimension, "ROWS");
        assert!(parse_values_key("spreadsheet|ss1").is_none());
    }
}
