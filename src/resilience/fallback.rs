//! Prioritized fallback registry.
//!
//! When a breaker surfaces `CIRCUIT_OPEN` to a read path, the registry runs
//! its entries in priority order and returns the first result produced.
//! Canonical entries (registered at startup):
//!
//!   100  cached-data      — last successful response for the key
//!    80  retry-escalation — hook only; retry already lives in the policy
//!    50  degraded         — sentinel empty result annotated `degraded:true`

use std::sync::RwLock;

use serde_json::Value;

use crate::error::ApiError;

/// Context handed to each fallback. `cached` is the last successful response
/// for the logical key, if the cache still holds one.
pub struct FallbackCtx<'a> {
    pub error: &'a ApiError,
    pub cached: Option<Value>,
}

type FallbackFn = dyn Fn(&FallbackCtx) -> Option<Value> + Send + Sync;

struct Entry {
    priority: u8,
    name: &'static str,
    f: Box<FallbackFn>,
}

#[derive(Default)]
pub struct FallbackRegistry {
    entries: RwLock<Vec<Entry>>,
}

impl FallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Standard registry for read paths.
    pub fn with_defaults() -> Self {
        let reg = Self::new();
        reg.register(100, "cached-data", |ctx| ctx.cached.clone());
        reg.register(80, "retry-escalation", |_ctx| None);
        reg.register(50, "degraded", |_ctx| {
            Some(serde_json::json!({
                "values": [],
                "degraded": true,
            }))
        });
        reg
    }

    pub fn register(
        &self,
        priority: u8,
        name: &'static str,
        f: impl Fn(&FallbackCtx) -> Option<Value> + Send + Sync + 'static,
    ) {
        let mut entries = self.entries.write().expect("fallback lock");
        entries.push(Entry {
            priority,
            name,
            f: Box::new(f),
        });
        entries.sort_by(|a, b| b.priority.cmp(&a.priority));
    }

    /// Highest-priority fallback whose precondition holds. Returns the
    /// winning entry's name alongside its value.
    pub fn resolve(&self, ctx: &FallbackCtx) -> Option<(&'static str, Value)> {
        let entries = self.entries.read().expect("fallback lock");
        for entry in entries.iter() {
            if let Some(value) = (entry.f)(ctx) {
                tracing::debug!(fallback = entry.name, priority = entry.priority, "fallback used");
                return Some((entry.name, value));
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ApiError, ErrorCode};
    use serde_json::json;

    #[test]
    fn cached_data_wins_when_present() {
        let reg = FallbackRegistry::with_defaults();
        let err = ApiError::new(ErrorCode::CircuitOpen, "open");
        let (name, value) = reg
            .resolve(&FallbackCtx {
                error: &err,
                cached: Some(json!({ "values": [["cached"]] })),
            })
            .unwrap();
        assert_eq!(name, "cached-data");
        assert_eq!(value["values"][0][0], "cached");
    }

    #[test]
    fn degrades_when_no_cache() {
        let reg = FallbackRegistry::with_defaults();
        let err = ApiError::new(ErrorCode::CircuitOpen, "open");
        let (name, value) = reg
            .resolve(&FallbackCtx {
                error: &err,
                cached: None,
            })
            .unwrap();
        assert_eq!(name, "degraded");
        assert_eq!(value["degraded"], true);
    }
}
