//! Request deduplication.
//!
//! Logical request key: `method|stable_json(params)` where `stable_json`
//! serializes objects with sorted keys so parameter order never splits a
//! flight. Concurrent callers with the same key share one execution.

use std::future::Future;

use serde_json::Value;

use crate::error::ApiError;
use crate::pipeline::flight::{outcome, FlightMap};

#[derive(Default)]
pub struct Deduplicator {
    flights: FlightMap<String>,
}

impl Deduplicator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn key(method: &str, params: &Value) -> String {
        format!("{method}|{}", stable_json(params))
    }

    /// Run `work` once per in-flight key; everyone gets the same outcome.
    pub async fn run<F, Fut>(&self, key: String, work: F) -> Result<Value, ApiError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value, ApiError>> + Send + 'static,
    {
        let rx = self.flights.join(key, work);
        outcome(rx).await
    }

    pub fn stats(&self) -> Value {
        let (launches, joins) = self.flights.stats();
        serde_json::json!({
            "in_flight": self.flights.in_flight(),
            "executions": launches,
            "coalesced": joins,
        })
    }
}

/// Deterministic serialization: object keys sorted recursively, arrays in
/// order, scalars via serde_json.
pub fn stable_json(value: &Value) -> String {
    let mut out = String::new();
    write_stable(value, &mut out);
    out
}

fn write_stable(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');
                write_stable(&map[*key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_stable(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn stable_json_ignores_key_order() {
        let a = json!({ "b": 1, "a": { "y": 2, "x": [3, 4] } });
        let b = json!({ "a": { "x": [3, 4], "y": 2 }, "b": 1 });
        assert_eq!(stable_json(&a), stable_json(&b));
        assert_eq!(
            Deduplicator::key("values.get", &a),
            Deduplicator::key("values.get", &b)
        );
    }

    #[test]
    fn distinct_params_get_distinct_keys() {
        let a = Deduplicator::key("values.get", &json!({ "range": "A1" }));
        let b = Deduplicator::key("values.get", &json!({ "range": "A2" }));
        let c = Deduplicator::key("values.update", &json!({ "range": "A1" }));
        assert_ne!(a, b);
        assert_ne!(a, c);
    }

    #[tokio::test]
    async fn underlying_work_runs_exactly_once() {
        let dedup = Arc::new(Deduplicator::new());
        let counter = Arc::new(AtomicU64::new(0));
        let key = Deduplicator::key("values.get", &json!({ "range": "Sheet1!A1" }));

        let mut handles = Vec::new();
        for _ in 0..10 {
            let dedup = Arc::clone(&dedup);
            let counter = Arc::clone(&counter);
            let key = key.clone();
            handles.push(tokio::spawn(async move {
                dedup
                    .run(key, move || async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        Ok(json!({ "values": [["v"]] }))
                    })
                    .await
            }));
        }
        for handle in handles {
            let value = handle.await.unwrap().unwrap();
            assert_eq!(value["values"][0][0], "v");
        }
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
