//! HTTP handler modules and shared response helpers.
//!
//! - `health` — liveness/readiness, stats, info, trace, well-known discovery
//! - `sse` — SSE transport (stream + message POST) with resume
//! - `sessions` — session listing and deletion
//!
//! Plus the verbosity filter every tool response passes through.

pub mod health;
pub mod sessions;
pub mod sse;

use serde_json::Value;

/// Response trimming per the `verbosity` tool option.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Verbosity {
    Minimal,
    #[default]
    Standard,
    Detailed,
}

impl Verbosity {
    pub fn from_params(params: &Value) -> Self {
        match params.get("verbosity").and_then(Value::as_str) {
            Some("minimal") => Verbosity::Minimal,
            Some("detailed") => Verbosity::Detailed,
            _ => Verbosity::Standard,
        }
    }
}

/// Trim a success envelope in place:
/// - `minimal` drops diffs and advisory warnings, keeping the payload facts;
/// - `standard` keeps diff counts and samples but drops full cell listings;
/// - `detailed` passes everything through.
pub fn apply_verbosity(mut envelope: Value, verbosity: Verbosity) -> Value {
    let Some(obj) = envelope.as_object_mut() else {
        return envelope;
    };
    match verbosity {
        Verbosity::Detailed => {}
        Verbosity::Standard => {
            if let Some(diff) = obj.get_mut("diff").and_then(Value::as_object_mut) {
                diff.remove("changes");
            }
        }
        Verbosity::Minimal => {
            obj.remove("diff");
            if let Some(meta) = obj.get_mut("_meta").and_then(Value::as_object_mut) {
                meta.remove("warnings");
            }
            if obj
                .get("_meta")
                .and_then(Value::as_object)
                .is_some_and(|m| m.is_empty())
            {
                obj.remove("_meta");
            }
        }
    }
    envelope
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn envelope() -> Value {
        json!({
            "success": true,
            "action": "write",
            "updated_cells": 4,
            "diff": { "tier": "full", "changed_cells": 2, "changes": [{ "cell": "A1" }] },
            "_meta": { "warnings": ["big"], "snapshot": { "id": "snap-1" } },
        })
    }

    #[test]
    fn standard_drops_full_change_listing_only() {
        let out = apply_verbosity(envelope(), Verbosity::Standard);
        assert_eq!(out["diff"]["changed_cells"], 2);
        assert!(out["diff"].get("changes").is_none());
        assert_eq!(out["_meta"]["warnings"][0], "big");
    }

    #[test]
    fn minimal_keeps_facts_and_snapshot() {
        let out = apply_verbosity(envelope(), Verbosity::Minimal);
        assert_eq!(out["updated_cells"], 4);
        assert!(out.get("diff").is_none());
        assert!(out["_meta"].get("warnings").is_none());
        assert_eq!(out["_meta"]["snapshot"]["id"], "snap-1");
    }

    #[test]
    fn detailed_is_untouched() {
        assert_eq!(apply_verbosity(envelope(), Verbosity::Detailed), envelope());
    }
}
