//! Safety gate — the front door for every mutation.
//!
//! Pipeline: policy check → dry-run short-circuit → snapshot → execute (with
//! progress events) → tiered diff → range invalidation → summary. The gate
//! never auto-rolls-back a single operation; it hands the snapshot id to the
//! caller (and to the transaction manager, which does roll back).

use std::future::Future;
use std::sync::Arc;

use serde_json::{json, Value};

use crate::a1::{col_letters, A1Range};
use crate::cache::CacheManager;
use crate::config::Config;
use crate::error::{ApiError, ErrorCode};
use crate::sheets::client::{CallContext, SheetsClient};
use crate::snapshot::{SnapshotInfo, SnapshotService};

// ── Options ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default)]
pub struct SafetyOptions {
    pub dry_run: bool,
    pub create_snapshot: bool,
    pub require_confirmation: bool,
    pub allow_risky: bool,
}

impl SafetyOptions {
    pub fn from_params(params: &Value) -> Self {
        let safety = params.get("safety").cloned().unwrap_or(Value::Null);
        let flag = |name: &str| safety.get(name).and_then(Value::as_bool).unwrap_or(false);
        Self {
            dry_run: flag("dry_run"),
            create_snapshot: flag("create_snapshot"),
            require_confirmation: flag("require_confirmation"),
            allow_risky: flag("allow_risky"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffTier {
    Metadata,
    Sample,
    Full,
}

impl DiffTier {
    fn parse(s: Option<&str>) -> Self {
        match s {
            Some("full") => DiffTier::Full,
            Some("sample") => DiffTier::Sample,
            _ => DiffTier::Metadata,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DiffOptions {
    pub tier: DiffTier,
    pub sample_size: usize,
    pub max_full_diff_cells: usize,
}

impl DiffOptions {
    pub fn from_params(params: &Value, config: &Config) -> Self {
        let diff = params.get("diff_options").cloned().unwrap_or(Value::Null);
        Self {
            tier: DiffTier::parse(diff.get("tier").and_then(Value::as_str)),
            sample_size: diff
                .get("sample_size")
                .and_then(Value::as_u64)
                .map(|n| n as usize)
                .unwrap_or(config.default_diff_sample_size),
            max_full_diff_cells: diff
                .get("max_full_diff_cells")
                .and_then(Value::as_u64)
                .map(|n| n as usize)
                .unwrap_or(config.max_full_diff_cells),
        }
    }
}

/// One mutation as seen by the gate.
#[derive(Debug, Clone)]
pub struct MutationRequest {
    pub spreadsheet_id: String,
    pub range: A1Range,
    pub estimated_cells: u64,
    /// Destructive ops (clear, overwrite) snapshot by default.
    pub destructive: bool,
    pub safety: SafetyOptions,
    pub diff: DiffOptions,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressPhase {
    Validating,
    Snapshotting,
    Executing,
    Diffing,
    Finalizing,
}

impl ProgressPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProgressPhase::Validating => "validating",
            ProgressPhase::Snapshotting => "snapshotting",
            ProgressPhase::Executing => "executing",
            ProgressPhase::Diffing => "diffing",
            ProgressPhase::Finalizing => "finalizing",
        }
    }

    fn fraction(&self) -> f64 {
        match self {
            ProgressPhase::Validating => 0.1,
            ProgressPhase::Snapshotting => 0.3,
            ProgressPhase::Executing => 0.6,
            ProgressPhase::Diffing => 0.85,
            ProgressPhase::Finalizing => 1.0,
        }
    }
}

pub type ProgressFn = Arc<dyn Fn(ProgressPhase, f64) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct MutationSummary {
    pub dry_run: bool,
    pub range: String,
    pub estimated_cells: u64,
    pub snapshot: Option<SnapshotInfo>,
    pub diff: Option<Value>,
    pub warnings: Vec<String>,
    /// The executed operation's own response payload.
    pub result: Value,
}

impl MutationSummary {
    pub fn meta(&self) -> Option<Value> {
        let mut meta = serde_json::Map::new();
        if let Some(snapshot) = &self.snapshot {
            meta.insert("snapshot".into(), snapshot.to_meta());
        }
        if !self.warnings.is_empty() {
            meta.insert("warnings".into(), json!(self.warnings));
        }
        if meta.is_empty() {
            None
        } else {
            Some(Value::Object(meta))
        }
    }
}

// ── Gate ─────────────────────────────────────────────────────────────────

pub struct SafetyGate {
    cache: Arc<CacheManager>,
    snapshots: Arc<SnapshotService>,
    client: Arc<SheetsClient>,
    config: Arc<Config>,
}

impl SafetyGate {
    pub fn new(
        cache: Arc<CacheManager>,
        snapshots: Arc<SnapshotService>,
        client: Arc<SheetsClient>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            cache,
            snapshots,
            client,
            config,
        }
    }

    /// Run `op` through the full safety pipeline.
    pub async fn execute<F, Fut>(
        &self,
        req: MutationRequest,
        progress: Option<ProgressFn>,
        op: F,
        ctx: &CallContext,
    ) -> Result<MutationSummary, ApiError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value, ApiError>>,
    {
        let emit = |phase: ProgressPhase| {
            if let Some(progress) = &progress {
                progress(phase, phase.fraction());
            }
        };

        // 1. Policy.
        emit(ProgressPhase::Validating);
        let threshold = self.config.high_risk_cell_threshold;
        if req.estimated_cells > threshold && !req.safety.allow_risky {
            return Err(ApiError::new(
                ErrorCode::PreconditionFailed,
                format!(
                    "operation touches ~{} cells, above the {threshold}-cell risk threshold",
                    req.estimated_cells
                ),
            )
            .with_resolution("Re-run with safety.allow_risky=true to proceed anyway")
            .with_steps(vec![
                "Narrow the target range, or".to_string(),
                "Set safety.allow_risky=true and consider safety.create_snapshot=true"
                    .to_string(),
            ]));
        }

        // 2. Dry-run: preview only, zero side effects anywhere.
        if req.safety.dry_run {
            return Ok(MutationSummary {
                dry_run: true,
                range: req.range.to_a1(),
                estimated_cells: req.estimated_cells,
                snapshot: None,
                diff: Some(json!({
                    "tier": "metadata",
                    "projected": {
                        "changed_cells": req.estimated_cells,
                        "changed_rows": req.range.row_count(),
                        "changed_columns": req.range.col_count(),
                    },
                })),
                warnings: Vec::new(),
                result: Value::Null,
            });
        }

        // Before-image for sample/full diffs (bounded ranges only).
        let before = if req.diff.tier != DiffTier::Metadata && req.range.row_count().is_some() {
            self.read_range(&req, ctx).await
        } else {
            None
        };

        // 3. Snapshot.
        let snapshot = if req.safety.create_snapshot || req.destructive {
            emit(ProgressPhase::Snapshotting);
            Some(self.snapshots.create(&req.spreadsheet_id, ctx).await?)
        } else {
            None
        };

        // 4. Execute.
        emit(ProgressPhase::Executing);
        let result = match op().await {
            Ok(result) => result,
            Err(mut err) => {
                // The snapshot outlives the failure so the caller (or the
                // transaction manager) can decide to restore.
                if let Some(snapshot) = &snapshot {
                    let mut details = err.details.take().unwrap_or_else(|| json!({}));
                    if let Some(obj) = details.as_object_mut() {
                        obj.insert("snapshot".into(), snapshot.to_meta());
                    }
                    err.details = Some(details);
                }
                return Err(err);
            }
        };

        // 5. Diff.
        emit(ProgressPhase::Diffing);
        let after = if req.diff.tier != DiffTier::Metadata && before.is_some() {
            self.read_range(&req, ctx).await
        } else {
            None
        };
        let diff = Some(compute_diff(&req, before.as_deref(), after.as_deref(), &result));

        // 6. Invalidate before the caller sees the result.
        emit(ProgressPhase::Finalizing);
        self.cache
            .invalidate_range(&req.spreadsheet_id, &req.range)
            .await;

        Ok(MutationSummary {
            dry_run: false,
            range: req.range.to_a1(),
            estimated_cells: req.estimated_cells,
            snapshot,
            diff,
            warnings: Vec::new(),
            result,
        })
    }

    async fn read_range(&self, req: &MutationRequest, ctx: &CallContext) -> Option<Vec<Vec<Value>>> {
        self.client
            .values_get(
                &req.spreadsheet_id,
                &req.range.to_a1(),
                "UNFORMATTED_VALUE",
                "ROWS",
                ctx,
            )
            .await
            .ok()
            .map(|vr| vr.values)
    }
}

/// Tiered diff. Metadata counts come from the executed result where the API
/// reported them, falling back to the request estimate.
fn compute_diff(
    req: &MutationRequest,
    before: Option<&[Vec<Value>]>,
    after: Option<&[Vec<Value>]>,
    result: &Value,
) -> Value {
    let reported_cells = result
        .get("updated_cells")
        .or_else(|| result.get("updatedCells"))
        .and_then(Value::as_u64);

    let mut diff = json!({
        "tier": "metadata",
        "changed_cells": reported_cells.unwrap_or(req.estimated_cells),
        "changed_rows": result
            .get("updated_rows")
            .or_else(|| result.get("updatedRows"))
            .and_then(Value::as_u64)
            .or_else(|| req.range.row_count().map(u64::from)),
        "changed_columns": result
            .get("updated_columns")
            .or_else(|| result.get("updatedColumns"))
            .and_then(Value::as_u64)
            .or_else(|| req.range.col_count().map(u64::from)),
    });

    let (Some(before), Some(after)) = (before, after) else {
        return diff;
    };
    if req.diff.tier == DiffTier::Metadata {
        return diff;
    }

    let changes = cell_changes(before, after, &req.range);
    let obj = diff.as_object_mut().expect("diff is an object");
    obj.insert("changed_cells".into(), json!(changes.len()));

    match req.diff.tier {
        DiffTier::Metadata => {}
        DiffTier::Sample => {
            obj.insert("tier".into(), json!("sample"));
            obj.insert(
                "samples".into(),
                json!(changes
                    .iter()
                    .take(req.diff.sample_size)
                    .collect::<Vec<_>>()),
            );
        }
        DiffTier::Full => {
            if changes.len() > req.diff.max_full_diff_cells {
                // Too large for a full listing; downgrade with a marker.
                obj.insert("tier".into(), json!("sample"));
                obj.insert("truncated".into(), json!(true));
                obj.insert(
                    "samples".into(),
                    json!(changes
                        .iter()
                        .take(req.diff.sample_size)
                        .collect::<Vec<_>>()),
                );
            } else {
                obj.insert("tier".into(), json!("full"));
                obj.insert("changes".into(), json!(changes));
            }
        }
    }
    diff
}

fn cell_changes(before: &[Vec<Value>], after: &[Vec<Value>], range: &A1Range) -> Vec<Value> {
    let rows = before.len().max(after.len());
    let base_row = range.start_row.unwrap_or(0);
    let base_col = range.start_col.unwrap_or(0);
    let mut out = Vec::new();
    let empty: Vec<Value> = Vec::new();
    for r in 0..rows {
        let brow = before.get(r).unwrap_or(&empty);
        let arow = after.get(r).unwrap_or(&empty);
        let cols = brow.len().max(arow.len());
        for c in 0..cols {
            let b = brow.get(c).cloned().unwrap_or(Value::Null);
            let a = arow.get(c).cloned().unwrap_or(Value::Null);
            if b != a {
                let cell = format!(
                    "{}{}",
                    col_letters(base_col + c as u32),
                    base_row + r as u32 + 1
                );
                out.push(json!({ "cell": cell, "before": b, "after": a }));
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::TokenSource;
    use crate::resilience::{BreakerConfig, BreakerRegistry, RetryPolicy, TokenBucket};
    use crate::sheets::mock::MockSheets;
    use serde_json::json;
    use std::sync::Mutex;
    use std::time::Duration;

    fn gate(mock: Arc<MockSheets>) -> (SafetyGate, Arc<CacheManager>, Arc<SheetsClient>) {
        let client = Arc::new(SheetsClient::new(
            mock,
            Arc::new(TokenSource::fixed(reqwest::Client::new(), "t")),
            Arc::new(BreakerRegistry::new(BreakerConfig::default())),
            RetryPolicy::new(0, Duration::from_millis(1), Duration::from_millis(2)),
            Arc::new(TokenBucket::new("reads", 1000.0, 1000.0)),
            Arc::new(TokenBucket::new("writes", 1000.0, 1000.0)),
        ));
        let cache = Arc::new(CacheManager::new(1024 * 1024, None));
        let config = Arc::new(Config::for_tests());
        let gate = SafetyGate::new(
            Arc::clone(&cache),
            Arc::new(SnapshotService::new(Arc::clone(&client))),
            Arc::clone(&client),
            config,
        );
        (gate, cache, client)
    }

    fn request(range: &str, cells: u64, safety: SafetyOptions) -> MutationRequest {
        MutationRequest {
            spreadsheet_id: "ss1".to_string(),
            range: A1Range::parse(range).unwrap(),
            estimated_cells: cells,
            destructive: false,
            safety,
            diff: DiffOptions {
                tier: DiffTier::Metadata,
                sample_size: 5,
                max_full_diff_cells: 100,
            },
        }
    }

    #[tokio::test]
    async fn guardrail_blocks_risky_writes_without_allow_risky() {
        let mock = Arc::new(MockSheets::new());
        let (gate, _, _) = gate(mock);
        let req = request("Sheet1!A1:Z99999", 2_000_000, SafetyOptions::default());
        let err = gate
            .execute(req, None, || async { Ok(Value::Null) }, &CallContext::default())
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::PreconditionFailed);
        assert!(!err.resolution_steps.is_empty());
    }

    #[tokio::test]
    async fn allow_risky_bypasses_the_guardrail() {
        let mock = Arc::new(MockSheets::new());
        mock.seed_sheet("ss1", "Sheet1", vec![]);
        let (gate, _, _) = gate(mock);
        let req = request(
            "Sheet1!A1:Z99999",
            2_000_000,
            SafetyOptions {
                allow_risky: true,
                ..Default::default()
            },
        );
        let summary = gate
            .execute(req, None, || async { Ok(json!({ "ok": true })) }, &CallContext::default())
            .await
            .unwrap();
        assert!(!summary.dry_run);
    }

    #[tokio::test]
    async fn dry_run_is_a_pure_preview() {
        let mock = Arc::new(MockSheets::new());
        mock.seed_sheet("ss1", "Sheet1", vec![vec![json!("keep")]]);
        let (gate, cache, _) = gate(Arc::clone(&mock));
        cache
            .set(
                crate::cache::NS_VALUES,
                "probe",
                json!(1),
                Duration::from_secs(60),
                vec![crate::cache::DependencyTag {
                    spreadsheet_id: "ss1".to_string(),
                    range: A1Range::parse("Sheet1!A1:C50").unwrap(),
                }],
            )
            .await;

        let req = request(
            "Sheet1!A1:C50",
            150,
            SafetyOptions {
                dry_run: true,
                create_snapshot: true,
                ..Default::default()
            },
        );
        let summary = gate
            .execute(
                req,
                None,
                || async { panic!("dry-run must not execute") },
                &CallContext::default(),
            )
            .await
            .unwrap();

        assert!(summary.dry_run);
        assert!(summary.snapshot.is_none());
        assert_eq!(summary.diff.as_ref().unwrap()["projected"]["changed_cells"], 150);
        // Nothing was called upstream, nothing invalidated.
        assert_eq!(mock.total_calls(), 0);
        assert_eq!(cache.get(crate::cache::NS_VALUES, "probe").await, Some(json!(1)));
        assert_eq!(mock.grid("ss1", "Sheet1")[0][0], "keep");
    }

    #[tokio::test]
    async fn snapshot_then_execute_then_invalidate() {
        let mock = Arc::new(MockSheets::new());
        mock.seed_sheet("ss1", "Sheet1", vec![vec![json!("old"); 3]; 50]);
        let (gate, cache, client) = gate(Arc::clone(&mock));
        cache
            .set(
                crate::cache::NS_VALUES,
                "overlapping",
                json!("stale"),
                Duration::from_secs(60),
                vec![crate::cache::DependencyTag {
                    spreadsheet_id: "ss1".to_string(),
                    range: A1Range::parse("Sheet1!B2:B3").unwrap(),
                }],
            )
            .await;

        let req = request(
            "Sheet1!A1:C50",
            150,
            SafetyOptions {
                create_snapshot: true,
                ..Default::default()
            },
        );
        let ctx = CallContext::default();
        let exec_client = Arc::clone(&client);
        let summary = gate
            .execute(
                req,
                None,
                move || async move {
                    let resp = exec_client
                        .values_update(
                            "ss1",
                            "Sheet1!A1:C50",
                            vec![vec![json!("new"); 3]; 50],
                            "RAW",
                            &CallContext::default(),
                        )
                        .await?;
                    Ok(serde_json::to_value(resp).expect("serializable"))
                },
                &ctx,
            )
            .await
            .unwrap();

        assert!(summary.meta().unwrap()["snapshot"]["id"].is_string());
        let snapshot = summary.snapshot.expect("snapshot present");
        assert!(snapshot.id.starts_with("snap-"));
        // Overlapping cache entry is gone before we ever saw the summary.
        assert_eq!(cache.get(crate::cache::NS_VALUES, "overlapping").await, None);
        // Snapshot holds the pre-write values.
        assert_eq!(mock.grid(&snapshot.id, "Sheet1")[0][0], "old");
        assert_eq!(mock.grid("ss1", "Sheet1")[0][0], "new");
    }

    #[tokio::test]
    async fn full_diff_lists_changed_cells() {
        let mock = Arc::new(MockSheets::new());
        mock.seed_sheet("ss1", "Sheet1", vec![vec![json!("a"), json!("b")]]);
        let (gate, _, client) = gate(Arc::clone(&mock));

        let mut req = request("Sheet1!A1:B1", 2, SafetyOptions::default());
        req.diff.tier = DiffTier::Full;
        let exec_client = Arc::clone(&client);
        let summary = gate
            .execute(
                req,
                None,
                move || async move {
                    let resp = exec_client
                        .values_update(
                            "ss1",
                            "Sheet1!A1:B1",
                            vec![vec![json!("a"), json!("B!")]],
                            "RAW",
                            &CallContext::default(),
                        )
                        .await?;
                    Ok(serde_json::to_value(resp).expect("serializable"))
                },
                &CallContext::default(),
            )
            .await
            .unwrap();

        let diff = summary.diff.unwrap();
        assert_eq!(diff["tier"], "full");
        assert_eq!(diff["changed_cells"], 1);
        assert_eq!(diff["changes"][0]["cell"], "B1");
        assert_eq!(diff["changes"][0]["after"], "B!");
    }

    #[tokio::test]
    async fn progress_phases_fire_in_order() {
        let mock = Arc::new(MockSheets::new());
        mock.seed_sheet("ss1", "Sheet1", vec![]);
        let (gate, _, _) = gate(mock);
        let phases = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&phases);
        let progress: ProgressFn = Arc::new(move |phase, _| {
            seen.lock().expect("phases").push(phase.as_str());
        });

        gate.execute(
            request("Sheet1!A1:B2", 4, SafetyOptions::default()),
            Some(progress),
            || async { Ok(Value::Null) },
            &CallContext::default(),
        )
        .await
        .unwrap();

        assert_eq!(
            *phases.lock().expect("phases"),
            vec!["validating", "executing", "diffing", "finalizing"]
        );
    }
}
