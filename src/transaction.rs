//! Multi-operation atomic transactions.
//!
//! Operations queue FIFO while the transaction is open; commit compiles them
//! through the safety gate into as few upstream writes as possible (one
//! `values.batchUpdate` when the queue is homogeneous). With `auto_rollback`,
//! any sub-operation failure restores the pre-commit snapshot and the
//! transaction ends `rolled_back`. Queues growing past 20 and 50 operations
//! earn advisory warnings; an open transaction older than its lifetime
//! refuses further work with `TRANSACTION_TIMEOUT`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use serde_json::{json, Value};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::a1::A1Range;
use crate::config::Config;
use crate::error::{ApiError, ErrorCode};
use crate::safety::{DiffOptions, DiffTier, MutationRequest, SafetyGate, SafetyOptions};
use crate::sheets::client::{CallContext, SheetsClient};
use crate::sheets::types::ValueRange;
use crate::snapshot::{SnapshotInfo, SnapshotService};

const QUEUE_ADVISORY_SIZE: usize = 20;
const QUEUE_STRONG_ADVISORY_SIZE: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    Open,
    Committing,
    Committed,
    RolledBack,
    Failed,
}

impl TxState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TxState::Open => "open",
            TxState::Committing => "committing",
            TxState::Committed => "committed",
            TxState::RolledBack => "rolled_back",
            TxState::Failed => "failed",
        }
    }
}

/// A queued operation. Order of queueing is the order of execution.
#[derive(Debug, Clone)]
pub enum TxOp {
    Update {
        range: String,
        values: Vec<Vec<Value>>,
    },
    Append {
        sheet: String,
        values: Vec<Vec<Value>>,
    },
    Clear {
        range: String,
    },
}

impl TxOp {
    pub fn from_params(params: &Value) -> Result<Self, ApiError> {
        let kind = params
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| ApiError::invalid_params("operation requires a \"type\""))?;
        let values = || -> Result<Vec<Vec<Value>>, ApiError> {
            serde_json::from_value(params.get("values").cloned().unwrap_or(json!([])))
                .map_err(|_| ApiError::invalid_params("\"values\" must be a 2D array"))
        };
        match kind {
            "update" => Ok(TxOp::Update {
                range: required_str(params, "range")?,
                values: values()?,
            }),
            "append" => Ok(TxOp::Append {
                sheet: required_str(params, "sheet")?,
                values: values()?,
            }),
            "clear" => Ok(TxOp::Clear {
                range: required_str(params, "range")?,
            }),
            other => Err(ApiError::invalid_params(format!(
                "unknown operation type {other:?}"
            ))),
        }
    }

    fn describe(&self) -> Value {
        match self {
            TxOp::Update { range, values } => json!({
                "type": "update", "range": range, "rows": values.len(),
            }),
            TxOp::Append { sheet, values } => json!({
                "type": "append", "sheet": sheet, "rows": values.len(),
            }),
            TxOp::Clear { range } => json!({ "type": "clear", "range": range }),
        }
    }

    fn estimated_cells(&self) -> u64 {
        match self {
            TxOp::Update { values, .. } | TxOp::Append { values, .. } => values
                .iter()
                .map(|row| row.len() as u64)
                .sum(),
            TxOp::Clear { range } => A1Range::parse(range)
                .map(|r| r.estimated_cells())
                .unwrap_or(0),
        }
    }

    fn range(&self) -> Option<A1Range> {
        match self {
            TxOp::Update { range, .. } | TxOp::Clear { range } => A1Range::parse(range).ok(),
            TxOp::Append { sheet, .. } => Some(A1Range::whole_sheet(sheet.clone())),
        }
    }
}

fn required_str(params: &Value, field: &str) -> Result<String, ApiError> {
    params
        .get(field)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| ApiError::invalid_params(format!("operation requires {field:?}")))
}

struct Transaction {
    id: String,
    spreadsheet_id: String,
    state: TxState,
    ops: Vec<TxOp>,
    snapshot: Option<SnapshotInfo>,
    auto_rollback: bool,
    created_at: Instant,
    created_at_utc: chrono::DateTime<chrono::Utc>,
    warnings: Vec<String>,
}

impl Transaction {
    fn status_json(&self) -> Value {
        json!({
            "transaction_id": self.id,
            "spreadsheet_id": self.spreadsheet_id,
            "state": self.state.as_str(),
            "queued_operations": self.ops.iter().map(TxOp::describe).collect::<Vec<_>>(),
            "queue_size": self.ops.len(),
            "auto_rollback": self.auto_rollback,
            "snapshot_id": self.snapshot.as_ref().map(|s| s.id.clone()),
            "created_at": self.created_at_utc.to_rfc3339(),
            "warnings": self.warnings,
        })
    }
}

pub struct TransactionManager {
    txs: RwLock<HashMap<String, Transaction>>,
    gate: Arc<SafetyGate>,
    snapshots: Arc<SnapshotService>,
    client: Arc<SheetsClient>,
    config: Arc<Config>,
}

impl TransactionManager {
    pub fn new(
        gate: Arc<SafetyGate>,
        snapshots: Arc<SnapshotService>,
        client: Arc<SheetsClient>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            txs: RwLock::new(HashMap::new()),
            gate,
            snapshots,
            client,
            config,
        }
    }

    pub async fn begin(&self, spreadsheet_id: &str, auto_rollback: bool) -> Value {
        let id = Uuid::new_v4().to_string();
        let tx = Transaction {
            id: id.clone(),
            spreadsheet_id: spreadsheet_id.to_string(),
            state: TxState::Open,
            ops: Vec::new(),
            snapshot: None,
            auto_rollback,
            created_at: Instant::now(),
            created_at_utc: chrono::Utc::now(),
            warnings: Vec::new(),
        };
        let status = tx.status_json();
        self.txs.write().await.insert(id.clone(), tx);
        tracing::info!(transaction_id = %id, spreadsheet_id, auto_rollback, "transaction opened");
        status
    }

    /// Queue an operation. Emits growth advisories and enforces the open
    /// lifetime.
    pub async fn queue(&self, tx_id: &str, op: TxOp) -> Result<Value, ApiError> {
        let mut txs = self.txs.write().await;
        let tx = txs
            .get_mut(tx_id)
            .ok_or_else(|| tx_not_found(tx_id))?;
        self.check_open(tx)?;

        tx.ops.push(op);
        let size = tx.ops.len();
        let mut warnings: Vec<String> = Vec::new();
        if size > QUEUE_STRONG_ADVISORY_SIZE {
            warnings.push(
                "transaction has more than 50 queued operations; commit soon or split the work"
                    .to_string(),
            );
        } else if size > QUEUE_ADVISORY_SIZE {
            warnings.push(
                "transaction queue is growing past 20 operations; consider committing".to_string(),
            );
        }
        for warning in &warnings {
            if !tx.warnings.contains(warning) {
                tx.warnings.push(warning.clone());
            }
        }
        Ok(json!({
            "transaction_id": tx_id,
            "queue_size": size,
            "warnings": warnings,
        }))
    }

    fn check_open(&self, tx: &mut Transaction) -> Result<(), ApiError> {
        if tx.state != TxState::Open {
            return Err(ApiError::new(
                ErrorCode::InvalidRequest,
                format!("transaction {} is {}", tx.id, tx.state.as_str()),
            ));
        }
        if tx.created_at.elapsed() > self.config.transaction_lifetime {
            tx.state = TxState::Failed;
            return Err(ApiError::new(
                ErrorCode::TransactionTimeout,
                format!(
                    "transaction {} exceeded its {}s open lifetime",
                    tx.id,
                    self.config.transaction_lifetime.as_secs()
                ),
            ));
        }
        Ok(())
    }

    /// Commit: snapshot (when auto_rollback), execute FIFO through the safety
    /// gate, restore on failure.
    pub async fn commit(&self, tx_id: &str, ctx: &CallContext) -> Result<Value, ApiError> {
        // Move to committing and take what we need under the lock.
        let (spreadsheet_id, ops, auto_rollback, warnings) = {
            let mut txs = self.txs.write().await;
            let tx = txs.get_mut(tx_id).ok_or_else(|| tx_not_found(tx_id))?;
            self.check_open(tx)?;
            if tx.ops.is_empty() {
                return Err(ApiError::new(
                    ErrorCode::PreconditionFailed,
                    "transaction has no queued operations",
                ));
            }
            tx.state = TxState::Committing;
            (
                tx.spreadsheet_id.clone(),
                tx.ops.clone(),
                tx.auto_rollback,
                tx.warnings.clone(),
            )
        };

        let estimated_cells: u64 = ops.iter().map(TxOp::estimated_cells).sum();
        let ranges: Vec<A1Range> = ops.iter().filter_map(TxOp::range).collect();
        let range = A1Range::bounding_box(ranges.iter())
            .unwrap_or_else(|| A1Range::whole_sheet(""));

        let req = MutationRequest {
            spreadsheet_id: spreadsheet_id.clone(),
            range,
            estimated_cells,
            destructive: false,
            safety: SafetyOptions {
                create_snapshot: auto_rollback,
                // A commit is an explicit multi-op intent; the queue-size
                // advisories are its guardrail, not the cell threshold.
                allow_risky: true,
                ..Default::default()
            },
            diff: DiffOptions {
                tier: DiffTier::Metadata,
                sample_size: self.config.default_diff_sample_size,
                max_full_diff_cells: self.config.max_full_diff_cells,
            },
        };

        let client = Arc::clone(&self.client);
        let exec_ops = ops.clone();
        let exec_spreadsheet = spreadsheet_id.clone();
        let outcome = self
            .gate
            .execute(
                req,
                None,
                move || async move { execute_ops(&client, &exec_spreadsheet, exec_ops).await },
                ctx,
            )
            .await;

        match outcome {
            Ok(summary) => {
                let mut txs = self.txs.write().await;
                if let Some(tx) = txs.get_mut(tx_id) {
                    tx.state = TxState::Committed;
                    tx.snapshot = summary.snapshot.clone();
                }
                tracing::info!(transaction_id = tx_id, ops = ops.len(), "transaction committed");
                let mut meta = summary.meta().unwrap_or_else(|| json!({}));
                if !warnings.is_empty() {
                    meta.as_object_mut()
                        .expect("meta object")
                        .insert("warnings".into(), json!(warnings));
                }
                Ok(json!({
                    "transaction_id": tx_id,
                    "state": "committed",
                    "committed_operations": ops.len(),
                    "result": summary.result,
                    "_meta": meta,
                }))
            }
            Err(err) => {
                // The gate stashed the snapshot in the error details.
                let snapshot_id = err
                    .details
                    .as_ref()
                    .and_then(|d| d.pointer("/snapshot/id"))
                    .and_then(Value::as_str)
                    .map(str::to_string);
                let failed_op = err
                    .details
                    .as_ref()
                    .and_then(|d| d.get("failed_operation"))
                    .cloned();

                let rolled_back = if auto_rollback {
                    if let Some(snapshot_id) = &snapshot_id {
                        match self
                            .snapshots
                            .restore(&spreadsheet_id, snapshot_id, ctx)
                            .await
                        {
                            Ok(()) => true,
                            Err(restore_err) => {
                                tracing::error!(
                                    transaction_id = tx_id,
                                    "rollback restore failed: {restore_err}"
                                );
                                false
                            }
                        }
                    } else {
                        false
                    }
                } else {
                    false
                };

                {
                    let mut txs = self.txs.write().await;
                    if let Some(tx) = txs.get_mut(tx_id) {
                        tx.state = if rolled_back {
                            TxState::RolledBack
                        } else {
                            TxState::Failed
                        };
                    }
                }

                let mut details = err.details.clone().unwrap_or_else(|| json!({}));
                if let Some(obj) = details.as_object_mut() {
                    obj.insert("transaction_id".into(), json!(tx_id));
                    obj.insert("rolled_back".into(), json!(rolled_back));
                    if let Some(failed_op) = failed_op {
                        obj.insert("failed_operation".into(), failed_op);
                    }
                }
                Err(ApiError::new(
                    err.code,
                    format!("transaction commit failed: {}", err.message),
                )
                .with_resolution(if rolled_back {
                    "All changes were rolled back from the snapshot; fix the failing operation and retry"
                } else {
                    "Inspect failed_operation in details; earlier operations may have applied"
                })
                .with_details(details))
            }
        }
    }

    pub async fn rollback(&self, tx_id: &str, ctx: &CallContext) -> Result<Value, ApiError> {
        let (spreadsheet_id, snapshot_id) = {
            let txs = self.txs.read().await;
            let tx = txs.get(tx_id).ok_or_else(|| tx_not_found(tx_id))?;
            (
                tx.spreadsheet_id.clone(),
                tx.snapshot.as_ref().map(|s| s.id.clone()),
            )
        };
        if let Some(snapshot_id) = snapshot_id {
            self.snapshots
                .restore(&spreadsheet_id, &snapshot_id, ctx)
                .await?;
        }
        let mut txs = self.txs.write().await;
        let tx = txs.get_mut(tx_id).ok_or_else(|| tx_not_found(tx_id))?;
        tx.state = TxState::RolledBack;
        Ok(tx.status_json())
    }

    pub async fn status(&self, tx_id: &str) -> Result<Value, ApiError> {
        let txs = self.txs.read().await;
        txs.get(tx_id)
            .map(Transaction::status_json)
            .ok_or_else(|| tx_not_found(tx_id))
    }

    pub async fn list(&self) -> Value {
        let txs = self.txs.read().await;
        let mut all: Vec<Value> = txs.values().map(Transaction::status_json).collect();
        all.sort_by_key(|t| t["created_at"].as_str().map(str::to_string));
        json!({ "transactions": all, "count": all.len() })
    }

    /// Drop terminal transactions older than twice the lifetime.
    pub async fn sweep(&self) {
        let cutoff = self.config.transaction_lifetime * 2;
        let mut txs = self.txs.write().await;
        txs.retain(|_, tx| {
            tx.state == TxState::Open
                || tx.state == TxState::Committing
                || tx.created_at.elapsed() < cutoff
        });
    }

    pub async fn open_count(&self) -> usize {
        self.txs
            .read()
            .await
            .values()
            .filter(|tx| tx.state == TxState::Open)
            .count()
    }
}

fn tx_not_found(tx_id: &str) -> ApiError {
    ApiError::new(
        ErrorCode::NotFound,
        format!("no transaction with id {tx_id}"),
    )
    .with_resolution("Call sheets_transaction with action \"begin\" first")
}

/// Execute the queue FIFO: homogeneous RAW updates collapse into a single
/// values.batchUpdate, anything else runs in order. The failing op's index
/// rides the error details for the manager's structured report.
async fn execute_ops(
    client: &Arc<SheetsClient>,
    spreadsheet_id: &str,
    ops: Vec<TxOp>,
) -> Result<Value, ApiError> {
    let ctx = CallContext::default();
    let all_updates = ops.iter().all(|op| matches!(op, TxOp::Update { .. }));

    if all_updates {
        let data: Vec<ValueRange> = ops
            .iter()
            .map(|op| match op {
                TxOp::Update { range, values } => ValueRange {
                    range: Some(range.clone()),
                    major_dimension: Some("ROWS".to_string()),
                    values: values.clone(),
                },
                _ => unreachable!("all_updates checked"),
            })
            .collect();
        let responses = client
            .values_batch_update(spreadsheet_id, data, "RAW", &ctx)
            .await
            .map_err(|err| tag_failed_op(err, 0, &ops[0]))?;
        let total: u32 = responses.iter().map(|r| r.updated_cells).sum();
        return Ok(json!({
            "updated_cells": total,
            "operations": responses.len(),
        }));
    }

    let mut results = Vec::new();
    for (index, op) in ops.iter().enumerate() {
        let result = match op {
            TxOp::Update { range, values } => client
                .values_update(spreadsheet_id, range, values.clone(), "RAW", &ctx)
                .await
                .map(|r| serde_json::to_value(r).unwrap_or(Value::Null)),
            TxOp::Append { sheet, values } => client
                .values_append(spreadsheet_id, sheet, values.clone(), "RAW", &ctx)
                .await
                .map(|r| serde_json::to_value(r).unwrap_or(Value::Null)),
            TxOp::Clear { range } => client
                .values_clear(spreadsheet_id, range, &ctx)
                .await
                .map(|r| json!({ "cleared_range": r.cleared_range })),
        };
        match result {
            Ok(value) => results.push(value),
            Err(err) => return Err(tag_failed_op(err, index, op)),
        }
    }
    Ok(json!({ "operations": results.len(), "results": results }))
}

fn tag_failed_op(mut err: ApiError, index: usize, op: &TxOp) -> ApiError {
    let mut details = err.details.take().unwrap_or_else(|| json!({}));
    if let Some(obj) = details.as_object_mut() {
        obj.insert(
            "failed_operation".into(),
            json!({ "index": index, "operation": op.describe() }),
        );
    }
    err.details = Some(details);
    err
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::TokenSource;
    use crate::cache::CacheManager;
    use crate::resilience::{BreakerConfig, BreakerRegistry, RetryPolicy, TokenBucket};
    use crate::sheets::mock::MockSheets;
    use serde_json::json;
    use std::time::Duration;

    fn manager(mock: Arc<MockSheets>) -> TransactionManager {
        manager_with_config(mock, Config::for_tests())
    }

    fn manager_with_config(mock: Arc<MockSheets>, config: Config) -> TransactionManager {
        let client = Arc::new(SheetsClient::new(
            mock,
            Arc::new(TokenSource::fixed(reqwest::Client::new(), "t")),
            Arc::new(BreakerRegistry::new(BreakerConfig::default())),
            RetryPolicy::new(0, Duration::from_millis(1), Duration::from_millis(2)),
            Arc::new(TokenBucket::new("reads", 1000.0, 1000.0)),
            Arc::new(TokenBucket::new("writes", 1000.0, 1000.0)),
        ));
        let config = Arc::new(config);
        let snapshots = Arc::new(SnapshotService::new(Arc::clone(&client)));
        let gate = Arc::new(SafetyGate::new(
            Arc::new(CacheManager::new(1024 * 1024, None)),
            Arc::clone(&snapshots),
            Arc::clone(&client),
            Arc::clone(&config),
        ));
        TransactionManager::new(gate, snapshots, client, config)
    }

    fn update_op(range: &str, value: &str) -> TxOp {
        TxOp::Update {
            range: range.to_string(),
            values: vec![vec![json!(value)]],
        }
    }

    #[tokio::test]
    async fn commit_applies_queued_updates_fifo() {
        let mock = Arc::new(MockSheets::new());
        mock.seed_sheet("ss1", "Sheet1", vec![vec![json!("old")]]);
        let m = manager(Arc::clone(&mock));

        let tx = m.begin("ss1", true).await;
        let tx_id = tx["transaction_id"].as_str().unwrap().to_string();
        // Two writes to the same cell: FIFO means the second wins.
        m.queue(&tx_id, update_op("Sheet1!A1", "first")).await.unwrap();
        m.queue(&tx_id, update_op("Sheet1!A1", "second")).await.unwrap();

        let out = m.commit(&tx_id, &CallContext::default()).await.unwrap();
        assert_eq!(out["state"], "committed");
        assert_eq!(out["committed_operations"], 2);
        assert_eq!(mock.grid("ss1", "Sheet1")[0][0], "second");
        // One batch write + snapshot copy; never one call per op.
        assert_eq!(mock.calls_for("values.batch_update"), 1);
        assert_eq!(mock.calls_for("drive.files.copy"), 1);
    }

    #[tokio::test]
    async fn queue_advisories_at_20_and_50() {
        let mock = Arc::new(MockSheets::new());
        mock.seed_sheet("ss1", "Sheet1", vec![]);
        let m = manager(mock);
        let tx = m.begin("ss1", false).await;
        let tx_id = tx["transaction_id"].as_str().unwrap().to_string();

        let mut at_21 = None;
        let mut at_51 = None;
        for i in 0..51 {
            let ack = m
                .queue(&tx_id, update_op(&format!("Sheet1!A{}", i + 1), "v"))
                .await
                .unwrap();
            match ack["queue_size"].as_u64().unwrap() {
                21 => at_21 = Some(ack["warnings"].clone()),
                51 => at_51 = Some(ack["warnings"].clone()),
                _ => {}
            }
        }
        assert!(at_21.unwrap()[0].as_str().unwrap().contains("growing past 20"));
        assert!(at_51.unwrap()[0].as_str().unwrap().contains("commit soon"));
    }

    #[tokio::test]
    async fn failed_commit_with_auto_rollback_restores_snapshot() {
        let mock = Arc::new(MockSheets::new());
        mock.seed_sheet("ss1", "Sheet1", vec![vec![json!("pristine")]]);
        let m = manager(Arc::clone(&mock));

        let tx = m.begin("ss1", true).await;
        let tx_id = tx["transaction_id"].as_str().unwrap().to_string();
        m.queue(&tx_id, update_op("Sheet1!A1", "poison")).await.unwrap();

        mock.push_failures(
            "values.batch_update",
            crate::sheets::types::UpstreamError::new(
                crate::sheets::types::UpstreamErrorKind::Internal,
                "write exploded",
            ),
            1,
        );

        let err = m.commit(&tx_id, &CallContext::default()).await.unwrap_err();
        let details = err.details.unwrap();
        assert_eq!(details["rolled_back"], true);
        assert_eq!(details["failed_operation"]["index"], 0);

        // On-disk state equals the pre-commit snapshot.
        assert_eq!(mock.grid("ss1", "Sheet1")[0][0], "pristine");
        let status = m.status(&tx_id).await.unwrap();
        assert_eq!(status["state"], "rolled_back");
    }

    #[tokio::test]
    async fn expired_transaction_refuses_queue_and_commit() {
        let mock = Arc::new(MockSheets::new());
        mock.seed_sheet("ss1", "Sheet1", vec![]);
        let mut config = Config::for_tests();
        config.transaction_lifetime = Duration::from_millis(0);
        let m = manager_with_config(mock, config);

        let tx = m.begin("ss1", false).await;
        let tx_id = tx["transaction_id"].as_str().unwrap().to_string();
        let err = m.queue(&tx_id, update_op("Sheet1!A1", "late")).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::TransactionTimeout);

        let status = m.status(&tx_id).await.unwrap();
        assert_eq!(status["state"], "failed");
    }

    #[tokio::test]
    async fn mixed_ops_execute_in_order() {
        let mock = Arc::new(MockSheets::new());
        mock.seed_sheet("ss1", "Sheet1", vec![vec![json!("a"), json!("b")]]);
        let m = manager(Arc::clone(&mock));
        let tx = m.begin("ss1", false).await;
        let tx_id = tx["transaction_id"].as_str().unwrap().to_string();

        m.queue(&tx_id, update_op("Sheet1!A1", "updated")).await.unwrap();
        m.queue(
            &tx_id,
            TxOp::Append {
                sheet: "Sheet1".to_string(),
                values: vec![vec![json!("appended")]],
            },
        )
        .await
        .unwrap();
        m.queue(
            &tx_id,
            TxOp::Clear {
                range: "Sheet1!B1".to_string(),
            },
        )
        .await
        .unwrap();

        m.commit(&tx_id, &CallContext::default()).await.unwrap();
        let grid = mock.grid("ss1", "Sheet1");
        assert_eq!(grid[0][0], "updated");
        assert_eq!(grid[0][1], Value::Null); // cleared after append
        assert_eq!(grid[1][0], "appended");
    }
}
