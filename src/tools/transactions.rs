//! Transaction tool: one action-tagged entry point over the manager.

use serde_json::Value;

use crate::error::{success_envelope, ApiError};
use crate::mcp::context::RequestContext;
use crate::transaction::TxOp;

use super::required_str;

pub async fn handle(ctx: &RequestContext, params: &Value) -> Result<Value, ApiError> {
    let action = required_str(params, "action")?;
    let call_ctx = ctx.call_context();
    let manager = &ctx.state.transactions;

    match action.as_str() {
        "begin" => {
            let spreadsheet_id = required_str(params, "spreadsheet_id")?;
            let auto_rollback = params
                .get("auto_rollback")
                .and_then(Value::as_bool)
                .unwrap_or(true);
            let status = manager.begin(&spreadsheet_id, auto_rollback).await;
            Ok(success_envelope("transaction_begin", status, None))
        }
        "queue" => {
            let tx_id = required_str(params, "transaction_id")?;
            let op = TxOp::from_params(
                params
                    .get("operation")
                    .ok_or_else(|| ApiError::invalid_params("queue requires \"operation\""))?,
            )?;
            let ack = manager.queue(&tx_id, op).await?;
            let warnings = ack.get("warnings").cloned();
            let meta = warnings
                .filter(|w| w.as_array().is_some_and(|a| !a.is_empty()))
                .map(|w| serde_json::json!({ "warnings": w }));
            Ok(success_envelope("transaction_queue", ack, meta))
        }
        "commit" => {
            let tx_id = required_str(params, "transaction_id")?;
            let mut out = manager.commit(&tx_id, &call_ctx).await?;
            let meta = out
                .as_object_mut()
                .and_then(|obj| obj.remove("_meta"));
            Ok(success_envelope("transaction_commit", out, meta))
        }
        "rollback" => {
            let tx_id = required_str(params, "transaction_id")?;
            let status = manager.rollback(&tx_id, &call_ctx).await?;
            Ok(success_envelope("transaction_rollback", status, None))
        }
        "status" => {
            let tx_id = required_str(params, "transaction_id")?;
            let status = manager.status(&tx_id).await?;
            Ok(success_envelope("transaction_status", status, None))
        }
        "list" => Ok(success_envelope(
            "transaction_list",
            manager.list().await,
            None,
        )),
        other => Err(ApiError::invalid_params(format!(
            "unknown transaction action {other:?}"
        ))),
    }
}
