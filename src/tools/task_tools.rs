//! Task tool: status, cancellation, and listing for long-running calls.

use serde_json::{json, Value};

use crate::error::{success_envelope, ApiError};
use crate::mcp::context::RequestContext;

use super::required_str;

pub async fn handle(ctx: &RequestContext, params: &Value) -> Result<Value, ApiError> {
    let action = required_str(params, "action")?;
    let store = &ctx.state.tasks;

    match action.as_str() {
        "status" => {
            let task_id = required_str(params, "task_id")?;
            let record = store.get(&task_id).await?;
            Ok(success_envelope(
                "task_status",
                serde_json::to_value(record).unwrap_or(Value::Null),
                None,
            ))
        }
        "cancel" => {
            let task_id = required_str(params, "task_id")?;
            let record = store.cancel(&task_id).await?;
            // The owning worker observes the cancelled state at its next
            // suspension point.
            ctx.session.send(json!({
                "jsonrpc": "2.0",
                "method": "notifications/cancelled",
                "params": { "taskId": task_id },
            }));
            Ok(success_envelope(
                "task_cancel",
                serde_json::to_value(record).unwrap_or(Value::Null),
                None,
            ))
        }
        "list" => {
            let records = store.list(&ctx.session.id).await?;
            let count = records.len();
            Ok(success_envelope(
                "task_list",
                json!({ "tasks": records, "count": count }),
                None,
            ))
        }
        other => Err(ApiError::invalid_params(format!(
            "unknown task action {other:?}"
        ))),
    }
}
