//! JSON-RPC 2.0 dispatch — the peer protocol core shared by all transports.
//!
//! Supports:
//! - `initialize` / `notifications/initialized` — handshake + capability capture
//! - `ping` — health check
//! - `tools/list`, `tools/call` — the tool surface
//! - `resources/list`, `prompts/list` — advertised but externally populated
//! - `logging/setLevel` — accepted
//!
//! Every `tools/call` is recorded in the task store so `sheets_task` can
//! report and cancel it, and failures come back in-band as `isError` results
//! carrying the structured error envelope.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use serde_json::{json, Value};

use crate::error::{ApiError, ErrorCode};
use crate::mcp::capabilities::PeerCapabilities;
use crate::mcp::context::RequestContext;
use crate::pipeline::dedup::stable_json;
use crate::session::Session;
use crate::state::AppState;
use crate::tasks::{TaskPatch, TaskRecord, TaskState};
use crate::tools;
use crate::trace_context::TraceContext;

pub const PROTOCOL_VERSION: &str = "2025-03-26";
pub const SERVER_NAME: &str = "SheetLink";

/// Handle one inbound JSON-RPC message. Returns `None` for notifications.
pub async fn dispatch(
    state: &AppState,
    session: &Arc<Session>,
    request: Value,
    trace: &TraceContext,
) -> Option<Value> {
    session.touch();
    let method = request
        .get("method")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let id = request.get("id").cloned();
    let params = request.get("params").cloned().unwrap_or(json!({}));

    tracing::debug!(
        method = %method,
        session_id = %session.id,
        trace_id = %trace.trace_id,
        "rpc dispatch"
    );

    let result: Result<Value, Value> = match method.as_str() {
        "initialize" => {
            let caps = PeerCapabilities::from_initialize_params(&params);
            state.capabilities.store(&session.id, caps).await;
            Ok(handle_initialize())
        }
        "notifications/initialized" => return None,
        "ping" => Ok(json!({})),
        "tools/list" => Ok(json!({
            "tools": tools::definitions(state.config.deferred_schemas),
        })),
        "tools/call" => handle_tools_call(state, session, &params, trace).await,
        "resources/list" => Ok(json!({ "resources": [] })),
        "prompts/list" => Ok(json!({ "prompts": [] })),
        "logging/setLevel" => Ok(json!({})),
        _ => Err(rpc_error(-32601, &format!("Method not found: {method}"), None)),
    };

    // Notifications never get a response, even on error.
    let id = id?;
    Some(match result {
        Ok(result) => json!({ "jsonrpc": "2.0", "id": id, "result": result }),
        Err(error) => json!({ "jsonrpc": "2.0", "id": id, "error": error }),
    })
}

fn handle_initialize() -> Value {
    json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": {
            "logging": {},
            "tools": { "listChanged": false },
            "resources": { "subscribe": false, "listChanged": false },
            "prompts": { "listChanged": false },
            "experimental": { "tasks": {} },
        },
        "serverInfo": {
            "name": SERVER_NAME,
            "version": env!("CARGO_PKG_VERSION"),
        },
    })
}

async fn handle_tools_call(
    state: &AppState,
    session: &Arc<Session>,
    params: &Value,
    trace: &TraceContext,
) -> Result<Value, Value> {
    let Some(name) = params.get("name").and_then(Value::as_str) else {
        return Err(rpc_error(-32602, "Missing 'name' parameter", None));
    };
    let arguments = params.get("arguments").cloned().unwrap_or(json!({}));
    let progress_token = params.pointer("/_meta/progressToken").cloned();

    // Track the invocation so sheets_task can see and cancel it.
    let fingerprint = stable_json(&arguments);
    let task = TaskRecord::new(&session.id, name, &fingerprint);
    let task_id = task.id.clone();
    let _ = state.tasks.create(task).await;
    let _ = state
        .tasks
        .update(
            &task_id,
            TaskPatch {
                state: Some(TaskState::Running),
                ..Default::default()
            },
        )
        .await;
    session.open_tasks.fetch_add(1, Ordering::Relaxed);

    let ctx = RequestContext::new(
        state.clone(),
        Arc::clone(session),
        json!(task_id.clone()),
        trace.clone(),
        progress_token,
    );
    let outcome = tools::dispatch(&ctx, name, &arguments).await;
    session.open_tasks.fetch_sub(1, Ordering::Relaxed);

    let envelope = match outcome {
        Ok(envelope) => {
            let _ = state
                .tasks
                .update(
                    &task_id,
                    TaskPatch {
                        state: Some(TaskState::Completed),
                        progress: Some(1.0),
                        result: Some(envelope.clone()),
                        ..Default::default()
                    },
                )
                .await;
            envelope
        }
        Err(err) => {
            let envelope = err.to_envelope();
            let _ = state
                .tasks
                .update(
                    &task_id,
                    TaskPatch {
                        state: Some(TaskState::Failed),
                        error: Some(envelope.clone()),
                        ..Default::default()
                    },
                )
                .await;
            envelope
        }
    };

    let is_error = envelope
        .get("success")
        .and_then(Value::as_bool)
        .map(|ok| !ok)
        .unwrap_or(true);
    Ok(json!({
        "content": [{
            "type": "text",
            "text": serde_json::to_string(&envelope).unwrap_or_default(),
        }],
        "structuredContent": envelope,
        "isError": is_error,
        "_meta": { "taskId": task_id },
    }))
}

fn rpc_error(code: i32, message: &str, data: Option<Value>) -> Value {
    let mut error = json!({ "code": code, "message": message });
    if let Some(data) = data {
        error["data"] = data;
    }
    error
}

/// Map an `ApiError` to a JSON-RPC protocol error (transport-level failures,
/// not tool results).
pub fn rpc_error_from(err: &ApiError) -> Value {
    let code = match err.code {
        ErrorCode::ParseError => -32700,
        ErrorCode::InvalidRequest => -32600,
        ErrorCode::InvalidParams => -32602,
        _ => -32000,
    };
    rpc_error(code, &err.message, Some(err.to_envelope()))
}
