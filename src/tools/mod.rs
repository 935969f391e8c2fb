//! Tool registry: definitions and dispatch by name.
//!
//! Every handler is a thin adapter — parameter parsing, range resolution,
//! then a trip through the shared pipeline (dedup/merge/cache for reads,
//! safety gate + batcher for writes). The registry is the single place a
//! tool name maps to code.

pub mod spreadsheet;
pub mod task_tools;
pub mod transactions;
pub mod values;

use serde_json::{json, Value};

use crate::error::{ApiError, ErrorCode};
use crate::mcp::context::RequestContext;

pub const TOOL_NAMES: &[&str] = &[
    "sheets_read",
    "sheets_write",
    "sheets_append",
    "sheets_clear",
    "sheets_info",
    "sheets_snapshot",
    "sheets_transaction",
    "sheets_task",
];

/// Tool descriptors for `tools/list`. With deferred schemas only names and
/// descriptions go out; the full schema is served on first call.
pub fn definitions(deferred: bool) -> Vec<Value> {
    let defs = vec![
        (
            "sheets_read",
            "Read a range of values. Accepts A1, header:Name, named:RangeName, and meta:key references.",
            json!({
                "type": "object",
                "required": ["spreadsheet_id", "range"],
                "properties": {
                    "spreadsheet_id": { "type": "string" },
                    "range": { "type": "string", "description": "A1 or semantic reference" },
                    "value_render_option": { "type": "string", "enum": ["FORMATTED_VALUE", "UNFORMATTED_VALUE", "FORMULA"] },
                    "major_dimension": { "type": "string", "enum": ["ROWS", "COLUMNS"] },
                    "verbosity": { "type": "string", "enum": ["minimal", "standard", "detailed"] },
                },
            }),
        ),
        (
            "sheets_write",
            "Write a 2D block of values to a range. Supports dry-run, snapshots, and tiered diffs.",
            json!({
                "type": "object",
                "required": ["spreadsheet_id", "range", "values"],
                "properties": {
                    "spreadsheet_id": { "type": "string" },
                    "range": { "type": "string" },
                    "values": { "type": "array", "items": { "type": "array" } },
                    "value_input_option": { "type": "string", "enum": ["RAW", "USER_ENTERED"] },
                    "safety": safety_schema(),
                    "diff_options": diff_schema(),
                    "verbosity": { "type": "string", "enum": ["minimal", "standard", "detailed"] },
                },
            }),
        ),
        (
            "sheets_append",
            "Append rows to a sheet. Concurrent appends to one spreadsheet batch into a single API call.",
            json!({
                "type": "object",
                "required": ["spreadsheet_id", "sheet", "values"],
                "properties": {
                    "spreadsheet_id": { "type": "string" },
                    "sheet": { "type": "string" },
                    "values": { "type": "array", "items": { "type": "array" } },
                    "value_input_option": { "type": "string", "enum": ["RAW", "USER_ENTERED"] },
                    "overwrite": { "type": "boolean", "description": "Overwrite instead of inserting rows (bypasses batching)" },
                    "safety": safety_schema(),
                    "verbosity": { "type": "string", "enum": ["minimal", "standard", "detailed"] },
                },
            }),
        ),
        (
            "sheets_clear",
            "Clear a range. Destructive: snapshots by default.",
            json!({
                "type": "object",
                "required": ["spreadsheet_id", "range"],
                "properties": {
                    "spreadsheet_id": { "type": "string" },
                    "range": { "type": "string" },
                    "safety": safety_schema(),
                    "verbosity": { "type": "string", "enum": ["minimal", "standard", "detailed"] },
                },
            }),
        ),
        (
            "sheets_info",
            "Workbook metadata: sheets, dimensions, named ranges.",
            json!({
                "type": "object",
                "required": ["spreadsheet_id"],
                "properties": {
                    "spreadsheet_id": { "type": "string" },
                    "verbosity": { "type": "string", "enum": ["minimal", "standard", "detailed"] },
                },
            }),
        ),
        (
            "sheets_snapshot",
            "Create, list, or restore point-in-time snapshots used for undo.",
            json!({
                "type": "object",
                "required": ["action", "spreadsheet_id"],
                "properties": {
                    "action": { "type": "string", "enum": ["create", "restore", "list"] },
                    "spreadsheet_id": { "type": "string" },
                    "snapshot_id": { "type": "string" },
                },
            }),
        ),
        (
            "sheets_transaction",
            "Atomic multi-operation groups: begin, queue, commit (with rollback), status, list.",
            json!({
                "type": "object",
                "required": ["action"],
                "properties": {
                    "action": { "type": "string", "enum": ["begin", "queue", "commit", "rollback", "status", "list"] },
                    "spreadsheet_id": { "type": "string" },
                    "transaction_id": { "type": "string" },
                    "auto_rollback": { "type": "boolean" },
                    "operation": {
                        "type": "object",
                        "properties": {
                            "type": { "type": "string", "enum": ["update", "append", "clear"] },
                            "range": { "type": "string" },
                            "sheet": { "type": "string" },
                            "values": { "type": "array", "items": { "type": "array" } },
                        },
                    },
                },
            }),
        ),
        (
            "sheets_task",
            "Inspect or cancel long-running tool invocations.",
            json!({
                "type": "object",
                "required": ["action"],
                "properties": {
                    "action": { "type": "string", "enum": ["status", "cancel", "list"] },
                    "task_id": { "type": "string" },
                },
            }),
        ),
    ];

    defs.into_iter()
        .map(|(name, description, schema)| {
            if deferred {
                json!({ "name": name, "description": description })
            } else {
                json!({ "name": name, "description": description, "inputSchema": schema })
            }
        })
        .collect()
}

fn safety_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "dry_run": { "type": "boolean" },
            "create_snapshot": { "type": "boolean" },
            "require_confirmation": { "type": "boolean" },
            "allow_risky": { "type": "boolean" },
        },
    })
}

fn diff_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "tier": { "type": "string", "enum": ["metadata", "sample", "full"] },
            "sample_size": { "type": "integer" },
            "max_full_diff_cells": { "type": "integer" },
        },
    })
}

/// Dispatch a `tools/call` to its handler. Returns the success envelope.
pub async fn dispatch(
    ctx: &RequestContext,
    name: &str,
    params: &Value,
) -> Result<Value, ApiError> {
    ctx.session.touch();
    match name {
        "sheets_read" => values::read(ctx, params).await,
        "sheets_write" => values::write(ctx, params).await,
        "sheets_append" => values::append(ctx, params).await,
        "sheets_clear" => values::clear(ctx, params).await,
        "sheets_info" => spreadsheet::info(ctx, params).await,
        "sheets_snapshot" => spreadsheet::snapshot(ctx, params).await,
        "sheets_transaction" => transactions::handle(ctx, params).await,
        "sheets_task" => task_tools::handle(ctx, params).await,
        other => Err(ApiError::new(
            ErrorCode::NotFound,
            format!("unknown tool {other:?}"),
        )
        .with_suggested_tools(TOOL_NAMES.iter().map(|s| s.to_string()).collect())),
    }
}

// ── Shared parameter helpers ─────────────────────────────────────────────

pub(crate) fn required_str(params: &Value, field: &str) -> Result<String, ApiError> {
    params
        .get(field)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .ok_or_else(|| {
            ApiError::invalid_params(format!("missing required parameter {field:?}"))
        })
}

pub(crate) fn optional_str<'a>(params: &'a Value, field: &str, default: &'a str) -> &'a str {
    params.get(field).and_then(Value::as_str).unwrap_or(default)
}

pub(crate) fn required_values(params: &Value) -> Result<Vec<Vec<Value>>, ApiError> {
    let raw = params
        .get("values")
        .cloned()
        .ok_or_else(|| ApiError::invalid_params("missing required parameter \"values\""))?;
    serde_json::from_value(raw)
        .map_err(|_| ApiError::invalid_params("\"values\" must be a 2D array of cell values"))
}
