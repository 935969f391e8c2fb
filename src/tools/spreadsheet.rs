//! Workbook tools: metadata and snapshots.

use serde_json::{json, Value};

use crate::a1::A1Range;
use crate::cache::{spreadsheet_key, NS_SPREADSHEET};
use crate::error::{success_envelope, ApiError};
use crate::handlers::{apply_verbosity, Verbosity};
use crate::mcp::context::RequestContext;
use crate::sheets::types::Spreadsheet;

use super::required_str;

pub async fn info(ctx: &RequestContext, params: &Value) -> Result<Value, ApiError> {
    let spreadsheet_id = required_str(params, "spreadsheet_id")?;
    let verbosity = Verbosity::from_params(params);
    let call_ctx = ctx.call_context();

    ctx.state.refresh.prefetch_spreadsheet(&spreadsheet_id);
    let cache_key = spreadsheet_key(&spreadsheet_id);
    ctx.state
        .tracker
        .record(&cache_key, &spreadsheet_id, None, true);

    let meta: Spreadsheet =
        if let Some(cached) = ctx.state.cache.get(NS_SPREADSHEET, &cache_key).await {
            serde_json::from_value(cached).unwrap_or_default()
        } else {
            let meta = ctx
                .state
                .client
                .spreadsheet_get(&spreadsheet_id, &call_ctx)
                .await?;
            ctx.state
                .cache
                .set(
                    NS_SPREADSHEET,
                    &cache_key,
                    serde_json::to_value(&meta).unwrap_or(Value::Null),
                    ctx.state.config.cache_ttl_spreadsheet,
                    Vec::new(),
                )
                .await;
            meta
        };

    let sheets: Vec<Value> = meta
        .sheets
        .iter()
        .map(|s| {
            json!({
                "sheet_id": s.properties.sheet_id,
                "title": s.properties.title,
                "rows": s.properties.grid_properties.row_count,
                "columns": s.properties.grid_properties.column_count,
            })
        })
        .collect();
    let named_ranges: Vec<Value> = meta
        .named_ranges
        .iter()
        .map(|nr| json!({ "name": nr.name }))
        .collect();

    Ok(apply_verbosity(
        success_envelope(
            "info",
            json!({
                "spreadsheet_id": meta.spreadsheet_id,
                "title": meta.properties.title,
                "sheets": sheets,
                "named_ranges": named_ranges,
            }),
            None,
        ),
        verbosity,
    ))
}

pub async fn snapshot(ctx: &RequestContext, params: &Value) -> Result<Value, ApiError> {
    let action = required_str(params, "action")?;
    let spreadsheet_id = required_str(params, "spreadsheet_id")?;
    let call_ctx = ctx.call_context();

    match action.as_str() {
        "create" => {
            let info = ctx
                .state
                .snapshots
                .create(&spreadsheet_id, &call_ctx)
                .await?;
            Ok(success_envelope(
                "snapshot_create",
                json!({
                    "spreadsheet_id": spreadsheet_id,
                    "snapshot_id": info.id,
                    "name": info.name,
                    "created_at": info.created_at,
                }),
                Some(json!({ "snapshot": info.to_meta() })),
            ))
        }
        "restore" => {
            let snapshot_id = required_str(params, "snapshot_id")?;
            ctx.state
                .snapshots
                .restore(&spreadsheet_id, &snapshot_id, &call_ctx)
                .await?;
            // Everything cached under this spreadsheet is now stale.
            ctx.state
                .cache
                .invalidate_range(
                    &spreadsheet_id,
                    &A1Range {
                        sheet: None,
                        start_row: None,
                        end_row: None,
                        start_col: None,
                        end_col: None,
                    },
                )
                .await;
            Ok(success_envelope(
                "snapshot_restore",
                json!({
                    "spreadsheet_id": spreadsheet_id,
                    "snapshot_id": snapshot_id,
                    "restored": true,
                }),
                None,
            ))
        }
        "list" => {
            let snapshots: Vec<Value> = ctx
                .state
                .snapshots
                .list_for(&spreadsheet_id)
                .into_iter()
                .map(|s| {
                    json!({
                        "snapshot_id": s.id,
                        "name": s.name,
                        "created_at": s.created_at,
                    })
                })
                .collect();
            Ok(success_envelope(
                "snapshot_list",
                json!({ "spreadsheet_id": spreadsheet_id, "snapshots": snapshots }),
                None,
            ))
        }
        other => Err(ApiError::invalid_params(format!(
            "unknown snapshot action {other:?} (expected create, restore, or list)"
        ))),
    }
}
