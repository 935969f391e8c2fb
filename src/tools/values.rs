//! Value tools: read, write, append, clear.
//!
//! Reads flow dedup → cache → merger → client, with the circuit-open
//! fallback chain behind them. Writes flow through the safety gate, which
//! routes execution into the batcher.

use serde_json::{json, Value};

use crate::a1::A1Range;
use crate::cache::{values_key, DependencyTag, NS_VALUES};
use crate::error::{success_envelope, ApiError, ErrorCode};
use crate::handlers::{apply_verbosity, Verbosity};
use crate::mcp::context::RequestContext;
use crate::pipeline::dedup::Deduplicator;
use crate::resilience::FallbackCtx;
use crate::safety::{DiffOptions, MutationRequest, ProgressFn, SafetyOptions};
use crate::sheets::client::CallContext;
use crate::sheets::types::ValueRange;

use super::{optional_str, required_str, required_values};

pub async fn read(ctx: &RequestContext, params: &Value) -> Result<Value, ApiError> {
    let spreadsheet_id = required_str(params, "spreadsheet_id")?;
    let reference = required_str(params, "range")?;
    let value_render = optional_str(params, "value_render_option", "FORMATTED_VALUE").to_string();
    let major_dimension = optional_str(params, "major_dimension", "ROWS").to_string();
    let verbosity = Verbosity::from_params(params);
    let call_ctx = ctx.call_context();

    let range = ctx
        .state
        .resolver
        .resolve(&spreadsheet_id, &reference, &call_ctx)
        .await?;

    ctx.state.refresh.prefetch_spreadsheet(&spreadsheet_id);

    let cache_key = values_key(&spreadsheet_id, &range, &value_render, &major_dimension);
    ctx.state
        .tracker
        .record(&cache_key, &spreadsheet_id, Some(&range), false);

    let dedup_key = Deduplicator::key(
        "values.get",
        &json!({
            "spreadsheet_id": spreadsheet_id,
            "range": range,
            "value_render": value_render,
            "major_dimension": major_dimension,
        }),
    );

    // Shared work: cache probe, merged read, cache fill. A deadline hit
    // below detaches this caller without cancelling the flight.
    let shared = {
        let state = ctx.state.clone();
        let spreadsheet_id = spreadsheet_id.clone();
        let range = range.clone();
        let cache_key = cache_key.clone();
        let value_render = value_render.clone();
        let major_dimension = major_dimension.clone();
        ctx.state.dedup.run(dedup_key, move || async move {
            if let Some(hit) = state.cache.get(NS_VALUES, &cache_key).await {
                return Ok(hit);
            }
            let vr = state
                .merger
                .read(
                    &spreadsheet_id,
                    &range,
                    &value_render,
                    &major_dimension,
                    &CallContext::default(),
                )
                .await?;
            let value = serde_json::to_value(&vr)
                .map_err(|e| ApiError::internal(format!("serialize value range: {e}")))?;
            let tags = A1Range::parse(&range)
                .ok()
                .map(|r| {
                    vec![DependencyTag {
                        spreadsheet_id: spreadsheet_id.clone(),
                        range: r,
                    }]
                })
                .unwrap_or_default();
            state
                .cache
                .set(
                    NS_VALUES,
                    &cache_key,
                    value.clone(),
                    state.config.cache_ttl_values,
                    tags,
                )
                .await;
            Ok(value)
        })
    };

    let outcome = tokio::time::timeout(ctx.remaining(), shared)
        .await
        .map_err(|_| ApiError::timeout("read deadline elapsed; request detached"))?;

    let (value, fallback) = match outcome {
        Ok(value) => (value, None),
        Err(err) if err.code == ErrorCode::CircuitOpen => {
            let stale = ctx.state.cache.get_stale(NS_VALUES, &cache_key).await;
            let fb_ctx = FallbackCtx {
                error: &err,
                cached: stale,
            };
            match ctx.state.fallbacks.resolve(&fb_ctx) {
                Some((name, value)) => {
                    ctx.state.client.breakers().get("values.get").note_fallback();
                    tracing::warn!(range = %range, fallback = name, "read served by fallback");
                    (value, Some(name))
                }
                None => return Err(err),
            }
        }
        Err(err) => return Err(err),
    };

    let vr: ValueRange = serde_json::from_value(value).unwrap_or_default();
    let mut payload = json!({
        "spreadsheet_id": spreadsheet_id,
        "range": range,
        "major_dimension": major_dimension,
        "values": vr.values,
    });
    if let Some(fallback) = fallback {
        payload["fallback"] = json!(fallback);
        payload["degraded"] = json!(fallback == "degraded");
    }
    Ok(apply_verbosity(
        success_envelope("read", payload, None),
        verbosity,
    ))
}

pub async fn write(ctx: &RequestContext, params: &Value) -> Result<Value, ApiError> {
    let spreadsheet_id = required_str(params, "spreadsheet_id")?;
    let reference = required_str(params, "range")?;
    let values = required_values(params)?;
    let value_input_option = optional_str(params, "value_input_option", "USER_ENTERED").to_string();
    let verbosity = Verbosity::from_params(params);
    let safety = SafetyOptions::from_params(params);
    let diff = DiffOptions::from_params(params, &ctx.state.config);
    let call_ctx = ctx.call_context();

    if safety.require_confirmation {
        ctx.state
            .capabilities
            .require_elicitation(&ctx.session.id)
            .await?;
    }

    let range = ctx
        .state
        .resolver
        .resolve(&spreadsheet_id, &reference, &call_ctx)
        .await?;
    let parsed = A1Range::parse(&range)?;
    let estimated_cells: u64 = values.iter().map(|row| row.len() as u64).sum();

    let req = MutationRequest {
        spreadsheet_id: spreadsheet_id.clone(),
        range: parsed,
        estimated_cells,
        destructive: false,
        safety,
        diff,
    };

    let summary = ctx
        .state
        .gate
        .execute(req, Some(progress_fn(ctx)), {
            let state = ctx.state.clone();
            let spreadsheet_id = spreadsheet_id.clone();
            let range = range.clone();
            move || async move {
                let resp = state
                    .batcher
                    .update(
                        &spreadsheet_id,
                        &range,
                        values,
                        &value_input_option,
                        false,
                        &CallContext::default(),
                    )
                    .await?;
                serde_json::to_value(resp)
                    .map_err(|e| ApiError::internal(format!("serialize update response: {e}")))
            }
        }, &call_ctx)
        .await?;

    let mut payload = json!({
        "spreadsheet_id": spreadsheet_id,
        "range": summary.range,
        "dry_run": summary.dry_run,
    });
    if summary.dry_run {
        payload["estimated_cells"] = json!(summary.estimated_cells);
    } else {
        payload["updated_range"] = summary.result["updatedRange"].clone();
        payload["updated_cells"] = summary.result["updatedCells"].clone();
        payload["updated_rows"] = summary.result["updatedRows"].clone();
    }
    if let Some(diff) = &summary.diff {
        payload["diff"] = diff.clone();
    }
    Ok(apply_verbosity(
        success_envelope("write", payload, summary.meta()),
        verbosity,
    ))
}

pub async fn append(ctx: &RequestContext, params: &Value) -> Result<Value, ApiError> {
    let spreadsheet_id = required_str(params, "spreadsheet_id")?;
    let sheet = required_str(params, "sheet")?;
    let values = required_values(params)?;
    let value_input_option = optional_str(params, "value_input_option", "USER_ENTERED").to_string();
    let overwrite = params
        .get("overwrite")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let verbosity = Verbosity::from_params(params);
    let safety = SafetyOptions::from_params(params);
    let call_ctx = ctx.call_context();

    if safety.require_confirmation {
        ctx.state
            .capabilities
            .require_elicitation(&ctx.session.id)
            .await?;
    }

    let estimated_cells: u64 = values.iter().map(|row| row.len() as u64).sum();
    let req = MutationRequest {
        spreadsheet_id: spreadsheet_id.clone(),
        range: A1Range::whole_sheet(sheet.clone()),
        estimated_cells,
        destructive: false,
        safety,
        diff: DiffOptions::from_params(params, &ctx.state.config),
    };

    let summary = ctx
        .state
        .gate
        .execute(req, Some(progress_fn(ctx)), {
            let state = ctx.state.clone();
            let spreadsheet_id = spreadsheet_id.clone();
            let sheet = sheet.clone();
            move || async move {
                let resp = state
                    .batcher
                    .append(
                        &spreadsheet_id,
                        &sheet,
                        values,
                        &value_input_option,
                        overwrite,
                        &CallContext::default(),
                    )
                    .await?;
                serde_json::to_value(resp)
                    .map_err(|e| ApiError::internal(format!("serialize append response: {e}")))
            }
        }, &call_ctx)
        .await?;

    let mut payload = json!({
        "spreadsheet_id": spreadsheet_id,
        "sheet": sheet,
        "dry_run": summary.dry_run,
    });
    if summary.dry_run {
        payload["estimated_cells"] = json!(summary.estimated_cells);
    } else {
        payload["updated_range"] = summary.result["updatedRange"].clone();
        payload["updated_cells"] = summary.result["updatedCells"].clone();
        payload["updated_rows"] = summary.result["updatedRows"].clone();
    }
    Ok(apply_verbosity(
        success_envelope("append", payload, summary.meta()),
        verbosity,
    ))
}

pub async fn clear(ctx: &RequestContext, params: &Value) -> Result<Value, ApiError> {
    let spreadsheet_id = required_str(params, "spreadsheet_id")?;
    let reference = required_str(params, "range")?;
    let verbosity = Verbosity::from_params(params);
    let safety = SafetyOptions::from_params(params);
    let call_ctx = ctx.call_context();

    if safety.require_confirmation {
        ctx.state
            .capabilities
            .require_elicitation(&ctx.session.id)
            .await?;
    }

    let range = ctx
        .state
        .resolver
        .resolve(&spreadsheet_id, &reference, &call_ctx)
        .await?;
    let parsed = A1Range::parse(&range)?;
    let estimated_cells = parsed.estimated_cells();

    let req = MutationRequest {
        spreadsheet_id: spreadsheet_id.clone(),
        range: parsed,
        estimated_cells,
        // Clearing loses data: snapshot even without an explicit request.
        destructive: true,
        safety,
        diff: DiffOptions::from_params(params, &ctx.state.config),
    };

    let summary = ctx
        .state
        .gate
        .execute(req, Some(progress_fn(ctx)), {
            let state = ctx.state.clone();
            let spreadsheet_id = spreadsheet_id.clone();
            let range = range.clone();
            move || async move {
                let resp = state
                    .client
                    .values_clear(&spreadsheet_id, &range, &CallContext::default())
                    .await?;
                Ok(json!({ "cleared_range": resp.cleared_range }))
            }
        }, &call_ctx)
        .await?;

    let mut payload = json!({
        "spreadsheet_id": spreadsheet_id,
        "range": summary.range,
        "dry_run": summary.dry_run,
    });
    if !summary.dry_run {
        payload["cleared_range"] = summary.result["cleared_range"].clone();
    }
    Ok(apply_verbosity(
        success_envelope("clear", payload, summary.meta()),
        verbosity,
    ))
}

fn progress_fn(ctx: &RequestContext) -> ProgressFn {
    let ctx = ctx.clone();
    std::sync::Arc::new(move |phase, fraction| {
        ctx.emit_progress(fraction, 1.0, Some(phase.as_str()));
    })
}
