//! Health, stats, info, trace, and well-known discovery endpoints.

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde_json::{json, Value};

use crate::mcp::server::{PROTOCOL_VERSION, SERVER_NAME};
use crate::state::AppState;
use crate::tools::TOOL_NAMES;
use crate::trace_context::TraceContext;

// ── GET /health/live ─────────────────────────────────────────────────────

/// Process is up and serving; never consults dependencies.
pub async fn liveness() -> Json<Value> {
    Json(json!({ "alive": true }))
}

// ── GET /health/ready (and legacy GET /health) ───────────────────────────

/// Ready once startup finished. 503 until then so load balancers hold
/// traffic back.
pub async fn readiness(State(state): State<AppState>) -> Result<Json<Value>, StatusCode> {
    if state.is_ready() {
        Ok(Json(json!({
            "ready": true,
            "version": env!("CARGO_PKG_VERSION"),
            "uptime_seconds": state.start_time.elapsed().as_secs(),
        })))
    } else {
        Err(StatusCode::SERVICE_UNAVAILABLE)
    }
}

// ── GET /stats ───────────────────────────────────────────────────────────

pub async fn stats(State(state): State<AppState>) -> Json<Value> {
    let snapshot = state.system_monitor.read().await;
    let trace = TraceContext::new_root();
    Json(json!({
        "uptime_seconds": state.start_time.elapsed().as_secs(),
        "cache": state.cache.stats().await,
        "dedup": state.dedup.stats(),
        "merger": state.merger.stats(),
        "batcher": state.batcher.stats(),
        "refresh": state.refresh.metrics_json(),
        "connections": state.sessions.stats().await,
        "transactions": { "open": state.transactions.open_count().await },
        "upstream": state.client.metrics_json(),
        "tracing": {
            "propagation": "w3c-traceparent",
            "sample_trace_id": trace.trace_id,
        },
        "memory": {
            "cpu_usage_percent": snapshot.cpu_usage_percent,
            "memory_used_mb": snapshot.memory_used_mb,
            "memory_total_mb": snapshot.memory_total_mb,
            "platform": snapshot.platform,
        },
    }))
}

// ── GET /metrics/circuit-breakers ────────────────────────────────────────

pub async fn circuit_breakers(State(state): State<AppState>) -> Json<Value> {
    let snapshots = state.client.breakers().snapshots();
    Json(json!({
        "breakers": snapshots,
        "count": snapshots.len(),
    }))
}

// ── GET /info ────────────────────────────────────────────────────────────

pub async fn info(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "name": SERVER_NAME,
        "version": env!("CARGO_PKG_VERSION"),
        "protocol_version": PROTOCOL_VERSION,
        "transports": ["stdio", "sse", "streamable_http"],
        "tools": TOOL_NAMES,
        "session_cap_per_user": state.config.max_sessions_per_user,
    }))
}

// ── GET /trace ───────────────────────────────────────────────────────────

/// Trace-context diagnostics: shows the ids a request would carry.
pub async fn trace(headers: axum::http::HeaderMap) -> Json<Value> {
    let incoming = headers
        .get(crate::trace_context::TRACEPARENT_HEADER)
        .and_then(|v| v.to_str().ok());
    let ctx = TraceContext::from_traceparent(incoming);
    Json(json!({
        "received_traceparent": incoming,
        "trace_id": ctx.trace_id,
        "span_id": ctx.span_id,
        "parent_span_id": ctx.parent_span_id,
        "outbound_traceparent": ctx.to_traceparent(),
    }))
}

// ── Well-known discovery ─────────────────────────────────────────────────

pub async fn well_known_oauth(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "resource": format!("http://{}:{}", state.config.host, state.config.port),
        "authorization_servers": ["https://accounts.google.com"],
        "scopes_supported": [
            "https://www.googleapis.com/auth/spreadsheets",
            "https://www.googleapis.com/auth/drive.file",
        ],
        "bearer_methods_supported": ["header"],
    }))
}

pub async fn well_known_mcp(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "name": SERVER_NAME,
        "version": env!("CARGO_PKG_VERSION"),
        "protocol_version": PROTOCOL_VERSION,
        "endpoints": {
            "sse": "/sse",
            "sse_message": "/sse/message",
            "streamable_http": "/mcp",
        },
        "capabilities": ["tools", "resources", "prompts", "logging", "tasks"],
        "session_header": "Mcp-Session-Id",
        "max_sessions_per_user": state.config.max_sessions_per_user,
    }))
}
