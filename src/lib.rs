pub mod a1;
pub mod auth;
pub mod cache;
pub mod config;
pub mod distributed;
pub mod error;
pub mod handlers;
pub mod mcp;
pub mod pipeline;
pub mod refresh;
pub mod resilience;
pub mod resolver;
pub mod safety;
pub mod session;
pub mod sheets;
pub mod snapshot;
pub mod state;
pub mod system_monitor;
pub mod tasks;
pub mod tools;
pub mod trace_context;
pub mod transaction;

use axum::extract::{DefaultBodyLimit, State};
use axum::middleware;
use axum::routing::{delete, get, post};
use axum::Router;

use state::AppState;

// ═══════════════════════════════════════════════════════════════════════
//  Request correlation middleware
// ═══════════════════════════════════════════════════════════════════════

/// Attach a correlation id to every request.
///
/// - Reuses an incoming `X-Request-Id`, otherwise mints a UUID v4
/// - Records it on the current tracing span as `request_id`
/// - Echoes it back in the `X-Request-Id` response header
async fn request_id_middleware(
    req: axum::http::Request<axum::body::Body>,
    next: axum::middleware::Next,
) -> axum::response::Response {
    let request_id = req
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    tracing::Span::current().record("request_id", request_id.as_str());
    tracing::debug!(request_id = %request_id, "request correlation id assigned");

    let mut response = next.run(req).await;
    if let Ok(header_value) = axum::http::HeaderValue::from_str(&request_id) {
        response.headers_mut().insert("x-request-id", header_value);
    }
    response
}

/// Build the application router with the given shared state.
/// Extracted from `main()` so integration tests can construct the app
/// without binding to a network port.
pub fn create_router(state: AppState) -> Router {
    // ── Public routes (no auth) ──────────────────────────────────────
    let public = Router::new()
        .route("/health/live", get(handlers::health::liveness))
        .route("/health/ready", get(handlers::health::readiness))
        // Legacy alias of readiness.
        .route("/health", get(handlers::health::readiness))
        .route("/stats", get(handlers::health::stats))
        .route("/info", get(handlers::health::info))
        .route("/trace", get(handlers::health::trace))
        .route("/metrics", get(metrics_handler))
        .route(
            "/metrics/circuit-breakers",
            get(handlers::health::circuit_breakers),
        )
        .route(
            "/.well-known/oauth-protected-resource",
            get(handlers::health::well_known_oauth),
        )
        .route(
            "/.well-known/mcp-configuration",
            get(handlers::health::well_known_mcp),
        );

    // ── Transport routes (bearer auth when configured) ───────────────
    let transport = Router::new()
        .route("/sse", get(handlers::sse::sse_stream))
        .route("/sse/message", post(handlers::sse::sse_message))
        .route("/mcp", post(handlers::sse::mcp_post))
        .route("/session/{id}", delete(handlers::sessions::delete_session))
        .route("/sessions", get(handlers::sessions::list_sessions))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_auth,
        ));

    public
        .merge(transport)
        // 8 MB body limit — must be before .with_state() for the Json extractor
        .layer(DefaultBodyLimit::max(8 * 1024 * 1024))
        .layer(axum::middleware::from_fn(request_id_middleware))
        .with_state(state)
}

// ── Prometheus-compatible metrics endpoint ───────────────────────────────

async fn metrics_handler(State(state): State<AppState>) -> String {
    let snapshot = state.system_monitor.read().await;
    let uptime = state.start_time.elapsed().as_secs();
    let mut out = String::with_capacity(4096);

    out.push_str(&format!(
        "# HELP uptime_seconds Gateway uptime in seconds\n\
         # TYPE uptime_seconds counter\n\
         uptime_seconds {uptime}\n\
         # HELP cpu_usage_percent CPU usage percentage\n\
         # TYPE cpu_usage_percent gauge\n\
         cpu_usage_percent {:.1}\n\
         # HELP memory_used_bytes Memory used in bytes\n\
         # TYPE memory_used_bytes gauge\n\
         memory_used_bytes {}\n",
        snapshot.cpu_usage_percent,
        (snapshot.memory_used_mb * 1024.0 * 1024.0) as u64,
    ));

    let sessions = state.sessions.count().await;
    out.push_str(&format!(
        "# HELP sessions_open Open peer sessions\n\
         # TYPE sessions_open gauge\n\
         sessions_open {sessions}\n"
    ));

    let cache = state.cache.stats().await;
    out.push_str(&format!(
        "# HELP cache_hits_total Cache hits\n\
         # TYPE cache_hits_total counter\n\
         cache_hits_total {}\n\
         # HELP cache_misses_total Cache misses\n\
         # TYPE cache_misses_total counter\n\
         cache_misses_total {}\n",
        cache["hits"], cache["misses"],
    ));

    let refresh = state.refresh.metrics_json();
    out.push_str(&format!(
        "# HELP refresh_total Background cache refreshes attempted\n\
         # TYPE refresh_total counter\n\
         refresh_total {}\n\
         # HELP refresh_failed_total Background cache refreshes failed\n\
         # TYPE refresh_failed_total counter\n\
         refresh_failed_total {}\n",
        refresh["total_refreshes"], refresh["failed_refreshes"],
    ));

    out.push_str(
        "# HELP circuit_breaker_state Breaker state (0=closed, 1=open, 2=half_open)\n\
         # TYPE circuit_breaker_state gauge\n",
    );
    for breaker in state.client.breakers().snapshots() {
        let value = match breaker.state {
            "closed" => 0,
            "open" => 1,
            _ => 2,
        };
        out.push_str(&format!(
            "circuit_breaker_state{{endpoint=\"{}\"}} {value}\n",
            breaker.name
        ));
    }

    out.push_str(
        "# HELP upstream_requests_total Upstream API requests\n\
         # TYPE upstream_requests_total counter\n",
    );
    if let Some(endpoints) = state.client.metrics_json().as_object() {
        for (endpoint, metrics) in endpoints {
            out.push_str(&format!(
                "upstream_requests_total{{endpoint=\"{endpoint}\"}} {}\n",
                metrics["requests"]
            ));
            out.push_str(&format!(
                "upstream_retries_total{{endpoint=\"{endpoint}\"}} {}\n",
                metrics["retries"]
            ));
        }
    }

    out
}
