use http::{header, Method};
use tower_governor::{governor::GovernorConfigBuilder, GovernorLayer};
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;

use sheetlink_backend::config::Config;
use sheetlink_backend::state::AppState;
use sheetlink_backend::{mcp, system_monitor};

fn build_app(state: AppState) -> axum::Router {
    let config = &state.config;

    // CORS — only the configured origins; none configured means same-origin.
    let origins: Vec<header::HeaderValue> = config
        .allowed_origins
        .iter()
        .filter_map(|origin| match origin.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!("ignoring unparseable ALLOWED_ORIGINS entry: {origin}");
                None
            }
        })
        .collect();
    let cors = CorsLayer::new()
        .allow_origin(tower_http::cors::AllowOrigin::list(origins))
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([
            header::CONTENT_TYPE,
            header::AUTHORIZATION,
            header::HeaderName::from_static("last-event-id"),
            header::HeaderName::from_static("x-session-id"),
            header::HeaderName::from_static("mcp-session-id"),
            header::HeaderName::from_static("traceparent"),
        ])
        .max_age(std::time::Duration::from_secs(86_400));

    // Per-IP request pacing at the edge.
    let governor_conf = GovernorConfigBuilder::default()
        .per_second(config.rate_limit_per_second)
        .burst_size(config.rate_limit_burst)
        .finish()
        .expect("rate limiter config");

    sheetlink_backend::create_router(state)
        .layer(GovernorLayer::new(governor_conf))
        .layer(cors)
        .layer(SetResponseHeaderLayer::overriding(
            header::X_CONTENT_TYPE_OPTIONS,
            header::HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::X_FRAME_OPTIONS,
            header::HeaderValue::from_static("DENY"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::REFERRER_POLICY,
            header::HeaderValue::from_static("strict-origin-when-cross-origin"),
        ))
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    use tracing_subscriber::EnvFilter;

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    if std::env::var("RUST_LOG_FORMAT").as_deref() == Ok("json") {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_ansi(true)
            .init();
    }

    dotenvy::dotenv().ok();

    let config = Config::from_env().map_err(|e| anyhow::anyhow!("{e}"))?;
    let state = AppState::new(config).await?;

    // ── Background workers ───────────────────────────────────────────
    system_monitor::spawn(state.system_monitor.clone(), state.shutdown.clone());
    state.refresh.clone().spawn(state.shutdown.clone());
    {
        let tasks = state.tasks.clone();
        let capabilities = state.capabilities.clone();
        state.sessions.clone().spawn_sweeper(state.shutdown.clone(), move |swept| {
            let tasks = tasks.clone();
            let capabilities = capabilities.clone();
            tokio::spawn(async move {
                for session_id in swept {
                    tasks.remove_session(&session_id).await;
                    capabilities.remove(&session_id).await;
                }
            });
        });
    }
    {
        let transactions = state.transactions.clone();
        let shutdown = state.shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = tokio::time::sleep(std::time::Duration::from_secs(60)) => {
                        transactions.sweep().await;
                    }
                }
            }
        });
    }

    state.mark_ready();

    // ── Transport selection ──────────────────────────────────────────
    if std::env::var("TRANSPORT").as_deref() == Ok("stdio") {
        let shutdown = state.shutdown.clone();
        let stdio_state = state.clone();
        tokio::select! {
            result = mcp::stdio::run(stdio_state, shutdown.clone()) => result?,
            _ = shutdown_signal() => {}
        }
        shutdown_gracefully(&state).await;
        return Ok(());
    }

    let ip: std::net::IpAddr = state
        .config
        .host
        .parse()
        .unwrap_or(std::net::IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED));
    let addr = std::net::SocketAddr::new(ip, state.config.port);
    let app = build_app(state.clone());

    print_banner(state.config.port);
    tracing::info!("sheetlink gateway listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    shutdown_gracefully(&state).await;
    Ok(())
}

/// Stop background workers, close sessions, dispose per-session stores.
async fn shutdown_gracefully(state: &AppState) {
    state.shutdown.cancel();
    let closed = state.sessions.shutdown_all().await;
    for session_id in closed {
        state.tasks.remove_session(&session_id).await;
        state.capabilities.remove(&session_id).await;
    }
    tracing::info!("graceful shutdown complete");
}

fn print_banner(port: u16) {
    println!();
    println!("  \x1b[1;32m>>>  SHEETLINK  <<<\x1b[0m");
    println!("  \x1b[32mSpreadsheet gateway for AI assistants\x1b[0m");
    println!("  \x1b[1;36mhttp://localhost:{port}\x1b[0m");
    println!();
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {},
            _ = sigterm.recv() => {},
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
    tracing::info!("shutdown signal received, starting graceful shutdown");
}
