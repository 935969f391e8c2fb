//! Streaming transports.
//!
//! - `GET  /sse` — open (or resume, via `Last-Event-ID` + `X-Session-ID`) an
//!   event stream. Responses to posted messages and server notifications
//!   ride this stream with monotonically increasing event ids.
//! - `POST /sse/message` — submit a JSON-RPC message for an SSE session.
//! - `POST /mcp` — streamable HTTP: one POST per message, session id carried
//!   in the `Mcp-Session-Id` header (generated and echoed when absent).

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use serde_json::{json, Value};

use crate::auth::UserId;
use crate::error::{ApiError, ErrorCode};
use crate::mcp::server;
use crate::session::{Session, TransportKind};
use crate::state::AppState;
use crate::trace_context::{TraceContext, TRACEPARENT_HEADER};

const SESSION_ID_HEADER: &str = "x-session-id";
const MCP_SESSION_HEADER: &str = "mcp-session-id";

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn trace_from(headers: &HeaderMap) -> TraceContext {
    TraceContext::from_traceparent(header_str(headers, TRACEPARENT_HEADER))
}

// ── GET /sse ─────────────────────────────────────────────────────────────

pub async fn sse_stream(
    State(state): State<AppState>,
    Extension(UserId(user_id)): Extension<UserId>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let last_event_id: Option<u64> =
        header_str(&headers, "last-event-id").and_then(|v| v.parse().ok());

    // Resume when the named session still exists; otherwise a fresh one.
    let mut reconnected = false;
    let session: Arc<Session> = match header_str(&headers, SESSION_ID_HEADER) {
        Some(id) => match state.sessions.get(id).await {
            Some(existing) => {
                reconnected = true;
                existing
            }
            None => state.sessions.create(&user_id, TransportKind::Sse).await?,
        },
        None => state.sessions.create(&user_id, TransportKind::Sse).await?,
    };
    session.touch();

    let session_id = session.id.clone();
    tracing::info!(session_id = %session_id, reconnected, "sse stream attached");

    // Subscribe before computing the replay set, then suppress duplicates by
    // id — reconnection must never corrupt event ordering.
    let mut rx = session.subscribe();
    let replay = last_event_id
        .map(|id| session.replay_after(id))
        .unwrap_or_default();
    let shutdown = state.shutdown.clone();

    let stream_session_id = session_id.clone();
    let stream = async_stream::stream! {
        let mut last_sent: u64 = last_event_id.unwrap_or(0);

        if reconnected {
            yield Ok::<_, Infallible>(
                Event::default()
                    .event("reconnect")
                    .data(json!({ "session_id": stream_session_id }).to_string()),
            );
        } else {
            // MCP SSE handshake: tell the peer where to POST messages.
            yield Ok(Event::default()
                .event("endpoint")
                .data(format!("/sse/message?sessionId={stream_session_id}")));
        }

        for event in replay {
            last_sent = event.id;
            yield Ok(Event::default()
                .id(event.id.to_string())
                .event("message")
                .data(event.payload.to_string()));
        }

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                received = rx.recv() => match received {
                    Ok(event) => {
                        if event.id <= last_sent {
                            continue;
                        }
                        last_sent = event.id;
                        yield Ok(Event::default()
                            .id(event.id.to_string())
                            .event("message")
                            .data(event.payload.to_string()));
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(session_id = %stream_session_id, skipped, "sse listener lagged");
                        continue;
                    }
                    Err(_) => break,
                }
            }
        }
    };

    let mut response = Sse::new(stream)
        .keep_alive(
            KeepAlive::new()
                .interval(Duration::from_secs(15))
                .text("heartbeat"),
        )
        .into_response();
    let headers = response.headers_mut();
    headers.insert(
        "x-session-id",
        session_id.parse().expect("uuid is a valid header value"),
    );
    if reconnected {
        headers.insert("x-reconnected", "true".parse().expect("static header"));
    }
    Ok(response)
}

// ── POST /sse/message ────────────────────────────────────────────────────

pub async fn sse_message(
    State(state): State<AppState>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Result<Response, ApiError> {
    let session_id = header_str(&headers, SESSION_ID_HEADER)
        .map(str::to_string)
        .or_else(|| query.get("sessionId").cloned())
        .ok_or_else(|| {
            ApiError::new(
                ErrorCode::InvalidRequest,
                "missing X-Session-ID header or sessionId query parameter",
            )
        })?;
    let session = state.sessions.get(&session_id).await.ok_or_else(|| {
        ApiError::new(
            ErrorCode::NotFound,
            format!("no open session {session_id}"),
        )
        .with_resolution("Reconnect GET /sse to obtain a fresh session")
    })?;

    let trace = trace_from(&headers);
    if let Some(response) = server::dispatch(&state, &session, body, &trace).await {
        // Responses travel on the event stream, not this POST.
        session.send(response);
    }
    Ok((StatusCode::ACCEPTED, Json(json!({ "accepted": true }))).into_response())
}

// ── POST /mcp (streamable HTTP) ──────────────────────────────────────────

pub async fn mcp_post(
    State(state): State<AppState>,
    Extension(UserId(user_id)): Extension<UserId>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Result<Response, ApiError> {
    let session = match header_str(&headers, MCP_SESSION_HEADER) {
        Some(id) => state.sessions.get(id).await.ok_or_else(|| {
            ApiError::new(ErrorCode::NotFound, format!("no open session {id}"))
                .with_resolution("Re-initialize without the Mcp-Session-Id header")
        })?,
        None => {
            state
                .sessions
                .create(&user_id, TransportKind::StreamableHttp)
                .await?
        }
    };

    let trace = trace_from(&headers);
    let response = server::dispatch(&state, &session, body, &trace).await;

    let session_header = [(
        MCP_SESSION_HEADER,
        session.id.parse::<axum::http::HeaderValue>().expect("uuid header"),
    )];
    Ok(match response {
        Some(response) => (StatusCode::OK, session_header, Json(response)).into_response(),
        None => (StatusCode::ACCEPTED, session_header).into_response(),
    })
}
