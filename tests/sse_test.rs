// SSE transport integration: open, resume with Last-Event-ID, message POST.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use sheetlink_backend::state::AppState;

fn app() -> (axum::Router, AppState) {
    let (state, _mock) = AppState::new_test();
    (sheetlink_backend::create_router(state.clone()), state)
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn open_stream_assigns_session_and_event_stream_headers() {
    let (app, _) = app();
    let response = app
        .oneshot(Request::builder().uri("/sse").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()["content-type"].to_str().unwrap(),
        "text/event-stream"
    );
    assert!(response.headers().get("x-session-id").is_some());
    assert!(response.headers().get("x-reconnected").is_none());
}

#[tokio::test]
async fn reconnect_with_last_event_id_reattaches_the_session() {
    let (app, _) = app();

    // First connection.
    let response = app
        .clone()
        .oneshot(Request::builder().uri("/sse").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let session_id = response.headers()["x-session-id"].to_str().unwrap().to_string();
    drop(response); // peer disconnects mid-stream

    // Reconnect with the previous session id and a Last-Event-ID cursor.
    let response = app
        .oneshot(
            Request::builder()
                .uri("/sse")
                .header("x-session-id", &session_id)
                .header("last-event-id", "0")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["x-reconnected"], "true");
    assert_eq!(
        response.headers()["x-session-id"].to_str().unwrap(),
        session_id
    );
}

#[tokio::test]
async fn stale_session_id_gets_a_fresh_session() {
    let (app, _) = app();
    let response = app
        .oneshot(
            Request::builder()
                .uri("/sse")
                .header("x-session-id", "long-gone")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().get("x-reconnected").is_none());
    assert_ne!(response.headers()["x-session-id"], "long-gone");
}

#[tokio::test]
async fn message_post_is_accepted_and_answered_on_the_stream() {
    let (app, state) = app();
    let response = app
        .clone()
        .oneshot(Request::builder().uri("/sse").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let session_id = response.headers()["x-session-id"].to_str().unwrap().to_string();

    let body = json!({ "jsonrpc": "2.0", "id": 1, "method": "ping", "params": {} });
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/sse/message")
                .header("content-type", "application/json")
                .header("x-session-id", &session_id)
                .body(Body::from(serde_json::to_vec(&body).unwrap()))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert_eq!(body_json(response).await["accepted"], true);

    // The JSON-RPC response rode the session's event stream.
    let session = state.sessions.get(&session_id).await.unwrap();
    let events = session.replay_after(0);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].payload["id"], 1);
    assert!(events[0].payload["result"].is_object());
}

#[tokio::test]
async fn message_post_without_session_is_rejected() {
    let (app, _) = app();
    let body = json!({ "jsonrpc": "2.0", "id": 1, "method": "ping" });

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/sse/message")
                .header("content-type", "application/json")
                .body(Body::from(serde_json::to_vec(&body).unwrap()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let json = body_json(response).await;
    assert_eq!(json["error"]["code"], "INVALID_REQUEST");

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/sse/message")
                .header("content-type", "application/json")
                .header("x-session-id", "missing")
                .body(Body::from(serde_json::to_vec(&body).unwrap()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
