// Health + observability endpoint integration tests.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::Value;
use tower::ServiceExt;

use sheetlink_backend::state::AppState;

/// Build a test app router backed by the in-memory mock upstream.
fn test_app() -> (axum::Router, AppState) {
    let (state, _mock) = AppState::new_test();
    (sheetlink_backend::create_router(state.clone()), state)
}

/// Collect a response body into a `serde_json::Value`.
async fn body_json(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn liveness_is_always_ok() {
    let (app, _) = test_app();
    let response = app
        .oneshot(Request::builder().uri("/health/live").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["alive"], true);
}

#[tokio::test]
async fn readiness_returns_503_until_marked_ready() {
    let (app, state) = test_app();
    let response = app
        .clone()
        .oneshot(Request::builder().uri("/health/ready").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

    state.mark_ready();
    let response = app
        .oneshot(Request::builder().uri("/health/ready").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["ready"], true);
    assert!(json["uptime_seconds"].is_u64());
}

#[tokio::test]
async fn legacy_health_aliases_readiness() {
    let (app, state) = test_app();
    state.mark_ready();
    let response = app
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["ready"], true);
}

#[tokio::test]
async fn metrics_exposition_has_gateway_series() {
    let (app, _) = test_app();
    let response = app
        .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(text.contains("# TYPE uptime_seconds counter"));
    assert!(text.contains("sessions_open"));
    assert!(text.contains("cache_hits_total"));
    assert!(text.contains("refresh_total"));
}

#[tokio::test]
async fn circuit_breaker_endpoint_returns_json() {
    let (app, _) = test_app();
    let response = app
        .oneshot(
            Request::builder()
                .uri("/metrics/circuit-breakers")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert!(json["breakers"].is_array());
    assert!(json["count"].is_u64());
}

#[tokio::test]
async fn stats_has_all_blocks() {
    let (app, _) = test_app();
    let response = app
        .oneshot(Request::builder().uri("/stats").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let json = body_json(response).await;
    for block in ["cache", "dedup", "merger", "batcher", "refresh", "connections", "tracing", "memory"] {
        assert!(json.get(block).is_some(), "missing stats block {block}");
    }
    assert_eq!(json["cache"]["distributed"], false);
}

#[tokio::test]
async fn nonexistent_route_returns_404() {
    let (app, _) = test_app();
    let response = app
        .oneshot(Request::builder().uri("/does-not-exist").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
