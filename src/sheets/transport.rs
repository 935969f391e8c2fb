//! Upstream HTTP transport.
//!
//! The client shell talks to the Sheets/Drive APIs through this seam so
//! tests can substitute a scripted transport and count outbound calls.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use super::types::{UpstreamError, UpstreamErrorKind};

#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    /// Logical endpoint name — also the circuit breaker key
    /// (`values.get`, `spreadsheets.batch_update`, `drive.files.copy`, …).
    pub endpoint: &'static str,
    pub method: http::Method,
    pub url: String,
    pub body: Option<Value>,
}

impl UpstreamRequest {
    pub fn get(endpoint: &'static str, url: String) -> Self {
        Self {
            endpoint,
            method: http::Method::GET,
            url,
            body: None,
        }
    }

    pub fn post(endpoint: &'static str, url: String, body: Value) -> Self {
        Self {
            endpoint,
            method: http::Method::POST,
            url,
            body: Some(body),
        }
    }

    pub fn put(endpoint: &'static str, url: String, body: Value) -> Self {
        Self {
            endpoint,
            method: http::Method::PUT,
            url,
            body: Some(body),
        }
    }
}

#[async_trait]
pub trait SheetsTransport: Send + Sync {
    async fn execute(
        &self,
        req: &UpstreamRequest,
        bearer: &str,
        traceparent: Option<&str>,
    ) -> Result<Value, UpstreamError>;
}

/// Production transport: reqwest with HTTP/2 keep-alive pooling.
pub struct HttpTransport {
    http: reqwest::Client,
}

impl HttpTransport {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }
}

#[async_trait]
impl SheetsTransport for HttpTransport {
    async fn execute(
        &self,
        req: &UpstreamRequest,
        bearer: &str,
        traceparent: Option<&str>,
    ) -> Result<Value, UpstreamError> {
        let method = reqwest::Method::from_bytes(req.method.as_str().as_bytes())
            .expect("method name is valid");
        let mut builder = self
            .http
            .request(method, &req.url)
            .bearer_auth(bearer)
            .header("accept", "application/json");
        if let Some(tp) = traceparent {
            builder = builder.header("traceparent", tp);
        }
        if let Some(body) = &req.body {
            builder = builder.json(body);
        }

        let resp = builder.send().await.map_err(|e| {
            let kind = if e.is_timeout() || e.is_connect() {
                UpstreamErrorKind::Transient
            } else {
                UpstreamErrorKind::Internal
            };
            UpstreamError::new(kind, format!("request failed: {e}"))
        })?;

        let status = resp.status().as_u16();
        let retry_after = resp
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs);

        let body: Value = resp.json().await.unwrap_or(Value::Null);

        if (200..300).contains(&status) {
            return Ok(body);
        }

        let message = body
            .pointer("/error/message")
            .and_then(|m| m.as_str())
            .unwrap_or("upstream error")
            .to_string();

        let mut err = UpstreamError::new(classify_status(status), message);
        err.status = Some(status);
        err.retry_after = retry_after;
        if err.kind == UpstreamErrorKind::PermissionDenied {
            err.missing_scopes = missing_scopes(&body, &req.url);
        }
        Err(err)
    }
}

/// HTTP status → error kind. 5xx other than 500 are transient (load
/// balancer hiccups); 500 is a genuine upstream fault.
pub fn classify_status(status: u16) -> UpstreamErrorKind {
    match status {
        401 => UpstreamErrorKind::AuthExpired,
        403 => UpstreamErrorKind::PermissionDenied,
        404 => UpstreamErrorKind::NotFound,
        400 | 412 | 422 => UpstreamErrorKind::Invalid,
        408 => UpstreamErrorKind::Transient,
        429 => UpstreamErrorKind::RateLimited,
        500 => UpstreamErrorKind::Internal,
        501..=599 => UpstreamErrorKind::Transient,
        _ => UpstreamErrorKind::Internal,
    }
}

/// Scopes the failed call needed. Google rarely names them in the error
/// body, so fall back to the scope implied by the endpoint family.
fn missing_scopes(body: &Value, url: &str) -> Vec<String> {
    if let Some(scopes) = body
        .pointer("/error/details/0/metadata/missing_scopes")
        .and_then(|s| s.as_str())
    {
        return scopes.split(' ').map(str::to_string).collect();
    }
    if url.contains("/drive/") {
        vec!["https://www.googleapis.com/auth/drive.file".to_string()]
    } else {
        vec!["https://www.googleapis.com/auth/spreadsheets".to_string()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        assert_eq!(classify_status(429), UpstreamErrorKind::RateLimited);
        assert_eq!(classify_status(401), UpstreamErrorKind::AuthExpired);
        assert_eq!(classify_status(403), UpstreamErrorKind::PermissionDenied);
        assert_eq!(classify_status(404), UpstreamErrorKind::NotFound);
        assert_eq!(classify_status(400), UpstreamErrorKind::Invalid);
        assert_eq!(classify_status(500), UpstreamErrorKind::Internal);
        assert_eq!(classify_status(503), UpstreamErrorKind::Transient);
    }
}
