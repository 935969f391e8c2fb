//! Error taxonomy and response envelopes.
//!
//! Every handler returns either the success envelope
//! `{success:true, action, …, _meta?}` or the error envelope
//! `{success:false, error:{code, message, retryable, …}}` — never a mix.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};

// ── Error codes ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    InvalidParams,
    InvalidRequest,
    PreconditionFailed,
    NotFound,
    RangeNotFound,
    NoData,
    AuthError,
    PermissionDenied,
    RateLimitExceeded,
    QuotaExceeded,
    TransactionTimeout,
    CircuitOpen,
    FeatureUnavailable,
    ElicitationUnavailable,
    SamplingUnavailable,
    InternalError,
    ParseError,
    ConfigError,
    TooManySessions,
    Timeout,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidParams => "INVALID_PARAMS",
            ErrorCode::InvalidRequest => "INVALID_REQUEST",
            ErrorCode::PreconditionFailed => "PRECONDITION_FAILED",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::RangeNotFound => "RANGE_NOT_FOUND",
            ErrorCode::NoData => "NO_DATA",
            ErrorCode::AuthError => "AUTH_ERROR",
            ErrorCode::PermissionDenied => "PERMISSION_DENIED",
            ErrorCode::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
            ErrorCode::QuotaExceeded => "QUOTA_EXCEEDED",
            ErrorCode::TransactionTimeout => "TRANSACTION_TIMEOUT",
            ErrorCode::CircuitOpen => "CIRCUIT_OPEN",
            ErrorCode::FeatureUnavailable => "FEATURE_UNAVAILABLE",
            ErrorCode::ElicitationUnavailable => "ELICITATION_UNAVAILABLE",
            ErrorCode::SamplingUnavailable => "SAMPLING_UNAVAILABLE",
            ErrorCode::InternalError => "INTERNAL_ERROR",
            ErrorCode::ParseError => "PARSE_ERROR",
            ErrorCode::ConfigError => "CONFIG_ERROR",
            ErrorCode::TooManySessions => "TOO_MANY_SESSIONS",
            ErrorCode::Timeout => "TIMEOUT",
        }
    }

    /// Whether a client may retry the same call without changing it.
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            ErrorCode::RateLimitExceeded
                | ErrorCode::QuotaExceeded
                | ErrorCode::CircuitOpen
                | ErrorCode::TooManySessions
                | ErrorCode::Timeout
                | ErrorCode::InternalError
        )
    }

    pub fn http_status(&self) -> StatusCode {
        match self {
            ErrorCode::InvalidParams | ErrorCode::InvalidRequest | ErrorCode::ParseError => {
                StatusCode::BAD_REQUEST
            }
            ErrorCode::PreconditionFailed => StatusCode::PRECONDITION_FAILED,
            ErrorCode::NotFound | ErrorCode::RangeNotFound | ErrorCode::NoData => {
                StatusCode::NOT_FOUND
            }
            ErrorCode::AuthError => StatusCode::UNAUTHORIZED,
            ErrorCode::PermissionDenied => StatusCode::FORBIDDEN,
            ErrorCode::RateLimitExceeded
            | ErrorCode::QuotaExceeded
            | ErrorCode::TooManySessions => StatusCode::TOO_MANY_REQUESTS,
            ErrorCode::TransactionTimeout | ErrorCode::Timeout => StatusCode::REQUEST_TIMEOUT,
            ErrorCode::CircuitOpen => StatusCode::SERVICE_UNAVAILABLE,
            ErrorCode::FeatureUnavailable
            | ErrorCode::ElicitationUnavailable
            | ErrorCode::SamplingUnavailable => StatusCode::NOT_IMPLEMENTED,
            ErrorCode::InternalError | ErrorCode::ConfigError => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// One-line default resolution hint. Individual errors may override.
    fn default_resolution(&self) -> &'static str {
        match self {
            ErrorCode::InvalidParams => "Check the tool parameters against the schema and retry",
            ErrorCode::InvalidRequest => "Fix the request shape and resend",
            ErrorCode::PreconditionFailed => "Satisfy the stated precondition, then retry",
            ErrorCode::NotFound => "Verify the spreadsheet id and that the caller can access it",
            ErrorCode::RangeNotFound => "Verify the sheet name and A1 range exist",
            ErrorCode::NoData => "The range is valid but empty — widen it or write data first",
            ErrorCode::AuthError => "Refresh or reconfigure the Google credential",
            ErrorCode::PermissionDenied => "Grant the missing scopes via the authorization URL",
            ErrorCode::RateLimitExceeded => "Back off and retry after the indicated delay",
            ErrorCode::QuotaExceeded => "Wait for quota reset or reduce call volume",
            ErrorCode::TransactionTimeout => "Begin a new transaction and re-queue the operations",
            ErrorCode::CircuitOpen => "Upstream is failing — wait for the breaker reset window",
            ErrorCode::FeatureUnavailable => "This deployment does not enable the feature",
            ErrorCode::ElicitationUnavailable => {
                "The connected client does not support elicitation"
            }
            ErrorCode::SamplingUnavailable => "The connected client does not support sampling",
            ErrorCode::InternalError => "Retry once; report if it persists",
            ErrorCode::ParseError => "The payload is not valid JSON-RPC",
            ErrorCode::ConfigError => "Fix the server environment configuration",
            ErrorCode::TooManySessions => "Close an existing session before opening another",
            ErrorCode::Timeout => "The request deadline elapsed — retry with a longer timeout",
        }
    }
}

// ── ApiError ─────────────────────────────────────────────────────────────

/// Structured, actionable error. Cloneable so shared in-flight work can
/// fan the same failure out to every waiting caller.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{}: {}", .code.as_str(), .message)]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
    pub resolution: Option<String>,
    pub resolution_steps: Vec<String>,
    pub retry_strategy: Option<String>,
    pub suggested_tools: Vec<String>,
    pub details: Option<Value>,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            resolution: None,
            resolution_steps: Vec::new(),
            retry_strategy: None,
            suggested_tools: Vec::new(),
            details: None,
        }
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidParams, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Timeout, message)
    }

    pub fn with_resolution(mut self, resolution: impl Into<String>) -> Self {
        self.resolution = Some(resolution.into());
        self
    }

    pub fn with_steps(mut self, steps: Vec<String>) -> Self {
        self.resolution_steps = steps;
        self
    }

    pub fn with_retry_strategy(mut self, strategy: impl Into<String>) -> Self {
        self.retry_strategy = Some(strategy.into());
        self
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn with_suggested_tools(mut self, tools: Vec<String>) -> Self {
        self.suggested_tools = tools;
        self
    }

    /// `{success:false, error:{…}}` — the only failure shape clients see.
    pub fn to_envelope(&self) -> Value {
        let mut error = json!({
            "code": self.code.as_str(),
            "message": self.message,
            "retryable": self.code.retryable(),
            "resolution": self
                .resolution
                .clone()
                .unwrap_or_else(|| self.code.default_resolution().to_string()),
        });
        let obj = error.as_object_mut().expect("error envelope is an object");
        if !self.resolution_steps.is_empty() {
            obj.insert("resolution_steps".into(), json!(self.resolution_steps));
        }
        if let Some(strategy) = &self.retry_strategy {
            obj.insert("retry_strategy".into(), json!(strategy));
        }
        if !self.suggested_tools.is_empty() {
            obj.insert("suggested_tools".into(), json!(self.suggested_tools));
        }
        if let Some(details) = &self.details {
            obj.insert("details".into(), details.clone());
        }
        json!({ "success": false, "error": error })
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.code.http_status(), Json(self.to_envelope())).into_response()
    }
}

// ── Success envelope ─────────────────────────────────────────────────────

/// `{success:true, action, <payload>, _meta?}`. `payload` must be an object;
/// its fields are flattened next to `action`.
pub fn success_envelope(action: &str, payload: Value, meta: Option<Value>) -> Value {
    let mut out = json!({ "success": true, "action": action });
    let obj = out.as_object_mut().expect("success envelope is an object");
    if let Value::Object(map) = payload {
        for (k, v) in map {
            obj.insert(k, v);
        }
    } else if !payload.is_null() {
        obj.insert("result".into(), payload);
    }
    if let Some(meta) = meta {
        obj.insert("_meta".into(), meta);
    }
    out
}
