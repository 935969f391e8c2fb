//! Per-request context.
//!
//! Built by the transport for each inbound request and dropped when the
//! handler returns. Carries the correlation ids, the deadline every
//! suspension point checks, and the progress emitter that routes
//! `notifications/progress` back through the owning session's stream.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Value};

use crate::sheets::client::CallContext;
use crate::session::Session;
use crate::state::AppState;
use crate::trace_context::TraceContext;

#[derive(Clone)]
pub struct RequestContext {
    pub request_id: Value,
    pub trace: TraceContext,
    pub deadline: Instant,
    pub session: Arc<Session>,
    pub progress_token: Option<Value>,
    pub state: AppState,
}

impl RequestContext {
    pub fn new(
        state: AppState,
        session: Arc<Session>,
        request_id: Value,
        trace: TraceContext,
        progress_token: Option<Value>,
    ) -> Self {
        let deadline = Instant::now() + state.config.request_timeout;
        Self {
            request_id,
            trace,
            deadline,
            session,
            progress_token,
            state,
        }
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// Upstream call context: this request's deadline plus a child span for
    /// trace propagation.
    pub fn call_context(&self) -> CallContext {
        CallContext {
            deadline: Some(self.deadline),
            traceparent: Some(self.trace.child().to_traceparent()),
        }
    }

    /// Emit a progress notification to the owning session, if the caller
    /// supplied a progress token.
    pub fn emit_progress(&self, progress: f64, total: f64, message: Option<&str>) {
        let Some(token) = &self.progress_token else {
            return;
        };
        let mut params = json!({
            "progressToken": token,
            "progress": progress,
            "total": total,
        });
        if let Some(message) = message {
            params["message"] = json!(message);
        }
        self.session.send(json!({
            "jsonrpc": "2.0",
            "method": "notifications/progress",
            "params": params,
        }));
    }
}
