//! Typed upstream client with the full resilience wrap.
//!
//! Every call flows: token bucket → circuit breaker → transport → classify →
//! (retry | refresh | surface). `AuthExpired` triggers exactly one silent
//! token refresh; a second one is terminal. Per-endpoint metrics feed the
//! Prometheus exposition.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::{json, Value};

use super::transport::{SheetsTransport, UpstreamRequest};
use super::types::{
    ClearValuesResponse, DriveFile, Spreadsheet, UpdateValuesResponse, UpstreamErrorKind,
    ValueRange,
};
use crate::auth::TokenSource;
use crate::error::ApiError;
use crate::resilience::{BreakerRegistry, RetryPolicy, TokenBucket};

const SHEETS_BASE: &str = "https://sheets.googleapis.com/v4/spreadsheets";
const DRIVE_BASE: &str = "https://www.googleapis.com/drive/v3/files";

/// Which token bucket paces the call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointGroup {
    Read,
    Write,
}

/// Per-call context threaded from the request pipeline.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    pub deadline: Option<Instant>,
    pub traceparent: Option<String>,
}

impl CallContext {
    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            deadline: Some(deadline),
            traceparent: None,
        }
    }
}

#[derive(Debug, Default, Clone)]
struct EndpointMetrics {
    requests: u64,
    failures: u64,
    retries: u64,
    total_duration_ms: u64,
}

pub struct SheetsClient {
    transport: Arc<dyn SheetsTransport>,
    tokens: Arc<TokenSource>,
    breakers: Arc<BreakerRegistry>,
    retry: RetryPolicy,
    read_bucket: Arc<TokenBucket>,
    write_bucket: Arc<TokenBucket>,
    metrics: Mutex<HashMap<&'static str, EndpointMetrics>>,
}

impl SheetsClient {
    pub fn new(
        transport: Arc<dyn SheetsTransport>,
        tokens: Arc<TokenSource>,
        breakers: Arc<BreakerRegistry>,
        retry: RetryPolicy,
        read_bucket: Arc<TokenBucket>,
        write_bucket: Arc<TokenBucket>,
    ) -> Self {
        Self {
            transport,
            tokens,
            breakers,
            retry,
            read_bucket,
            write_bucket,
            metrics: Mutex::new(HashMap::new()),
        }
    }

    pub fn breakers(&self) -> &Arc<BreakerRegistry> {
        &self.breakers
    }

    /// Core call path shared by every typed method.
    async fn call(
        &self,
        group: EndpointGroup,
        req: UpstreamRequest,
        ctx: &CallContext,
    ) -> Result<Value, ApiError> {
        let bucket = match group {
            EndpointGroup::Read => &self.read_bucket,
            EndpointGroup::Write => &self.write_bucket,
        };
        bucket.acquire(1.0, ctx.deadline).await?;

        let breaker = self.breakers.get(req.endpoint);
        let mut attempt: u32 = 0;
        let mut refreshed = false;

        loop {
            if let Some(deadline) = ctx.deadline {
                if Instant::now() >= deadline {
                    return Err(ApiError::timeout(format!(
                        "deadline elapsed before {} call",
                        req.endpoint
                    )));
                }
            }

            let guard = breaker.try_acquire()?;
            let bearer = self.tokens.bearer().await?;
            let start = Instant::now();
            let result = self
                .transport
                .execute(&req, &bearer, ctx.traceparent.as_deref())
                .await;
            self.record(req.endpoint, start.elapsed(), result.is_err());

            match result {
                Ok(value) => {
                    guard.success();
                    return Ok(value);
                }
                Err(err) if err.kind == UpstreamErrorKind::AuthExpired && !refreshed => {
                    guard.neutral();
                    refreshed = true;
                    self.tokens.refresh().await?;
                    tracing::debug!(endpoint = req.endpoint, "retrying after token refresh");
                }
                Err(err) if err.retryable() && attempt < self.retry.max_retries => {
                    guard.failure();
                    let delay = self.retry.delay(attempt, err.retry_after);
                    attempt += 1;
                    self.record_retry(req.endpoint);
                    if let Some(deadline) = ctx.deadline {
                        if Instant::now() + delay >= deadline {
                            return Err(err.into_api_error(req.endpoint));
                        }
                    }
                    tracing::debug!(
                        endpoint = req.endpoint,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "retrying transient upstream failure"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    if err.counts_as_breaker_failure() {
                        guard.failure();
                    } else {
                        guard.neutral();
                    }
                    return Err(err.into_api_error(req.endpoint));
                }
            }
        }
    }

    fn record(&self, endpoint: &'static str, duration: Duration, failed: bool) {
        let mut metrics = self.metrics.lock().expect("metrics lock");
        let entry = metrics.entry(endpoint).or_default();
        entry.requests += 1;
        entry.total_duration_ms += duration.as_millis() as u64;
        if failed {
            entry.failures += 1;
        }
    }

    fn record_retry(&self, endpoint: &'static str) {
        let mut metrics = self.metrics.lock().expect("metrics lock");
        metrics.entry(endpoint).or_default().retries += 1;
    }

    /// Per-endpoint counters for `/metrics` and `/stats`.
    pub fn metrics_json(&self) -> Value {
        let metrics = self.metrics.lock().expect("metrics lock");
        let mut out = serde_json::Map::new();
        for (endpoint, m) in metrics.iter() {
            out.insert(
                endpoint.to_string(),
                json!({
                    "requests": m.requests,
                    "failures": m.failures,
                    "retries": m.retries,
                    "total_duration_ms": m.total_duration_ms,
                }),
            );
        }
        Value::Object(out)
    }

    // ── Values group ─────────────────────────────────────────────────────

    pub async fn values_get(
        &self,
        spreadsheet_id: &str,
        range: &str,
        value_render: &str,
        major_dimension: &str,
        ctx: &CallContext,
    ) -> Result<ValueRange, ApiError> {
        let url = format!(
            "{SHEETS_BASE}/{spreadsheet_id}/values/{}?valueRenderOption={value_render}&majorDimension={major_dimension}",
            encode_path(range)
        );
        let value = self
            .call(EndpointGroup::Read, UpstreamRequest::get("values.get", url), ctx)
            .await?;
        parse(value, "values.get")
    }

    pub async fn values_batch_get(
        &self,
        spreadsheet_id: &str,
        ranges: &[String],
        value_render: &str,
        major_dimension: &str,
        ctx: &CallContext,
    ) -> Result<Vec<ValueRange>, ApiError> {
        let mut url = format!(
            "{SHEETS_BASE}/{spreadsheet_id}/values:batchGet?valueRenderOption={value_render}&majorDimension={major_dimension}"
        );
        for range in ranges {
            url.push_str("&ranges=");
            url.push_str(&encode_path(range));
        }
        let value = self
            .call(
                EndpointGroup::Read,
                UpstreamRequest::get("values.batch_get", url),
                ctx,
            )
            .await?;
        let ranges = value.get("valueRanges").cloned().unwrap_or(json!([]));
        serde_json::from_value(ranges)
            .map_err(|e| ApiError::internal(format!("values.batch_get response: {e}")))
    }

    pub async fn values_update(
        &self,
        spreadsheet_id: &str,
        range: &str,
        values: Vec<Vec<Value>>,
        value_input_option: &str,
        ctx: &CallContext,
    ) -> Result<UpdateValuesResponse, ApiError> {
        let url = format!(
            "{SHEETS_BASE}/{spreadsheet_id}/values/{}?valueInputOption={value_input_option}",
            encode_path(range)
        );
        let body = json!({ "range": range, "majorDimension": "ROWS", "values": values });
        let value = self
            .call(
                EndpointGroup::Write,
                UpstreamRequest::put("values.update", url, body),
                ctx,
            )
            .await?;
        parse(value, "values.update")
    }

    /// Direct (unbatched) append — the batcher's bypass path.
    pub async fn values_append(
        &self,
        spreadsheet_id: &str,
        range: &str,
        values: Vec<Vec<Value>>,
        value_input_option: &str,
        ctx: &CallContext,
    ) -> Result<UpdateValuesResponse, ApiError> {
        let url = format!(
            "{SHEETS_BASE}/{spreadsheet_id}/values/{}:append?valueInputOption={value_input_option}&insertDataOption=INSERT_ROWS",
            encode_path(range)
        );
        let body = json!({ "range": range, "majorDimension": "ROWS", "values": values });
        let value = self
            .call(
                EndpointGroup::Write,
                UpstreamRequest::post("values.append", url, body),
                ctx,
            )
            .await?;
        let updates = value.get("updates").cloned().unwrap_or(Value::Null);
        parse(updates, "values.append")
    }

    pub async fn values_batch_update(
        &self,
        spreadsheet_id: &str,
        data: Vec<ValueRange>,
        value_input_option: &str,
        ctx: &CallContext,
    ) -> Result<Vec<UpdateValuesResponse>, ApiError> {
        let url = format!("{SHEETS_BASE}/{spreadsheet_id}/values:batchUpdate");
        let body = json!({
            "valueInputOption": value_input_option,
            "data": data,
            "includeValuesInResponse": false,
        });
        let value = self
            .call(
                EndpointGroup::Write,
                UpstreamRequest::post("values.batch_update", url, body),
                ctx,
            )
            .await?;
        let responses = value.get("responses").cloned().unwrap_or(json!([]));
        serde_json::from_value(responses)
            .map_err(|e| ApiError::internal(format!("values.batch_update response: {e}")))
    }

    pub async fn values_clear(
        &self,
        spreadsheet_id: &str,
        range: &str,
        ctx: &CallContext,
    ) -> Result<ClearValuesResponse, ApiError> {
        let url = format!(
            "{SHEETS_BASE}/{spreadsheet_id}/values/{}:clear",
            encode_path(range)
        );
        let value = self
            .call(
                EndpointGroup::Write,
                UpstreamRequest::post("values.clear", url, json!({})),
                ctx,
            )
            .await?;
        parse(value, "values.clear")
    }

    // ── Spreadsheets group ───────────────────────────────────────────────

    pub async fn spreadsheet_get(
        &self,
        spreadsheet_id: &str,
        ctx: &CallContext,
    ) -> Result<Spreadsheet, ApiError> {
        let url = format!(
            "{SHEETS_BASE}/{spreadsheet_id}?fields=spreadsheetId,properties.title,sheets.properties,namedRanges"
        );
        let value = self
            .call(
                EndpointGroup::Read,
                UpstreamRequest::get("spreadsheets.get", url),
                ctx,
            )
            .await?;
        parse(value, "spreadsheets.get")
    }

    /// Raw batchUpdate — the batcher compiles appendCells requests into one
    /// of these.
    pub async fn batch_update(
        &self,
        spreadsheet_id: &str,
        requests: Vec<Value>,
        ctx: &CallContext,
    ) -> Result<Value, ApiError> {
        let url = format!("{SHEETS_BASE}/{spreadsheet_id}:batchUpdate");
        self.call(
            EndpointGroup::Write,
            UpstreamRequest::post(
                "spreadsheets.batch_update",
                url,
                json!({ "requests": requests }),
            ),
            ctx,
        )
        .await
    }

    /// Developer-metadata lookup for the semantic resolver.
    pub async fn developer_metadata_search(
        &self,
        spreadsheet_id: &str,
        metadata_key: &str,
        ctx: &CallContext,
    ) -> Result<Value, ApiError> {
        let url = format!("{SHEETS_BASE}/{spreadsheet_id}/developerMetadata:search");
        let body = json!({
            "dataFilters": [{
                "developerMetadataLookup": { "metadataKey": metadata_key }
            }]
        });
        self.call(
            EndpointGroup::Read,
            UpstreamRequest::post("developer_metadata.search", url, body),
            ctx,
        )
        .await
    }

    // ── Drive group ──────────────────────────────────────────────────────

    pub async fn drive_copy(
        &self,
        file_id: &str,
        name: &str,
        ctx: &CallContext,
    ) -> Result<DriveFile, ApiError> {
        let url = format!("{DRIVE_BASE}/{file_id}/copy?fields=id,name,createdTime");
        let value = self
            .call(
                EndpointGroup::Write,
                UpstreamRequest::post("drive.files.copy", url, json!({ "name": name })),
                ctx,
            )
            .await?;
        parse(value, "drive.files.copy")
    }
}

fn parse<T: serde::de::DeserializeOwned>(value: Value, endpoint: &str) -> Result<T, ApiError> {
    serde_json::from_value(value)
        .map_err(|e| ApiError::internal(format!("{endpoint} response: {e}")))
}

/// Percent-encode a path segment (ranges contain `!`, `:`, spaces, quotes).
fn encode_path(segment: &str) -> String {
    let mut out = String::with_capacity(segment.len());
    for byte in segment.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::BreakerConfig;
    use crate::sheets::mock::MockSheets;
    use crate::sheets::types::UpstreamError;

    fn client(mock: Arc<MockSheets>) -> SheetsClient {
        let http = reqwest::Client::new();
        SheetsClient::new(
            mock,
            Arc::new(TokenSource::fixed(http, "test-token")),
            Arc::new(BreakerRegistry::new(BreakerConfig {
                failure_threshold: 5,
                success_threshold: 2,
                reset_timeout: Duration::from_millis(0),
            })),
            RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(5)),
            Arc::new(TokenBucket::new("reads", 1000.0, 1000.0)),
            Arc::new(TokenBucket::new("writes", 1000.0, 1000.0)),
        )
    }

    #[tokio::test]
    async fn values_get_round_trips_through_transport() {
        let mock = Arc::new(MockSheets::new());
        mock.seed_sheet("ss1", "Sheet1", vec![vec![json!("x")]]);
        let c = client(Arc::clone(&mock));
        let vr = c
            .values_get("ss1", "Sheet1!A1", "FORMATTED_VALUE", "ROWS", &CallContext::default())
            .await
            .unwrap();
        assert_eq!(vr.values[0][0], "x");
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let mock = Arc::new(MockSheets::new());
        mock.seed_sheet("ss1", "Sheet1", vec![vec![json!("x")]]);
        mock.push_failures(
            "values.get",
            UpstreamError::new(UpstreamErrorKind::Transient, "blip"),
            2,
        );
        let c = client(Arc::clone(&mock));
        let vr = c
            .values_get("ss1", "Sheet1!A1", "FORMATTED_VALUE", "ROWS", &CallContext::default())
            .await
            .unwrap();
        assert_eq!(vr.values[0][0], "x");
        assert_eq!(mock.calls_for("values.get"), 3);
    }

    #[tokio::test]
    async fn invalid_params_are_not_retried() {
        let mock = Arc::new(MockSheets::new());
        mock.seed_sheet("ss1", "Sheet1", vec![]);
        mock.push_failures(
            "values.get",
            UpstreamError::new(UpstreamErrorKind::Invalid, "bad range"),
            1,
        );
        let c = client(Arc::clone(&mock));
        let err = c
            .values_get("ss1", "Sheet1!A1", "FORMATTED_VALUE", "ROWS", &CallContext::default())
            .await
            .unwrap_err();
        assert_eq!(err.code, crate::error::ErrorCode::InvalidParams);
        assert_eq!(mock.calls_for("values.get"), 1);
    }

    #[tokio::test]
    async fn breaker_opens_after_sustained_failures() {
        let mock = Arc::new(MockSheets::new());
        mock.seed_sheet("ss1", "Sheet1", vec![]);
        // 5 transient failures exhaust retries twice over and trip the breaker.
        mock.push_failures(
            "values.get",
            UpstreamError::new(UpstreamErrorKind::Transient, "down"),
            100,
        );
        let c = client(Arc::clone(&mock));
        let ctx = CallContext::default();
        let _ = c
            .values_get("ss1", "Sheet1!A1", "FORMATTED_VALUE", "ROWS", &ctx)
            .await;
        let _ = c
            .values_get("ss1", "Sheet1!A1", "FORMATTED_VALUE", "ROWS", &ctx)
            .await;
        let snapshot = &c.breakers().snapshots()[0];
        assert_eq!(snapshot.name, "values.get");
        assert!(snapshot.failure_count >= 5 || snapshot.state != "closed");
    }

    #[test]
    fn path_encoding_covers_range_punctuation() {
        assert_eq!(encode_path("Sheet1!A1:B2"), "Sheet1%21A1%3AB2");
        assert_eq!(encode_path("'My Sheet'!A1"), "%27My%20Sheet%27%21A1");
    }
}
