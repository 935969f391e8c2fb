//! Write batching.
//!
//! Homogeneous writes to one spreadsheet queued within a window become a
//! single upstream call:
//!
//! - **appends** — N appends (same or different sheets) compile into one
//!   `spreadsheets.batchUpdate` of appendCells requests; sheet titles are
//!   resolved to ids with a single cached metadata fetch, so N appends cost
//!   at most two upstream calls;
//! - **updates** — N range updates become one `values.batchUpdate`.
//!
//! Responses are reshaped into per-caller `UpdateValuesResponse`s. Bypass
//! (dry-run preview already handled upstream, overwrite semantics, or
//! batching disabled) falls back to the direct endpoint.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::oneshot;

use crate::a1::{col_letters, A1Range};
use crate::cache::{spreadsheet_key, CacheManager, NS_SPREADSHEET};
use crate::error::ApiError;
use crate::sheets::client::{CallContext, SheetsClient};
use crate::sheets::types::{to_extended_value, Spreadsheet, UpdateValuesResponse, ValueRange};

#[derive(Debug, Clone)]
pub struct BatchConfig {
    pub enabled: bool,
    pub window: Duration,
    pub max_batch_size: usize,
    pub metadata_ttl: Duration,
}

struct PendingAppend {
    sheet: String,
    values: Vec<Vec<Value>>,
    tx: oneshot::Sender<Result<UpdateValuesResponse, ApiError>>,
}

struct PendingUpdate {
    range: String,
    values: Vec<Vec<Value>>,
    tx: oneshot::Sender<Result<UpdateValuesResponse, ApiError>>,
}

struct SlotState<T> {
    items: Vec<T>,
    drained: bool,
}

type Slot<T> = Arc<Mutex<SlotState<T>>>;

/// Cheap handle: clones share the same collectors and counters.
#[derive(Clone)]
pub struct WriteBatcher {
    client: Arc<SheetsClient>,
    cache: Arc<CacheManager>,
    config: BatchConfig,
    appends: Arc<Mutex<HashMap<String, Slot<PendingAppend>>>>,
    updates: Arc<Mutex<HashMap<String, Slot<PendingUpdate>>>>,
    batches_flushed: Arc<AtomicU64>,
    batched_ops: Arc<AtomicU64>,
    bypass_calls: Arc<AtomicU64>,
}

impl WriteBatcher {
    pub fn new(
        client: Arc<SheetsClient>,
        cache: Arc<CacheManager>,
        config: BatchConfig,
    ) -> Self {
        Self {
            client,
            cache,
            config,
            appends: Arc::new(Mutex::new(HashMap::new())),
            updates: Arc::new(Mutex::new(HashMap::new())),
            batches_flushed: Arc::new(AtomicU64::new(0)),
            batched_ops: Arc::new(AtomicU64::new(0)),
            bypass_calls: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Append rows to a sheet. `bypass` forces the direct endpoint
    /// (overwrite semantics, or batching disabled by the caller).
    pub async fn append(
        &self,
        spreadsheet_id: &str,
        sheet: &str,
        values: Vec<Vec<Value>>,
        value_input_option: &str,
        bypass: bool,
        ctx: &CallContext,
    ) -> Result<UpdateValuesResponse, ApiError> {
        if !self.config.enabled || bypass {
            self.bypass_calls.fetch_add(1, Ordering::Relaxed);
            return self
                .client
                .values_append(spreadsheet_id, sheet, values, value_input_option, ctx)
                .await;
        }

        let (tx, rx) = oneshot::channel();
        let pending = PendingAppend {
            sheet: sheet.to_string(),
            values,
            tx,
        };
        self.enqueue_append(spreadsheet_id.to_string(), pending).await;
        rx.await
            .unwrap_or_else(|_| Err(ApiError::internal("append batch dropped its caller")))
    }

    /// Update explicit ranges. Same window discipline as appends but compiled
    /// into `values.batchUpdate`.
    pub async fn update(
        &self,
        spreadsheet_id: &str,
        range: &str,
        values: Vec<Vec<Value>>,
        value_input_option: &str,
        bypass: bool,
        ctx: &CallContext,
    ) -> Result<UpdateValuesResponse, ApiError> {
        if !self.config.enabled || bypass || !value_input_option.eq_ignore_ascii_case("RAW") {
            // USER_ENTERED parsing must hit the dedicated endpoint so formula
            // interpretation matches a direct call exactly.
            self.bypass_calls.fetch_add(1, Ordering::Relaxed);
            return self
                .client
                .values_update(spreadsheet_id, range, values, value_input_option, ctx)
                .await;
        }

        let (tx, rx) = oneshot::channel();
        let pending = PendingUpdate {
            range: range.to_string(),
            values,
            tx,
        };
        self.enqueue_update(spreadsheet_id.to_string(), pending).await;
        rx.await
            .unwrap_or_else(|_| Err(ApiError::internal("update batch dropped its caller")))
    }

    async fn enqueue_append(&self, spreadsheet_id: String, pending: PendingAppend) {
        let mut pending = Some(pending);
        loop {
            let (slot, created) = {
                let mut map = self.appends.lock().expect("appends lock");
                match map.get(&spreadsheet_id) {
                    Some(slot) => (Arc::clone(slot), false),
                    None => {
                        let slot: Slot<PendingAppend> = Arc::new(Mutex::new(SlotState {
                            items: Vec::new(),
                            drained: false,
                        }));
                        map.insert(spreadsheet_id.clone(), Arc::clone(&slot));
                        (slot, true)
                    }
                }
            };

            let drain_now = {
                let mut state = slot.lock().expect("slot lock");
                if state.drained {
                    continue;
                }
                state.items.push(pending.take().expect("pending still held"));
                state.items.len() >= self.config.max_batch_size
            };

            if created {
                let this = self.clone();
                let key = spreadsheet_id.clone();
                let timer_slot = Arc::clone(&slot);
                let window = self.config.window;
                tokio::spawn(async move {
                    tokio::time::sleep(window).await;
                    this.drain_appends(&key, &timer_slot).await;
                });
            }
            if drain_now {
                self.drain_appends(&spreadsheet_id, &slot).await;
            }
            return;
        }
    }

    async fn enqueue_update(&self, spreadsheet_id: String, pending: PendingUpdate) {
        let mut pending = Some(pending);
        loop {
            let (slot, created) = {
                let mut map = self.updates.lock().expect("updates lock");
                match map.get(&spreadsheet_id) {
                    Some(slot) => (Arc::clone(slot), false),
                    None => {
                        let slot: Slot<PendingUpdate> = Arc::new(Mutex::new(SlotState {
                            items: Vec::new(),
                            drained: false,
                        }));
                        map.insert(spreadsheet_id.clone(), Arc::clone(&slot));
                        (slot, true)
                    }
                }
            };

            let drain_now = {
                let mut state = slot.lock().expect("slot lock");
                if state.drained {
                    continue;
                }
                state.items.push(pending.take().expect("pending still held"));
                state.items.len() >= self.config.max_batch_size
            };

            if created {
                let this = self.clone();
                let key = spreadsheet_id.clone();
                let timer_slot = Arc::clone(&slot);
                let window = self.config.window;
                tokio::spawn(async move {
                    tokio::time::sleep(window).await;
                    this.drain_updates(&key, &timer_slot).await;
                });
            }
            if drain_now {
                self.drain_updates(&spreadsheet_id, &slot).await;
            }
            return;
        }
    }

    async fn drain_appends(&self, spreadsheet_id: &str, slot: &Slot<PendingAppend>) {
        {
            let mut map = self.appends.lock().expect("appends lock");
            if let Some(current) = map.get(spreadsheet_id) {
                if Arc::ptr_eq(current, slot) {
                    map.remove(spreadsheet_id);
                }
            }
        }
        let items = {
            let mut state = slot.lock().expect("slot lock");
            if state.drained {
                return;
            }
            state.drained = true;
            std::mem::take(&mut state.items)
        };
        if items.is_empty() {
            return;
        }
        self.batches_flushed.fetch_add(1, Ordering::Relaxed);
        self.batched_ops
            .fetch_add(items.len() as u64, Ordering::Relaxed);
        self.execute_appends(spreadsheet_id, items).await;
    }

    async fn drain_updates(&self, spreadsheet_id: &str, slot: &Slot<PendingUpdate>) {
        {
            let mut map = self.updates.lock().expect("updates lock");
            if let Some(current) = map.get(spreadsheet_id) {
                if Arc::ptr_eq(current, slot) {
                    map.remove(spreadsheet_id);
                }
            }
        }
        let items = {
            let mut state = slot.lock().expect("slot lock");
            if state.drained {
                return;
            }
            state.drained = true;
            std::mem::take(&mut state.items)
        };
        if items.is_empty() {
            return;
        }
        self.batches_flushed.fetch_add(1, Ordering::Relaxed);
        self.batched_ops
            .fetch_add(items.len() as u64, Ordering::Relaxed);
        self.execute_updates(spreadsheet_id, items).await;
    }

    /// Sheet metadata with a single cached fetch per TTL window.
    async fn metadata(&self, spreadsheet_id: &str, ctx: &CallContext) -> Result<Spreadsheet, ApiError> {
        let key = spreadsheet_key(spreadsheet_id);
        if let Some(cached) = self.cache.get(NS_SPREADSHEET, &key).await {
            if let Ok(meta) = serde_json::from_value::<Spreadsheet>(cached) {
                return Ok(meta);
            }
        }
        let meta = self.client.spreadsheet_get(spreadsheet_id, ctx).await?;
        self.cache
            .set(
                NS_SPREADSHEET,
                &key,
                serde_json::to_value(&meta).unwrap_or(Value::Null),
                self.config.metadata_ttl,
                Vec::new(),
            )
            .await;
        Ok(meta)
    }

    async fn execute_appends(&self, spreadsheet_id: &str, items: Vec<PendingAppend>) {
        let ctx = CallContext::default();
        let meta = match self.metadata(spreadsheet_id, &ctx).await {
            Ok(meta) => meta,
            Err(err) => {
                for item in items {
                    let _ = item.tx.send(Err(err.clone()));
                }
                return;
            }
        };

        // Resolve titles once and walk a cursor of the next free row per
        // sheet so each caller's acknowledged range lines up FIFO.
        let mut next_row: HashMap<i64, u32> = HashMap::new();
        let mut compiled: Vec<(PendingAppend, i64, u32)> = Vec::new();
        let mut requests: Vec<Value> = Vec::new();

        for item in items {
            let Some(props) = meta.sheet_by_title(&item.sheet).or_else(|| {
                item.sheet.is_empty().then(|| meta.first_sheet()).flatten()
            }) else {
                let _ = item.tx.send(Err(ApiError::new(
                    crate::error::ErrorCode::RangeNotFound,
                    format!("sheet {:?} not found in {spreadsheet_id}", item.sheet),
                )));
                continue;
            };
            let start = *next_row
                .entry(props.sheet_id)
                .or_insert(props.grid_properties.row_count);
            next_row.insert(props.sheet_id, start + item.values.len() as u32);

            let rows: Vec<Value> = item
                .values
                .iter()
                .map(|row| {
                    json!({
                        "values": row
                            .iter()
                            .map(|cell| json!({ "userEnteredValue": to_extended_value(cell) }))
                            .collect::<Vec<Value>>()
                    })
                })
                .collect();
            requests.push(json!({
                "appendCells": {
                    "sheetId": props.sheet_id,
                    "rows": rows,
                    "fields": "userEnteredValue",
                }
            }));
            compiled.push((item, props.sheet_id, start));
        }

        if requests.is_empty() {
            return;
        }

        match self.client.batch_update(spreadsheet_id, requests, &ctx).await {
            Ok(_replies) => {
                for (item, sheet_id, start) in compiled {
                    let title = meta
                        .sheets
                        .iter()
                        .map(|s| &s.properties)
                        .find(|p| p.sheet_id == sheet_id)
                        .map(|p| p.title.clone())
                        .unwrap_or_default();
                    let rows = item.values.len() as u32;
                    let cols = item
                        .values
                        .iter()
                        .map(|r| r.len() as u32)
                        .max()
                        .unwrap_or(0);
                    let cells: u32 = item.values.iter().map(|r| r.len() as u32).sum();
                    let updated_range = if rows == 0 || cols == 0 {
                        format!("{title}!A{}", start + 1)
                    } else {
                        format!(
                            "{title}!A{}:{}{}",
                            start + 1,
                            col_letters(cols - 1),
                            start + rows
                        )
                    };
                    let _ = item.tx.send(Ok(UpdateValuesResponse {
                        spreadsheet_id: spreadsheet_id.to_string(),
                        updated_range,
                        updated_rows: rows,
                        updated_columns: cols,
                        updated_cells: cells,
                    }));
                }
            }
            Err(err) => {
                for (item, _, _) in compiled {
                    let _ = item.tx.send(Err(err.clone()));
                }
            }
        }
    }

    async fn execute_updates(&self, spreadsheet_id: &str, items: Vec<PendingUpdate>) {
        let ctx = CallContext::default();
        let data: Vec<ValueRange> = items
            .iter()
            .map(|item| ValueRange {
                range: Some(item.range.clone()),
                major_dimension: Some("ROWS".to_string()),
                values: item.values.clone(),
            })
            .collect();

        match self
            .client
            .values_batch_update(spreadsheet_id, data, "RAW", &ctx)
            .await
        {
            Ok(responses) if responses.len() == items.len() => {
                for (item, response) in items.into_iter().zip(responses) {
                    let _ = item.tx.send(Ok(response));
                }
            }
            Ok(responses) => {
                let err = ApiError::internal(format!(
                    "values.batchUpdate returned {} responses for {} ranges",
                    responses.len(),
                    items.len()
                ));
                for item in items {
                    let _ = item.tx.send(Err(err.clone()));
                }
            }
            Err(err) => {
                for item in items {
                    let _ = item.tx.send(Err(err.clone()));
                }
            }
        }
    }

    pub fn stats(&self) -> Value {
        json!({
            "enabled": self.config.enabled,
            "batches_flushed": self.batches_flushed.load(Ordering::Relaxed),
            "batched_ops": self.batched_ops.load(Ordering::Relaxed),
            "bypass_calls": self.bypass_calls.load(Ordering::Relaxed),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::TokenSource;
    use crate::resilience::{BreakerConfig, BreakerRegistry, RetryPolicy, TokenBucket};
    use crate::sheets::mock::MockSheets;

    fn batcher(mock: Arc<MockSheets>, window_ms: u64) -> WriteBatcher {
        let client = Arc::new(SheetsClient::new(
            mock,
            Arc::new(TokenSource::fixed(reqwest::Client::new(), "t")),
            Arc::new(BreakerRegistry::new(BreakerConfig::default())),
            RetryPolicy::new(0, Duration::from_millis(1), Duration::from_millis(2)),
            Arc::new(TokenBucket::new("reads", 1000.0, 1000.0)),
            Arc::new(TokenBucket::new("writes", 1000.0, 1000.0)),
        ));
        WriteBatcher::new(
            client,
            Arc::new(CacheManager::new(1024 * 1024, None)),
            BatchConfig {
                enabled: true,
                window: Duration::from_millis(window_ms),
                max_batch_size: 100,
                metadata_ttl: Duration::from_secs(60),
            },
        )
    }

    #[tokio::test]
    async fn ten_appends_cost_at_most_two_upstream_calls() {
        let mock = Arc::new(MockSheets::new());
        mock.seed_sheet("ss1", "Sheet1", vec![vec![json!("header"), json!("row")]]);
        let b = batcher(Arc::clone(&mock), 30);

        let ctx = CallContext::default();
        let mut handles = Vec::new();
        for i in 0..10 {
            let b = b.clone();
            let ctx = ctx.clone();
            handles.push(tokio::spawn(async move {
                b.append(
                    "ss1",
                    "Sheet1",
                    vec![vec![json!(format!("a{i}")), json!(i)]],
                    "USER_ENTERED",
                    false,
                    &ctx,
                )
                .await
            }));
        }

        let mut ranges = Vec::new();
        for handle in handles {
            let resp = handle.await.unwrap().unwrap();
            assert_eq!(resp.updated_rows, 1);
            assert_eq!(resp.updated_cells, 2);
            ranges.push(resp.updated_range);
        }

        assert!(mock.total_calls() <= 2, "calls: {:?}", mock.calls());
        assert_eq!(mock.calls_for("spreadsheets.batch_update"), 1);

        // Acknowledged ranges are contiguous rows 2..=11 in some order.
        let mut rows: Vec<String> = ranges
            .iter()
            .map(|r| r.split('!').nth(1).unwrap().to_string())
            .collect();
        rows.sort();
        assert_eq!(rows.len(), 10);
        for range in &ranges {
            assert!(range.starts_with("Sheet1!A"), "range: {range}");
        }

        // All ten rows actually landed.
        assert_eq!(mock.grid("ss1", "Sheet1").len(), 11);
    }

    #[tokio::test]
    async fn appends_to_two_sheets_still_one_batch() {
        let mock = Arc::new(MockSheets::new());
        mock.seed_sheet("ss1", "Alpha", vec![vec![json!("a")]]);
        mock.seed_sheet("ss1", "Beta", vec![vec![json!("b")]]);
        let b = batcher(Arc::clone(&mock), 30);

        let ctx = CallContext::default();
        let (r1, r2) = tokio::join!(
            b.append("ss1", "Alpha", vec![vec![json!(1)]], "RAW", false, &ctx),
            b.append("ss1", "Beta", vec![vec![json!(2)]], "RAW", false, &ctx),
        );
        assert!(r1.unwrap().updated_range.starts_with("Alpha!"));
        assert!(r2.unwrap().updated_range.starts_with("Beta!"));
        assert_eq!(mock.calls_for("spreadsheets.batch_update"), 1);
        assert_eq!(mock.grid("ss1", "Alpha").len(), 2);
        assert_eq!(mock.grid("ss1", "Beta").len(), 2);
    }

    #[tokio::test]
    async fn bypass_goes_straight_to_the_append_endpoint() {
        let mock = Arc::new(MockSheets::new());
        mock.seed_sheet("ss1", "Sheet1", vec![vec![json!("h")]]);
        let b = batcher(Arc::clone(&mock), 10_000);
        let resp = b
            .append(
                "ss1",
                "Sheet1",
                vec![vec![json!("direct")]],
                "RAW",
                true,
                &CallContext::default(),
            )
            .await
            .unwrap();
        assert_eq!(resp.updated_rows, 1);
        assert_eq!(mock.calls_for("values.append"), 1);
        assert_eq!(mock.calls_for("spreadsheets.batch_update"), 0);
    }

    #[tokio::test]
    async fn raw_updates_collapse_into_one_batch_call() {
        let mock = Arc::new(MockSheets::new());
        mock.seed_sheet("ss1", "Sheet1", vec![vec![json!("x"); 4]; 10]);
        let b = batcher(Arc::clone(&mock), 30);
        let ctx = CallContext::default();
        let (r1, r2) = tokio::join!(
            b.update("ss1", "Sheet1!A1:B1", vec![vec![json!(1), json!(2)]], "RAW", false, &ctx),
            b.update("ss1", "Sheet1!A2:B2", vec![vec![json!(3), json!(4)]], "RAW", false, &ctx),
        );
        assert_eq!(r1.unwrap().updated_cells, 2);
        assert_eq!(r2.unwrap().updated_cells, 2);
        assert_eq!(mock.calls_for("values.batch_update"), 1);
        assert_eq!(mock.grid("ss1", "Sheet1")[0][0], json!(1));
        assert_eq!(mock.grid("ss1", "Sheet1")[1][1], json!(4));
    }

    #[tokio::test]
    async fn unknown_sheet_fails_only_that_caller() {
        let mock = Arc::new(MockSheets::new());
        mock.seed_sheet("ss1", "Sheet1", vec![vec![json!("h")]]);
        let b = batcher(Arc::clone(&mock), 30);
        let ctx = CallContext::default();
        let (good, bad) = tokio::join!(
            b.append("ss1", "Sheet1", vec![vec![json!(1)]], "RAW", false, &ctx),
            b.append("ss1", "Nope", vec![vec![json!(2)]], "RAW", false, &ctx),
        );
        assert!(good.is_ok());
        let err = bad.unwrap_err();
        assert_eq!(err.code, crate::error::ErrorCode::RangeNotFound);
    }
}
