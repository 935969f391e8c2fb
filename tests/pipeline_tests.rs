// End-to-end pipeline scenarios against the in-memory upstream:
// merged reads, batched appends, snapshot + invalidation on write,
// circuit-open fallbacks, and transactional commits.

use serde_json::{json, Value};

use sheetlink_backend::mcp::context::RequestContext;
use sheetlink_backend::session::TransportKind;
use sheetlink_backend::sheets::types::{UpstreamError, UpstreamErrorKind};
use sheetlink_backend::state::AppState;
use sheetlink_backend::tools;
use sheetlink_backend::trace_context::TraceContext;

async fn context(state: &AppState) -> RequestContext {
    let session = state
        .sessions
        .create("test-user", TransportKind::StreamableHttp)
        .await
        .unwrap();
    RequestContext::new(
        state.clone(),
        session,
        json!("req-1"),
        TraceContext::new_root(),
        None,
    )
}

fn grid(rows: usize, cols: usize) -> Vec<Vec<Value>> {
    (0..rows)
        .map(|r| (0..cols).map(|c| json!(format!("r{r}c{c}"))).collect())
        .collect()
}

// ═══════════════════════════════════════════════════════════════════════
//  Scenario A — concurrent overlapping reads merge into one API call
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn concurrent_reads_merge_into_one_bounding_box_call() {
    let (state, mock) = AppState::new_test();
    mock.seed_sheet("ss1", "Sheet1", grid(15, 4));
    let ctx = context(&state).await;

    let read = |range: &str| {
        let ctx = ctx.clone();
        let range = range.to_string();
        async move {
            tools::dispatch(
                &ctx,
                "sheets_read",
                &json!({ "spreadsheet_id": "ss1", "range": range }),
            )
            .await
        }
    };

    let (a, b) = tokio::join!(read("Sheet1!A1:B10"), read("Sheet1!B5:D15"));
    let a = a.unwrap();
    let b = b.unwrap();

    // Exactly one upstream read, over a box containing both requests.
    assert_eq!(mock.calls_for("values.get"), 1);
    assert!(mock.calls()[0].url.contains("Sheet1%21A1%3AD15"));

    // Each caller got exactly its own sub-rectangle.
    assert_eq!(a["values"].as_array().unwrap().len(), 10);
    assert_eq!(a["values"][0][0], "r0c0");
    assert_eq!(a["values"][9][1], "r9c1");
    assert_eq!(b["values"].as_array().unwrap().len(), 11);
    assert_eq!(b["values"][0][0], "r4c1");
    assert_eq!(b["values"][10][2], "r14c3");
}

#[tokio::test]
async fn repeated_read_hits_the_cache() {
    let (state, mock) = AppState::new_test();
    mock.seed_sheet("ss1", "Sheet1", grid(5, 2));
    let ctx = context(&state).await;
    let params = json!({ "spreadsheet_id": "ss1", "range": "Sheet1!A1:B5" });

    tools::dispatch(&ctx, "sheets_read", &params).await.unwrap();
    tools::dispatch(&ctx, "sheets_read", &params).await.unwrap();

    assert_eq!(mock.calls_for("values.get"), 1);
}

// ═══════════════════════════════════════════════════════════════════════
//  Scenario B — ten appends in one window cost at most two API calls
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn ten_appends_in_one_window_cost_at_most_two_calls() {
    let (state, mock) = AppState::new_test();
    mock.seed_sheet("ss1", "Sheet1", vec![vec![json!("h1"), json!("h2")]]);
    let ctx = context(&state).await;

    let mut handles = Vec::new();
    for i in 0..10 {
        let ctx = ctx.clone();
        handles.push(tokio::spawn(async move {
            tools::dispatch(
                &ctx,
                "sheets_append",
                &json!({
                    "spreadsheet_id": "ss1",
                    "sheet": "Sheet1",
                    "values": [[format!("name-{i}"), i]],
                }),
            )
            .await
        }));
    }

    for handle in handles {
        let envelope = handle.await.unwrap().unwrap();
        assert_eq!(envelope["success"], true);
        assert_eq!(envelope["updated_cells"], 2);
        let range = envelope["updated_range"].as_str().unwrap();
        assert!(range.starts_with("Sheet1!A"), "range: {range}");
    }

    assert!(
        mock.total_calls() <= 2,
        "expected metadata + batch, saw: {:?}",
        mock.calls()
    );
    // All ten rows landed after the header.
    assert_eq!(mock.grid("ss1", "Sheet1").len(), 11);
}

// ═══════════════════════════════════════════════════════════════════════
//  Scenario C — snapshot + cache invalidation on write
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn write_with_snapshot_invalidates_overlapping_cache() {
    let (state, mock) = AppState::new_test();
    mock.seed_sheet("ss1", "Sheet1", grid(50, 3));
    let ctx = context(&state).await;

    // Warm the cache with a read inside the soon-to-be-written range.
    tools::dispatch(
        &ctx,
        "sheets_read",
        &json!({ "spreadsheet_id": "ss1", "range": "Sheet1!B2:B10" }),
    )
    .await
    .unwrap();
    let reads_before = mock.calls_for("values.get");

    let values: Vec<Vec<Value>> = (0..50).map(|r| vec![json!(format!("new{r}")), json!(1), json!(2)]).collect();
    let envelope = tools::dispatch(
        &ctx,
        "sheets_write",
        &json!({
            "spreadsheet_id": "ss1",
            "range": "Sheet1!A1:C50",
            "values": values,
            "value_input_option": "RAW",
            "safety": { "create_snapshot": true },
        }),
    )
    .await
    .unwrap();

    assert_eq!(envelope["success"], true);
    assert_eq!(envelope["updated_cells"], 150);
    let snapshot_id = envelope["_meta"]["snapshot"]["id"].as_str().unwrap();
    assert!(snapshot_id.starts_with("snap-"));
    assert!(envelope["_meta"]["snapshot"]["undo_instructions"].is_array());

    // The snapshot preserves the pre-write values.
    assert_eq!(mock.grid(snapshot_id, "Sheet1")[0][0], "r0c0");

    // The overlapping cached read is gone: the next read refetches.
    tools::dispatch(
        &ctx,
        "sheets_read",
        &json!({ "spreadsheet_id": "ss1", "range": "Sheet1!B2:B10" }),
    )
    .await
    .unwrap();
    assert_eq!(mock.calls_for("values.get"), reads_before + 1);
}

#[tokio::test]
async fn dry_run_write_has_no_side_effects() {
    let (state, mock) = AppState::new_test();
    mock.seed_sheet("ss1", "Sheet1", grid(2, 2));
    let ctx = context(&state).await;

    let envelope = tools::dispatch(
        &ctx,
        "sheets_write",
        &json!({
            "spreadsheet_id": "ss1",
            "range": "Sheet1!A1:B2",
            "values": [[1, 2], [3, 4]],
            "safety": { "dry_run": true, "create_snapshot": true },
        }),
    )
    .await
    .unwrap();

    assert_eq!(envelope["dry_run"], true);
    assert_eq!(envelope["diff"]["projected"]["changed_cells"], 4);
    assert_eq!(mock.total_calls(), 0);
    assert_eq!(mock.grid("ss1", "Sheet1")[0][0], "r0c0");
}

#[tokio::test]
async fn oversized_write_requires_allow_risky() {
    let (state, _mock) = AppState::new_test();
    let ctx = context(&state).await;

    let err = tools::dispatch(
        &ctx,
        "sheets_clear",
        &json!({ "spreadsheet_id": "ss1", "range": "Sheet1!A:ZZ" }),
    )
    .await
    .unwrap_err();
    assert_eq!(err.code, sheetlink_backend::error::ErrorCode::PreconditionFailed);
    assert!(err.resolution_steps.iter().any(|s| s.contains("allow_risky")));
}

// ═══════════════════════════════════════════════════════════════════════
//  Scenario D — open circuit serves fallbacks, not hangs
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn open_circuit_falls_back_to_cached_then_degraded() {
    let (state, mock) = AppState::new_test();
    mock.seed_sheet("ss1", "Sheet1", grid(3, 2));
    let ctx = context(&state).await;

    // Warm the cache for one range.
    tools::dispatch(
        &ctx,
        "sheets_read",
        &json!({ "spreadsheet_id": "ss1", "range": "Sheet1!A1:B2" }),
    )
    .await
    .unwrap();

    // Break the upstream for every subsequent read.
    mock.push_failures(
        "values.get",
        UpstreamError::new(UpstreamErrorKind::Transient, "upstream down"),
        1000,
    );

    // Drive the breaker open with reads of an uncached range.
    for _ in 0..3 {
        let _ = tools::dispatch(
            &ctx,
            "sheets_read",
            &json!({ "spreadsheet_id": "ss1", "range": "Sheet1!C1:D2" }),
        )
        .await;
    }
    let breaker = state.client.breakers().get("values.get");
    assert_eq!(
        breaker.state(),
        sheetlink_backend::resilience::BreakerState::Open
    );
    let calls_when_open = mock.calls_for("values.get");

    // Uncached range under an open breaker: degraded sentinel, no API call.
    let envelope = tools::dispatch(
        &ctx,
        "sheets_read",
        &json!({ "spreadsheet_id": "ss1", "range": "Sheet1!E1:F2" }),
    )
    .await
    .unwrap();
    assert_eq!(envelope["success"], true);
    assert_eq!(envelope["degraded"], true);
    assert_eq!(envelope["fallback"], "degraded");
    assert_eq!(mock.calls_for("values.get"), calls_when_open);

    let snapshot = state
        .client
        .breakers()
        .snapshots()
        .into_iter()
        .find(|s| s.name == "values.get")
        .unwrap();
    assert!(snapshot.fallback_usage_count >= 1);
}

// ═══════════════════════════════════════════════════════════════════════
//  Scenario E — transaction with 25 ops: advisory, FIFO, single batch
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn transaction_commit_is_fifo_with_growth_advisory() {
    let (state, mock) = AppState::new_test();
    mock.seed_sheet("ss1", "Sheet1", grid(30, 1));
    let ctx = context(&state).await;

    let begin = tools::dispatch(
        &ctx,
        "sheets_transaction",
        &json!({ "action": "begin", "spreadsheet_id": "ss1", "auto_rollback": true }),
    )
    .await
    .unwrap();
    let tx_id = begin["transaction_id"].as_str().unwrap().to_string();

    for i in 0..25 {
        tools::dispatch(
            &ctx,
            "sheets_transaction",
            &json!({
                "action": "queue",
                "transaction_id": tx_id,
                "operation": {
                    "type": "update",
                    "range": format!("Sheet1!A{}", i + 1),
                    "values": [[format!("v{i}")]],
                },
            }),
        )
        .await
        .unwrap();
    }

    let committed = tools::dispatch(
        &ctx,
        "sheets_transaction",
        &json!({ "action": "commit", "transaction_id": tx_id }),
    )
    .await
    .unwrap();

    assert_eq!(committed["state"], "committed");
    assert_eq!(committed["committed_operations"], 25);
    let warnings = committed["_meta"]["warnings"].as_array().unwrap();
    assert_eq!(warnings.len(), 1, "exactly one growth advisory: {warnings:?}");
    assert!(warnings[0].as_str().unwrap().contains("growing"));

    // One batch write (plus the snapshot copy), never 25 calls.
    assert_eq!(mock.calls_for("values.batch_update"), 1);
    assert_eq!(mock.calls_for("drive.files.copy"), 1);

    // FIFO end state.
    let grid_now = mock.grid("ss1", "Sheet1");
    for (i, row) in grid_now.iter().take(25).enumerate() {
        assert_eq!(row[0], json!(format!("v{i}")));
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Dedup — identical concurrent reads share one execution
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn identical_concurrent_reads_deduplicate() {
    let (state, mock) = AppState::new_test();
    mock.seed_sheet("ss1", "Sheet1", grid(4, 2));
    let ctx = context(&state).await;

    let mut handles = Vec::new();
    for _ in 0..8 {
        let ctx = ctx.clone();
        handles.push(tokio::spawn(async move {
            tools::dispatch(
                &ctx,
                "sheets_read",
                &json!({ "spreadsheet_id": "ss1", "range": "Sheet1!A1:B4" }),
            )
            .await
        }));
    }
    for handle in handles {
        let envelope = handle.await.unwrap().unwrap();
        assert_eq!(envelope["values"][0][0], "r0c0");
    }

    assert_eq!(mock.calls_for("values.get"), 1);
    let stats = state.dedup.stats();
    assert_eq!(stats["executions"], 1);
    assert_eq!(stats["coalesced"], 7);
}

// ═══════════════════════════════════════════════════════════════════════
//  Semantic resolution end to end
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn header_reference_reads_the_right_column() {
    let (state, mock) = AppState::new_test();
    mock.seed_sheet(
        "ss1",
        "Data",
        vec![
            vec![json!("Id"), json!("Name")],
            vec![json!(1), json!("ada")],
            vec![json!(2), json!("grace")],
        ],
    );
    let ctx = context(&state).await;

    let envelope = tools::dispatch(
        &ctx,
        "sheets_read",
        &json!({ "spreadsheet_id": "ss1", "range": "Data!header:Name" }),
    )
    .await
    .unwrap();
    assert_eq!(envelope["range"], "Data!B:B");
    let values = envelope["values"].as_array().unwrap();
    assert_eq!(values[1][0], "ada");
    assert_eq!(values[2][0], "grace");
}
