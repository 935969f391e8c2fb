//! Scripted in-memory upstream for tests.
//!
//! `MockSheets` implements `SheetsTransport` against real grids held in
//! memory, records every outbound call, and can be primed with failures per
//! endpoint. Integration tests use it to assert call-count invariants
//! (merge/batch collapse) and end-state semantics (FIFO commits, rollback).

#![doc(hidden)]

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::transport::{SheetsTransport, UpstreamRequest};
use super::types::{from_extended_value, UpstreamError};
use crate::a1::{col_letters, A1Range};

#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub endpoint: &'static str,
    pub url: String,
    pub body: Option<Value>,
}

#[derive(Debug, Clone, Default)]
struct SheetGrid {
    sheet_id: i64,
    rows: Vec<Vec<Value>>,
}

#[derive(Default)]
pub struct MockSheets {
    grids: Mutex<HashMap<String, BTreeMap<String, SheetGrid>>>,
    calls: Mutex<Vec<RecordedCall>>,
    failures: Mutex<HashMap<&'static str, VecDeque<UpstreamError>>>,
    snapshot_seq: Mutex<u64>,
}

impl MockSheets {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a sheet with initial rows. Sheet ids are assigned in insertion
    /// order per spreadsheet.
    pub fn seed_sheet(&self, spreadsheet_id: &str, title: &str, rows: Vec<Vec<Value>>) {
        let mut grids = self.grids.lock().expect("grids lock");
        let book = grids.entry(spreadsheet_id.to_string()).or_default();
        let sheet_id = book.len() as i64;
        book.insert(title.to_string(), SheetGrid { sheet_id, rows });
    }

    /// Queue `count` failures for an endpoint; they are consumed before the
    /// grid is touched.
    pub fn push_failures(&self, endpoint: &'static str, err: UpstreamError, count: usize) {
        let mut failures = self.failures.lock().expect("failures lock");
        let queue = failures.entry(endpoint).or_default();
        for _ in 0..count {
            queue.push_back(err.clone());
        }
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().expect("calls lock").clone()
    }

    pub fn calls_for(&self, endpoint: &str) -> usize {
        self.calls
            .lock()
            .expect("calls lock")
            .iter()
            .filter(|c| c.endpoint == endpoint)
            .count()
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().expect("calls lock").len()
    }

    pub fn grid(&self, spreadsheet_id: &str, title: &str) -> Vec<Vec<Value>> {
        self.grids
            .lock()
            .expect("grids lock")
            .get(spreadsheet_id)
            .and_then(|book| book.get(title))
            .map(|g| g.rows.clone())
            .unwrap_or_default()
    }

    fn resolve_sheet<'a>(
        book: &'a mut BTreeMap<String, SheetGrid>,
        range: &A1Range,
    ) -> Option<(&'a String, &'a mut SheetGrid)> {
        match &range.sheet {
            Some(title) => book
                .iter_mut()
                .find(|(t, _)| t.eq_ignore_ascii_case(title)),
            None => book.iter_mut().next(),
        }
    }
}

fn spreadsheet_id_from_url(url: &str) -> String {
    let after = url.split("/spreadsheets/").nth(1).unwrap_or_default();
    after
        .split(['/', '?', ':'])
        .next()
        .unwrap_or_default()
        .to_string()
}

fn range_from_url(url: &str) -> Option<A1Range> {
    let after = url.split("/values/").nth(1)?;
    let enc = after.split(['?']).next()?;
    let enc = enc
        .strip_suffix(":append")
        .or_else(|| enc.strip_suffix(":clear"))
        .unwrap_or(enc);
    A1Range::parse(&percent_decode(enc)).ok()
}

fn percent_decode(s: &str) -> String {
    let mut out = Vec::with_capacity(s.len());
    let bytes = s.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            if let (Some(h), Some(l)) = (
                bytes.get(i + 1).copied().and_then(hex_val),
                bytes.get(i + 2).copied().and_then(hex_val),
            ) {
                out.push(h * 16 + l);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn hex_val(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

fn update_grid(grid: &mut SheetGrid, range: &A1Range, values: &[Vec<Value>]) -> (u32, u32, u32) {
    let start_row = range.start_row.unwrap_or(0) as usize;
    let start_col = range.start_col.unwrap_or(0) as usize;
    let mut cells = 0u32;
    let mut max_cols = 0u32;
    for (r, row) in values.iter().enumerate() {
        let target_row = start_row + r;
        if grid.rows.len() <= target_row {
            grid.rows.resize(target_row + 1, Vec::new());
        }
        for (c, v) in row.iter().enumerate() {
            let target_col = start_col + c;
            let slot = &mut grid.rows[target_row];
            if slot.len() <= target_col {
                slot.resize(target_col + 1, Value::Null);
            }
            slot[target_col] = v.clone();
            cells += 1;
        }
        max_cols = max_cols.max(row.len() as u32);
    }
    (values.len() as u32, max_cols, cells)
}

fn updated_range_a1(title: &str, range: &A1Range, rows: u32, cols: u32) -> String {
    let r0 = range.start_row.unwrap_or(0);
    let c0 = range.start_col.unwrap_or(0);
    if rows == 0 || cols == 0 {
        return format!("{title}!{}{}", col_letters(c0), r0 + 1);
    }
    format!(
        "{title}!{}{}:{}{}",
        col_letters(c0),
        r0 + 1,
        col_letters(c0 + cols - 1),
        r0 + rows
    )
}

fn slice_grid(grid: &SheetGrid, range: &A1Range) -> Vec<Vec<Value>> {
    let start_row = range.start_row.unwrap_or(0) as usize;
    let end_row = range
        .end_row
        .map(|r| r as usize)
        .unwrap_or(grid.rows.len())
        .min(grid.rows.len());
    let start_col = range.start_col.unwrap_or(0) as usize;
    let mut out = Vec::new();
    for row in grid.rows.iter().take(end_row).skip(start_row) {
        let end_col = range
            .end_col
            .map(|c| c as usize)
            .unwrap_or(row.len())
            .min(row.len());
        if start_col >= end_col {
            out.push(Vec::new());
        } else {
            out.push(row[start_col..end_col].to_vec());
        }
    }
    // Trim trailing empty rows the way the live API does.
    while out.last().is_some_and(|r| r.is_empty()) {
        out.pop();
    }
    out
}

#[async_trait]
impl SheetsTransport for MockSheets {
    async fn execute(
        &self,
        req: &UpstreamRequest,
        _bearer: &str,
        _traceparent: Option<&str>,
    ) -> Result<Value, UpstreamError> {
        self.calls.lock().expect("calls lock").push(RecordedCall {
            endpoint: req.endpoint,
            url: req.url.clone(),
            body: req.body.clone(),
        });

        if let Some(err) = self
            .failures
            .lock()
            .expect("failures lock")
            .get_mut(req.endpoint)
            .and_then(|q| q.pop_front())
        {
            return Err(err);
        }

        let mut grids = self.grids.lock().expect("grids lock");
        match req.endpoint {
            "values.get" => {
                let id = spreadsheet_id_from_url(&req.url);
                let range = range_from_url(&req.url).expect("mock: parseable range");
                let book = grids.entry(id).or_default();
                let Some((title, grid)) = MockSheets::resolve_sheet(book, &range) else {
                    return Ok(json!({ "values": [] }));
                };
                let values = slice_grid(grid, &range);
                let title = title.clone();
                Ok(json!({
                    "range": range_with_sheet(&range, &title),
                    "majorDimension": "ROWS",
                    "values": values,
                }))
            }
            "values.update" => {
                let id = spreadsheet_id_from_url(&req.url);
                let range = range_from_url(&req.url).expect("mock: parseable range");
                let values = body_values(req);
                let book = grids.entry(id.clone()).or_default();
                let Some((title, grid)) = MockSheets::resolve_sheet(book, &range) else {
                    return Err(UpstreamError::new(
                        super::types::UpstreamErrorKind::NotFound,
                        "no such sheet",
                    ));
                };
                let title = title.clone();
                let (rows, cols, cells) = update_grid(grid, &range, &values);
                Ok(json!({
                    "spreadsheetId": id,
                    "updatedRange": updated_range_a1(&title, &range, rows, cols),
                    "updatedRows": rows,
                    "updatedColumns": cols,
                    "updatedCells": cells,
                }))
            }
            "values.append" => {
                let id = spreadsheet_id_from_url(&req.url);
                let range = range_from_url(&req.url).expect("mock: parseable range");
                let values = body_values(req);
                let book = grids.entry(id.clone()).or_default();
                let Some((title, grid)) = MockSheets::resolve_sheet(book, &range) else {
                    return Err(UpstreamError::new(
                        super::types::UpstreamErrorKind::NotFound,
                        "no such sheet",
                    ));
                };
                let title = title.clone();
                let start = grid.rows.len() as u32;
                let anchor = A1Range {
                    sheet: Some(title.clone()),
                    start_row: Some(start),
                    end_row: None,
                    start_col: Some(0),
                    end_col: None,
                };
                let (rows, cols, cells) = update_grid(grid, &anchor, &values);
                Ok(json!({
                    "spreadsheetId": id,
                    "updates": {
                        "spreadsheetId": id,
                        "updatedRange": updated_range_a1(&title, &anchor, rows, cols),
                        "updatedRows": rows,
                        "updatedColumns": cols,
                        "updatedCells": cells,
                    }
                }))
            }
            "values.batch_update" => {
                let id = spreadsheet_id_from_url(&req.url);
                let data = req
                    .body
                    .as_ref()
                    .and_then(|b| b.get("data"))
                    .and_then(|d| d.as_array())
                    .cloned()
                    .unwrap_or_default();
                let book = grids.entry(id.clone()).or_default();
                let mut responses = Vec::new();
                let mut total = 0u32;
                for entry in data {
                    let range = A1Range::parse(entry["range"].as_str().unwrap_or_default())
                        .expect("mock: parseable range");
                    let values: Vec<Vec<Value>> =
                        serde_json::from_value(entry["values"].clone()).unwrap_or_default();
                    let Some((title, grid)) = MockSheets::resolve_sheet(book, &range) else {
                        return Err(UpstreamError::new(
                            super::types::UpstreamErrorKind::NotFound,
                            "no such sheet",
                        ));
                    };
                    let title = title.clone();
                    let (rows, cols, cells) = update_grid(grid, &range, &values);
                    total += cells;
                    responses.push(json!({
                        "spreadsheetId": id,
                        "updatedRange": updated_range_a1(&title, &range, rows, cols),
                        "updatedRows": rows,
                        "updatedColumns": cols,
                        "updatedCells": cells,
                    }));
                }
                Ok(json!({
                    "spreadsheetId": id,
                    "totalUpdatedCells": total,
                    "responses": responses,
                }))
            }
            "values.clear" => {
                let id = spreadsheet_id_from_url(&req.url);
                let range = range_from_url(&req.url).expect("mock: parseable range");
                let book = grids.entry(id.clone()).or_default();
                if let Some((title, grid)) = MockSheets::resolve_sheet(book, &range) {
                    let title = title.clone();
                    let start_row = range.start_row.unwrap_or(0) as usize;
                    let end_row = range
                        .end_row
                        .map(|r| r as usize)
                        .unwrap_or(grid.rows.len())
                        .min(grid.rows.len());
                    for row in grid.rows.iter_mut().take(end_row).skip(start_row) {
                        let start_col = range.start_col.unwrap_or(0) as usize;
                        let end_col = range
                            .end_col
                            .map(|c| c as usize)
                            .unwrap_or(row.len())
                            .min(row.len());
                        for cell in row.iter_mut().take(end_col).skip(start_col) {
                            *cell = Value::Null;
                        }
                    }
                    return Ok(json!({
                        "spreadsheetId": id,
                        "clearedRange": range_with_sheet(&range, &title),
                    }));
                }
                Ok(json!({ "spreadsheetId": id, "clearedRange": "" }))
            }
            "spreadsheets.get" => {
                let id = spreadsheet_id_from_url(&req.url);
                let book = grids.entry(id.clone()).or_default();
                let sheets: Vec<Value> = book
                    .iter()
                    .map(|(title, g)| {
                        json!({
                            "properties": {
                                "sheetId": g.sheet_id,
                                "title": title,
                                "gridProperties": {
                                    "rowCount": g.rows.len(),
                                    "columnCount": g
                                        .rows
                                        .iter()
                                        .map(|r| r.len())
                                        .max()
                                        .unwrap_or(26)
                                        .max(1),
                                },
                            }
                        })
                    })
                    .collect();
                Ok(json!({
                    "spreadsheetId": id,
                    "properties": { "title": format!("Mock {id}") },
                    "sheets": sheets,
                }))
            }
            "spreadsheets.batch_update" => {
                let id = spreadsheet_id_from_url(&req.url);
                let requests = req
                    .body
                    .as_ref()
                    .and_then(|b| b.get("requests"))
                    .and_then(|r| r.as_array())
                    .cloned()
                    .unwrap_or_default();
                let book = grids.entry(id.clone()).or_default();
                let mut replies = Vec::new();
                for request in requests {
                    if let Some(append) = request.get("appendCells") {
                        let sheet_id = append["sheetId"].as_i64().unwrap_or(0);
                        let Some(grid) =
                            book.values_mut().find(|g| g.sheet_id == sheet_id)
                        else {
                            return Err(UpstreamError::new(
                                super::types::UpstreamErrorKind::NotFound,
                                "no such sheetId",
                            ));
                        };
                        let rows = append["rows"].as_array().cloned().unwrap_or_default();
                        for row in rows {
                            let cells: Vec<Value> = row["values"]
                                .as_array()
                                .cloned()
                                .unwrap_or_default()
                                .iter()
                                .map(|cell| from_extended_value(&cell["userEnteredValue"]))
                                .collect();
                            grid.rows.push(cells);
                        }
                    }
                    replies.push(json!({}));
                }
                Ok(json!({ "spreadsheetId": id, "replies": replies }))
            }
            "developer_metadata.search" => Ok(json!({})),
            "drive.files.copy" => {
                let source = req
                    .url
                    .split("/files/")
                    .nth(1)
                    .and_then(|s| s.split('/').next())
                    .unwrap_or_default()
                    .to_string();
                let mut seq = self.snapshot_seq.lock().expect("seq lock");
                *seq += 1;
                let snap_id = format!("snap-{}", *seq);
                let copied = grids.get(&source).cloned().unwrap_or_default();
                grids.insert(snap_id.clone(), copied);
                let name = req
                    .body
                    .as_ref()
                    .and_then(|b| b["name"].as_str())
                    .unwrap_or("snapshot")
                    .to_string();
                Ok(json!({
                    "id": snap_id,
                    "name": name,
                    "createdTime": chrono::Utc::now().to_rfc3339(),
                }))
            }
            other => panic!("MockSheets: unhandled endpoint {other}"),
        }
    }
}

fn body_values(req: &UpstreamRequest) -> Vec<Vec<Value>> {
    req.body
        .as_ref()
        .and_then(|b| b.get("values"))
        .cloned()
        .map(|v| serde_json::from_value(v).unwrap_or_default())
        .unwrap_or_default()
}

fn range_with_sheet(range: &A1Range, title: &str) -> String {
    let mut r = range.clone();
    if r.sheet.is_none() {
        r.sheet = Some(title.to_string());
    }
    r.to_a1()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn mock_reads_and_writes_round_trip() {
        let mock = MockSheets::new();
        mock.seed_sheet("ss1", "Sheet1", vec![vec![json!("a"), json!("b")]]);

        let read = UpstreamRequest::get(
            "values.get",
            "https://sheets.googleapis.com/v4/spreadsheets/ss1/values/Sheet1%21A1%3AB2".into(),
        );
        let resp = mock.execute(&read, "t", None).await.unwrap();
        assert_eq!(resp["values"][0][0], "a");

        let write = UpstreamRequest::put(
            "values.update",
            "https://sheets.googleapis.com/v4/spreadsheets/ss1/values/Sheet1%21A2?valueInputOption=RAW".into(),
            json!({ "values": [["c", "d"]] }),
        );
        let resp = mock.execute(&write, "t", None).await.unwrap();
        assert_eq!(resp["updatedCells"], 2);
        assert_eq!(resp["updatedRange"], "Sheet1!A2:B2");
        assert_eq!(mock.grid("ss1", "Sheet1")[1], vec![json!("c"), json!("d")]);
    }

    #[tokio::test]
    async fn scripted_failures_are_consumed_in_order() {
        let mock = MockSheets::new();
        mock.seed_sheet("ss1", "Sheet1", vec![]);
        mock.push_failures(
            "values.get",
            UpstreamError::new(super::super::types::UpstreamErrorKind::Transient, "boom"),
            1,
        );
        let read = UpstreamRequest::get(
            "values.get",
            "https://sheets.googleapis.com/v4/spreadsheets/ss1/values/Sheet1%21A1".into(),
        );
        assert!(mock.execute(&read, "t", None).await.is_err());
        assert!(mock.execute(&read, "t", None).await.is_ok());
        assert_eq!(mock.calls_for("values.get"), 2);
    }
}
