//! Wire types for the Sheets/Drive APIs and the upstream error taxonomy.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ApiError, ErrorCode};

// ── Value types ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValueRange {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub range: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub major_dimension: Option<String>,
    #[serde(default)]
    pub values: Vec<Vec<Value>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateValuesResponse {
    #[serde(default)]
    pub spreadsheet_id: String,
    #[serde(default)]
    pub updated_range: String,
    #[serde(default)]
    pub updated_rows: u32,
    #[serde(default)]
    pub updated_columns: u32,
    #[serde(default)]
    pub updated_cells: u32,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClearValuesResponse {
    #[serde(default)]
    pub spreadsheet_id: String,
    #[serde(default)]
    pub cleared_range: String,
}

// ── Spreadsheet metadata ─────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GridProperties {
    #[serde(default)]
    pub row_count: u32,
    #[serde(default)]
    pub column_count: u32,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SheetProperties {
    #[serde(default)]
    pub sheet_id: i64,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub grid_properties: GridProperties,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Sheet {
    #[serde(default)]
    pub properties: SheetProperties,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpreadsheetProperties {
    #[serde(default)]
    pub title: String,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GridRangeDto {
    #[serde(default)]
    pub sheet_id: i64,
    pub start_row_index: Option<u32>,
    pub end_row_index: Option<u32>,
    pub start_column_index: Option<u32>,
    pub end_column_index: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NamedRange {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub range: GridRangeDto,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Spreadsheet {
    #[serde(default)]
    pub spreadsheet_id: String,
    #[serde(default)]
    pub properties: SpreadsheetProperties,
    #[serde(default)]
    pub sheets: Vec<Sheet>,
    #[serde(default)]
    pub named_ranges: Vec<NamedRange>,
}

impl Spreadsheet {
    pub fn sheet_by_id(&self, sheet_id: i64) -> Option<&SheetProperties> {
        self.sheets
            .iter()
            .map(|s| &s.properties)
            .find(|p| p.sheet_id == sheet_id)
    }

    pub fn sheet_by_title(&self, title: &str) -> Option<&SheetProperties> {
        self.sheets
            .iter()
            .map(|s| &s.properties)
            .find(|p| p.title.eq_ignore_ascii_case(title))
    }

    pub fn first_sheet(&self) -> Option<&SheetProperties> {
        self.sheets.first().map(|s| &s.properties)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriveFile {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub created_time: Option<String>,
}

// ── Upstream errors ──────────────────────────────────────────────────────

/// Classified upstream failure. Drives the breaker (Transient / RateLimited /
/// Internal count as failures), the retry policy (Transient / RateLimited
/// retry), and the one-shot token refresh (AuthExpired).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamErrorKind {
    Transient,
    RateLimited,
    PermissionDenied,
    NotFound,
    AuthExpired,
    Invalid,
    Internal,
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind:?} from upstream: {message}")]
pub struct UpstreamError {
    pub kind: UpstreamErrorKind,
    pub status: Option<u16>,
    pub message: String,
    pub retry_after: Option<Duration>,
    pub missing_scopes: Vec<String>,
}

impl UpstreamError {
    pub fn new(kind: UpstreamErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            status: None,
            message: message.into(),
            retry_after: None,
            missing_scopes: Vec::new(),
        }
    }

    /// Whether the breaker should count this as a failure.
    pub fn counts_as_breaker_failure(&self) -> bool {
        matches!(
            self.kind,
            UpstreamErrorKind::Transient
                | UpstreamErrorKind::RateLimited
                | UpstreamErrorKind::Internal
        )
    }

    pub fn retryable(&self) -> bool {
        matches!(
            self.kind,
            UpstreamErrorKind::Transient | UpstreamErrorKind::RateLimited
        )
    }

    pub fn into_api_error(self, endpoint: &str) -> ApiError {
        let message = format!("{endpoint}: {}", self.message);
        match self.kind {
            UpstreamErrorKind::Transient | UpstreamErrorKind::Internal => {
                ApiError::new(ErrorCode::InternalError, message)
            }
            UpstreamErrorKind::RateLimited => {
                let mut err = ApiError::new(ErrorCode::RateLimitExceeded, message);
                if let Some(after) = self.retry_after {
                    err = err.with_retry_strategy(format!("retry after {}s", after.as_secs()));
                }
                err
            }
            UpstreamErrorKind::PermissionDenied => {
                let mut err = ApiError::new(ErrorCode::PermissionDenied, message);
                if !self.missing_scopes.is_empty() {
                    let scope_param = self.missing_scopes.join(" ");
                    err = err.with_details(serde_json::json!({
                        "missing_scopes": self.missing_scopes,
                        "authorization_url": format!(
                            "https://accounts.google.com/o/oauth2/v2/auth?scope={}&include_granted_scopes=true",
                            urlencode(&scope_param)
                        ),
                    }));
                }
                err
            }
            UpstreamErrorKind::NotFound => ApiError::new(ErrorCode::NotFound, message),
            UpstreamErrorKind::AuthExpired => ApiError::new(ErrorCode::AuthError, message),
            UpstreamErrorKind::Invalid => ApiError::new(ErrorCode::InvalidParams, message),
        }
    }
}

fn urlencode(s: &str) -> String {
    url::form_urlencoded::byte_serialize(s.as_bytes()).collect()
}

// ── CellData conversions (appendCells requests) ──────────────────────────

/// Plain JSON value → `ExtendedValue` for an appendCells request.
pub fn to_extended_value(v: &Value) -> Value {
    match v {
        Value::Null => serde_json::json!({}),
        Value::Bool(b) => serde_json::json!({ "boolValue": b }),
        Value::Number(n) => serde_json::json!({ "numberValue": n.as_f64() }),
        Value::String(s) if s.starts_with('=') => {
            serde_json::json!({ "formulaValue": s })
        }
        Value::String(s) => serde_json::json!({ "stringValue": s }),
        other => serde_json::json!({ "stringValue": other.to_string() }),
    }
}

/// Inverse of `to_extended_value`, tolerant of missing fields.
pub fn from_extended_value(v: &Value) -> Value {
    if let Some(s) = v.get("stringValue") {
        return s.clone();
    }
    if let Some(n) = v.get("numberValue") {
        return n.clone();
    }
    if let Some(b) = v.get("boolValue") {
        return b.clone();
    }
    if let Some(f) = v.get("formulaValue") {
        return f.clone();
    }
    Value::Null
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn value_range_tolerates_missing_fields() {
        let vr: ValueRange = serde_json::from_value(json!({
            "range": "Sheet1!A1:B2",
            "values": [["a", 1], ["b"]],
        }))
        .unwrap();
        assert_eq!(vr.values.len(), 2);
        assert_eq!(vr.values[1].len(), 1);

        let empty: ValueRange = serde_json::from_value(json!({})).unwrap();
        assert!(empty.values.is_empty());
    }

    #[test]
    fn permission_denied_gets_authorization_url() {
        let mut err = UpstreamError::new(UpstreamErrorKind::PermissionDenied, "forbidden");
        err.missing_scopes = vec!["https://www.googleapis.com/auth/spreadsheets".to_string()];
        let api = err.into_api_error("values.update");
        let details = api.details.unwrap();
        assert!(details["authorization_url"]
            .as_str()
            .unwrap()
            .starts_with("https://accounts.google.com/o/oauth2/v2/auth?scope="));
    }

    #[test]
    fn sheet_lookup_is_case_insensitive() {
        let ss: Spreadsheet = serde_json::from_value(json!({
            "spreadsheetId": "ss1",
            "sheets": [{ "properties": { "sheetId": 7, "title": "Data" } }],
        }))
        .unwrap();
        assert_eq!(ss.sheet_by_title("data").unwrap().sheet_id, 7);
        assert!(ss.sheet_by_title("missing").is_none());
    }
}
