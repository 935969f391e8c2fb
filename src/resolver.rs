//! Semantic range resolution.
//!
//! Tool inputs accept three reference shapes beyond plain A1:
//! - `header:Name` (optionally `Sheet!header:Name`) — the column whose
//!   header row cell matches `Name`;
//! - `named:RangeName` — a spreadsheet named range;
//! - `meta:key` — a developer-metadata dimension lookup.
//!
//! Resolution consults the cache first, then the API, and caches the result
//! tagged with the resolved range so overlapping writes invalidate it.

use std::sync::Arc;

use serde_json::Value;

use crate::a1::{col_letters, split_sheet, A1Range};
use crate::cache::{CacheManager, DependencyTag, NS_RESOLVER};
use crate::config::Config;
use crate::error::{ApiError, ErrorCode};
use crate::sheets::client::{CallContext, SheetsClient};
use crate::sheets::types::GridRangeDto;

pub struct RangeResolver {
    cache: Arc<CacheManager>,
    client: Arc<SheetsClient>,
    config: Arc<Config>,
}

impl RangeResolver {
    pub fn new(cache: Arc<CacheManager>, client: Arc<SheetsClient>, config: Arc<Config>) -> Self {
        Self {
            cache,
            client,
            config,
        }
    }

    /// Resolve any accepted reference shape to a concrete A1 string.
    pub async fn resolve(
        &self,
        spreadsheet_id: &str,
        reference: &str,
        ctx: &CallContext,
    ) -> Result<String, ApiError> {
        let reference = reference.trim();

        // Plain A1 resolves locally; no caching needed.
        let (sheet, rest) = split_sheet(reference)?;
        let semantic = rest.starts_with("header:")
            || reference.starts_with("named:")
            || reference.starts_with("meta:");
        if !semantic {
            return Ok(A1Range::parse(reference)?.to_a1());
        }

        let cache_key = format!("resolver|{spreadsheet_id}|{reference}");
        if let Some(cached) = self.cache.get(NS_RESOLVER, &cache_key).await {
            if let Some(resolved) = cached.as_str() {
                return Ok(resolved.to_string());
            }
        }

        let resolved = if let Some(name) = rest.strip_prefix("header:") {
            self.resolve_header(spreadsheet_id, sheet.as_deref(), name, ctx)
                .await?
        } else if let Some(name) = reference.strip_prefix("named:") {
            self.resolve_named(spreadsheet_id, name, ctx).await?
        } else if let Some(key) = reference.strip_prefix("meta:") {
            self.resolve_metadata(spreadsheet_id, key, ctx).await?
        } else {
            unreachable!("semantic reference shapes covered above")
        };

        let tags = A1Range::parse(&resolved)
            .ok()
            .map(|range| {
                vec![DependencyTag {
                    spreadsheet_id: spreadsheet_id.to_string(),
                    range,
                }]
            })
            .unwrap_or_default();
        self.cache
            .set(
                NS_RESOLVER,
                &cache_key,
                Value::String(resolved.clone()),
                self.config.cache_ttl_resolver,
                tags,
            )
            .await;
        Ok(resolved)
    }

    /// `header:Name` → the whole column whose row-1 cell equals `Name`
    /// (case-insensitive).
    async fn resolve_header(
        &self,
        spreadsheet_id: &str,
        sheet: Option<&str>,
        name: &str,
        ctx: &CallContext,
    ) -> Result<String, ApiError> {
        let sheet = match sheet {
            Some(s) => s.to_string(),
            None => {
                let meta = self.client.spreadsheet_get(spreadsheet_id, ctx).await?;
                meta.first_sheet()
                    .map(|p| p.title.clone())
                    .ok_or_else(|| {
                        ApiError::new(ErrorCode::NotFound, "spreadsheet has no sheets")
                    })?
            }
        };

        let header_range = A1Range {
            sheet: Some(sheet.clone()),
            start_row: Some(0),
            end_row: Some(1),
            start_col: None,
            end_col: None,
        };
        let header_row = self
            .client
            .values_get(
                spreadsheet_id,
                &header_range.to_a1(),
                "FORMATTED_VALUE",
                "ROWS",
                ctx,
            )
            .await?;

        let headers = header_row.values.first().cloned().unwrap_or_default();
        let found = headers.iter().position(|cell| {
            cell.as_str()
                .is_some_and(|s| s.trim().eq_ignore_ascii_case(name))
        });
        match found {
            Some(col) => {
                let letter = col_letters(col as u32);
                let sheet_prefix = A1Range::whole_sheet(sheet).to_a1();
                Ok(format!("{sheet_prefix}!{letter}:{letter}"))
            }
            None => Err(ApiError::new(
                ErrorCode::RangeNotFound,
                format!("no header named {name:?} in {sheet:?}"),
            )
            .with_details(serde_json::json!({
                "available_headers": headers,
            }))
            .with_resolution("Check the header row; names match case-insensitively")),
        }
    }

    /// `named:RangeName` → A1 from the spreadsheet's named ranges.
    async fn resolve_named(
        &self,
        spreadsheet_id: &str,
        name: &str,
        ctx: &CallContext,
    ) -> Result<String, ApiError> {
        let meta = self.client.spreadsheet_get(spreadsheet_id, ctx).await?;
        let named = meta
            .named_ranges
            .iter()
            .find(|nr| nr.name.eq_ignore_ascii_case(name))
            .ok_or_else(|| {
                ApiError::new(
                    ErrorCode::RangeNotFound,
                    format!("no named range {name:?} in spreadsheet"),
                )
                .with_details(serde_json::json!({
                    "available": meta
                        .named_ranges
                        .iter()
                        .map(|nr| nr.name.clone())
                        .collect::<Vec<_>>(),
                }))
            })?;
        let sheet_title = meta
            .sheet_by_id(named.range.sheet_id)
            .map(|p| p.title.clone());
        Ok(grid_range_to_a1(&named.range, sheet_title).to_a1())
    }

    /// `meta:key` → the dimension range carrying that developer metadata.
    async fn resolve_metadata(
        &self,
        spreadsheet_id: &str,
        key: &str,
        ctx: &CallContext,
    ) -> Result<String, ApiError> {
        let found = self
            .client
            .developer_metadata_search(spreadsheet_id, key, ctx)
            .await?;
        let location = found
            .pointer("/matchedDeveloperMetadata/0/developerMetadata/location")
            .cloned()
            .ok_or_else(|| {
                ApiError::new(
                    ErrorCode::RangeNotFound,
                    format!("no developer metadata with key {key:?}"),
                )
            })?;

        let dim = location.pointer("/dimensionRange").cloned().ok_or_else(|| {
            ApiError::new(
                ErrorCode::RangeNotFound,
                format!("developer metadata {key:?} is not attached to a dimension"),
            )
        })?;
        let sheet_id = dim.get("sheetId").and_then(Value::as_i64).unwrap_or(0);
        let start = dim.get("startIndex").and_then(Value::as_u64).unwrap_or(0) as u32;
        let end = dim
            .get("endIndex")
            .and_then(Value::as_u64)
            .map(|e| e as u32)
            .unwrap_or(start + 1);
        let columns = dim
            .get("dimension")
            .and_then(Value::as_str)
            .is_some_and(|d| d.eq_ignore_ascii_case("COLUMNS"));

        let meta = self.client.spreadsheet_get(spreadsheet_id, ctx).await?;
        let sheet = meta.sheet_by_id(sheet_id).map(|p| p.title.clone());
        let range = if columns {
            A1Range {
                sheet,
                start_row: None,
                end_row: None,
                start_col: Some(start),
                end_col: Some(end),
            }
        } else {
            A1Range {
                sheet,
                start_row: Some(start),
                end_row: Some(end),
                start_col: None,
                end_col: None,
            }
        };
        Ok(range.to_a1())
    }
}

fn grid_range_to_a1(dto: &GridRangeDto, sheet: Option<String>) -> A1Range {
    A1Range {
        sheet,
        start_row: dto.start_row_index,
        end_row: dto.end_row_index,
        start_col: dto.start_column_index,
        end_col: dto.end_column_index,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::TokenSource;
    use crate::resilience::{BreakerConfig, BreakerRegistry, RetryPolicy, TokenBucket};
    use crate::sheets::mock::MockSheets;
    use serde_json::json;
    use std::time::Duration;

    fn resolver(mock: Arc<MockSheets>) -> RangeResolver {
        let client = Arc::new(SheetsClient::new(
            mock,
            Arc::new(TokenSource::fixed(reqwest::Client::new(), "t")),
            Arc::new(BreakerRegistry::new(BreakerConfig::default())),
            RetryPolicy::new(0, Duration::from_millis(1), Duration::from_millis(2)),
            Arc::new(TokenBucket::new("reads", 1000.0, 1000.0)),
            Arc::new(TokenBucket::new("writes", 1000.0, 1000.0)),
        ));
        RangeResolver::new(
            Arc::new(CacheManager::new(1024 * 1024, None)),
            client,
            Arc::new(Config::for_tests()),
        )
    }

    #[tokio::test]
    async fn plain_a1_normalizes_without_any_api_call() {
        let mock = Arc::new(MockSheets::new());
        let r = resolver(Arc::clone(&mock));
        let out = r
            .resolve("ss1", "Sheet1!B10:A1", &CallContext::default())
            .await
            .unwrap();
        assert_eq!(out, "Sheet1!A1:B10");
        assert_eq!(mock.total_calls(), 0);
    }

    #[tokio::test]
    async fn header_reference_resolves_to_its_column() {
        let mock = Arc::new(MockSheets::new());
        mock.seed_sheet(
            "ss1",
            "Data",
            vec![vec![json!("Id"), json!("Name"), json!("Email")]],
        );
        let r = resolver(Arc::clone(&mock));
        let out = r
            .resolve("ss1", "Data!header:email", &CallContext::default())
            .await
            .unwrap();
        assert_eq!(out, "Data!C:C");

        // Second resolution is served from the resolver cache.
        let calls_before = mock.total_calls();
        let again = r
            .resolve("ss1", "Data!header:email", &CallContext::default())
            .await
            .unwrap();
        assert_eq!(again, "Data!C:C");
        assert_eq!(mock.total_calls(), calls_before);
    }

    #[tokio::test]
    async fn missing_header_lists_available_ones() {
        let mock = Arc::new(MockSheets::new());
        mock.seed_sheet("ss1", "Data", vec![vec![json!("Id"), json!("Name")]]);
        let r = resolver(mock);
        let err = r
            .resolve("ss1", "Data!header:Missing", &CallContext::default())
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::RangeNotFound);
        assert_eq!(err.details.unwrap()["available_headers"][1], "Name");
    }

    #[tokio::test]
    async fn unknown_named_range_is_range_not_found() {
        let mock = Arc::new(MockSheets::new());
        mock.seed_sheet("ss1", "Sheet1", vec![]);
        let r = resolver(mock);
        let err = r
            .resolve("ss1", "named:Budget", &CallContext::default())
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::RangeNotFound);
    }
}
