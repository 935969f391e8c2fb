//! A1 notation: parsing, formatting, overlap, and bounding boxes.
//!
//! One implementation shared by the cache (range invalidation), the read
//! merger (bounding box + slicing), the batcher, and the range resolver.
//! Coordinates are 0-based half-open intervals; `None` on an axis means
//! unbounded along that axis (whole column / whole row references).

use crate::error::{ApiError, ErrorCode};

/// A parsed range reference. `start_*` inclusive, `end_*` exclusive.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct A1Range {
    pub sheet: Option<String>,
    pub start_row: Option<u32>,
    pub end_row: Option<u32>,
    pub start_col: Option<u32>,
    pub end_col: Option<u32>,
}

impl A1Range {
    /// Whole-sheet reference.
    pub fn whole_sheet(sheet: impl Into<String>) -> Self {
        Self {
            sheet: Some(sheet.into()),
            start_row: None,
            end_row: None,
            start_col: None,
            end_col: None,
        }
    }

    pub fn cell(sheet: Option<String>, row: u32, col: u32) -> Self {
        Self {
            sheet,
            start_row: Some(row),
            end_row: Some(row + 1),
            start_col: Some(col),
            end_col: Some(col + 1),
        }
    }

    /// Number of rows, if bounded on that axis.
    pub fn row_count(&self) -> Option<u32> {
        match (self.start_row, self.end_row) {
            (Some(s), Some(e)) => Some(e.saturating_sub(s)),
            _ => None,
        }
    }

    pub fn col_count(&self) -> Option<u32> {
        match (self.start_col, self.end_col) {
            (Some(s), Some(e)) => Some(e.saturating_sub(s)),
            _ => None,
        }
    }

    /// Estimated cell count; unbounded axes count as a large constant so the
    /// safety guardrail treats whole-column writes as high risk.
    pub fn estimated_cells(&self) -> u64 {
        const UNBOUNDED_AXIS: u64 = 100_000;
        let rows = self.row_count().map(u64::from).unwrap_or(UNBOUNDED_AXIS);
        let cols = self.col_count().map(u64::from).unwrap_or(UNBOUNDED_AXIS.min(1_000));
        rows.saturating_mul(cols)
    }

    /// Sheet comparison for overlap purposes. A reference without a sheet
    /// matches any sheet — over-invalidation is safe, stale data is not.
    fn same_sheet(&self, other: &A1Range) -> bool {
        match (&self.sheet, &other.sheet) {
            (Some(a), Some(b)) => a.eq_ignore_ascii_case(b),
            _ => true,
        }
    }

    /// True when the two ranges share at least one cell.
    pub fn overlaps(&self, other: &A1Range) -> bool {
        self.same_sheet(other)
            && axes_overlap(self.start_row, self.end_row, other.start_row, other.end_row)
            && axes_overlap(self.start_col, self.end_col, other.start_col, other.end_col)
    }

    /// Overlapping, or touching along one edge (used by the merger when
    /// `merge_adjacent` is on).
    pub fn adjacent_or_overlapping(&self, other: &A1Range) -> bool {
        self.same_sheet(other)
            && axes_touch(self.start_row, self.end_row, other.start_row, other.end_row)
            && axes_touch(self.start_col, self.end_col, other.start_col, other.end_col)
    }

    /// Minimal rectangle containing `self` and `other`. Sheets must already
    /// agree (the merger groups by sheet before boxing).
    pub fn union(&self, other: &A1Range) -> A1Range {
        A1Range {
            sheet: self.sheet.clone().or_else(|| other.sheet.clone()),
            start_row: min_opt(self.start_row, other.start_row),
            end_row: max_opt(self.end_row, other.end_row),
            start_col: min_opt(self.start_col, other.start_col),
            end_col: max_opt(self.end_col, other.end_col),
        }
    }

    /// Bounding box over a non-empty set of ranges.
    pub fn bounding_box<'a>(mut ranges: impl Iterator<Item = &'a A1Range>) -> Option<A1Range> {
        let first = ranges.next()?.clone();
        Some(ranges.fold(first, |acc, r| acc.union(r)))
    }

    /// Row/column offset of `self` inside `outer`. Requires both bounded.
    pub fn offset_within(&self, outer: &A1Range) -> Option<(usize, usize)> {
        let row = self.start_row?.checked_sub(outer.start_row?)?;
        let col = self.start_col?.checked_sub(outer.start_col?)?;
        Some((row as usize, col as usize))
    }

    /// Parse an A1 reference. Accepts bare cells (`B2`), rectangles
    /// (`A1:B10`), whole columns (`A:D`), whole rows (`1:10`), unquoted and
    /// quoted sheet names (`'Q1 ''24'!A1:C3`), and `$` absolute markers.
    pub fn parse(input: &str) -> Result<A1Range, ApiError> {
        let input = input.trim();
        if input.is_empty() {
            return Err(range_error(input, "empty range reference"));
        }

        let (sheet, rest) = split_sheet(input)?;
        if sheet.as_deref() == Some("") {
            return Err(range_error(input, "empty sheet name"));
        }

        // A sheet name alone refers to the whole sheet.
        if rest.is_empty() {
            return match sheet {
                Some(s) => Ok(A1Range::whole_sheet(s)),
                None => Err(range_error(input, "empty range after sheet separator")),
            };
        }

        let (lhs, rhs) = match rest.split_once(':') {
            Some((l, r)) => (l, Some(r)),
            None => (rest, None),
        };

        let range = match rhs {
            None => {
                // Bare cell, or (matching the live API) a bare sheet title.
                match parse_component(lhs) {
                    Some((Some(col), Some(row))) => A1Range::cell(sheet, row, col),
                    _ if sheet.is_none() && !input.starts_with('\'') => {
                        A1Range::whole_sheet(input)
                    }
                    _ => {
                        return Err(range_error(input, "bare reference must be a full cell"))
                    }
                }
            }
            Some(rhs) => {
                let (start_col, start_row) = parse_component(lhs)
                    .ok_or_else(|| range_error(input, "unparseable cell reference"))?;
                let (end_col, end_row) = parse_component(rhs)
                    .ok_or_else(|| range_error(input, "unparseable cell reference"))?;
                // Normalize reversed references (B10:A1 == A1:B10).
                let (c0, c1) = order(start_col, end_col);
                let (r0, r1) = order(start_row, end_row);
                A1Range {
                    sheet,
                    start_row: r0,
                    end_row: r1.map(|r| r + 1),
                    start_col: c0,
                    end_col: c1.map(|c| c + 1),
                }
            }
        };
        Ok(range)
    }

    /// Format back to A1 notation. Quotes the sheet name when it contains
    /// anything beyond alphanumerics/underscores.
    pub fn to_a1(&self) -> String {
        let mut out = String::new();
        if let Some(sheet) = &self.sheet {
            let needs_quotes = !sheet
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_');
            if needs_quotes {
                out.push('\'');
                out.push_str(&sheet.replace('\'', "''"));
                out.push('\'');
            } else {
                out.push_str(sheet);
            }
            out.push('!');
        }

        match (self.start_row, self.end_row, self.start_col, self.end_col) {
            (None, None, None, None) => {
                // Whole sheet — the sheet prefix alone is the reference.
                if out.ends_with('!') {
                    out.pop();
                }
            }
            (Some(r0), Some(r1), Some(c0), Some(c1)) if r1 == r0 + 1 && c1 == c0 + 1 => {
                out.push_str(&col_letters(c0));
                out.push_str(&(r0 + 1).to_string());
            }
            _ => {
                push_component(&mut out, self.start_col, self.start_row);
                out.push(':');
                push_component(
                    &mut out,
                    self.end_col.map(|c| c - 1),
                    self.end_row.map(|r| r - 1),
                );
            }
        }
        out
    }
}

fn range_error(input: &str, why: &str) -> ApiError {
    ApiError::new(
        ErrorCode::RangeNotFound,
        format!("invalid A1 reference {input:?}: {why}"),
    )
}

fn order(a: Option<u32>, b: Option<u32>) -> (Option<u32>, Option<u32>) {
    match (a, b) {
        (Some(x), Some(y)) if x > y => (Some(y), Some(x)),
        other => other,
    }
}

fn min_opt(a: Option<u32>, b: Option<u32>) -> Option<u32> {
    match (a, b) {
        (Some(x), Some(y)) => Some(x.min(y)),
        _ => None,
    }
}

fn max_opt(a: Option<u32>, b: Option<u32>) -> Option<u32> {
    match (a, b) {
        (Some(x), Some(y)) => Some(x.max(y)),
        _ => None,
    }
}

/// Half-open interval overlap where `None` is unbounded.
fn axes_overlap(a0: Option<u32>, a1: Option<u32>, b0: Option<u32>, b1: Option<u32>) -> bool {
    let lo = max_bound(a0, b0);
    let hi = min_bound(a1, b1);
    match (lo, hi) {
        (Some(lo), Some(hi)) => lo < hi,
        _ => true,
    }
}

/// Like `axes_overlap` but counts a shared edge as touching.
fn axes_touch(a0: Option<u32>, a1: Option<u32>, b0: Option<u32>, b1: Option<u32>) -> bool {
    let lo = max_bound(a0, b0);
    let hi = min_bound(a1, b1);
    match (lo, hi) {
        (Some(lo), Some(hi)) => lo <= hi,
        _ => true,
    }
}

fn max_bound(a: Option<u32>, b: Option<u32>) -> Option<u32> {
    match (a, b) {
        (Some(x), Some(y)) => Some(x.max(y)),
        (Some(x), None) | (None, Some(x)) => Some(x),
        (None, None) => None,
    }
}

fn min_bound(a: Option<u32>, b: Option<u32>) -> Option<u32> {
    match (a, b) {
        (Some(x), Some(y)) => Some(x.min(y)),
        (Some(x), None) | (None, Some(x)) => Some(x),
        (None, None) => None,
    }
}

/// Split an optional sheet prefix off the reference. Handles quoted names
/// with `''` escapes; an unquoted prefix is a sheet only when `!` appears.
pub(crate) fn split_sheet(input: &str) -> Result<(Option<String>, &str), ApiError> {
    if let Some(rest) = input.strip_prefix('\'') {
        // Scan for the closing quote, honouring '' escapes.
        let bytes = rest.as_bytes();
        let mut name = String::new();
        let mut i = 0;
        while i < bytes.len() {
            if bytes[i] == b'\'' {
                if bytes.get(i + 1) == Some(&b'\'') {
                    name.push('\'');
                    i += 2;
                    continue;
                }
                // Closing quote — expect `!` next.
                let after = &rest[i + 1..];
                let tail = after.strip_prefix('!').ok_or_else(|| {
                    range_error(input, "quoted sheet name must be followed by '!'")
                })?;
                return Ok((Some(name), tail));
            }
            let ch = rest[i..].chars().next().expect("in-bounds char");
            name.push(ch);
            i += ch.len_utf8();
        }
        Err(range_error(input, "unterminated quoted sheet name"))
    } else {
        match input.split_once('!') {
            Some((sheet, rest)) => Ok((Some(sheet.to_string()), rest)),
            None => Ok((None, input)),
        }
    }
}

/// One side of a range: letters, digits, both, or (for open-ended sides)
/// neither. Returns `(column, row)` as 0-based indices. `$` markers are
/// ignored. Returns `None` on anything else.
fn parse_component(s: &str) -> Option<(Option<u32>, Option<u32>)> {
    let s: String = s.chars().filter(|&c| c != '$').collect();
    let letters: String = s.chars().take_while(|c| c.is_ascii_alphabetic()).collect();
    let digits = &s[letters.len()..];

    if !digits.is_empty() && !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }

    let col = if letters.is_empty() {
        None
    } else {
        Some(letters_to_col(&letters)?)
    };
    let row = if digits.is_empty() {
        None
    } else {
        let n: u32 = digits.parse().ok()?;
        if n == 0 {
            return None;
        }
        Some(n - 1)
    };
    if col.is_none() && row.is_none() {
        return None;
    }
    Some((col, row))
}

fn push_component(out: &mut String, col: Option<u32>, row: Option<u32>) {
    if let Some(c) = col {
        out.push_str(&col_letters(c));
    }
    if let Some(r) = row {
        out.push_str(&(r + 1).to_string());
    }
}

/// 0-based column index → letters (0 = A, 25 = Z, 26 = AA).
pub fn col_letters(mut col: u32) -> String {
    let mut out = Vec::new();
    loop {
        out.push(b'A' + (col % 26) as u8);
        col /= 26;
        if col == 0 {
            break;
        }
        col -= 1;
    }
    out.reverse();
    String::from_utf8(out).expect("ASCII letters")
}

/// Letters → 0-based column index. Rejects out-of-range columns.
fn letters_to_col(letters: &str) -> Option<u32> {
    let mut col: u64 = 0;
    for c in letters.chars() {
        let v = (c.to_ascii_uppercase() as u64) - ('A' as u64) + 1;
        col = col * 26 + v;
        if col > 18_278 {
            // Sheets tops out at column ZZZ.
            return None;
        }
    }
    Some((col - 1) as u32)
}
