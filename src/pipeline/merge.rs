//! Read merging.
//!
//! Reads of the same spreadsheet/sheet with identical render options that
//! arrive within one window are unioned into a single bounding-box read;
//! each caller gets back exactly the sub-rectangle it asked for. A window
//! drains on its timer or as soon as it reaches `max_window_size`. The
//! collector is removed from the window map before any caller is resolved,
//! so a drain happens exactly once.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::oneshot;

use crate::a1::A1Range;
use crate::error::ApiError;
use crate::sheets::client::{CallContext, SheetsClient};
use crate::sheets::types::ValueRange;

#[derive(Debug, Clone)]
pub struct MergeConfig {
    pub enabled: bool,
    pub window: Duration,
    pub max_window_size: usize,
    pub merge_adjacent: bool,
}

/// Reads must agree on all of this to share a window.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct MergeKey {
    spreadsheet_id: String,
    sheet: String,
    value_render: String,
    major_dimension: String,
}

struct PendingRead {
    range: A1Range,
    tx: oneshot::Sender<Result<ValueRange, ApiError>>,
}

struct SlotState {
    reads: Vec<PendingRead>,
    drained: bool,
}

type Slot = Arc<Mutex<SlotState>>;

/// Cheap handle: clones share the same window map and counters.
#[derive(Clone)]
pub struct ReadMerger {
    client: Arc<SheetsClient>,
    config: MergeConfig,
    windows: Arc<Mutex<HashMap<MergeKey, Slot>>>,
    windows_drained: Arc<AtomicU64>,
    merged_reads: Arc<AtomicU64>,
    direct_reads: Arc<AtomicU64>,
    api_calls_saved: Arc<AtomicU64>,
}

impl ReadMerger {
    pub fn new(client: Arc<SheetsClient>, config: MergeConfig) -> Self {
        Self {
            client,
            config,
            windows: Arc::new(Mutex::new(HashMap::new())),
            windows_drained: Arc::new(AtomicU64::new(0)),
            merged_reads: Arc::new(AtomicU64::new(0)),
            direct_reads: Arc::new(AtomicU64::new(0)),
            api_calls_saved: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Read a range, merging with concurrent eligible reads.
    pub async fn read(
        &self,
        spreadsheet_id: &str,
        range: &str,
        value_render: &str,
        major_dimension: &str,
        ctx: &CallContext,
    ) -> Result<ValueRange, ApiError> {
        let parsed = A1Range::parse(range)?;
        let bounded = parsed.row_count().is_some() && parsed.col_count().is_some();
        if !self.config.enabled || !bounded {
            // Unbounded rectangles cannot be sliced back out of a bounding
            // box reliably; they go straight through.
            self.direct_reads.fetch_add(1, Ordering::Relaxed);
            return self
                .client
                .values_get(spreadsheet_id, range, value_render, major_dimension, ctx)
                .await;
        }

        let key = MergeKey {
            spreadsheet_id: spreadsheet_id.to_string(),
            sheet: parsed
                .sheet
                .as_deref()
                .unwrap_or_default()
                .to_ascii_lowercase(),
            value_render: value_render.to_string(),
            major_dimension: major_dimension.to_string(),
        };

        let (tx, rx) = oneshot::channel();
        let pending = PendingRead { range: parsed, tx };

        loop {
            let (slot, created) = {
                let mut windows = self.windows.lock().expect("windows lock");
                match windows.get(&key) {
                    Some(slot) => (Arc::clone(slot), false),
                    None => {
                        let slot: Slot = Arc::new(Mutex::new(SlotState {
                            reads: Vec::new(),
                            drained: false,
                        }));
                        windows.insert(key.clone(), Arc::clone(&slot));
                        (slot, true)
                    }
                }
            };

            let drain_now = {
                let mut state = slot.lock().expect("slot lock");
                if state.drained {
                    // Raced a timer drain on a dying window; take a fresh one.
                    continue;
                }
                state.reads.push(pending);
                state.reads.len() >= self.config.max_window_size
            };

            if created {
                let this = self.clone();
                let timer_key = key.clone();
                let timer_slot = Arc::clone(&slot);
                let window = self.config.window;
                tokio::spawn(async move {
                    tokio::time::sleep(window).await;
                    this.drain(&timer_key, &timer_slot).await;
                });
            }
            if drain_now {
                self.drain(&key, &slot).await;
            }
            break;
        }

        rx.await
            .unwrap_or_else(|_| Err(ApiError::internal("merge window dropped its caller")))
    }

    /// Drain a window exactly once: out of the map first, then resolve.
    async fn drain(&self, key: &MergeKey, slot: &Slot) {
        {
            let mut windows = self.windows.lock().expect("windows lock");
            if let Some(current) = windows.get(key) {
                if Arc::ptr_eq(current, slot) {
                    windows.remove(key);
                }
            }
        }
        let reads = {
            let mut state = slot.lock().expect("slot lock");
            if state.drained {
                return;
            }
            state.drained = true;
            std::mem::take(&mut state.reads)
        };
        if reads.is_empty() {
            return;
        }
        self.windows_drained.fetch_add(1, Ordering::Relaxed);
        self.execute(key, reads).await;
    }

    async fn execute(&self, key: &MergeKey, reads: Vec<PendingRead>) {
        self.merged_reads
            .fetch_add(reads.len() as u64, Ordering::Relaxed);
        for group in cluster_reads(reads, self.config.merge_adjacent) {
            self.execute_group(key, group).await;
        }
    }

    async fn execute_group(&self, key: &MergeKey, reads: Vec<PendingRead>) {
        // The shared call is not bound to any single caller's deadline.
        let ctx = CallContext::default();

        if reads.len() == 1 {
            // A lone read skips the bounding-box transform entirely.
            let read = reads.into_iter().next().expect("one read");
            let result = self
                .client
                .values_get(
                    &key.spreadsheet_id,
                    &read.range.to_a1(),
                    &key.value_render,
                    &key.major_dimension,
                    &ctx,
                )
                .await;
            let _ = read.tx.send(result);
            return;
        }

        let bbox = A1Range::bounding_box(reads.iter().map(|r| &r.range))
            .expect("non-empty group");
        match self
            .client
            .values_get(
                &key.spreadsheet_id,
                &bbox.to_a1(),
                &key.value_render,
                &key.major_dimension,
                &ctx,
            )
            .await
        {
            Ok(response) => {
                self.api_calls_saved
                    .fetch_add(reads.len() as u64 - 1, Ordering::Relaxed);
                let columns_major = key.major_dimension.eq_ignore_ascii_case("COLUMNS");
                for read in reads {
                    let slice = slice_response(&response, &read.range, &bbox, columns_major);
                    let _ = read.tx.send(Ok(ValueRange {
                        range: Some(read.range.to_a1()),
                        major_dimension: Some(key.major_dimension.clone()),
                        values: slice,
                    }));
                }
            }
            Err(err) => {
                for read in reads {
                    let _ = read.tx.send(Err(err.clone()));
                }
            }
        }
    }

    pub fn stats(&self) -> Value {
        serde_json::json!({
            "enabled": self.config.enabled,
            "windows_drained": self.windows_drained.load(Ordering::Relaxed),
            "merged_reads": self.merged_reads.load(Ordering::Relaxed),
            "direct_reads": self.direct_reads.load(Ordering::Relaxed),
            "api_calls_saved": self.api_calls_saved.load(Ordering::Relaxed),
        })
    }
}

/// Partition a window into groups whose members touch each other.
/// Disjoint reads stay separate so one bounding box never drags in rows and
/// columns nobody asked for; adjacency counts as touching when
/// `merge_adjacent` is enabled.
fn cluster_reads(reads: Vec<PendingRead>, adjacent: bool) -> Vec<Vec<PendingRead>> {
    let touches = |a: &A1Range, b: &A1Range| {
        if adjacent {
            a.adjacent_or_overlapping(b)
        } else {
            a.overlaps(b)
        }
    };

    let mut clusters: Vec<(A1Range, Vec<PendingRead>)> = Vec::new();
    'reads: for read in reads {
        for (bbox, members) in clusters.iter_mut() {
            if touches(bbox, &read.range) {
                *bbox = bbox.union(&read.range);
                members.push(read);
                continue 'reads;
            }
        }
        let bbox = read.range.clone();
        clusters.push((bbox, vec![read]));
    }

    // A later read can bridge two earlier clusters; coalesce to a fixpoint.
    loop {
        let mut merged = None;
        'scan: for i in 0..clusters.len() {
            for j in (i + 1)..clusters.len() {
                if touches(&clusters[i].0, &clusters[j].0) {
                    merged = Some((i, j));
                    break 'scan;
                }
            }
        }
        match merged {
            Some((i, j)) => {
                let (bbox, members) = clusters.swap_remove(j);
                clusters[i].0 = clusters[i].0.union(&bbox);
                clusters[i].1.extend(members);
            }
            None => break,
        }
    }

    clusters.into_iter().map(|(_, members)| members).collect()
}

/// Cut a caller's sub-rectangle out of the bounding-box response. Rows
/// shorter than the rectangle (trailing empties trimmed upstream) clip; fully
/// empty trailing rows are dropped the way a direct read would.
fn slice_response(
    response: &ValueRange,
    want: &A1Range,
    bbox: &A1Range,
    columns_major: bool,
) -> Vec<Vec<Value>> {
    let Some((row_off, col_off)) = want.offset_within(bbox) else {
        return Vec::new();
    };
    let rows = want.row_count().unwrap_or(0) as usize;
    let cols = want.col_count().unwrap_or(0) as usize;

    let (outer_off, outer_len, inner_off, inner_len) = if columns_major {
        (col_off, cols, row_off, rows)
    } else {
        (row_off, rows, col_off, cols)
    };

    let mut out = Vec::with_capacity(outer_len);
    for i in 0..outer_len {
        let line = match response.values.get(outer_off + i) {
            Some(line) => {
                let end = (inner_off + inner_len).min(line.len());
                if inner_off >= end {
                    Vec::new()
                } else {
                    line[inner_off..end].to_vec()
                }
            }
            None => Vec::new(),
        };
        out.push(line);
    }
    while out.last().is_some_and(|line| line.is_empty()) {
        out.pop();
    }
    out
}
