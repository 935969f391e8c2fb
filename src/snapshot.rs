//! Pre-mutation snapshots.
//!
//! A snapshot is a Drive copy of the spreadsheet taken before a destructive
//! operation. Restore pulls each sheet's values back out of the copy and
//! rewrites the original, which is what transaction rollback rides on.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::Serialize;

use crate::a1::A1Range;
use crate::error::ApiError;
use crate::sheets::client::{CallContext, SheetsClient};
use std::sync::Arc;

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotInfo {
    pub id: String,
    pub name: String,
    pub created_at: String,
    pub source_spreadsheet_id: String,
}

impl SnapshotInfo {
    pub fn undo_instructions(&self) -> Vec<String> {
        vec![
            format!(
                "Call sheets_snapshot with action \"restore\" and snapshot_id \"{}\"",
                self.id
            ),
            format!("Or open the snapshot copy directly: Drive file {}", self.id),
        ]
    }

    pub fn to_meta(&self) -> serde_json::Value {
        serde_json::json!({
            "id": self.id,
            "created_at": self.created_at,
            "undo_instructions": self.undo_instructions(),
        })
    }
}

pub struct SnapshotService {
    client: Arc<SheetsClient>,
    records: Mutex<HashMap<String, SnapshotInfo>>,
}

impl SnapshotService {
    pub fn new(client: Arc<SheetsClient>) -> Self {
        Self {
            client,
            records: Mutex::new(HashMap::new()),
        }
    }

    pub async fn create(
        &self,
        spreadsheet_id: &str,
        ctx: &CallContext,
    ) -> Result<SnapshotInfo, ApiError> {
        let stamp = chrono::Utc::now().format("%Y%m%dT%H%M%SZ");
        let name = format!("snapshot-{spreadsheet_id}-{stamp}");
        let file = self.client.drive_copy(spreadsheet_id, &name, ctx).await?;
        let info = SnapshotInfo {
            id: file.id,
            name: file.name,
            created_at: file
                .created_time
                .unwrap_or_else(|| chrono::Utc::now().to_rfc3339()),
            source_spreadsheet_id: spreadsheet_id.to_string(),
        };
        self.records
            .lock()
            .expect("snapshot lock")
            .insert(info.id.clone(), info.clone());
        tracing::info!(spreadsheet_id, snapshot_id = %info.id, "snapshot created");
        Ok(info)
    }

    pub fn list_for(&self, spreadsheet_id: &str) -> Vec<SnapshotInfo> {
        let mut out: Vec<SnapshotInfo> = self
            .records
            .lock()
            .expect("snapshot lock")
            .values()
            .filter(|s| s.source_spreadsheet_id == spreadsheet_id)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        out
    }

    pub fn get(&self, snapshot_id: &str) -> Option<SnapshotInfo> {
        self.records
            .lock()
            .expect("snapshot lock")
            .get(snapshot_id)
            .cloned()
    }

    /// Rewrite the original spreadsheet from the snapshot copy, sheet by
    /// sheet: clear, then write the snapshot's values back.
    pub async fn restore(
        &self,
        spreadsheet_id: &str,
        snapshot_id: &str,
        ctx: &CallContext,
    ) -> Result<(), ApiError> {
        let meta = self.client.spreadsheet_get(snapshot_id, ctx).await?;
        for sheet in &meta.sheets {
            let title = &sheet.properties.title;
            let whole = A1Range::whole_sheet(title.clone()).to_a1();
            let saved = self
                .client
                .values_get(snapshot_id, &whole, "UNFORMATTED_VALUE", "ROWS", ctx)
                .await?;
            self.client.values_clear(spreadsheet_id, &whole, ctx).await?;
            if !saved.values.is_empty() {
                let anchor = format!("{whole}!A1");
                self.client
                    .values_update(spreadsheet_id, &anchor, saved.values, "RAW", ctx)
                    .await?;
            }
        }
        tracing::info!(spreadsheet_id, snapshot_id, "restored from snapshot");
        Ok(())
    }
}
