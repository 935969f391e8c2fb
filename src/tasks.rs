//! Long-running task records.
//!
//! Every task belongs to a session and survives transport reconnects within
//! it. Progress is monotonic, `cancelled` is terminal, and the backend is
//! swappable: in-memory for single-process deployments, Redis when a
//! distributed backend is configured.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::distributed::DistributedBackend;
use crate::error::{ApiError, ErrorCode};

const REDIS_NS_TASKS: &str = "tasks";
const REDIS_NS_INDEX: &str = "task_index";
const REDIS_TASK_TTL: Duration = Duration::from_secs(24 * 3600);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Queued => "queued",
            TaskState::Running => "running",
            TaskState::Completed => "completed",
            TaskState::Failed => "failed",
            TaskState::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: String,
    pub session_id: String,
    pub tool: String,
    pub params_fingerprint: String,
    pub state: TaskState,
    /// Completion in `[0, 1]`.
    pub progress: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
    pub created_at: String,
    pub updated_at: String,
}

impl TaskRecord {
    pub fn new(session_id: &str, tool: &str, params_fingerprint: &str) -> Self {
        let now = chrono::Utc::now().to_rfc3339();
        Self {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            tool: tool.to_string(),
            params_fingerprint: params_fingerprint.to_string(),
            state: TaskState::Queued,
            progress: 0.0,
            result: None,
            error: None,
            created_at: now.clone(),
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TaskPatch {
    pub state: Option<TaskState>,
    pub progress: Option<f64>,
    pub result: Option<Value>,
    pub error: Option<Value>,
}

/// Merge a patch under the store's rules: terminal states stick, progress
/// only moves forward.
fn apply_patch(record: &mut TaskRecord, patch: TaskPatch) -> Result<(), ApiError> {
    if record.state.is_terminal() {
        return Err(ApiError::new(
            ErrorCode::InvalidRequest,
            format!("task {} is {} and cannot change", record.id, record.state.as_str()),
        ));
    }
    if let Some(state) = patch.state {
        record.state = state;
    }
    if let Some(progress) = patch.progress {
        record.progress = record.progress.max(progress.clamp(0.0, 1.0));
    }
    if patch.result.is_some() {
        record.result = patch.result;
    }
    if patch.error.is_some() {
        record.error = patch.error;
    }
    record.updated_at = chrono::Utc::now().to_rfc3339();
    Ok(())
}

#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn create(&self, task: TaskRecord) -> Result<TaskRecord, ApiError>;
    async fn update(&self, id: &str, patch: TaskPatch) -> Result<TaskRecord, ApiError>;
    async fn get(&self, id: &str) -> Result<TaskRecord, ApiError>;
    async fn cancel(&self, id: &str) -> Result<TaskRecord, ApiError>;
    async fn list(&self, session_id: &str) -> Result<Vec<TaskRecord>, ApiError>;
    /// Dispose every record belonging to a closed session.
    async fn remove_session(&self, session_id: &str);
}

fn task_not_found(id: &str) -> ApiError {
    ApiError::new(ErrorCode::NotFound, format!("no task with id {id}"))
}

// ── In-memory backend ────────────────────────────────────────────────────

#[derive(Default)]
pub struct InMemoryTaskStore {
    tasks: RwLock<HashMap<String, TaskRecord>>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn create(&self, task: TaskRecord) -> Result<TaskRecord, ApiError> {
        self.tasks
            .write()
            .await
            .insert(task.id.clone(), task.clone());
        Ok(task)
    }

    async fn update(&self, id: &str, patch: TaskPatch) -> Result<TaskRecord, ApiError> {
        let mut tasks = self.tasks.write().await;
        let record = tasks.get_mut(id).ok_or_else(|| task_not_found(id))?;
        apply_patch(record, patch)?;
        Ok(record.clone())
    }

    async fn get(&self, id: &str) -> Result<TaskRecord, ApiError> {
        self.tasks
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| task_not_found(id))
    }

    async fn cancel(&self, id: &str) -> Result<TaskRecord, ApiError> {
        let mut tasks = self.tasks.write().await;
        let record = tasks.get_mut(id).ok_or_else(|| task_not_found(id))?;
        if record.state == TaskState::Cancelled {
            return Ok(record.clone());
        }
        if record.state.is_terminal() {
            return Err(ApiError::new(
                ErrorCode::PreconditionFailed,
                format!("task {id} already {}", record.state.as_str()),
            ));
        }
        record.state = TaskState::Cancelled;
        record.updated_at = chrono::Utc::now().to_rfc3339();
        Ok(record.clone())
    }

    async fn list(&self, session_id: &str) -> Result<Vec<TaskRecord>, ApiError> {
        let tasks = self.tasks.read().await;
        let mut out: Vec<TaskRecord> = tasks
            .values()
            .filter(|t| t.session_id == session_id)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(out)
    }

    async fn remove_session(&self, session_id: &str) {
        self.tasks
            .write()
            .await
            .retain(|_, t| t.session_id != session_id);
    }
}

// ── Redis backend ────────────────────────────────────────────────────────

pub struct RedisTaskStore {
    backend: Arc<dyn DistributedBackend>,
}

impl RedisTaskStore {
    pub fn new(backend: Arc<dyn DistributedBackend>) -> Self {
        Self { backend }
    }

    async fn load(&self, id: &str) -> Result<TaskRecord, ApiError> {
        let raw = self
            .backend
            .get(REDIS_NS_TASKS, id)
            .await
            .ok_or_else(|| task_not_found(id))?;
        serde_json::from_str(&raw)
            .map_err(|e| ApiError::internal(format!("corrupt task record {id}: {e}")))
    }

    async fn store(&self, record: &TaskRecord) {
        if let Ok(raw) = serde_json::to_string(record) {
            self.backend
                .set(REDIS_NS_TASKS, &record.id, raw, REDIS_TASK_TTL)
                .await;
        }
    }

    async fn index(&self, session_id: &str) -> Vec<String> {
        self.backend
            .get(REDIS_NS_INDEX, session_id)
            .await
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default()
    }

    async fn store_index(&self, session_id: &str, ids: &[String]) {
        if let Ok(raw) = serde_json::to_string(ids) {
            self.backend
                .set(REDIS_NS_INDEX, session_id, raw, REDIS_TASK_TTL)
                .await;
        }
    }
}

#[async_trait]
impl TaskStore for RedisTaskStore {
    async fn create(&self, task: TaskRecord) -> Result<TaskRecord, ApiError> {
        self.store(&task).await;
        let mut ids = self.index(&task.session_id).await;
        ids.push(task.id.clone());
        self.store_index(&task.session_id, &ids).await;
        Ok(task)
    }

    async fn update(&self, id: &str, patch: TaskPatch) -> Result<TaskRecord, ApiError> {
        let mut record = self.load(id).await?;
        apply_patch(&mut record, patch)?;
        self.store(&record).await;
        Ok(record)
    }

    async fn get(&self, id: &str) -> Result<TaskRecord, ApiError> {
        self.load(id).await
    }

    async fn cancel(&self, id: &str) -> Result<TaskRecord, ApiError> {
        let mut record = self.load(id).await?;
        if record.state == TaskState::Cancelled {
            return Ok(record);
        }
        if record.state.is_terminal() {
            return Err(ApiError::new(
                ErrorCode::PreconditionFailed,
                format!("task {id} already {}", record.state.as_str()),
            ));
        }
        record.state = TaskState::Cancelled;
        record.updated_at = chrono::Utc::now().to_rfc3339();
        self.store(&record).await;
        Ok(record)
    }

    async fn list(&self, session_id: &str) -> Result<Vec<TaskRecord>, ApiError> {
        let mut out = Vec::new();
        for id in self.index(session_id).await {
            if let Ok(record) = self.load(&id).await {
                out.push(record);
            }
        }
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(out)
    }

    async fn remove_session(&self, session_id: &str) {
        for id in self.index(session_id).await {
            self.backend.delete(REDIS_NS_TASKS, &id).await;
        }
        self.backend.delete(REDIS_NS_INDEX, session_id).await;
    }
}
