//! Session registry shared by every transport.
//!
//! A session owns an outbound event stream (broadcast for live listeners
//! plus a bounded replay ring for SSE resume), a user id for the per-user
//! cap, and an activity clock for the idle sweep. The stdio transport holds
//! exactly one session for the process lifetime; SSE and streamable HTTP
//! create and destroy them per peer.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tokio::sync::{broadcast, RwLock};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{ApiError, ErrorCode};

/// Replay ring per session; on resume, events newer than `Last-Event-ID`
/// are replayed. Overflow drops whole oldest events so ordering is never
/// corrupted, only truncated.
const EVENT_RING_CAPACITY: usize = 256;
const BROADCAST_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Stdio,
    Sse,
    StreamableHttp,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Stdio => "stdio",
            TransportKind::Sse => "sse",
            TransportKind::StreamableHttp => "streamable_http",
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionEvent {
    pub id: u64,
    pub payload: Value,
}

#[derive(Debug)]
pub struct Session {
    pub id: String,
    pub user_id: String,
    pub transport: TransportKind,
    pub created_at: Instant,
    pub created_at_utc: chrono::DateTime<chrono::Utc>,
    last_activity: Mutex<Instant>,
    event_seq: AtomicU64,
    tx: broadcast::Sender<SessionEvent>,
    ring: Mutex<VecDeque<SessionEvent>>,
    pub open_tasks: AtomicUsize,
}

impl Session {
    fn new(user_id: &str, transport: TransportKind) -> Self {
        let (tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            transport,
            created_at: Instant::now(),
            created_at_utc: chrono::Utc::now(),
            last_activity: Mutex::new(Instant::now()),
            event_seq: AtomicU64::new(0),
            tx,
            ring: Mutex::new(VecDeque::with_capacity(EVENT_RING_CAPACITY)),
            open_tasks: AtomicUsize::new(0),
        }
    }

    /// Queue an outbound event; returns its stream id.
    pub fn send(&self, payload: Value) -> u64 {
        let id = self.event_seq.fetch_add(1, Ordering::Relaxed) + 1;
        let event = SessionEvent { id, payload };
        {
            let mut ring = self.ring.lock().expect("ring lock");
            if ring.len() == EVENT_RING_CAPACITY {
                ring.pop_front();
            }
            ring.push_back(event.clone());
        }
        let _ = self.tx.send(event);
        id
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.tx.subscribe()
    }

    /// Buffered events newer than `last_event_id`, oldest first.
    pub fn replay_after(&self, last_event_id: u64) -> Vec<SessionEvent> {
        let ring = self.ring.lock().expect("ring lock");
        ring.iter()
            .filter(|e| e.id > last_event_id)
            .cloned()
            .collect()
    }

    pub fn touch(&self) {
        *self.last_activity.lock().expect("activity lock") = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().expect("activity lock").elapsed()
    }

    pub fn status_json(&self) -> Value {
        json!({
            "session_id": self.id,
            "transport": self.transport.as_str(),
            "created_at": self.created_at_utc.to_rfc3339(),
            "idle_secs": self.idle_for().as_secs(),
            "open_tasks": self.open_tasks.load(Ordering::Relaxed),
        })
    }
}

pub struct SessionManager {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    max_per_user: usize,
    idle_timeout: Duration,
    created_total: AtomicU64,
    rejected_total: AtomicU64,
}

impl SessionManager {
    pub fn new(max_per_user: usize, idle_timeout: Duration) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            max_per_user,
            idle_timeout,
            created_total: AtomicU64::new(0),
            rejected_total: AtomicU64::new(0),
        }
    }

    /// Create a session, enforcing the per-user cap.
    pub async fn create(
        &self,
        user_id: &str,
        transport: TransportKind,
    ) -> Result<Arc<Session>, ApiError> {
        let mut sessions = self.sessions.write().await;
        let open_for_user = sessions
            .values()
            .filter(|s| s.user_id == user_id)
            .count();
        if open_for_user >= self.max_per_user {
            self.rejected_total.fetch_add(1, Ordering::Relaxed);
            return Err(ApiError::new(
                ErrorCode::TooManySessions,
                format!(
                    "user already has {open_for_user} open sessions (cap {})",
                    self.max_per_user
                ),
            )
            .with_resolution("Close an existing session (DELETE /session/:id) or wait for the idle sweep"));
        }
        let session = Arc::new(Session::new(user_id, transport));
        sessions.insert(session.id.clone(), Arc::clone(&session));
        self.created_total.fetch_add(1, Ordering::Relaxed);
        tracing::info!(
            session_id = %session.id,
            transport = transport.as_str(),
            "session created"
        );
        Ok(session)
    }

    pub async fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.read().await.get(id).cloned()
    }

    pub async fn remove(&self, id: &str) -> Option<Arc<Session>> {
        let removed = self.sessions.write().await.remove(id);
        if removed.is_some() {
            tracing::info!(session_id = id, "session closed");
        }
        removed
    }

    pub async fn count(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn list(&self) -> Vec<Value> {
        let sessions = self.sessions.read().await;
        let mut out: Vec<Value> = sessions.values().map(|s| s.status_json()).collect();
        out.sort_by_key(|s| s["created_at"].as_str().map(str::to_string));
        out
    }

    /// Remove idle sessions; returns their ids so callers can dispose the
    /// per-session stores.
    pub async fn sweep_idle(&self) -> Vec<String> {
        let mut sessions = self.sessions.write().await;
        let doomed: Vec<String> = sessions
            .values()
            .filter(|s| s.transport != TransportKind::Stdio && s.idle_for() > self.idle_timeout)
            .map(|s| s.id.clone())
            .collect();
        for id in &doomed {
            sessions.remove(id);
            tracing::info!(session_id = %id, "idle session swept");
        }
        doomed
    }

    /// Close everything (server shutdown). Returns all former session ids.
    pub async fn shutdown_all(&self) -> Vec<String> {
        let mut sessions = self.sessions.write().await;
        let ids: Vec<String> = sessions.keys().cloned().collect();
        sessions.clear();
        tracing::info!(count = ids.len(), "all sessions closed for shutdown");
        ids
    }

    pub fn spawn_sweeper(
        self: Arc<Self>,
        shutdown: CancellationToken,
        on_swept: impl Fn(Vec<String>) + Send + Sync + 'static,
    ) -> tokio::task::JoinHandle<()> {
        let manager = self;
        tokio::spawn(async move {
            let interval = Duration::from_secs(60);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = tokio::time::sleep(interval) => {
                        let swept = manager.sweep_idle().await;
                        if !swept.is_empty() {
                            on_swept(swept);
                        }
                    }
                }
            }
        })
    }

    pub async fn stats(&self) -> Value {
        json!({
            "open": self.count().await,
            "created_total": self.created_total.load(Ordering::Relaxed),
            "rejected_total": self.rejected_total.load(Ordering::Relaxed),
            "max_per_user": self.max_per_user,
            "idle_timeout_secs": self.idle_timeout.as_secs(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn per_user_cap_yields_too_many_sessions() {
        let manager = SessionManager::new(2, Duration::from_secs(600));
        manager.create("user-a", TransportKind::Sse).await.unwrap();
        manager.create("user-a", TransportKind::Sse).await.unwrap();

        let err = manager
            .create("user-a", TransportKind::Sse)
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::TooManySessions);
        assert!(err.code.retryable());

        // A different user is unaffected.
        manager.create("user-b", TransportKind::Sse).await.unwrap();
    }

    #[tokio::test]
    async fn closing_a_session_frees_the_cap() {
        let manager = SessionManager::new(1, Duration::from_secs(600));
        let s = manager.create("user-a", TransportKind::Sse).await.unwrap();
        assert!(manager.create("user-a", TransportKind::Sse).await.is_err());
        manager.remove(&s.id).await;
        assert!(manager.create("user-a", TransportKind::Sse).await.is_ok());
    }

    #[tokio::test]
    async fn replay_returns_only_events_after_the_cursor() {
        let manager = SessionManager::new(4, Duration::from_secs(600));
        let s = manager.create("u", TransportKind::Sse).await.unwrap();
        let first = s.send(json!({ "n": 1 }));
        let second = s.send(json!({ "n": 2 }));
        let third = s.send(json!({ "n": 3 }));
        assert!(first < second && second < third);

        let replayed = s.replay_after(first);
        assert_eq!(replayed.len(), 2);
        assert_eq!(replayed[0].payload["n"], 2);
        assert_eq!(replayed[1].payload["n"], 3);
    }

    #[tokio::test]
    async fn ring_overflow_drops_oldest_events_in_order() {
        let manager = SessionManager::new(4, Duration::from_secs(600));
        let s = manager.create("u", TransportKind::Sse).await.unwrap();
        for n in 0..(EVENT_RING_CAPACITY + 10) {
            s.send(json!({ "n": n }));
        }
        let replayed = s.replay_after(0);
        assert_eq!(replayed.len(), EVENT_RING_CAPACITY);
        // Ids strictly increase; the gap is at the front only.
        for pair in replayed.windows(2) {
            assert_eq!(pair[1].id, pair[0].id + 1);
        }
    }

    #[tokio::test]
    async fn idle_sweep_spares_stdio() {
        let manager = SessionManager::new(4, Duration::from_millis(0));
        let sse = manager.create("u", TransportKind::Sse).await.unwrap();
        let stdio = manager.create("u", TransportKind::Stdio).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        let swept = manager.sweep_idle().await;
        assert_eq!(swept, vec![sse.id.clone()]);
        assert!(manager.get(&stdio.id).await.is_some());
    }
}
