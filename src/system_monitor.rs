//! Cached system statistics, refreshed every 5s by a background task.
//! Feeds the memory block of `GET /stats` and the Prometheus exposition.

use std::sync::Arc;
use std::time::Duration;

use sysinfo::System;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

const REFRESH_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct SystemSnapshot {
    pub cpu_usage_percent: f32,
    pub memory_used_mb: f64,
    pub memory_total_mb: f64,
    pub platform: String,
}

impl Default for SystemSnapshot {
    fn default() -> Self {
        Self {
            cpu_usage_percent: 0.0,
            memory_used_mb: 0.0,
            memory_total_mb: 0.0,
            platform: std::env::consts::OS.to_string(),
        }
    }
}

pub fn spawn(
    slot: Arc<RwLock<SystemSnapshot>>,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut sys = System::new_all();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(REFRESH_INTERVAL) => {}
            }
            sys.refresh_cpu_usage();
            sys.refresh_memory();
            let snapshot = SystemSnapshot {
                cpu_usage_percent: sys.global_cpu_usage(),
                memory_used_mb: sys.used_memory() as f64 / (1024.0 * 1024.0),
                memory_total_mb: sys.total_memory() as f64 / (1024.0 * 1024.0),
                platform: std::env::consts::OS.to_string(),
            };
            *slot.write().await = snapshot;
        }
    })
}
