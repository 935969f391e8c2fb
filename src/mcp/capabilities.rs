//! Per-session peer capability cache.
//!
//! Capabilities arrive once in the `initialize` handshake. Handlers that
//! need elicitation or sampling consult this cache instead of probing the
//! peer; a miss after the TTL falls through to the optional distributed
//! tier before giving up.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;

use crate::distributed::DistributedBackend;
use crate::error::{ApiError, ErrorCode};

const REDIS_NS: &str = "capabilities";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PeerCapabilities {
    pub elicitation: bool,
    pub sampling: bool,
    pub raw: Value,
}

impl PeerCapabilities {
    pub fn from_initialize_params(params: &Value) -> Self {
        let caps = params.get("capabilities").cloned().unwrap_or(Value::Null);
        Self {
            elicitation: caps.get("elicitation").is_some(),
            sampling: caps.get("sampling").is_some(),
            raw: caps,
        }
    }
}

pub struct CapabilityCache {
    local: RwLock<HashMap<String, (PeerCapabilities, Instant)>>,
    ttl: Duration,
    distributed: Option<Arc<dyn DistributedBackend>>,
}

impl CapabilityCache {
    pub fn new(ttl: Duration, distributed: Option<Arc<dyn DistributedBackend>>) -> Self {
        Self {
            local: RwLock::new(HashMap::new()),
            ttl,
            distributed,
        }
    }

    pub async fn store(&self, session_id: &str, caps: PeerCapabilities) {
        self.local
            .write()
            .await
            .insert(session_id.to_string(), (caps.clone(), Instant::now()));
        if let Some(backend) = &self.distributed {
            if let Ok(raw) = serde_json::to_string(&caps) {
                backend.set(REDIS_NS, session_id, raw, self.ttl).await;
            }
        }
    }

    pub async fn get(&self, session_id: &str) -> Option<PeerCapabilities> {
        {
            let local = self.local.read().await;
            if let Some((caps, stored_at)) = local.get(session_id) {
                if stored_at.elapsed() < self.ttl {
                    return Some(caps.clone());
                }
            }
        }
        // Tier 2.
        if let Some(backend) = &self.distributed {
            if let Some(raw) = backend.get(REDIS_NS, session_id).await {
                if let Ok(caps) = serde_json::from_str::<PeerCapabilities>(&raw) {
                    self.local
                        .write()
                        .await
                        .insert(session_id.to_string(), (caps.clone(), Instant::now()));
                    return Some(caps);
                }
            }
        }
        None
    }

    pub async fn remove(&self, session_id: &str) {
        self.local.write().await.remove(session_id);
        if let Some(backend) = &self.distributed {
            backend.delete(REDIS_NS, session_id).await;
        }
    }

    pub async fn require_elicitation(&self, session_id: &str) -> Result<(), ApiError> {
        match self.get(session_id).await {
            Some(caps) if caps.elicitation => Ok(()),
            _ => Err(ApiError::new(
                ErrorCode::ElicitationUnavailable,
                "the connected client did not negotiate elicitation",
            )
            .with_resolution("Retry without require_confirmation, or use a client that supports elicitation")),
        }
    }

    pub async fn require_sampling(&self, session_id: &str) -> Result<(), ApiError> {
        match self.get(session_id).await {
            Some(caps) if caps.sampling => Ok(()),
            _ => Err(ApiError::new(
                ErrorCode::SamplingUnavailable,
                "the connected client did not negotiate sampling",
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn caches_and_expires() {
        let cache = CapabilityCache::new(Duration::from_millis(20), None);
        let caps = PeerCapabilities::from_initialize_params(&json!({
            "capabilities": { "elicitation": {}, "roots": {} }
        }));
        assert!(caps.elicitation);
        assert!(!caps.sampling);

        cache.store("s1", caps).await;
        assert!(cache.get("s1").await.is_some());
        assert!(cache.require_elicitation("s1").await.is_ok());
        assert_eq!(
            cache.require_sampling("s1").await.unwrap_err().code,
            ErrorCode::SamplingUnavailable
        );

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(cache.get("s1").await.is_none());
        assert_eq!(
            cache.require_elicitation("s1").await.unwrap_err().code,
            ErrorCode::ElicitationUnavailable
        );
    }
}
