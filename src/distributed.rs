//! Optional distributed backend (Redis).
//!
//! Mirrors cache writes, backs the second capability-cache tier, and can
//! persist task records across processes. Every operation is best-effort:
//! failures are logged and swallowed — the gateway never degrades because
//! Redis is away.

use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;

#[async_trait]
pub trait DistributedBackend: Send + Sync {
    async fn get(&self, namespace: &str, key: &str) -> Option<String>;
    async fn set(&self, namespace: &str, key: &str, value: String, ttl: Duration);
    async fn delete(&self, namespace: &str, key: &str);
    async fn ping(&self) -> bool;
}

pub struct RedisBackend {
    conn: redis::aio::ConnectionManager,
    prefix: String,
}

impl RedisBackend {
    pub async fn connect(url: &str, prefix: &str) -> anyhow::Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = client.get_connection_manager().await?;
        tracing::info!("redis backend connected");
        Ok(Self {
            conn,
            prefix: prefix.to_string(),
        })
    }

    fn key(&self, namespace: &str, key: &str) -> String {
        format!("{}:{namespace}:{key}", self.prefix)
    }
}

#[async_trait]
impl DistributedBackend for RedisBackend {
    async fn get(&self, namespace: &str, key: &str) -> Option<String> {
        let mut conn = self.conn.clone();
        match conn.get::<_, Option<String>>(self.key(namespace, key)).await {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!("redis get failed ({namespace}/{key}): {e}");
                None
            }
        }
    }

    async fn set(&self, namespace: &str, key: &str, value: String, ttl: Duration) {
        let mut conn = self.conn.clone();
        let ttl_secs = ttl.as_secs().max(1);
        if let Err(e) = conn
            .set_ex::<_, _, ()>(self.key(namespace, key), value, ttl_secs)
            .await
        {
            tracing::warn!("redis set failed ({namespace}/{key}): {e}");
        }
    }

    async fn delete(&self, namespace: &str, key: &str) {
        let mut conn = self.conn.clone();
        if let Err(e) = conn.del::<_, ()>(self.key(namespace, key)).await {
            tracing::warn!("redis delete failed ({namespace}/{key}): {e}");
        }
    }

    async fn ping(&self) -> bool {
        let mut conn = self.conn.clone();
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .is_ok()
    }
}
