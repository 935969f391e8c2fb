//! Environment-driven configuration.
//!
//! Every operational knob is read once at startup. Unset variables fall back
//! to production defaults; malformed values are a hard startup error so a
//! typo never silently changes pacing or safety behaviour.

use std::time::Duration;

use crate::error::{ApiError, ErrorCode};

#[derive(Debug, Clone)]
pub struct Config {
    // ── HTTP surface ──
    pub host: String,
    pub port: u16,
    pub allowed_origins: Vec<String>,
    /// Shared secret for the HTTP transports. None = open (dev mode).
    pub auth_secret: Option<String>,

    // ── Sessions ──
    pub max_sessions_per_user: usize,
    pub session_idle_timeout: Duration,

    // ── Edge rate limiting (per-IP, tower_governor) ──
    pub rate_limit_per_second: u64,
    pub rate_limit_burst: u32,

    // ── Cache TTLs per namespace ──
    pub cache_ttl_values: Duration,
    pub cache_ttl_spreadsheet: Duration,
    pub cache_ttl_resolver: Duration,
    pub cache_ttl_capability: Duration,
    /// Per-namespace size budget in bytes before LRU eviction runs.
    pub cache_namespace_budget: usize,

    // ── Batching ──
    pub batching_enabled: bool,
    pub batch_window: Duration,
    pub max_batch_size: usize,

    // ── Read merging ──
    pub merger_enabled: bool,
    pub merge_window: Duration,
    pub max_merge_window_size: usize,
    pub merge_adjacent: bool,

    // ── Prefetch + refresh ──
    pub prefetch_enabled: bool,
    pub refresh_enabled: bool,
    pub refresh_interval: Duration,
    pub refresh_expiry_threshold: Duration,
    pub refresh_concurrency: usize,

    // ── Circuit breaker + retry ──
    pub breaker_failure_threshold: u32,
    pub breaker_success_threshold: u32,
    pub breaker_reset_timeout: Duration,
    pub retry_max_attempts: u32,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,

    // ── Outbound pacing (token buckets) ──
    pub read_bucket_capacity: f64,
    pub read_bucket_refill_per_sec: f64,
    pub write_bucket_capacity: f64,
    pub write_bucket_refill_per_sec: f64,

    // ── Safety gate ──
    pub high_risk_cell_threshold: u64,
    pub max_full_diff_cells: usize,
    pub default_diff_sample_size: usize,

    // ── Transactions ──
    pub transaction_lifetime: Duration,

    // ── Requests ──
    pub request_timeout: Duration,

    // ── Distributed backend ──
    pub redis_url: Option<String>,

    // ── Deferred schema mode: tools/list returns names only until first call ──
    pub deferred_schemas: bool,
}

fn var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn parsed<T: std::str::FromStr>(name: &str, default: T) -> Result<T, ApiError> {
    match var(name) {
        None => Ok(default),
        Some(raw) => raw.parse().map_err(|_| {
            ApiError::new(
                ErrorCode::ConfigError,
                format!("{name} is set to {raw:?} which does not parse"),
            )
        }),
    }
}

fn parsed_secs(name: &str, default_secs: u64) -> Result<Duration, ApiError> {
    Ok(Duration::from_secs(parsed(name, default_secs)?))
}

fn parsed_millis(name: &str, default_ms: u64) -> Result<Duration, ApiError> {
    Ok(Duration::from_millis(parsed(name, default_ms)?))
}

impl Config {
    pub fn from_env() -> Result<Self, ApiError> {
        Ok(Self {
            host: var("HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
            port: parsed("PORT", 8090u16)?,
            allowed_origins: var("ALLOWED_ORIGINS")
                .map(|v| v.split(',').map(|s| s.trim().to_string()).collect())
                .unwrap_or_default(),
            auth_secret: var("AUTH_SECRET"),

            max_sessions_per_user: parsed("MAX_SESSIONS_PER_USER", 10usize)?,
            session_idle_timeout: parsed_secs("SESSION_IDLE_TIMEOUT_SECS", 1800)?,

            rate_limit_per_second: parsed("RATE_LIMIT_PER_SECOND", 2u64)?,
            rate_limit_burst: parsed("RATE_LIMIT_BURST", 60u32)?,

            cache_ttl_values: parsed_secs("CACHE_TTL_VALUES_SECS", 300)?,
            cache_ttl_spreadsheet: parsed_secs("CACHE_TTL_SPREADSHEET_SECS", 600)?,
            cache_ttl_resolver: parsed_secs("CACHE_TTL_RESOLVER_SECS", 600)?,
            cache_ttl_capability: parsed_secs("CACHE_TTL_CAPABILITY_SECS", 3600)?,
            cache_namespace_budget: parsed("CACHE_NAMESPACE_BUDGET_BYTES", 8 * 1024 * 1024)?,

            batching_enabled: parsed("BATCHING_ENABLED", true)?,
            batch_window: parsed_millis("BATCH_WINDOW_MS", 50)?,
            max_batch_size: parsed("MAX_BATCH_SIZE", 100usize)?,

            merger_enabled: parsed("MERGER_ENABLED", true)?,
            merge_window: parsed_millis("MERGE_WINDOW_MS", 50)?,
            max_merge_window_size: parsed("MAX_MERGE_WINDOW_SIZE", 100usize)?,
            merge_adjacent: parsed("MERGE_ADJACENT", true)?,

            prefetch_enabled: parsed("PREFETCH_ENABLED", true)?,
            refresh_enabled: parsed("REFRESH_ENABLED", true)?,
            refresh_interval: parsed_secs("REFRESH_INTERVAL_SECS", 30)?,
            refresh_expiry_threshold: parsed_secs("REFRESH_EXPIRY_THRESHOLD_SECS", 60)?,
            refresh_concurrency: parsed("REFRESH_CONCURRENCY", 2usize)?,

            breaker_failure_threshold: parsed("BREAKER_FAILURE_THRESHOLD", 5u32)?,
            breaker_success_threshold: parsed("BREAKER_SUCCESS_THRESHOLD", 2u32)?,
            breaker_reset_timeout: parsed_secs("BREAKER_RESET_TIMEOUT_SECS", 30)?,
            retry_max_attempts: parsed("RETRY_MAX_ATTEMPTS", 3u32)?,
            retry_base_delay: parsed_millis("RETRY_BASE_DELAY_MS", 200)?,
            retry_max_delay: parsed_millis("RETRY_MAX_DELAY_MS", 10_000)?,

            read_bucket_capacity: parsed("READ_BUCKET_CAPACITY", 50.0f64)?,
            read_bucket_refill_per_sec: parsed("READ_BUCKET_REFILL_PER_SEC", 10.0f64)?,
            write_bucket_capacity: parsed("WRITE_BUCKET_CAPACITY", 20.0f64)?,
            write_bucket_refill_per_sec: parsed("WRITE_BUCKET_REFILL_PER_SEC", 5.0f64)?,

            high_risk_cell_threshold: parsed("HIGH_RISK_CELL_THRESHOLD", 50_000u64)?,
            max_full_diff_cells: parsed("MAX_FULL_DIFF_CELLS", 5_000usize)?,
            default_diff_sample_size: parsed("DIFF_SAMPLE_SIZE", 20usize)?,

            transaction_lifetime: parsed_secs("TRANSACTION_LIFETIME_SECS", 300)?,

            request_timeout: parsed_secs("REQUEST_TIMEOUT_SECS", 60)?,

            redis_url: var("REDIS_URL"),

            deferred_schemas: parsed("DEFERRED_SCHEMAS", false)?,
        })
    }

    /// Fixed defaults for tests — ignores the process environment entirely
    /// so a developer's shell can never change test behaviour.
    pub fn for_tests() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 0,
            allowed_origins: Vec::new(),
            auth_secret: None,
            max_sessions_per_user: 10,
            session_idle_timeout: Duration::from_secs(1800),
            rate_limit_per_second: 1000,
            rate_limit_burst: 1000,
            cache_ttl_values: Duration::from_secs(300),
            cache_ttl_spreadsheet: Duration::from_secs(600),
            cache_ttl_resolver: Duration::from_secs(600),
            cache_ttl_capability: Duration::from_secs(3600),
            cache_namespace_budget: 8 * 1024 * 1024,
            batching_enabled: true,
            batch_window: Duration::from_millis(50),
            max_batch_size: 100,
            merger_enabled: true,
            merge_window: Duration::from_millis(50),
            max_merge_window_size: 100,
            merge_adjacent: true,
            prefetch_enabled: false,
            refresh_enabled: false,
            refresh_interval: Duration::from_secs(30),
            refresh_expiry_threshold: Duration::from_secs(60),
            refresh_concurrency: 2,
            breaker_failure_threshold: 5,
            breaker_success_threshold: 2,
            breaker_reset_timeout: Duration::from_secs(30),
            retry_max_attempts: 3,
            retry_base_delay: Duration::from_millis(1),
            retry_max_delay: Duration::from_millis(20),
            read_bucket_capacity: 1000.0,
            read_bucket_refill_per_sec: 1000.0,
            write_bucket_capacity: 1000.0,
            write_bucket_refill_per_sec: 1000.0,
            high_risk_cell_threshold: 50_000,
            max_full_diff_cells: 5_000,
            default_diff_sample_size: 20,
            transaction_lifetime: Duration::from_secs(300),
            request_timeout: Duration::from_secs(10),
            redis_url: None,
            deferred_schemas: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_spec() {
        let cfg = Config::for_tests();
        assert_eq!(cfg.breaker_failure_threshold, 5);
        assert_eq!(cfg.breaker_success_threshold, 2);
        assert_eq!(cfg.max_batch_size, 100);
        assert_eq!(cfg.merge_window, Duration::from_millis(50));
        assert_eq!(cfg.refresh_concurrency, 2);
    }
}
