//! Application state: every process-global substrate component, wired once
//! at startup and cloned cheaply into handlers (everything is Arc-backed).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::auth::TokenSource;
use crate::cache::CacheManager;
use crate::config::Config;
use crate::distributed::{DistributedBackend, RedisBackend};
use crate::mcp::capabilities::CapabilityCache;
use crate::pipeline::batch::{BatchConfig, WriteBatcher};
use crate::pipeline::dedup::Deduplicator;
use crate::pipeline::merge::{MergeConfig, ReadMerger};
use crate::refresh::{AccessTracker, RefreshEngine};
use crate::resilience::{BreakerConfig, BreakerRegistry, FallbackRegistry, RetryPolicy, TokenBucket};
use crate::resolver::RangeResolver;
use crate::safety::SafetyGate;
use crate::session::SessionManager;
use crate::sheets::client::SheetsClient;
use crate::sheets::transport::{HttpTransport, SheetsTransport};
use crate::snapshot::SnapshotService;
use crate::system_monitor::SystemSnapshot;
use crate::tasks::{InMemoryTaskStore, RedisTaskStore, TaskStore};
use crate::transaction::TransactionManager;

/// Access-tracker capacity (LRU beyond this).
const ACCESS_TRACKER_CAP: usize = 1000;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub start_time: Instant,
    pub http_client: reqwest::Client,
    pub client: Arc<SheetsClient>,
    pub cache: Arc<CacheManager>,
    pub dedup: Arc<Deduplicator>,
    pub merger: Arc<ReadMerger>,
    pub batcher: Arc<WriteBatcher>,
    pub refresh: Arc<RefreshEngine>,
    pub tracker: Arc<AccessTracker>,
    pub gate: Arc<SafetyGate>,
    pub snapshots: Arc<SnapshotService>,
    pub transactions: Arc<TransactionManager>,
    pub tasks: Arc<dyn TaskStore>,
    pub sessions: Arc<SessionManager>,
    pub capabilities: Arc<CapabilityCache>,
    pub resolver: Arc<RangeResolver>,
    pub fallbacks: Arc<FallbackRegistry>,
    /// `true` once startup checks complete.
    pub ready: Arc<AtomicBool>,
    pub system_monitor: Arc<RwLock<SystemSnapshot>>,
    pub shutdown: CancellationToken,
}

impl AppState {
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        let http_client = reqwest::Client::builder()
            .pool_max_idle_per_host(10)
            .timeout(std::time::Duration::from_secs(120))
            .connect_timeout(std::time::Duration::from_secs(5))
            .build()
            .expect("Failed to build HTTP client");

        // Distributed backend is strictly optional: a bad Redis URL logs and
        // the gateway runs memory-only.
        let distributed: Option<Arc<dyn DistributedBackend>> = match &config.redis_url {
            Some(url) => match RedisBackend::connect(url, "sheetlink").await {
                Ok(backend) => Some(Arc::new(backend)),
                Err(e) => {
                    tracing::warn!("redis unavailable, running memory-only: {e}");
                    None
                }
            },
            None => None,
        };

        let tokens = Arc::new(TokenSource::from_env(http_client.clone()));
        let transport: Arc<dyn SheetsTransport> =
            Arc::new(HttpTransport::new(http_client.clone()));
        Ok(Self::wire(config, http_client, transport, tokens, distributed))
    }

    /// Assemble the component graph around a transport. Shared by production
    /// startup and the test constructor.
    fn wire(
        config: Config,
        http_client: reqwest::Client,
        transport: Arc<dyn SheetsTransport>,
        tokens: Arc<TokenSource>,
        distributed: Option<Arc<dyn DistributedBackend>>,
    ) -> Self {
        let config = Arc::new(config);

        let breakers = Arc::new(BreakerRegistry::new(BreakerConfig {
            failure_threshold: config.breaker_failure_threshold,
            success_threshold: config.breaker_success_threshold,
            reset_timeout: config.breaker_reset_timeout,
        }));
        let retry = RetryPolicy::new(
            config.retry_max_attempts,
            config.retry_base_delay,
            config.retry_max_delay,
        );
        let read_bucket = Arc::new(TokenBucket::new(
            "reads",
            config.read_bucket_capacity,
            config.read_bucket_refill_per_sec,
        ));
        let write_bucket = Arc::new(TokenBucket::new(
            "writes",
            config.write_bucket_capacity,
            config.write_bucket_refill_per_sec,
        ));
        let client = Arc::new(SheetsClient::new(
            transport,
            tokens,
            breakers,
            retry,
            read_bucket,
            write_bucket,
        ));

        let cache = Arc::new(CacheManager::new(
            config.cache_namespace_budget,
            distributed.clone(),
        ));
        let dedup = Arc::new(Deduplicator::new());
        let merger = Arc::new(ReadMerger::new(
            Arc::clone(&client),
            MergeConfig {
                enabled: config.merger_enabled,
                window: config.merge_window,
                max_window_size: config.max_merge_window_size,
                merge_adjacent: config.merge_adjacent,
            },
        ));
        let batcher = Arc::new(WriteBatcher::new(
            Arc::clone(&client),
            Arc::clone(&cache),
            BatchConfig {
                enabled: config.batching_enabled,
                window: config.batch_window,
                max_batch_size: config.max_batch_size,
                metadata_ttl: config.cache_ttl_spreadsheet,
            },
        ));

        let tracker = Arc::new(AccessTracker::new(ACCESS_TRACKER_CAP));
        let refresh = Arc::new(RefreshEngine::new(
            Arc::clone(&cache),
            Arc::clone(&client),
            Arc::clone(&tracker),
            Arc::clone(&config),
        ));

        let snapshots = Arc::new(SnapshotService::new(Arc::clone(&client)));
        let gate = Arc::new(SafetyGate::new(
            Arc::clone(&cache),
            Arc::clone(&snapshots),
            Arc::clone(&client),
            Arc::clone(&config),
        ));
        let transactions = Arc::new(TransactionManager::new(
            Arc::clone(&gate),
            Arc::clone(&snapshots),
            Arc::clone(&client),
            Arc::clone(&config),
        ));

        let tasks: Arc<dyn TaskStore> = match &distributed {
            Some(backend) => Arc::new(RedisTaskStore::new(Arc::clone(backend))),
            None => Arc::new(InMemoryTaskStore::new()),
        };
        let sessions = Arc::new(SessionManager::new(
            config.max_sessions_per_user,
            config.session_idle_timeout,
        ));
        let capabilities = Arc::new(CapabilityCache::new(
            config.cache_ttl_capability,
            distributed,
        ));
        let resolver = Arc::new(RangeResolver::new(
            Arc::clone(&cache),
            Arc::clone(&client),
            Arc::clone(&config),
        ));

        Self {
            config,
            start_time: Instant::now(),
            http_client,
            client,
            cache,
            dedup,
            merger,
            batcher,
            refresh,
            tracker,
            gate,
            snapshots,
            transactions,
            tasks,
            sessions,
            capabilities,
            resolver,
            fallbacks: Arc::new(FallbackRegistry::with_defaults()),
            ready: Arc::new(AtomicBool::new(false)),
            system_monitor: Arc::new(RwLock::new(SystemSnapshot::default())),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }

    pub fn mark_ready(&self) {
        self.ready.store(true, Ordering::Relaxed);
        tracing::info!("gateway marked READY");
    }

    /// Test constructor: fixed test config, scripted in-memory upstream, no
    /// Redis. Returns the mock so tests can seed grids and count calls.
    #[doc(hidden)]
    pub fn new_test() -> (Self, Arc<crate::sheets::mock::MockSheets>) {
        let mock = Arc::new(crate::sheets::mock::MockSheets::new());
        let http_client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(5))
            .build()
            .expect("Failed to build HTTP client");
        let tokens = Arc::new(TokenSource::fixed(http_client.clone(), "test-token"));
        let state = Self::wire(
            Config::for_tests(),
            http_client,
            Arc::clone(&mock) as Arc<dyn SheetsTransport>,
            tokens,
            None,
        );
        (state, mock)
    }
}
