use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct EngineConfig {
    /// Process-wide salt for collection naming. Must match across every
    /// node that shares the backing stores.
    pub salt: String,
    pub global_collection: String,
    pub environment: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            salt: "cairn-dev-salt".to_string(),
            global_collection: "global_knowledge".to_string(),
            environment: "development".to_string(),
        }
    }
}

impl EngineConfig {
    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ChunkingConfig {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    /// Documents above this many bytes go through the streaming splitter.
    pub streaming_threshold_bytes: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1000,
            chunk_overlap: 100,
            streaming_threshold_bytes: 1_048_576,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy)]
#[serde(default)]
pub struct HybridWeights {
    pub semantic: f32,
    pub keyword: f32,
}

impl Default for HybridWeights {
    fn default() -> Self {
        Self {
            semantic: 0.7,
            keyword: 0.3,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RetrievalConfig {
    pub top_k: usize,
    pub final_k: usize,
    pub min_relevance: f32,
    pub hybrid_weights: HybridWeights,
    pub title_boost: f32,
    pub recency_boost: f32,
    pub recency_decay_per_day: f32,
    pub scope_boost: f32,
    pub response_cache_ttl_secs: u64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: 20,
            final_k: 10,
            min_relevance: 0.1,
            hybrid_weights: HybridWeights::default(),
            title_boost: 0.05,
            recency_boost: 0.1,
            recency_decay_per_day: 0.005,
            scope_boost: 0.05,
            response_cache_ttl_secs: 300,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ProviderConfig {
    pub provider: String,
    pub fallback_chain: Vec<String>,
    pub model: String,
    pub dimensions: usize,
    pub batch_size: usize,
    pub batch_window_ms: u64,
    /// Deterministic local embeddings as the last fallback; never allowed
    /// in production environments.
    pub allow_local_fallback: bool,
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_factor: f64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            provider: "local".to_string(),
            fallback_chain: Vec::new(),
            model: "embedding-default-v1".to_string(),
            dimensions: 384,
            batch_size: 16,
            batch_window_ms: 25,
            allow_local_fallback: true,
            max_retries: 3,
            initial_delay_ms: 100,
            max_delay_ms: 5_000,
            backoff_factor: 2.0,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub volume_threshold: usize,
    /// Rolling-window error percentage in [0, 100].
    pub error_pct_threshold: f32,
    pub reset_timeout_ms: u64,
    pub window_size: usize,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            volume_threshold: 10,
            error_pct_threshold: 50.0,
            reset_timeout_ms: 30_000,
            window_size: 20,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct QueueConfig {
    pub concurrency: usize,
    pub max_size: usize,
    pub timeout_ms: u64,
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub backoff_factor: f64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            max_size: 1_000,
            timeout_ms: 30_000,
            max_retries: 2,
            initial_delay_ms: 50,
            backoff_factor: 2.0,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct CacheConfig {
    pub default_ttl_secs: u64,
    pub encryption_enabled: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl_secs: 3_600,
            encryption_enabled: false,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct MemoryConfig {
    pub max_heap_bytes: u64,
    /// Thresholds are fractions of max_heap_bytes.
    pub gc_threshold: f64,
    pub alert_threshold: f64,
    pub critical_threshold: f64,
    /// Caches with priority <= this evict at the alert level.
    pub alert_evict_priority: u8,
    pub check_interval_ms: u64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            max_heap_bytes: 1_073_741_824,
            gc_threshold: 0.70,
            alert_threshold: 0.80,
            critical_threshold: 0.92,
            alert_evict_priority: 3,
            check_interval_ms: 5_000,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LimitsConfig {
    pub max_content_bytes: usize,
    pub max_title_chars: usize,
    pub max_tags: usize,
    pub max_query_chars: usize,
    pub max_top_k: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_content_bytes: 10_000_000,
            max_title_chars: 200,
            max_tags: 10,
            max_query_chars: 10_000,
            max_top_k: 50,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct VaultConfig {
    pub max_key_age_days: i64,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            max_key_age_days: 90,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct IngestConfig {
    /// Documents stuck in processing beyond this horizon are failed and
    /// their partial vector writes purged.
    pub reaper_horizon_secs: u64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            reaper_horizon_secs: 1_800,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct AnalyticsConfig {
    pub retention_secs: u64,
}

impl Default for AnalyticsConfig {
    fn default() -> Self {
        Self {
            retention_secs: 604_800,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AppConfig {
    pub engine: EngineConfig,
    pub chunking: ChunkingConfig,
    pub retrieval: RetrievalConfig,
    pub provider: ProviderConfig,
    pub breaker: BreakerConfig,
    pub queue: QueueConfig,
    pub cache: CacheConfig,
    pub memory: MemoryConfig,
    pub limits: LimitsConfig,
    pub vault: VaultConfig,
    pub ingest: IngestConfig,
    pub analytics: AnalyticsConfig,
}

impl AppConfig {
    pub fn load() -> Result<Self, ConfigError> {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let builder = Config::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            .add_source(Environment::with_prefix("CAIRN").separator("__"));

        builder.build()?.try_deserialize()
    }
}
