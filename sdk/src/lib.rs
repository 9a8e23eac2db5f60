//! Facade wiring the engine together: configuration in, ingest and
//! query out. The reference wiring uses the in-memory backing stores;
//! production deployments swap the store adapters through the builder.

use async_trait::async_trait;
use cairn_core::analytics::{InMemoryRecordSink, RecordSink};
use cairn_core::auth::Principal;
use cairn_core::config::AppConfig;
use chrono::Duration as ChronoDuration;
use ingestion::chunker::RecursiveChunker;
use ingestion::pipeline::{
    AddDocumentRequest, DocHandle, IngestError, IngestionPipeline, Reaper,
};
use ingestion::sanitizer::Sanitizer;
use ingestion::validator::{VectorPolicy, VectorValidator};
use jobs::memory::{HeapProbe, MemoryMonitor, PressureCache, StaticProbe};
use jobs::queue::WorkQueue;
use jobs::worker::WorkerPool;
use providers::batcher::BatcherConfig;
use providers::breaker::{BreakerSettings, CircuitState};
use providers::provider::{EmbeddingProvider, HostedKind, HostedProvider, LocalProvider};
use providers::retry::RetryPolicy;
use providers::EmbeddingService;
use query::dsl::{QueryRequest, QueryResponse};
use query::engine::{QueryError, RetrievalEngine};
use std::sync::Arc;
use std::time::Duration;
use storage::cache::{CacheStats, InMemoryKv, KvStore, SecureCache};
use storage::crypto::MasterCipher;
use storage::docstore::{DocumentStore, InMemoryDocumentStore};
use storage::registry::CollectionRegistry;
use storage::vault::ProviderKeyVault;
use storage::vector::{InMemoryVectorIndex, VectorIndex};
use tracing::info;

/// SecureCache view registered with the memory monitor.
struct CacheUnderPressure {
    name: String,
    priority: u8,
    cache: Arc<SecureCache>,
}

#[async_trait]
impl PressureCache for CacheUnderPressure {
    fn name(&self) -> &str {
        &self.name
    }

    fn priority(&self) -> u8 {
        self.priority
    }

    async fn evict(&self) -> usize {
        self.cache.clear().await
    }
}

pub struct KnowledgeEngineBuilder {
    config: AppConfig,
    vectors: Option<Arc<dyn VectorIndex>>,
    documents: Option<Arc<dyn DocumentStore>>,
    kv: Option<Arc<dyn KvStore>>,
    providers: Option<Vec<Arc<dyn EmbeddingProvider>>>,
    analytics: Option<Arc<dyn RecordSink>>,
    master_secret: Option<String>,
    heap_probe: Option<Arc<dyn HeapProbe>>,
}

impl KnowledgeEngineBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            vectors: None,
            documents: None,
            kv: None,
            providers: None,
            analytics: None,
            master_secret: None,
            heap_probe: None,
        }
    }

    pub fn with_vector_index(mut self, vectors: Arc<dyn VectorIndex>) -> Self {
        self.vectors = Some(vectors);
        self
    }

    pub fn with_document_store(mut self, documents: Arc<dyn DocumentStore>) -> Self {
        self.documents = Some(documents);
        self
    }

    pub fn with_kv_store(mut self, kv: Arc<dyn KvStore>) -> Self {
        self.kv = Some(kv);
        self
    }

    pub fn with_providers(mut self, providers: Vec<Arc<dyn EmbeddingProvider>>) -> Self {
        self.providers = Some(providers);
        self
    }

    pub fn with_analytics(mut self, sink: Arc<dyn RecordSink>) -> Self {
        self.analytics = Some(sink);
        self
    }

    pub fn with_master_secret(mut self, secret: impl Into<String>) -> Self {
        self.master_secret = Some(secret.into());
        self
    }

    pub fn with_heap_probe(mut self, probe: Arc<dyn HeapProbe>) -> Self {
        self.heap_probe = Some(probe);
        self
    }

    pub fn build(self) -> KnowledgeEngine {
        let config = self.config;

        let vectors = self
            .vectors
            .unwrap_or_else(|| Arc::new(InMemoryVectorIndex::new()));
        let documents = self
            .documents
            .unwrap_or_else(|| Arc::new(InMemoryDocumentStore::new()));
        let kv = self.kv.unwrap_or_else(|| Arc::new(InMemoryKv::new()));

        let cipher = Arc::new(match &self.master_secret {
            Some(secret) => MasterCipher::new(secret.clone()),
            None => MasterCipher::unconfigured(),
        });

        let default_ttl = Duration::from_secs(config.cache.default_ttl_secs);
        let make_cache = |prefix: &str| {
            let cache = SecureCache::new(kv.clone(), prefix, default_ttl);
            if config.cache.encryption_enabled && self.master_secret.is_some() {
                Arc::new(cache.with_cipher(cipher.clone()))
            } else {
                Arc::new(cache)
            }
        };
        let embedding_cache = make_cache("embeddings");
        let response_cache = make_cache("responses");
        let vault_cache = make_cache("vault");

        let vault = Arc::new(ProviderKeyVault::new(
            documents.clone(),
            vault_cache,
            cipher.clone(),
            ChronoDuration::days(config.vault.max_key_age_days),
        ));

        let providers = self.providers.unwrap_or_else(|| {
            let mut chain: Vec<Arc<dyn EmbeddingProvider>> = Vec::new();
            for id in std::iter::once(config.provider.provider.as_str())
                .chain(config.provider.fallback_chain.iter().map(String::as_str))
            {
                match HostedKind::parse(id) {
                    Some(kind) => chain.push(Arc::new(HostedProvider::new(
                        kind,
                        config.provider.model.clone(),
                        config.provider.dimensions,
                        vault.clone(),
                    ))),
                    None => chain.push(Arc::new(LocalProvider::new(
                        config.provider.model.clone(),
                        config.provider.dimensions,
                    ))),
                }
            }
            chain
        });

        let allow_local = config.provider.allow_local_fallback && !config.engine.is_production();
        let embeddings = Arc::new(
            EmbeddingService::new(
                providers,
                BreakerSettings::from(&config.breaker),
                RetryPolicy::from(&config.provider),
                BatcherConfig {
                    batch_size: config.provider.batch_size,
                    window: Duration::from_millis(config.provider.batch_window_ms),
                },
                config.provider.model.clone(),
                allow_local,
                Some(embedding_cache.clone()),
            )
            .with_cache_ttl(default_ttl),
        );

        let registry = Arc::new(CollectionRegistry::new(
            config.engine.salt.clone(),
            config.engine.global_collection.clone(),
            vectors.clone(),
            documents.clone(),
            default_ttl,
        ));

        let pool = Arc::new(WorkerPool::start(WorkQueue::new(config.queue.clone())));
        let backpressure = pool.queue().backpressure_flag();

        let probe = self
            .heap_probe
            .unwrap_or_else(|| Arc::new(StaticProbe::new(0)));
        let monitor = Arc::new(MemoryMonitor::new(
            probe,
            config.memory.clone(),
            backpressure,
        ));
        monitor.register_cache(Arc::new(CacheUnderPressure {
            name: "embeddings".to_string(),
            priority: 2,
            cache: embedding_cache.clone(),
        }));
        monitor.register_cache(Arc::new(CacheUnderPressure {
            name: "responses".to_string(),
            priority: 1,
            cache: response_cache.clone(),
        }));

        let pipeline = IngestionPipeline::new(
            Sanitizer::new(config.limits.max_content_bytes),
            RecursiveChunker::new(config.chunking.chunk_size, config.chunking.chunk_overlap),
            VectorValidator::new(VectorPolicy::default()),
            embeddings.clone(),
            pool.clone(),
            registry.clone(),
            vectors.clone(),
            documents.clone(),
            config.limits.clone(),
            config.chunking.streaming_threshold_bytes,
        );

        let analytics = self
            .analytics
            .unwrap_or_else(|| Arc::new(InMemoryRecordSink::default()));
        let retrieval_engine = RetrievalEngine::new(
            registry.clone(),
            vectors.clone(),
            documents.clone(),
            embeddings.clone(),
            Sanitizer::new(config.limits.max_query_chars),
            response_cache.clone(),
            config.retrieval.clone(),
            config.limits.clone(),
        )
        .with_analytics(analytics.clone());

        let reaper = Arc::new(Reaper::new(
            documents.clone(),
            vectors.clone(),
            registry.clone(),
            ChronoDuration::seconds(config.ingest.reaper_horizon_secs as i64),
        ));

        info!(provider = config.provider.provider.as_str(), "knowledge engine assembled");
        KnowledgeEngine {
            config,
            pipeline,
            retrieval: retrieval_engine,
            embeddings,
            embedding_cache,
            response_cache,
            registry,
            vault,
            pool,
            monitor,
            reaper,
            analytics,
        }
    }
}

pub struct KnowledgeEngine {
    config: AppConfig,
    pipeline: IngestionPipeline,
    retrieval: RetrievalEngine,
    embeddings: Arc<EmbeddingService>,
    embedding_cache: Arc<SecureCache>,
    response_cache: Arc<SecureCache>,
    registry: Arc<CollectionRegistry>,
    vault: Arc<ProviderKeyVault>,
    pool: Arc<WorkerPool>,
    monitor: Arc<MemoryMonitor>,
    reaper: Arc<Reaper>,
    analytics: Arc<dyn RecordSink>,
}

impl KnowledgeEngine {
    pub fn builder(config: AppConfig) -> KnowledgeEngineBuilder {
        KnowledgeEngineBuilder::new(config)
    }

    pub async fn ingest(
        &self,
        author: &Principal,
        request: AddDocumentRequest,
    ) -> Result<DocHandle, IngestError> {
        self.pipeline.add_document(author, request).await
    }

    pub async fn query(
        &self,
        principal: &Principal,
        request: QueryRequest,
    ) -> Result<QueryResponse, QueryError> {
        self.retrieval.query(principal, request).await
    }

    pub fn registry(&self) -> &Arc<CollectionRegistry> {
        &self.registry
    }

    pub fn vault(&self) -> &Arc<ProviderKeyVault> {
        &self.vault
    }

    pub fn analytics(&self) -> &Arc<dyn RecordSink> {
        &self.analytics
    }

    pub fn breaker_states(&self) -> Vec<(String, CircuitState)> {
        self.embeddings.breaker_states()
    }

    pub fn cache_stats(&self) -> (CacheStats, CacheStats) {
        (self.embedding_cache.stats(), self.response_cache.stats())
    }

    /// Spawn the periodic maintenance loops: memory sampling and the
    /// processing-reaper. Handles run until the process exits.
    pub fn start_maintenance(&self) -> Vec<tokio::task::JoinHandle<()>> {
        vec![
            self.monitor.clone().spawn(),
            self.reaper
                .clone()
                .spawn(Duration::from_secs(self.config.ingest.reaper_horizon_secs.max(1))),
        ]
    }

    pub async fn sweep_stuck_documents(&self) -> Result<usize, IngestError> {
        self.reaper.sweep().await
    }

    pub async fn shutdown(&self) {
        self.pool.shutdown().await;
    }
}
