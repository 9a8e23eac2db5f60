use crate::batcher::{BatchExecutor, Batcher, BatcherConfig};
use crate::breaker::{BreakerRegistry, BreakerSettings, CircuitState};
use crate::provider::{EmbeddingProvider, ProviderError};
use crate::retry::RetryPolicy;
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use storage::cache::SecureCache;
use tokio::time::sleep;
use tracing::{info, warn};

/// Per-call dispatch over the provider precedence list: each attempt
/// passes the provider's breaker gate, transient failures retry with
/// backoff, and a provider that stays down hands off to the next in the
/// chain. The retry loop sits outside the breaker, so every attempt is
/// individually gated and accounted.
pub struct Dispatcher {
    providers: Vec<Arc<dyn EmbeddingProvider>>,
    breakers: BreakerRegistry,
    retry: RetryPolicy,
    allow_local_fallback: bool,
}

impl Dispatcher {
    pub fn new(
        providers: Vec<Arc<dyn EmbeddingProvider>>,
        breaker_settings: BreakerSettings,
        retry: RetryPolicy,
        allow_local_fallback: bool,
    ) -> Self {
        Self {
            providers,
            breakers: BreakerRegistry::new(breaker_settings),
            retry,
            allow_local_fallback,
        }
    }

    pub fn breaker_states(&self) -> Vec<(String, CircuitState)> {
        self.breakers.states()
    }

    async fn call_provider(
        &self,
        provider: &Arc<dyn EmbeddingProvider>,
        texts: &[String],
    ) -> Result<Vec<Vec<f32>>, ProviderError> {
        let breaker = self.breakers.get_or_create(provider.id());
        let mut last_error = None;

        for attempt in 0..=self.retry.max_retries {
            if !breaker.allow_request() {
                return Err(ProviderError::CircuitOpen {
                    provider: provider.id().to_string(),
                    retry_after: breaker.retry_after(),
                });
            }

            match provider.embed_batch(texts).await {
                Ok(vectors) => {
                    breaker.record_success();
                    return Ok(vectors);
                }
                Err(ProviderError::RateLimited { retry_after }) => {
                    breaker.note_rate_limited(retry_after);
                    let delay = retry_after
                        .unwrap_or_else(|| self.retry.delay_for(attempt + 1))
                        .min(self.retry.max_delay);
                    last_error = Some(ProviderError::RateLimited { retry_after });
                    if attempt < self.retry.max_retries && !delay.is_zero() {
                        sleep(delay).await;
                    }
                }
                Err(error) if error.is_transient() => {
                    breaker.record_failure();
                    let delay = self.retry.delay_for(attempt + 1);
                    last_error = Some(error);
                    if attempt < self.retry.max_retries && !delay.is_zero() {
                        sleep(delay).await;
                    }
                }
                Err(error) => {
                    breaker.record_failure();
                    return Err(error);
                }
            }
        }

        Err(last_error.unwrap_or(ProviderError::Exhausted))
    }

    pub async fn dispatch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let mut last_error = None;
        for provider in &self.providers {
            if provider.id() == "local" && !self.allow_local_fallback {
                warn!("skipping local provider: fallback gate is closed");
                continue;
            }

            match self.call_provider(provider, texts).await {
                Ok(vectors) => return Ok(vectors),
                Err(error) => {
                    info!(provider = provider.id(), error = %error, "provider failed, trying next");
                    last_error = Some(error);
                }
            }
        }

        Err(last_error.unwrap_or(ProviderError::Exhausted))
    }
}

#[async_trait]
impl BatchExecutor for Dispatcher {
    async fn execute(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>, ProviderError> {
        self.dispatch(&texts).await
    }
}

/// Embedding front door: cache lookup before batching, batching before
/// dispatch. Cache writes are best-effort and failures never block the
/// embedding itself.
pub struct EmbeddingService {
    dispatcher: Arc<Dispatcher>,
    batcher: Batcher,
    cache: Option<Arc<SecureCache>>,
    primary_id: String,
    model: String,
    dims: usize,
    cache_ttl: Duration,
}

impl EmbeddingService {
    pub fn new(
        providers: Vec<Arc<dyn EmbeddingProvider>>,
        breaker_settings: BreakerSettings,
        retry: RetryPolicy,
        batcher_config: BatcherConfig,
        model: impl Into<String>,
        allow_local_fallback: bool,
        cache: Option<Arc<SecureCache>>,
    ) -> Self {
        let primary_id = providers
            .first()
            .map(|provider| provider.id().to_string())
            .unwrap_or_else(|| "local".to_string());
        let dims = providers.first().map(|provider| provider.dim()).unwrap_or(0);

        let dispatcher = Arc::new(Dispatcher::new(
            providers,
            breaker_settings,
            retry,
            allow_local_fallback,
        ));
        let batcher = Batcher::spawn(batcher_config, dispatcher.clone());

        Self {
            dispatcher,
            batcher,
            cache,
            primary_id,
            model: model.into(),
            dims,
            cache_ttl: Duration::from_secs(3_600),
        }
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    pub fn dim(&self) -> usize {
        self.dims
    }

    pub fn breaker_states(&self) -> Vec<(String, CircuitState)> {
        self.dispatcher.breaker_states()
    }

    fn cache_key(&self, text: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.primary_id.as_bytes());
        hasher.update(self.model.as_bytes());
        hasher.update(text.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    pub async fn embed_one(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        let key = self.cache_key(text);
        if let Some(cache) = &self.cache {
            if let Some(hit) = cache.get::<Vec<f32>>(&key).await {
                return Ok(hit);
            }
        }

        let vector = self.batcher.embed(text).await?;

        if let Some(cache) = &self.cache {
            cache.set(&key, &vector, Some(self.cache_ttl)).await;
        }
        Ok(vector)
    }

    pub async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let keys: Vec<String> = texts.iter().map(|text| self.cache_key(text)).collect();
        let mut resolved: Vec<Option<Vec<f32>>> = match &self.cache {
            Some(cache) => cache.mget(&keys).await,
            None => vec![None; texts.len()],
        };

        let missing: Vec<usize> = resolved
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| slot.is_none().then_some(index))
            .collect();

        if !missing.is_empty() {
            let miss_texts: Vec<String> = missing.iter().map(|&i| texts[i].clone()).collect();
            let vectors = self.dispatcher.dispatch(&miss_texts).await?;

            if let Some(cache) = &self.cache {
                let entries: Vec<(String, Vec<f32>)> = missing
                    .iter()
                    .zip(&vectors)
                    .map(|(&i, vector)| (keys[i].clone(), vector.clone()))
                    .collect();
                cache.mset(&entries, Some(self.cache_ttl)).await;
            }

            for (&index, vector) in missing.iter().zip(vectors) {
                resolved[index] = Some(vector);
            }
        }

        Ok(resolved.into_iter().map(|slot| slot.unwrap_or_default()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::LocalProvider;
    use std::sync::atomic::{AtomicU32, Ordering};
    use storage::cache::InMemoryKv;

    struct FlakyProvider {
        id: String,
        failures_before_success: u32,
        calls: AtomicU32,
    }

    impl FlakyProvider {
        fn new(id: &str, failures_before_success: u32) -> Self {
            Self {
                id: id.to_string(),
                failures_before_success,
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl EmbeddingProvider for FlakyProvider {
        fn id(&self) -> &str {
            &self.id
        }

        fn dim(&self) -> usize {
            4
        }

        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures_before_success {
                return Err(ProviderError::Transient("flaky".to_string()));
            }
            Ok(texts.iter().map(|_| vec![1.0, 0.0, 0.0, 0.0]).collect())
        }
    }

    struct DeadProvider;

    #[async_trait]
    impl EmbeddingProvider for DeadProvider {
        fn id(&self) -> &str {
            "openai"
        }

        fn dim(&self) -> usize {
            4
        }

        async fn embed_batch(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
            Err(ProviderError::Transient("connection refused".to_string()))
        }
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_retries: 1,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            backoff_factor: 2.0,
            jitter: false,
        }
    }

    fn service(providers: Vec<Arc<dyn EmbeddingProvider>>) -> EmbeddingService {
        EmbeddingService::new(
            providers,
            BreakerSettings::default(),
            fast_retry(),
            BatcherConfig {
                batch_size: 4,
                window: Duration::from_millis(5),
            },
            "embedding-default-v1",
            true,
            None,
        )
    }

    #[tokio::test]
    async fn transient_failures_are_masked_by_retry() {
        let svc = service(vec![Arc::new(FlakyProvider::new("openai", 1))]);
        let vector = svc.embed_one("text").await.unwrap();
        assert_eq!(vector.len(), 4);
    }

    #[tokio::test]
    async fn fallback_chain_kicks_in_when_the_primary_is_down() {
        let svc = service(vec![
            Arc::new(DeadProvider),
            Arc::new(LocalProvider::new("m", 4)),
        ]);
        let vector = svc.embed_one("text").await.unwrap();
        assert_eq!(vector.len(), 4);
    }

    #[tokio::test]
    async fn local_fallback_gate_blocks_when_closed() {
        let svc = EmbeddingService::new(
            vec![Arc::new(DeadProvider), Arc::new(LocalProvider::new("m", 4))],
            BreakerSettings::default(),
            fast_retry(),
            BatcherConfig::default(),
            "embedding-default-v1",
            false,
            None,
        );
        let result = svc.embed_one("text").await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn cache_hits_bypass_the_provider() {
        let cache = Arc::new(SecureCache::new(
            Arc::new(InMemoryKv::new()),
            "emb",
            Duration::from_secs(60),
        ));
        let flaky = Arc::new(FlakyProvider::new("openai", 0));
        let svc = EmbeddingService::new(
            vec![flaky.clone()],
            BreakerSettings::default(),
            fast_retry(),
            BatcherConfig {
                batch_size: 1,
                window: Duration::from_millis(1),
            },
            "embedding-default-v1",
            true,
            Some(cache),
        );

        let first = svc.embed_one("text").await.unwrap();
        let calls_after_first = flaky.calls.load(Ordering::SeqCst);
        let second = svc.embed_one("text").await.unwrap();

        assert_eq!(first, second);
        assert_eq!(flaky.calls.load(Ordering::SeqCst), calls_after_first);
    }

    #[tokio::test]
    async fn batch_mixes_cache_hits_and_fresh_embeddings() {
        let cache = Arc::new(SecureCache::new(
            Arc::new(InMemoryKv::new()),
            "emb",
            Duration::from_secs(60),
        ));
        let svc = EmbeddingService::new(
            vec![Arc::new(LocalProvider::new("m", 4))],
            BreakerSettings::default(),
            fast_retry(),
            BatcherConfig::default(),
            "embedding-default-v1",
            true,
            Some(cache),
        );

        let warm = svc.embed_one("alpha").await.unwrap();
        let batch = svc
            .embed_batch(&["alpha".to_string(), "beta".to_string()])
            .await
            .unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0], warm);
        assert_ne!(batch[0], batch[1]);
    }

    #[tokio::test]
    async fn breaker_trips_and_recovers_through_half_open() {
        // 5 consecutive failures open the circuit; the next call is
        // rejected immediately; after the reset timeout one probe is
        // admitted and 2 successes close it again.
        let provider = Arc::new(FlakyProvider::new("openai", 5));
        let settings = BreakerSettings::default()
            .with_failure_threshold(5)
            .with_success_threshold(2)
            .with_reset_timeout(Duration::from_millis(30));
        let dispatcher = Dispatcher::new(
            vec![provider.clone()],
            settings,
            RetryPolicy {
                max_retries: 0,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(1),
                backoff_factor: 1.0,
                jitter: false,
            },
            true,
        );
        let texts = vec!["t".to_string()];

        for _ in 0..5 {
            assert!(dispatcher.dispatch(&texts).await.is_err());
        }
        let states = dispatcher.breaker_states();
        assert_eq!(states[0].1, CircuitState::Open);

        // Rejected without reaching the provider while open.
        let calls_before = provider.calls.load(Ordering::SeqCst);
        let rejected = dispatcher.dispatch(&texts).await;
        assert!(matches!(rejected, Err(ProviderError::CircuitOpen { .. })));
        assert_eq!(provider.calls.load(Ordering::SeqCst), calls_before);

        sleep(Duration::from_millis(40)).await;
        assert!(dispatcher.dispatch(&texts).await.is_ok()); // half-open probe
        assert!(dispatcher.dispatch(&texts).await.is_ok());
        assert_eq!(dispatcher.breaker_states()[0].1, CircuitState::Closed);
    }
}
