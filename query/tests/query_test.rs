use cairn_core::analytics::InMemoryRecordSink;
use cairn_core::auth::Principal;
use cairn_core::config::{HybridWeights, LimitsConfig, QueueConfig, RetrievalConfig};
use cairn_core::model::TenantScope;
use ingestion::chunker::RecursiveChunker;
use ingestion::pipeline::{AddDocumentRequest, IngestionPipeline};
use ingestion::sanitizer::Sanitizer;
use ingestion::validator::{VectorPolicy, VectorValidator};
use jobs::queue::WorkQueue;
use jobs::worker::WorkerPool;
use providers::batcher::BatcherConfig;
use providers::breaker::BreakerSettings;
use providers::retry::RetryPolicy;
use providers::{EmbeddingService, LocalProvider};
use query::dsl::{QueryRequest, QueryScope, ResultSource};
use query::engine::{QueryError, RetrievalEngine};
use std::sync::Arc;
use std::time::Duration;
use storage::cache::{InMemoryKv, SecureCache};
use storage::docstore::InMemoryDocumentStore;
use storage::registry::CollectionRegistry;
use storage::vector::InMemoryVectorIndex;

struct Fixture {
    pipeline: IngestionPipeline,
    engine: RetrievalEngine,
    vectors: Arc<InMemoryVectorIndex>,
    documents: Arc<InMemoryDocumentStore>,
    analytics: Arc<InMemoryRecordSink>,
    pool: Arc<WorkerPool>,
}

fn fixture() -> Fixture {
    fixture_with_weights(HybridWeights {
        semantic: 0.7,
        keyword: 0.3,
    })
}

fn fixture_with_weights(weights: HybridWeights) -> Fixture {
    let documents = Arc::new(InMemoryDocumentStore::new());
    let vectors = Arc::new(InMemoryVectorIndex::new());
    let registry = Arc::new(CollectionRegistry::new(
        "query-test-salt",
        "global_knowledge",
        vectors.clone(),
        documents.clone(),
        Duration::from_secs(60),
    ));
    let embeddings = Arc::new(EmbeddingService::new(
        vec![Arc::new(LocalProvider::new("embedding-default-v1", 64))],
        BreakerSettings::default(),
        RetryPolicy::default().without_jitter(),
        BatcherConfig {
            batch_size: 8,
            window: Duration::from_millis(2),
        },
        "embedding-default-v1",
        true,
        None,
    ));
    let pool = Arc::new(WorkerPool::start(WorkQueue::new(QueueConfig {
        concurrency: 4,
        max_size: 1_000,
        timeout_ms: 5_000,
        max_retries: 1,
        initial_delay_ms: 1,
        backoff_factor: 2.0,
    })));

    let pipeline = IngestionPipeline::new(
        Sanitizer::new(1_000_000),
        RecursiveChunker::new(40, 10),
        VectorValidator::new(VectorPolicy::default()),
        embeddings.clone(),
        pool.clone(),
        registry.clone(),
        vectors.clone(),
        documents.clone(),
        LimitsConfig::default(),
        1_048_576,
    );

    let analytics = Arc::new(InMemoryRecordSink::default());
    let engine = RetrievalEngine::new(
        registry,
        vectors.clone(),
        documents.clone(),
        embeddings,
        Sanitizer::new(100_000),
        Arc::new(SecureCache::new(
            Arc::new(InMemoryKv::new()),
            "responses",
            Duration::from_secs(300),
        )),
        RetrievalConfig {
            top_k: 5,
            final_k: 3,
            min_relevance: 0.01,
            hybrid_weights: weights,
            ..RetrievalConfig::default()
        },
        LimitsConfig::default(),
    )
    .with_analytics(analytics.clone());

    Fixture {
        pipeline,
        engine,
        vectors,
        documents,
        analytics,
        pool,
    }
}

fn author() -> Principal {
    Principal::new("u1").with_workspaces(["w1"]).with_projects(["p1"])
}

async fn seed_atomic_design(fx: &Fixture) {
    fx.pipeline
        .add_document(
            &author(),
            AddDocumentRequest {
                scope: TenantScope::Global,
                title: "Atomic Design".to_string(),
                content: "Atomic Design groups elements into atoms, molecules, organisms."
                    .to_string(),
                tags: vec!["design".to_string()],
                language: "en".to_string(),
            },
        )
        .await
        .unwrap();
    fx.pipeline
        .add_document(
            &author(),
            AddDocumentRequest {
                scope: TenantScope::Global,
                title: "Databases".to_string(),
                content: "Databases persist rows inside tables and serve transactions quickly."
                    .to_string(),
                tags: vec!["storage".to_string()],
                language: "en".to_string(),
            },
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn hybrid_query_surfaces_the_relevant_document() {
    let fx = fixture();
    seed_atomic_design(&fx).await;

    let response = fx
        .engine
        .query(
            &author(),
            QueryRequest::new("design atoms molecules").with_top_k(5),
        )
        .await
        .unwrap();

    assert!(!response.degraded);
    assert!(!response.results.is_empty());
    assert!(response.results.len() <= 3); // final_k
    assert!(response
        .results
        .iter()
        .any(|passage| passage.content.contains("atoms")));
    for passage in &response.results {
        assert!(matches!(
            passage.source,
            ResultSource::Semantic | ResultSource::Keyword | ResultSource::Hybrid
        ));
    }
    fx.pool.shutdown().await;
}

#[tokio::test]
async fn results_carry_citations_and_metadata() {
    let fx = fixture();
    seed_atomic_design(&fx).await;

    let response = fx
        .engine
        .query(&author(), QueryRequest::new("atoms molecules"))
        .await
        .unwrap();

    let passage = &response.results[0];
    let citation = passage.citation.as_ref().unwrap();
    assert_eq!(citation.title, "Atomic Design");
    assert_eq!(citation.scope, "global");
    assert!(citation.deep_link.starts_with("cairn://"));
    assert!(citation.deep_link.contains(&citation.document_id));

    let metadata = passage.metadata.as_ref().unwrap();
    assert_eq!(metadata.get("language").unwrap(), "en");
    // the metadata subset never includes the full status machinery
    assert!(!metadata.contains_key("status"));
    fx.pool.shutdown().await;
}

#[tokio::test]
async fn metadata_and_citations_can_be_omitted() {
    let fx = fixture();
    seed_atomic_design(&fx).await;

    let mut request = QueryRequest::new("atoms");
    request.include_metadata = false;
    request.include_citations = false;
    let response = fx.engine.query(&author(), request).await.unwrap();

    assert!(response.results[0].metadata.is_none());
    assert!(response.results[0].citation.is_none());
    fx.pool.shutdown().await;
}

#[tokio::test]
async fn vector_outage_degrades_to_keyword_results() {
    let fx = fixture();
    seed_atomic_design(&fx).await;

    fx.vectors.set_unavailable(true);
    let response = fx
        .engine
        .query(&author(), QueryRequest::new("atoms molecules design"))
        .await
        .unwrap();

    assert!(response.degraded);
    assert!(!response.results.is_empty());
    assert!(response
        .results
        .iter()
        .all(|passage| passage.source == ResultSource::Keyword));
    fx.pool.shutdown().await;
}

#[tokio::test]
async fn both_paths_down_fails_the_query() {
    let fx = fixture();
    seed_atomic_design(&fx).await;

    fx.vectors.set_unavailable(true);
    fx.documents.set_unavailable(true);
    let result = fx
        .engine
        .query(&author(), QueryRequest::new("atoms"))
        .await;
    assert!(matches!(result, Err(QueryError::QueryFailed(_))));
    fx.pool.shutdown().await;
}

#[tokio::test]
async fn responses_are_cached_for_identical_queries() {
    let fx = fixture();
    seed_atomic_design(&fx).await;

    let first = fx
        .engine
        .query(&author(), QueryRequest::new("atoms molecules"))
        .await
        .unwrap();
    assert!(!first.cached);

    let second = fx
        .engine
        .query(&author(), QueryRequest::new("atoms molecules"))
        .await
        .unwrap();
    assert!(second.cached);
    assert_eq!(first.results, second.results);
    fx.pool.shutdown().await;
}

#[tokio::test]
async fn min_score_floor_filters_candidates() {
    let fx = fixture();
    seed_atomic_design(&fx).await;

    let response = fx
        .engine
        .query(
            &author(),
            QueryRequest::new("atoms molecules").with_min_score(0.99),
        )
        .await
        .unwrap();
    assert!(response.results.is_empty());
    assert_eq!(response.filtered, response.total_found);
    fx.pool.shutdown().await;
}

#[tokio::test]
async fn injection_shaped_queries_are_rejected() {
    let fx = fixture();
    seed_atomic_design(&fx).await;

    let result = fx
        .engine
        .query(&author(), QueryRequest::new(r#"{"$where": "sleep(1)"}"#))
        .await;
    assert!(matches!(result, Err(QueryError::InvalidQuery(_))));
    fx.pool.shutdown().await;
}

#[tokio::test]
async fn pii_in_queries_is_logged_not_blocked() {
    let fx = fixture();
    seed_atomic_design(&fx).await;

    let response = fx
        .engine
        .query(&author(), QueryRequest::new("atoms for a@b.co please"))
        .await
        .unwrap();
    assert!(!response.results.is_empty());
    fx.pool.shutdown().await;
}

#[tokio::test]
async fn analytics_records_every_query() {
    let fx = fixture();
    seed_atomic_design(&fx).await;

    fx.engine
        .query(&author(), QueryRequest::new("atoms"))
        .await
        .unwrap();
    fx.engine
        .query(&author(), QueryRequest::new("molecules"))
        .await
        .unwrap();

    let records = fx.analytics.records().unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].user, "u1");
    assert_eq!(records[0].tenant, "global");
    assert!(records[0].sanitized_query.contains("atoms"));
    fx.pool.shutdown().await;
}

#[tokio::test]
async fn keyword_only_weights_reproduce_lexical_order() {
    let fx = fixture_with_weights(HybridWeights {
        semantic: 0.0,
        keyword: 1.0,
    });
    seed_atomic_design(&fx).await;

    let response = fx
        .engine
        .query(
            &author(),
            QueryRequest::new("atoms molecules organisms").with_min_score(0.3),
        )
        .await
        .unwrap();

    assert!(!response.results.is_empty());
    // with w_semantic = 0 and the floor above the contextual boosts,
    // every surviving result owes its score to the keyword path
    for passage in &response.results {
        assert!(matches!(
            passage.source,
            ResultSource::Keyword | ResultSource::Hybrid
        ));
    }
    fx.pool.shutdown().await;
}

#[tokio::test]
async fn processing_documents_do_not_contribute() {
    let fx = fixture();
    seed_atomic_design(&fx).await;

    // regress one document to processing; its chunks must vanish from
    // results even though vectors are still present
    use cairn_core::model::{content_hash, DocumentStatus};
    use storage::docstore::DocumentStore;
    let hash = content_hash(
        "Atomic Design",
        "Atomic Design groups elements into atoms, molecules, organisms.",
        &TenantScope::Global,
    );
    let document = fx.documents.find_by_hash(&hash).await.unwrap().unwrap();
    fx.documents
        .update_status(&document.id, DocumentStatus::Processing, None)
        .await
        .unwrap();

    let response = fx
        .engine
        .query(&author(), QueryRequest::new("atoms molecules"))
        .await
        .unwrap();
    assert!(response
        .results
        .iter()
        .all(|passage| !passage.content.contains("atoms")));
    fx.pool.shutdown().await;
}
