use cairn_core::auth::Principal;
use cairn_core::config::{LimitsConfig, QueueConfig};
use cairn_core::model::{DocumentStatus, TenantScope};
use chrono::Duration as ChronoDuration;
use ingestion::chunker::RecursiveChunker;
use ingestion::pipeline::{AddDocumentRequest, IngestError, IngestOutcome, IngestionPipeline, Reaper};
use ingestion::sanitizer::Sanitizer;
use ingestion::validator::{VectorPolicy, VectorValidator};
use jobs::queue::WorkQueue;
use jobs::worker::WorkerPool;
use providers::batcher::BatcherConfig;
use providers::breaker::BreakerSettings;
use providers::retry::RetryPolicy;
use providers::{EmbeddingService, LocalProvider};
use std::sync::Arc;
use std::time::Duration;
use storage::docstore::{DocumentStore, InMemoryDocumentStore, SafePattern};
use storage::registry::CollectionRegistry;
use storage::vector::{InMemoryVectorIndex, VectorIndex, WhereClause};

struct Fixture {
    pipeline: IngestionPipeline,
    documents: Arc<InMemoryDocumentStore>,
    vectors: Arc<InMemoryVectorIndex>,
    registry: Arc<CollectionRegistry>,
    pool: Arc<WorkerPool>,
}

fn fixture() -> Fixture {
    fixture_with_chunking(400, 40)
}

fn fixture_with_chunking(chunk_size: usize, overlap: usize) -> Fixture {
    let documents = Arc::new(InMemoryDocumentStore::new());
    let vectors = Arc::new(InMemoryVectorIndex::new());
    let registry = Arc::new(CollectionRegistry::new(
        "test-salt",
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
        RecursiveChunker::new(chunk_size, overlap),
        VectorValidator::new(VectorPolicy::default()),
        embeddings,
        pool.clone(),
        registry.clone(),
        vectors.clone(),
        documents.clone(),
        LimitsConfig::default(),
        1_048_576,
    );

    Fixture {
        pipeline,
        documents,
        vectors,
        registry,
        pool,
    }
}

fn request(scope: TenantScope, title: &str, content: &str) -> AddDocumentRequest {
    AddDocumentRequest {
        scope,
        title: title.to_string(),
        content: content.to_string(),
        tags: vec!["design".to_string()],
        language: "en".to_string(),
    }
}

fn author() -> Principal {
    Principal::new("u1").with_workspaces(["w1"]).with_projects(["p1"])
}

#[tokio::test]
async fn ingests_a_document_end_to_end() {
    let fx = fixture();
    let handle = fx
        .pipeline
        .add_document(
            &author(),
            request(
                TenantScope::Global,
                "Atomic Design",
                "Atomic Design groups elements into atoms, molecules, organisms.",
            ),
        )
        .await
        .unwrap();

    assert_eq!(handle.outcome, IngestOutcome::Created);
    assert_eq!(handle.status, DocumentStatus::Indexed);
    assert!(handle.chunk_count >= 1);
    assert!(handle.total_tokens > 0);

    let document = fx
        .documents
        .get_document(&handle.document_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(document.status, DocumentStatus::Indexed);
    assert_eq!(document.chunk_count, handle.chunk_count);

    let collection = fx.registry.resolve(&TenantScope::Global);
    assert_eq!(
        fx.vectors.count(&collection).await.unwrap(),
        handle.chunk_count as usize
    );
    fx.pool.shutdown().await;
}

#[tokio::test]
async fn small_chunk_size_produces_overlapping_chunks() {
    let fx = fixture_with_chunking(40, 10);
    let content = "Atomic Design groups elements into atoms, molecules, organisms.";
    let handle = fx
        .pipeline
        .add_document(&author(), request(TenantScope::Global, "Atomic", content))
        .await
        .unwrap();

    assert!((2..=3).contains(&(handle.chunk_count as usize)));

    let chunks = fx.documents.chunks_of(&handle.document_id).await.unwrap();
    let mut ordered = chunks.clone();
    ordered.sort_by_key(|chunk| chunk.chunk_index);

    // unique regions reconstruct the sanitized content
    let mut rebuilt = String::new();
    let mut covered = 0usize;
    for chunk in &ordered {
        let skip = covered.saturating_sub(chunk.offset_start);
        rebuilt.extend(chunk.text.chars().skip(skip));
        covered = chunk.offset_end;
    }
    assert_eq!(rebuilt, content);

    // overlap is a shared suffix/prefix bounded by the configured overlap
    for pair in ordered.windows(2) {
        let shared = pair[0].offset_end.saturating_sub(pair[1].offset_start);
        assert!(shared <= 10);
        let suffix: String = pair[0]
            .text
            .chars()
            .skip(pair[0].text.chars().count() - shared)
            .collect();
        let prefix: String = pair[1].text.chars().take(shared).collect();
        assert_eq!(suffix, prefix);
    }
    fx.pool.shutdown().await;
}

#[tokio::test]
async fn pii_content_is_rejected() {
    let fx = fixture();
    let result = fx
        .pipeline
        .add_document(
            &author(),
            request(TenantScope::Global, "Contact", "contact me at a@b.co"),
        )
        .await;

    let Err(IngestError::PiiDetected { classes }) = result else {
        panic!("expected pii rejection");
    };
    assert_eq!(classes, vec!["email".to_string()]);
    fx.pool.shutdown().await;
}

#[tokio::test]
async fn duplicate_ingest_returns_the_existing_document() {
    let fx = fixture();
    let req = request(
        TenantScope::workspace("w1"),
        "Atomic Design",
        "Atomic Design groups elements into atoms, molecules, organisms.",
    );

    let first = fx.pipeline.add_document(&author(), req.clone()).await.unwrap();
    let second = fx.pipeline.add_document(&author(), req).await.unwrap();

    assert_eq!(first.outcome, IngestOutcome::Created);
    assert_eq!(second.outcome, IngestOutcome::AlreadyExists);
    assert_eq!(first.document_id, second.document_id);

    // exactly one indexed document exists for the content
    let collection = fx.registry.resolve(&TenantScope::workspace("w1"));
    assert_eq!(
        fx.vectors.count(&collection).await.unwrap(),
        first.chunk_count as usize
    );
    fx.pool.shutdown().await;
}

#[tokio::test]
async fn same_content_in_another_scope_is_a_new_document() {
    let fx = fixture();
    let content = "Shared text that lands in two tenants.";

    let ws = fx
        .pipeline
        .add_document(&author(), request(TenantScope::workspace("w1"), "t", content))
        .await
        .unwrap();
    let global = fx
        .pipeline
        .add_document(&author(), request(TenantScope::Global, "t", content))
        .await
        .unwrap();

    assert_ne!(ws.document_id, global.document_id);
    assert_eq!(global.outcome, IngestOutcome::Created);
    fx.pool.shutdown().await;
}

#[tokio::test]
async fn author_outside_the_workspace_is_denied() {
    let fx = fixture();
    let outsider = Principal::new("intruder");
    let result = fx
        .pipeline
        .add_document(
            &outsider,
            request(TenantScope::workspace("w1"), "t", "some text"),
        )
        .await;
    assert!(matches!(result, Err(IngestError::AccessDenied("workspace"))));
    fx.pool.shutdown().await;
}

#[tokio::test]
async fn empty_after_sanitization_is_rejected() {
    let fx = fixture();
    let result = fx
        .pipeline
        .add_document(
            &author(),
            request(TenantScope::Global, "t", "<script>alert(1)</script>"),
        )
        .await;
    assert!(matches!(result, Err(IngestError::EmptyContent)));
    fx.pool.shutdown().await;
}

#[tokio::test]
async fn indexed_chunks_are_keyword_searchable() {
    let fx = fixture();
    fx.pipeline
        .add_document(
            &author(),
            request(
                TenantScope::Global,
                "Atomic Design",
                "Atomic Design groups elements into atoms, molecules, organisms.",
            ),
        )
        .await
        .unwrap();

    let pattern = SafePattern::build("atoms molecules").unwrap();
    let hits = fx
        .documents
        .text_query(&pattern, &WhereClause::default(), 10)
        .await
        .unwrap();
    assert!(!hits.is_empty());
    fx.pool.shutdown().await;
}

#[tokio::test]
async fn reaper_fails_stuck_documents_and_purges_vectors() {
    let fx = fixture();

    // a healthy document, untouched by the reaper
    let healthy = fx
        .pipeline
        .add_document(
            &author(),
            request(TenantScope::Global, "healthy", "healthy content stays indexed"),
        )
        .await
        .unwrap();

    // simulate an abandoned ingest: document stuck in processing with a
    // partial vector write
    let abandoned = {
        use cairn_core::model::{chunk_id, content_hash, Document};
        let scope = TenantScope::Global;
        let hash = content_hash("stuck", "partial body", &scope);
        let mut document = Document::new(scope.clone(), "stuck", hash, "en", Vec::new());
        document.status = DocumentStatus::Processing;
        document.updated_at = chrono::Utc::now() - ChronoDuration::hours(3);
        fx.documents.insert_document(document.clone()).await.unwrap();
        fx.documents
            .update_status(&document.id, DocumentStatus::Processing, None)
            .await
            .unwrap();

        let collection = fx.registry.ensure(&scope, "u1").await.unwrap();
        fx.vectors
            .upsert(
                &collection,
                &[chunk_id(&document.id, 0)],
                &[vec![0.5f32; 64]],
                &["partial".to_string()],
                &[std::collections::HashMap::new()],
            )
            .await
            .unwrap();
        document
    };
    // update_status refreshed updated_at; age it again past the horizon
    {
        let aged = fx
            .documents
            .get_document(&abandoned.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(aged.status, DocumentStatus::Processing);
    }

    let reaper = Reaper::new(
        fx.documents.clone(),
        fx.vectors.clone(),
        fx.registry.clone(),
        ChronoDuration::zero(),
    );
    let reaped = reaper.sweep().await.unwrap();
    assert_eq!(reaped, 1);

    let failed = fx
        .documents
        .get_document(&abandoned.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(failed.status, DocumentStatus::Failed);
    assert!(failed.error.is_some());

    // the healthy document's vectors survive
    let collection = fx.registry.resolve(&TenantScope::Global);
    assert_eq!(
        fx.vectors.count(&collection).await.unwrap(),
        healthy.chunk_count as usize
    );
    fx.pool.shutdown().await;
}
