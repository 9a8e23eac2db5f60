use crate::chunker::{ChunkSpan, RecursiveChunker};
use crate::sanitizer::{SanitizeError, Sanitizer};
use crate::validator::{VectorInvalid, VectorValidator};
use cairn_core::auth::Principal;
use cairn_core::error::{CairnError, ErrorKind};
use cairn_core::model::{
    chunk_id, chunk_metadata, content_hash, meta, ChunkRecord, Document, DocumentId,
    DocumentStatus, TenantScope,
};
use cairn_core::config::LimitsConfig;
use chrono::Duration as ChronoDuration;
use jobs::queue::QueueError;
use jobs::worker::WorkerPool;
use jobs::Job;
use providers::EmbeddingService;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use storage::docstore::{DocStoreError, DocumentStore};
use storage::registry::{CollectionRegistry, RegistryError};
use storage::vector::{VectorIndex, VectorStoreError};
use async_trait::async_trait;
use thiserror::Error;
use tracing::{error, info, warn};

const EMBED_PRIORITY: u8 = 5;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("author may not write to this {0} scope")]
    AccessDenied(&'static str),
    #[error("pii detected: {}", classes.join(", "))]
    PiiDetected { classes: Vec<String> },
    #[error("content is empty after sanitization")]
    EmptyContent,
    #[error("input rejected: {0}")]
    InvalidInput(String),
    #[error("title exceeds {0} characters")]
    TitleTooLong(usize),
    #[error("more than {0} tags")]
    TooManyTags(usize),
    #[error("content exceeds {0} bytes")]
    ContentTooLarge(usize),
    #[error("embedding failed: {0}")]
    EmbeddingFailed(String),
    #[error(transparent)]
    VectorRejected(#[from] VectorInvalid),
    #[error("document store error: {0}")]
    Storage(#[from] DocStoreError),
    #[error("vector index error: {0}")]
    VectorStore(#[from] VectorStoreError),
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Queue(#[from] QueueError),
}

impl CairnError for IngestError {
    fn kind(&self) -> ErrorKind {
        match self {
            IngestError::AccessDenied(_) => ErrorKind::Access,
            IngestError::PiiDetected { .. }
            | IngestError::EmptyContent
            | IngestError::InvalidInput(_)
            | IngestError::TitleTooLong(_)
            | IngestError::TooManyTags(_)
            | IngestError::ContentTooLarge(_)
            | IngestError::VectorRejected(_) => ErrorKind::Validation,
            IngestError::EmbeddingFailed(_) => ErrorKind::Provider,
            IngestError::Storage(_) | IngestError::VectorStore(_) | IngestError::Registry(_) => {
                ErrorKind::Storage
            }
            IngestError::Queue(_) => ErrorKind::Capacity,
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            IngestError::Queue(inner) => inner.retry_after(),
            _ => None,
        }
    }
}

impl From<SanitizeError> for IngestError {
    fn from(error: SanitizeError) -> Self {
        IngestError::InvalidInput(error.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    Created,
    AlreadyExists,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DocHandle {
    pub document_id: DocumentId,
    pub chunk_count: u32,
    pub total_tokens: u64,
    pub cost_units: u64,
    pub status: DocumentStatus,
    pub outcome: IngestOutcome,
}

#[derive(Debug, Clone)]
pub struct AddDocumentRequest {
    pub scope: TenantScope,
    pub title: String,
    pub content: String,
    pub tags: Vec<String>,
    pub language: String,
}

/// One chunk's embedding task. The vector lands in the shared slot; the
/// queue handle reports completion or permanent failure.
struct EmbedJob {
    text: String,
    service: Arc<EmbeddingService>,
    slot: Arc<Mutex<Option<Vec<f32>>>>,
}

#[async_trait]
impl Job for EmbedJob {
    async fn run(&self) -> anyhow::Result<()> {
        let vector = self
            .service
            .embed_one(&self.text)
            .await
            .map_err(|error| anyhow::anyhow!(error.to_string()))?;
        *self.slot.lock().unwrap() = Some(vector);
        Ok(())
    }

    fn name(&self) -> &str {
        "embed-chunk"
    }
}

pub struct IngestionPipeline {
    sanitizer: Sanitizer,
    chunker: RecursiveChunker,
    validator: VectorValidator,
    embeddings: Arc<EmbeddingService>,
    pool: Arc<WorkerPool>,
    registry: Arc<CollectionRegistry>,
    vectors: Arc<dyn VectorIndex>,
    documents: Arc<dyn DocumentStore>,
    limits: LimitsConfig,
    streaming_threshold_bytes: usize,
}

impl IngestionPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        sanitizer: Sanitizer,
        chunker: RecursiveChunker,
        validator: VectorValidator,
        embeddings: Arc<EmbeddingService>,
        pool: Arc<WorkerPool>,
        registry: Arc<CollectionRegistry>,
        vectors: Arc<dyn VectorIndex>,
        documents: Arc<dyn DocumentStore>,
        limits: LimitsConfig,
        streaming_threshold_bytes: usize,
    ) -> Self {
        Self {
            sanitizer,
            chunker,
            validator,
            embeddings,
            pool,
            registry,
            vectors,
            documents,
            limits,
            streaming_threshold_bytes,
        }
    }

    pub async fn add_document(
        &self,
        author: &Principal,
        request: AddDocumentRequest,
    ) -> Result<DocHandle, IngestError> {
        self.check_limits(&request)?;
        if !self.registry.can_access(author, &request.scope) {
            return Err(IngestError::AccessDenied(request.scope.kind()));
        }

        let outcome = self.sanitizer.sanitize(&request.content)?;
        if !outcome.pii_classes.is_empty() {
            return Err(IngestError::PiiDetected {
                classes: outcome
                    .pii_classes
                    .iter()
                    .map(|class| class.as_str().to_string())
                    .collect(),
            });
        }
        if outcome.is_empty() {
            return Err(IngestError::EmptyContent);
        }
        let sanitized = outcome.sanitized;

        let hash = content_hash(&request.title, &sanitized, &request.scope);
        if let Some(existing) = self.documents.find_by_hash(&hash).await? {
            // failed documents are retryable; everything else dedupes
            if existing.status == DocumentStatus::Failed {
                info!(document_id = %existing.id, "re-ingesting previously failed document");
                self.documents.delete_document(&existing.id).await?;
            } else {
                info!(document_id = %existing.id, "duplicate ingest, returning existing document");
                return Ok(already_exists(existing));
            }
        }

        let spans = self.split(&sanitized);
        if spans.is_empty() {
            return Err(IngestError::EmptyContent);
        }

        let mut document = Document::new(
            request.scope.clone(),
            request.title.clone(),
            hash,
            request.language.clone(),
            request.tags.clone(),
        );
        match self.documents.insert_document(document.clone()).await {
            Ok(()) => {}
            // Lost the insert race: the winner owns the document.
            Err(DocStoreError::DuplicateHash { existing }) => {
                let winner = self
                    .documents
                    .get_document(&existing)
                    .await?
                    .ok_or(DocStoreError::NotFound)?;
                return Ok(already_exists(winner));
            }
            Err(error) => return Err(error.into()),
        }
        self.documents
            .update_status(&document.id, DocumentStatus::Processing, None)
            .await?;
        document.status = DocumentStatus::Processing;

        match self.embed_and_index(&document, author, &spans).await {
            Ok(handle) => Ok(handle),
            Err(error) => {
                if let Err(mark) = self
                    .documents
                    .update_status(
                        &document.id,
                        DocumentStatus::Failed,
                        Some(error.to_string()),
                    )
                    .await
                {
                    error!(document_id = %document.id, error = %mark, "failed to mark document failed");
                }
                Err(error)
            }
        }
    }

    async fn embed_and_index(
        &self,
        document: &Document,
        author: &Principal,
        spans: &[ChunkSpan],
    ) -> Result<DocHandle, IngestError> {
        let mut slots = Vec::with_capacity(spans.len());
        let mut handles = Vec::with_capacity(spans.len());
        for span in spans {
            let slot = Arc::new(Mutex::new(None));
            let job = Arc::new(EmbedJob {
                text: span.text.clone(),
                service: self.embeddings.clone(),
                slot: slot.clone(),
            });
            handles.push(self.pool.queue().submit(EMBED_PRIORITY, job)?);
            slots.push(slot);
        }

        for handle in handles {
            handle
                .wait()
                .await
                .map_err(|error| IngestError::EmbeddingFailed(error.to_string()))?;
        }

        let vectors: Vec<Vec<f32>> = slots
            .iter()
            .map(|slot| slot.lock().unwrap().take())
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| {
                IngestError::EmbeddingFailed("embedding task completed without a vector".to_string())
            })?;

        self.validator.validate_all(&vectors)?;

        let collection = self.registry.ensure(&document.scope, &author.subject).await?;

        let ids: Vec<String> = spans
            .iter()
            .map(|span| chunk_id(&document.id, span.index))
            .collect();
        let texts: Vec<String> = spans.iter().map(|span| span.text.clone()).collect();
        let metadatas: Vec<HashMap<String, String>> = spans
            .iter()
            .map(|span| {
                let mut fields = chunk_metadata(document, span.index);
                // chunks only become queryable once the document flips to
                // indexed; the metadata copy reflects that final state
                fields.insert(
                    meta::STATUS.to_string(),
                    DocumentStatus::Indexed.as_str().to_string(),
                );
                fields
            })
            .collect();

        // write-after-all: every chunk write lands before the document
        // flips to indexed
        self.vectors
            .upsert(&collection, &ids, &vectors, &texts, &metadatas)
            .await?;

        let chunk_records: Vec<ChunkRecord> = spans
            .iter()
            .zip(&metadatas)
            .map(|(span, fields)| ChunkRecord {
                id: chunk_id(&document.id, span.index),
                document_id: document.id.clone(),
                chunk_index: span.index,
                text: span.text.clone(),
                offset_start: span.start,
                offset_end: span.end,
                metadata: fields.clone(),
            })
            .collect();
        self.documents.insert_chunks(chunk_records).await?;

        let total_tokens: u64 = spans
            .iter()
            .map(|span| span.text.split_whitespace().count() as u64)
            .sum();
        self.documents
            .finalize_document(&document.id, spans.len() as u32, total_tokens)
            .await?;

        info!(
            document_id = %document.id,
            chunks = spans.len(),
            tokens = total_tokens,
            "document indexed"
        );
        Ok(DocHandle {
            document_id: document.id.clone(),
            chunk_count: spans.len() as u32,
            total_tokens,
            cost_units: total_tokens,
            status: DocumentStatus::Indexed,
            outcome: IngestOutcome::Created,
        })
    }

    fn split(&self, sanitized: &str) -> Vec<ChunkSpan> {
        if sanitized.len() > self.streaming_threshold_bytes {
            let mut streaming = self.chunker.streaming();
            let mut spans = streaming.push(sanitized);
            spans.extend(streaming.finish());
            spans
        } else {
            self.chunker.split(sanitized)
        }
    }

    fn check_limits(&self, request: &AddDocumentRequest) -> Result<(), IngestError> {
        if request.title.chars().count() > self.limits.max_title_chars {
            return Err(IngestError::TitleTooLong(self.limits.max_title_chars));
        }
        if request.tags.len() > self.limits.max_tags {
            return Err(IngestError::TooManyTags(self.limits.max_tags));
        }
        if request.content.len() > self.limits.max_content_bytes {
            return Err(IngestError::ContentTooLarge(self.limits.max_content_bytes));
        }
        Ok(())
    }
}

fn already_exists(document: Document) -> DocHandle {
    DocHandle {
        document_id: document.id.clone(),
        chunk_count: document.chunk_count,
        total_tokens: document.total_tokens,
        cost_units: document.total_tokens,
        status: document.status,
        outcome: IngestOutcome::AlreadyExists,
    }
}

/// Recovers documents abandoned mid-ingest: anything stuck in
/// `processing` past the horizon is failed and its partial vector
/// entries purged by document-id prefix.
pub struct Reaper {
    documents: Arc<dyn DocumentStore>,
    vectors: Arc<dyn VectorIndex>,
    registry: Arc<CollectionRegistry>,
    horizon: ChronoDuration,
}

impl Reaper {
    pub fn new(
        documents: Arc<dyn DocumentStore>,
        vectors: Arc<dyn VectorIndex>,
        registry: Arc<CollectionRegistry>,
        horizon: ChronoDuration,
    ) -> Self {
        Self {
            documents,
            vectors,
            registry,
            horizon,
        }
    }

    pub async fn sweep(&self) -> Result<usize, IngestError> {
        let stuck = self.documents.stuck_processing(self.horizon).await?;
        let mut reaped = 0usize;

        for document in stuck {
            let collection = self.registry.resolve(&document.scope);
            let prefix = format!("{}:", document.id);
            match self.vectors.delete_prefix(&collection, &prefix).await {
                Ok(purged) => {
                    info!(document_id = %document.id, purged, "purged partial vector writes");
                }
                Err(VectorStoreError::MissingCollection(_)) => {}
                Err(error) => {
                    warn!(document_id = %document.id, error = %error, "purge failed, will retry next sweep");
                    continue;
                }
            }
            self.documents
                .update_status(
                    &document.id,
                    DocumentStatus::Failed,
                    Some("ingest abandoned past processing horizon".to_string()),
                )
                .await?;
            reaped += 1;
        }
        Ok(reaped)
    }

    pub fn spawn(self: Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                if let Err(error) = self.sweep().await {
                    warn!(error = %error, "reaper sweep failed");
                }
                tokio::time::sleep(interval).await;
            }
        })
    }
}
