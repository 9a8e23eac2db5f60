use crate::vault::ProviderKeyRecord;
use crate::vector::WhereClause;
use async_trait::async_trait;
use cairn_core::model::{ChunkRecord, Document, DocumentId, DocumentStatus};
use chrono::{DateTime, Duration, Utc};
use regex::Regex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tokio::sync::RwLock;

const MAX_PATTERN_TOKENS: usize = 16;
const BM25_K1: f32 = 1.2;
const BM25_B: f32 = 0.75;

#[derive(Debug, Error)]
pub enum DocStoreError {
    #[error("document with the same content hash already exists: {existing}")]
    DuplicateHash { existing: DocumentId },
    #[error("document not found")]
    NotFound,
    #[error("provider key not found: {0}")]
    MissingProviderKey(String),
    #[error("document store unavailable: {0}")]
    Unavailable(String),
}

impl cairn_core::error::CairnError for DocStoreError {
    fn kind(&self) -> cairn_core::error::ErrorKind {
        match self {
            DocStoreError::DuplicateHash { .. } => cairn_core::error::ErrorKind::Duplicate,
            _ => cairn_core::error::ErrorKind::Storage,
        }
    }
}

/// Keyword query input. Tokens are regex-escaped, capped, and joined with
/// alternation; a raw query string never reaches the regex engine, so
/// pathological inputs cannot trigger catastrophic backtracking.
#[derive(Debug, Clone)]
pub struct SafePattern {
    tokens: Vec<String>,
    regex: Regex,
}

impl SafePattern {
    pub fn build(input: &str) -> Option<Self> {
        let mut tokens: Vec<String> = input
            .split(|c: char| !c.is_alphanumeric() && c != '_')
            .filter(|token| !token.is_empty())
            .map(|token| token.to_lowercase())
            .collect();
        tokens.dedup();
        tokens.truncate(MAX_PATTERN_TOKENS);
        if tokens.is_empty() {
            return None;
        }

        let escaped: Vec<String> = tokens.iter().map(|token| regex::escape(token)).collect();
        let pattern = format!(r"(?i)\b(?:{})\b", escaped.join("|"));
        let regex = Regex::new(&pattern).ok()?;
        Some(Self { tokens, regex })
    }

    pub fn tokens(&self) -> &[String] {
        &self.tokens
    }

    /// Per-token occurrence counts within a text.
    fn term_frequencies(&self, text: &str) -> HashMap<String, usize> {
        let mut counts = HashMap::new();
        for found in self.regex.find_iter(text) {
            *counts.entry(found.as_str().to_lowercase()).or_insert(0) += 1;
        }
        counts
    }
}

#[derive(Debug, Clone)]
pub struct KeywordHit {
    pub chunk: ChunkRecord,
    /// BM25-like score normalized into [0, 1] over the result set.
    pub lexical_score: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BucketRecord {
    pub name: String,
    pub access_scope: String,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn insert_document(&self, document: Document) -> Result<(), DocStoreError>;

    async fn get_document(&self, id: &DocumentId) -> Result<Option<Document>, DocStoreError>;

    async fn find_by_hash(&self, content_hash: &str) -> Result<Option<Document>, DocStoreError>;

    async fn update_status(
        &self,
        id: &DocumentId,
        status: DocumentStatus,
        error: Option<String>,
    ) -> Result<(), DocStoreError>;

    /// Flip to indexed and record final counts in one write.
    async fn finalize_document(
        &self,
        id: &DocumentId,
        chunk_count: u32,
        total_tokens: u64,
    ) -> Result<(), DocStoreError>;

    async fn insert_chunks(&self, chunks: Vec<ChunkRecord>) -> Result<(), DocStoreError>;

    async fn chunks_of(&self, id: &DocumentId) -> Result<Vec<ChunkRecord>, DocStoreError>;

    async fn delete_document(&self, id: &DocumentId) -> Result<(), DocStoreError>;

    /// Top-k chunks of indexed documents by lexical score.
    async fn text_query(
        &self,
        pattern: &SafePattern,
        filter: &WhereClause,
        top_k: usize,
    ) -> Result<Vec<KeywordHit>, DocStoreError>;

    async fn stuck_processing(&self, older_than: Duration) -> Result<Vec<Document>, DocStoreError>;

    async fn ensure_bucket(&self, bucket: BucketRecord) -> Result<(), DocStoreError>;

    async fn get_bucket(&self, name: &str) -> Result<Option<BucketRecord>, DocStoreError>;

    async fn put_provider_key(&self, record: ProviderKeyRecord) -> Result<(), DocStoreError>;

    async fn get_provider_key(
        &self,
        provider_id: &str,
    ) -> Result<Option<ProviderKeyRecord>, DocStoreError>;

    /// Bump usage counters for a retrieved key in one write.
    async fn touch_provider_key(&self, provider_id: &str) -> Result<(), DocStoreError>;
}

#[derive(Default)]
struct StoreState {
    documents: HashMap<DocumentId, Document>,
    hash_index: HashMap<String, DocumentId>,
    chunks: HashMap<DocumentId, Vec<ChunkRecord>>,
    buckets: HashMap<String, BucketRecord>,
    provider_keys: HashMap<String, ProviderKeyRecord>,
}

/// In-memory reference backend for the document store adapter. The unique
/// content-hash index is enforced on insert, matching the first-start
/// index creation a real backend would perform.
#[derive(Default)]
pub struct InMemoryDocumentStore {
    state: RwLock<StoreState>,
    unavailable: AtomicBool,
}

impl InMemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), DocStoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(DocStoreError::Unavailable("simulated outage".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn insert_document(&self, document: Document) -> Result<(), DocStoreError> {
        self.check_available()?;
        let mut state = self.state.write().await;
        if let Some(existing) = state.hash_index.get(&document.content_hash) {
            return Err(DocStoreError::DuplicateHash {
                existing: existing.clone(),
            });
        }
        state
            .hash_index
            .insert(document.content_hash.clone(), document.id.clone());
        state.documents.insert(document.id.clone(), document);
        Ok(())
    }

    async fn get_document(&self, id: &DocumentId) -> Result<Option<Document>, DocStoreError> {
        self.check_available()?;
        let state = self.state.read().await;
        Ok(state.documents.get(id).cloned())
    }

    async fn find_by_hash(&self, content_hash: &str) -> Result<Option<Document>, DocStoreError> {
        self.check_available()?;
        let state = self.state.read().await;
        Ok(state
            .hash_index
            .get(content_hash)
            .and_then(|id| state.documents.get(id))
            .cloned())
    }

    async fn update_status(
        &self,
        id: &DocumentId,
        status: DocumentStatus,
        error: Option<String>,
    ) -> Result<(), DocStoreError> {
        self.check_available()?;
        let mut state = self.state.write().await;
        let document = state.documents.get_mut(id).ok_or(DocStoreError::NotFound)?;
        document.status = status;
        document.error = error;
        document.updated_at = Utc::now();
        Ok(())
    }

    async fn finalize_document(
        &self,
        id: &DocumentId,
        chunk_count: u32,
        total_tokens: u64,
    ) -> Result<(), DocStoreError> {
        self.check_available()?;
        let mut state = self.state.write().await;
        let document = state.documents.get_mut(id).ok_or(DocStoreError::NotFound)?;
        document.status = DocumentStatus::Indexed;
        document.error = None;
        document.chunk_count = chunk_count;
        document.total_tokens = total_tokens;
        document.updated_at = Utc::now();
        Ok(())
    }

    async fn insert_chunks(&self, chunks: Vec<ChunkRecord>) -> Result<(), DocStoreError> {
        self.check_available()?;
        let mut state = self.state.write().await;
        for chunk in chunks {
            state
                .chunks
                .entry(chunk.document_id.clone())
                .or_default()
                .push(chunk);
        }
        Ok(())
    }

    async fn chunks_of(&self, id: &DocumentId) -> Result<Vec<ChunkRecord>, DocStoreError> {
        self.check_available()?;
        let state = self.state.read().await;
        Ok(state.chunks.get(id).cloned().unwrap_or_default())
    }

    async fn delete_document(&self, id: &DocumentId) -> Result<(), DocStoreError> {
        self.check_available()?;
        let mut state = self.state.write().await;
        if let Some(document) = state.documents.remove(id) {
            state.hash_index.remove(&document.content_hash);
        }
        state.chunks.remove(id);
        Ok(())
    }

    async fn text_query(
        &self,
        pattern: &SafePattern,
        filter: &WhereClause,
        top_k: usize,
    ) -> Result<Vec<KeywordHit>, DocStoreError> {
        self.check_available()?;
        let state = self.state.read().await;

        let indexed_chunks: Vec<&ChunkRecord> = state
            .documents
            .values()
            .filter(|document| document.status == DocumentStatus::Indexed)
            .flat_map(|document| {
                state
                    .chunks
                    .get(&document.id)
                    .map(|chunks| chunks.iter())
                    .into_iter()
                    .flatten()
            })
            .collect();

        if indexed_chunks.is_empty() {
            return Ok(Vec::new());
        }

        let corpus_size = indexed_chunks.len() as f32;
        let avg_len = indexed_chunks
            .iter()
            .map(|chunk| chunk.text.split_whitespace().count())
            .sum::<usize>() as f32
            / corpus_size;

        // Document frequency per token across the indexed corpus.
        let mut doc_freq: HashMap<String, usize> = HashMap::new();
        let mut chunk_tfs: Vec<(usize, HashMap<String, usize>)> = Vec::new();
        for (position, chunk) in indexed_chunks.iter().enumerate() {
            let tf = pattern.term_frequencies(&chunk.text);
            for token in tf.keys() {
                *doc_freq.entry(token.clone()).or_insert(0) += 1;
            }
            if !tf.is_empty() {
                chunk_tfs.push((position, tf));
            }
        }

        let mut scored: Vec<(usize, f32)> = chunk_tfs
            .into_iter()
            .filter(|(position, _)| filter.matches(&indexed_chunks[*position].metadata))
            .map(|(position, tf)| {
                let chunk = indexed_chunks[position];
                let chunk_len = chunk.text.split_whitespace().count() as f32;
                let score: f32 = tf
                    .iter()
                    .map(|(token, count)| {
                        let df = doc_freq.get(token).copied().unwrap_or(0) as f32;
                        let idf = ((corpus_size - df + 0.5) / (df + 0.5) + 1.0).ln();
                        let tf = *count as f32;
                        let denom =
                            tf + BM25_K1 * (1.0 - BM25_B + BM25_B * chunk_len / avg_len.max(1.0));
                        idf * tf * (BM25_K1 + 1.0) / denom
                    })
                    .sum();
                (position, score)
            })
            .filter(|(_, score)| *score > 0.0)
            .collect();

        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(top_k);

        let max_score = scored.first().map(|(_, s)| *s).unwrap_or(1.0).max(f32::EPSILON);
        Ok(scored
            .into_iter()
            .map(|(position, score)| KeywordHit {
                chunk: indexed_chunks[position].clone(),
                lexical_score: score / max_score,
            })
            .collect())
    }

    async fn stuck_processing(&self, older_than: Duration) -> Result<Vec<Document>, DocStoreError> {
        self.check_available()?;
        let cutoff = Utc::now() - older_than;
        let state = self.state.read().await;
        Ok(state
            .documents
            .values()
            .filter(|document| {
                document.status == DocumentStatus::Processing && document.updated_at < cutoff
            })
            .cloned()
            .collect())
    }

    async fn ensure_bucket(&self, bucket: BucketRecord) -> Result<(), DocStoreError> {
        self.check_available()?;
        let mut state = self.state.write().await;
        state.buckets.entry(bucket.name.clone()).or_insert(bucket);
        Ok(())
    }

    async fn get_bucket(&self, name: &str) -> Result<Option<BucketRecord>, DocStoreError> {
        self.check_available()?;
        let state = self.state.read().await;
        Ok(state.buckets.get(name).cloned())
    }

    async fn put_provider_key(&self, record: ProviderKeyRecord) -> Result<(), DocStoreError> {
        self.check_available()?;
        let mut state = self.state.write().await;
        state
            .provider_keys
            .insert(record.provider_id.clone(), record);
        Ok(())
    }

    async fn get_provider_key(
        &self,
        provider_id: &str,
    ) -> Result<Option<ProviderKeyRecord>, DocStoreError> {
        self.check_available()?;
        let state = self.state.read().await;
        Ok(state.provider_keys.get(provider_id).cloned())
    }

    async fn touch_provider_key(&self, provider_id: &str) -> Result<(), DocStoreError> {
        self.check_available()?;
        let mut state = self.state.write().await;
        let record = state
            .provider_keys
            .get_mut(provider_id)
            .ok_or_else(|| DocStoreError::MissingProviderKey(provider_id.to_string()))?;
        record.usage_count += 1;
        record.last_used = Some(Utc::now());
        Ok(())
    }
}
