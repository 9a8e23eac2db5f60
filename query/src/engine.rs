use crate::dsl::{
    Citation, QueryRequest, QueryResponse, QueryValidationError, RankedPassage,
};
use crate::rank::{fuse, query_tokens, score, BoostParams};
use cairn_core::analytics::{QueryRecord, RecordSink};
use cairn_core::auth::Principal;
use cairn_core::config::{LimitsConfig, RetrievalConfig};
use cairn_core::error::{CairnError, ErrorKind};
use cairn_core::model::{meta, DocumentId, DocumentStatus, TenantScope};
use chrono::Utc;
use ingestion::sanitizer::{SanitizeError, Sanitizer};
use providers::EmbeddingService;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use storage::cache::SecureCache;
use storage::docstore::{DocumentStore, KeywordHit, SafePattern};
use storage::registry::CollectionRegistry;
use storage::vector::{VectorHit, VectorIndex, WhereClause};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("caller may not read this scope")]
    AccessDenied,
    #[error("invalid query: {0}")]
    InvalidQuery(String),
    #[error("query failed: {0}")]
    QueryFailed(String),
}

impl CairnError for QueryError {
    fn kind(&self) -> ErrorKind {
        match self {
            QueryError::AccessDenied => ErrorKind::Access,
            QueryError::InvalidQuery(_) => ErrorKind::Validation,
            QueryError::QueryFailed(_) => ErrorKind::Storage,
        }
    }
}

impl From<QueryValidationError> for QueryError {
    fn from(error: QueryValidationError) -> Self {
        QueryError::InvalidQuery(error.to_string())
    }
}

impl From<SanitizeError> for QueryError {
    fn from(error: SanitizeError) -> Self {
        QueryError::InvalidQuery(error.to_string())
    }
}

/// Hybrid retrieval: access gate, query sanitization, semantic and
/// keyword search over the scoped collections, weighted fusion with
/// contextual re-ranking, and citation enrichment. Either search path
/// may fail alone and degrade the response; both failing fails the
/// query.
pub struct RetrievalEngine {
    registry: Arc<CollectionRegistry>,
    vectors: Arc<dyn VectorIndex>,
    documents: Arc<dyn DocumentStore>,
    embeddings: Arc<EmbeddingService>,
    sanitizer: Sanitizer,
    response_cache: Arc<SecureCache>,
    analytics: Option<Arc<dyn RecordSink>>,
    retrieval: RetrievalConfig,
    limits: LimitsConfig,
}

impl RetrievalEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<CollectionRegistry>,
        vectors: Arc<dyn VectorIndex>,
        documents: Arc<dyn DocumentStore>,
        embeddings: Arc<EmbeddingService>,
        sanitizer: Sanitizer,
        response_cache: Arc<SecureCache>,
        retrieval: RetrievalConfig,
        limits: LimitsConfig,
    ) -> Self {
        Self {
            registry,
            vectors,
            documents,
            embeddings,
            sanitizer,
            response_cache,
            analytics: None,
            retrieval,
            limits,
        }
    }

    pub fn with_analytics(mut self, sink: Arc<dyn RecordSink>) -> Self {
        self.analytics = Some(sink);
        self
    }

    pub async fn query(
        &self,
        principal: &Principal,
        request: QueryRequest,
    ) -> Result<QueryResponse, QueryError> {
        let started = Instant::now();
        request.validate(self.limits.max_query_chars, self.limits.max_top_k)?;

        // An explicitly requested scope the caller cannot read is an
        // error; under `all` the union shrinks to what they can see.
        let targeted = request.target_scopes();
        let scopes: Vec<TenantScope> = match request.scope {
            crate::dsl::QueryScope::All => targeted
                .into_iter()
                .filter(|scope| self.registry.can_access(principal, scope))
                .collect(),
            _ => {
                for scope in &targeted {
                    if !self.registry.can_access(principal, scope) {
                        return Err(QueryError::AccessDenied);
                    }
                }
                targeted
            }
        };
        if scopes.is_empty() {
            return Err(QueryError::AccessDenied);
        }

        let outcome = self.sanitizer.sanitize(&request.q)?;
        if !outcome.pii_classes.is_empty() {
            // queries with PII proceed; the classes are logged, never
            // echoed back
            warn!(classes = ?outcome.pii_classes, "pii classes present in query");
        }
        if outcome.is_empty() {
            return Err(QueryError::InvalidQuery(
                "query is empty after sanitization".to_string(),
            ));
        }
        let sanitized_q = outcome.sanitized;

        let cache_key = self.cache_key(&sanitized_q, &scopes, &request);
        if let Some(mut cached) = self.response_cache.get::<QueryResponse>(&cache_key).await {
            cached.cached = true;
            self.record_analytics(principal, &scopes, &sanitized_q, &cached, started);
            return Ok(cached);
        }

        let (mut user_filter, dropped) = match &request.filters {
            Some(raw) => WhereClause::sanitize(raw),
            None => (WhereClause::default(), Vec::new()),
        };
        if !dropped.is_empty() {
            warn!(dropped = dropped.len(), "dropped unsafe query filter entries");
        }
        if let Some(language) = &request.language {
            user_filter = user_filter.with_eq(meta::LANGUAGE, language.clone());
        }

        // A provider outage only degrades the semantic path.
        let query_vector = match self.embeddings.embed_one(&sanitized_q).await {
            Ok(vector) => Some(vector),
            Err(error) => {
                warn!(error = %error, "query embedding failed, degrading to keyword only");
                None
            }
        };

        // Semantic search across the scoped collections.
        let mut semantic_hits: Vec<VectorHit> = Vec::new();
        let mut semantic_failed = query_vector.is_none();
        if let Some(query_vector) = &query_vector {
            let per_collection_k = self.retrieval.top_k.div_ceil(scopes.len());
            match self
                .semantic_search(&scopes, query_vector, per_collection_k, &user_filter)
                .await
            {
                Ok(hits) => semantic_hits = hits,
                Err(error) => {
                    warn!(error = %error, "semantic path failed");
                    semantic_failed = true;
                }
            }
        }

        // Keyword search, scope by scope.
        let (keyword_hits, keyword_failed) =
            self.keyword_search(&scopes, &sanitized_q, &user_filter).await;

        if semantic_failed && keyword_failed {
            return Err(QueryError::QueryFailed(
                "both retrieval paths failed".to_string(),
            ));
        }
        let degraded = semantic_failed || keyword_failed;

        // Only chunks of indexed documents may contribute; the document
        // store is authoritative for status.
        let semantic_hits = self.drop_unindexed(semantic_hits).await;

        // Fuse, boost, apply the relevance floor.
        let candidates = fuse(semantic_hits, keyword_hits);
        let total_found = candidates.len();
        let scored = score(
            candidates,
            self.retrieval.hybrid_weights,
            BoostParams::from(&self.retrieval),
            &query_tokens(&sanitized_q),
            Utc::now(),
        );

        let min_score = request.min_score.unwrap_or(self.retrieval.min_relevance);
        let surviving: Vec<_> = scored
            .into_iter()
            .filter(|candidate| candidate.score >= min_score)
            .collect();
        let filtered = total_found - surviving.len();

        // Truncate and enrich.
        let results: Vec<RankedPassage> = surviving
            .into_iter()
            .take(self.retrieval.final_k.min(request.top_k))
            .map(|scored| {
                let citation = request
                    .include_citations
                    .then(|| build_citation(&scored.candidate.metadata));
                let metadata = request
                    .include_metadata
                    .then(|| metadata_subset(&scored.candidate.metadata));
                RankedPassage {
                    content: scored.candidate.text,
                    score: scored.score,
                    metadata,
                    citation,
                    source: scored.source,
                }
            })
            .collect();

        let response = QueryResponse {
            total_found,
            filtered,
            collections_searched: scopes.len(),
            duration_ms: started.elapsed().as_millis() as u64,
            cached: false,
            degraded,
            results,
        };

        // Only clean, non-degraded responses are worth replaying.
        if !degraded {
            self.response_cache
                .set(
                    &cache_key,
                    &response,
                    Some(Duration::from_secs(self.retrieval.response_cache_ttl_secs)),
                )
                .await;
        }

        self.record_analytics(principal, &scopes, &sanitized_q, &response, started);
        info!(
            results = response.results.len(),
            degraded = response.degraded,
            duration_ms = response.duration_ms,
            "query executed"
        );
        Ok(response)
    }

    async fn semantic_search(
        &self,
        scopes: &[TenantScope],
        query_vector: &[f32],
        per_collection_k: usize,
        user_filter: &WhereClause,
    ) -> Result<Vec<VectorHit>, String> {
        let mut join_set = tokio::task::JoinSet::new();
        for scope in scopes {
            let name = self.registry.resolve(scope);
            let vectors = self.vectors.clone();
            let filter = scoped_filter(user_filter.clone(), scope);
            let query_vector = query_vector.to_vec();
            join_set.spawn(async move {
                vectors
                    .query(&name, &query_vector, per_collection_k, &filter)
                    .await
            });
        }

        let mut hits = Vec::new();
        let mut failures = Vec::new();
        let mut collections = 0usize;
        while let Some(joined) = join_set.join_next().await {
            collections += 1;
            match joined {
                Ok(Ok(mut scoped_hits)) => hits.append(&mut scoped_hits),
                // a scope that was never written to has no collection yet
                Ok(Err(storage::vector::VectorStoreError::MissingCollection(_))) => {}
                Ok(Err(error)) => failures.push(error.to_string()),
                Err(join_error) => failures.push(join_error.to_string()),
            }
        }

        if !failures.is_empty() && failures.len() == collections {
            return Err(failures.join("; "));
        }
        Ok(hits)
    }

    async fn keyword_search(
        &self,
        scopes: &[TenantScope],
        sanitized_q: &str,
        user_filter: &WhereClause,
    ) -> (Vec<KeywordHit>, bool) {
        let Some(pattern) = SafePattern::build(sanitized_q) else {
            return (Vec::new(), false);
        };

        let mut hits = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        let mut failures = 0usize;
        for scope in scopes {
            let filter = scoped_filter(user_filter.clone(), scope);
            match self
                .documents
                .text_query(&pattern, &filter, self.retrieval.top_k)
                .await
            {
                Ok(scoped_hits) => {
                    for hit in scoped_hits {
                        if seen.insert(hit.chunk.id.clone()) {
                            hits.push(hit);
                        }
                    }
                }
                Err(error) => {
                    warn!(error = %error, "keyword path failed for scope");
                    failures += 1;
                }
            }
        }
        (hits, failures == scopes.len())
    }

    /// C9 is authoritative for document status: semantic hits whose
    /// document is not indexed are dropped.
    async fn drop_unindexed(&self, hits: Vec<VectorHit>) -> Vec<VectorHit> {
        let mut status_by_doc: HashMap<String, bool> = HashMap::new();
        let mut out = Vec::with_capacity(hits.len());

        for hit in hits {
            let Some(raw_id) = hit.metadata.get(meta::DOCUMENT_ID).cloned() else {
                continue;
            };
            let indexed = match status_by_doc.get(&raw_id) {
                Some(known) => *known,
                None => {
                    let document_id = DocumentId::from_content_hash(&raw_id);
                    let indexed = matches!(
                        self.documents.get_document(&document_id).await,
                        Ok(Some(document)) if document.status == DocumentStatus::Indexed
                    );
                    status_by_doc.insert(raw_id.clone(), indexed);
                    indexed
                }
            };
            if indexed {
                out.push(hit);
            }
        }
        out
    }

    fn cache_key(
        &self,
        sanitized_q: &str,
        scopes: &[TenantScope],
        request: &QueryRequest,
    ) -> String {
        let mut hasher = Sha256::new();
        hasher.update(sanitized_q.as_bytes());
        for scope in scopes {
            hasher.update(scope.tenant_key().as_bytes());
        }
        hasher.update(request.top_k.to_le_bytes());
        hasher.update(
            request
                .min_score
                .unwrap_or(self.retrieval.min_relevance)
                .to_le_bytes(),
        );
        format!("{:x}", hasher.finalize())
    }

    fn record_analytics(
        &self,
        principal: &Principal,
        scopes: &[TenantScope],
        sanitized_q: &str,
        response: &QueryResponse,
        started: Instant,
    ) {
        if let Some(sink) = &self.analytics {
            let tenant = scopes
                .iter()
                .map(TenantScope::tenant_key)
                .collect::<Vec<_>>()
                .join(",");
            let record = QueryRecord::new(
                tenant,
                principal.subject.clone(),
                sanitized_q,
                started.elapsed().as_millis() as u64,
                response.results.len(),
            )
            .with_options(serde_json::json!({
                "cached": response.cached,
                "degraded": response.degraded,
                "collections_searched": response.collections_searched,
            }));
            if let Err(error) = sink.record(record) {
                warn!(error = %error, "failed to record query analytics");
            }
        }
    }
}

/// Engine-injected tenant constraints; user filters never widen them.
fn scoped_filter(mut filter: WhereClause, scope: &TenantScope) -> WhereClause {
    filter = filter.with_eq(meta::STATUS, DocumentStatus::Indexed.as_str());
    filter = filter.with_eq(meta::TYPE, scope.kind());
    if let Some(ws) = scope.workspace_id() {
        filter = filter.with_eq(meta::WORKSPACE_ID, ws);
    }
    if let Some(pr) = scope.project_id() {
        filter = filter.with_eq(meta::PROJECT_ID, pr);
    }
    filter
}

fn build_citation(metadata: &HashMap<String, String>) -> Citation {
    let document_id = metadata
        .get(meta::DOCUMENT_ID)
        .cloned()
        .unwrap_or_default();
    let chunk_index = metadata
        .get(meta::CHUNK_INDEX)
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(0);
    Citation {
        title: metadata.get(meta::TITLE).cloned().unwrap_or_default(),
        scope: metadata.get(meta::TYPE).cloned().unwrap_or_default(),
        created_at: metadata.get(meta::CREATED_AT).cloned().unwrap_or_default(),
        deep_link: format!("cairn://{}/{}", document_id, chunk_index),
        document_id,
        chunk_index,
    }
}

const METADATA_SUBSET: &[&str] = &[
    meta::TITLE,
    meta::LANGUAGE,
    meta::TAGS,
    meta::TYPE,
    meta::WORKSPACE_ID,
    meta::PROJECT_ID,
    meta::CREATED_AT,
    meta::DOCUMENT_ID,
    meta::CHUNK_INDEX,
];

fn metadata_subset(metadata: &HashMap<String, String>) -> HashMap<String, String> {
    METADATA_SUBSET
        .iter()
        .filter_map(|key| {
            metadata
                .get(*key)
                .map(|value| (key.to_string(), value.clone()))
        })
        .collect()
}
