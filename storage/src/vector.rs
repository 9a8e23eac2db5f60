use async_trait::async_trait;
use cairn_core::model::meta;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tracing::warn;

/// Closed operator set for where-clause filters. Anything else is dropped
/// during sanitization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOp {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
    Nin,
}

impl FilterOp {
    pub fn parse(token: &str) -> Option<Self> {
        match token {
            "$eq" => Some(Self::Eq),
            "$ne" => Some(Self::Ne),
            "$gt" => Some(Self::Gt),
            "$gte" => Some(Self::Gte),
            "$lt" => Some(Self::Lt),
            "$lte" => Some(Self::Lte),
            "$in" => Some(Self::In),
            "$nin" => Some(Self::Nin),
            _ => None,
        }
    }
}

/// Closed field set shared with the document store.
pub const ALLOWED_FILTER_FIELDS: &[&str] = &[
    meta::TYPE,
    meta::CATEGORY,
    meta::STATUS,
    meta::TAGS,
    meta::LANGUAGE,
    meta::CREATED_AT,
    meta::UPDATED_AT,
    meta::WORKSPACE_ID,
    meta::PROJECT_ID,
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldFilter {
    pub field: String,
    pub op: FilterOp,
    pub values: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WhereClause {
    pub filters: Vec<FieldFilter>,
}

impl WhereClause {
    pub fn with_eq(mut self, field: impl Into<String>, value: impl Into<String>) -> Self {
        self.filters.push(FieldFilter {
            field: field.into(),
            op: FilterOp::Eq,
            values: vec![value.into()],
        });
        self
    }

    /// Build a clause from caller-supplied JSON, admitting only the closed
    /// operator and field sets. Dropped entries are returned as warnings.
    pub fn sanitize(raw: &serde_json::Value) -> (Self, Vec<String>) {
        let mut clause = WhereClause::default();
        let mut dropped = Vec::new();

        let Some(object) = raw.as_object() else {
            if !raw.is_null() {
                dropped.push("filter root must be an object".to_string());
            }
            return (clause, dropped);
        };

        for (field, spec) in object {
            if !ALLOWED_FILTER_FIELDS.contains(&field.as_str()) {
                dropped.push(format!("field not allowed: {}", field));
                continue;
            }

            match spec {
                serde_json::Value::Object(ops) => {
                    for (op_token, operand) in ops {
                        let Some(op) = FilterOp::parse(op_token) else {
                            dropped.push(format!("operator not allowed: {}.{}", field, op_token));
                            continue;
                        };
                        clause.filters.push(FieldFilter {
                            field: field.clone(),
                            op,
                            values: operand_values(operand),
                        });
                    }
                }
                // Bare scalar means equality, matching the store's
                // shorthand form.
                other => clause.filters.push(FieldFilter {
                    field: field.clone(),
                    op: FilterOp::Eq,
                    values: operand_values(other),
                }),
            }
        }

        for reason in &dropped {
            warn!(reason = reason.as_str(), "dropped unsafe filter entry");
        }
        (clause, dropped)
    }

    pub fn matches(&self, metadata: &HashMap<String, String>) -> bool {
        self.filters.iter().all(|filter| filter.matches(metadata))
    }
}

impl FieldFilter {
    fn matches(&self, metadata: &HashMap<String, String>) -> bool {
        let actual = metadata.get(&self.field);
        match self.op {
            FilterOp::Eq => actual.is_some_and(|v| self.values.first().is_some_and(|e| v == e)),
            FilterOp::Ne => !actual.is_some_and(|v| self.values.first().is_some_and(|e| v == e)),
            FilterOp::Gt | FilterOp::Gte | FilterOp::Lt | FilterOp::Lte => {
                let (Some(actual), Some(expected)) = (actual, self.values.first()) else {
                    return false;
                };
                compare(actual, expected).is_some_and(|ordering| match self.op {
                    FilterOp::Gt => ordering.is_gt(),
                    FilterOp::Gte => ordering.is_ge(),
                    FilterOp::Lt => ordering.is_lt(),
                    FilterOp::Lte => ordering.is_le(),
                    _ => unreachable!(),
                })
            }
            FilterOp::In => actual.is_some_and(|v| self.values.iter().any(|e| e == v)),
            FilterOp::Nin => !actual.is_some_and(|v| self.values.iter().any(|e| e == v)),
        }
    }
}

fn compare(actual: &str, expected: &str) -> Option<std::cmp::Ordering> {
    match (actual.parse::<f64>(), expected.parse::<f64>()) {
        (Ok(a), Ok(b)) => a.partial_cmp(&b),
        _ => Some(actual.cmp(expected)),
    }
}

fn operand_values(operand: &serde_json::Value) -> Vec<String> {
    match operand {
        serde_json::Value::Array(items) => items.iter().map(scalar_to_string).collect(),
        other => vec![scalar_to_string(other)],
    }
}

fn scalar_to_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct VectorHit {
    pub id: String,
    pub text: String,
    pub metadata: HashMap<String, String>,
    /// Normalized similarity in [0, 1]. Cosine backends report
    /// 1 − distance; Euclidean backends convert via 1 / (1 + d). One
    /// convention per process; nothing above this trait sees a distance.
    pub similarity: f32,
}

#[derive(Debug, Error)]
pub enum VectorStoreError {
    #[error("collection not found: {0}")]
    MissingCollection(String),
    #[error("dimension mismatch: collection is {expected}, vector is {got}")]
    DimensionMismatch { expected: usize, got: usize },
    #[error("upsert arrays must be the same length")]
    ShapeMismatch,
    #[error("vector store unavailable: {0}")]
    Unavailable(String),
}

impl cairn_core::error::CairnError for VectorStoreError {
    fn kind(&self) -> cairn_core::error::ErrorKind {
        cairn_core::error::ErrorKind::Storage
    }
}

#[async_trait]
pub trait VectorIndex: Send + Sync {
    async fn ensure_collection(
        &self,
        name: &str,
        metadata: HashMap<String, String>,
    ) -> Result<(), VectorStoreError>;

    async fn upsert(
        &self,
        name: &str,
        ids: &[String],
        vectors: &[Vec<f32>],
        texts: &[String],
        metadatas: &[HashMap<String, String>],
    ) -> Result<(), VectorStoreError>;

    async fn query(
        &self,
        name: &str,
        query_vector: &[f32],
        top_k: usize,
        filter: &WhereClause,
    ) -> Result<Vec<VectorHit>, VectorStoreError>;

    async fn delete(&self, name: &str, ids: &[String]) -> Result<(), VectorStoreError>;

    /// Remove every entry whose id starts with the prefix. Used by the
    /// ingest reaper to purge abandoned documents.
    async fn delete_prefix(&self, name: &str, prefix: &str) -> Result<usize, VectorStoreError>;

    async fn count(&self, name: &str) -> Result<usize, VectorStoreError>;

    async fn list_collections(&self) -> Result<Vec<String>, VectorStoreError>;
}

struct StoredVector {
    vector: Vec<f32>,
    text: String,
    metadata: HashMap<String, String>,
}

struct Collection {
    metadata: HashMap<String, String>,
    entries: HashMap<String, StoredVector>,
    dimension: Option<usize>,
}

/// In-memory cosine-distance backend: the reference implementation behind
/// the adapter trait.
#[derive(Default)]
pub struct InMemoryVectorIndex {
    collections: DashMap<String, Collection>,
    unavailable: AtomicBool,
}

impl InMemoryVectorIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an outage; queries and writes fail with `Unavailable`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), VectorStoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(VectorStoreError::Unavailable("simulated outage".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl VectorIndex for InMemoryVectorIndex {
    async fn ensure_collection(
        &self,
        name: &str,
        metadata: HashMap<String, String>,
    ) -> Result<(), VectorStoreError> {
        self.check_available()?;
        self.collections
            .entry(name.to_string())
            .or_insert_with(|| Collection {
                metadata,
                entries: HashMap::new(),
                dimension: None,
            });
        Ok(())
    }

    async fn upsert(
        &self,
        name: &str,
        ids: &[String],
        vectors: &[Vec<f32>],
        texts: &[String],
        metadatas: &[HashMap<String, String>],
    ) -> Result<(), VectorStoreError> {
        self.check_available()?;
        if ids.len() != vectors.len() || ids.len() != texts.len() || ids.len() != metadatas.len() {
            return Err(VectorStoreError::ShapeMismatch);
        }

        let mut collection = self
            .collections
            .get_mut(name)
            .ok_or_else(|| VectorStoreError::MissingCollection(name.to_string()))?;

        for (((id, vector), text), metadata) in
            ids.iter().zip(vectors).zip(texts).zip(metadatas)
        {
            match collection.dimension {
                Some(expected) if expected != vector.len() => {
                    return Err(VectorStoreError::DimensionMismatch {
                        expected,
                        got: vector.len(),
                    });
                }
                None => collection.dimension = Some(vector.len()),
                _ => {}
            }
            collection.entries.insert(
                id.clone(),
                StoredVector {
                    vector: vector.clone(),
                    text: text.clone(),
                    metadata: metadata.clone(),
                },
            );
        }
        Ok(())
    }

    async fn query(
        &self,
        name: &str,
        query_vector: &[f32],
        top_k: usize,
        filter: &WhereClause,
    ) -> Result<Vec<VectorHit>, VectorStoreError> {
        self.check_available()?;
        let collection = self
            .collections
            .get(name)
            .ok_or_else(|| VectorStoreError::MissingCollection(name.to_string()))?;

        let mut hits: Vec<VectorHit> = collection
            .entries
            .iter()
            .filter(|(_, stored)| filter.matches(&stored.metadata))
            .filter_map(|(id, stored)| {
                cosine_similarity(query_vector, &stored.vector).map(|cos| VectorHit {
                    id: id.clone(),
                    text: stored.text.clone(),
                    metadata: stored.metadata.clone(),
                    // native metric is cosine distance d = 1 − cos;
                    // similarity = 1 − d, clamped into [0, 1].
                    similarity: cos.clamp(0.0, 1.0),
                })
            })
            .collect();

        hits.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        hits.truncate(top_k);
        Ok(hits)
    }

    async fn delete(&self, name: &str, ids: &[String]) -> Result<(), VectorStoreError> {
        self.check_available()?;
        let mut collection = self
            .collections
            .get_mut(name)
            .ok_or_else(|| VectorStoreError::MissingCollection(name.to_string()))?;
        for id in ids {
            collection.entries.remove(id);
        }
        Ok(())
    }

    async fn delete_prefix(&self, name: &str, prefix: &str) -> Result<usize, VectorStoreError> {
        self.check_available()?;
        let mut collection = self
            .collections
            .get_mut(name)
            .ok_or_else(|| VectorStoreError::MissingCollection(name.to_string()))?;
        let before = collection.entries.len();
        collection.entries.retain(|id, _| !id.starts_with(prefix));
        Ok(before - collection.entries.len())
    }

    async fn count(&self, name: &str) -> Result<usize, VectorStoreError> {
        self.check_available()?;
        let collection = self
            .collections
            .get(name)
            .ok_or_else(|| VectorStoreError::MissingCollection(name.to_string()))?;
        Ok(collection.entries.len())
    }

    async fn list_collections(&self) -> Result<Vec<String>, VectorStoreError> {
        self.check_available()?;
        let mut names: Vec<String> = self
            .collections
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        names.sort();
        Ok(names)
    }
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> Option<f32> {
    if a.len() != b.len() || a.is_empty() {
        return None;
    }

    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return Some(0.0);
    }

    Some(dot / (norm_a * norm_b))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta_with(field: &str, value: &str) -> HashMap<String, String> {
        HashMap::from([(field.to_string(), value.to_string())])
    }

    #[tokio::test]
    async fn query_ranks_by_similarity() {
        let index = InMemoryVectorIndex::new();
        index
            .ensure_collection("c1", HashMap::new())
            .await
            .unwrap();
        index
            .upsert(
                "c1",
                &["a".to_string(), "b".to_string(), "c".to_string()],
                &[
                    vec![1.0, 0.0, 0.0],
                    vec![0.0, 1.0, 0.0],
                    vec![0.9, 0.1, 0.0],
                ],
                &["ta".to_string(), "tb".to_string(), "tc".to_string()],
                &[HashMap::new(), HashMap::new(), HashMap::new()],
            )
            .await
            .unwrap();

        let hits = index
            .query("c1", &[1.0, 0.0, 0.0], 2, &WhereClause::default())
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].id, "a");
        assert_eq!(hits[1].id, "c");
        assert!(hits.iter().all(|h| (0.0..=1.0).contains(&h.similarity)));
    }

    #[tokio::test]
    async fn dimension_mismatch_is_rejected() {
        let index = InMemoryVectorIndex::new();
        index
            .ensure_collection("c1", HashMap::new())
            .await
            .unwrap();
        index
            .upsert(
                "c1",
                &["a".to_string()],
                &[vec![1.0, 0.0]],
                &["t".to_string()],
                &[HashMap::new()],
            )
            .await
            .unwrap();

        let result = index
            .upsert(
                "c1",
                &["b".to_string()],
                &[vec![1.0, 0.0, 0.0]],
                &["t".to_string()],
                &[HashMap::new()],
            )
            .await;
        assert!(matches!(
            result,
            Err(VectorStoreError::DimensionMismatch { expected: 2, got: 3 })
        ));
    }

    #[tokio::test]
    async fn delete_prefix_purges_a_document() {
        let index = InMemoryVectorIndex::new();
        index
            .ensure_collection("c1", HashMap::new())
            .await
            .unwrap();
        index
            .upsert(
                "c1",
                &[
                    "doc1:00000".to_string(),
                    "doc1:00001".to_string(),
                    "doc2:00000".to_string(),
                ],
                &[vec![1.0], vec![0.5], vec![0.2]],
                &["a".to_string(), "b".to_string(), "c".to_string()],
                &[HashMap::new(), HashMap::new(), HashMap::new()],
            )
            .await
            .unwrap();

        let removed = index.delete_prefix("c1", "doc1:").await.unwrap();
        assert_eq!(removed, 2);
        assert_eq!(index.count("c1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn filters_apply_before_ranking() {
        let index = InMemoryVectorIndex::new();
        index
            .ensure_collection("c1", HashMap::new())
            .await
            .unwrap();
        index
            .upsert(
                "c1",
                &["a".to_string(), "b".to_string()],
                &[vec![1.0, 0.0], vec![1.0, 0.0]],
                &["a".to_string(), "b".to_string()],
                &[
                    meta_with(meta::WORKSPACE_ID, "w1"),
                    meta_with(meta::WORKSPACE_ID, "w2"),
                ],
            )
            .await
            .unwrap();

        let clause = WhereClause::default().with_eq(meta::WORKSPACE_ID, "w1");
        let hits = index.query("c1", &[1.0, 0.0], 10, &clause).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "a");
    }

    #[test]
    fn sanitize_drops_unknown_operators_and_fields() {
        let raw = serde_json::json!({
            "status": { "$eq": "indexed" },
            "language": "en",
            "tags": { "$in": ["design", "atoms"] },
            "secret_field": { "$eq": "x" },
            "status2": "y",
            "created_at": { "$where": "sleep(1000)" },
        });
        let (clause, dropped) = WhereClause::sanitize(&raw);

        assert_eq!(clause.filters.len(), 3);
        assert_eq!(dropped.len(), 3);
        assert!(dropped.iter().any(|d| d.contains("secret_field")));
        assert!(dropped.iter().any(|d| d.contains("$where")));
    }

    #[test]
    fn range_filters_compare_numerically() {
        let clause = WhereClause {
            filters: vec![FieldFilter {
                field: "created_at".to_string(),
                op: FilterOp::Gte,
                values: vec!["9".to_string()],
            }],
        };
        assert!(clause.matches(&meta_with("created_at", "10")));
        assert!(!clause.matches(&meta_with("created_at", "8")));
    }

    #[tokio::test]
    async fn unavailable_index_fails_all_calls() {
        let index = InMemoryVectorIndex::new();
        index
            .ensure_collection("c1", HashMap::new())
            .await
            .unwrap();
        index.set_unavailable(true);

        assert!(matches!(
            index.query("c1", &[1.0], 5, &WhereClause::default()).await,
            Err(VectorStoreError::Unavailable(_))
        ));
    }
}
