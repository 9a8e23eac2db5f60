use crate::dsl::ResultSource;
use cairn_core::config::{HybridWeights, RetrievalConfig};
use cairn_core::model::meta;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use storage::docstore::KeywordHit;
use storage::vector::VectorHit;

/// Stable fusion key: two hits are the same passage when their text
/// hashes to the same prefix, regardless of which index produced them.
pub fn chunk_key(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let digest = hasher.finalize();
    digest[..8].iter().map(|b| format!("{:02x}", b)).collect()
}

#[derive(Debug, Clone)]
pub struct Candidate {
    pub key: String,
    pub text: String,
    pub metadata: HashMap<String, String>,
    pub similarity: Option<f32>,
    pub lexical: Option<f32>,
    pub created_at: Option<DateTime<Utc>>,
}

impl Candidate {
    pub fn source(&self) -> ResultSource {
        match (self.similarity.is_some(), self.lexical.is_some()) {
            (true, true) => ResultSource::Hybrid,
            (true, false) => ResultSource::Semantic,
            (false, _) => ResultSource::Keyword,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BoostParams {
    pub title_boost: f32,
    pub recency_boost: f32,
    pub recency_decay_per_day: f32,
    pub scope_boost: f32,
}

impl From<&RetrievalConfig> for BoostParams {
    fn from(cfg: &RetrievalConfig) -> Self {
        Self {
            title_boost: cfg.title_boost,
            recency_boost: cfg.recency_boost,
            recency_decay_per_day: cfg.recency_decay_per_day,
            scope_boost: cfg.scope_boost,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScoredCandidate {
    pub candidate: Candidate,
    /// Weighted fusion of similarity and lexical score, before boosts.
    pub combined: f32,
    pub score: f32,
    pub source: ResultSource,
}

fn parse_created_at(metadata: &HashMap<String, String>) -> Option<DateTime<Utc>> {
    metadata
        .get(meta::CREATED_AT)
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|parsed| parsed.with_timezone(&Utc))
}

/// Merge semantic and keyword hits by chunk key. A passage found by both
/// paths keeps both signals.
pub fn fuse(semantic: Vec<VectorHit>, keyword: Vec<KeywordHit>) -> Vec<Candidate> {
    let mut by_key: HashMap<String, Candidate> = HashMap::new();

    for hit in semantic {
        let key = chunk_key(&hit.text);
        let entry = by_key.entry(key.clone()).or_insert_with(|| Candidate {
            key,
            created_at: parse_created_at(&hit.metadata),
            text: hit.text.clone(),
            metadata: hit.metadata.clone(),
            similarity: None,
            lexical: None,
        });
        entry.similarity = Some(entry.similarity.map_or(hit.similarity, |s: f32| s.max(hit.similarity)));
    }

    for hit in keyword {
        let key = chunk_key(&hit.chunk.text);
        let entry = by_key.entry(key.clone()).or_insert_with(|| Candidate {
            key,
            created_at: parse_created_at(&hit.chunk.metadata),
            text: hit.chunk.text.clone(),
            metadata: hit.chunk.metadata.clone(),
            similarity: None,
            lexical: None,
        });
        entry.lexical = Some(entry.lexical.map_or(hit.lexical_score, |s: f32| s.max(hit.lexical_score)));
    }

    by_key.into_values().collect()
}

/// Weighted fusion plus additive contextual boosts. For candidates with
/// identical boosts the final score is monotonic in the combined score.
pub fn score(
    candidates: Vec<Candidate>,
    weights: HybridWeights,
    boosts: BoostParams,
    query_tokens: &[String],
    now: DateTime<Utc>,
) -> Vec<ScoredCandidate> {
    let mut scored: Vec<ScoredCandidate> = candidates
        .into_iter()
        .map(|candidate| {
            let combined = weights.semantic * candidate.similarity.unwrap_or(0.0)
                + weights.keyword * candidate.lexical.unwrap_or(0.0);

            let mut boost = 0.0f32;

            if boosts.title_boost != 0.0 {
                if let Some(title) = candidate.metadata.get(meta::TITLE) {
                    let title = title.to_lowercase();
                    for token in query_tokens {
                        if title.contains(token.as_str()) {
                            boost += boosts.title_boost;
                        }
                    }
                }
            }

            if boosts.recency_boost != 0.0 {
                if let Some(created_at) = candidate.created_at {
                    let age_days = (now - created_at).num_seconds().max(0) as f32 / 86_400.0;
                    boost += (boosts.recency_boost
                        - age_days * boosts.recency_decay_per_day)
                        .max(0.0);
                }
            }

            if candidate.metadata.get(meta::TYPE).map(String::as_str) == Some("project") {
                boost += boosts.scope_boost;
            }

            let source = candidate.source();
            ScoredCandidate {
                combined,
                score: combined + boost,
                source,
                candidate,
            }
        })
        .collect();

    scored.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| b.candidate.created_at.cmp(&a.candidate.created_at))
    });
    scored
}

/// Lowercase alphanumeric tokens for title matching.
pub fn query_tokens(q: &str) -> Vec<String> {
    q.split(|c: char| !c.is_alphanumeric())
        .filter(|token| !token.is_empty())
        .map(|token| token.to_lowercase())
        .collect()
}
