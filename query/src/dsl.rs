use cairn_core::model::TenantScope;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

const DEFAULT_TOP_K: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum QueryScope {
    #[default]
    Global,
    Workspace,
    Project,
    All,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryRequest {
    pub q: String,
    #[serde(default)]
    pub scope: QueryScope,
    #[serde(default)]
    pub workspace_id: Option<String>,
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default)]
    pub min_score: Option<f32>,
    #[serde(default = "default_true")]
    pub include_metadata: bool,
    #[serde(default = "default_true")]
    pub include_citations: bool,
    #[serde(default)]
    pub language: Option<String>,
    /// Caller-supplied metadata filter; sanitized against the closed
    /// operator and field sets before use.
    #[serde(default)]
    pub filters: Option<serde_json::Value>,
}

const fn default_top_k() -> usize {
    DEFAULT_TOP_K
}

const fn default_true() -> bool {
    true
}

impl QueryRequest {
    pub fn new(q: impl Into<String>) -> Self {
        Self {
            q: q.into(),
            scope: QueryScope::default(),
            workspace_id: None,
            project_id: None,
            top_k: DEFAULT_TOP_K,
            min_score: None,
            include_metadata: true,
            include_citations: true,
            language: None,
            filters: None,
        }
    }

    pub fn with_scope(mut self, scope: QueryScope) -> Self {
        self.scope = scope;
        self
    }

    pub fn with_workspace(mut self, workspace_id: impl Into<String>) -> Self {
        self.workspace_id = Some(workspace_id.into());
        self
    }

    pub fn with_project(mut self, project_id: impl Into<String>) -> Self {
        self.project_id = Some(project_id.into());
        self
    }

    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k;
        self
    }

    pub fn with_min_score(mut self, min_score: f32) -> Self {
        self.min_score = Some(min_score);
        self
    }

    pub fn parse_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    pub fn validate(
        &self,
        max_query_chars: usize,
        max_top_k: usize,
    ) -> Result<(), QueryValidationError> {
        if self.q.trim().is_empty() {
            return Err(QueryValidationError::EmptyQuery);
        }
        if self.q.chars().count() > max_query_chars {
            return Err(QueryValidationError::QueryTooLong(max_query_chars));
        }
        if self.top_k == 0 || self.top_k > max_top_k {
            return Err(QueryValidationError::InvalidTopK(max_top_k));
        }
        if let Some(min_score) = self.min_score {
            if !(0.0..=1.0).contains(&min_score) {
                return Err(QueryValidationError::InvalidMinScore);
            }
        }
        match self.scope {
            QueryScope::Workspace if self.workspace_id.is_none() => {
                Err(QueryValidationError::MissingWorkspaceId)
            }
            QueryScope::Project if self.workspace_id.is_none() || self.project_id.is_none() => {
                Err(QueryValidationError::MissingProjectId)
            }
            _ => Ok(()),
        }
    }

    /// Tenant scopes this request targets. For `all`, the union of the
    /// scopes the ids describe; access filtering happens in the engine.
    pub fn target_scopes(&self) -> Vec<TenantScope> {
        match self.scope {
            QueryScope::Global => vec![TenantScope::Global],
            QueryScope::Workspace => self
                .workspace_id
                .iter()
                .map(|ws| TenantScope::workspace(ws.clone()))
                .collect(),
            QueryScope::Project => match (&self.workspace_id, &self.project_id) {
                (Some(ws), Some(pr)) => vec![TenantScope::project(ws.clone(), pr.clone())],
                _ => Vec::new(),
            },
            QueryScope::All => {
                let mut scopes = vec![TenantScope::Global];
                if let Some(ws) = &self.workspace_id {
                    scopes.push(TenantScope::workspace(ws.clone()));
                    if let Some(pr) = &self.project_id {
                        scopes.push(TenantScope::project(ws.clone(), pr.clone()));
                    }
                }
                scopes
            }
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QueryValidationError {
    #[error("query must not be empty")]
    EmptyQuery,
    #[error("query exceeds {0} characters")]
    QueryTooLong(usize),
    #[error("top_k must be between 1 and {0}")]
    InvalidTopK(usize),
    #[error("min_score must be within [0, 1]")]
    InvalidMinScore,
    #[error("workspace scope requires workspace_id")]
    MissingWorkspaceId,
    #[error("project scope requires workspace_id and project_id")]
    MissingProjectId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultSource {
    Semantic,
    Keyword,
    Hybrid,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Citation {
    pub title: String,
    pub scope: String,
    pub created_at: String,
    pub document_id: String,
    pub chunk_index: u32,
    pub deep_link: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedPassage {
    pub content: String,
    pub score: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub citation: Option<Citation>,
    pub source: ResultSource,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResponse {
    pub results: Vec<RankedPassage>,
    pub total_found: usize,
    /// Candidates dropped by the relevance floor.
    pub filtered: usize,
    pub collections_searched: usize,
    pub duration_ms: u64,
    pub cached: bool,
    pub degraded: bool,
}
