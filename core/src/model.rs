use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;

/// Metadata keys shared between the vector index and the document store.
/// Filter sanitization only admits fields from this set.
pub mod meta {
    pub const TYPE: &str = "type";
    pub const CATEGORY: &str = "category";
    pub const STATUS: &str = "status";
    pub const TAGS: &str = "tags";
    pub const LANGUAGE: &str = "language";
    pub const CREATED_AT: &str = "created_at";
    pub const UPDATED_AT: &str = "updated_at";
    pub const WORKSPACE_ID: &str = "workspace_id";
    pub const PROJECT_ID: &str = "project_id";
    pub const TITLE: &str = "title";
    pub const DOCUMENT_ID: &str = "document_id";
    pub const CHUNK_INDEX: &str = "chunk_index";
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TenantScope {
    Global,
    Workspace {
        workspace_id: String,
    },
    Project {
        workspace_id: String,
        project_id: String,
    },
}

impl TenantScope {
    pub fn workspace(workspace_id: impl Into<String>) -> Self {
        Self::Workspace {
            workspace_id: workspace_id.into(),
        }
    }

    pub fn project(workspace_id: impl Into<String>, project_id: impl Into<String>) -> Self {
        Self::Project {
            workspace_id: workspace_id.into(),
            project_id: project_id.into(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            TenantScope::Global => "global",
            TenantScope::Workspace { .. } => "workspace",
            TenantScope::Project { .. } => "project",
        }
    }

    pub fn workspace_id(&self) -> Option<&str> {
        match self {
            TenantScope::Global => None,
            TenantScope::Workspace { workspace_id } => Some(workspace_id),
            TenantScope::Project { workspace_id, .. } => Some(workspace_id),
        }
    }

    pub fn project_id(&self) -> Option<&str> {
        match self {
            TenantScope::Project { project_id, .. } => Some(project_id),
            _ => None,
        }
    }

    /// Stable key identifying the tenant partition this scope belongs to.
    /// Used in content hashing and response-cache keys.
    pub fn tenant_key(&self) -> String {
        match self {
            TenantScope::Global => "global".to_string(),
            TenantScope::Workspace { workspace_id } => format!("ws:{}", workspace_id),
            TenantScope::Project {
                workspace_id,
                project_id,
            } => format!("proj:{}:{}", workspace_id, project_id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentId(String);

impl DocumentId {
    /// Opaque 128-bit id: the first 16 bytes of the content hash, hex.
    pub fn from_content_hash(content_hash: &str) -> Self {
        Self(content_hash[..32.min(content_hash.len())].to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DocumentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    Pending,
    Processing,
    Indexed,
    Failed,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentStatus::Pending => "pending",
            DocumentStatus::Processing => "processing",
            DocumentStatus::Indexed => "indexed",
            DocumentStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: DocumentId,
    pub scope: TenantScope,
    pub title: String,
    pub content_hash: String,
    pub language: String,
    pub tags: Vec<String>,
    pub chunk_count: u32,
    pub total_tokens: u64,
    pub status: DocumentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Document {
    pub fn new(
        scope: TenantScope,
        title: impl Into<String>,
        content_hash: impl Into<String>,
        language: impl Into<String>,
        tags: Vec<String>,
    ) -> Self {
        let content_hash = content_hash.into();
        let now = Utc::now();
        Self {
            id: DocumentId::from_content_hash(&content_hash),
            scope,
            title: title.into(),
            content_hash,
            language: language.into(),
            tags,
            chunk_count: 0,
            total_tokens: 0,
            status: DocumentStatus::Pending,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub id: String,
    pub document_id: DocumentId,
    pub chunk_index: u32,
    pub text: String,
    pub offset_start: usize,
    pub offset_end: usize,
    pub metadata: HashMap<String, String>,
}

/// Chunk ids are document-id prefixed so abandoned ingests can be purged
/// from the vector index by prefix.
pub fn chunk_id(document_id: &DocumentId, index: u32) -> String {
    format!("{}:{:05}", document_id, index)
}

/// Canonical content hash: title, sanitized content, and the tenant key,
/// NUL-separated. Scoping the hash keeps dedup tenant-local.
pub fn content_hash(title: &str, sanitized: &str, scope: &TenantScope) -> String {
    let mut hasher = Sha256::new();
    hasher.update(title.trim().as_bytes());
    hasher.update([0u8]);
    hasher.update(sanitized.as_bytes());
    hasher.update([0u8]);
    hasher.update(scope.tenant_key().as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Base metadata every chunk of a document carries into both stores.
pub fn chunk_metadata(doc: &Document, chunk_index: u32) -> HashMap<String, String> {
    let mut out = HashMap::new();
    out.insert(meta::TYPE.to_string(), doc.scope.kind().to_string());
    out.insert(meta::STATUS.to_string(), doc.status.as_str().to_string());
    out.insert(meta::LANGUAGE.to_string(), doc.language.clone());
    out.insert(meta::TITLE.to_string(), doc.title.clone());
    out.insert(meta::DOCUMENT_ID.to_string(), doc.id.to_string());
    out.insert(meta::CHUNK_INDEX.to_string(), chunk_index.to_string());
    out.insert(meta::CREATED_AT.to_string(), doc.created_at.to_rfc3339());
    out.insert(meta::UPDATED_AT.to_string(), doc.updated_at.to_rfc3339());
    if !doc.tags.is_empty() {
        out.insert(meta::TAGS.to_string(), doc.tags.join(","));
    }
    if let Some(ws) = doc.scope.workspace_id() {
        out.insert(meta::WORKSPACE_ID.to_string(), ws.to_string());
    }
    if let Some(pr) = doc.scope.project_id() {
        out.insert(meta::PROJECT_ID.to_string(), pr.to_string());
    }
    out
}
