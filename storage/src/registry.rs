use crate::docstore::{BucketRecord, DocStoreError, DocumentStore};
use crate::vector::{VectorIndex, VectorStoreError};
use cairn_core::auth::Principal;
use cairn_core::model::TenantScope;
use chrono::Utc;
use lru::LruCache;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::info;

const ACCESS_CACHE_CAPACITY: usize = 4_096;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("vector store error: {0}")]
    Vector(#[from] VectorStoreError),
    #[error("document store error: {0}")]
    Document(#[from] DocStoreError),
}

struct CachedDecision {
    allowed: bool,
    decided_at: Instant,
}

/// Bijective tenant-scope ↔ collection-name mapping plus the access
/// gate every read and write path goes through. Collection names are
/// salted hashes: unguessable without the salt, reversible only here.
pub struct CollectionRegistry {
    salt: String,
    global_name: String,
    vectors: Arc<dyn VectorIndex>,
    documents: Arc<dyn DocumentStore>,
    access_cache: Mutex<LruCache<(String, String), CachedDecision>>,
    access_ttl: Duration,
}

impl CollectionRegistry {
    pub fn new(
        salt: impl Into<String>,
        global_name: impl Into<String>,
        vectors: Arc<dyn VectorIndex>,
        documents: Arc<dyn DocumentStore>,
        access_ttl: Duration,
    ) -> Self {
        Self {
            salt: salt.into(),
            global_name: global_name.into(),
            vectors,
            documents,
            access_cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(ACCESS_CACHE_CAPACITY).expect("non-zero cache size"),
            )),
            access_ttl,
        }
    }

    fn hashed16(&self, material: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(material.as_bytes());
        let digest = hasher.finalize();
        digest[..8].iter().map(|b| format!("{:02x}", b)).collect()
    }

    /// Pure naming rule; bit-exact across nodes sharing the salt.
    pub fn resolve(&self, scope: &TenantScope) -> String {
        match scope {
            TenantScope::Global => self.global_name.clone(),
            TenantScope::Workspace { workspace_id } => {
                format!(
                    "ws_{}",
                    self.hashed16(&format!("{}:{}", workspace_id, self.salt))
                )
            }
            TenantScope::Project {
                workspace_id,
                project_id,
            } => format!(
                "proj_{}",
                self.hashed16(&format!("{}:{}:{}", project_id, workspace_id, self.salt))
            ),
        }
    }

    /// Idempotent: creates the backing vector collection and document
    /// bucket if absent and records who asked first.
    pub async fn ensure(
        &self,
        scope: &TenantScope,
        created_by: &str,
    ) -> Result<String, RegistryError> {
        let name = self.resolve(scope);

        if self.documents.get_bucket(&name).await?.is_none() {
            info!(collection = name.as_str(), scope = scope.kind(), "creating collection");
        }

        let mut metadata = HashMap::new();
        metadata.insert("access_scope".to_string(), scope.kind().to_string());
        metadata.insert("created_by".to_string(), created_by.to_string());
        self.vectors.ensure_collection(&name, metadata).await?;
        self.documents
            .ensure_bucket(BucketRecord {
                name: name.clone(),
                access_scope: scope.kind().to_string(),
                created_by: created_by.to_string(),
                created_at: Utc::now(),
            })
            .await?;
        Ok(name)
    }

    /// Membership policy with a TTL'd write-through cache. Cross-tenant
    /// access is always denied; global is readable by any authenticated
    /// principal.
    pub fn can_access(&self, principal: &Principal, scope: &TenantScope) -> bool {
        let key = (principal.subject.clone(), self.resolve(scope));

        {
            let mut cache = self.access_cache.lock().unwrap();
            if let Some(decision) = cache.get(&key) {
                if decision.decided_at.elapsed() < self.access_ttl {
                    return decision.allowed;
                }
            }
        }

        let allowed = principal.may_access(scope);

        let mut cache = self.access_cache.lock().unwrap();
        cache.put(
            key,
            CachedDecision {
                allowed,
                decided_at: Instant::now(),
            },
        );
        allowed
    }

    /// Drop cached decisions for one subject. Idempotent; called on
    /// membership-change events.
    pub fn invalidate_user(&self, subject: &str) {
        let mut cache = self.access_cache.lock().unwrap();
        let stale: Vec<(String, String)> = cache
            .iter()
            .filter(|((cached_subject, _), _)| cached_subject == subject)
            .map(|(key, _)| key.clone())
            .collect();
        for key in stale {
            cache.pop(&key);
        }
    }

    pub fn invalidate_all(&self) {
        self.access_cache.lock().unwrap().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docstore::InMemoryDocumentStore;
    use crate::vector::InMemoryVectorIndex;

    fn registry() -> CollectionRegistry {
        CollectionRegistry::new(
            "unit-salt",
            "global_knowledge",
            Arc::new(InMemoryVectorIndex::new()),
            Arc::new(InMemoryDocumentStore::new()),
            Duration::from_secs(60),
        )
    }

    #[test]
    fn naming_is_deterministic_and_prefixed() {
        let registry = registry();
        let ws = registry.resolve(&TenantScope::workspace("w1"));
        let proj = registry.resolve(&TenantScope::project("w1", "p1"));

        assert!(ws.starts_with("ws_"));
        assert_eq!(ws.len(), "ws_".len() + 16);
        assert!(proj.starts_with("proj_"));
        assert_eq!(proj.len(), "proj_".len() + 16);
        assert_eq!(ws, registry.resolve(&TenantScope::workspace("w1")));
        assert_eq!(registry.resolve(&TenantScope::Global), "global_knowledge");
    }

    #[test]
    fn naming_depends_on_salt() {
        let a = registry();
        let b = CollectionRegistry::new(
            "other-salt",
            "global_knowledge",
            Arc::new(InMemoryVectorIndex::new()),
            Arc::new(InMemoryDocumentStore::new()),
            Duration::from_secs(60),
        );
        assert_ne!(
            a.resolve(&TenantScope::workspace("w1")),
            b.resolve(&TenantScope::workspace("w1"))
        );
    }

    #[tokio::test]
    async fn ensure_is_idempotent_and_creates_both_buckets() {
        let vectors = Arc::new(InMemoryVectorIndex::new());
        let documents = Arc::new(InMemoryDocumentStore::new());
        let registry = CollectionRegistry::new(
            "unit-salt",
            "global_knowledge",
            vectors.clone(),
            documents.clone(),
            Duration::from_secs(60),
        );

        let scope = TenantScope::workspace("w1");
        let first = registry.ensure(&scope, "u1").await.unwrap();
        let second = registry.ensure(&scope, "u2").await.unwrap();
        assert_eq!(first, second);

        assert_eq!(vectors.list_collections().await.unwrap(), vec![first.clone()]);
        let bucket = documents.get_bucket(&first).await.unwrap().unwrap();
        // first creator wins
        assert_eq!(bucket.created_by, "u1");
    }

    #[test]
    fn cross_tenant_access_is_denied() {
        let registry = registry();
        let principal = Principal::new("u1").with_workspaces(["w1"]);

        assert!(registry.can_access(&principal, &TenantScope::Global));
        assert!(registry.can_access(&principal, &TenantScope::workspace("w1")));
        assert!(!registry.can_access(&principal, &TenantScope::workspace("w2")));
        assert!(!registry.can_access(&principal, &TenantScope::project("w1", "p1")));
    }

    #[test]
    fn cached_decision_matches_uncached_within_ttl() {
        let registry = registry();
        let principal = Principal::new("u1").with_workspaces(["w1"]);
        let scope = TenantScope::workspace("w1");

        let first = registry.can_access(&principal, &scope);
        let second = registry.can_access(&principal, &scope);
        assert_eq!(first, second);
        assert_eq!(second, principal.may_access(&scope));
    }

    #[test]
    fn invalidation_picks_up_membership_revocation() {
        let registry = registry();
        let scope = TenantScope::workspace("w1");

        let member = Principal::new("u1").with_workspaces(["w1"]);
        assert!(registry.can_access(&member, &scope));

        // Revocation: same subject, membership gone. Without
        // invalidation the stale allow would be served from cache.
        registry.invalidate_user("u1");
        let revoked = Principal::new("u1");
        assert!(!registry.can_access(&revoked, &scope));
    }

    #[test]
    fn invalidation_is_idempotent() {
        let registry = registry();
        registry.invalidate_user("ghost");
        registry.invalidate_user("ghost");
        registry.invalidate_all();
        registry.invalidate_all();
    }
}
