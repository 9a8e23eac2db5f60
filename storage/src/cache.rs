use crate::crypto::AtRestCipher;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Option<Vec<u8>>;

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>);

    async fn delete(&self, key: &str);

    async fn delete_prefix(&self, prefix: &str) -> usize;

    /// Pipelined multi-get: one call against the backing store.
    async fn mget(&self, keys: &[String]) -> Vec<Option<Vec<u8>>>;

    async fn mset(&self, entries: Vec<(String, Vec<u8>, Option<Duration>)>);
}

struct KvEntry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

impl KvEntry {
    fn expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

#[derive(Default)]
pub struct InMemoryKv {
    entries: DashMap<String, KvEntry>,
}

impl InMemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self, key: &str) -> Option<Vec<u8>> {
        // the read guard must drop before the expired entry is removed
        let expired = match self.entries.get(key) {
            Some(entry) if entry.expired() => true,
            Some(entry) => return Some(entry.value.clone()),
            None => return None,
        };
        if expired {
            self.entries.remove(key);
        }
        None
    }
}

#[async_trait]
impl KvStore for InMemoryKv {
    async fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.read(key)
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) {
        self.entries.insert(
            key.to_string(),
            KvEntry {
                value,
                expires_at: ttl.map(|ttl| Instant::now() + ttl),
            },
        );
    }

    async fn delete(&self, key: &str) {
        self.entries.remove(key);
    }

    async fn delete_prefix(&self, prefix: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|key, _| !key.starts_with(prefix));
        before - self.entries.len()
    }

    async fn mget(&self, keys: &[String]) -> Vec<Option<Vec<u8>>> {
        keys.iter().map(|key| self.read(key)).collect()
    }

    async fn mset(&self, entries: Vec<(String, Vec<u8>, Option<Duration>)>) {
        for (key, value, ttl) in entries {
            self.entries.insert(
                key,
                KvEntry {
                    value,
                    expires_at: ttl.map(|ttl| Instant::now() + ttl),
                },
            );
        }
    }
}

#[derive(Default)]
struct CacheCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    encrypt_micros: AtomicU64,
    encrypt_ops: AtomicU64,
    decrypt_micros: AtomicU64,
    decrypt_ops: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub avg_encrypt_micros: u64,
    pub avg_decrypt_micros: u64,
}

/// Namespaced, TTL'd, optionally encrypted view over a KV store. Values
/// are JSON-serialized; with a cipher attached, ciphertext is all the
/// backing store ever holds. A failed decrypt evicts the entry and
/// reports a miss.
pub struct SecureCache {
    store: Arc<dyn KvStore>,
    prefix: String,
    cipher: Option<Arc<dyn AtRestCipher>>,
    default_ttl: Duration,
    counters: CacheCounters,
}

impl SecureCache {
    pub fn new(store: Arc<dyn KvStore>, prefix: impl Into<String>, default_ttl: Duration) -> Self {
        Self {
            store,
            prefix: prefix.into(),
            cipher: None,
            default_ttl,
            counters: CacheCounters::default(),
        }
    }

    pub fn with_cipher(mut self, cipher: Arc<dyn AtRestCipher>) -> Self {
        self.cipher = Some(cipher);
        self
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn namespaced(&self, key: &str) -> String {
        format!("{}:{}", self.prefix, key)
    }

    fn encode<T: Serialize>(&self, value: &T) -> Option<Vec<u8>> {
        let plain = serde_json::to_vec(value).ok()?;
        match &self.cipher {
            Some(cipher) => {
                let started = Instant::now();
                let sealed = cipher.encrypt(&plain).ok()?;
                self.counters
                    .encrypt_micros
                    .fetch_add(started.elapsed().as_micros() as u64, Ordering::Relaxed);
                self.counters.encrypt_ops.fetch_add(1, Ordering::Relaxed);
                Some(sealed)
            }
            None => Some(plain),
        }
    }

    fn decode<T: DeserializeOwned>(&self, raw: &[u8]) -> Option<T> {
        let plain = match &self.cipher {
            Some(cipher) => {
                let started = Instant::now();
                let plain = cipher.decrypt(raw).ok()?;
                self.counters
                    .decrypt_micros
                    .fetch_add(started.elapsed().as_micros() as u64, Ordering::Relaxed);
                self.counters.decrypt_ops.fetch_add(1, Ordering::Relaxed);
                plain
            }
            None => raw.to_vec(),
        };
        serde_json::from_slice(&plain).ok()
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let namespaced = self.namespaced(key);
        let Some(raw) = self.store.get(&namespaced).await else {
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        };

        match self.decode(&raw) {
            Some(value) => {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                Some(value)
            }
            None => {
                debug!(key = namespaced.as_str(), "evicting undecodable cache entry");
                self.store.delete(&namespaced).await;
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Best-effort write; serialization or encryption problems drop the
    /// write rather than fail the caller.
    pub async fn set<T: Serialize>(&self, key: &str, value: &T, ttl: Option<Duration>) {
        if let Some(encoded) = self.encode(value) {
            self.store
                .set(
                    &self.namespaced(key),
                    encoded,
                    Some(ttl.unwrap_or(self.default_ttl)),
                )
                .await;
        }
    }

    pub async fn delete(&self, key: &str) {
        self.store.delete(&self.namespaced(key)).await;
    }

    /// Drop every entry in this namespace. Returns the evicted count.
    pub async fn clear(&self) -> usize {
        self.store.delete_prefix(&format!("{}:", self.prefix)).await
    }

    /// Cached value or the result of `compute`, stored on success.
    /// Compute failures are returned as-is and never populate the cache.
    pub async fn wrap<T, E, F, Fut>(&self, key: &str, ttl: Option<Duration>, compute: F) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if let Some(hit) = self.get(key).await {
            return Ok(hit);
        }
        let value = compute().await?;
        self.set(key, &value, ttl).await;
        Ok(value)
    }

    pub async fn mget<T: DeserializeOwned>(&self, keys: &[String]) -> Vec<Option<T>> {
        let namespaced: Vec<String> = keys.iter().map(|key| self.namespaced(key)).collect();
        let raws = self.store.mget(&namespaced).await;
        raws.into_iter()
            .map(|raw| {
                let decoded = raw.as_deref().and_then(|raw| self.decode(raw));
                match decoded {
                    Some(value) => {
                        self.counters.hits.fetch_add(1, Ordering::Relaxed);
                        Some(value)
                    }
                    None => {
                        self.counters.misses.fetch_add(1, Ordering::Relaxed);
                        None
                    }
                }
            })
            .collect()
    }

    pub async fn mset<T: Serialize>(&self, entries: &[(String, T)], ttl: Option<Duration>) {
        let ttl = Some(ttl.unwrap_or(self.default_ttl));
        let encoded: Vec<(String, Vec<u8>, Option<Duration>)> = entries
            .iter()
            .filter_map(|(key, value)| {
                self.encode(value)
                    .map(|encoded| (self.namespaced(key), encoded, ttl))
            })
            .collect();
        if !encoded.is_empty() {
            self.store.mset(encoded).await;
        }
    }

    pub fn stats(&self) -> CacheStats {
        let avg = |total: &AtomicU64, ops: &AtomicU64| {
            let ops = ops.load(Ordering::Relaxed);
            if ops == 0 {
                0
            } else {
                total.load(Ordering::Relaxed) / ops
            }
        };
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            avg_encrypt_micros: avg(&self.counters.encrypt_micros, &self.counters.encrypt_ops),
            avg_decrypt_micros: avg(&self.counters.decrypt_micros, &self.counters.decrypt_ops),
        }
    }
}
