use crate::cache::SecureCache;
use crate::crypto::{CryptoError, MasterCipher, PROVIDER_KEY_CLASS};
use crate::docstore::{DocStoreError, DocumentStore};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

/// Stored provider credential. The blob stays ciphertext in both the
/// document store and the cache mirror; plaintext exists only in the
/// return value of `fetch_key`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderKeyRecord {
    pub provider_id: String,
    pub version: u32,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_used: Option<DateTime<Utc>>,
    pub usage_count: u64,
    pub active: bool,
    pub encrypted_blob: String,
}

#[derive(Debug, Error)]
pub enum VaultError {
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),
    #[error("store error: {0}")]
    Store(#[from] DocStoreError),
    #[error("no key stored for provider: {0}")]
    NotFound(String),
}

impl cairn_core::error::CairnError for VaultError {
    fn kind(&self) -> cairn_core::error::ErrorKind {
        match self {
            VaultError::Store(_) => cairn_core::error::ErrorKind::Storage,
            _ => cairn_core::error::ErrorKind::Crypto,
        }
    }
}

pub struct ProviderKeyVault {
    store: Arc<dyn DocumentStore>,
    cache: Arc<SecureCache>,
    cipher: Arc<MasterCipher>,
    max_key_age: Duration,
}

impl ProviderKeyVault {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        cache: Arc<SecureCache>,
        cipher: Arc<MasterCipher>,
        max_key_age: Duration,
    ) -> Self {
        Self {
            store,
            cache,
            cipher,
            max_key_age,
        }
    }

    fn cache_key(provider_id: &str) -> String {
        format!("provider-key:{}", provider_id)
    }

    pub async fn store_key(
        &self,
        provider_id: &str,
        plaintext: &str,
    ) -> Result<ProviderKeyRecord, VaultError> {
        let version = self
            .store
            .get_provider_key(provider_id)
            .await?
            .map(|existing| existing.version + 1)
            .unwrap_or(1);

        let record = ProviderKeyRecord {
            provider_id: provider_id.to_string(),
            version,
            created_at: Utc::now(),
            last_used: None,
            usage_count: 0,
            active: true,
            encrypted_blob: self
                .cipher
                .encrypt_blob(plaintext.as_bytes(), PROVIDER_KEY_CLASS)?,
        };

        self.store.put_provider_key(record.clone()).await?;
        self.cache
            .set(&Self::cache_key(provider_id), &record, None)
            .await;
        info!(provider = provider_id, version, "stored provider key");
        Ok(record)
    }

    /// Decrypt and return the credential. The record must be active and
    /// younger than the configured maximum age; usage counters are bumped
    /// on every successful retrieval.
    pub async fn fetch_key(&self, provider_id: &str) -> Result<String, VaultError> {
        let record = match self
            .cache
            .get::<ProviderKeyRecord>(&Self::cache_key(provider_id))
            .await
        {
            Some(record) => record,
            None => {
                let record = self
                    .store
                    .get_provider_key(provider_id)
                    .await?
                    .ok_or_else(|| VaultError::NotFound(provider_id.to_string()))?;
                self.cache
                    .set(&Self::cache_key(provider_id), &record, None)
                    .await;
                record
            }
        };

        if !record.active {
            return Err(VaultError::Crypto(CryptoError::InvalidVersion(format!(
                "key v{} for {} is inactive",
                record.version, provider_id
            ))));
        }
        if Utc::now() - record.created_at > self.max_key_age {
            return Err(VaultError::Crypto(CryptoError::Expired));
        }

        let plaintext = self
            .cipher
            .decrypt_blob(&record.encrypted_blob, PROVIDER_KEY_CLASS)?;
        let plaintext =
            String::from_utf8(plaintext).map_err(|_| CryptoError::DecryptFailed)?;

        self.store.touch_provider_key(provider_id).await?;
        Ok(plaintext)
    }

    /// Re-encrypt the stored blob under a new master in one logical
    /// operation: decrypt with the current cipher, rewrite with the new.
    pub async fn rotate(
        &self,
        provider_id: &str,
        new_cipher: &MasterCipher,
    ) -> Result<(), VaultError> {
        let mut record = self
            .store
            .get_provider_key(provider_id)
            .await?
            .ok_or_else(|| VaultError::NotFound(provider_id.to_string()))?;

        let plaintext = self
            .cipher
            .decrypt_blob(&record.encrypted_blob, PROVIDER_KEY_CLASS)?;
        record.encrypted_blob = new_cipher.encrypt_blob(&plaintext, PROVIDER_KEY_CLASS)?;
        record.version += 1;
        record.created_at = Utc::now();

        self.store.put_provider_key(record.clone()).await?;
        self.cache
            .set(&Self::cache_key(provider_id), &record, None)
            .await;
        info!(provider = provider_id, version = record.version, "rotated provider key");
        Ok(())
    }

    pub async fn deactivate(&self, provider_id: &str) -> Result<(), VaultError> {
        let mut record = self
            .store
            .get_provider_key(provider_id)
            .await?
            .ok_or_else(|| VaultError::NotFound(provider_id.to_string()))?;
        record.active = false;
        self.store.put_provider_key(record.clone()).await?;
        self.cache
            .set(&Self::cache_key(provider_id), &record, None)
            .await;
        Ok(())
    }
}
