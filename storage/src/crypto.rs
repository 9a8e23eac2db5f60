use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use cairn_core::error::{CairnError, ErrorKind};
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use sha2::Sha256;
use thiserror::Error;

const SALT_LEN: usize = 32;
const IV_LEN: usize = 12;
const TAG_LEN: usize = 16;
const KEY_LEN: usize = 32;
const PBKDF2_ITERATIONS: u32 = 150_000;

/// Associated data bound into every cache-entry ciphertext.
pub const CACHE_KEY_CLASS: &str = "cache-entry";
/// Associated data bound into every provider-key ciphertext.
pub const PROVIDER_KEY_CLASS: &str = "embedding-api-key";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("decryption failed: integrity check or key mismatch")]
    DecryptFailed,
    #[error("master secret is not configured")]
    MissingMaster,
    #[error("invalid key version: {0}")]
    InvalidVersion(String),
    #[error("key material expired")]
    Expired,
}

impl CairnError for CryptoError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::Crypto
    }
}

/// Seam for at-rest encryption of cache entries. Implementations must be
/// deterministic round-trips; failed decrypts surface as errors, never as
/// partial plaintext.
pub trait AtRestCipher: Send + Sync {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError>;

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError>;
}

#[derive(Default)]
pub struct NoOpCipher;

impl AtRestCipher for NoOpCipher {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        Ok(plaintext.to_vec())
    }

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        Ok(ciphertext.to_vec())
    }
}

/// AES-256-GCM under a PBKDF2-derived key. Every ciphertext gets a fresh
/// salt and IV; the blob layout is base64(salt ‖ iv ‖ tag ‖ ct) and the
/// key class rides as associated data so a blob cannot be replayed under
/// a different class.
pub struct MasterCipher {
    master: Option<String>,
}

impl MasterCipher {
    pub fn new(master: impl Into<String>) -> Self {
        Self {
            master: Some(master.into()),
        }
    }

    /// A cipher with no master secret: every operation fails with
    /// `MissingMaster`. Used where configuration omits the secret.
    pub fn unconfigured() -> Self {
        Self { master: None }
    }

    fn derive_key(&self, salt: &[u8]) -> Result<[u8; KEY_LEN], CryptoError> {
        let master = self.master.as_ref().ok_or(CryptoError::MissingMaster)?;
        let mut key = [0u8; KEY_LEN];
        pbkdf2_hmac::<Sha256>(master.as_bytes(), salt, PBKDF2_ITERATIONS, &mut key);
        Ok(key)
    }

    pub fn encrypt_blob(&self, plaintext: &[u8], key_class: &str) -> Result<String, CryptoError> {
        let mut salt = [0u8; SALT_LEN];
        let mut iv = [0u8; IV_LEN];
        rand::thread_rng().fill_bytes(&mut salt);
        rand::thread_rng().fill_bytes(&mut iv);

        let key = self.derive_key(&salt)?;
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
        let nonce = Nonce::from_slice(&iv);

        let mut sealed = cipher
            .encrypt(
                nonce,
                Payload {
                    msg: plaintext,
                    aad: key_class.as_bytes(),
                },
            )
            .map_err(|_| CryptoError::DecryptFailed)?;

        // aes-gcm appends the tag to the ciphertext; the blob layout wants
        // it up front.
        let tag = sealed.split_off(sealed.len() - TAG_LEN);

        let mut blob = Vec::with_capacity(SALT_LEN + IV_LEN + TAG_LEN + sealed.len());
        blob.extend_from_slice(&salt);
        blob.extend_from_slice(&iv);
        blob.extend_from_slice(&tag);
        blob.extend_from_slice(&sealed);
        Ok(BASE64.encode(blob))
    }

    pub fn decrypt_blob(&self, blob: &str, key_class: &str) -> Result<Vec<u8>, CryptoError> {
        let raw = BASE64.decode(blob).map_err(|_| CryptoError::DecryptFailed)?;
        if raw.len() < SALT_LEN + IV_LEN + TAG_LEN {
            return Err(CryptoError::DecryptFailed);
        }

        let (salt, rest) = raw.split_at(SALT_LEN);
        let (iv, rest) = rest.split_at(IV_LEN);
        let (tag, ct) = rest.split_at(TAG_LEN);

        let key = self.derive_key(salt)?;
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
        let nonce = Nonce::from_slice(iv);

        let mut sealed = Vec::with_capacity(ct.len() + TAG_LEN);
        sealed.extend_from_slice(ct);
        sealed.extend_from_slice(tag);

        cipher
            .decrypt(
                nonce,
                Payload {
                    msg: &sealed,
                    aad: key_class.as_bytes(),
                },
            )
            .map_err(|_| CryptoError::DecryptFailed)
    }
}

impl AtRestCipher for MasterCipher {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.encrypt_blob(plaintext, CACHE_KEY_CLASS)
            .map(String::into_bytes)
    }

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let blob = std::str::from_utf8(ciphertext).map_err(|_| CryptoError::DecryptFailed)?;
        self.decrypt_blob(blob, CACHE_KEY_CLASS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blob_round_trips() {
        let cipher = MasterCipher::new("master-secret");
        let blob = cipher.encrypt_blob(b"sk-live-1234", PROVIDER_KEY_CLASS).unwrap();
        let plain = cipher.decrypt_blob(&blob, PROVIDER_KEY_CLASS).unwrap();
        assert_eq!(plain, b"sk-live-1234");
    }

    #[test]
    fn fresh_salt_and_iv_per_ciphertext() {
        let cipher = MasterCipher::new("master-secret");
        let a = cipher.encrypt_blob(b"same", PROVIDER_KEY_CLASS).unwrap();
        let b = cipher.encrypt_blob(b"same", PROVIDER_KEY_CLASS).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn bit_flip_fails_closed() {
        let cipher = MasterCipher::new("master-secret");
        let blob = cipher.encrypt_blob(b"payload", PROVIDER_KEY_CLASS).unwrap();

        let mut raw = BASE64.decode(&blob).unwrap();
        for position in [0, SALT_LEN + 2, SALT_LEN + IV_LEN + 3, raw.len() - 1] {
            raw[position] ^= 0x01;
            let tampered = BASE64.encode(&raw);
            assert_eq!(
                cipher.decrypt_blob(&tampered, PROVIDER_KEY_CLASS),
                Err(CryptoError::DecryptFailed)
            );
            raw[position] ^= 0x01;
        }
    }

    #[test]
    fn aad_binds_the_key_class() {
        let cipher = MasterCipher::new("master-secret");
        let blob = cipher.encrypt_blob(b"payload", PROVIDER_KEY_CLASS).unwrap();
        assert_eq!(
            cipher.decrypt_blob(&blob, CACHE_KEY_CLASS),
            Err(CryptoError::DecryptFailed)
        );
    }

    #[test]
    fn wrong_master_fails_closed() {
        let cipher = MasterCipher::new("master-secret");
        let other = MasterCipher::new("other-secret");
        let blob = cipher.encrypt_blob(b"payload", PROVIDER_KEY_CLASS).unwrap();
        assert_eq!(
            other.decrypt_blob(&blob, PROVIDER_KEY_CLASS),
            Err(CryptoError::DecryptFailed)
        );
    }

    #[test]
    fn missing_master_is_a_distinct_error() {
        let cipher = MasterCipher::unconfigured();
        assert_eq!(
            cipher.encrypt_blob(b"x", PROVIDER_KEY_CLASS),
            Err(CryptoError::MissingMaster)
        );
    }
}
