use async_trait::async_trait;
use cairn_core::embedding::deterministic_embedding;
use cairn_core::error::{CairnError, ErrorKind};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use storage::vault::ProviderKeyVault;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ProviderError {
    #[error("transient provider failure: {0}")]
    Transient(String),
    #[error("provider rate limited")]
    RateLimited { retry_after: Option<Duration> },
    #[error("terminal provider failure: {0}")]
    Terminal(String),
    #[error("circuit open for provider: {provider}")]
    CircuitOpen {
        provider: String,
        retry_after: Option<Duration>,
    },
    #[error("missing credentials for provider: {0}")]
    MissingCredentials(String),
    #[error("no embedding provider available")]
    Exhausted,
}

impl ProviderError {
    /// Only transient shapes are worth a retry; everything else is final
    /// for this attempt chain.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::RateLimited { .. })
    }
}

impl CairnError for ProviderError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::Provider
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => *retry_after,
            Self::CircuitOpen { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    fn id(&self) -> &str;

    fn dim(&self) -> usize;

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError>;

    async fn embed_one(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        let mut vectors = self.embed_batch(&[text.to_string()]).await?;
        vectors
            .pop()
            .ok_or_else(|| ProviderError::Terminal("provider returned no vectors".to_string()))
    }
}

/// Deterministic hash embeddings. Gated to non-production scopes when
/// used as a fallback; also the default provider for tests and local
/// development.
pub struct LocalProvider {
    model_id: String,
    dims: usize,
}

impl LocalProvider {
    pub fn new(model_id: impl Into<String>, dims: usize) -> Self {
        Self {
            model_id: model_id.into(),
            dims: dims.max(1),
        }
    }
}

impl Default for LocalProvider {
    fn default() -> Self {
        Self::new("embedding-default-v1", 384)
    }
}

#[async_trait]
impl EmbeddingProvider for LocalProvider {
    fn id(&self) -> &str {
        "local"
    }

    fn dim(&self) -> usize {
        self.dims
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        Ok(texts
            .iter()
            .map(|text| deterministic_embedding(text, &self.model_id, self.dims))
            .collect())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostedKind {
    OpenAi,
    Google,
    Cohere,
}

impl HostedKind {
    pub fn parse(id: &str) -> Option<Self> {
        match id {
            "openai" => Some(Self::OpenAi),
            "google" => Some(Self::Google),
            "cohere" => Some(Self::Cohere),
            _ => None,
        }
    }

    fn id(&self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Google => "google",
            Self::Cohere => "cohere",
        }
    }

    fn endpoint(&self, model: &str) -> String {
        match self {
            Self::OpenAi => "https://api.openai.com/v1/embeddings".to_string(),
            Self::Google => format!(
                "https://generativelanguage.googleapis.com/v1beta/models/{}:batchEmbedContents",
                model
            ),
            Self::Cohere => "https://api.cohere.com/v1/embed".to_string(),
        }
    }
}

/// JSON-over-HTTPS embedding provider. Credentials are pulled from the
/// vault at call time and never stored on the struct.
pub struct HostedProvider {
    kind: HostedKind,
    model: String,
    dims: usize,
    vault: Arc<ProviderKeyVault>,
    client: reqwest::Client,
}

impl HostedProvider {
    pub fn new(
        kind: HostedKind,
        model: impl Into<String>,
        dims: usize,
        vault: Arc<ProviderKeyVault>,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self {
            kind,
            model: model.into(),
            dims,
            vault,
            client,
        }
    }

    fn payload(&self, texts: &[String]) -> Value {
        match self.kind {
            HostedKind::OpenAi => json!({ "model": self.model, "input": texts }),
            HostedKind::Google => json!({
                "requests": texts
                    .iter()
                    .map(|text| json!({
                        "model": format!("models/{}", self.model),
                        "content": { "parts": [{ "text": text }] },
                    }))
                    .collect::<Vec<_>>(),
            }),
            HostedKind::Cohere => json!({
                "model": self.model,
                "texts": texts,
                "input_type": "search_document",
            }),
        }
    }

    fn parse_vectors(&self, body: &Value) -> Result<Vec<Vec<f32>>, ProviderError> {
        let rows = match self.kind {
            HostedKind::OpenAi => body
                .get("data")
                .and_then(Value::as_array)
                .map(|rows| {
                    rows.iter()
                        .filter_map(|row| row.get("embedding"))
                        .collect::<Vec<_>>()
                }),
            HostedKind::Google => body
                .get("embeddings")
                .and_then(Value::as_array)
                .map(|rows| {
                    rows.iter()
                        .filter_map(|row| row.get("values"))
                        .collect::<Vec<_>>()
                }),
            HostedKind::Cohere => body
                .get("embeddings")
                .and_then(Value::as_array)
                .map(|rows| rows.iter().collect::<Vec<_>>()),
        }
        .ok_or_else(|| ProviderError::Terminal("malformed embedding response".to_string()))?;

        rows.into_iter()
            .map(|row| {
                row.as_array()
                    .map(|values| {
                        values
                            .iter()
                            .filter_map(Value::as_f64)
                            .map(|v| v as f32)
                            .collect::<Vec<f32>>()
                    })
                    .ok_or_else(|| {
                        ProviderError::Terminal("embedding row is not an array".to_string())
                    })
            })
            .collect()
    }
}

#[async_trait]
impl EmbeddingProvider for HostedProvider {
    fn id(&self) -> &str {
        self.kind.id()
    }

    fn dim(&self) -> usize {
        self.dims
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let api_key = self
            .vault
            .fetch_key(self.kind.id())
            .await
            .map_err(|_| ProviderError::MissingCredentials(self.kind.id().to_string()))?;

        let mut request = self
            .client
            .post(self.kind.endpoint(&self.model))
            .json(&self.payload(texts));
        request = match self.kind {
            HostedKind::Google => request.header("x-goog-api-key", api_key),
            _ => request.bearer_auth(api_key),
        };

        let response = request.send().await.map_err(|err| {
            if err.is_timeout() || err.is_connect() {
                ProviderError::Transient(err.to_string())
            } else {
                ProviderError::Terminal(err.to_string())
            }
        })?;

        let status = response.status();
        if status.as_u16() == 429 {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.parse::<u64>().ok())
                .map(Duration::from_secs);
            return Err(ProviderError::RateLimited { retry_after });
        }
        if status.is_server_error() {
            return Err(ProviderError::Transient(format!("provider returned {}", status)));
        }
        if !status.is_success() {
            return Err(ProviderError::Terminal(format!("provider returned {}", status)));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|err| ProviderError::Terminal(err.to_string()))?;
        let vectors = self.parse_vectors(&body)?;
        if vectors.len() != texts.len() {
            return Err(ProviderError::Terminal(format!(
                "expected {} vectors, got {}",
                texts.len(),
                vectors.len()
            )));
        }
        Ok(vectors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn local_provider_is_deterministic() {
        let provider = LocalProvider::new("m1", 16);
        let a = provider.embed_one("hello").await.unwrap();
        let b = provider.embed_one("hello").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
    }

    #[tokio::test]
    async fn embed_one_uses_the_batch_path() {
        let provider = LocalProvider::new("m1", 8);
        let single = provider.embed_one("text").await.unwrap();
        let batch = provider
            .embed_batch(&["text".to_string()])
            .await
            .unwrap();
        assert_eq!(single, batch[0]);
    }

    #[test]
    fn transient_classification() {
        assert!(ProviderError::Transient("503".to_string()).is_transient());
        assert!(ProviderError::RateLimited { retry_after: None }.is_transient());
        assert!(!ProviderError::Terminal("400".to_string()).is_transient());
        assert!(!ProviderError::CircuitOpen {
            provider: "openai".to_string(),
            retry_after: None
        }
        .is_transient());
    }

    fn hosted(kind: HostedKind) -> HostedProvider {
        use std::time::Duration as StdDuration;
        let vault = Arc::new(ProviderKeyVault::new(
            Arc::new(storage::docstore::InMemoryDocumentStore::new()),
            Arc::new(storage::cache::SecureCache::new(
                Arc::new(storage::cache::InMemoryKv::new()),
                "vault",
                StdDuration::from_secs(60),
            )),
            Arc::new(storage::crypto::MasterCipher::new("m")),
            chrono_days(90),
        ));
        HostedProvider::new(kind, "embed-model", 2, vault)
    }

    fn chrono_days(days: i64) -> chrono::Duration {
        chrono::Duration::days(days)
    }

    #[test]
    fn parses_openai_response_shape() {
        let provider = hosted(HostedKind::OpenAi);
        let body = serde_json::json!({
            "data": [
                { "embedding": [0.1, 0.2] },
                { "embedding": [0.3, 0.4] },
            ]
        });
        let vectors = provider.parse_vectors(&body).unwrap();
        assert_eq!(vectors, vec![vec![0.1, 0.2], vec![0.3, 0.4]]);
    }

    #[test]
    fn parses_cohere_and_google_response_shapes() {
        let cohere = hosted(HostedKind::Cohere);
        let body = serde_json::json!({ "embeddings": [[1.0, 0.0]] });
        assert_eq!(cohere.parse_vectors(&body).unwrap(), vec![vec![1.0, 0.0]]);

        let google = hosted(HostedKind::Google);
        let body = serde_json::json!({ "embeddings": [{ "values": [0.5, 0.5] }] });
        assert_eq!(google.parse_vectors(&body).unwrap(), vec![vec![0.5, 0.5]]);
    }

    #[test]
    fn malformed_response_is_terminal() {
        let provider = hosted(HostedKind::OpenAi);
        let body = serde_json::json!({ "unexpected": true });
        assert!(matches!(
            provider.parse_vectors(&body),
            Err(ProviderError::Terminal(_))
        ));
    }
}
