pub mod batcher;
pub mod breaker;
pub mod provider;
pub mod retry;
pub mod service;

pub use provider::{EmbeddingProvider, LocalProvider, ProviderError};
pub use service::EmbeddingService;
