use crate::provider::ProviderError;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

const CHANNEL_CAPACITY: usize = 1_024;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BatcherConfig {
    pub batch_size: usize,
    pub window: Duration,
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self {
            batch_size: 16,
            window: Duration::from_millis(25),
        }
    }
}

/// Whatever executes a flushed batch: in practice the dispatch layer
/// with its breakers, retries, and fallback chain.
#[async_trait]
pub trait BatchExecutor: Send + Sync {
    async fn execute(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>, ProviderError>;
}

struct BatchRequest {
    text: String,
    reply: oneshot::Sender<Result<Vec<f32>, ProviderError>>,
}

/// Accumulates single-embed requests up to `batch_size` or `window`,
/// whichever comes first, then issues one executor call and fans the
/// results back out.
pub struct Batcher {
    tx: mpsc::Sender<BatchRequest>,
}

impl Batcher {
    pub fn spawn(config: BatcherConfig, executor: Arc<dyn BatchExecutor>) -> Self {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        tokio::spawn(run_loop(config, executor, rx));
        Self { tx }
    }

    pub async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(BatchRequest {
                text: text.to_string(),
                reply: reply_tx,
            })
            .await
            .map_err(|_| ProviderError::Terminal("batcher stopped".to_string()))?;
        reply_rx
            .await
            .map_err(|_| ProviderError::Terminal("batcher dropped request".to_string()))?
    }
}

async fn run_loop(
    config: BatcherConfig,
    executor: Arc<dyn BatchExecutor>,
    mut rx: mpsc::Receiver<BatchRequest>,
) {
    let batch_size = config.batch_size.max(1);

    while let Some(first) = rx.recv().await {
        let mut batch = vec![first];
        let window = tokio::time::sleep(config.window);
        tokio::pin!(window);

        while batch.len() < batch_size {
            tokio::select! {
                _ = &mut window => break,
                next = rx.recv() => match next {
                    Some(request) => batch.push(request),
                    None => break,
                },
            }
        }

        debug!(size = batch.len(), "flushing embedding batch");
        let texts: Vec<String> = batch.iter().map(|request| request.text.clone()).collect();
        match executor.execute(texts).await {
            Ok(vectors) if vectors.len() == batch.len() => {
                for (request, vector) in batch.into_iter().zip(vectors) {
                    let _ = request.reply.send(Ok(vector));
                }
            }
            Ok(vectors) => {
                let error = ProviderError::Terminal(format!(
                    "executor returned {} vectors for {} inputs",
                    vectors.len(),
                    batch.len()
                ));
                for request in batch {
                    let _ = request.reply.send(Err(error.clone()));
                }
            }
            Err(error) => {
                for request in batch {
                    let _ = request.reply.send(Err(error.clone()));
                }
            }
        }
    }
}
