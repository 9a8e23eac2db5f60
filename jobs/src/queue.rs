use async_trait::async_trait;
use cairn_core::config::QueueConfig;
use cairn_core::error::{CairnError, ErrorKind};
use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{oneshot, Notify};

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue is full ({max_size} tasks)")]
    Full { max_size: usize },
    #[error("engine is under memory pressure")]
    Backpressure { retry_after: Duration },
    #[error("queue is shutting down")]
    ShuttingDown,
}

impl CairnError for QueueError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::Capacity
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            QueueError::Backpressure { retry_after } => Some(*retry_after),
            QueueError::Full { .. } => Some(Duration::from_millis(250)),
            QueueError::ShuttingDown => None,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TaskError {
    #[error("task timed out")]
    Timeout,
    #[error("task failed: {0}")]
    Failed(String),
    #[error("task cancelled before it started")]
    Cancelled,
}

#[async_trait]
pub trait Job: Send + Sync {
    async fn run(&self) -> anyhow::Result<()>;

    fn name(&self) -> &str {
        "job"
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
#[serde(rename_all = "snake_case", tag = "event")]
pub enum QueueEvent {
    Enqueued { task_id: u64, priority: u8 },
    Processing { task_id: u64 },
    Completed { task_id: u64, latency: Duration },
    Retry { task_id: u64, attempt: u32 },
    TimedOut { task_id: u64 },
    Failed { task_id: u64, error: String },
}

pub trait QueueObserver: Send + Sync {
    fn on_event(&self, event: &QueueEvent);
}

/// Awaitable completion of one submitted task.
pub struct TaskHandle {
    pub task_id: u64,
    rx: oneshot::Receiver<Result<(), TaskError>>,
}

impl TaskHandle {
    pub async fn wait(self) -> Result<(), TaskError> {
        self.rx
            .await
            .unwrap_or(Err(TaskError::Cancelled))
    }
}

pub(crate) struct QueuedTask {
    pub(crate) id: u64,
    pub(crate) priority: u8,
    /// Drain order within a priority class; retries get decreasing
    /// sequence numbers so they re-enter at the head.
    pub(crate) seq: i64,
    pub(crate) attempt: u32,
    pub(crate) job: Arc<dyn Job>,
    pub(crate) done: oneshot::Sender<Result<(), TaskError>>,
}

impl PartialEq for QueuedTask {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for QueuedTask {}

impl PartialOrd for QueuedTask {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedTask {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // max-heap: higher priority first, then FIFO (lower seq first).
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

pub(crate) struct QueueInner {
    pub(crate) config: QueueConfig,
    pub(crate) heap: Mutex<BinaryHeap<QueuedTask>>,
    pub(crate) notify: Notify,
    pub(crate) backpressure: Arc<AtomicBool>,
    pub(crate) shutting_down: AtomicBool,
    pub(crate) tail_seq: AtomicI64,
    pub(crate) head_seq: AtomicI64,
    pub(crate) next_task_id: AtomicU64,
    pub(crate) in_flight: AtomicUsize,
    pub(crate) observers: Mutex<Vec<Arc<dyn QueueObserver>>>,
}

impl QueueInner {
    pub(crate) fn emit(&self, event: QueueEvent) {
        let observers = self.observers.lock().unwrap();
        for observer in observers.iter() {
            observer.on_event(&event);
        }
    }

    pub(crate) fn push(&self, task: QueuedTask) {
        self.heap.lock().unwrap().push(task);
        self.notify.notify_one();
    }

    pub(crate) fn pop(&self) -> Option<QueuedTask> {
        self.heap.lock().unwrap().pop()
    }
}

/// Bounded priority FIFO. Higher priority drains first; equal priority
/// preserves submission order; failed tasks re-enter at the head after
/// backoff until their retry budget runs out.
pub struct WorkQueue {
    pub(crate) inner: Arc<QueueInner>,
}

impl WorkQueue {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                config,
                heap: Mutex::new(BinaryHeap::new()),
                notify: Notify::new(),
                backpressure: Arc::new(AtomicBool::new(false)),
                shutting_down: AtomicBool::new(false),
                tail_seq: AtomicI64::new(0),
                head_seq: AtomicI64::new(-1),
                next_task_id: AtomicU64::new(1),
                in_flight: AtomicUsize::new(0),
                observers: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn add_observer(&self, observer: Arc<dyn QueueObserver>) {
        self.inner.observers.lock().unwrap().push(observer);
    }

    /// Flag shared with the memory monitor; while set, submissions are
    /// rejected with `Backpressure`.
    pub fn backpressure_flag(&self) -> Arc<AtomicBool> {
        self.inner.backpressure.clone()
    }

    pub fn len(&self) -> usize {
        self.inner.heap.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::SeqCst)
    }

    pub fn submit(&self, priority: u8, job: Arc<dyn Job>) -> Result<TaskHandle, QueueError> {
        let inner = &self.inner;
        if inner.shutting_down.load(Ordering::SeqCst) {
            return Err(QueueError::ShuttingDown);
        }
        if inner.backpressure.load(Ordering::SeqCst) {
            return Err(QueueError::Backpressure {
                retry_after: Duration::from_millis(1_000),
            });
        }
        if self.len() >= inner.config.max_size {
            return Err(QueueError::Full {
                max_size: inner.config.max_size,
            });
        }

        let task_id = inner.next_task_id.fetch_add(1, Ordering::SeqCst);
        let (done_tx, done_rx) = oneshot::channel();
        inner.push(QueuedTask {
            id: task_id,
            priority,
            seq: inner.tail_seq.fetch_add(1, Ordering::SeqCst),
            attempt: 0,
            job,
            done: done_tx,
        });
        inner.emit(QueueEvent::Enqueued { task_id, priority });

        Ok(TaskHandle {
            task_id,
            rx: done_rx,
        })
    }
}
