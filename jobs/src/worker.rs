use crate::queue::{QueueEvent, QueuedTask, TaskError, WorkQueue};
use std::sync::atomic::Ordering;
use std::sync::Mutex;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tracing::{error, info};

/// Worker pool draining a `WorkQueue`. Failed tasks re-enter at the head
/// of their priority class after exponential backoff; timeouts surface
/// as `Timeout` without retry; shutdown awaits in-flight tasks and
/// cancels pending ones.
pub struct WorkerPool {
    queue: WorkQueue,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn start(queue: WorkQueue) -> Self {
        let concurrency = queue.inner.config.concurrency.max(1);
        let mut handles = Vec::with_capacity(concurrency);
        for worker_id in 0..concurrency {
            let inner = queue.inner.clone();
            handles.push(tokio::spawn(async move {
                loop {
                    let Some(task) = inner.pop() else {
                        if inner.shutting_down.load(Ordering::SeqCst) {
                            break;
                        }
                        // bounded wait so a shutdown raised between the
                        // flag check and this await cannot strand us
                        let _ = timeout(Duration::from_millis(50), inner.notify.notified()).await;
                        continue;
                    };

                    if inner.shutting_down.load(Ordering::SeqCst) {
                        // pending tasks are not started during shutdown
                        let _ = task.done.send(Err(TaskError::Cancelled));
                        continue;
                    }

                    run_task(&inner, task, worker_id).await;
                }
            }));
        }
        Self {
            queue,
            handles: Mutex::new(handles),
        }
    }

    pub fn queue(&self) -> &WorkQueue {
        &self.queue
    }

    /// Graceful shutdown: in-flight tasks are awaited, pending tasks are
    /// cancelled without starting.
    pub async fn shutdown(&self) {
        self.queue
            .inner
            .shutting_down
            .store(true, Ordering::SeqCst);
        self.queue.inner.notify.notify_waiters();

        let handles: Vec<JoinHandle<()>> = {
            let mut guard = self.handles.lock().unwrap();
            guard.drain(..).collect()
        };
        for handle in handles {
            let _ = handle.await;
        }

        while let Some(task) = self.queue.inner.pop() {
            let _ = task.done.send(Err(TaskError::Cancelled));
        }
        info!("worker pool stopped");
    }
}

async fn run_task(inner: &std::sync::Arc<crate::queue::QueueInner>, task: QueuedTask, worker_id: usize) {
    let QueuedTask {
        id,
        priority,
        attempt,
        job,
        done,
        ..
    } = task;

    inner.in_flight.fetch_add(1, Ordering::SeqCst);
    inner.emit(QueueEvent::Processing { task_id: id });
    let started = Instant::now();

    let outcome = timeout(
        Duration::from_millis(inner.config.timeout_ms),
        job.run(),
    )
    .await;
    inner.in_flight.fetch_sub(1, Ordering::SeqCst);

    match outcome {
        Ok(Ok(())) => {
            inner.emit(QueueEvent::Completed {
                task_id: id,
                latency: started.elapsed(),
            });
            let _ = done.send(Ok(()));
        }
        Ok(Err(cause)) => {
            if attempt < inner.config.max_retries {
                let next_attempt = attempt + 1;
                inner.emit(QueueEvent::Retry {
                    task_id: id,
                    attempt: next_attempt,
                });

                let delay_ms = inner.config.initial_delay_ms as f64
                    * inner.config.backoff_factor.powi(attempt as i32);
                let inner = inner.clone();
                // requeue after backoff without tying up the worker
                tokio::spawn(async move {
                    sleep(Duration::from_millis(delay_ms as u64)).await;
                    let seq = inner.head_seq.fetch_sub(1, Ordering::SeqCst);
                    inner.push(QueuedTask {
                        id,
                        priority,
                        seq,
                        attempt: next_attempt,
                        job,
                        done,
                    });
                });
            } else {
                error!(task_id = id, worker_id, error = %cause, "task failed permanently");
                inner.emit(QueueEvent::Failed {
                    task_id: id,
                    error: cause.to_string(),
                });
                let _ = done.send(Err(TaskError::Failed(cause.to_string())));
            }
        }
        Err(_elapsed) => {
            inner.emit(QueueEvent::TimedOut { task_id: id });
            let _ = done.send(Err(TaskError::Timeout));
        }
    }
}
