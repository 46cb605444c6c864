//! Sequential job queue.
//!
//! Jobs run one at a time in the order they were enqueued. A job that fails
//! or panics only affects its own waiter; the worker moves on to the next job.

use crate::error::{ClientError, Result};
use futures::FutureExt;
use parking_lot::Mutex;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

type Job = Pin<Box<dyn Future<Output = ()> + Send>>;

pub struct WorkQueue {
    name: Arc<str>,
    tx: mpsc::UnboundedSender<Job>,
    /// Taken by the worker when it starts
    rx: Mutex<Option<mpsc::UnboundedReceiver<Job>>>,
    pending: Arc<AtomicUsize>,
}

impl std::fmt::Debug for WorkQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkQueue")
            .field("name", &self.name)
            .field("pending", &self.pending())
            .finish()
    }
}

impl WorkQueue {
    /// Create a queue. The worker starts on the first enqueue made inside a
    /// Tokio runtime; jobs enqueued before that wait in order.
    pub fn new(name: impl Into<String>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            name: Arc::from(name.into()),
            tx,
            rx: Mutex::new(Some(rx)),
            pending: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Jobs enqueued and not yet finished.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Queue `job`. Its position is fixed now; the returned future only
    /// waits for the result.
    pub fn enqueue<F, T>(&self, job: F) -> impl Future<Output = Result<T>> + Send + 'static
    where
        F: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let (result_tx, result_rx) = oneshot::channel();
        let pending = self.pending.clone();
        let name = self.name.clone();

        pending.fetch_add(1, Ordering::SeqCst);
        let wrapped: Job = Box::pin(async move {
            let result = match AssertUnwindSafe(job).catch_unwind().await {
                Ok(result) => result,
                Err(_) => {
                    warn!("Job panicked in work queue {}", name);
                    Err(ClientError::Job(format!("job panicked in {}", name)))
                }
            };
            pending.fetch_sub(1, Ordering::SeqCst);
            // The caller may have stopped waiting.
            let _ = result_tx.send(result);
        });

        if self.tx.send(wrapped).is_err() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
        }
        self.ensure_worker();

        let name = self.name.clone();
        async move {
            result_rx
                .await
                .map_err(|_| ClientError::Job(format!("work queue {} stopped", name)))?
        }
    }

    fn ensure_worker(&self) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let Some(mut rx) = self.rx.lock().take() else {
            return;
        };

        let name = self.name.clone();
        handle.spawn(async move {
            debug!("Work queue {} started", name);
            while let Some(job) = rx.recv().await {
                job.await;
                tokio::task::yield_now().await;
            }
            debug!("Work queue {} stopped", name);
        });
    }
}
