// Cancellation and supervision for the console's background loops.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::debug;

/// Lock a mutex, carrying on with the data if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// A simple cancel token for stopping background work
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

#[derive(Debug, Default)]
struct CancelInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves once `cancel` has been called.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

/// A spawned task that owns its cancel token. Dropping the handle cancels and
/// aborts the task.
#[derive(Debug)]
pub struct SupervisedTask {
    name: &'static str,
    cancel: CancelToken,
    handle: Option<JoinHandle<()>>,
}

impl SupervisedTask {
    pub fn spawn<F, Fut>(name: &'static str, f: F) -> Self
    where
        F: FnOnce(CancelToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let cancel = CancelToken::new();
        let handle = tokio::spawn(f(cancel.clone()));
        debug!("Spawned supervised task {}", name);
        Self {
            name,
            cancel,
            handle: Some(handle),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().is_none_or(|h| h.is_finished())
    }

    pub fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            debug!("Stopping supervised task {}", self.name);
            self.cancel.cancel();
            handle.abort();
        }
    }

    /// Let the task run to completion on its own.
    pub fn detach(mut self) {
        self.handle.take();
    }
}

impl Drop for SupervisedTask {
    fn drop(&mut self) {
        self.stop();
    }
}
