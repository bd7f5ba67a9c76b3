//! Ownership of listener tasks and timers.
//!
//! A view that opens subscriptions or starts timers registers them with a
//! [`TeardownScope`]; closing the scope (explicitly or on drop) aborts every
//! task and runs every registered hook, so no listener outlives its view.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use tokio::task::JoinHandle;
use tracing::debug;

type Hook = Box<dyn FnOnce() + Send>;

#[derive(Default)]
pub struct TeardownScope {
    tasks: Mutex<Vec<JoinHandle<()>>>,
    hooks: Mutex<Vec<Hook>>,
    closed: AtomicBool,
}

impl TeardownScope {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn a task owned by this scope. On a closed scope the task is
    /// aborted immediately.
    pub fn spawn<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.track(tokio::spawn(fut));
    }

    pub fn track(&self, handle: JoinHandle<()>) {
        if self.is_closed() {
            handle.abort();
            return;
        }
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        tasks.retain(|t| !t.is_finished());
        tasks.push(handle);
    }

    /// Run `hook` when the scope closes. Hooks run in reverse registration
    /// order; on a closed scope the hook runs immediately.
    pub fn on_close(&self, hook: impl FnOnce() + Send + 'static) {
        if self.is_closed() {
            hook();
            return;
        }
        self.hooks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Box::new(hook));
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let hooks = std::mem::take(&mut *self.hooks.lock().unwrap_or_else(PoisonError::into_inner));
        for hook in hooks.into_iter().rev() {
            hook();
        }
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        debug!(tasks = tasks.len(), "Closing teardown scope");
        for task in tasks {
            task.abort();
        }
    }
}

impl Drop for TeardownScope {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for TeardownScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TeardownScope")
            .field("closed", &self.is_closed())
            .finish()
    }
}
