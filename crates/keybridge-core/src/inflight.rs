//! Tracking of requests currently being served, so a `cancel` signal from
//! the caller can abort them.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::oneshot;
use tokio::task::AbortHandle;

use crate::envelope::CallKey;

struct Task {
    generation: u64,
    handle: AbortHandle,
}

#[derive(Clone, Default)]
pub(crate) struct InFlight {
    tasks: Arc<Mutex<HashMap<CallKey, Task>>>,
    next_generation: Arc<AtomicU64>,
}

/// Removes a task's entry when the task ends, however it ends.
struct Deregister {
    tracker: InFlight,
    key: CallKey,
    generation: u64,
}

impl Drop for Deregister {
    fn drop(&mut self) {
        let mut tasks = self.tracker.tasks();
        // The key may already belong to a newer task after a cancel.
        if tasks
            .get(&self.key)
            .is_some_and(|t| t.generation == self.generation)
        {
            tasks.remove(&self.key);
        }
    }
}

impl InFlight {
    fn tasks(&self) -> MutexGuard<'_, HashMap<CallKey, Task>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `work` on its own task under `key`.
    ///
    /// Returns `false` without spawning if `key` is already being served. The
    /// entry is removed when the task finishes, panics or is aborted.
    pub(crate) fn spawn<F>(&self, key: CallKey, work: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut tasks = self.tasks();
        if tasks.contains_key(&key) {
            return false;
        }

        // The task must not finish before its handle is recorded, or the
        // finished entry would never be removed.
        let (start_tx, start_rx) = oneshot::channel::<()>();
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let deregister = Deregister {
            tracker: self.clone(),
            key: key.clone(),
            generation,
        };
        let handle = tokio::spawn(async move {
            let _deregister = deregister;
            if start_rx.await.is_err() {
                return;
            }
            work.await;
        });
        tasks.insert(
            key,
            Task {
                generation,
                handle: handle.abort_handle(),
            },
        );
        drop(tasks);
        let _ = start_tx.send(());
        true
    }

    /// Abort the task serving `key`. Returns whether one was running.
    pub(crate) fn cancel(&self, key: &CallKey) -> bool {
        let removed = self.tasks().remove(key);
        match removed {
            Some(task) => {
                task.handle.abort();
                true
            }
            None => false,
        }
    }

    /// Abort every task.
    pub(crate) fn abort_all(&self) {
        let drained: Vec<Task> = self.tasks().drain().map(|(_, task)| task).collect();
        for task in drained {
            task.handle.abort();
        }
    }

    /// Number of tasks still running.
    pub(crate) fn len(&self) -> usize {
        self.tasks().len()
    }
}
