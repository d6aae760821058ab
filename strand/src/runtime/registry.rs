use crate::task::{CancellationReason, Id, TaskContext};
use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

// Every task alive on a task processor, from submission to completion. Keeps
// detached and abandoned tasks alive until they finish, and lets shutdown
// reach all of them.
#[derive(Debug, Default)]
pub(crate) struct Registry {
    tasks: DashMap<Id, Arc<TaskContext>>,

    // Tracked separately, `DashMap::len` iterates over all shards.
    size: AtomicUsize,

    // Set once the workers are gone, nothing could run new tasks anymore.
    closed: AtomicBool,

    drained_lock: Mutex<()>,
    drained: Condvar,
}

impl Registry {
    pub(crate) fn insert(&self, context: &Arc<TaskContext>) {
        assert!(
            !self.is_closed(),
            "task {} submitted to a task processor that is shut down",
            context.id()
        );
        self.size.fetch_add(1, Ordering::Relaxed);
        self.tasks.insert(context.id(), Arc::clone(context));
    }

    pub(crate) fn remove(&self, id: &Id) -> Option<Arc<TaskContext>> {
        let (_, context) = self.tasks.remove(id)?;
        if self.size.fetch_sub(1, Ordering::AcqRel) == 1 {
            let _guard = self.drained_lock.lock();
            self.drained.notify_all();
        }
        Some(context)
    }

    pub(crate) fn len(&self) -> usize {
        self.size.load(Ordering::Acquire)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// Requests cancellation of every live task. Returns how many were
    /// signalled.
    pub(crate) fn cancel_all(&self, reason: CancellationReason) -> usize {
        // Collected first, cancelling may schedule and finish tasks which
        // removes them from the map.
        let tasks = self
            .tasks
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect::<Vec<_>>();

        for task in &tasks {
            task.request_cancel(reason);
        }
        tasks.len()
    }

    /// Blocks until no task is left, calling `on_timeout` every `interval`
    /// with the number of tasks still alive.
    pub(crate) fn wait_drained(&self, interval: Duration, mut on_timeout: impl FnMut(usize)) {
        let mut guard = self.drained_lock.lock();
        while self.len() > 0 {
            if self.drained.wait_for(&mut guard, interval).timed_out() {
                on_timeout(self.len());
            }
        }
    }
}
