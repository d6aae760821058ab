use crate::deadline::Deadline;
use crate::runtime::{Builder, TaskProcessor};
use crate::sync::wait_list::Waiter;
use crate::task::{Importance, TaskContext, WaitMode};
use anyhow::Result;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Counts the wakeups it receives.
#[derive(Debug, Clone, Default)]
pub(crate) struct MockWaiter {
    wakeups: Arc<AtomicUsize>,
}

impl MockWaiter {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn wakeups(&self) -> usize {
        self.wakeups.load(Ordering::SeqCst)
    }
}

impl Waiter for MockWaiter {
    fn wake(&self) {
        self.wakeups.fetch_add(1, Ordering::SeqCst);
    }
}

pub(crate) fn test_processor(worker_threads: usize) -> Result<TaskProcessor> {
    Builder::new()
        .name("test")
        .worker_threads(worker_threads)
        .try_build()
}

/// A task context that is never submitted.
pub(crate) fn noop_task(processor: &TaskProcessor) -> Arc<TaskContext> {
    TaskContext::new(
        Arc::clone(processor.shared()),
        Importance::Normal,
        WaitMode::Single,
        Deadline::UNREACHABLE,
        Box::pin(async {}),
    )
}
