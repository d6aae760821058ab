use std::sync::atomic::{AtomicU64, Ordering};

/// Snapshot of the counters of a task processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[non_exhaustive]
pub struct TaskProcessorStats {
    /// Tasks submitted so far.
    pub created: u64,
    /// Tasks that completed, whatever their outcome.
    pub finished: u64,
    /// Finished tasks that had a cancellation request.
    pub cancelled: u64,
    /// Submissions that found the processor overloaded.
    pub overloaded: u64,
    /// Overloading submissions that were cancelled.
    pub cancelled_by_overload: u64,
    /// Tasks currently queued.
    pub queue_size: usize,
    /// Tasks submitted and not finished yet.
    pub alive: usize,
    pub worker_threads: usize,
}

#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub(crate) created: AtomicU64,
    pub(crate) finished: AtomicU64,
    pub(crate) cancelled: AtomicU64,
    pub(crate) overloaded: AtomicU64,
    pub(crate) cancelled_by_overload: AtomicU64,
}

impl Counters {
    pub(crate) fn incr(counter: &AtomicU64) -> u64 {
        counter.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn snapshot(&self, queue_size: usize, alive: usize, worker_threads: usize) -> TaskProcessorStats {
        TaskProcessorStats {
            created: self.created.load(Ordering::Relaxed),
            finished: self.finished.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            overloaded: self.overloaded.load(Ordering::Relaxed),
            cancelled_by_overload: self.cancelled_by_overload.load(Ordering::Relaxed),
            queue_size,
            alive,
            worker_threads,
        }
    }
}
