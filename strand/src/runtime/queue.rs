//! Run queue of a task processor.
//!
//! Every worker owns a FIFO local queue other workers can steal from. Tasks
//! scheduled from a worker of the same processor go to that worker's local
//! queue, everything else goes through the global injector. Idle workers
//! steal, then park. [`ConsumersState`] decides when a producer has to unpark
//! one of them.
use crate::context;
use crate::runtime::consumers::ConsumersState;
use crate::task::TaskContext;
use crossbeam_deque::{Injector, Steal, Stealer, Worker};
use std::fmt;
use std::iter;
use std::sync::atomic::{self, AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, Thread};

pub(crate) type Scheduled = Arc<TaskContext>;

/// Identifies the queue a [`LocalQueue`] belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct QueueId(usize);

impl QueueId {
    fn next() -> Self {
        static NEXT_ID: AtomicUsize = AtomicUsize::new(1);
        Self(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// The half of the run queue owned by one worker thread.
pub(crate) struct LocalQueue {
    index: usize,
    queue_id: QueueId,
    worker: Worker<Scheduled>,

    /// Every other worker's queue, in a per-worker random order to spread
    /// contention.
    stealers: Vec<Stealer<Scheduled>>,
}

impl LocalQueue {
    pub(crate) fn index(&self) -> usize {
        self.index
    }

    fn has_stealable_work(&self) -> bool {
        !self.worker.is_empty() || self.stealers.iter().any(|s| !s.is_empty())
    }
}

impl fmt::Debug for LocalQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalQueue")
            .field("index", &self.index)
            .field("queue_id", &self.queue_id)
            .field("len", &self.worker.len())
            .finish()
    }
}

#[derive(Debug, Default)]
struct Parker {
    thread: OnceLock<Thread>,
    notified: AtomicBool,
}

impl Parker {
    fn unpark(&self) {
        self.notified.store(true, Ordering::Release);
        if let Some(thread) = self.thread.get() {
            thread.unpark();
        }
    }
}

pub(crate) struct TaskQueue {
    id: QueueId,
    global: Injector<Scheduled>,
    consumers: ConsumersState,
    max_stealers: u32,
    max_steal_retries: usize,

    /// Tasks pushed and not popped yet.
    size: AtomicUsize,

    parkers: Vec<Parker>,

    /// LIFO of parked worker indices. The last parked worker has the hottest
    /// cache.
    parked: parking_lot::Mutex<Vec<usize>>,

    stopped: AtomicBool,
}

impl TaskQueue {
    /// Creates the queue with one local queue per worker, to be handed to
    /// the worker threads.
    pub(crate) fn new(
        workers: usize,
        max_stealers: u32,
        max_steal_retries: usize,
    ) -> (Self, Vec<LocalQueue>) {
        let id = QueueId::next();
        let locals = (0..workers).map(|_| Worker::new_fifo()).collect::<Vec<_>>();
        let stealers = locals.iter().map(Worker::stealer).collect::<Vec<_>>();

        let locals = locals
            .into_iter()
            .enumerate()
            .map(|(index, worker)| {
                let mut others = stealers
                    .iter()
                    .enumerate()
                    .filter(|(j, _)| *j != index)
                    .map(|(_, s)| s.clone())
                    .collect::<Vec<_>>();
                fastrand::shuffle(&mut others);

                LocalQueue {
                    index,
                    queue_id: id,
                    worker,
                    stealers: others,
                }
            })
            .collect();

        let queue = Self {
            id,
            global: Injector::new(),
            consumers: ConsumersState::default(),
            max_stealers,
            max_steal_retries,
            size: AtomicUsize::new(0),
            parkers: iter::repeat_with(Parker::default).take(workers).collect(),
            parked: parking_lot::Mutex::new(Vec::with_capacity(workers)),
            stopped: AtomicBool::new(false),
        };

        (queue, locals)
    }

    pub(crate) fn len(&self) -> usize {
        self.size.load(Ordering::Relaxed)
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// `true` on the worker threads of this queue.
    pub(crate) fn is_current_worker(&self) -> bool {
        context::with_local_queue(|local| local.is_some_and(|local| local.queue_id == self.id))
    }

    pub(crate) fn push(&self, task: Scheduled) {
        self.size.fetch_add(1, Ordering::Relaxed);

        // Schedules from one of our workers stay on that worker.
        let task = context::with_local_queue(|local| match local {
            Some(local) if local.queue_id == self.id => {
                local.worker.push(task);
                None
            }
            _ => Some(task),
        });
        if let Some(task) = task {
            self.global.push(task);
        }

        // Pairs with the fence in `park`: either we see the sleeper, or the
        // sleeper sees our task.
        atomic::fence(Ordering::SeqCst);
        if self.consumers.load().should_wake() {
            self.unpark_one();
        }
    }

    /// Pops the next task for the worker owning `local`, parking the thread
    /// while there is none. Returns `None` once the queue is stopped.
    pub(crate) fn pop_blocking(&self, local: &LocalQueue, prefer_global: bool) -> Option<Scheduled> {
        debug_assert_eq!(local.queue_id, self.id);

        loop {
            if let Some(task) = self.try_pop(local, prefer_global) {
                self.size.fetch_sub(1, Ordering::Relaxed);
                return Some(task);
            }
            if self.is_stopped() {
                return None;
            }
            if !self.park(local) {
                // Work showed up while we were about to park, but every
                // stealer slot may still be taken.
                thread::yield_now();
            }
        }
    }

    fn try_pop(&self, local: &LocalQueue, prefer_global: bool) -> Option<Scheduled> {
        if prefer_global
            && let Some(task) = self.global.steal_batch_and_pop(&local.worker).success()
        {
            return Some(task);
        }

        local.worker.pop().or_else(|| self.steal(local))
    }

    fn steal(&self, local: &LocalQueue) -> Option<Scheduled> {
        let mut consumers = self.consumers.load();
        loop {
            if consumers.stealers() >= self.max_stealers {
                return None;
            }
            match self.consumers.try_increment_stealers(consumers) {
                Ok(_) => break,
                Err(actual) => consumers = actual,
            }
        }

        let task = iter::repeat_with(|| {
            // The first success wins, we are not iterating over every stealer
            // each time.
            self.global
                .steal_batch_and_pop(&local.worker)
                .or_else(|| local.stealers.iter().map(Stealer::steal).collect())
        })
        .take(self.max_steal_retries)
        .find(|s| !s.is_retry())
        .and_then(Steal::success);

        let consumers = self.consumers.decrement_stealers();

        // The last stealer found work but there may be more, possibly left
        // behind in the queue of a busy worker: hand it over to a sleeper.
        if task.is_some()
            && consumers.should_wake()
            && (!self.global.is_empty() || local.has_stealable_work())
        {
            self.unpark_one();
        }

        task
    }

    /// Parks the current worker until a producer unparks it. Returns `false`
    /// if parking was abandoned because work or a stop request showed up.
    fn park(&self, local: &LocalQueue) -> bool {
        let parker = &self.parkers[local.index];
        parker.thread.get_or_init(thread::current);

        {
            let mut parked = self.parked.lock();
            parker.notified.store(false, Ordering::Release);
            parked.push(local.index);
        }
        self.consumers.increment_sleeping();
        atomic::fence(Ordering::SeqCst);

        if !self.global.is_empty() || local.has_stealable_work() || self.is_stopped() {
            self.parked.lock().retain(|&index| index != local.index);
            self.consumers.decrement_sleeping();
            return false;
        }

        while !parker.notified.load(Ordering::Acquire) && !self.is_stopped() {
            thread::park();
        }

        self.consumers.decrement_sleeping();
        true
    }

    fn unpark_one(&self) -> bool {
        let Some(index) = self.parked.lock().pop() else {
            return false;
        };
        self.parkers[index].unpark();
        true
    }

    /// Wakes every parked worker. Workers leave their loop once the queue is
    /// drained.
    pub(crate) fn stop(&self) {
        self.stopped.store(true, Ordering::Release);

        let parked = std::mem::take(&mut *self.parked.lock());
        for index in parked {
            self.parkers[index].unpark();
        }
        // Workers between their stop check and `thread::park`.
        for parker in &self.parkers {
            if let Some(thread) = parker.thread.get() {
                thread.unpark();
            }
        }
    }
}

impl fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskQueue")
            .field("id", &self.id)
            .field("len", &self.len())
            .field("consumers", &self.consumers.load())
            .field("stopped", &self.is_stopped())
            .finish_non_exhaustive()
    }
}
