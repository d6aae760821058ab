//! Reactor threads delivering deadline expiry.
//!
//! Each timer thread owns a min-heap of deadlines and runs the callbacks of
//! expired timers on its own thread, never on a worker. Cancelled timers are
//! removed from the callback table right away and skipped lazily when their
//! heap entry surfaces. The heap is compacted once dead entries outnumber
//! live ones, so a long-lived timer at the top cannot pin them.
use anyhow::{Context, Result};
use parking_lot::{Condvar, Mutex, MutexGuard};
use smallvec::SmallVec;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

/// Dead heap entries tolerated on top of the live ones before compacting.
const COMPACTION_SLACK: usize = 64;

pub(crate) type TimerCallback = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct TimerId(u64);

struct TimerEntry {
    fire_at: Instant,
    id: TimerId,
}

// Reversed so that `BinaryHeap` pops the earliest deadline first.
impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .fire_at
            .cmp(&self.fire_at)
            .then_with(|| other.id.0.cmp(&self.id.0))
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.fire_at == other.fire_at && self.id == other.id
    }
}

impl Eq for TimerEntry {}

#[derive(Default)]
struct TimerState {
    heap: BinaryHeap<TimerEntry>,
    callbacks: HashMap<TimerId, TimerCallback>,
    next_id: u64,
}

impl TimerState {
    fn insert(&mut self, fire_at: Instant, callback: TimerCallback) -> TimerId {
        let id = TimerId(self.next_id);
        self.next_id += 1;

        self.heap.push(TimerEntry { fire_at, id });
        self.callbacks.insert(id, callback);
        id
    }

    fn remove(&mut self, id: TimerId) -> Option<TimerCallback> {
        let callback = self.callbacks.remove(&id);
        if self.heap.len() > 2 * self.callbacks.len() + COMPACTION_SLACK {
            let callbacks = &self.callbacks;
            self.heap.retain(|entry| callbacks.contains_key(&entry.id));
        }
        callback
    }

    fn next_fire_at(&mut self) -> Option<Instant> {
        // Drop cancelled entries sitting at the top.
        while let Some(entry) = self.heap.peek() {
            if self.callbacks.contains_key(&entry.id) {
                return Some(entry.fire_at);
            }
            self.heap.pop();
        }
        None
    }
}

struct Shared {
    state: Mutex<TimerState>,
    notify: Condvar,
    shutdown: AtomicBool,
}

pub(crate) struct TimerThread {
    shared: Arc<Shared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl TimerThread {
    pub(crate) fn start(name: String) -> Result<Arc<Self>> {
        let shared = Arc::new(Shared {
            state: Mutex::new(TimerState::default()),
            notify: Condvar::new(),
            shutdown: AtomicBool::new(false),
        });

        let runner = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || run_loop(&runner))
            .with_context(|| format!("failed to spawn timer thread {name}"))?;

        Ok(Arc::new(Self {
            shared,
            handle: Mutex::new(Some(handle)),
        }))
    }

    /// Runs `callback` on the timer thread once `fire_at` is reached.
    pub(crate) fn schedule(&self, fire_at: Instant, callback: TimerCallback) -> TimerId {
        let mut state = self.shared.state.lock();
        let id = state.insert(fire_at, callback);
        self.shared.notify.notify_one();
        id
    }

    /// Returns `false` if the timer already fired or was cancelled.
    pub(crate) fn cancel(&self, id: TimerId) -> bool {
        let callback = self.shared.state.lock().remove(id);
        callback.is_some()
    }

    /// Cancels `id` and schedules `callback` in a single critical section.
    pub(crate) fn reschedule(
        &self,
        id: TimerId,
        fire_at: Instant,
        callback: TimerCallback,
    ) -> TimerId {
        let mut state = self.shared.state.lock();
        let old = state.remove(id);
        let id = state.insert(fire_at, callback);
        self.shared.notify.notify_one();
        drop(state);

        // The old callback may own the last reference to a task.
        drop(old);
        id
    }

    pub(crate) fn pending(&self) -> usize {
        self.shared.state.lock().callbacks.len()
    }

    #[cfg(test)]
    fn heap_len(&self) -> usize {
        self.shared.state.lock().heap.len()
    }

    /// Stops the thread. Timers that did not fire yet are dropped without
    /// running.
    pub(crate) fn stop(&self) {
        self.shared.shutdown.store(true, AtomicOrdering::Release);
        {
            let _state = self.shared.state.lock();
            self.shared.notify.notify_one();
        }

        if let Some(handle) = self.handle.lock().take() {
            if handle.join().is_err() {
                tracing::error!("timer thread panicked");
            }
        }

        let callbacks = std::mem::take(&mut self.shared.state.lock().callbacks);
        drop(callbacks);
    }
}

fn run_loop(shared: &Shared) {
    tracing::debug!("timer thread started");

    let mut state = shared.state.lock();
    loop {
        if shared.shutdown.load(AtomicOrdering::Acquire) {
            break;
        }

        let now = Instant::now();
        let mut due = SmallVec::<[TimerCallback; 8]>::new();
        while let Some(fire_at) = state.next_fire_at() {
            if fire_at > now {
                break;
            }
            if let Some(entry) = state.heap.pop() {
                if let Some(callback) = state.callbacks.remove(&entry.id) {
                    due.push(callback);
                }
            }
        }

        if !due.is_empty() {
            MutexGuard::unlocked(&mut state, || due.into_iter().for_each(|callback| callback()));
            continue;
        }

        match state.next_fire_at() {
            Some(fire_at) => {
                shared.notify.wait_until(&mut state, fire_at);
            }
            None => shared.notify.wait(&mut state),
        }
    }

    tracing::debug!("timer thread stopped");
}

/// Fixed set of timer threads shared by the tasks of one processor.
pub(crate) struct TimerThreadPool {
    threads: Vec<Arc<TimerThread>>,
    next: AtomicUsize,
}

impl TimerThreadPool {
    pub(crate) fn start(name: &str, size: usize) -> Result<Self> {
        let mut threads = Vec::with_capacity(size);
        for index in 0..size {
            match TimerThread::start(format!("{name}-timer_{index}")) {
                Ok(thread) => threads.push(thread),
                Err(e) => {
                    threads.iter().for_each(|thread| thread.stop());
                    return Err(e);
                }
            }
        }

        Ok(Self {
            threads,
            next: AtomicUsize::new(0),
        })
    }

    /// Round-robins over the threads of the pool.
    pub(crate) fn next_timer_thread(&self) -> Arc<TimerThread> {
        let index = self.next.fetch_add(1, AtomicOrdering::Relaxed) % self.threads.len();
        Arc::clone(&self.threads[index])
    }

    pub(crate) fn stop(&self) {
        self.threads.iter().for_each(|thread| thread.stop());
    }
}
