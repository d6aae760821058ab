use crate::runtime::builder::TaskProcessorConfig;
use crate::runtime::queue::TaskQueue;
use crate::runtime::registry::Registry;
use crate::runtime::settings::{AtomicSettings, OverloadAction, TaskProcessorSettings};
use crate::runtime::stats::{Counters, TaskProcessorStats};
use crate::runtime::worker;
use crate::task::{CancellationReason, TaskContext, TaskError, TaskFactory, TaskWithResult};
use crate::timer::TimerThreadPool;
use crate::utils::LogRateLimiter;
use anyhow::Result;
use parking_lot::Mutex;
use std::fmt;
use std::future::Future;
use std::panic;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// How often shutdown reports tasks that keep it waiting.
const SHUTDOWN_LOG_INTERVAL: Duration = Duration::from_secs(1);

/// State shared by the workers, the handles and every task of one task
/// processor.
pub(crate) struct Shared {
    config: TaskProcessorConfig,
    queue: TaskQueue,
    registry: Registry,
    settings: AtomicSettings,
    counters: Counters,

    /// Set from the queue wait time observed at dequeue.
    overloaded: AtomicBool,
    overload_log: LogRateLimiter,

    shutting_down: AtomicBool,
    timers: TimerThreadPool,
}

impl Shared {
    pub(crate) fn name(&self) -> &str {
        &self.config.name
    }

    pub(crate) fn config(&self) -> &TaskProcessorConfig {
        &self.config
    }

    pub(crate) fn queue(&self) -> &TaskQueue {
        &self.queue
    }

    pub(crate) fn timers(&self) -> &TimerThreadPool {
        &self.timers
    }

    /// Tracks a task from its submission until it finishes.
    pub(crate) fn register(&self, task: &Arc<TaskContext>) {
        self.registry.insert(task);
        Counters::incr(&self.counters.created);
    }

    pub(crate) fn task_finished(&self, task: &Arc<TaskContext>) {
        Counters::incr(&self.counters.finished);
        if task.is_cancel_requested() {
            Counters::incr(&self.counters.cancelled);
        }
        self.registry.remove(&task.id());
    }

    /// Queues a task that was woken up.
    pub(crate) fn schedule(&self, task: Arc<TaskContext>) {
        if self.settings.time_limit().is_some() {
            task.set_queue_wait_timepoint(Instant::now());
        }

        if self.shutting_down.load(Ordering::SeqCst) {
            task.request_cancel(CancellationReason::Shutdown);
        } else if !task.is_critical() && self.is_overloaded() {
            self.handle_overload(&task);
        }

        self.queue.push(task);
    }

    fn is_overloaded(&self) -> bool {
        self.overloaded.load(Ordering::Relaxed)
            || self
                .settings
                .length_limit()
                .is_some_and(|limit| self.queue.len() >= limit)
    }

    fn handle_overload(&self, task: &Arc<TaskContext>) {
        Counters::incr(&self.counters.overloaded);
        let action = self.settings.overload_action();

        if let Some(occurrences) = self.overload_log.check() {
            tracing::warn!(
                processor = %self.name(),
                task_id = %task.id(),
                ?action,
                queue_size = self.queue.len(),
                occurrences,
                "task processor overloaded"
            );
        }

        if action == OverloadAction::Cancel {
            Counters::incr(&self.counters.cancelled_by_overload);
            task.request_cancel(CancellationReason::Overload);
        }
    }

    /// Called by a worker right after dequeueing `task`.
    pub(crate) fn check_wait_time(&self, task: &TaskContext) {
        let Some(limit) = self.settings.time_limit() else {
            if self.overloaded.load(Ordering::Relaxed) {
                self.overloaded.store(false, Ordering::Relaxed);
            }
            return;
        };
        let Some(enqueued_at) = task.take_queue_wait_timepoint() else {
            return;
        };

        let waited = enqueued_at.elapsed();
        let overloaded = waited > limit;
        if self.overloaded.swap(overloaded, Ordering::Relaxed) != overloaded {
            tracing::debug!(
                processor = %self.name(),
                ?waited,
                ?limit,
                overloaded,
                "queue wait time crossed the limit"
            );
        }
    }

    pub(crate) fn set_settings(&self, settings: TaskProcessorSettings) {
        tracing::debug!(processor = %self.name(), ?settings, "task processor settings updated");
        self.settings.store(settings);
    }

    pub(crate) fn settings(&self) -> TaskProcessorSettings {
        self.settings.load()
    }

    pub(crate) fn stats(&self) -> TaskProcessorStats {
        self.counters.snapshot(
            self.queue.len(),
            self.registry.len(),
            self.config.worker_threads,
        )
    }

    /// Cancels every task, waits for all of them to finish and stops the
    /// queue. Only the first call does anything.
    fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }

        let cancelled = self.registry.cancel_all(CancellationReason::Shutdown);
        tracing::info!(
            processor = %self.name(),
            cancelled,
            "task processor shutting down"
        );

        self.registry.wait_drained(SHUTDOWN_LOG_INTERVAL, |alive| {
            tracing::warn!(
                processor = %self.name(),
                alive,
                "waiting for tasks to finish"
            );
        });

        self.registry.close();
        self.queue.stop();
    }
}

impl fmt::Debug for Shared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Shared")
            .field("name", &self.name())
            .field("queue", &self.queue)
            .field("alive", &self.registry.len())
            .field("overloaded", &self.overloaded.load(Ordering::Relaxed))
            .field("shutting_down", &self.shutting_down.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// A fixed pool of worker threads running tasks.
///
/// Dropping the processor shuts it down: every task is cancelled with
/// [`CancellationReason::Shutdown`] and the drop blocks until all of them
/// finished.
#[derive(Debug)]
pub struct TaskProcessor {
    handle: Handle,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl TaskProcessor {
    pub(crate) fn new(config: TaskProcessorConfig) -> Result<Self> {
        let timers = TimerThreadPool::start(&config.name, config.timer_threads)?;
        let (queue, locals) = TaskQueue::new(
            config.worker_threads,
            config.max_stealers(),
            config.max_steal_retries,
        );

        let shared = Arc::new(Shared {
            settings: AtomicSettings::new(config.settings),
            config,
            queue,
            registry: Registry::default(),
            counters: Counters::default(),
            overloaded: AtomicBool::new(false),
            overload_log: LogRateLimiter::default(),
            shutting_down: AtomicBool::new(false),
            timers,
        });

        let mut workers = Vec::with_capacity(locals.len());
        for local in locals {
            match worker::spawn(Arc::clone(&shared), local) {
                Ok(handle) => workers.push(handle),
                Err(e) => {
                    shared.queue.stop();
                    workers.into_iter().for_each(|h| drop(h.join()));
                    shared.timers.stop();
                    return Err(e);
                }
            }
        }

        tracing::info!(
            processor = %shared.name(),
            worker_threads = shared.config.worker_threads,
            timer_threads = shared.config.timer_threads,
            "task processor started"
        );

        Ok(Self {
            handle: Handle::new(shared),
            workers: Mutex::new(workers),
        })
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    pub(crate) fn shared(&self) -> &Arc<Shared> {
        self.handle.shared()
    }

    pub fn name(&self) -> &str {
        self.handle.name()
    }

    pub fn spawn<F>(&self, future: F) -> TaskWithResult<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.handle.spawn(future)
    }

    /// Runs `future` as a critical task and blocks the calling thread until
    /// it completes.
    ///
    /// # Panics
    ///
    /// Panics when called from a worker thread. Resumes the panic of the
    /// task, if any.
    #[track_caller]
    pub fn block_on<F>(&self, future: F) -> F::Output
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let task = TaskFactory::new(&self.handle).critical().spawn(future);
        match task.blocking_get() {
            Ok(output) => output,
            Err(TaskError::Panicked(message)) => panic::resume_unwind(Box::new(message)),
            Err(e) => panic!("block_on task did not complete: {e}"),
        }
    }

    pub fn set_settings(&self, settings: TaskProcessorSettings) {
        self.handle.set_settings(settings);
    }

    pub fn settings(&self) -> TaskProcessorSettings {
        self.handle.settings()
    }

    pub fn stats(&self) -> TaskProcessorStats {
        self.handle.stats()
    }

    /// Shuts the processor down, see the type level docs.
    pub fn shutdown(self) {
        drop(self);
    }

    fn shutdown_inner(&self) {
        let shared = self.shared();
        assert!(
            !shared.queue.is_current_worker(),
            "task processor {} shut down from one of its own workers",
            shared.name()
        );

        shared.shutdown();

        let workers = std::mem::take(&mut *self.workers.lock());
        let panicked = workers
            .into_iter()
            .filter_map(|handle| handle.join().err())
            .count();
        if panicked > 0 {
            tracing::error!(processor = %shared.name(), panicked, "worker threads panicked");
        }

        shared.timers.stop();
        tracing::info!(processor = %shared.name(), "task processor stopped");
    }
}

impl Drop for TaskProcessor {
    fn drop(&mut self) {
        self.shutdown_inner();
    }
}

/// Cheap, clonable reference to a [`TaskProcessor`].
///
/// Unlike the processor, dropping a handle does not shut anything down.
#[derive(Clone)]
pub struct Handle {
    shared: Arc<Shared>,
}

impl Handle {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }

    pub fn name(&self) -> &str {
        self.shared.name()
    }

    pub fn spawn<F>(&self, future: F) -> TaskWithResult<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        TaskFactory::new(self).spawn(future)
    }

    pub fn set_settings(&self, settings: TaskProcessorSettings) {
        self.shared.set_settings(settings);
    }

    pub fn settings(&self) -> TaskProcessorSettings {
        self.shared.settings()
    }

    pub fn stats(&self) -> TaskProcessorStats {
        self.shared.stats()
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Handle").field(&self.shared).finish()
    }
}
