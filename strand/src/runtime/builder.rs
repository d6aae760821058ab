use crate::runtime::{TaskProcessor, TaskProcessorSettings};
use anyhow::{Result, bail};
use std::convert::TryFrom;
use std::fmt;
use std::sync::Arc;
use std::thread;

/// Default name of a task processor.
const DEFAULT_NAME: &str = "main";

/// How many ticks before a worker pulls from the global queue first.
const GLOBAL_QUEUE_INTERVAL: u32 = 31;

/// Maximum number of stealing attempts before a worker parks.
const MAX_STEAL_RETRIES: usize = 3;

const TIMER_THREADS: usize = 1;

/// Below this, worker threads would not survive a moderately deep task.
const MIN_THREAD_STACK_SIZE: usize = 64 * 1024;

/// Pthread names are truncated beyond 15 bytes.
const MAX_THREAD_NAME_LEN: usize = 15;

#[derive(Clone)]
pub(crate) struct ThreadNameFn(pub(crate) Arc<dyn Fn(usize) -> String + Send + Sync + 'static>);

impl ThreadNameFn {
    fn prefixed(prefix: String) -> Self {
        Self(Arc::new(move |index| format!("{prefix}_{index}")))
    }

    pub(crate) fn name(&self, index: usize) -> String {
        (self.0)(index)
    }
}

impl fmt::Debug for ThreadNameFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ThreadNameFn").field(&"<function>").finish()
    }
}

/// Configures and creates a [`TaskProcessor`].
///
/// # Example
///
/// ```no_run
/// use std::time::Duration;
/// use strand::runtime::{Builder, OverloadAction, TaskProcessorSettings};
///
/// let processor = Builder::new()
///     .name("io")
///     .worker_threads(4)
///     .settings(TaskProcessorSettings {
///         wait_queue_time_limit: Some(Duration::from_millis(50)),
///         wait_queue_length_limit: None,
///         overload_action: OverloadAction::Cancel,
///     })
///     .try_build()
///     .unwrap();
///
/// assert_eq!(processor.block_on(async { 1 + 1 }), 2);
/// ```
#[derive(Debug)]
pub struct Builder {
    /// Name of the processor, used in logs and as default thread name prefix.
    name: String,

    /// Number of worker threads. Defaults to one per core.
    worker_threads: Option<usize>,

    /// Worker thread names, defaults to `{name}_{index}`.
    thread_name: Option<ThreadNameFn>,

    thread_stack_size: Option<usize>,

    /// How many ticks before pulling a task from the global queue.
    global_queue_interval: u32,

    /// How many times a worker loops over the global queue and other
    /// workers' queues looking for work before it parks.
    max_steal_retries: usize,

    /// Size of the timer thread pool serving deadlines of this processor.
    timer_threads: usize,

    settings: TaskProcessorSettings,
}

impl Builder {
    pub fn new() -> Self {
        Self {
            name: DEFAULT_NAME.to_string(),
            worker_threads: None,
            thread_name: None,
            thread_stack_size: None,
            global_queue_interval: GLOBAL_QUEUE_INTERVAL,
            max_steal_retries: MAX_STEAL_RETRIES,
            timer_threads: TIMER_THREADS,
            settings: TaskProcessorSettings::default(),
        }
    }

    pub fn name(mut self, val: impl Into<String>) -> Self {
        self.name = val.into();
        self
    }

    /// Defaults to 1 worker per CPU core.
    #[track_caller]
    pub fn worker_threads(mut self, val: usize) -> Self {
        assert!(val > 0, "worker_threads must be greater than 0");
        self.worker_threads = Some(val);
        self
    }

    /// Worker threads are named `{prefix}_{index}`.
    pub fn thread_name(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name = Some(ThreadNameFn::prefixed(prefix.into()));
        self
    }

    /// Sets a function generating the name of the worker with the given
    /// index.
    pub fn thread_name_fn<F>(mut self, f: F) -> Self
    where
        F: Fn(usize) -> String + Send + Sync + 'static,
    {
        self.thread_name = Some(ThreadNameFn(Arc::new(f)));
        self
    }

    /// Sets the stack size (in bytes) for worker threads.
    ///
    /// The actual stack size may be greater than this value if the platform
    /// specifies minimal stack size.
    #[track_caller]
    pub fn thread_stack_size(mut self, val: usize) -> Self {
        assert!(
            val.is_power_of_two(),
            "thread_stack_size must be a power of two"
        );
        self.thread_stack_size = Some(val);
        self
    }

    /// Sets the number of ticks after which a worker polls the global queue
    /// before its local queue.
    ///
    /// A tick is one step of a task. A smaller value gets newly submitted
    /// tasks started sooner at the cost of more synchronization. Setting it
    /// to `1` makes workers prefer the global queue at every step.
    #[track_caller]
    pub fn global_queue_interval(mut self, val: u32) -> Self {
        assert!(val > 0, "global_queue_interval must be greater than 0");
        self.global_queue_interval = val;
        self
    }

    #[track_caller]
    pub fn max_steal_retries(mut self, val: usize) -> Self {
        assert!(val > 0, "max_steal_retries must be greater than 0");
        self.max_steal_retries = val;
        self
    }

    #[track_caller]
    pub fn timer_threads(mut self, val: usize) -> Self {
        assert!(val > 0, "timer_threads must be greater than 0");
        self.timer_threads = val;
        self
    }

    /// Initial overload policy.
    pub fn settings(mut self, settings: TaskProcessorSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Creates the configured [`TaskProcessor`]. Its workers are running and
    /// ready to accept tasks once this returns.
    pub fn try_build(self) -> Result<TaskProcessor> {
        TaskProcessor::new(self.try_into()?)
    }
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

/// Validated configuration of a task processor.
#[derive(Debug, Clone)]
pub struct TaskProcessorConfig {
    pub(crate) name: String,
    pub(crate) worker_threads: usize,
    pub(crate) thread_name: ThreadNameFn,
    pub(crate) thread_stack_size: Option<usize>,
    pub(crate) global_queue_interval: u32,
    pub(crate) max_steal_retries: usize,
    pub(crate) timer_threads: usize,
    pub(crate) settings: TaskProcessorSettings,
}

impl TaskProcessorConfig {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn worker_threads(&self) -> usize {
        self.worker_threads
    }

    /// At most half of the workers look for work in other queues at the same
    /// time, the others park.
    pub(crate) fn max_stealers(&self) -> u32 {
        u32::try_from(self.worker_threads / 2)
            .unwrap_or(u32::MAX)
            .max(1)
    }

    fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            bail!("task processor name must not be empty");
        }

        if u32::try_from(self.worker_threads).is_err() {
            bail!("too many worker threads: {}", self.worker_threads);
        }

        if let Some(size) = self.thread_stack_size
            && size < MIN_THREAD_STACK_SIZE
        {
            bail!("thread_stack_size must be at least {MIN_THREAD_STACK_SIZE} bytes, got {size}");
        }

        let longest = self.thread_name.name(self.worker_threads - 1);
        if longest.is_empty() {
            bail!("worker thread names must not be empty");
        }
        if longest.len() > MAX_THREAD_NAME_LEN {
            tracing::debug!(
                name = %longest,
                "worker thread names exceed {MAX_THREAD_NAME_LEN} bytes and will be truncated"
            );
        }

        Ok(())
    }
}

impl TryFrom<Builder> for TaskProcessorConfig {
    type Error = anyhow::Error;

    fn try_from(builder: Builder) -> Result<Self> {
        let worker_threads = builder.worker_threads.unwrap_or_else(|| {
            thread::available_parallelism().map_or(1, |n| n.get())
        });
        let thread_name = builder
            .thread_name
            .unwrap_or_else(|| ThreadNameFn::prefixed(builder.name.clone()));

        let config = Self {
            name: builder.name,
            worker_threads,
            thread_name,
            thread_stack_size: builder.thread_stack_size,
            global_queue_interval: builder.global_queue_interval,
            max_steal_retries: builder.max_steal_retries,
            timer_threads: builder.timer_threads,
            settings: builder.settings,
        };

        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_default_thread_names() -> Result<()> {
        let config = TaskProcessorConfig::try_from(Builder::new().name("fs").worker_threads(3))?;
        assert_eq!(config.thread_name.name(0), "fs_0");
        assert_eq!(config.thread_name.name(2), "fs_2");
        Ok(())
    }

    #[test]
    fn test_thread_name_prefix_overrides_name() -> Result<()> {
        let config = TaskProcessorConfig::try_from(
            Builder::new().name("fs").thread_name("fs-worker").worker_threads(1),
        )?;
        assert_eq!(config.name(), "fs");
        assert_eq!(config.thread_name.name(0), "fs-worker_0");
        Ok(())
    }

    #[rstest]
    #[case::single(1, 1)]
    #[case::pair(2, 1)]
    #[case::odd(5, 2)]
    #[case::many(16, 8)]
    fn test_max_stealers(#[case] workers: usize, #[case] expected: u32) -> Result<()> {
        let config = TaskProcessorConfig::try_from(Builder::new().worker_threads(workers))?;
        assert_eq!(config.max_stealers(), expected);
        Ok(())
    }

    #[test]
    fn test_empty_name_is_rejected() {
        let err = TaskProcessorConfig::try_from(Builder::new().name("")).unwrap_err();
        assert!(err.to_string().contains("name"));
    }

    #[test]
    fn test_small_stack_is_rejected() {
        let err = TaskProcessorConfig::try_from(Builder::new().thread_stack_size(4096)).unwrap_err();
        assert!(err.to_string().contains("thread_stack_size"));
    }

    #[test]
    #[should_panic(expected = "worker_threads must be greater than 0")]
    fn test_zero_workers_panics() {
        let _ = Builder::new().worker_threads(0);
    }
}
