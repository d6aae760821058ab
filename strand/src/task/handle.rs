//! Handles to spawned tasks.
//!
//! [`Task`] is the untyped, single-owner handle. [`TaskWithResult`] adds the
//! task outcome, [`SharedTask`] makes it clonable so that several waiters can
//! observe the same task.
//!
//! Dropping a handle to a task that is still running cancels it with
//! [`CancellationReason::Abandoned`], unless the handle was detached.
use crate::context;
use crate::current_task;
use crate::deadline::Deadline;
use crate::task::cancel::{TaskCancellationBlocker, TaskCancellationToken};
use crate::task::payload::ResultSlot;
use crate::task::sleep::{EarlyWakeup, WaitStrategy};
use crate::sync::wait_list::WaiterKey;
use crate::task::state::WakeupSource;
use crate::task::{CancellationReason, Id, State, TaskContext, TaskError, WaitMode};
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

/// Outcome of a bounded wait for a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FutureStatus {
    /// The task completed.
    Ready,
    /// The deadline was reached first.
    Timeout,
    /// The waiting task was cancelled first.
    Cancelled,
}

/// Untyped handle to a task.
pub struct Task {
    context: Arc<TaskContext>,
    detached: bool,
}

impl Task {
    pub(crate) fn new(context: Arc<TaskContext>) -> Self {
        Self {
            context,
            detached: false,
        }
    }

    pub(crate) fn context(&self) -> &Arc<TaskContext> {
        &self.context
    }

    pub fn id(&self) -> Id {
        self.context.id()
    }

    pub fn state(&self) -> State {
        self.context.state()
    }

    pub fn is_finished(&self) -> bool {
        self.context.is_finished()
    }

    /// Asks the task to stop at its next suspension point.
    pub fn request_cancel(&self) {
        self.context.request_cancel(CancellationReason::UserRequest);
    }

    pub fn cancellation_reason(&self) -> CancellationReason {
        self.context.cancellation_reason()
    }

    /// Returns a token that can cancel the task independently of this handle.
    pub fn cancellation_token(&self) -> TaskCancellationToken {
        TaskCancellationToken::new(Arc::clone(&self.context))
    }

    /// Suspends the current task until the task behind this handle completes.
    ///
    /// Fails with [`TaskError::WaitInterrupted`] if the current task is
    /// cancelled first.
    pub async fn wait(&self) -> Result<(), TaskError> {
        match self.wait_until(Deadline::UNREACHABLE).await {
            FutureStatus::Ready => Ok(()),
            _ => Err(TaskError::WaitInterrupted(
                current_task::context().cancellation_reason(),
            )),
        }
    }

    pub async fn wait_for(&self, timeout: Duration) -> FutureStatus {
        self.wait_until(Deadline::from_duration(timeout)).await
    }

    pub async fn wait_until(&self, deadline: Deadline) -> FutureStatus {
        let current = current_task::context();

        loop {
            if self.context.is_finished() {
                return FutureStatus::Ready;
            }
            if deadline.is_reached() {
                return FutureStatus::Timeout;
            }

            let mut strategy = FinishWaitStrategy::new(&self.context, &current);
            let source = current.sleep(&mut strategy, deadline).await;

            if source == WakeupSource::CancelRequest && !self.context.is_finished() {
                return FutureStatus::Cancelled;
            }
        }
    }

    /// Cancels the task and waits for it to finish. The wait itself cannot be
    /// interrupted.
    pub async fn sync_cancel(&self) {
        self.context.request_cancel(CancellationReason::UserRequest);

        let _blocker = TaskCancellationBlocker::new();
        while !self.context.is_finished() {
            self.wait_until(Deadline::UNREACHABLE).await;
        }
    }

    /// Lets the task run to completion on its own. The processor keeps it
    /// alive, cancellation can still reach it through shutdown or a token.
    pub fn detach(mut self) {
        self.context.set_detached();
        self.detached = true;
    }

    /// Blocks the calling OS thread until the task completes.
    pub(crate) fn blocking_wait(&self) {
        assert!(
            !context::is_worker_thread(),
            "blocking wait for a task on a task processor worker thread"
        );
        self.context.blocking_wait();
    }
}

impl Drop for Task {
    fn drop(&mut self) {
        if self.detached || self.context.is_finished() {
            return;
        }

        self.context.request_cancel(CancellationReason::Abandoned);

        if context::is_worker_thread() {
            // Blocking a worker could starve the very task we wait for. The
            // processor registry keeps it alive until it unwinds.
            tracing::trace!(task_id = %self.context.id(), "abandoned task left to unwind");
            return;
        }
        self.context.blocking_wait();
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id())
            .field("state", &self.state())
            .finish()
    }
}

/// Handle to a task producing a `T`.
pub struct TaskWithResult<T> {
    task: Task,
    slot: ResultSlot<T>,
}

impl<T: Send + 'static> TaskWithResult<T> {
    pub(crate) fn new(context: Arc<TaskContext>, slot: ResultSlot<T>) -> Self {
        Self {
            task: Task::new(context),
            slot,
        }
    }

    /// Waits for the task and returns its outcome.
    pub async fn get(self) -> Result<T, TaskError> {
        self.task.wait().await?;
        self.take_result()
    }

    /// Blocks the calling OS thread until the task completes. Must not be
    /// used on a worker thread.
    pub(crate) fn blocking_get(self) -> Result<T, TaskError> {
        self.task.blocking_wait();
        self.take_result()
    }

    fn take_result(&self) -> Result<T, TaskError> {
        match self.slot.lock().take() {
            Some(outcome) => outcome,
            None => Err(TaskError::Cancelled(self.task.cancellation_reason())),
        }
    }

    pub fn detach(self) {
        self.task.detach();
    }
}

impl<T> Deref for TaskWithResult<T> {
    type Target = Task;

    fn deref(&self) -> &Task {
        &self.task
    }
}

impl<T> fmt::Debug for TaskWithResult<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.task.fmt(f)
    }
}

/// Clonable handle to a task producing a `T`.
///
/// Any number of tasks may wait on clones of the same handle concurrently.
/// The task is abandoned once the last clone is dropped.
pub struct SharedTask<T> {
    inner: Arc<SharedInner<T>>,
}

struct SharedInner<T> {
    task: Task,
    slot: ResultSlot<T>,
}

impl<T: Clone + Send + 'static> SharedTask<T> {
    pub(crate) fn new(context: Arc<TaskContext>, slot: ResultSlot<T>) -> Self {
        debug_assert_eq!(context.wait_mode(), WaitMode::Shared);
        Self {
            inner: Arc::new(SharedInner {
                task: Task::new(context),
                slot,
            }),
        }
    }

    /// Waits for the task and returns a copy of its outcome.
    pub async fn get(&self) -> Result<T, TaskError> {
        self.inner.task.wait().await?;
        match self.inner.slot.lock().as_ref() {
            Some(outcome) => outcome.clone(),
            None => Err(TaskError::Cancelled(self.inner.task.cancellation_reason())),
        }
    }
}

impl<T> Clone for SharedTask<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Deref for SharedTask<T> {
    type Target = Task;

    fn deref(&self) -> &Task {
        &self.inner.task
    }
}

impl<T> fmt::Debug for SharedTask<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.inner.task.fmt(f)
    }
}

/// Parks the current task on the finish wait list of another one.
struct FinishWaitStrategy<'a> {
    target: &'a Arc<TaskContext>,
    current: &'a Arc<TaskContext>,
    key: Option<WaiterKey>,
}

impl<'a> FinishWaitStrategy<'a> {
    fn new(target: &'a Arc<TaskContext>, current: &'a Arc<TaskContext>) -> Self {
        assert!(
            !Arc::ptr_eq(target, current),
            "task {} is waiting for itself",
            target.id()
        );
        Self {
            target,
            current,
            key: None,
        }
    }
}

impl WaitStrategy for FinishWaitStrategy<'_> {
    fn setup_wakeups(&mut self) -> EarlyWakeup {
        let mut waiters = self.target.finish_waiters().lock();

        if self.target.wait_mode() == WaitMode::Single {
            assert!(
                waiters.is_empty(),
                "task {} already has a waiter, use a shared task to wait from several tasks",
                self.target.id()
            );
        }

        // `finish` sets the state before taking this lock, so seeing it
        // unfinished here guarantees the wake_all comes after our append.
        if self.target.is_finished() {
            return EarlyWakeup(true);
        }

        self.key = Some(waiters.append(Arc::clone(self.current)));
        EarlyWakeup(false)
    }

    fn disable_wakeups(&mut self) {
        if let Some(key) = self.key.take() {
            self.target.finish_waiters().lock().remove(key);
        }
    }
}
