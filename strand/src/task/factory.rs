use crate::current_task;
use crate::deadline::Deadline;
use crate::runtime::processor::Shared;
use crate::runtime::Handle;
use crate::task::context::Payload;
use crate::task::payload::TaskPayload;
use crate::task::{Importance, SharedTask, TaskContext, TaskWithResult, WaitMode};
use std::future::Future;
use std::sync::Arc;

/// Configures and spawns tasks on one task processor.
///
/// # Example
///
/// ```no_run
/// use std::time::Duration;
/// use strand::task::TaskFactory;
/// use strand::Deadline;
///
/// # async fn run(handle: strand::Handle) {
/// let task = TaskFactory::new(&handle)
///     .critical()
///     .deadline(Deadline::from_duration(Duration::from_secs(1)))
///     .spawn(async { 42 });
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct TaskFactory {
    processor: Arc<Shared>,
    importance: Importance,
    deadline: Deadline,
}

impl TaskFactory {
    pub fn new(handle: &Handle) -> Self {
        Self {
            processor: Arc::clone(handle.shared()),
            importance: Importance::Normal,
            deadline: Deadline::UNREACHABLE,
        }
    }

    /// Factory for the task processor of the current task.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a task.
    #[track_caller]
    pub fn current() -> Self {
        Self::new(&current_task::task_processor())
    }

    pub fn importance(mut self, importance: Importance) -> Self {
        self.importance = importance;
        self
    }

    pub fn critical(self) -> Self {
        self.importance(Importance::Critical)
    }

    /// Cancels the task with [`CancellationReason::Deadline`] once
    /// `deadline` is reached. A deadline that already passed cancels the task
    /// before it starts.
    pub fn deadline(mut self, deadline: Deadline) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn spawn<F>(&self, future: F) -> TaskWithResult<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let (payload, slot) = TaskPayload::new(future);
        let context = self.start(WaitMode::Single, payload);
        TaskWithResult::new(context, slot)
    }

    pub fn spawn_shared<F>(&self, future: F) -> SharedTask<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Clone + Send + 'static,
    {
        let (payload, slot) = TaskPayload::new(future);
        let context = self.start(WaitMode::Shared, payload);
        SharedTask::new(context, slot)
    }

    /// Spawns a task nobody waits for. Equivalent to `spawn(..).detach()`
    /// without the window where dropping the handle could abandon the task.
    pub fn spawn_detached<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let (payload, _slot) = TaskPayload::new(future);
        let context = self.create(WaitMode::Single, payload);
        context.set_detached();
        self.submit(&context);
    }

    fn start(&self, wait_mode: WaitMode, payload: Payload) -> Arc<TaskContext> {
        let context = self.create(wait_mode, payload);
        self.submit(&context);
        context
    }

    fn create(&self, wait_mode: WaitMode, payload: Payload) -> Arc<TaskContext> {
        TaskContext::new(
            Arc::clone(&self.processor),
            self.importance,
            wait_mode,
            self.deadline,
            payload,
        )
    }

    // A deadline that is already reached is handled by the first step, which
    // arms the cancellation timer before running the body.
    fn submit(&self, context: &Arc<TaskContext>) {
        self.processor.register(context);
        tracing::trace!(
            task_id = %context.id(),
            importance = ?self.importance,
            "task created"
        );
        context.start();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate as strand;
    use crate::task::{CancellationReason, State, TaskError};
    use anyhow::Result;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    #[strand::test]
    async fn test_spawn_returns_result() -> Result<()> {
        let task = TaskFactory::current().spawn(async { "hello" });
        assert_eq!(task.get().await?, "hello");
        Ok(())
    }

    #[strand::test]
    async fn test_passed_deadline_skips_body() -> Result<()> {
        let ran = Arc::new(AtomicBool::new(false));
        let ran2 = Arc::clone(&ran);

        let task = TaskFactory::current()
            .deadline(Deadline::PASSED)
            .spawn(async move { ran2.store(true, Ordering::Release) });

        assert_eq!(
            task.get().await,
            Err(TaskError::Cancelled(CancellationReason::Deadline))
        );
        assert!(!ran.load(Ordering::Acquire));
        Ok(())
    }

    #[strand::test]
    async fn test_critical_runs_despite_passed_deadline() -> Result<()> {
        let task = TaskFactory::current()
            .critical()
            .deadline(Deadline::PASSED)
            .spawn(async { current_task::cancellation_reason() });

        assert_eq!(task.get().await?, CancellationReason::Deadline);
        Ok(())
    }

    #[strand::test]
    async fn test_deadline_cancels_running_task() -> Result<()> {
        let task = TaskFactory::current()
            .deadline(Deadline::from_duration(Duration::from_millis(10)))
            .spawn(async {
                current_task::interruptible_sleep_for(Duration::from_secs(10)).await;
                current_task::cancellation_point()
            });

        assert!(task.get().await?.is_err());
        Ok(())
    }

    #[strand::test]
    async fn test_spawn_detached_runs() -> Result<()> {
        let (tx, rx) = futures::channel::oneshot::channel();
        TaskFactory::current().spawn_detached(async move {
            let _ = tx.send(current_task::id());
        });

        let id = rx.await?;
        assert_ne!(id, current_task::id());
        Ok(())
    }

    #[strand::test]
    async fn test_new_task_is_queued_or_later() -> Result<()> {
        let task = TaskFactory::current().spawn(async {});
        assert_ne!(task.state(), State::New);
        task.wait().await?;
        assert_eq!(task.state(), State::Completed);
        Ok(())
    }
}
