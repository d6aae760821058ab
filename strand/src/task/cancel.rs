use crate::current_task;
use crate::task::{CancellationReason, Id, TaskContext};
use std::fmt;
use std::sync::Arc;

/// Keeps the current task from observing cancellation while in scope.
///
/// Suspension points inside the scope behave as if no cancellation was
/// requested. The request itself is not lost: it is observed again once the
/// blocker is dropped. Blockers nest.
///
/// # Panics
///
/// Panics if created outside of a task.
pub struct TaskCancellationBlocker {
    context: Arc<TaskContext>,
    was_cancellable: bool,
}

impl TaskCancellationBlocker {
    #[track_caller]
    pub fn new() -> Self {
        Self::for_context(current_task::context())
    }

    pub(crate) fn for_context(context: Arc<TaskContext>) -> Self {
        let was_cancellable = context.set_cancellable(false);
        Self {
            context,
            was_cancellable,
        }
    }
}

impl Drop for TaskCancellationBlocker {
    fn drop(&mut self) {
        self.context.set_cancellable(self.was_cancellable);
    }
}

impl fmt::Debug for TaskCancellationBlocker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskCancellationBlocker")
            .field("task_id", &self.context.id())
            .finish()
    }
}

/// Requests cancellation of a task without owning it.
///
/// Dropping a token neither cancels nor waits for the task, and a token may
/// outlive its task.
#[derive(Clone)]
pub struct TaskCancellationToken {
    context: Arc<TaskContext>,
}

impl TaskCancellationToken {
    pub(crate) fn new(context: Arc<TaskContext>) -> Self {
        Self { context }
    }

    pub fn task_id(&self) -> Id {
        self.context.id()
    }

    pub fn request_cancel(&self) {
        self.context.request_cancel(CancellationReason::UserRequest);
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.context.is_cancel_requested()
    }

    pub fn cancellation_reason(&self) -> CancellationReason {
        self.context.cancellation_reason()
    }

    pub fn is_finished(&self) -> bool {
        self.context.is_finished()
    }
}

impl fmt::Debug for TaskCancellationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskCancellationToken")
            .field("task_id", &self.context.id())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate as strand;
    use anyhow::Result;
    use static_assertions::assert_impl_all;
    use std::time::{Duration, Instant};

    assert_impl_all!(TaskCancellationToken: Send, Sync, Clone);
    // Held across suspension points, so it has to move with the task.
    assert_impl_all!(TaskCancellationBlocker: Send);

    #[strand::test]
    async fn test_blocker_defers_cancellation() -> Result<()> {
        let task = strand::spawn(async {
            let start = Instant::now();
            {
                let _blocker = TaskCancellationBlocker::new();
                current_task::interruptible_sleep_for(Duration::from_millis(30)).await;
                assert!(!current_task::should_cancel());
                assert!(current_task::is_cancel_requested());
            }
            assert!(current_task::should_cancel());
            start.elapsed()
        });

        current_task::sleep_for(Duration::from_millis(5)).await;
        task.request_cancel();

        match task.get().await {
            Ok(slept) => assert!(slept >= Duration::from_millis(30)),
            Err(e) => assert!(e.is_cancelled()),
        }
        Ok(())
    }

    #[strand::test]
    async fn test_nested_blockers_restore_state() -> Result<()> {
        let outer = TaskCancellationBlocker::new();
        {
            let _inner = TaskCancellationBlocker::new();
        }
        assert!(!current_task::context().is_cancellable());
        drop(outer);
        assert!(current_task::context().is_cancellable());
        Ok(())
    }

    #[strand::test]
    async fn test_token_outlives_task() -> Result<()> {
        let task = strand::spawn(async { 1 });
        let token = task.cancellation_token();
        assert_eq!(task.get().await?, 1);

        // Completed tasks ignore cancellation.
        assert!(token.is_finished());
        token.request_cancel();
        assert_eq!(token.cancellation_reason(), CancellationReason::None);
        Ok(())
    }
}
