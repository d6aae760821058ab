//! Operations on the task that is currently running.
//!
//! Every function here panics when called outside of a task, except
//! [`try_id`].
use crate::context;
use crate::deadline::Deadline;
use crate::runtime::Handle;
use crate::task::cancel::{TaskCancellationBlocker, TaskCancellationToken};
use crate::task::sleep::{NoopWaitStrategy, YieldWaitStrategy};
use crate::task::{CancellationReason, CancelledError, Id, TaskContext};
use std::sync::Arc;
use std::time::Duration;

#[track_caller]
pub(crate) fn context() -> Arc<TaskContext> {
    match context::current_task() {
        Some(context) => context,
        None => panic!("not called from within a task"),
    }
}

pub(crate) fn try_context() -> Option<Arc<TaskContext>> {
    context::current_task()
}

/// Returns the [`Id`] of the current task.
#[track_caller]
pub fn id() -> Id {
    context().id()
}

/// Returns the [`Id`] of the current task, `None` outside of a task.
pub fn try_id() -> Option<Id> {
    context::with_current_task(|current| current.map(|c| c.id()))
}

/// Handle to the task processor running the current task.
#[track_caller]
pub fn task_processor() -> Handle {
    Handle::new(Arc::clone(context().processor()))
}

pub fn is_cancel_requested() -> bool {
    context().is_cancel_requested()
}

/// `true` if cancellation was requested and is not blocked by a
/// [`TaskCancellationBlocker`].
pub fn should_cancel() -> bool {
    context().should_cancel()
}

pub fn cancellation_reason() -> CancellationReason {
    context().cancellation_reason()
}

/// Checks for cancellation without suspending.
///
/// ```ignore
/// for item in items {
///     current_task::cancellation_point()?;
///     process(item).await;
/// }
/// ```
pub fn cancellation_point() -> Result<(), CancelledError> {
    let context = context();
    if context.should_cancel() {
        Err(CancelledError(context.cancellation_reason()))
    } else {
        Ok(())
    }
}

pub fn cancellation_token() -> TaskCancellationToken {
    TaskCancellationToken::new(context())
}

/// Sets the deadline after which the current task is cancelled with
/// [`CancellationReason::Deadline`].
pub fn set_deadline(deadline: Deadline) {
    context().set_cancel_deadline(deadline);
}

/// Puts the current task at the back of the queue.
pub async fn yield_now() {
    let context = context();
    let mut strategy = YieldWaitStrategy { context: &context };
    context.sleep(&mut strategy, Deadline::UNREACHABLE).await;
}

/// Suspends the current task until `deadline`. Cancellation is ignored.
pub async fn sleep_until(deadline: Deadline) {
    let context = context();
    let _blocker = TaskCancellationBlocker::for_context(Arc::clone(&context));
    interruptible_sleep(&context, deadline).await;
}

pub async fn sleep_for(duration: Duration) {
    sleep_until(Deadline::from_duration(duration)).await;
}

/// Suspends the current task until `deadline` or until it is cancelled.
pub async fn interruptible_sleep_until(deadline: Deadline) {
    let context = context();
    interruptible_sleep(&context, deadline).await;
}

pub async fn interruptible_sleep_for(duration: Duration) {
    interruptible_sleep_until(Deadline::from_duration(duration)).await;
}

async fn interruptible_sleep(context: &Arc<TaskContext>, deadline: Deadline) {
    // Loops over stray wakeups, e.g. a waker kept by a future the task
    // awaited earlier.
    while !deadline.is_reached() && !context.should_cancel() {
        let mut strategy = NoopWaitStrategy;
        context.sleep(&mut strategy, deadline).await;
    }
}
