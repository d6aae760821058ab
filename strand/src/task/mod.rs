//! Tasks: spawning, handles, cancellation and task-local data.
//!
//! A task is a future driven to completion by a [`TaskProcessor`]. It only
//! yields at `.await` points, and only observes cancellation at engine
//! suspension points or through an explicit check such as
//! [`current_task::cancellation_point`].
//!
//! [`TaskProcessor`]: crate::TaskProcessor

mod cancel;
pub use self::cancel::{TaskCancellationBlocker, TaskCancellationToken};

pub(crate) mod context;
pub(crate) use self::context::TaskContext;

pub mod current_task;

pub(crate) mod error;
pub use self::error::{CancellationReason, CancelledError, TaskError};

mod factory;
pub use self::factory::TaskFactory;

mod handle;
pub use self::handle::{FutureStatus, SharedTask, Task, TaskWithResult};

mod harness;

mod id;
pub use self::id::Id;

mod local;
pub use self::local::TaskLocalVariable;

pub(crate) mod payload;

pub(crate) mod sleep;

pub(crate) mod state;
pub use self::state::State;

use std::future::Future;

/// Decides whether a task may be shed before it starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Importance {
    /// May be cancelled by the overload policy, or dropped unstarted when
    /// cancelled before its first step.
    #[default]
    Normal,
    /// Always starts, even if it was cancelled before that.
    Critical,
}

/// How many tasks may wait for one task at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum WaitMode {
    #[default]
    Single,
    Shared,
}

/// Spawns a task on the task processor of the current task.
///
/// # Panics
///
/// Panics if called outside of a task. Use [`TaskFactory::new`] with a
/// [`Handle`](crate::Handle) from other threads.
#[track_caller]
pub fn spawn<F>(future: F) -> TaskWithResult<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    TaskFactory::current().spawn(future)
}

/// Like [`spawn`], but the task is never shed by the overload policy and its
/// body runs even if cancelled before it starts.
#[track_caller]
pub fn spawn_critical<F>(future: F) -> TaskWithResult<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    TaskFactory::current().critical().spawn(future)
}

/// Like [`spawn`], returning a handle that can be cloned and waited on from
/// several tasks.
#[track_caller]
pub fn spawn_shared<F>(future: F) -> SharedTask<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Clone + Send + 'static,
{
    TaskFactory::current().spawn_shared(future)
}
