//! Thread-local state of engine threads.
//!
//! Worker threads carry their local run queue, and any thread currently
//! stepping a task carries that task's context. Both are plain thread-locals:
//! a task is only ever stepped by one worker at a time.
use crate::runtime::queue::LocalQueue;
use crate::task::TaskContext;
use std::cell::{OnceCell, RefCell};
use std::sync::Arc;
use std::thread_local;

thread_local! {
    static CURRENT_TASK: RefCell<Option<Arc<TaskContext>>> = const { RefCell::new(None) };

    static WORKER: OnceCell<LocalQueue> = const { OnceCell::new() };
}

/// Marks `context` as the task running on this thread until the returned
/// guard is dropped.
#[track_caller]
pub(crate) fn enter_task(context: &Arc<TaskContext>) -> TaskScope {
    CURRENT_TASK.with(|current| {
        let mut current = current.borrow_mut();
        assert!(
            current.is_none(),
            "task {} stepped while another task is running on this thread",
            context.id()
        );
        *current = Some(Arc::clone(context));
    });

    TaskScope { _p: () }
}

pub(crate) struct TaskScope {
    _p: (),
}

impl Drop for TaskScope {
    fn drop(&mut self) {
        // The context may hold the last reference to task locals, drop it
        // outside of the borrow.
        let prev = CURRENT_TASK.with(|current| current.borrow_mut().take());
        drop(prev);
    }
}

pub(crate) fn current_task() -> Option<Arc<TaskContext>> {
    CURRENT_TASK.with(|current| current.borrow().clone())
}

pub(crate) fn with_current_task<F, R>(f: F) -> R
where
    F: FnOnce(Option<&Arc<TaskContext>>) -> R,
{
    CURRENT_TASK.with(|current| f(current.borrow().as_ref()))
}

#[track_caller]
pub(crate) fn init_worker(local: LocalQueue) {
    WORKER.with(|worker| {
        if worker.set(local).is_err() {
            panic!("thread is already registered as a task processor worker");
        }
    });
}

pub(crate) fn is_worker_thread() -> bool {
    WORKER.with(|worker| worker.get().is_some())
}

/// Runs `f` with this thread's local run queue, `None` if this is not a
/// worker thread.
pub(crate) fn with_local_queue<F, R>(f: F) -> R
where
    F: FnOnce(Option<&LocalQueue>) -> R,
{
    WORKER.with(|worker| f(worker.get()))
}
