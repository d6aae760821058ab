use crate::current_task;
use crate::task::context::Payload;
use crate::task::TaskError;
use futures::FutureExt;
use futures::future::CatchUnwind;
use parking_lot::Mutex;
use pin_project::pin_project;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, ready};

/// Where a task stores its outcome for its handle to pick up.
///
/// Stays empty if the task body was dropped before completing, i.e. when the
/// task was cancelled before it started.
pub(crate) type ResultSlot<T> = Arc<Mutex<Option<Result<T, TaskError>>>>;

/// Wraps a user future, catches panics and writes the outcome to the slot.
#[pin_project]
pub(crate) struct TaskPayload<F: Future> {
    #[pin]
    future: CatchUnwind<AssertUnwindSafe<F>>,
    slot: ResultSlot<F::Output>,
}

impl<F> TaskPayload<F>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    pub(crate) fn new(future: F) -> (Payload, ResultSlot<F::Output>) {
        let slot: ResultSlot<F::Output> = Arc::new(Mutex::new(None));
        let payload: Payload = Box::pin(TaskPayload {
            future: AssertUnwindSafe(future).catch_unwind(),
            slot: Arc::clone(&slot),
        });
        (payload, slot)
    }
}

impl<F: Future> Future for TaskPayload<F> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = self.project();

        let outcome = match ready!(this.future.poll(cx)) {
            Ok(value) => Ok(value),
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                if current_task::try_context().is_some_and(|ctx| ctx.is_detached()) {
                    tracing::warn!(%message, "detached task panicked");
                } else {
                    tracing::debug!(%message, "task panicked");
                }
                Err(TaskError::Panicked(message))
            }
        };

        *this.slot.lock() = Some(outcome);
        Poll::Ready(())
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::str(Box::new("static") as Box<dyn Any + Send>, "static")]
    #[case::string(Box::new(String::from("owned")) as Box<dyn Any + Send>, "owned")]
    #[case::other(Box::new(42u32) as Box<dyn Any + Send>, "unknown panic payload")]
    fn test_panic_message(#[case] panic: Box<dyn Any + Send>, #[case] expected: &str) {
        assert_eq!(panic_message(panic.as_ref()), expected);
    }

    #[test]
    fn test_payload_writes_slot() {
        let (mut payload, slot) = TaskPayload::new(async { 5 });
        let waker = futures::task::noop_waker();
        let mut cx = Context::from_waker(&waker);

        assert!(payload.as_mut().poll(&mut cx).is_ready());
        assert_eq!(slot.lock().take(), Some(Ok(5)));
    }

    #[test]
    fn test_dropped_payload_leaves_slot_empty() {
        let (payload, slot) = TaskPayload::new(async { 5 });
        drop(payload);
        assert!(slot.lock().is_none());
    }
}
