use crate::context;
use crate::task::state::{SleepFlags, State};
use crate::task::TaskContext;
use crate::task::local;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

impl TaskContext {
    /// Runs the task until its next suspension point or completion. Called by
    /// a worker thread right after dequeueing the task.
    pub(crate) fn do_step(self: &Arc<Self>) {
        if self.is_finished() {
            return;
        }

        let first_step = self.mark_started();

        // An engine sleep consumes its own wakeup flags when it resumes.
        // Anything else (first step, foreign futures) starts from a clean
        // slate so stale flags cannot reschedule the task forever.
        let clear = if self.is_within_sleep() {
            SleepFlags::SLEEPING | SleepFlags::NON_CANCELLABLE | SleepFlags::WAKEUP_BY_BOOTSTRAP
        } else {
            SleepFlags::all()
        };
        self.sleep_state().clear_flags(clear);

        if first_step {
            self.arm_cancellation_timer();
        }

        let scope = context::enter_task(self);
        self.set_state(State::Running);

        let poll = if first_step && self.is_cancel_requested() && !self.was_started_as_critical()
        {
            // Cancelled before it ever ran: drop the body unexecuted.
            self.set_cancellable(false);
            tracing::trace!(
                task_id = %self.id(),
                reason = %self.cancellation_reason(),
                "task cancelled before start"
            );
            drop(self.take_payload());
            Poll::Ready(())
        } else {
            self.poll_payload()
        };

        match poll {
            Poll::Ready(()) => {
                local::teardown(self.local_storage());
                drop(scope);
                self.finish();
            }
            Poll::Pending => {
                drop(scope);
                self.suspend();
            }
        }
    }

    fn poll_payload(self: &Arc<Self>) -> Poll<()> {
        let Some(mut payload) = self.take_payload() else {
            return Poll::Ready(());
        };

        let waker = Waker::from(Arc::clone(self));
        let mut cx = Context::from_waker(&waker);

        match payload.as_mut().poll(&mut cx) {
            Poll::Ready(()) => Poll::Ready(()),
            Poll::Pending => {
                self.restore_payload(payload);
                Poll::Pending
            }
        }
    }

    fn suspend(self: &Arc<Self>) {
        self.set_state(State::Suspended);

        let mut new_flags = SleepFlags::SLEEPING;
        let non_cancellable = !self.is_cancellable();
        if non_cancellable {
            new_flags |= SleepFlags::NON_CANCELLABLE;
        }

        let prev = self.sleep_state().set_flags(new_flags);
        debug_assert!(!prev.flags.contains(SleepFlags::SLEEPING));

        // Wakeups that arrived while the task was running were not able to
        // schedule it, do it now on their behalf.
        let mut pending = prev.flags;
        if non_cancellable {
            pending.remove(SleepFlags::WAKEUP_BY_CANCEL_REQUEST | SleepFlags::NON_CANCELLABLE);
        }
        if !pending.is_empty() {
            self.schedule();
        }
    }

    fn finish(self: &Arc<Self>) {
        let prev = self.set_state(State::Completed);
        debug_assert_eq!(prev, State::Running);

        tracing::trace!(
            task_id = %self.id(),
            reason = %self.cancellation_reason(),
            "task completed"
        );

        // Counted before waiters resume, so they observe up to date stats.
        self.finalize_timer();
        self.processor().task_finished(self);
        self.notify_finished();
    }
}
