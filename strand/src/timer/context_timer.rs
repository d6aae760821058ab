use crate::deadline::Deadline;
use crate::task::error::CancellationReason;
use crate::task::state::{Epoch, WakeupSource};
use crate::task::TaskContext;
use crate::timer::{TimerCallback, TimerId, TimerThread};
use std::sync::Arc;

/// One timer bound to one task.
///
/// While started it keeps a strong reference to the task so the task outlives
/// any pending callback. Start, restart and finalize are only ever called by
/// the task owning the timer, the callback runs concurrently on the timer
/// thread.
#[derive(Default)]
pub(crate) struct ContextTimer {
    armed: Option<Armed>,
}

struct Armed {
    context: Arc<TaskContext>,
    thread: Arc<TimerThread>,
    pending: Option<TimerId>,
}

impl ContextTimer {
    pub(crate) fn was_started(&self) -> bool {
        self.armed.is_some()
    }

    /// Arms the timer to run `callback` at `deadline`.
    ///
    /// # Panics
    ///
    /// Panics if the timer was started and not finalized since.
    #[track_caller]
    pub(crate) fn start(
        &mut self,
        context: Arc<TaskContext>,
        thread: Arc<TimerThread>,
        callback: TimerCallback,
        deadline: Deadline,
    ) {
        assert!(
            self.armed.is_none(),
            "ContextTimer::start() called twice without finalize()"
        );

        let pending = deadline.fire_at().map(|at| thread.schedule(at, callback));
        self.armed = Some(Armed {
            context,
            thread,
            pending,
        });
    }

    /// Re-arms a started timer with a new callback and deadline.
    #[track_caller]
    pub(crate) fn restart(&mut self, callback: TimerCallback, deadline: Deadline) {
        let Some(armed) = self.armed.as_mut() else {
            panic!("ContextTimer::restart() called on a timer that was not started");
        };

        armed.pending = match (armed.pending, deadline.fire_at()) {
            (Some(id), Some(at)) => Some(armed.thread.reschedule(id, at, callback)),
            (None, Some(at)) => Some(armed.thread.schedule(at, callback)),
            (Some(id), None) => {
                armed.thread.cancel(id);
                None
            }
            (None, None) => None,
        };
    }

    /// Cancels the pending callback, if any, but keeps the timer started.
    pub(crate) fn disarm(&mut self) {
        if let Some(armed) = self.armed.as_mut() {
            if let Some(id) = armed.pending.take() {
                armed.thread.cancel(id);
            }
        }
    }

    /// Stops the timer and releases the task. Safe to call any number of
    /// times, including on a timer that never started.
    pub(crate) fn finalize(&mut self) {
        self.disarm();
        self.armed = None;
    }

    pub(crate) fn start_wakeup(
        &mut self,
        context: &Arc<TaskContext>,
        thread: Arc<TimerThread>,
        deadline: Deadline,
        epoch: Epoch,
    ) {
        let callback = wakeup_callback(context, epoch);
        self.start(Arc::clone(context), thread, callback, deadline);
    }

    pub(crate) fn restart_wakeup(&mut self, deadline: Deadline, epoch: Epoch) {
        if let Some(armed) = self.armed.as_ref() {
            let callback = wakeup_callback(&armed.context, epoch);
            self.restart(callback, deadline);
        }
    }

    pub(crate) fn start_cancel(
        &mut self,
        context: &Arc<TaskContext>,
        thread: Arc<TimerThread>,
        deadline: Deadline,
    ) {
        let callback = cancel_callback(context);
        self.start(Arc::clone(context), thread, callback, deadline);
    }

    pub(crate) fn restart_cancel(&mut self, deadline: Deadline) {
        if let Some(armed) = self.armed.as_ref() {
            let callback = cancel_callback(&armed.context);
            self.restart(callback, deadline);
        }
    }
}

impl Drop for ContextTimer {
    fn drop(&mut self) {
        self.finalize();
    }
}

fn wakeup_callback(context: &Arc<TaskContext>, epoch: Epoch) -> TimerCallback {
    let context = Arc::clone(context);
    Box::new(move || context.wakeup(WakeupSource::DeadlineTimer, epoch))
}

fn cancel_callback(context: &Arc<TaskContext>) -> TimerCallback {
    let context = Arc::clone(context);
    Box::new(move || context.request_cancel(CancellationReason::Deadline))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{noop_task, test_processor};
    use anyhow::Result;
    use std::time::Duration;

    #[test]
    fn test_finalize_is_idempotent() {
        let mut timer = ContextTimer::default();
        timer.finalize();
        timer.finalize();
        assert!(!timer.was_started());
    }

    #[test]
    fn test_start_holds_context_until_finalize() -> Result<()> {
        let processor = test_processor(1)?;
        let context = noop_task(&processor);
        let thread = TimerThread::start("ctx-timer".into())?;

        let before = Arc::strong_count(&context);
        let mut timer = ContextTimer::default();
        timer.start(
            Arc::clone(&context),
            Arc::clone(&thread),
            Box::new(|| {}),
            Deadline::from_duration(Duration::from_secs(60)),
        );
        assert!(timer.was_started());
        assert_eq!(thread.pending(), 1);
        assert_eq!(Arc::strong_count(&context), before + 1);

        timer.restart(Box::new(|| {}), Deadline::from_duration(Duration::from_secs(30)));
        assert_eq!(thread.pending(), 1);

        timer.finalize();
        assert_eq!(thread.pending(), 0);
        assert_eq!(Arc::strong_count(&context), before);

        timer.finalize();
        thread.stop();
        Ok(())
    }

    #[test]
    #[should_panic(expected = "without finalize")]
    fn test_double_start_panics() {
        let processor = test_processor(1).unwrap();
        let context = noop_task(&processor);
        let thread = TimerThread::start("ctx-timer".into()).unwrap();

        let mut timer = ContextTimer::default();
        timer.start(Arc::clone(&context), Arc::clone(&thread), Box::new(|| {}), Deadline::UNREACHABLE);
        timer.start(context, thread, Box::new(|| {}), Deadline::UNREACHABLE);
    }
}
