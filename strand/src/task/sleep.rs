//! The single suspension primitive every blocking operation is built on.
use crate::deadline::Deadline;
use crate::task::state::{Epoch, SleepState, SleepFlags, WakeupSource};
use crate::task::TaskContext;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

/// Tells whether the condition a task is about to sleep on already holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct EarlyWakeup(pub(crate) bool);

/// Hooks a wake source (a wait list, a timer, ...) into a [`Sleep`].
pub(crate) trait WaitStrategy {
    /// Registers the sleeping task with the wake source. Runs once, right
    /// before the task suspends.
    fn setup_wakeups(&mut self) -> EarlyWakeup;

    /// Unregisters the task. Runs once after the task resumed, whatever woke
    /// it up.
    fn disable_wakeups(&mut self);
}

/// Future returned by [`TaskContext::sleep`].
///
/// Resolves with the reason the sleep ended. Dropping it while suspended
/// unregisters the task from the wake source and invalidates any pending
/// timer wakeup.
pub(crate) struct Sleep<'a, W: WaitStrategy + ?Sized> {
    context: &'a Arc<TaskContext>,
    strategy: &'a mut W,
    deadline: Deadline,
    stage: Stage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Init,
    Waiting { has_deadline: bool },
    Done,
}

impl<'a, W: WaitStrategy + ?Sized> Sleep<'a, W> {
    pub(crate) fn new(context: &'a Arc<TaskContext>, strategy: &'a mut W, deadline: Deadline) -> Self {
        Self {
            context,
            strategy,
            deadline,
            stage: Stage::Init,
        }
    }

    fn start(&mut self) -> Poll<WakeupSource> {
        let context = self.context;

        if context.should_cancel() {
            self.stage = Stage::Done;
            return Poll::Ready(WakeupSource::CancelRequest);
        }

        let recursive = context.enter_sleep();
        assert!(!recursive, "task {} entered a sleep from within a sleep", context.id());

        let epoch = context.sleep_state().load().epoch;

        if self.strategy.setup_wakeups() == EarlyWakeup(true) {
            self.finish_epoch(epoch);
            context.leave_sleep();
            self.stage = Stage::Done;
            return Poll::Ready(WakeupSource::WaitList);
        }

        // When the task deadline comes first the cancellation timer already
        // covers this sleep.
        let has_deadline = self.deadline.is_reachable()
            && (!context.is_cancellable() || self.deadline < context.cancel_deadline());
        if has_deadline {
            context.arm_deadline_timer(self.deadline, epoch);
        }

        self.stage = Stage::Waiting { has_deadline };
        Poll::Pending
    }

    fn resume(&mut self, has_deadline: bool) -> WakeupSource {
        let context = self.context;

        if has_deadline {
            context.arm_cancellation_timer();
        }
        self.strategy.disable_wakeups();

        let epoch = context.sleep_state().load().epoch;
        let prev = self.finish_epoch(epoch);
        context.leave_sleep();
        self.stage = Stage::Done;

        WakeupSource::primary(prev.flags)
    }

    /// Moves the task to the next sleep epoch, so that timers armed for this
    /// one become no-ops. Returns the flags this sleep accumulated.
    fn finish_epoch(&self, epoch: Epoch) -> SleepState {
        self.context
            .sleep_state()
            .exchange(SleepState::new(SleepFlags::empty(), epoch.next()))
    }
}

impl<W: WaitStrategy + ?Sized> Future for Sleep<'_, W> {
    type Output = WakeupSource;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        match this.stage {
            Stage::Init => this.start(),
            Stage::Waiting { has_deadline } => Poll::Ready(this.resume(has_deadline)),
            Stage::Done => panic!("Sleep polled after completion"),
        }
    }
}

impl<W: WaitStrategy + ?Sized> Drop for Sleep<'_, W> {
    fn drop(&mut self) {
        if let Stage::Waiting { has_deadline } = self.stage {
            // Abandoned mid-sleep, e.g. by a select.
            self.resume(has_deadline);
        }
    }
}

/// No wake source besides the deadline and cancellation.
pub(crate) struct NoopWaitStrategy;

impl WaitStrategy for NoopWaitStrategy {
    fn setup_wakeups(&mut self) -> EarlyWakeup {
        EarlyWakeup(false)
    }

    fn disable_wakeups(&mut self) {}
}

/// Suspends and immediately puts the task back on the queue.
pub(crate) struct YieldWaitStrategy<'a> {
    pub(crate) context: &'a TaskContext,
}

impl WaitStrategy for YieldWaitStrategy<'_> {
    fn setup_wakeups(&mut self) -> EarlyWakeup {
        self.context.wakeup_current();
        EarlyWakeup(false)
    }

    fn disable_wakeups(&mut self) {}
}
