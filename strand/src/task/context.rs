use crate::deadline::Deadline;
use crate::runtime::processor::Shared;
use crate::sync::wait_list::{WaitList, Waiter};
use crate::task::error::{AtomicCancellationReason, CancellationReason};
use crate::task::local::Storage;
use crate::task::sleep::{Sleep, WaitStrategy};
use crate::task::state::{
    should_schedule, AtomicSleepState, AtomicState, Epoch, SleepFlags, SleepState, State,
    WakeupSource,
};
use crate::task::{Id, Importance, WaitMode};
use crate::timer::ContextTimer;
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::Wake;
use std::time::Instant;

/// Type-erased task body. Writes its own result to the slot shared with the
/// handle, see [`crate::task::payload`].
pub(crate) type Payload = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// The unit of execution of the engine.
///
/// Shared by the handle, the task processor registry, the run queue while the
/// task is queued, wait lists while it sleeps and its armed timer. It is freed
/// once all of them let go, which can only happen after the task completed or
/// was never started.
pub(crate) struct TaskContext {
    id: Id,
    importance: Importance,
    wait_mode: WaitMode,
    processor: Arc<Shared>,

    state: AtomicState,
    cancellation_reason: AtomicCancellationReason,
    sleep_state: AtomicSleepState,

    is_cancellable: AtomicBool,
    within_sleep: AtomicBool,
    started: AtomicBool,
    detached: AtomicBool,

    payload: Mutex<Option<Payload>>,

    /// Tasks waiting for this one to complete.
    finish_waiters: Mutex<WaitList>,

    /// Same, for OS threads outside of the engine.
    finished: Mutex<bool>,
    finished_cv: Condvar,

    deadline_timer: Mutex<ContextTimer>,
    cancel_deadline: Mutex<Deadline>,
    queue_wait_timepoint: Mutex<Option<Instant>>,

    local_storage: Mutex<Storage>,
}

impl TaskContext {
    pub(crate) fn new(
        processor: Arc<Shared>,
        importance: Importance,
        wait_mode: WaitMode,
        deadline: Deadline,
        payload: Payload,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: Id::next(),
            importance,
            wait_mode,
            processor,
            state: AtomicState::new(State::New),
            cancellation_reason: AtomicCancellationReason::default(),
            sleep_state: AtomicSleepState::new(SleepState::new(
                SleepFlags::SLEEPING,
                Epoch::default(),
            )),
            is_cancellable: AtomicBool::new(true),
            within_sleep: AtomicBool::new(false),
            started: AtomicBool::new(false),
            detached: AtomicBool::new(false),
            payload: Mutex::new(Some(payload)),
            finish_waiters: Mutex::new(WaitList::new()),
            finished: Mutex::new(false),
            finished_cv: Condvar::new(),
            deadline_timer: Mutex::new(ContextTimer::default()),
            cancel_deadline: Mutex::new(deadline),
            queue_wait_timepoint: Mutex::new(None),
            local_storage: Mutex::new(Storage::default()),
        })
    }

    pub(crate) fn id(&self) -> Id {
        self.id
    }

    pub(crate) fn state(&self) -> State {
        self.state.load()
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.state() == State::Completed
    }

    pub(crate) fn processor(&self) -> &Arc<Shared> {
        &self.processor
    }

    pub(crate) fn wait_mode(&self) -> WaitMode {
        self.wait_mode
    }

    pub(crate) fn was_started_as_critical(&self) -> bool {
        self.importance == Importance::Critical
    }

    /// A task that already started is never shed, its side effects may be
    /// half-way done.
    pub(crate) fn is_critical(&self) -> bool {
        self.was_started_as_critical() || self.started.load(Ordering::Acquire)
    }

    pub(crate) fn is_detached(&self) -> bool {
        self.detached.load(Ordering::Acquire)
    }

    pub(crate) fn set_detached(&self) {
        self.detached.store(true, Ordering::Release);
    }

    // Cancellation

    pub(crate) fn cancellation_reason(&self) -> CancellationReason {
        self.cancellation_reason.load()
    }

    pub(crate) fn is_cancel_requested(&self) -> bool {
        self.cancellation_reason() != CancellationReason::None
    }

    pub(crate) fn is_cancellable(&self) -> bool {
        self.is_cancellable.load(Ordering::Acquire)
    }

    /// Returns the previous value.
    pub(crate) fn set_cancellable(&self, value: bool) -> bool {
        self.is_cancellable.swap(value, Ordering::AcqRel)
    }

    pub(crate) fn should_cancel(&self) -> bool {
        self.is_cancel_requested() && self.is_cancellable()
    }

    /// Requests cancellation. Only the first request sets the reason, later
    /// ones are no-ops.
    pub(crate) fn request_cancel(self: &Arc<Self>, reason: CancellationReason) {
        if self.is_finished() {
            return;
        }
        if self.cancellation_reason.try_set(reason) {
            tracing::trace!(task_id = %self.id, %reason, "task cancellation requested");
            let epoch = self.sleep_state.load().epoch;
            self.wakeup(WakeupSource::CancelRequest, epoch);
        }
    }

    pub(crate) fn cancel_deadline(&self) -> Deadline {
        *self.cancel_deadline.lock()
    }

    /// Replaces the cancellation deadline. Must be called from the task
    /// itself.
    pub(crate) fn set_cancel_deadline(self: &Arc<Self>, deadline: Deadline) {
        debug_assert!(self.is_current());
        *self.cancel_deadline.lock() = deadline;
        self.arm_cancellation_timer();
    }

    // Wakeups

    /// Wakes the task up if it is still sleeping in `epoch`.
    pub(crate) fn wakeup(self: &Arc<Self>, source: WakeupSource, epoch: Epoch) {
        if self.is_finished() {
            return;
        }

        let mut prev = self.sleep_state.load();
        loop {
            if prev.epoch != epoch {
                // The sleep this wakeup was meant for is over.
                return;
            }
            if source == WakeupSource::CancelRequest
                && prev.flags.contains(SleepFlags::NON_CANCELLABLE)
            {
                return;
            }

            let next = SleepState::new(prev.flags | source.flag(), epoch);
            match self.sleep_state.compare_exchange_weak(prev, next) {
                Ok(_) => break,
                Err(actual) => prev = actual,
            }
        }

        if should_schedule(prev.flags, source) {
            self.schedule();
        }
    }

    /// Wakes the task up whatever sleep it is in.
    pub(crate) fn wakeup_no_epoch(self: &Arc<Self>, source: WakeupSource) {
        if self.is_finished() {
            return;
        }

        let prev = self.sleep_state.set_flags(source.flag());
        if should_schedule(prev.flags, source) {
            self.schedule();
        }
    }

    /// Makes the next suspension of the running task return right away.
    pub(crate) fn wakeup_current(&self) {
        debug_assert!(self.is_current());
        self.sleep_state.set_flags(SleepFlags::WAKEUP_BY_WAIT_LIST);
    }

    pub(crate) fn start(self: &Arc<Self>) {
        debug_assert_eq!(self.state(), State::New);
        self.wakeup(WakeupSource::Bootstrap, Epoch::default());
    }

    pub(crate) fn schedule(self: &Arc<Self>) {
        let prev = self.state.swap(State::Queued);
        debug_assert!(
            matches!(prev, State::New | State::Suspended | State::Running),
            "task {} scheduled from {prev:?}",
            self.id
        );
        self.processor.schedule(Arc::clone(self));
    }

    // Sleeping

    /// Suspends the current task until `strategy` wakes it, `deadline` is
    /// reached or the task is cancelled.
    pub(crate) fn sleep<'a, W: WaitStrategy + ?Sized>(
        self: &'a Arc<Self>,
        strategy: &'a mut W,
        deadline: Deadline,
    ) -> Sleep<'a, W> {
        debug_assert!(self.is_current());
        Sleep::new(self, strategy, deadline)
    }

    pub(crate) fn sleep_state(&self) -> &AtomicSleepState {
        &self.sleep_state
    }

    /// Returns `true` if the task was already inside an engine sleep.
    pub(crate) fn enter_sleep(&self) -> bool {
        self.within_sleep.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn leave_sleep(&self) {
        self.within_sleep.store(false, Ordering::Release);
    }

    pub(crate) fn is_within_sleep(&self) -> bool {
        self.within_sleep.load(Ordering::Acquire)
    }

    pub(crate) fn arm_deadline_timer(self: &Arc<Self>, deadline: Deadline, epoch: Epoch) {
        let mut timer = self.deadline_timer.lock();
        if timer.was_started() {
            timer.restart_wakeup(deadline, epoch);
        } else {
            let thread = self.processor.timers().next_timer_thread();
            timer.start_wakeup(self, thread, deadline, epoch);
        }
    }

    /// Arms the timer that cancels the task once its deadline is reached.
    pub(crate) fn arm_cancellation_timer(self: &Arc<Self>) {
        let deadline = self.cancel_deadline();
        if !deadline.is_reachable() {
            let mut timer = self.deadline_timer.lock();
            if timer.was_started() {
                timer.disarm();
            }
            return;
        }

        if deadline.is_reached() {
            self.request_cancel(CancellationReason::Deadline);
            return;
        }

        let mut timer = self.deadline_timer.lock();
        if timer.was_started() {
            timer.restart_cancel(deadline);
        } else {
            let thread = self.processor.timers().next_timer_thread();
            timer.start_cancel(self, thread, deadline);
        }
    }

    pub(crate) fn finalize_timer(&self) {
        self.deadline_timer.lock().finalize();
    }

    // Waiting for completion

    pub(crate) fn finish_waiters(&self) -> &Mutex<WaitList> {
        &self.finish_waiters
    }

    /// Blocks the calling OS thread until the task completes.
    pub(crate) fn blocking_wait(&self) {
        let mut finished = self.finished.lock();
        while !*finished {
            self.finished_cv.wait(&mut finished);
        }
    }

    pub(crate) fn notify_finished(&self) {
        self.finish_waiters.lock().wake_all();

        let mut finished = self.finished.lock();
        *finished = true;
        self.finished_cv.notify_all();
    }

    // Execution, see `harness.rs`

    pub(crate) fn set_state(&self, new: State) -> State {
        self.state.swap(new)
    }

    pub(crate) fn mark_started(&self) -> bool {
        !self.started.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn take_payload(&self) -> Option<Payload> {
        self.payload.lock().take()
    }

    pub(crate) fn restore_payload(&self, payload: Payload) {
        *self.payload.lock() = Some(payload);
    }

    pub(crate) fn local_storage(&self) -> &Mutex<Storage> {
        &self.local_storage
    }

    pub(crate) fn set_queue_wait_timepoint(&self, tp: Instant) {
        *self.queue_wait_timepoint.lock() = Some(tp);
    }

    pub(crate) fn take_queue_wait_timepoint(&self) -> Option<Instant> {
        self.queue_wait_timepoint.lock().take()
    }

    pub(crate) fn is_current(&self) -> bool {
        crate::context::with_current_task(|current| {
            current.is_some_and(|current| std::ptr::eq(Arc::as_ptr(current), self))
        })
    }
}

impl Wake for TaskContext {
    fn wake(self: Arc<Self>) {
        self.wakeup_no_epoch(WakeupSource::WaitList);
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.wakeup_no_epoch(WakeupSource::WaitList);
    }
}

impl Waiter for Arc<TaskContext> {
    fn wake(&self) {
        self.wakeup_no_epoch(WakeupSource::WaitList);
    }
}

impl fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskContext")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("importance", &self.importance)
            .field("cancellation_reason", &self.cancellation_reason())
            .finish_non_exhaustive()
    }
}
