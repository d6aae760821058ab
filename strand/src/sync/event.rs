use crate::current_task;
use crate::deadline::Deadline;
use crate::sync::wait_list::{WaitList, WaiterKey};
use crate::task::TaskContext;
use crate::task::sleep::{EarlyWakeup, WaitStrategy};
use crate::task::state::WakeupSource;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Signal one task waits on and any task or thread may send.
///
/// A successful wait consumes the signal unless the event was created with
/// [`without_auto_reset`](Self::without_auto_reset). Sends that happen while
/// the event is already signaled coalesce. Waits observe cancellation of the
/// waiting task.
pub struct SingleConsumerEvent {
    signaled: AtomicBool,
    auto_reset: bool,
    waiters: parking_lot::Mutex<WaitList>,
}

impl SingleConsumerEvent {
    pub fn new() -> Self {
        Self::with_auto_reset(true)
    }

    /// An event that stays signaled until [`reset`](Self::reset).
    pub fn without_auto_reset() -> Self {
        Self::with_auto_reset(false)
    }

    fn with_auto_reset(auto_reset: bool) -> Self {
        Self {
            signaled: AtomicBool::new(false),
            auto_reset,
            waiters: parking_lot::Mutex::new(WaitList::new()),
        }
    }

    /// Signals the event and wakes the waiter, if any. Callable from any
    /// thread.
    pub fn send(&self) {
        self.signaled.store(true, Ordering::Release);
        self.waiters.lock().wake_one();
    }

    pub fn reset(&self) {
        self.signaled.store(false, Ordering::Release);
    }

    pub fn is_ready(&self) -> bool {
        self.signaled.load(Ordering::Acquire)
    }

    pub async fn wait_for_event(&self) -> bool {
        self.wait_for_event_until(Deadline::UNREACHABLE).await
    }

    pub async fn wait_for_event_for(&self, timeout: Duration) -> bool {
        self.wait_for_event_until(Deadline::from_duration(timeout)).await
    }

    /// Returns `true` once the event is signaled, `false` if `deadline` is
    /// reached or the task is cancelled first.
    ///
    /// # Panics
    ///
    /// Panics if another task is already waiting on this event.
    pub async fn wait_for_event_until(&self, deadline: Deadline) -> bool {
        if self.try_consume() {
            return true;
        }

        let current = current_task::context();
        loop {
            if current.should_cancel() || deadline.is_reached() {
                return self.try_consume();
            }

            let mut strategy = EventWaitStrategy {
                event: self,
                current: &current,
                key: None,
            };
            match current.sleep(&mut strategy, deadline).await {
                WakeupSource::CancelRequest | WakeupSource::DeadlineTimer => {
                    return self.try_consume();
                }
                _ if self.try_consume() => return true,
                _ => {}
            }
        }
    }

    fn try_consume(&self) -> bool {
        if self.auto_reset {
            self.signaled.swap(false, Ordering::AcqRel)
        } else {
            self.signaled.load(Ordering::Acquire)
        }
    }
}

impl Default for SingleConsumerEvent {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SingleConsumerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SingleConsumerEvent")
            .field("signaled", &self.is_ready())
            .field("auto_reset", &self.auto_reset)
            .finish()
    }
}

struct EventWaitStrategy<'a> {
    event: &'a SingleConsumerEvent,
    current: &'a Arc<TaskContext>,
    key: Option<WaiterKey>,
}

impl WaitStrategy for EventWaitStrategy<'_> {
    fn setup_wakeups(&mut self) -> EarlyWakeup {
        let mut waiters = self.event.waiters.lock();
        assert!(
            waiters.is_empty(),
            "single consumer event already has a waiter"
        );

        // `send` stores the flag before taking this lock.
        if self.event.signaled.load(Ordering::Acquire) {
            return EarlyWakeup(true);
        }

        self.key = Some(waiters.append(Arc::clone(self.current)));
        EarlyWakeup(false)
    }

    fn disable_wakeups(&mut self) {
        if let Some(key) = self.key.take() {
            self.event.waiters.lock().remove(key);
        }
    }
}
