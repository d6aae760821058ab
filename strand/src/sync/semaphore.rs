use crate::current_task;
use crate::deadline::Deadline;
use crate::sync::wait_list::{WaitList, WaiterKey};
use crate::task::sleep::{EarlyWakeup, WaitStrategy};
use crate::task::state::WakeupSource;
use crate::task::{CancellationReason, TaskCancellationBlocker, TaskContext};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Errors returned by semaphore acquisition.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum SemaphoreError {
    /// More permits were requested than the semaphore will ever have.
    #[error("{requested} permits requested but semaphore capacity is {capacity}")]
    Unreachable { requested: usize, capacity: usize },

    #[error("semaphore wait cancelled: {0}")]
    Cancelled(CancellationReason),

    #[error("semaphore wait timed out")]
    Timeout,
}

/// Capacity of a semaphore that never blocks.
pub const INFINITE_CAPACITY: usize = usize::MAX >> 1;

/// Semaphores whose capacity can be changed at runtime.
pub trait SetCapacity: Sync {
    fn set_capacity(&self, capacity: usize);
}

/// Permit bookkeeping shared by both semaphore flavours.
struct SemaphoreCore {
    used: AtomicUsize,
    capacity: AtomicUsize,
    waiters: parking_lot::Mutex<WaitList>,
}

impl SemaphoreCore {
    fn new(capacity: usize) -> Self {
        assert!(capacity <= INFINITE_CAPACITY, "semaphore capacity {capacity} is too large");
        Self {
            used: AtomicUsize::new(0),
            capacity: AtomicUsize::new(capacity),
            waiters: parking_lot::Mutex::new(WaitList::new()),
        }
    }

    fn capacity(&self) -> usize {
        self.capacity.load(Ordering::Acquire)
    }

    fn set_capacity(&self, capacity: usize) {
        assert!(capacity <= INFINITE_CAPACITY, "semaphore capacity {capacity} is too large");
        self.capacity.store(capacity, Ordering::Release);
        // Waiters re-check: some may fit now, some may have become
        // unreachable.
        self.waiters.lock().wake_all();
    }

    fn try_acquire(&self, count: usize) -> bool {
        let capacity = self.capacity();
        self.used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                used.checked_add(count).filter(|&next| next <= capacity)
            })
            .is_ok()
    }

    fn release(&self, count: usize) {
        let prev = self.used.fetch_sub(count, Ordering::AcqRel);
        debug_assert!(prev >= count, "released more permits than acquired");

        let mut waiters = self.waiters.lock();
        if !waiters.is_empty() {
            // A single waiter may want more than `count` permits, let every
            // waiter try.
            waiters.wake_all();
        }
    }

    fn check_reachable(&self, count: usize) -> Result<(), SemaphoreError> {
        let capacity = self.capacity();
        if count > capacity {
            return Err(SemaphoreError::Unreachable {
                requested: count,
                capacity,
            });
        }
        Ok(())
    }

    async fn acquire_until(
        &self,
        count: usize,
        deadline: Deadline,
        cancellable: bool,
    ) -> Result<(), SemaphoreError> {
        self.check_reachable(count)?;
        if self.try_acquire(count) {
            return Ok(());
        }

        let current = current_task::context();
        let _blocker =
            (!cancellable).then(|| TaskCancellationBlocker::for_context(Arc::clone(&current)));

        loop {
            if deadline.is_reached() {
                return Err(SemaphoreError::Timeout);
            }

            let mut strategy = AcquireWaitStrategy {
                core: self,
                current: &current,
                count,
                acquired: false,
                key: None,
            };
            let source = current.sleep(&mut strategy, deadline).await;

            if strategy.acquired {
                return Ok(());
            }
            if source == WakeupSource::CancelRequest {
                return Err(SemaphoreError::Cancelled(current.cancellation_reason()));
            }
            self.check_reachable(count)?;
        }
    }
}

struct AcquireWaitStrategy<'a> {
    core: &'a SemaphoreCore,
    current: &'a Arc<TaskContext>,
    count: usize,
    acquired: bool,
    key: Option<WaiterKey>,
}

impl WaitStrategy for AcquireWaitStrategy<'_> {
    fn setup_wakeups(&mut self) -> EarlyWakeup {
        let mut waiters = self.core.waiters.lock();
        if self.core.check_reachable(self.count).is_err() {
            return EarlyWakeup(true);
        }
        if self.core.try_acquire(self.count) {
            self.acquired = true;
            return EarlyWakeup(true);
        }
        self.key = Some(waiters.append(Arc::clone(self.current)));
        EarlyWakeup(false)
    }

    fn disable_wakeups(&mut self) {
        if let Some(key) = self.key.take() {
            self.core.waiters.lock().remove(key);
        }
    }
}

/// Permits held from a semaphore, returned when dropped.
#[must_use = "permits are released as soon as they are dropped"]
pub struct SemaphorePermit<'a> {
    core: &'a SemaphoreCore,
    count: usize,
}

impl SemaphorePermit<'_> {
    pub fn count(&self) -> usize {
        self.count
    }
}

impl Drop for SemaphorePermit<'_> {
    fn drop(&mut self) {
        if self.count > 0 {
            self.core.release(self.count);
        }
    }
}

impl fmt::Debug for SemaphorePermit<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SemaphorePermit")
            .field("count", &self.count)
            .finish()
    }
}

macro_rules! define_semaphore {
    ($(#[$meta:meta])* $name:ident, cancellable = $cancellable:literal) => {
        $(#[$meta])*
        pub struct $name {
            core: SemaphoreCore,
        }

        impl $name {
            /// Creates a semaphore with `capacity` permits. Use
            /// [`INFINITE_CAPACITY`](crate::sync::INFINITE_CAPACITY) for a
            /// semaphore that never blocks.
            pub fn new(capacity: usize) -> Self {
                Self {
                    core: SemaphoreCore::new(capacity),
                }
            }

            pub async fn acquire(&self) -> Result<SemaphorePermit<'_>, SemaphoreError> {
                self.acquire_many(1).await
            }

            pub async fn acquire_many(
                &self,
                count: usize,
            ) -> Result<SemaphorePermit<'_>, SemaphoreError> {
                self.try_acquire_many_until(count, Deadline::UNREACHABLE)
                    .await
            }

            pub fn try_acquire(&self) -> Option<SemaphorePermit<'_>> {
                self.try_acquire_many(1)
            }

            /// Takes `count` permits if available right now.
            pub fn try_acquire_many(&self, count: usize) -> Option<SemaphorePermit<'_>> {
                self.core.try_acquire(count).then(|| self.permit(count))
            }

            /// Suspends the current task until `count` permits are acquired
            /// or `deadline` is reached.
            pub async fn try_acquire_many_until(
                &self,
                count: usize,
                deadline: Deadline,
            ) -> Result<SemaphorePermit<'_>, SemaphoreError> {
                self.core
                    .acquire_until(count, deadline, $cancellable)
                    .await?;
                Ok(self.permit(count))
            }

            pub fn capacity(&self) -> usize {
                self.core.capacity()
            }

            /// Changes the number of permits. Permits already handed out are
            /// not revoked.
            pub fn set_capacity(&self, capacity: usize) {
                self.core.set_capacity(capacity);
            }

            pub fn remaining_approx(&self) -> usize {
                self.capacity().saturating_sub(self.used_approx())
            }

            pub fn used_approx(&self) -> usize {
                self.core.used.load(Ordering::Relaxed)
            }

            fn permit(&self, count: usize) -> SemaphorePermit<'_> {
                SemaphorePermit {
                    core: &self.core,
                    count,
                }
            }
        }

        impl SetCapacity for $name {
            fn set_capacity(&self, capacity: usize) {
                self.core.set_capacity(capacity);
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.debug_struct(stringify!($name))
                    .field("capacity", &self.capacity())
                    .field("used", &self.used_approx())
                    .finish()
            }
        }
    };
}

define_semaphore!(
    /// Counting semaphore for tasks. Waiting for permits ignores
    /// cancellation.
    Semaphore,
    cancellable = false
);

define_semaphore!(
    /// Counting semaphore for tasks. A wait for permits ends with
    /// [`SemaphoreError::Cancelled`] when the waiting task is cancelled.
    CancellableSemaphore,
    cancellable = true
);
