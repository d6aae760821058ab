use crate::current_task;
use crate::deadline::Deadline;
use crate::sync::Lockable;
use crate::sync::wait_list::{WaitList, WaiterKey};
use crate::task::TaskCancellationBlocker;
use crate::task::TaskContext;
use crate::task::sleep::{EarlyWakeup, WaitStrategy};
use std::cell::UnsafeCell;
use std::fmt;
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

const UNLOCKED: u64 = 0;

// Owner recorded for locks taken outside of any task. Task ids start at 1 and
// never get anywhere near this.
const FOREIGN_OWNER: u64 = u64::MAX;

/// A mutual exclusion lock for tasks.
///
/// Waiting for the lock suspends the task and cannot be interrupted by
/// cancellation. Locking a mutex the current task already holds is a bug and
/// panics.
pub struct Mutex<T: ?Sized> {
    owner: AtomicU64,
    waiters: parking_lot::Mutex<WaitList>,
    data: UnsafeCell<T>,
}

// SAFETY: access to `data` is serialized by `owner`, like `std::sync::Mutex`.
unsafe impl<T: ?Sized + Send> Send for Mutex<T> {}
unsafe impl<T: ?Sized + Send> Sync for Mutex<T> {}

impl<T> Mutex<T> {
    pub fn new(value: T) -> Self {
        Self {
            owner: AtomicU64::new(UNLOCKED),
            waiters: parking_lot::Mutex::new(WaitList::new()),
            data: UnsafeCell::new(value),
        }
    }

    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: ?Sized> Mutex<T> {
    /// Suspends the current task until the lock is acquired.
    ///
    /// # Panics
    ///
    /// Panics outside of a task, or if the current task already holds the
    /// lock.
    pub async fn lock(&self) -> MutexGuard<'_, T> {
        match self.lock_until(Deadline::UNREACHABLE).await {
            Some(guard) => guard,
            None => unreachable!("lock wait without deadline timed out"),
        }
    }

    /// Acquires the lock if it is free, without suspending.
    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        let me = current_task::try_id().map_or(FOREIGN_OWNER, |id| id.as_u64());
        self.try_acquire(me).then(|| MutexGuard::new(self))
    }

    pub async fn try_lock_for(&self, timeout: Duration) -> Option<MutexGuard<'_, T>> {
        self.try_lock_until(Deadline::from_duration(timeout)).await
    }

    /// Suspends the current task until the lock is acquired or `deadline` is
    /// reached.
    pub async fn try_lock_until(&self, deadline: Deadline) -> Option<MutexGuard<'_, T>> {
        self.lock_until(deadline).await
    }

    /// Returns a mutable reference to the data, no locking needed.
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    async fn lock_until(&self, deadline: Deadline) -> Option<MutexGuard<'_, T>> {
        let current = current_task::context();
        let me = current.id().as_u64();

        if self.try_acquire(me) {
            return Some(MutexGuard::new(self));
        }
        assert_ne!(
            self.owner.load(Ordering::Acquire),
            me,
            "task {} tried to lock a mutex it already holds",
            current.id()
        );

        let _blocker = TaskCancellationBlocker::for_context(Arc::clone(&current));
        loop {
            if deadline.is_reached() {
                return None;
            }

            let mut strategy = LockWaitStrategy {
                mutex: self,
                current: &current,
                key: None,
                woken: false,
            };
            current.sleep(&mut strategy, deadline).await;

            // A failed attempt means another task took the lock in between,
            // its unlock wakes the next waiter.
            if std::mem::take(&mut strategy.woken) && self.try_acquire(me) {
                return Some(MutexGuard::new(self));
            }
        }
    }

    fn try_acquire(&self, me: u64) -> bool {
        self.owner
            .compare_exchange(UNLOCKED, me, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    fn unlock(&self) {
        self.owner.store(UNLOCKED, Ordering::Release);
        self.waiters.lock().wake_one();
    }
}

impl<T: Default> Default for Mutex<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T> From<T> for Mutex<T> {
    fn from(value: T) -> Self {
        Self::new(value)
    }
}

impl<T: ?Sized> fmt::Debug for Mutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let owner = self.owner.load(Ordering::Relaxed);
        f.debug_struct("Mutex")
            .field("locked", &(owner != UNLOCKED))
            .finish_non_exhaustive()
    }
}

impl<T: ?Sized + Send> Lockable for Mutex<T> {
    type Guard<'a>
        = MutexGuard<'a, T>
    where
        Self: 'a;

    fn lock(&self) -> impl Future<Output = Self::Guard<'_>> + Send {
        Mutex::lock(self)
    }

    fn from_guard<'a>(guard: &Self::Guard<'a>) -> &'a Self {
        guard.mutex
    }
}

/// Releases the lock when dropped.
#[must_use = "if unused the Mutex will immediately unlock"]
pub struct MutexGuard<'a, T: ?Sized> {
    mutex: &'a Mutex<T>,
    // Send/Sync like a `&mut T`.
    _p: PhantomData<&'a mut T>,
}

impl<'a, T: ?Sized> MutexGuard<'a, T> {
    fn new(mutex: &'a Mutex<T>) -> Self {
        Self {
            mutex,
            _p: PhantomData,
        }
    }
}

impl<T: ?Sized> Deref for MutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the guard proves the lock is held.
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T: ?Sized> DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the guard proves the lock is held, and `&mut self` that no
        // other reference to the data is alive.
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T: ?Sized> Drop for MutexGuard<'_, T> {
    fn drop(&mut self) {
        self.mutex.unlock();
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for MutexGuard<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

struct LockWaitStrategy<'a, T: ?Sized> {
    mutex: &'a Mutex<T>,
    current: &'a Arc<TaskContext>,
    key: Option<WaiterKey>,

    /// An unlock handed its wakeup to this waiter.
    woken: bool,
}

impl<T: ?Sized> WaitStrategy for LockWaitStrategy<'_, T> {
    fn setup_wakeups(&mut self) -> EarlyWakeup {
        let mut waiters = self.mutex.waiters.lock();
        // `unlock` releases the owner before taking the waiters lock, so an
        // unlock we miss here is one whose wake_one comes after our append.
        if self.mutex.try_acquire(self.current.id().as_u64()) {
            return EarlyWakeup(true);
        }
        self.key = Some(waiters.append(Arc::clone(self.current)));
        EarlyWakeup(false)
    }

    fn disable_wakeups(&mut self) {
        if let Some(key) = self.key.take() {
            self.woken = !self.mutex.waiters.lock().remove(key);
        }
    }
}

impl<T: ?Sized> Drop for LockWaitStrategy<'_, T> {
    fn drop(&mut self) {
        // The wait was abandoned after an unlock picked us: hand the wakeup
        // over to the next waiter.
        if self.woken && self.mutex.owner.load(Ordering::Acquire) == UNLOCKED {
            self.mutex.waiters.lock().wake_one();
        }
    }
}
