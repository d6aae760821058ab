//! Synchronization primitives for tasks.
//!
//! Blocking operations suspend the calling task, never the worker thread.
//! They all accept deadlines and tolerate spurious wakeups. Whether they
//! observe cancellation differs per primitive: [`Mutex`] and [`Semaphore`]
//! never do, [`CancellableSemaphore`] and everything else here does.

mod capacity;
pub use self::capacity::SemaphoreCapacityControl;

mod condvar;
pub use self::condvar::{ConditionVariable, ConditionVariableAny, CvStatus};

mod event;
pub use self::event::SingleConsumerEvent;

pub mod future;

pub mod mpsc;

mod mutex;
pub use self::mutex::{Mutex, MutexGuard};

mod semaphore;
pub use self::semaphore::{
    CancellableSemaphore, INFINITE_CAPACITY, Semaphore, SemaphoreError, SemaphorePermit,
    SetCapacity,
};

pub(crate) mod wait_list;

use std::future::Future;

/// A lock a [`ConditionVariableAny`] can release while waiting and take
/// again on wakeup.
pub trait Lockable: Sync {
    type Guard<'a>: Send
    where
        Self: 'a;

    fn lock(&self) -> impl Future<Output = Self::Guard<'_>> + Send;

    /// The lock `guard` was obtained from.
    fn from_guard<'a>(guard: &Self::Guard<'a>) -> &'a Self;
}
