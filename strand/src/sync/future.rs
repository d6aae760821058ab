//! One-shot value handoff from a [`Promise`] to its [`Future`].
//!
//! The promise may be fulfilled from any thread. Waiting on the future must
//! happen inside a task and observes cancellation of the waiting task.
//!
//! ```ignore
//! let promise = Promise::new();
//! let future = promise.get_future()?;
//! std::thread::spawn(move || promise.set_value(compute()));
//! let value = future.get().await?;
//! ```
use crate::current_task;
use crate::deadline::Deadline;
use crate::sync::wait_list::{WaitList, WaiterKey};
use crate::task::sleep::{EarlyWakeup, WaitStrategy};
use crate::task::state::WakeupSource;
use crate::task::{CancellationReason, FutureStatus, TaskContext};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Errors of the promise/future pair.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum FutureError {
    /// The promise was dropped without a value.
    #[error("promise dropped without setting a value")]
    BrokenPromise,

    #[error("future already retrieved from this promise")]
    AlreadyRetrieved,

    #[error("promise already satisfied")]
    AlreadySatisfied,

    /// The waiting task was cancelled before the value arrived.
    #[error("future wait interrupted: {0}")]
    WaitInterrupted(CancellationReason),
}

enum Slot<T> {
    Pending,
    Value(T),
    Broken,
    Taken,
}

struct Shared<T> {
    slot: parking_lot::Mutex<Slot<T>>,
    ready: AtomicBool,
    retrieved: AtomicBool,
    waiters: parking_lot::Mutex<WaitList>,
}

impl<T> Shared<T> {
    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    fn complete(&self, outcome: Slot<T>) -> Result<(), FutureError> {
        {
            let mut slot = self.slot.lock();
            if !matches!(*slot, Slot::Pending) {
                return Err(FutureError::AlreadySatisfied);
            }
            *slot = outcome;
        }

        self.ready.store(true, Ordering::Release);
        self.waiters.lock().wake_all();
        Ok(())
    }
}

/// Producing side. Dropping it unfulfilled breaks the promise.
pub struct Promise<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Promise<T> {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                slot: parking_lot::Mutex::new(Slot::Pending),
                ready: AtomicBool::new(false),
                retrieved: AtomicBool::new(false),
                waiters: parking_lot::Mutex::new(WaitList::new()),
            }),
        }
    }

    /// Returns the consuming side. Only the first call succeeds.
    pub fn get_future(&self) -> Result<Future<T>, FutureError> {
        if self.shared.retrieved.swap(true, Ordering::AcqRel) {
            return Err(FutureError::AlreadyRetrieved);
        }
        Ok(Future {
            shared: Arc::clone(&self.shared),
        })
    }

    /// Stores `value` and wakes every task waiting on the future.
    ///
    /// Fails with [`FutureError::AlreadySatisfied`] if a value was already
    /// set, dropping `value`.
    pub fn set_value(&self, value: T) -> Result<(), FutureError> {
        self.shared.complete(Slot::Value(value))
    }
}

impl<T> Default for Promise<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for Promise<T> {
    fn drop(&mut self) {
        if self.shared.complete(Slot::Broken).is_ok() {
            tracing::debug!("promise dropped without a value");
        }
    }
}

impl<T> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Promise")
            .field("ready", &self.shared.is_ready())
            .finish()
    }
}

/// Consuming side of a [`Promise`].
#[must_use = "a future does nothing unless waited on"]
pub struct Future<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Future<T> {
    /// `true` once the promise was fulfilled or broken.
    pub fn is_ready(&self) -> bool {
        self.shared.is_ready()
    }

    /// Waits for the value and takes it.
    pub async fn get(self) -> Result<T, FutureError> {
        if self.wait().await != FutureStatus::Ready {
            return Err(FutureError::WaitInterrupted(
                current_task::cancellation_reason(),
            ));
        }

        match std::mem::replace(&mut *self.shared.slot.lock(), Slot::Taken) {
            Slot::Value(value) => Ok(value),
            Slot::Broken => Err(FutureError::BrokenPromise),
            Slot::Pending | Slot::Taken => unreachable!("ready future without an outcome"),
        }
    }

    /// Waits without consuming the value. Returns [`FutureStatus::Ready`] or
    /// [`FutureStatus::Cancelled`].
    pub async fn wait(&self) -> FutureStatus {
        self.wait_until(Deadline::UNREACHABLE).await
    }

    pub async fn wait_for(&self, timeout: Duration) -> FutureStatus {
        self.wait_until(Deadline::from_duration(timeout)).await
    }

    pub async fn wait_until(&self, deadline: Deadline) -> FutureStatus {
        if self.is_ready() {
            return FutureStatus::Ready;
        }

        let current = current_task::context();
        loop {
            if deadline.is_reached() {
                return FutureStatus::Timeout;
            }

            let mut strategy = ReadyWaitStrategy {
                shared: &self.shared,
                current: &current,
                key: None,
            };
            match current.sleep(&mut strategy, deadline).await {
                _ if self.is_ready() => return FutureStatus::Ready,
                WakeupSource::CancelRequest => return FutureStatus::Cancelled,
                _ => {}
            }
        }
    }
}

impl<T> fmt::Debug for Future<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Future")
            .field("ready", &self.is_ready())
            .finish()
    }
}

struct ReadyWaitStrategy<'a, T> {
    shared: &'a Shared<T>,
    current: &'a Arc<TaskContext>,
    key: Option<WaiterKey>,
}

impl<T> WaitStrategy for ReadyWaitStrategy<'_, T> {
    fn setup_wakeups(&mut self) -> EarlyWakeup {
        let mut waiters = self.shared.waiters.lock();

        // `complete` publishes the outcome before taking this lock.
        if self.shared.is_ready() {
            return EarlyWakeup(true);
        }

        self.key = Some(waiters.append(Arc::clone(self.current)));
        EarlyWakeup(false)
    }

    fn disable_wakeups(&mut self) {
        if let Some(key) = self.key.take() {
            self.shared.waiters.lock().remove(key);
        }
    }
}
