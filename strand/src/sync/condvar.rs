use crate::current_task;
use crate::deadline::Deadline;
use crate::sync::wait_list::{WaitList, WaiterKey};
use crate::sync::{Lockable, Mutex};
use crate::task::TaskContext;
use crate::task::sleep::{EarlyWakeup, WaitStrategy};
use crate::task::state::WakeupSource;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Why a condition variable wait returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CvStatus {
    /// Notified, or woken spuriously.
    NoTimeout,
    Timeout,
    /// The waiting task was cancelled.
    Cancelled,
}

/// Condition variable usable with any [`Lockable`].
///
/// Waits observe cancellation of the waiting task. The lock is held again
/// whenever a wait returns, whatever its outcome.
pub struct ConditionVariableAny<M> {
    waiters: parking_lot::Mutex<WaitList>,
    spurious_wakeups: AtomicUsize,
    _p: std::marker::PhantomData<fn(&M)>,
}

/// Condition variable for the task [`Mutex`].
pub type ConditionVariable<T = ()> = ConditionVariableAny<Mutex<T>>;

impl<M: Lockable> ConditionVariableAny<M> {
    pub fn new() -> Self {
        Self {
            waiters: parking_lot::Mutex::new(WaitList::new()),
            spurious_wakeups: AtomicUsize::new(0),
            _p: std::marker::PhantomData,
        }
    }

    pub async fn wait<'a>(&self, guard: M::Guard<'a>) -> (M::Guard<'a>, CvStatus) {
        self.wait_until(guard, Deadline::UNREACHABLE).await
    }

    pub async fn wait_for<'a>(
        &self,
        guard: M::Guard<'a>,
        timeout: Duration,
    ) -> (M::Guard<'a>, CvStatus) {
        self.wait_until(guard, Deadline::from_duration(timeout)).await
    }

    /// Releases the lock, suspends until notified, `deadline` is reached or
    /// the task is cancelled, then takes the lock again.
    pub async fn wait_until<'a>(
        &self,
        guard: M::Guard<'a>,
        deadline: Deadline,
    ) -> (M::Guard<'a>, CvStatus) {
        let current = current_task::context();
        if current.should_cancel() {
            return (guard, CvStatus::Cancelled);
        }

        let lock = M::from_guard(&guard);
        let mut strategy = CvWaitStrategy::<M> {
            waiters: &self.waiters,
            current: &current,
            guard: Some(guard),
            key: None,
            notified: false,
        };
        let source = current.sleep(&mut strategy, deadline).await;
        let notified = strategy.notified;
        drop(strategy);

        let guard = lock.lock().await;

        // A consumed notification wins over a timeout or a cancel request
        // that raced with it.
        let status = match source {
            _ if notified => CvStatus::NoTimeout,
            WakeupSource::CancelRequest => CvStatus::Cancelled,
            WakeupSource::DeadlineTimer => CvStatus::Timeout,
            _ => CvStatus::NoTimeout,
        };
        (guard, status)
    }

    /// Waits until `predicate` holds. Returns `false` if it still does not
    /// hold when `deadline` is reached or the task is cancelled.
    ///
    /// Wakeups after which the predicate is still false are counted in
    /// [`spurious_wakeups`](Self::spurious_wakeups).
    pub async fn wait_until_with<'a, P>(
        &self,
        mut guard: M::Guard<'a>,
        deadline: Deadline,
        mut predicate: P,
    ) -> (M::Guard<'a>, bool)
    where
        P: FnMut(&mut M::Guard<'a>) -> bool,
    {
        loop {
            if predicate(&mut guard) {
                return (guard, true);
            }

            let (next, status) = self.wait_until(guard, deadline).await;
            guard = next;

            if status != CvStatus::NoTimeout {
                let satisfied = predicate(&mut guard);
                return (guard, satisfied);
            }
            if !predicate(&mut guard) {
                self.spurious_wakeups.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            return (guard, true);
        }
    }

    pub fn notify_one(&self) {
        self.waiters.lock().wake_one();
    }

    pub fn notify_all(&self) {
        self.waiters.lock().wake_all();
    }

    /// Number of predicate waits that woke up with the predicate still
    /// false.
    pub fn spurious_wakeups(&self) -> usize {
        self.spurious_wakeups.load(Ordering::Relaxed)
    }
}

impl<M: Lockable> Default for ConditionVariableAny<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M> fmt::Debug for ConditionVariableAny<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConditionVariableAny")
            .field("waiters", &self.waiters.lock().len())
            .field(
                "spurious_wakeups",
                &self.spurious_wakeups.load(Ordering::Relaxed),
            )
            .finish()
    }
}

struct CvWaitStrategy<'a, 'g, M: Lockable + 'g> {
    waiters: &'a parking_lot::Mutex<WaitList>,
    current: &'a Arc<TaskContext>,
    guard: Option<M::Guard<'g>>,
    key: Option<WaiterKey>,
    notified: bool,
}

impl<'g, M: Lockable + 'g> WaitStrategy for CvWaitStrategy<'_, 'g, M> {
    fn setup_wakeups(&mut self) -> EarlyWakeup {
        self.key = Some(self.waiters.lock().append(Arc::clone(self.current)));
        // Registered before the lock is released: a notifier holding the
        // lock cannot miss us.
        drop(self.guard.take());
        EarlyWakeup(false)
    }

    fn disable_wakeups(&mut self) {
        if let Some(key) = self.key.take() {
            self.notified = !self.waiters.lock().remove(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate as strand;
    use crate::task::{CancellationReason, TaskError};
    use anyhow::Result;
    use std::time::Instant;

    #[derive(Default)]
    struct Shared {
        waiting: bool,
        ready: bool,
    }

    #[strand::test]
    async fn test_wait_for_times_out() -> Result<()> {
        let mutex = Mutex::new(());
        let cv: ConditionVariable = ConditionVariable::new();

        let guard = mutex.lock().await;
        let start = Instant::now();
        let (_guard, status) = cv.wait_for(guard, Duration::from_millis(10)).await;

        assert_eq!(status, CvStatus::Timeout);
        assert!(start.elapsed() >= Duration::from_millis(10));
        Ok(())
    }

    #[strand::test(worker_threads = 2)]
    async fn test_notify_wakes_waiter() -> Result<()> {
        let state = Arc::new((Mutex::new(Shared::default()), ConditionVariable::<Shared>::new()));

        let waiter = {
            let state = Arc::clone(&state);
            strand::spawn(async move {
                let (mutex, cv) = &*state;
                let guard = mutex.lock().await;
                let (guard, ok) = cv
                    .wait_until_with(guard, Deadline::UNREACHABLE, |s| s.ready)
                    .await;
                ok && guard.ready
            })
        };

        strand::current_task::sleep_for(Duration::from_millis(5)).await;
        {
            let (mutex, cv) = &*state;
            mutex.lock().await.ready = true;
            cv.notify_all();
        }

        assert!(waiter.get().await?);
        Ok(())
    }

    #[rstest::rstest]
    #[case::none(0)]
    #[case::one(1)]
    #[case::several(5)]
    fn test_spurious_wakeups_are_counted(#[case] signals: usize) -> Result<()> {
        let processor = crate::test_utils::test_processor(2)?;
        processor.block_on(async move {
            let state = Arc::new((Mutex::new(Shared::default()), ConditionVariable::<Shared>::new()));

            let waiter = {
                let state = Arc::clone(&state);
                strand::spawn(async move {
                    let (mutex, cv) = &*state;
                    let mut guard = mutex.lock().await;
                    guard.waiting = true;
                    cv.wait_until_with(guard, Deadline::UNREACHABLE, |s| s.ready)
                        .await
                        .1
                })
            };

            let (mutex, cv) = &*state;
            while !mutex.lock().await.waiting {
                strand::current_task::yield_now().await;
            }

            for i in 0..signals {
                {
                    // Holding the lock guarantees the waiter is registered.
                    let _guard = mutex.lock().await;
                    cv.notify_one();
                }
                while cv.spurious_wakeups() < i + 1 {
                    strand::current_task::yield_now().await;
                }
            }

            {
                let mut guard = mutex.lock().await;
                guard.ready = true;
                cv.notify_one();
            }

            assert!(waiter.get().await?);
            assert_eq!(cv.spurious_wakeups(), signals);
            Ok::<_, TaskError>(())
        })?;
        Ok(())
    }

    #[strand::test(worker_threads = 2)]
    async fn test_cancel_interrupts_wait_and_releases_mutex() -> Result<()> {
        let state = Arc::new((Mutex::new(0u32), ConditionVariable::<u32>::new()));

        let a = {
            let state = Arc::clone(&state);
            strand::spawn(async move {
                let (mutex, cv) = &*state;
                let guard = mutex.lock().await;
                let start = Instant::now();
                let (guard, status) = cv.wait_for(guard, Duration::from_millis(50)).await;
                drop(guard);
                (status, start.elapsed())
            })
        };

        strand::current_task::sleep_for(Duration::from_millis(10)).await;
        a.request_cancel();

        let (status, waited) = a.get().await?;
        assert_eq!(status, CvStatus::Cancelled);
        assert!(waited < Duration::from_millis(45), "waited {waited:?}");

        // A released the mutex while unwinding.
        let (mutex, _) = &*state;
        assert!(mutex.try_lock_for(Duration::from_millis(100)).await.is_some());
        Ok(())
    }

    #[strand::test]
    async fn test_cancelled_before_wait() -> Result<()> {
        let task = strand::spawn(async {
            let mutex = Mutex::new(());
            let cv: ConditionVariable = ConditionVariable::new();
            strand::current_task::interruptible_sleep_for(Duration::from_secs(10)).await;

            let guard = mutex.lock().await;
            let (_guard, status) = cv.wait(guard).await;
            (status, strand::current_task::cancellation_reason())
        });
        strand::current_task::yield_now().await;
        task.request_cancel();

        assert_eq!(
            task.get().await?,
            (CvStatus::Cancelled, CancellationReason::UserRequest)
        );
        Ok(())
    }

    #[strand::test(worker_threads = 2)]
    async fn test_notify_wins_over_deadline_passed_while_relocking() -> Result<()> {
        let state = Arc::new((Mutex::new(Shared::default()), ConditionVariable::<Shared>::new()));

        let waiter = {
            let state = Arc::clone(&state);
            strand::spawn(async move {
                let (mutex, cv) = &*state;
                let mut guard = mutex.lock().await;
                guard.waiting = true;
                let (_guard, status) = cv.wait_for(guard, Duration::from_millis(20)).await;
                status
            })
        };

        let (mutex, cv) = &*state;
        loop {
            let guard = mutex.lock().await;
            if guard.waiting {
                cv.notify_one();
                // The waiter was notified in time but gets the mutex back
                // only after its deadline.
                strand::current_task::sleep_for(Duration::from_millis(50)).await;
                drop(guard);
                break;
            }
            drop(guard);
            strand::current_task::yield_now().await;
        }

        assert_eq!(waiter.get().await?, CvStatus::NoTimeout);
        Ok(())
    }
}
