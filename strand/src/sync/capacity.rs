use crate::sync::SetCapacity;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

const NO_OVERRIDE: usize = usize::MAX;

/// Arbitrates the capacity of a semaphore between a requested value and a
/// temporary override.
///
/// The requested capacity may be set from anywhere, e.g. on a config
/// reload. The override belongs to a single owner, e.g. a queue that lifts
/// its limit while draining. While an override is active requests are
/// recorded but not applied. Removing the override applies the latest
/// request.
pub struct SemaphoreCapacityControl<'a> {
    semaphore: &'a dyn SetCapacity,
    requested: AtomicUsize,
    capacity_override: AtomicUsize,
    // Serializes writes to the semaphore. Each write re-reads both atomics,
    // so whichever runs last applies the latest values.
    apply_lock: parking_lot::Mutex<()>,
}

impl<'a> SemaphoreCapacityControl<'a> {
    /// Starts with `capacity` requested and no override.
    pub fn new(semaphore: &'a dyn SetCapacity, capacity: usize) -> Self {
        let control = Self {
            semaphore,
            requested: AtomicUsize::new(capacity),
            capacity_override: AtomicUsize::new(NO_OVERRIDE),
            apply_lock: parking_lot::Mutex::new(()),
        };
        control.apply();
        control
    }

    pub fn set_capacity(&self, capacity: usize) {
        self.requested.store(capacity, Ordering::SeqCst);
        self.apply();
    }

    pub fn set_capacity_override(&self, capacity: usize) {
        debug_assert_ne!(capacity, NO_OVERRIDE);
        self.capacity_override.store(capacity, Ordering::SeqCst);
        self.apply();
    }

    pub fn remove_capacity_override(&self) {
        self.capacity_override.store(NO_OVERRIDE, Ordering::SeqCst);
        self.apply();
    }

    pub fn capacity_override(&self) -> Option<usize> {
        match self.capacity_override.load(Ordering::SeqCst) {
            NO_OVERRIDE => None,
            capacity => Some(capacity),
        }
    }

    pub fn requested_capacity(&self) -> usize {
        self.requested.load(Ordering::SeqCst)
    }

    fn apply(&self) {
        let _guard = self.apply_lock.lock();
        let capacity = self
            .capacity_override()
            .unwrap_or_else(|| self.requested_capacity());
        self.semaphore.set_capacity(capacity);
    }
}

impl fmt::Debug for SemaphoreCapacityControl<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SemaphoreCapacityControl")
            .field("requested", &self.requested_capacity())
            .field("override", &self.capacity_override())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate as strand;
    use crate::sync::{INFINITE_CAPACITY, Semaphore};
    use anyhow::Result;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_request_applies_without_override() {
        let semaphore = Semaphore::new(1);
        let control = SemaphoreCapacityControl::new(&semaphore, 5);
        assert_eq!(semaphore.capacity(), 5);

        control.set_capacity(7);
        assert_eq!(semaphore.capacity(), 7);
        assert_eq!(control.capacity_override(), None);
    }

    #[test]
    fn test_request_during_override_is_not_lost() {
        let semaphore = Semaphore::new(0);
        let control = SemaphoreCapacityControl::new(&semaphore, 3);

        control.set_capacity_override(INFINITE_CAPACITY);
        control.set_capacity(0);
        control.set_capacity(9);
        assert_eq!(semaphore.capacity(), INFINITE_CAPACITY);
        assert_eq!(control.requested_capacity(), 9);

        control.remove_capacity_override();
        assert_eq!(semaphore.capacity(), 9);
    }

    #[test]
    fn test_override_wins_over_concurrent_requests() {
        let semaphore = Arc::new(Semaphore::new(0));
        let control = SemaphoreCapacityControl::new(semaphore.as_ref(), 0);
        control.set_capacity_override(INFINITE_CAPACITY);

        thread::scope(|s| {
            s.spawn(|| {
                for capacity in 0..1000 {
                    control.set_capacity(capacity % 3);
                }
                control.set_capacity(42);
            });

            for _ in 0..1000 {
                // Every acquisition succeeds while the override is active.
                assert!(semaphore.try_acquire_many(1000).is_some());
            }
        });

        control.remove_capacity_override();
        assert_eq!(semaphore.capacity(), 42);
    }

    #[strand::test]
    async fn test_override_unblocks_waiters() -> Result<()> {
        let semaphore = Arc::new(Semaphore::new(1));
        let held = semaphore.acquire().await?;

        let waiter = {
            let semaphore = Arc::clone(&semaphore);
            strand::spawn(async move { semaphore.acquire().await.map(|p| p.count()) })
        };
        strand::current_task::yield_now().await;

        let control = SemaphoreCapacityControl::new(semaphore.as_ref(), 1);
        control.set_capacity_override(INFINITE_CAPACITY);
        assert_eq!(waiter.get().await?, Ok(1));

        drop(held);
        Ok(())
    }
}
