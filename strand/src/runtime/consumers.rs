//! Bookkeeping of idle workers, used to decide when a producer has to wake
//! one up.
//!
//! Both counters live in one 64-bit word so that producers read a consistent
//! pair with a single load:
//!
//! ```text
//!  63                 32 31                  0
//! +---------------------+---------------------+
//! |   sleeping count    |   stealers count    |
//! +---------------------+---------------------+
//! ```
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

const STEALERS_MASK: u64 = u32::MAX as u64;
const SLEEPING_SHIFT: u32 = 32;

/// A snapshot of [`ConsumersState`].
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub(crate) struct Consumers {
    sleeping: u32,
    stealers: u32,
}

impl Consumers {
    pub(crate) fn new(sleeping: u32, stealers: u32) -> Self {
        Self { sleeping, stealers }
    }

    pub(crate) fn sleeping(&self) -> u32 {
        self.sleeping
    }

    pub(crate) fn stealers(&self) -> u32 {
        self.stealers
    }

    /// A producer only wakes a worker if nobody is already looking for work.
    pub(crate) fn should_wake(&self) -> bool {
        self.stealers == 0 && self.sleeping > 0
    }

    fn pack(self) -> u64 {
        (u64::from(self.sleeping) << SLEEPING_SHIFT) | u64::from(self.stealers)
    }

    fn unpack(word: u64) -> Self {
        Self {
            sleeping: (word >> SLEEPING_SHIFT) as u32,
            stealers: (word & STEALERS_MASK) as u32,
        }
    }
}

impl fmt::Debug for Consumers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Consumers")
            .field("sleeping", &self.sleeping)
            .field("stealers", &self.stealers)
            .finish()
    }
}

/// Sleeping and stealing worker counts of one task processor.
#[derive(Debug, Default)]
pub(crate) struct ConsumersState {
    word: AtomicU64,
}

impl ConsumersState {
    pub(crate) fn load(&self) -> Consumers {
        Consumers::unpack(self.word.load(Ordering::SeqCst))
    }

    /// Registers one more stealer, provided the state still is `expected`.
    ///
    /// On failure returns the current state, which the caller may retry
    /// against.
    pub(crate) fn try_increment_stealers(&self, expected: Consumers) -> Result<Consumers, Consumers> {
        let next = Consumers {
            stealers: expected.stealers + 1,
            ..expected
        };
        self.word
            .compare_exchange(expected.pack(), next.pack(), Ordering::SeqCst, Ordering::SeqCst)
            .map(|_| next)
            .map_err(Consumers::unpack)
    }

    pub(crate) fn decrement_stealers(&self) -> Consumers {
        self.update(|c| Consumers {
            stealers: c.stealers - 1,
            ..c
        })
    }

    pub(crate) fn increment_sleeping(&self) -> Consumers {
        self.update(|c| Consumers {
            sleeping: c.sleeping + 1,
            ..c
        })
    }

    pub(crate) fn decrement_sleeping(&self) -> Consumers {
        self.update(|c| Consumers {
            sleeping: c.sleeping - 1,
            ..c
        })
    }

    /// Applies `f` with a CAS loop and returns the new state.
    fn update(&self, f: impl Fn(Consumers) -> Consumers) -> Consumers {
        let mut current = self.word.load(Ordering::SeqCst);
        loop {
            let next = f(Consumers::unpack(current));
            match self.word.compare_exchange_weak(
                current,
                next.pack(),
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return next,
                Err(actual) => current = actual,
            }
        }
    }
}
