use std::sync::atomic::{AtomicU64, Ordering};

/// Lets through the 1st, 2nd, 4th, 8th... occurrence of an event, for logs
/// that could otherwise fire on every task.
#[derive(Debug, Default)]
pub(crate) struct LogRateLimiter {
    occurrences: AtomicU64,
}

impl LogRateLimiter {
    /// Records an occurrence. Returns the total so far if this one should be
    /// logged.
    pub(crate) fn check(&self) -> Option<u64> {
        let total = self.occurrences.fetch_add(1, Ordering::Relaxed) + 1;
        total.is_power_of_two().then_some(total)
    }
}
