//! Monotonic deadlines used by every blocking primitive of the engine.
//!
//! A [`Deadline`] is an immutable time point. Two sentinels exist besides
//! concrete instants:
//! - *unreachable* (the default): the wait never times out.
//! - *passed*: already expired, regardless of the current time.
//!
//! All arithmetic saturates. A duration that would overflow the clock yields
//! an unreachable deadline instead of a wrapped, bogus time point.
use std::fmt;
use std::time::{Duration, Instant};

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Deadline(Repr);

// Variant order matters: `Passed < At(_) < Unreachable` is the derived `Ord`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
enum Repr {
    Passed,
    At(Instant),
    #[default]
    Unreachable,
}

impl Deadline {
    /// A deadline that is never reached.
    pub const UNREACHABLE: Deadline = Deadline(Repr::Unreachable);

    /// A deadline that is always reached.
    pub const PASSED: Deadline = Deadline(Repr::Passed);

    /// Returns a deadline `d` from now.
    ///
    /// Saturates to [`Deadline::UNREACHABLE`] when `now + d` cannot be
    /// represented.
    pub fn from_duration(d: Duration) -> Self {
        match Instant::now().checked_add(d) {
            Some(at) => Deadline(Repr::At(at)),
            None => Deadline::UNREACHABLE,
        }
    }

    /// Returns a deadline `nanos` nanoseconds from now. Negative offsets
    /// produce a deadline in the past.
    pub fn from_nanos(nanos: i128) -> Self {
        let magnitude = Duration::from_nanos(u64::try_from(nanos.unsigned_abs()).unwrap_or(u64::MAX));

        if nanos >= 0 {
            // `u64::MAX` nanoseconds is ~584 years, beyond that we are unreachable.
            if nanos > i128::from(u64::MAX) {
                return Deadline::UNREACHABLE;
            }
            Deadline::from_duration(magnitude)
        } else {
            match Instant::now().checked_sub(magnitude) {
                Some(at) => Deadline(Repr::At(at)),
                // Before the clock epoch, nothing can be earlier than that.
                None => Deadline::PASSED,
            }
        }
    }

    pub fn from_time_point(tp: Instant) -> Self {
        Deadline(Repr::At(tp))
    }

    pub fn is_reachable(&self) -> bool {
        !matches!(self.0, Repr::Unreachable)
    }

    pub fn is_reached(&self) -> bool {
        match self.0 {
            Repr::Unreachable => false,
            Repr::Passed => true,
            Repr::At(at) => at < Instant::now(),
        }
    }

    /// Time remaining until the deadline, zero once it is reached.
    ///
    /// # Panics
    ///
    /// Panics if the deadline is unreachable.
    #[track_caller]
    pub fn time_left(&self) -> Duration {
        match self.0 {
            Repr::Unreachable => panic!("time_left() called on an unreachable deadline"),
            Repr::Passed => Duration::ZERO,
            Repr::At(at) => at.saturating_duration_since(Instant::now()),
        }
    }

    /// The instant a timer should fire at, `None` if it should never fire.
    pub(crate) fn fire_at(&self) -> Option<Instant> {
        match self.0 {
            Repr::Unreachable => None,
            Repr::Passed => Some(Instant::now()),
            Repr::At(at) => Some(at),
        }
    }
}

impl fmt::Debug for Deadline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Repr::Unreachable => f.write_str("Deadline(unreachable)"),
            Repr::Passed => f.write_str("Deadline(passed)"),
            Repr::At(at) => {
                let now = Instant::now();
                if at >= now {
                    write!(f, "Deadline(in {:?})", at - now)
                } else {
                    write!(f, "Deadline({:?} ago)", now - at)
                }
            }
        }
    }
}
