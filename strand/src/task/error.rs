use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

/// Why a task was asked to stop.
///
/// A task keeps the first non-`None` reason it receives for the rest of its
/// life.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum CancellationReason {
    #[default]
    None = 0,
    /// Cancelled through a handle or a [`TaskCancellationToken`].
    ///
    /// [`TaskCancellationToken`]: crate::task::TaskCancellationToken
    UserRequest = 1,
    /// The task deadline was reached.
    Deadline = 2,
    /// Shed by the task processor overload policy.
    Overload = 3,
    /// The owning handle was dropped while the task was still running.
    Abandoned = 4,
    /// The task processor is shutting down.
    Shutdown = 5,
}

impl CancellationReason {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::None,
            1 => Self::UserRequest,
            2 => Self::Deadline,
            3 => Self::Overload,
            4 => Self::Abandoned,
            5 => Self::Shutdown,
            _ => unreachable!("invalid cancellation reason {value}"),
        }
    }
}

impl fmt::Display for CancellationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::None => "not cancelled",
            Self::UserRequest => "user request",
            Self::Deadline => "deadline",
            Self::Overload => "task processor overload",
            Self::Abandoned => "task handle abandoned",
            Self::Shutdown => "task processor shutdown",
        };
        f.write_str(s)
    }
}

/// Set-once cell for a [`CancellationReason`].
#[derive(Debug, Default)]
pub(crate) struct AtomicCancellationReason(AtomicU8);

impl AtomicCancellationReason {
    pub(crate) fn load(&self) -> CancellationReason {
        CancellationReason::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Returns `true` if `reason` was stored, `false` if a reason was already
    /// set.
    pub(crate) fn try_set(&self, reason: CancellationReason) -> bool {
        debug_assert_ne!(reason, CancellationReason::None);
        self.0
            .compare_exchange(
                CancellationReason::None as u8,
                reason as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }
}

/// Error returned when retrieving the outcome of a task.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TaskError {
    /// The task was cancelled before producing a value.
    #[error("task cancelled: {0}")]
    Cancelled(CancellationReason),

    /// The waiting task was itself cancelled while waiting.
    #[error("wait interrupted: {0}")]
    WaitInterrupted(CancellationReason),

    /// The task body panicked. Holds the panic message.
    #[error("task panicked: {0}")]
    Panicked(String),
}

impl TaskError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, TaskError::Cancelled(_))
    }

    pub fn is_panic(&self) -> bool {
        matches!(self, TaskError::Panicked(_))
    }
}

/// Returned by [`current_task::cancellation_point`] once the current task
/// should stop.
///
/// [`current_task::cancellation_point`]: crate::current_task::cancellation_point
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("task cancelled: {0}")]
pub struct CancelledError(pub CancellationReason);

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_reason_is_set_once() {
        let reason = AtomicCancellationReason::default();
        assert_eq!(reason.load(), CancellationReason::None);

        assert!(reason.try_set(CancellationReason::Deadline));
        assert!(!reason.try_set(CancellationReason::UserRequest));
        assert_eq!(reason.load(), CancellationReason::Deadline);
    }

    #[rstest]
    #[case(TaskError::Cancelled(CancellationReason::Overload), "task cancelled: task processor overload")]
    #[case(TaskError::WaitInterrupted(CancellationReason::Shutdown), "wait interrupted: task processor shutdown")]
    #[case(TaskError::Panicked("boom".into()), "task panicked: boom")]
    fn test_error_display(#[case] err: TaskError, #[case] expected: &str) {
        assert_eq!(err.to_string(), expected);
    }
}
