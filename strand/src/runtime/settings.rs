use std::sync::atomic::{AtomicU8, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

/// What a task processor does with a task submitted while it is overloaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum OverloadAction {
    /// Admit the task anyway.
    #[default]
    Ignore = 0,
    /// Cancel the task with [`CancellationReason::Overload`]. It never runs,
    /// its handle reports the cancellation.
    ///
    /// [`CancellationReason::Overload`]: crate::task::CancellationReason::Overload
    Cancel = 1,
}

/// Overload policy of a task processor, adjustable at runtime with
/// [`TaskProcessor::set_settings`](crate::TaskProcessor::set_settings).
///
/// Critical tasks and tasks that already started are never shed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TaskProcessorSettings {
    /// A task dequeued after waiting longer than this marks the processor
    /// overloaded until a task with a shorter wait is dequeued.
    pub wait_queue_time_limit: Option<Duration>,

    /// Tasks submitted while this many tasks are queued are overloading.
    pub wait_queue_length_limit: Option<usize>,

    pub overload_action: OverloadAction,
}

const NO_LIMIT: u64 = u64::MAX;

/// Lock-free storage for [`TaskProcessorSettings`], read on every schedule.
#[derive(Debug)]
pub(crate) struct AtomicSettings {
    time_limit_micros: AtomicU64,
    length_limit: AtomicUsize,
    overload_action: AtomicU8,
}

impl AtomicSettings {
    pub(crate) fn new(settings: TaskProcessorSettings) -> Self {
        let this = Self {
            time_limit_micros: AtomicU64::new(NO_LIMIT),
            length_limit: AtomicUsize::new(usize::MAX),
            overload_action: AtomicU8::new(OverloadAction::Ignore as u8),
        };
        this.store(settings);
        this
    }

    pub(crate) fn store(&self, settings: TaskProcessorSettings) {
        let micros = settings
            .wait_queue_time_limit
            .map_or(NO_LIMIT, |limit| {
                u64::try_from(limit.as_micros()).map_or(NO_LIMIT - 1, |m| m.min(NO_LIMIT - 1))
            });
        self.time_limit_micros.store(micros, Ordering::Relaxed);
        self.length_limit.store(
            settings.wait_queue_length_limit.unwrap_or(usize::MAX),
            Ordering::Relaxed,
        );
        self.overload_action
            .store(settings.overload_action as u8, Ordering::Relaxed);
    }

    pub(crate) fn load(&self) -> TaskProcessorSettings {
        TaskProcessorSettings {
            wait_queue_time_limit: self.time_limit(),
            wait_queue_length_limit: self.length_limit(),
            overload_action: self.overload_action(),
        }
    }

    pub(crate) fn time_limit(&self) -> Option<Duration> {
        match self.time_limit_micros.load(Ordering::Relaxed) {
            NO_LIMIT => None,
            micros => Some(Duration::from_micros(micros)),
        }
    }

    pub(crate) fn length_limit(&self) -> Option<usize> {
        match self.length_limit.load(Ordering::Relaxed) {
            usize::MAX => None,
            limit => Some(limit),
        }
    }

    pub(crate) fn overload_action(&self) -> OverloadAction {
        match self.overload_action.load(Ordering::Relaxed) {
            1 => OverloadAction::Cancel,
            _ => OverloadAction::Ignore,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::defaults(TaskProcessorSettings::default())]
    #[case::all_limits(TaskProcessorSettings {
        wait_queue_time_limit: Some(Duration::from_millis(3)),
        wait_queue_length_limit: Some(100),
        overload_action: OverloadAction::Cancel,
    })]
    #[case::zero_length(TaskProcessorSettings {
        wait_queue_time_limit: None,
        wait_queue_length_limit: Some(0),
        overload_action: OverloadAction::Ignore,
    })]
    fn test_store_then_load(#[case] settings: TaskProcessorSettings) {
        let atomic = AtomicSettings::new(TaskProcessorSettings::default());
        atomic.store(settings);
        assert_eq!(atomic.load(), settings);
    }

    #[test]
    fn test_huge_time_limit_saturates() {
        let atomic = AtomicSettings::new(TaskProcessorSettings {
            wait_queue_time_limit: Some(Duration::MAX),
            ..Default::default()
        });
        assert!(atomic.time_limit().is_some());
    }
}
