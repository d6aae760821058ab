//! Lifecycle state and the packed sleep/wakeup word of a task.
use bitflags::bitflags;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

/// Observable lifecycle of a task.
///
/// `New → Queued → Running ⇄ Suspended → Queued … → Completed`. Only
/// `Completed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum State {
    New = 0,
    Queued = 1,
    Running = 2,
    Suspended = 3,
    Completed = 4,
}

impl State {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => State::New,
            1 => State::Queued,
            2 => State::Running,
            3 => State::Suspended,
            4 => State::Completed,
            _ => unreachable!("invalid task state {value}"),
        }
    }

    pub fn is_terminal(self) -> bool {
        self == State::Completed
    }
}

#[derive(Debug)]
pub(crate) struct AtomicState(AtomicU8);

impl AtomicState {
    pub(crate) fn new(state: State) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub(crate) fn load(&self) -> State {
        State::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Stores `new` and returns the previous state.
    pub(crate) fn swap(&self, new: State) -> State {
        State::from_u8(self.0.swap(new as u8, Ordering::AcqRel))
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub(crate) struct SleepFlags: u32 {
        /// The task is suspended and not queued anywhere.
        const SLEEPING = 1;

        /// The current sleep must not be interrupted by a cancel request.
        const NON_CANCELLABLE = 1 << 1;

        const WAKEUP_BY_WAIT_LIST = 1 << 2;
        const WAKEUP_BY_DEADLINE_TIMER = 1 << 3;
        const WAKEUP_BY_CANCEL_REQUEST = 1 << 4;
        const WAKEUP_BY_BOOTSTRAP = 1 << 5;
    }
}

/// Sleep generation. Timer callbacks carry the epoch they were armed in and
/// are ignored once the task moved on to another sleep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub(crate) struct Epoch(u32);

impl Epoch {
    pub(crate) fn next(self) -> Self {
        Epoch(self.0.wrapping_add(1))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SleepState {
    pub(crate) flags: SleepFlags,
    pub(crate) epoch: Epoch,
}

impl SleepState {
    pub(crate) fn new(flags: SleepFlags, epoch: Epoch) -> Self {
        Self { flags, epoch }
    }

    fn pack(self) -> u64 {
        (u64::from(self.epoch.0) << 32) | u64::from(self.flags.bits())
    }

    fn unpack(raw: u64) -> Self {
        Self {
            flags: SleepFlags::from_bits_retain(raw as u32),
            epoch: Epoch((raw >> 32) as u32),
        }
    }
}

/// `{flags, epoch}` packed into a single 64-bit word so that both halves are
/// always observed and updated together.
#[derive(Debug)]
pub(crate) struct AtomicSleepState(AtomicU64);

impl AtomicSleepState {
    pub(crate) fn new(state: SleepState) -> Self {
        Self(AtomicU64::new(state.pack()))
    }

    pub(crate) fn load(&self) -> SleepState {
        SleepState::unpack(self.0.load(Ordering::Acquire))
    }

    pub(crate) fn exchange(&self, new: SleepState) -> SleepState {
        SleepState::unpack(self.0.swap(new.pack(), Ordering::AcqRel))
    }

    pub(crate) fn compare_exchange_weak(
        &self,
        current: SleepState,
        new: SleepState,
    ) -> Result<SleepState, SleepState> {
        self.0
            .compare_exchange_weak(
                current.pack(),
                new.pack(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map(SleepState::unpack)
            .map_err(SleepState::unpack)
    }

    /// Sets `flags` and returns the previous state. The epoch is untouched.
    pub(crate) fn set_flags(&self, flags: SleepFlags) -> SleepState {
        SleepState::unpack(self.0.fetch_or(u64::from(flags.bits()), Ordering::AcqRel))
    }

    /// Clears `flags` and returns the previous state. The epoch is untouched.
    pub(crate) fn clear_flags(&self, flags: SleepFlags) -> SleepState {
        let mask = !u64::from(flags.bits());
        SleepState::unpack(self.0.fetch_and(mask, Ordering::AcqRel))
    }
}

/// What ended a sleep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum WakeupSource {
    WaitList,
    DeadlineTimer,
    CancelRequest,
    Bootstrap,
}

impl WakeupSource {
    pub(crate) fn flag(self) -> SleepFlags {
        match self {
            WakeupSource::WaitList => SleepFlags::WAKEUP_BY_WAIT_LIST,
            WakeupSource::DeadlineTimer => SleepFlags::WAKEUP_BY_DEADLINE_TIMER,
            WakeupSource::CancelRequest => SleepFlags::WAKEUP_BY_CANCEL_REQUEST,
            WakeupSource::Bootstrap => SleepFlags::WAKEUP_BY_BOOTSTRAP,
        }
    }

    /// `false` when the sleep was cut short by a timeout or a cancel request.
    pub(crate) fn has_wait_succeeded(self) -> bool {
        matches!(self, WakeupSource::WaitList | WakeupSource::Bootstrap)
    }

    /// Picks the wakeup reason to report out of all the flags a sleep
    /// accumulated.
    pub(crate) fn primary(flags: SleepFlags) -> Self {
        if flags.contains(SleepFlags::WAKEUP_BY_WAIT_LIST) {
            return WakeupSource::WaitList;
        }
        if flags.contains(SleepFlags::WAKEUP_BY_DEADLINE_TIMER) {
            return WakeupSource::DeadlineTimer;
        }
        if flags.contains(SleepFlags::WAKEUP_BY_BOOTSTRAP) {
            return WakeupSource::Bootstrap;
        }
        if flags.contains(SleepFlags::WAKEUP_BY_CANCEL_REQUEST)
            && !flags.contains(SleepFlags::NON_CANCELLABLE)
        {
            return WakeupSource::CancelRequest;
        }

        // Nothing recorded, treat it as a spurious wakeup. Callers re-check
        // their condition anyway.
        WakeupSource::WaitList
    }
}

/// Decides whether the wakeup that turned `prev` into `prev | source` is the
/// one responsible for putting the task back on the queue.
pub(crate) fn should_schedule(prev: SleepFlags, source: WakeupSource) -> bool {
    if !prev.contains(SleepFlags::SLEEPING) {
        return false;
    }

    if source == WakeupSource::CancelRequest {
        // A non-cancellable sleep ignores cancel requests entirely, and a
        // cancellable one is scheduled only by the first wakeup.
        prev == SleepFlags::SLEEPING
    } else {
        let mut others = prev;
        if prev.contains(SleepFlags::NON_CANCELLABLE) {
            others.remove(SleepFlags::NON_CANCELLABLE | SleepFlags::WAKEUP_BY_CANCEL_REQUEST);
        }
        others == SleepFlags::SLEEPING
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_flags_and_epoch_are_independent() {
        let state = AtomicSleepState::new(SleepState::new(SleepFlags::SLEEPING, Epoch(7)));

        let prev = state.set_flags(SleepFlags::WAKEUP_BY_WAIT_LIST);
        assert_eq!(prev.flags, SleepFlags::SLEEPING);
        assert_eq!(prev.epoch, Epoch(7));

        let prev = state.clear_flags(SleepFlags::SLEEPING);
        assert_eq!(prev.flags, SleepFlags::SLEEPING | SleepFlags::WAKEUP_BY_WAIT_LIST);

        let now = state.load();
        assert_eq!(now.flags, SleepFlags::WAKEUP_BY_WAIT_LIST);
        assert_eq!(now.epoch, Epoch(7));
    }

    #[test]
    fn test_epoch_wraps() {
        assert_eq!(Epoch(u32::MAX).next(), Epoch(0));

        let state = AtomicSleepState::new(SleepState::new(SleepFlags::all(), Epoch(u32::MAX)));
        let loaded = state.load();
        assert_eq!(loaded.flags, SleepFlags::all());
        assert_eq!(loaded.epoch, Epoch(u32::MAX));
    }

    #[rstest]
    #[case::first_wakeup(SleepFlags::SLEEPING, WakeupSource::WaitList, true)]
    #[case::not_sleeping(SleepFlags::empty(), WakeupSource::WaitList, false)]
    #[case::second_wakeup(
        SleepFlags::SLEEPING | SleepFlags::WAKEUP_BY_DEADLINE_TIMER,
        WakeupSource::WaitList,
        false
    )]
    #[case::cancel_first(SleepFlags::SLEEPING, WakeupSource::CancelRequest, true)]
    #[case::cancel_non_cancellable(
        SleepFlags::SLEEPING | SleepFlags::NON_CANCELLABLE,
        WakeupSource::CancelRequest,
        false
    )]
    #[case::timer_after_ignored_cancel(
        SleepFlags::SLEEPING | SleepFlags::NON_CANCELLABLE | SleepFlags::WAKEUP_BY_CANCEL_REQUEST,
        WakeupSource::DeadlineTimer,
        true
    )]
    #[case::bootstrap(SleepFlags::SLEEPING, WakeupSource::Bootstrap, true)]
    fn test_should_schedule(
        #[case] prev: SleepFlags,
        #[case] source: WakeupSource,
        #[case] expected: bool,
    ) {
        assert_eq!(should_schedule(prev, source), expected);
    }

    #[rstest]
    #[case::wait_list_wins(
        SleepFlags::WAKEUP_BY_WAIT_LIST | SleepFlags::WAKEUP_BY_CANCEL_REQUEST,
        WakeupSource::WaitList
    )]
    #[case::timer_over_cancel(
        SleepFlags::WAKEUP_BY_DEADLINE_TIMER | SleepFlags::WAKEUP_BY_CANCEL_REQUEST,
        WakeupSource::DeadlineTimer
    )]
    #[case::cancel(SleepFlags::WAKEUP_BY_CANCEL_REQUEST, WakeupSource::CancelRequest)]
    #[case::bootstrap(SleepFlags::WAKEUP_BY_BOOTSTRAP, WakeupSource::Bootstrap)]
    fn test_primary_wakeup_source(#[case] flags: SleepFlags, #[case] expected: WakeupSource) {
        assert_eq!(WakeupSource::primary(flags), expected);
    }

    #[test]
    fn test_state_swap() {
        let state = AtomicState::new(State::New);
        assert_eq!(state.swap(State::Queued), State::New);
        assert_eq!(state.load(), State::Queued);
        assert!(!state.load().is_terminal());
        state.swap(State::Completed);
        assert!(state.load().is_terminal());
    }
}
