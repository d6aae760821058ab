use bitflags::bitflags;

#[derive(Debug, Default)]
pub(crate) struct Ticker {
    tick: u32,
}

impl Ticker {
    pub(crate) fn new() -> Self {
        Self { tick: 0 }
    }

    pub(crate) fn tick<T: TickerData>(&mut self, ctx: &T::Context, data: &mut T) -> TickerEvents {
        self.tick = self.tick.wrapping_add(1);
        data.update_and_check(ctx, self.tick)
    }
}

/// Turns ticks into events. Keeps the policy data apart from the loop that
/// consumes the events.
pub(crate) trait TickerData {
    type Context;

    fn update_and_check(&mut self, ctx: &Self::Context, tick: u32) -> TickerEvents;
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub(crate) struct TickerEvents: u16 {
        /// Take the next task from the global queue rather than the local one.
        const POP_GLOBAL_QUEUE = 1;

        /// The task processor stopped, leave the worker loop.
        const SHUTDOWN = 1 << 1;
    }
}
