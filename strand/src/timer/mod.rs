mod context_timer;
pub(crate) use context_timer::ContextTimer;

mod thread;
pub(crate) use thread::{TimerCallback, TimerId, TimerThread, TimerThreadPool};
