//! The task processor: a pool of worker threads with a work-stealing run
//! queue, its configuration and its overload policy.

mod builder;
pub use self::builder::{Builder, TaskProcessorConfig};

pub(crate) mod consumers;

pub(crate) mod processor;
pub use self::processor::{Handle, TaskProcessor};

pub(crate) mod queue;

mod registry;

mod settings;
pub use self::settings::{OverloadAction, TaskProcessorSettings};

mod stats;
pub use self::stats::TaskProcessorStats;

mod ticker;

mod worker;

#[cfg(test)]
mod tests;
