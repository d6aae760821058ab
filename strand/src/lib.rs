//! A cooperative M:N task engine.
//!
//! Tasks are futures run by a [`TaskProcessor`], a fixed pool of worker
//! threads sharing a work-stealing queue. On top of plain futures tasks get
//! deadlines, sticky cooperative cancellation, task-local variables and
//! synchronization primitives that suspend the task rather than the thread.
//!
//! ```no_run
//! use std::time::Duration;
//! use strand::{Builder, current_task};
//!
//! let processor = Builder::new().worker_threads(4).try_build().unwrap();
//! let sum = processor.block_on(async {
//!     let tasks = (0..10u64)
//!         .map(|i| strand::spawn(async move { i * i }))
//!         .collect::<Vec<_>>();
//!
//!     current_task::sleep_for(Duration::from_millis(1)).await;
//!
//!     let mut sum = 0;
//!     for task in tasks {
//!         sum += task.get().await.unwrap_or(0);
//!     }
//!     sum
//! });
//! assert_eq!(sum, 285);
//! ```

#[doc(inline)]
pub use strand_macros::test;

mod context;

mod deadline;
pub use deadline::Deadline;

pub mod runtime;
pub use runtime::{Builder, Handle, TaskProcessor};

pub mod sync;

pub mod task;
pub use task::{spawn, spawn_critical, spawn_shared};
pub use task::{TaskLocalVariable, current_task};

mod timer;

mod utils;

#[cfg(test)]
mod test_utils;
