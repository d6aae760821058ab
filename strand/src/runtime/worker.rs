use crate::context;
use crate::runtime::builder::TaskProcessorConfig;
use crate::runtime::processor::Shared;
use crate::runtime::queue::{LocalQueue, TaskQueue};
use crate::runtime::ticker::{Ticker, TickerData, TickerEvents};
use anyhow::{Context as _, Result};
use std::ops::ControlFlow;
use std::panic::{self, AssertUnwindSafe};
use std::process;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

pub(super) fn spawn(shared: Arc<Shared>, local: LocalQueue) -> Result<JoinHandle<()>> {
    let config = shared.config();
    let name = config.thread_name.name(local.index());

    let mut builder = thread::Builder::new().name(name.clone());
    if let Some(stack_size) = config.thread_stack_size {
        builder = builder.stack_size(stack_size);
    }

    builder
        .spawn(move || run(&shared, local))
        .with_context(|| format!("failed to spawn worker thread {name}"))
}

fn run(shared: &Shared, local: LocalQueue) {
    let index = local.index();
    context::init_worker(local);
    tracing::debug!(processor = %shared.name(), worker = index, "worker started");

    let mut ticker = Ticker::new();
    let mut policy = WorkerPolicy::from(shared.config());
    let mut prefer_global = false;

    loop {
        let task = context::with_local_queue(|local| {
            local.and_then(|local| shared.queue().pop_blocking(local, prefer_global))
        });
        let Some(task) = task else {
            break;
        };

        shared.check_wait_time(&task);

        // Task bodies run behind `catch_unwind` already. A panic here comes
        // from the engine itself and leaves shared state broken.
        if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(|| task.do_step())) {
            tracing::error!(
                processor = %shared.name(),
                worker = index,
                task_id = %task.id(),
                panic = ?panic,
                "unhandled panic while stepping a task, aborting"
            );
            process::abort();
        }
        drop(task);

        let events = ticker.tick(shared.queue(), &mut policy);
        match process_ticker_events(events) {
            ControlFlow::Break(()) => break,
            ControlFlow::Continue(pop_global) => prefer_global = pop_global,
        }
    }

    tracing::debug!(processor = %shared.name(), worker = index, "worker stopped");
}

fn process_ticker_events(events: TickerEvents) -> ControlFlow<(), bool> {
    if events.contains(TickerEvents::SHUTDOWN) {
        ControlFlow::Break(())
    } else {
        // Enforce fairness for newly submitted tasks.
        ControlFlow::Continue(events.contains(TickerEvents::POP_GLOBAL_QUEUE))
    }
}

#[derive(Debug, Clone)]
struct WorkerPolicy {
    global_queue_interval: u32,
}

impl WorkerPolicy {
    #[inline(always)]
    fn should_pop_global_queue(&self, tick: u32) -> bool {
        tick.is_multiple_of(self.global_queue_interval)
    }
}

impl From<&TaskProcessorConfig> for WorkerPolicy {
    fn from(config: &TaskProcessorConfig) -> Self {
        Self {
            global_queue_interval: config.global_queue_interval,
        }
    }
}

impl TickerData for WorkerPolicy {
    type Context = TaskQueue;

    #[inline(always)]
    fn update_and_check(&mut self, queue: &TaskQueue, tick: u32) -> TickerEvents {
        // The queue is only stopped once every task finished.
        if queue.is_stopped() && queue.len() == 0 {
            return TickerEvents::SHUTDOWN;
        }

        let mut events = TickerEvents::empty();
        if self.should_pop_global_queue(tick) {
            events.insert(TickerEvents::POP_GLOBAL_QUEUE);
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::stop(TickerEvents::SHUTDOWN | TickerEvents::POP_GLOBAL_QUEUE, ControlFlow::Break(()))]
    #[case::fair(TickerEvents::POP_GLOBAL_QUEUE, ControlFlow::Continue(true))]
    #[case::nothing(TickerEvents::empty(), ControlFlow::Continue(false))]
    fn test_process_ticker_events(
        #[case] events: TickerEvents,
        #[case] expected: ControlFlow<(), bool>,
    ) {
        assert_eq!(process_ticker_events(events), expected);
    }

    #[test]
    fn test_policy_pops_global_every_interval() {
        let (queue, _locals) = TaskQueue::new(1, 1, 1);
        let mut policy = WorkerPolicy {
            global_queue_interval: 4,
        };
        let mut ticker = Ticker::new();

        let popped = (0..12)
            .map(|_| ticker.tick(&queue, &mut policy))
            .filter(|e| e.contains(TickerEvents::POP_GLOBAL_QUEUE))
            .count();
        assert_eq!(popped, 3);

        queue.stop();
        assert_eq!(ticker.tick(&queue, &mut policy), TickerEvents::SHUTDOWN);
    }
}
