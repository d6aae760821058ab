//! Bounded multiple producer, single consumer queue.
//!
//! Producers block while the queue is at its maximum length, the consumer
//! blocks while it is empty. The limit is soft: producers that were waiting
//! together may overrun it slightly. Once every producer is gone the consumer
//! drains what is left and then sees the end of the queue. Once the consumer
//! is gone every push fails.
use crate::current_task;
use crate::deadline::Deadline;
use crate::sync::SingleConsumerEvent;
use crate::sync::wait_list::{WaitList, WaiterKey};
use crate::task::TaskContext;
use crate::task::sleep::{EarlyWakeup, WaitStrategy};
use crate::task::state::WakeupSource;
use crossbeam_deque::{Injector, Steal};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

pub struct MpscQueue<T> {
    items: Injector<T>,
    len: AtomicUsize,
    max_length: AtomicUsize,
    nonempty: SingleConsumerEvent,
    nonfull: parking_lot::Mutex<WaitList>,
    producers: AtomicUsize,
    producers_gone: AtomicBool,
    consumer_created: AtomicBool,
    consumer_gone: AtomicBool,
}

impl<T> MpscQueue<T> {
    /// Creates an unbounded queue.
    pub fn new() -> Arc<Self> {
        Self::with_max_length(usize::MAX)
    }

    pub fn with_max_length(max_length: usize) -> Arc<Self> {
        Arc::new(Self {
            items: Injector::new(),
            len: AtomicUsize::new(0),
            max_length: AtomicUsize::new(max_length),
            nonempty: SingleConsumerEvent::new(),
            nonfull: parking_lot::Mutex::new(WaitList::new()),
            producers: AtomicUsize::new(0),
            producers_gone: AtomicBool::new(false),
            consumer_created: AtomicBool::new(false),
            consumer_gone: AtomicBool::new(false),
        })
    }

    /// Returns a new producer. There may be any number of them.
    pub fn producer(self: &Arc<Self>) -> Producer<T> {
        self.producers.fetch_add(1, Ordering::AcqRel);
        self.producers_gone.store(false, Ordering::Release);
        Producer {
            queue: Arc::clone(self),
        }
    }

    /// Returns the consumer, `None` if it was already taken.
    pub fn consumer(self: &Arc<Self>) -> Option<Consumer<T>> {
        if self.consumer_created.swap(true, Ordering::AcqRel) {
            return None;
        }
        Some(Consumer {
            queue: Arc::clone(self),
        })
    }

    /// Changes the length over which pushes block. Blocked producers
    /// re-check against the new limit.
    pub fn set_max_length(&self, max_length: usize) {
        self.max_length.store(max_length, Ordering::Release);
        self.nonfull.lock().wake_all();
    }

    pub fn max_length(&self) -> usize {
        self.max_length.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn has_room(&self, max_length: Option<usize>) -> bool {
        self.consumer_gone.load(Ordering::Acquire)
            || self.len() < max_length.unwrap_or_else(|| self.max_length())
    }

    async fn push_until(
        &self,
        value: T,
        deadline: Deadline,
        max_length: Option<usize>,
    ) -> Result<(), T> {
        if !self.has_room(max_length) {
            self.wait_for_room(deadline, max_length).await;
        }
        if deadline.is_reached() || current_task::should_cancel() {
            return Err(value);
        }
        self.do_push(value)
    }

    async fn wait_for_room(&self, deadline: Deadline, max_length: Option<usize>) {
        let current = current_task::context();
        while !self.has_room(max_length) {
            if deadline.is_reached() {
                return;
            }

            let mut strategy = RoomWaitStrategy {
                queue: self,
                max_length,
                current: &current,
                key: None,
            };
            match current.sleep(&mut strategy, deadline).await {
                WakeupSource::CancelRequest | WakeupSource::DeadlineTimer => return,
                _ => {}
            }
        }
    }

    fn do_push(&self, value: T) -> Result<(), T> {
        if self.consumer_gone.load(Ordering::Acquire) {
            return Err(value);
        }

        self.len.fetch_add(1, Ordering::AcqRel);
        self.items.push(value);
        self.nonempty.send();
        Ok(())
    }

    async fn pop_until(&self, deadline: Deadline) -> Option<T> {
        loop {
            if let Some(value) = self.do_pop() {
                return Some(value);
            }
            if self.producers_gone.load(Ordering::Acquire)
                || deadline.is_reached()
                || current_task::should_cancel()
            {
                // A push may have landed between the pop and the checks.
                return self.do_pop();
            }

            self.nonempty.wait_for_event_until(deadline).await;
        }
    }

    fn do_pop(&self) -> Option<T> {
        let value = std::iter::repeat_with(|| self.items.steal())
            .find(|s| !s.is_retry())
            .and_then(Steal::success)?;

        self.len.fetch_sub(1, Ordering::AcqRel);
        self.nonfull.lock().wake_all();
        Some(value)
    }
}

impl<T> fmt::Debug for MpscQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MpscQueue")
            .field("len", &self.len())
            .field("max_length", &self.max_length())
            .field("producers", &self.producers.load(Ordering::Relaxed))
            .field("consumer_gone", &self.consumer_gone.load(Ordering::Relaxed))
            .finish()
    }
}

/// Pushing side of an [`MpscQueue`]. Cloning it adds a producer.
///
/// Every push hands the value back if it could not be queued.
pub struct Producer<T> {
    queue: Arc<MpscQueue<T>>,
}

impl<T> Producer<T> {
    /// Pushes `value`, waiting for room if the queue is full. Fails if the
    /// consumer is gone or the task is cancelled.
    pub async fn push(&self, value: T) -> Result<(), T> {
        self.queue.push_until(value, Deadline::UNREACHABLE, None).await
    }

    pub async fn push_for(&self, value: T, timeout: Duration) -> Result<(), T> {
        self.push_until(value, Deadline::from_duration(timeout)).await
    }

    pub async fn push_until(&self, value: T, deadline: Deadline) -> Result<(), T> {
        self.queue.push_until(value, deadline, None).await
    }

    /// Like [`push_until`](Self::push_until), blocking over `max_length`
    /// instead of the queue's own limit.
    pub async fn push_with_limit_override(
        &self,
        value: T,
        max_length: usize,
        deadline: Deadline,
    ) -> Result<(), T> {
        self.queue.push_until(value, deadline, Some(max_length)).await
    }

    /// Pushes without waiting. Callable outside of tasks.
    pub fn try_push(&self, value: T) -> Result<(), T> {
        if self.queue.len() >= self.queue.max_length() {
            return Err(value);
        }
        self.queue.do_push(value)
    }

    pub fn queue(&self) -> &MpscQueue<T> {
        &self.queue
    }
}

impl<T> Clone for Producer<T> {
    fn clone(&self) -> Self {
        self.queue.producer()
    }
}

impl<T> Drop for Producer<T> {
    fn drop(&mut self) {
        if self.queue.producers.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.queue.producers_gone.store(true, Ordering::Release);
        }
        self.queue.nonempty.send();
    }
}

impl<T> fmt::Debug for Producer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Producer").field("queue", &self.queue).finish()
    }
}

/// Popping side of an [`MpscQueue`].
pub struct Consumer<T> {
    queue: Arc<MpscQueue<T>>,
}

impl<T> Consumer<T> {
    /// Pops the oldest value, waiting while the queue is empty.
    ///
    /// Returns `None` once every producer is gone and the queue is drained,
    /// or if the task is cancelled.
    pub async fn pop(&self) -> Option<T> {
        self.queue.pop_until(Deadline::UNREACHABLE).await
    }

    pub async fn pop_for(&self, timeout: Duration) -> Option<T> {
        self.pop_until(Deadline::from_duration(timeout)).await
    }

    pub async fn pop_until(&self, deadline: Deadline) -> Option<T> {
        self.queue.pop_until(deadline).await
    }

    pub fn try_pop(&self) -> Option<T> {
        self.queue.do_pop()
    }

    pub fn queue(&self) -> &MpscQueue<T> {
        &self.queue
    }
}

impl<T> Drop for Consumer<T> {
    fn drop(&mut self) {
        self.queue.consumer_gone.store(true, Ordering::Release);
        self.queue.nonfull.lock().wake_all();
    }
}

impl<T> fmt::Debug for Consumer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Consumer").field("queue", &self.queue).finish()
    }
}

struct RoomWaitStrategy<'a, T> {
    queue: &'a MpscQueue<T>,
    max_length: Option<usize>,
    current: &'a Arc<TaskContext>,
    key: Option<WaiterKey>,
}

impl<T> WaitStrategy for RoomWaitStrategy<'_, T> {
    fn setup_wakeups(&mut self) -> EarlyWakeup {
        let mut waiters = self.queue.nonfull.lock();

        // Pops and the consumer drop change the state before taking this
        // lock.
        if self.queue.has_room(self.max_length) {
            return EarlyWakeup(true);
        }

        self.key = Some(waiters.append(Arc::clone(self.current)));
        EarlyWakeup(false)
    }

    fn disable_wakeups(&mut self) {
        if let Some(key) = self.key.take() {
            self.queue.nonfull.lock().remove(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate as strand;
    use anyhow::{Context, Result};
    use static_assertions::assert_impl_all;

    assert_impl_all!(Producer<String>: Send, Sync);
    assert_impl_all!(Consumer<String>: Send, Sync);

    #[test]
    fn test_single_consumer() {
        let queue = MpscQueue::<i32>::new();
        let consumer = queue.consumer();
        assert!(consumer.is_some());
        assert!(queue.consumer().is_none());
    }

    #[test]
    fn test_try_push_respects_max_length() {
        let queue = MpscQueue::with_max_length(2);
        let producer = queue.producer();
        let _consumer = queue.consumer();

        assert_eq!(producer.try_push(1), Ok(()));
        assert_eq!(producer.try_push(2), Ok(()));
        assert_eq!(producer.try_push(3), Err(3));
        assert_eq!(queue.len(), 2);

        queue.set_max_length(3);
        assert_eq!(producer.try_push(3), Ok(()));
    }

    #[strand::test]
    async fn test_values_come_out_in_order() -> Result<()> {
        let queue = MpscQueue::new();
        let producer = queue.producer();
        let consumer = queue.consumer().context("consumer taken")?;

        for i in 0..10 {
            assert_eq!(producer.push(i).await, Ok(()));
        }
        for i in 0..10 {
            assert_eq!(consumer.pop().await, Some(i));
        }
        assert!(queue.is_empty());
        assert_eq!(consumer.try_pop(), None);
        Ok(())
    }

    #[strand::test]
    async fn test_consumer_drains_after_producers_are_gone() -> Result<()> {
        let queue = MpscQueue::new();
        let consumer = queue.consumer().context("consumer taken")?;
        let first = queue.producer();
        let second = first.clone();

        first.try_push(1).map_err(|_| anyhow::anyhow!("push failed"))?;
        drop(first);
        second.try_push(2).map_err(|_| anyhow::anyhow!("push failed"))?;
        drop(second);

        assert_eq!(consumer.pop().await, Some(1));
        assert_eq!(consumer.pop().await, Some(2));
        assert_eq!(consumer.pop().await, None);
        Ok(())
    }

    #[strand::test]
    async fn test_push_fails_once_consumer_is_gone() -> Result<()> {
        let queue = MpscQueue::with_max_length(1);
        let producer = queue.producer();
        let consumer = queue.consumer().context("consumer taken")?;

        assert_eq!(producer.push(1).await, Ok(()));
        drop(consumer);
        assert_eq!(producer.push(2).await, Err(2));
        assert_eq!(producer.try_push(3), Err(3));
        Ok(())
    }

    #[strand::test]
    async fn test_push_times_out_while_full() -> Result<()> {
        let queue = MpscQueue::with_max_length(1);
        let producer = queue.producer();
        let _consumer = queue.consumer();

        assert_eq!(producer.push(1).await, Ok(()));
        assert_eq!(producer.push_for(2, Duration::from_millis(10)).await, Err(2));
        assert_eq!(
            producer
                .push_with_limit_override(2, 2, Deadline::from_duration(Duration::from_millis(10)))
                .await,
            Ok(())
        );
        assert_eq!(queue.len(), 2);
        Ok(())
    }

    #[strand::test]
    async fn test_pop_times_out_while_empty() -> Result<()> {
        let queue = MpscQueue::<i32>::new();
        let _producer = queue.producer();
        let consumer = queue.consumer().context("consumer taken")?;

        assert_eq!(consumer.pop_for(Duration::from_millis(10)).await, None);
        Ok(())
    }

    #[strand::test(worker_threads = 2)]
    async fn test_full_queue_blocks_producer_until_pop() -> Result<()> {
        let queue = MpscQueue::with_max_length(1);
        let consumer = queue.consumer().context("consumer taken")?;
        let producer = queue.producer();
        assert_eq!(producer.push(1).await, Ok(()));

        let pusher = strand::spawn(async move { producer.push(2).await });
        strand::current_task::sleep_for(Duration::from_millis(10)).await;
        assert!(!pusher.is_finished());
        assert_eq!(queue.len(), 1);

        assert_eq!(consumer.pop().await, Some(1));
        assert_eq!(pusher.get().await?, Ok(()));
        assert_eq!(consumer.pop().await, Some(2));
        assert_eq!(consumer.pop().await, None);
        Ok(())
    }

    #[strand::test(worker_threads = 4)]
    async fn test_many_producers() -> Result<()> {
        const PRODUCERS: usize = 4;
        const PER_PRODUCER: usize = 100;

        let queue = MpscQueue::with_max_length(8);
        let consumer = queue.consumer().context("consumer taken")?;

        let producers = (0..PRODUCERS)
            .map(|p| {
                let producer = queue.producer();
                strand::spawn(async move {
                    for i in 0..PER_PRODUCER {
                        if producer.push(p * PER_PRODUCER + i).await.is_err() {
                            return false;
                        }
                    }
                    true
                })
            })
            .collect::<Vec<_>>();

        let mut seen = Vec::new();
        while let Some(value) = consumer.pop().await {
            seen.push(value);
        }
        for producer in producers {
            assert!(producer.get().await?);
        }

        seen.sort_unstable();
        assert_eq!(seen, (0..PRODUCERS * PER_PRODUCER).collect::<Vec<_>>());
        Ok(())
    }

    #[strand::test]
    async fn test_pop_wakes_on_push_from_foreign_thread() -> Result<()> {
        let queue = MpscQueue::new();
        let consumer = queue.consumer().context("consumer taken")?;
        let producer = queue.producer();

        let pusher = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            producer.try_push(String::from("foreign"))
        });

        assert_eq!(consumer.pop().await.as_deref(), Some("foreign"));
        assert_eq!(
            pusher
                .join()
                .map_err(|_| anyhow::anyhow!("pusher thread panicked"))?,
            Ok(())
        );
        Ok(())
    }

    #[strand::test]
    async fn test_cancelled_pop_returns_none() -> Result<()> {
        let queue = MpscQueue::<i32>::new();
        let producer = queue.producer();
        let consumer = queue.consumer().context("consumer taken")?;

        let popper = strand::spawn(async move { consumer.pop().await });
        strand::current_task::sleep_for(Duration::from_millis(5)).await;
        popper.request_cancel();

        assert_eq!(popper.get().await?, None);
        drop(producer);
        Ok(())
    }
}
