use crate as strand;
use crate::current_task;
use crate::runtime::{Builder, Handle, OverloadAction, TaskProcessor, TaskProcessorSettings};
use crate::sync::{ConditionVariable, CvStatus, Mutex};
use crate::task::{CancellationReason, TaskError, TaskFactory, TaskWithResult};
use anyhow::Result;
use static_assertions::assert_impl_all;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

assert_impl_all!(TaskProcessor: Send, Sync);
assert_impl_all!(Handle: Send, Sync, Clone);

/// Occupies `count` workers until the returned flag is set.
fn block_workers(processor: &TaskProcessor, count: usize) -> (Arc<AtomicBool>, Vec<TaskWithResult<()>>) {
    let started = Arc::new(AtomicUsize::new(0));
    let released = Arc::new(AtomicBool::new(false));

    let blockers = (0..count)
        .map(|_| {
            let (started, released) = (Arc::clone(&started), Arc::clone(&released));
            TaskFactory::new(processor.handle())
                .critical()
                .spawn(async move {
                    started.fetch_add(1, Ordering::SeqCst);
                    while !released.load(Ordering::SeqCst) {
                        thread::sleep(Duration::from_millis(1));
                    }
                })
        })
        .collect();

    while started.load(Ordering::SeqCst) < count {
        thread::sleep(Duration::from_millis(1));
    }
    (released, blockers)
}

#[test]
fn test_queue_length_overload_cancels_excess_tasks() -> Result<()> {
    let processor = Builder::new().name("overload").worker_threads(4).try_build()?;
    let (released, blockers) = block_workers(&processor, 4);

    processor.set_settings(TaskProcessorSettings {
        wait_queue_time_limit: None,
        wait_queue_length_limit: Some(10),
        overload_action: OverloadAction::Cancel,
    });

    let tasks = (0..1000)
        .map(|i| processor.spawn(async move { i }))
        .collect::<Vec<_>>();
    assert_eq!(processor.stats().queue_size, 1000);

    released.store(true, Ordering::SeqCst);
    blockers.into_iter().try_for_each(|b| b.blocking_get())?;

    let (mut admitted, mut shed) = (0, 0);
    for task in tasks {
        match task.blocking_get() {
            Ok(_) => admitted += 1,
            Err(TaskError::Cancelled(CancellationReason::Overload)) => shed += 1,
            Err(e) => panic!("unexpected outcome {e}"),
        }
    }
    assert_eq!((admitted, shed), (10, 990));

    let stats = processor.stats();
    assert_eq!(stats.overloaded, 990);
    assert_eq!(stats.cancelled_by_overload, 990);
    Ok(())
}

#[test]
fn test_ignore_action_admits_everything() -> Result<()> {
    let processor = Builder::new()
        .worker_threads(2)
        .settings(TaskProcessorSettings {
            wait_queue_time_limit: None,
            wait_queue_length_limit: Some(1),
            overload_action: OverloadAction::Ignore,
        })
        .try_build()?;
    let (released, blockers) = block_workers(&processor, 2);

    let tasks = (0..20).map(|i| processor.spawn(async move { i })).collect::<Vec<_>>();
    released.store(true, Ordering::SeqCst);
    blockers.into_iter().try_for_each(|b| b.blocking_get())?;

    let sum = tasks
        .into_iter()
        .map(|t| t.blocking_get())
        .sum::<Result<u32, _>>()?;
    assert_eq!(sum, (0..20).sum());
    assert_eq!(processor.stats().overloaded, 19);
    assert_eq!(processor.stats().cancelled_by_overload, 0);
    Ok(())
}

#[test]
fn test_critical_tasks_bypass_overload() -> Result<()> {
    let processor = Builder::new()
        .worker_threads(1)
        .settings(TaskProcessorSettings {
            wait_queue_time_limit: None,
            wait_queue_length_limit: Some(0),
            overload_action: OverloadAction::Cancel,
        })
        .try_build()?;

    let normal = processor.spawn(async { 1 });
    let critical = TaskFactory::new(processor.handle()).critical().spawn(async { 2 });

    assert_eq!(
        normal.blocking_get(),
        Err(TaskError::Cancelled(CancellationReason::Overload))
    );
    assert_eq!(critical.blocking_get(), Ok(2));
    Ok(())
}

#[test]
fn test_queue_wait_time_overload() -> Result<()> {
    let processor = Builder::new()
        .worker_threads(1)
        .settings(TaskProcessorSettings {
            wait_queue_time_limit: Some(Duration::from_millis(10)),
            wait_queue_length_limit: None,
            overload_action: OverloadAction::Cancel,
        })
        .try_build()?;

    let (released, blockers) = block_workers(&processor, 1);
    // Queued behind the blocker, waits well past the limit.
    let late = processor.spawn(async { "late" });
    thread::sleep(Duration::from_millis(50));
    released.store(true, Ordering::SeqCst);
    blockers.into_iter().try_for_each(|b| b.blocking_get())?;

    // Admitted when queued, so it still runs.
    assert_eq!(late.blocking_get(), Ok("late"));

    // Its dequeue flagged the processor as overloaded.
    let shed = processor.spawn(async { "shed" });
    assert_eq!(
        shed.blocking_get(),
        Err(TaskError::Cancelled(CancellationReason::Overload))
    );

    // The shed task was dequeued right away, which cleared the flag.
    let fine = processor.spawn(async { "fine" });
    assert_eq!(fine.blocking_get(), Ok("fine"));
    Ok(())
}

#[test]
fn test_shutdown_cancels_running_tasks() -> Result<()> {
    let processor = Builder::new().worker_threads(2).try_build()?;
    let started = Arc::new(AtomicUsize::new(0));

    let sleeper = {
        let started = Arc::clone(&started);
        processor.spawn(async move {
            started.fetch_add(1, Ordering::SeqCst);
            current_task::interruptible_sleep_for(Duration::from_secs(60)).await;
            current_task::cancellation_reason()
        })
    };
    let detached_done = Arc::new(AtomicBool::new(false));
    {
        let (started, detached_done) = (Arc::clone(&started), Arc::clone(&detached_done));
        processor
            .spawn(async move {
                started.fetch_add(1, Ordering::SeqCst);
                current_task::interruptible_sleep_for(Duration::from_secs(60)).await;
                detached_done.store(true, Ordering::SeqCst);
            })
            .detach();
    }
    while started.load(Ordering::SeqCst) < 2 {
        thread::sleep(Duration::from_millis(1));
    }

    processor.shutdown();

    assert_eq!(sleeper.blocking_get(), Ok(CancellationReason::Shutdown));
    assert!(detached_done.load(Ordering::SeqCst));
    Ok(())
}

#[test]
fn test_stats_count_tasks() -> Result<()> {
    let processor = Builder::new().worker_threads(2).try_build()?;

    let ok = processor.spawn(async {});
    let cancelled = processor.spawn(async {
        current_task::interruptible_sleep_for(Duration::from_secs(60)).await;
    });
    ok.blocking_get()?;
    cancelled.request_cancel();
    // Either interrupted while sleeping or dropped before its first step.
    let _ = cancelled.blocking_get();

    let stats = processor.stats();
    assert_eq!(stats.created, 2);
    assert_eq!(stats.finished, 2);
    assert_eq!(stats.cancelled, 1);
    assert_eq!(stats.alive, 0);
    assert_eq!(stats.worker_threads, 2);
    Ok(())
}

#[test]
fn test_settings_roundtrip() -> Result<()> {
    let processor = Builder::new().worker_threads(1).try_build()?;
    assert_eq!(processor.settings(), TaskProcessorSettings::default());

    let settings = TaskProcessorSettings {
        wait_queue_time_limit: Some(Duration::from_millis(250)),
        wait_queue_length_limit: Some(64),
        overload_action: OverloadAction::Cancel,
    };
    processor.handle().set_settings(settings);
    assert_eq!(processor.settings(), settings);
    Ok(())
}

#[test]
fn test_worker_thread_names() -> Result<()> {
    let processor = Builder::new().name("names").worker_threads(2).try_build()?;
    let name = processor.block_on(async { thread::current().name().map(str::to_owned) });

    let name = name.unwrap_or_default();
    assert!(name == "names_0" || name == "names_1", "{name}");
    Ok(())
}

#[test]
#[should_panic(expected = "boom")]
fn test_block_on_resumes_panic() {
    let processor = Builder::new().worker_threads(1).try_build().unwrap();
    processor.block_on(async {
        if current_task::try_id().is_some() {
            panic!("boom");
        }
    });
}

#[test]
#[should_panic(expected = "blocking wait for a task on a task processor worker thread")]
fn test_block_on_from_worker_panics() {
    let processor = Builder::new().worker_threads(1).try_build().unwrap();
    processor.block_on(async {
        let nested = Builder::new().worker_threads(1).try_build().unwrap();
        nested.block_on(async {});
    });
}

#[strand::test(worker_threads = 4)]
async fn test_many_tasks_across_workers() -> Result<()> {
    let counter = Arc::new(AtomicUsize::new(0));

    let tasks = (0..500)
        .map(|_| {
            let counter = Arc::clone(&counter);
            strand::spawn(async move {
                for _ in 0..3 {
                    current_task::yield_now().await;
                }
                counter.fetch_add(1, Ordering::Relaxed);
            })
        })
        .collect::<Vec<_>>();

    for task in tasks {
        task.get().await?;
    }
    assert_eq!(counter.load(Ordering::Relaxed), 500);
    Ok(())
}

#[strand::test(worker_threads = 3)]
async fn test_producer_consumer_with_cancellation() -> Result<()> {
    #[derive(Default)]
    struct Queue {
        items: Vec<u32>,
        closed: bool,
    }

    let state = Arc::new((Mutex::new(Queue::default()), ConditionVariable::<Queue>::new()));

    let consumer = {
        let state = Arc::clone(&state);
        // Critical so that it starts even if cancelled right away.
        strand::spawn_critical(async move {
            let (mutex, cv) = &*state;
            let mut received = Vec::new();
            let mut guard = mutex.lock().await;
            loop {
                received.append(&mut guard.items);
                if guard.closed {
                    return (received, CvStatus::NoTimeout);
                }
                let (next, status) = cv.wait(guard).await;
                guard = next;
                if status == CvStatus::Cancelled {
                    received.append(&mut guard.items);
                    return (received, status);
                }
            }
        })
    };

    let (mutex, cv) = &*state;
    for i in 0..10 {
        mutex.lock().await.items.push(i);
        cv.notify_one();
        current_task::yield_now().await;
    }

    consumer.request_cancel();
    let (received, status) = consumer.get().await?;
    assert_eq!(status, CvStatus::Cancelled);
    assert_eq!(received, (0..10).collect::<Vec<_>>());

    // The consumer released the mutex on its way out.
    assert!(mutex.try_lock().is_some());
    Ok(())
}
