//! End-to-End Offload Tests
//!
//! Light-tasks running on the scheduler submit blocking work to the IO pool
//! and await the result:
//! - values and errors cross the bridge intact
//! - submission order is execution order on a single-thread pool
//! - waiting light-tasks do not occupy scheduler workers
//! - deadlines, panics and blocking misuse surface as errors
//!
//! # Running Tests
//! ```bash
//! cargo test --test offload_scenarios
//! ```

use parking_lot::Mutex;
use raya_offload::{
    is_worker_thread, sleep, yield_now, Handle, InlineQueue, OffloadError, OffloadExecutor,
    PoolConfig, QueuePolicy, Runtime, RuntimeConfig, SchedulerConfig,
};
use std::future::Future;
use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn runtime(workers: usize, io_threads: usize) -> Runtime {
    Runtime::new(RuntimeConfig {
        scheduler: SchedulerConfig::with_workers(workers),
        io_pool: PoolConfig::with_threads(io_threads),
    })
    .unwrap()
}

// ===== Value And Error Delivery =====

#[test]
fn test_write_returns_one() {
    let runtime = runtime(1, 1);
    let executor = runtime.executor();
    let sink = Arc::new(Mutex::new(Vec::<u8>::new()));

    let written = {
        let sink = sink.clone();
        runtime
            .block_on(async move {
                executor
                    .submit_fallible(move || -> io::Result<usize> {
                        let mut sink = sink.lock();
                        sink.write_all(b"hello")?;
                        Ok(1)
                    })?
                    .await
            })
            .unwrap()
    };

    assert_eq!(written.unwrap(), 1);
    assert_eq!(sink.lock().as_slice(), b"hello");
}

#[test]
fn test_io_error_reaches_light_task() {
    let runtime = runtime(1, 1);
    let executor = runtime.executor();

    let result = runtime
        .block_on(async move {
            executor
                .submit_fallible(|| -> io::Result<usize> {
                    Err(io::Error::other("No space left on device"))
                })?
                .await
        })
        .unwrap();

    let err = result.unwrap_err();
    let work = err.work_error().unwrap();
    assert!(work.message().contains("No space left"));
    assert!(work.downcast_ref::<io::Error>().is_some());
}

#[test]
fn test_work_runs_off_the_scheduler() {
    let runtime = runtime(1, 1);
    let executor = runtime.executor();

    let (on_worker, in_task) = runtime
        .block_on(async move {
            let on_worker = executor.submit(is_worker_thread)?.await?;
            Ok::<_, OffloadError>((on_worker, is_worker_thread()))
        })
        .unwrap()
        .unwrap();

    assert!(!on_worker);
    assert!(in_task);
}

#[test]
fn test_panicking_work_surfaces_as_failure() {
    let runtime = runtime(1, 1);
    let executor = runtime.executor();

    let result = runtime
        .block_on(async move { executor.submit(|| -> u32 { panic!("io thread panic") })?.await })
        .unwrap();

    let err = result.unwrap_err();
    assert!(err.work_error().unwrap().is_panic());

    // The pool thread survived the panic.
    assert_eq!(runtime.executor().submit(|| 5).unwrap().wait().unwrap(), 5);
}

// ===== Ordering =====

#[test]
fn test_single_thread_pool_runs_in_submission_order() {
    let runtime = runtime(2, 1);
    let executor = runtime.executor();
    let log = Arc::new(Mutex::new(Vec::new()));

    let futures = {
        let log = log.clone();
        runtime
            .block_on(async move {
                let mut futures = Vec::new();
                for i in 0..20 {
                    let log = log.clone();
                    futures.push(executor.submit(move || log.lock().push(i))?);
                }
                Ok::<_, OffloadError>(futures)
            })
            .unwrap()
            .unwrap()
    };
    for future in futures {
        future.wait().unwrap();
    }

    assert_eq!(*log.lock(), (0..20).collect::<Vec<_>>());
}

// ===== Non-Blocking Behaviour =====

#[test]
fn test_waiting_tasks_do_not_block_workers() {
    let runtime = runtime(2, 16);
    let executor = runtime.executor();
    let stop = Arc::new(AtomicBool::new(false));
    let ticks = Arc::new(AtomicUsize::new(0));

    // A ticker light-task that must keep making progress.
    let ticker = {
        let stop = stop.clone();
        let ticks = ticks.clone();
        runtime
            .spawn(async move {
                while !stop.load(Ordering::SeqCst) {
                    ticks.fetch_add(1, Ordering::SeqCst);
                    sleep(Duration::from_millis(5)).await;
                }
            })
            .unwrap()
    };

    let start = Instant::now();
    let sleepers: Vec<_> = (0..16)
        .map(|i| {
            let executor = executor.clone();
            runtime
                .spawn(async move {
                    executor
                        .submit(move || {
                            thread::sleep(Duration::from_millis(100));
                            i
                        })?
                        .await
                })
                .unwrap()
        })
        .collect();

    let mut total = 0;
    for sleeper in sleepers {
        total += sleeper.wait().unwrap().unwrap();
    }
    let elapsed = start.elapsed();

    assert_eq!(total, (0..16).sum::<i32>());
    // 16 x 100ms on 16 IO threads with only 2 scheduler workers.
    assert!(elapsed < Duration::from_millis(1000), "took {elapsed:?}");
    assert!(ticks.load(Ordering::SeqCst) >= 5);

    stop.store(true, Ordering::SeqCst);
    ticker.wait().unwrap();
}

#[test]
fn test_many_light_tasks_share_one_worker() {
    let runtime = runtime(1, 4);
    let executor = runtime.executor();
    let completed = Arc::new(AtomicUsize::new(0));

    let joins: Vec<_> = (0..100)
        .map(|i| {
            let executor = executor.clone();
            let completed = completed.clone();
            runtime
                .spawn(async move {
                    let doubled = executor.submit(move || i * 2)?.await?;
                    yield_now().await;
                    completed.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, OffloadError>(doubled)
                })
                .unwrap()
        })
        .collect();

    for (i, join) in joins.into_iter().enumerate() {
        assert_eq!(join.wait().unwrap().unwrap(), i * 2);
    }
    assert_eq!(completed.load(Ordering::SeqCst), 100);
}

// ===== Deadlines And Misuse =====

#[test]
fn test_timeout_expires_but_work_finishes() {
    let runtime = runtime(1, 1);
    let executor = runtime.executor();
    let finished = Arc::new(AtomicBool::new(false));

    let result = {
        let finished = finished.clone();
        runtime
            .block_on(async move {
                executor
                    .submit(move || {
                        thread::sleep(Duration::from_millis(200));
                        finished.store(true, Ordering::SeqCst);
                    })?
                    .timeout(Duration::from_millis(20))
                    .await
            })
            .unwrap()
    };
    assert!(matches!(result, Err(OffloadError::Timeout)));

    // The work is not interrupted.
    let start = Instant::now();
    while !finished.load(Ordering::SeqCst) {
        assert!(start.elapsed() < Duration::from_secs(5));
        thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn test_timeout_not_hit() {
    let runtime = runtime(1, 1);
    let executor = runtime.executor();
    let value = runtime
        .block_on(async move {
            executor
                .submit(|| "fast")?
                .timeout(Duration::from_secs(5))
                .await
        })
        .unwrap();
    assert_eq!(value.unwrap(), "fast");
}

#[test]
fn test_finished_timeouts_release_timer_entries() {
    let runtime = runtime(2, 2);
    let executor = runtime.executor();

    let total = runtime
        .block_on(async move {
            let mut total = 0u64;
            for i in 0..500u64 {
                total += executor
                    .submit(move || i)?
                    .timeout(Duration::from_secs(3600))
                    .await?;
            }
            Ok::<_, OffloadError>(total)
        })
        .unwrap()
        .unwrap();

    assert_eq!(total, (0..500u64).sum::<u64>());
    assert_eq!(runtime.scheduler_stats().pending_timers, 0);
}

#[test]
fn test_dropped_sleep_releases_timer_entry() {
    let runtime = runtime(1, 1);

    let pending_inside = runtime
        .block_on(async {
            let handle = Handle::current();
            let mut sleeper = Box::pin(sleep(Duration::from_secs(3600)));
            // One poll registers the sleep without completing it.
            std::future::poll_fn(|cx| {
                assert!(sleeper.as_mut().poll(cx).is_pending());
                std::task::Poll::Ready(())
            })
            .await;
            // Re-polling updates the registration instead of adding one.
            std::future::poll_fn(|cx| {
                assert!(sleeper.as_mut().poll(cx).is_pending());
                std::task::Poll::Ready(())
            })
            .await;
            let pending = handle.stats().pending_timers;
            drop(sleeper);
            pending
        })
        .unwrap();

    assert_eq!(pending_inside, 1);
    assert_eq!(runtime.scheduler_stats().pending_timers, 0);
}

#[test]
fn test_blocking_wait_inside_light_task_is_refused() {
    let runtime = runtime(1, 1);
    let executor = runtime.executor();

    let result = runtime
        .block_on(async move { executor.submit(|| 1)?.wait() })
        .unwrap();
    assert!(matches!(result, Err(OffloadError::WouldBlockScheduler)));
}

#[test]
fn test_bounded_queue_full_on_worker_thread() {
    let runtime = Runtime::new(RuntimeConfig {
        scheduler: SchedulerConfig::with_workers(1),
        io_pool: PoolConfig {
            threads: 1,
            queue: QueuePolicy::Bounded { capacity: 1 },
            ..PoolConfig::default()
        },
    })
    .unwrap();
    let executor = runtime.executor();
    let release = Arc::new(AtomicBool::new(false));

    let outcome = {
        let release = release.clone();
        runtime
            .block_on(async move {
                let (started_tx, started_rx) = std::sync::mpsc::channel();
                let gate_release = release.clone();
                let gate = executor.submit(move || {
                    started_tx.send(()).ok();
                    while !gate_release.load(Ordering::SeqCst) {
                        thread::sleep(Duration::from_millis(1));
                    }
                })?;
                while started_rx.try_recv().is_err() {
                    yield_now().await;
                }
                let queued = executor.submit(|| ())?;
                let rejected = executor.submit(|| ());
                release.store(true, Ordering::SeqCst);
                gate.await?;
                queued.await?;
                Ok::<_, OffloadError>(rejected.map(|_| ()))
            })
            .unwrap()
            .unwrap()
    };

    assert!(matches!(outcome, Err(OffloadError::QueueFull { capacity: 1 })));
}

// ===== Mock Queue =====

#[test]
fn test_inline_queue_fulfils_before_await() {
    let runtime = runtime(1, 1);
    let queue = Arc::new(InlineQueue::new());
    let executor = OffloadExecutor::new(queue.clone());

    let value = runtime
        .block_on(async move {
            let future = executor.submit(|| 10)?;
            assert!(future.is_ready());
            future.await
        })
        .unwrap();

    assert_eq!(value.unwrap(), 10);
    assert_eq!(queue.executed(), 1);
}
