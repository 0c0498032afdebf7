// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! A pool of worker threads executing dispatched tasks.

use super::queue::{PoolStoppedError, TaskQueue};
use super::task::{outcome_channel, TaskHandle, TaskPanic};
use crate::macros::{log_debug, log_error, log_warn};
// Platforms that support `libc::sched_setaffinity()`.
#[cfg(all(
    not(miri),
    any(
        target_os = "android",
        target_os = "dragonfly",
        target_os = "freebsd",
        target_os = "linux"
    )
))]
use nix::{
    sched::{sched_setaffinity, CpuSet},
    unistd::Pid,
};
use std::io;
use std::num::NonZeroUsize;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::JoinHandle;
use thiserror::Error;

/// Number of threads to spawn in a thread pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ThreadCount {
    /// Spawn one thread per unit of parallelism returned by
    /// [`std::thread::available_parallelism()`], falling back to a single
    /// thread if detection fails.
    AvailableParallelism,
    /// Spawn the given number of threads.
    Count(NonZeroUsize),
}

impl TryFrom<usize> for ThreadCount {
    type Error = <NonZeroUsize as TryFrom<usize>>::Error;

    fn try_from(thread_count: usize) -> Result<Self, Self::Error> {
        let count = NonZeroUsize::try_from(thread_count)?;
        Ok(ThreadCount::Count(count))
    }
}

impl ThreadCount {
    /// Resolves to a concrete number of threads.
    fn resolve(self) -> NonZeroUsize {
        match self {
            ThreadCount::AvailableParallelism => std::thread::available_parallelism()
                .unwrap_or_else(|_e| {
                    log_warn!(
                        "Detecting the available parallelism failed ({_e}), spawning one thread."
                    );
                    NonZeroUsize::MIN
                }),
            ThreadCount::Count(count) => count,
        }
    }
}

/// Policy to pin worker threads to CPUs.
#[derive(Clone, Copy)]
pub enum CpuPinningPolicy {
    /// Don't pin worker threads to CPUs.
    No,
    /// Pin each worker thread to a CPU, if CPU pinning is supported and
    /// implemented on this platform.
    IfSupported,
    /// Pin each worker thread to a CPU. If CPU pinning isn't supported on this
    /// platform (or not implemented), building a thread pool will panic.
    Always,
}

/// Error returned when a pool's worker threads cannot be spawned.
#[derive(Error, Debug)]
#[error("failed to spawn a worker thread: {source}")]
pub struct PoolBuildError {
    #[from]
    source: io::Error,
}

/// A builder for [`ThreadPool`].
pub struct ThreadPoolBuilder {
    /// Number of worker threads to spawn in the pool.
    pub num_threads: ThreadCount,
    /// Policy to pin worker threads to CPUs.
    pub cpu_pinning: CpuPinningPolicy,
}

impl ThreadPoolBuilder {
    /// Spawns a thread pool.
    ///
    /// ```
    /// # use tasklight::{CpuPinningPolicy, ThreadCount, ThreadPoolBuilder};
    /// let pool = ThreadPoolBuilder {
    ///     num_threads: ThreadCount::AvailableParallelism,
    ///     cpu_pinning: CpuPinningPolicy::No,
    /// }
    /// .build()
    /// .expect("failed to spawn the thread pool");
    ///
    /// let handle = pool.dispatch(|| 21 * 2).unwrap();
    /// assert_eq!(handle.get(), Ok(42));
    /// ```
    pub fn build(&self) -> Result<ThreadPool, PoolBuildError> {
        ThreadPool::new(self)
    }
}

/// A pool of worker threads executing dispatched tasks.
///
/// Tasks are claimed by idle workers in FIFO dispatch order. Dropping the
/// pool stops intake and waits for every task dispatched so far to finish,
/// whether or not its [`TaskHandle`] was ever read.
pub struct ThreadPool {
    /// Queue shared with the worker threads.
    queue: Arc<TaskQueue>,
    /// Handles to all the worker threads in the pool.
    threads: Vec<WorkerThreadHandle>,
}

/// Handle to a worker thread in a thread pool.
struct WorkerThreadHandle {
    /// Thread handle object.
    handle: JoinHandle<()>,
}

impl ThreadPool {
    /// Creates a new thread pool using the given parameters.
    fn new(builder: &ThreadPoolBuilder) -> Result<Self, PoolBuildError> {
        let num_threads: usize = builder.num_threads.resolve().into();
        let cpu_pinning = builder.cpu_pinning;
        let queue = Arc::new(TaskQueue::new());

        #[cfg(any(
            miri,
            not(any(
                target_os = "android",
                target_os = "dragonfly",
                target_os = "freebsd",
                target_os = "linux"
            ))
        ))]
        match cpu_pinning {
            CpuPinningPolicy::No => (),
            CpuPinningPolicy::IfSupported => {
                log_warn!("Pinning threads to CPUs is not implemented on this platform.")
            }
            CpuPinningPolicy::Always => {
                panic!("Pinning threads to CPUs is not implemented on this platform.")
            }
        }

        let mut threads = Vec::with_capacity(num_threads);
        for id in 0..num_threads {
            let context = ThreadContext {
                #[cfg(feature = "log")]
                id,
                queue: queue.clone(),
            };
            let spawn_result = std::thread::Builder::new()
                .name(format!("tasklight-{id}"))
                .spawn(move || {
                    #[cfg(all(
                        not(miri),
                        any(
                            target_os = "android",
                            target_os = "dragonfly",
                            target_os = "freebsd",
                            target_os = "linux"
                        )
                    ))]
                    pin_worker_thread(id, cpu_pinning);
                    context.run()
                });
            match spawn_result {
                Ok(handle) => threads.push(WorkerThreadHandle { handle }),
                Err(e) => {
                    log_error!("[pool] Spawning worker thread #{id} failed: {e}");
                    // The pool cannot honor its guarantees with fewer threads
                    // than requested. Wind down the workers that did start
                    // before reporting the failure.
                    queue.signal_stop();
                    for t in threads.drain(..) {
                        let _ = t.handle.join();
                    }
                    return Err(PoolBuildError::from(e));
                }
            }
        }
        log_debug!("[pool] Spawned {num_threads} worker threads");

        Ok(Self { queue, threads })
    }

    /// Returns the number of worker threads spawned in this pool, fixed for
    /// the pool's lifetime.
    pub fn thread_count(&self) -> NonZeroUsize {
        self.threads.len().try_into().unwrap()
    }

    /// Returns a snapshot of the number of tasks waiting in the queue, not
    /// counting tasks that a worker has already claimed.
    ///
    /// The snapshot is racy: concurrent dispatches and dequeues may have
    /// changed the count by the time it is read.
    pub fn queue_size(&self) -> usize {
        self.queue.len()
    }

    /// Dispatches a task to the pool, waking one idle worker.
    ///
    /// Returns a handle resolving to the task's return value, or to the
    /// panic that ended it. Fails with [`PoolStoppedError`] if
    /// [`stop()`](Self::stop) was already called; a rejected task is never
    /// enqueued and the error is never delivered through a handle.
    ///
    /// Dispatching is safe from arbitrarily many threads at once, including
    /// from inside a running task of the same pool.
    ///
    /// ```
    /// # use tasklight::{CpuPinningPolicy, ThreadCount, ThreadPoolBuilder};
    /// # let pool = ThreadPoolBuilder {
    /// #     num_threads: ThreadCount::try_from(2).unwrap(),
    /// #     cpu_pinning: CpuPinningPolicy::No,
    /// # }
    /// # .build()
    /// # .unwrap();
    /// let handles = (0..10u64)
    ///     .map(|i| pool.dispatch(move || i * i).unwrap())
    ///     .collect::<Vec<_>>();
    ///
    /// let sum = handles.iter().map(|handle| handle.get().unwrap()).sum::<u64>();
    /// assert_eq!(sum, 285);
    /// ```
    pub fn dispatch<T, F>(&self, f: F) -> Result<TaskHandle<T>, PoolStoppedError>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let (writer, handle) = outcome_channel();
        self.queue.push(Box::new(move || {
            let result = catch_unwind(AssertUnwindSafe(f)).map_err(TaskPanic::from_payload);
            writer.fulfill(result);
        }))?;
        Ok(handle)
    }

    /// Stops intake: every subsequent [`dispatch()`](Self::dispatch) fails
    /// with [`PoolStoppedError`]. Tasks already dispatched are unaffected and
    /// still run to completion.
    ///
    /// Calling this is optional and only useful for draining a pool early:
    /// dropping the pool stops it as well.
    pub fn stop(&self) {
        log_debug!("[pool] Stop requested");
        self.queue.signal_stop();
    }
}

impl Drop for ThreadPool {
    /// Stops the pool and joins all worker threads. Workers only terminate
    /// once the queue is drained, so every task dispatched before the stop
    /// has finished when this returns.
    #[allow(clippy::unused_enumerate_index)]
    fn drop(&mut self) {
        self.queue.signal_stop();

        log_debug!("[pool] Joining worker threads...");
        for (_i, t) in self.threads.drain(..).enumerate() {
            let result = t.handle.join();
            match result {
                Ok(_) => log_debug!("[pool] Worker thread #{_i} joined"),
                Err(_) => log_error!("[pool] Worker thread #{_i} panicked"),
            }
        }
        log_debug!("[pool] Joined worker threads.");
    }
}

/// Pins the calling worker thread to the CPU of the same index.
#[cfg(all(
    not(miri),
    any(
        target_os = "android",
        target_os = "dragonfly",
        target_os = "freebsd",
        target_os = "linux"
    )
))]
fn pin_worker_thread(id: usize, cpu_pinning: CpuPinningPolicy) {
    match cpu_pinning {
        CpuPinningPolicy::No => (),
        CpuPinningPolicy::IfSupported => {
            let mut cpu_set = CpuSet::new();
            if let Err(_e) = cpu_set.set(id) {
                log_warn!("Failed to set CPU affinity for thread #{id}: {_e}");
            } else if let Err(_e) = sched_setaffinity(Pid::from_raw(0), &cpu_set) {
                log_warn!("Failed to set CPU affinity for thread #{id}: {_e}");
            } else {
                log_debug!("Pinned thread #{id} to CPU #{id}");
            }
        }
        CpuPinningPolicy::Always => {
            let mut cpu_set = CpuSet::new();
            if let Err(e) = cpu_set.set(id) {
                panic!("Failed to set CPU affinity for thread #{id}: {e}");
            } else if let Err(e) = sched_setaffinity(Pid::from_raw(0), &cpu_set) {
                panic!("Failed to set CPU affinity for thread #{id}: {e}");
            } else {
                log_debug!("Pinned thread #{id} to CPU #{id}");
            }
        }
    }
}

/// Context object owned by a worker thread.
struct ThreadContext {
    /// Thread index.
    #[cfg(feature = "log")]
    id: usize,
    /// Queue shared with the pool and the other workers.
    queue: Arc<TaskQueue>,
}

impl ThreadContext {
    /// Fetch-execute loop run by this thread.
    ///
    /// Tasks run outside of the queue lock, so that other workers can dequeue
    /// concurrently and a task dispatching into the same pool cannot
    /// deadlock. A task's panic is captured into its outcome cell and never
    /// unwinds out of this loop.
    fn run(&self) {
        loop {
            log_debug!("[worker {}] Waiting for a task", self.id);
            match self.queue.pop_blocking() {
                Some(task) => {
                    log_debug!("[worker {}] Executing a task", self.id);
                    task();
                }
                None => {
                    log_debug!("[worker {}] Queue stopped and drained, exiting", self.id);
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::core::status::Status;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    fn pool_with(num_threads: usize) -> ThreadPool {
        ThreadPoolBuilder {
            num_threads: ThreadCount::try_from(num_threads).unwrap(),
            cpu_pinning: CpuPinningPolicy::No,
        }
        .build()
        .unwrap()
    }

    #[test]
    fn test_thread_count_try_from_usize() {
        assert!(ThreadCount::try_from(0).is_err());
        assert_eq!(
            ThreadCount::try_from(1),
            Ok(ThreadCount::Count(NonZeroUsize::try_from(1).unwrap()))
        );
    }

    #[test]
    fn test_thread_count_is_fixed() {
        let pool = pool_with(3);
        assert_eq!(pool.thread_count(), NonZeroUsize::try_from(3).unwrap());
        pool.dispatch(|| ()).unwrap();
        assert_eq!(pool.thread_count(), NonZeroUsize::try_from(3).unwrap());
    }

    #[test]
    fn test_available_parallelism_thread_count() {
        let pool = ThreadPoolBuilder {
            num_threads: ThreadCount::AvailableParallelism,
            cpu_pinning: CpuPinningPolicy::No,
        }
        .build()
        .unwrap();

        let expected = std::thread::available_parallelism().map_or(1, usize::from);
        assert_eq!(usize::from(pool.thread_count()), expected);
    }

    #[test]
    fn test_dispatch_returns_results() {
        let pool = pool_with(4);

        let handles = (0..=1000u64)
            .map(|i| pool.dispatch(move || i).unwrap())
            .collect::<Vec<_>>();

        let sum = handles
            .iter()
            .map(|handle| handle.get().unwrap())
            .sum::<u64>();
        assert_eq!(sum, 500 * 1001);
    }

    #[test]
    fn test_unit_tasks_complete() {
        let pool = pool_with(3);
        let done = Arc::new(AtomicUsize::new(0));

        let handles = (0..5)
            .map(|_| {
                let done = done.clone();
                pool.dispatch(move || {
                    done.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap()
            })
            .collect::<Vec<_>>();

        for handle in &handles {
            assert_eq!(handle.get(), Ok(()));
        }
        assert_eq!(done.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn test_two_workers_hold_the_backlog() {
        let pool = pool_with(2);
        let started = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new(Status::new(false));

        let handles = (0..6usize)
            .map(|i| {
                let started = started.clone();
                let gate = gate.clone();
                pool.dispatch(move || {
                    started.fetch_add(1, Ordering::SeqCst);
                    drop(gate.wait_while(|open| !*open));
                    i * i
                })
                .unwrap()
            })
            .collect::<Vec<_>>();

        let deadline = Instant::now() + Duration::from_secs(5);
        while started.load(Ordering::SeqCst) < 2 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }

        // Both workers are parked on the gate and nothing else can claim a
        // task, so exactly 4 of the 6 tasks remain queued.
        assert_eq!(started.load(Ordering::SeqCst), 2);
        assert_eq!(pool.queue_size(), 4);

        *gate.lock() = true;
        gate.notify_all();

        let sum = handles
            .iter()
            .map(|handle| handle.get().unwrap())
            .sum::<usize>();
        assert_eq!(sum, 55);
        assert_eq!(started.load(Ordering::SeqCst), 6);
        assert_eq!(pool.queue_size(), 0);
    }

    #[test]
    fn test_dispatch_after_stop_fails() {
        let pool = pool_with(2);
        pool.stop();

        assert_eq!(pool.dispatch(|| 1).unwrap_err(), PoolStoppedError);
        assert_eq!(pool.queue_size(), 0);
    }

    #[test]
    fn test_pools_do_not_share_state() {
        let pool1 = pool_with(1);
        let pool2 = pool_with(1);

        pool1.stop();
        assert!(pool1.dispatch(|| 1).is_err());
        assert_eq!(pool2.dispatch(|| 2).unwrap().get(), Ok(2));
    }

    #[test]
    fn test_stop_does_not_drop_queued_tasks() {
        let pool = pool_with(1);
        let gate = Arc::new(Status::new(false));

        let handles = (0..4u64)
            .map(|i| {
                let gate = gate.clone();
                pool.dispatch(move || {
                    drop(gate.wait_while(|open| !*open));
                    i
                })
                .unwrap()
            })
            .collect::<Vec<_>>();

        pool.stop();
        assert!(pool.dispatch(|| 0u64).is_err());

        *gate.lock() = true;
        gate.notify_all();

        for (i, handle) in handles.iter().enumerate() {
            assert_eq!(handle.get(), Ok(i as u64));
        }
    }

    #[test]
    fn test_panicking_task_resolves_to_its_panic() {
        let pool = pool_with(2);

        let failing = pool.dispatch(|| -> u64 { panic!("boom") }).unwrap();
        let sibling = pool.dispatch(|| 7u64).unwrap();

        assert_eq!(failing.get().unwrap_err().message(), "boom");
        assert_eq!(sibling.get(), Ok(7));

        // The worker that caught the panic keeps serving tasks.
        let next = pool.dispatch(|| 8u64).unwrap();
        assert_eq!(next.get(), Ok(8));
    }

    #[test]
    fn test_failed_handle_reads_are_idempotent() {
        let pool = pool_with(1);

        let handle = pool.dispatch(|| -> u64 { panic!("twice") }).unwrap();
        let first = handle.get();
        let second = handle.get();

        assert_eq!(first, second);
        assert_eq!(first.unwrap_err().message(), "twice");
    }

    #[test]
    fn test_drop_waits_for_dispatched_tasks() {
        let finished = Arc::new(AtomicUsize::new(0));

        {
            let pool = pool_with(2);
            for _ in 0..4 {
                let finished = finished.clone();
                pool.dispatch(move || {
                    std::thread::sleep(Duration::from_millis(30));
                    finished.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
            }
        }

        assert_eq!(finished.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_drop_waits_for_failed_tasks() {
        let started = Arc::new(AtomicUsize::new(0));

        {
            let pool = pool_with(1);
            let started = started.clone();
            pool.dispatch(move || {
                started.fetch_add(1, Ordering::SeqCst);
                panic!("unread failure");
            })
            .unwrap();
        }

        assert_eq!(started.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_dispatch_from_many_threads() {
        let pool = Arc::new(pool_with(4));

        let dispatchers = (0..4u64)
            .map(|t| {
                std::thread::spawn({
                    let pool = pool.clone();
                    move || {
                        (0..100u64)
                            .map(|i| pool.dispatch(move || t * 100 + i).unwrap())
                            .collect::<Vec<_>>()
                    }
                })
            })
            .collect::<Vec<_>>();

        let mut sum = 0;
        for dispatcher in dispatchers {
            for handle in dispatcher.join().unwrap() {
                sum += handle.get().unwrap();
            }
        }
        // Sum of t * 100 + i over t in 0..4 and i in 0..100.
        assert_eq!(sum, 600 * 100 + 4 * 4950);
    }

    #[test]
    fn test_dispatch_from_inside_a_task() {
        let pool = Arc::new(pool_with(2));

        let inner_pool = pool.clone();
        let outer = pool
            .dispatch(move || inner_pool.dispatch(|| 21u64 * 2).unwrap().get().unwrap())
            .unwrap();

        assert_eq!(outer.get(), Ok(42));
    }
}
