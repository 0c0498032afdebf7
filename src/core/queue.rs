// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The FIFO of pending tasks shared between the pool and its workers.

use super::status::Status;
use super::task::Task;
use crossbeam_utils::CachePadded;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use thiserror::Error;

/// Error returned when dispatching a task to a pool that has been stopped.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("the thread pool has been stopped")]
pub struct PoolStoppedError;

/// Queue contents and the stop flag, guarded together by one mutex.
struct QueueState {
    tasks: VecDeque<Task>,
    stop: bool,
}

/// A FIFO of pending tasks plus a stop flag.
///
/// Pushing and popping hold the lock only for the queue operation itself;
/// tasks always execute outside of it.
pub(crate) struct TaskQueue {
    state: Status<QueueState>,
    /// Number of queued (not yet dequeued) tasks, kept outside the mutex so
    /// that diagnostic reads don't contend with the workers.
    pending: CachePadded<AtomicUsize>,
}

impl TaskQueue {
    /// Creates an empty queue accepting tasks.
    pub(crate) fn new() -> Self {
        Self {
            state: Status::new(QueueState {
                tasks: VecDeque::new(),
                stop: false,
            }),
            pending: CachePadded::new(AtomicUsize::new(0)),
        }
    }

    /// Appends a task at the tail of the queue and wakes one idle worker.
    ///
    /// Fails without mutating the queue if [`signal_stop()`](Self::signal_stop)
    /// was already called.
    pub(crate) fn push(&self, task: Task) -> Result<(), PoolStoppedError> {
        let mut state = self.state.lock();
        if state.stop {
            return Err(PoolStoppedError);
        }
        state.tasks.push_back(task);
        self.pending.fetch_add(1, Ordering::Relaxed);
        drop(state);
        self.state.notify_one();
        Ok(())
    }

    /// Blocks until a task is available and returns it, in FIFO submission
    /// order.
    ///
    /// Returns [`None`] once the stop flag is set and no tasks remain, which
    /// is the signal for the calling worker to terminate.
    pub(crate) fn pop_blocking(&self) -> Option<Task> {
        let mut state = self
            .state
            .wait_while(|state| !state.stop && state.tasks.is_empty());
        let task = state.tasks.pop_front()?;
        self.pending.fetch_sub(1, Ordering::Relaxed);
        Some(task)
    }

    /// Returns a snapshot of the number of queued tasks. Racy with respect to
    /// concurrent pushes and pops.
    pub(crate) fn len(&self) -> usize {
        self.pending.load(Ordering::Relaxed)
    }

    /// Sets the stop flag and wakes all blocked workers, so that each of them
    /// can observe termination promptly. Idempotent.
    pub(crate) fn signal_stop(&self) {
        let mut state = self.state.lock();
        state.stop = true;
        drop(state);
        self.state.notify_all();
    }
}
