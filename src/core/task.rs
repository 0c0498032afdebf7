// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Tasks, their outcomes, and the handles that carry outcomes back to
//! callers.

use super::status::Status;
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// A unit of work stored in the queue, type-erased so that tasks with
/// different return types share one queue. The closure fulfills its outcome
/// cell when run, so it is consumed by exactly one execution.
pub(crate) type Task = Box<dyn FnOnce() + Send + 'static>;

/// The resolved outcome of a task: its return value, or the panic that ended
/// it.
pub type TaskResult<T> = Result<T, TaskPanic>;

/// A panic captured while a task was executing.
///
/// The message of `&str` and [`String`] panic payloads is preserved verbatim.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("task panicked: {message}")]
pub struct TaskPanic {
    message: String,
}

impl TaskPanic {
    /// Converts the payload caught by [`std::panic::catch_unwind()`].
    pub(crate) fn from_payload(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(message) = payload.downcast_ref::<&'static str>() {
            (*message).to_owned()
        } else if let Some(message) = payload.downcast_ref::<String>() {
            message.clone()
        } else {
            "opaque panic payload".to_owned()
        };
        Self { message }
    }

    /// Returns the message carried by the panic payload.
    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Creates the two endpoints of a task's result channel: the writer given to
/// the task, and the handle given to the caller.
pub(crate) fn outcome_channel<T>() -> (OutcomeWriter<T>, TaskHandle<T>) {
    let cell = Arc::new(OutcomeCell {
        slot: Status::new(None),
    });
    let writer = OutcomeWriter { cell: cell.clone() };
    (writer, TaskHandle { cell })
}

/// Single-assignment slot shared between one writer and any number of
/// readers.
struct OutcomeCell<T> {
    slot: Status<Option<TaskResult<T>>>,
}

/// Write endpoint of a result channel.
///
/// Fulfillment consumes the writer, so the slot is written at most once.
pub(crate) struct OutcomeWriter<T> {
    cell: Arc<OutcomeCell<T>>,
}

impl<T> OutcomeWriter<T> {
    /// Stores the outcome and wakes every reader blocked on the paired
    /// handle.
    pub(crate) fn fulfill(self, result: TaskResult<T>) {
        let mut slot = self.cell.slot.lock();
        debug_assert!(slot.is_none());
        *slot = Some(result);
        drop(slot);
        self.cell.slot.notify_all();
    }
}

/// The caller-facing view of a dispatched task's eventual outcome.
///
/// A handle can be cloned; all clones read the same outcome. Dropping every
/// handle abandons the result but does not stop the task from running.
pub struct TaskHandle<T> {
    cell: Arc<OutcomeCell<T>>,
}

impl<T> Clone for TaskHandle<T> {
    fn clone(&self) -> Self {
        Self {
            cell: self.cell.clone(),
        }
    }
}

impl<T> fmt::Debug for TaskHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("resolved", &self.is_resolved())
            .finish()
    }
}

impl<T> TaskHandle<T> {
    /// Blocks the calling thread until the task has resolved.
    pub fn wait(&self) {
        drop(self.cell.slot.wait_while(|slot| slot.is_none()));
    }

    /// Returns whether the task has resolved, without blocking.
    pub fn is_resolved(&self) -> bool {
        self.cell.slot.lock().is_some()
    }
}

impl<T: Clone> TaskHandle<T> {
    /// Blocks the calling thread until the task has resolved, then returns
    /// its outcome.
    ///
    /// Repeated calls are idempotent: once resolved they return the same
    /// outcome again without blocking.
    pub fn get(&self) -> TaskResult<T> {
        let slot = self.cell.slot.wait_while(|slot| slot.is_none());
        slot.as_ref().unwrap().clone()
    }
}
