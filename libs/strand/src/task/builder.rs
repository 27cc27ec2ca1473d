// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::error::SpawnError;
use crate::scheduler::Core;
use crate::task::id::Id;
use crate::task::{Task, TaskRef, trampoline};
use core::panic::Location;
use strand_context::TaskStack;

/// Configures a task before it is spawned.
///
/// Obtained from [`Scheduler::build_task`](crate::Scheduler::build_task) or, from inside a running
/// task, [`Task::build_task`].
pub struct TaskBuilder<'a> {
    core: &'a Core,
    name: Option<&'a str>,
    stack_size: usize,
}

impl<'a> TaskBuilder<'a> {
    pub(crate) fn new(core: &'a Core) -> Self {
        Self {
            core,
            name: None,
            stack_size: core.config().default_stack_size,
        }
    }

    /// Override the name of tasks spawned by this builder.
    ///
    /// By default, tasks are unnamed.
    #[must_use]
    pub fn name(mut self, name: &'a str) -> Self {
        self.name = Some(name);
        self
    }

    /// Override the stack size of tasks spawned by this builder.
    ///
    /// By default, tasks use [`Config::default_stack_size`](crate::Config::default_stack_size).
    #[must_use]
    pub fn stack_size(mut self, stack_size: usize) -> Self {
        self.stack_size = stack_size;
        self
    }

    /// Creates a task running `work` and appends it to the ready queue.
    ///
    /// `work` receives a reference to its own task, through which it can yield or exit. If `work`
    /// returns, the task exits.
    ///
    /// # Errors
    ///
    /// Returns [`SpawnError::AllocationFailed`] if the stack or the control block could not be
    /// allocated and [`SpawnError::ContextInitFailed`] if the stack could not be prepared for the
    /// first switch. Nothing is enqueued in either case.
    ///
    /// # Panics
    ///
    /// Panics if the stack size is zero.
    #[track_caller]
    pub fn spawn<F>(&self, work: F) -> Result<Id, SpawnError>
    where
        F: FnOnce(&Task) + 'static,
    {
        assert!(self.stack_size > 0, "task stack size must be non-zero");

        let id = Id::next();
        let loc = Location::caller();

        let stack = TaskStack::new(self.stack_size).inspect_err(|err| {
            tracing::debug!(task.tid = id.as_u64(), "failed to map task stack: {err}");
        })?;

        let task = Task::new(
            id,
            self.name.map(ToOwned::to_owned),
            stack,
            Box::new(work),
            self.core,
        );
        let task = TaskRef::try_new(task)?;

        // Safety: the task was just allocated and is not shared with anyone yet
        let t = unsafe { task.as_ref() };
        // Safety: the stack is owned by the task and outlives its context. The trampoline receives
        // a pointer to the task which stays valid until the task is released.
        let res = unsafe {
            strand_context::init_context(t.context(), t.stack(), trampoline, task.as_ptr().cast())
        };
        if let Err(err) = res {
            tracing::debug!(task.tid = id.as_u64(), "failed to initialize task context: {err}");
            // Safety: the task was never enqueued nor switched into
            unsafe { task.release() };
            return Err(err.into());
        }

        tracing::debug!(
            task.tid = id.as_u64(),
            task.name = ?self.name,
            stack_size = self.stack_size,
            loc.file = loc.file(),
            loc.line = loc.line(),
            "spawned task"
        );

        self.core.track(task);
        Ok(id)
    }
}
