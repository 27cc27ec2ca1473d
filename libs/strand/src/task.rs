// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

mod builder;
mod id;

use crate::error::{SpawnError, SwapError};
use crate::scheduler::Core;
use core::any::Any;
use core::cell::Cell;
use core::convert::Infallible;
use core::fmt;
use core::ptr::NonNull;
use std::alloc::{self, Layout};
use std::panic::{self, AssertUnwindSafe};
use std::process;
use strand_context::{Context, TaskStack};

pub use builder::TaskBuilder;
pub use id::Id;

/// Lifecycle state of a task.
///
/// ```text
///            yield_now
///   Ready <------------- Running
///     |                     ^ |
///     +---------------------+ | exit / body returned
///       picked by run()       v
///                          Exited --> Released
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Waiting in the ready queue.
    Ready,
    /// Currently executing on its own stack.
    Running,
    /// Finished, waiting for the scheduler to free its stack.
    Exited,
    /// Stack and control block are being freed. No reference to the task survives this state.
    Released,
}

type Work = Box<dyn FnOnce(&Task)>;
type PanicPayload = Box<dyn Any + Send>;

/// Unwind payload used to tear down a task stack. Caught by `trampoline` and never rethrown.
struct ExitUnwind;

/// A unit of work running on its own stack.
///
/// Tasks are only ever observed from the inside: the scheduler hands the task body a `&Task` through
/// which it can [yield](Task::yield_now), [exit](Task::exit) or spawn further tasks. The scheduler
/// owns the task's memory and frees it once the task has exited and control has left its stack.
pub struct Task {
    id: Id,
    name: Option<String>,
    status: Cell<Status>,
    /// Saved execution state, empty while the task is running.
    context: Context,
    /// The stack `context` points into. Exclusively owned by this task and never resized.
    stack: TaskStack,
    /// The task body. Taken exactly once, by `trampoline` on the first switch into the task.
    work: Cell<Option<Work>>,
    /// Payload of a panic that escaped the task body, rethrown by the scheduler.
    panic: Cell<Option<PanicPayload>>,
    /// Set when the scheduler shuts down. The next time the task is resumed it unwinds instead.
    cancelled: Cell<bool>,
    /// Set once the cancellation unwind has started. Destructors may still yield after this.
    unwinding: Cell<bool>,
    /// The scheduler this task belongs to. Outlives the task since the scheduler releases all of
    /// its tasks before it goes away.
    owner: NonNull<Core>,
    span: tracing::Span,
}

/// A type-erased pointer to a heap allocated [`Task`].
///
/// `TaskRef`s are plain pointers, copying one does not keep the task alive. The scheduler is the
/// only party that ever frees a task, through [`TaskRef::release`].
#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) struct TaskRef(NonNull<Task>);

// === impl Task ===

impl Task {
    /// Returns this task's unique ID.
    pub fn id(&self) -> Id {
        self.id
    }

    /// Returns the name given to this task through [`TaskBuilder::name`], if any.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Returns the current lifecycle state.
    ///
    /// Since tasks only observe themselves while running, this mostly exists for debugging.
    pub fn status(&self) -> Status {
        self.status.get()
    }

    /// Suspends this task, moving it to the back of the ready queue.
    ///
    /// Returns once the scheduler picks this task again, after every task that was ready before it
    /// had its turn. If the scheduler is shut down in the meantime, the call unwinds the task
    /// stack instead of returning, the same way [`Task::exit`] does.
    ///
    /// # Errors
    ///
    /// Returns [`SwapError`] if control could not be transferred back to the scheduler. The task
    /// is taken out of the ready queue again and keeps running. This indicates a corrupted
    /// scheduler and there is generally no sensible way to continue.
    ///
    /// # Panics
    ///
    /// Panics if called on a task other than the one currently running.
    pub fn yield_now(&self) -> Result<(), SwapError> {
        self.assert_current("yield_now");
        let core = self.core();

        self.status.set(Status::Ready);
        core.enqueue(TaskRef::from_task(self));
        tracing::trace!("yielding");

        // Safety: the home context was saved by the scheduler, which is blocked in the matching
        // swap until we switch back.
        if let Err(err) = unsafe { strand_context::swap(&self.context, core.home()) } {
            core.dequeue_last(TaskRef::from_task(self));
            self.status.set(Status::Running);
            return Err(err);
        }

        debug_assert_eq!(self.status(), Status::Running);
        if self.cancelled.get() && !self.unwinding.replace(true) {
            tracing::trace!("unwinding cancelled task");
            panic::resume_unwind(Box::new(ExitUnwind));
        }
        Ok(())
    }

    /// Terminates this task.
    ///
    /// The task stack is unwound up to the task entry, so the body's captures and every value on
    /// the stack are dropped just as if the body had returned. Control then goes back to the
    /// scheduler, which frees the task stack and control block. This function never returns
    /// successfully.
    ///
    /// The unwind does not invoke the panic hook, but a `catch_unwind` in the task body will
    /// intercept it like any other unwind and must let it continue. Calling this from a destructor
    /// that runs during an unwind aborts the process. When panics abort, the stack can't be unwound
    /// and values living on it at the time of the call are leaked.
    ///
    /// # Errors
    ///
    /// Returns [`SwapError`] if control could not be transferred back to the scheduler, in which
    /// case nothing was unwound and the task keeps running.
    ///
    /// # Panics
    ///
    /// Panics if called on a task other than the one currently running.
    pub fn exit(&self) -> Result<Infallible, SwapError> {
        self.assert_current("exit");

        if !self.core().home().is_suspended() {
            return Err(SwapError::NotSuspended);
        }
        tracing::trace!("exiting");

        if cfg!(panic = "unwind") {
            panic::resume_unwind(Box::new(ExitUnwind));
        }
        self.finish()
    }

    /// Marks the task as exited and switches to the scheduler for the last time.
    fn finish(&self) -> ! {
        self.status.set(Status::Exited);

        // Safety: see `yield_now`
        if let Err(err) = unsafe { strand_context::swap(&self.context, self.core().home()) } {
            tracing::error!(task.tid = self.id.as_u64(), "failed to exit task: {err}");
            process::abort();
        }

        // The scheduler frees exited tasks without ever switching back into them.
        tracing::error!(task.tid = self.id.as_u64(), "exited task was resumed");
        process::abort()
    }

    /// Returns a [`TaskBuilder`] for spawning a new task onto this task's scheduler.
    #[must_use]
    pub fn build_task(&self) -> TaskBuilder<'_> {
        TaskBuilder::new(self.core())
    }

    /// Spawns a new task onto this task's scheduler using the default stack size.
    ///
    /// The new task is appended to the ready queue and first runs after every task already in it.
    ///
    /// # Errors
    ///
    /// See [`TaskBuilder::spawn`].
    #[track_caller]
    pub fn spawn<F>(&self, work: F) -> Result<Id, SpawnError>
    where
        F: FnOnce(&Task) + 'static,
    {
        self.build_task().spawn(work)
    }

    pub(crate) fn new(id: Id, name: Option<String>, stack: TaskStack, work: Work, owner: &Core) -> Self {
        let span = tracing::trace_span!(
            "task",
            task.tid = id.as_u64(),
            task.name = ?name,
        );

        Self {
            id,
            name,
            status: Cell::new(Status::Ready),
            context: Context::empty(),
            stack,
            work: Cell::new(Some(work)),
            panic: Cell::new(None),
            cancelled: Cell::new(false),
            unwinding: Cell::new(false),
            owner: NonNull::from(owner),
            span,
        }
    }

    pub(crate) fn context(&self) -> &Context {
        &self.context
    }

    pub(crate) fn stack(&self) -> &TaskStack {
        &self.stack
    }

    pub(crate) fn span(&self) -> &tracing::Span {
        &self.span
    }

    pub(crate) fn set_status(&self, status: Status) {
        self.status.set(status);
    }

    pub(crate) fn take_panic(&self) -> Option<PanicPayload> {
        self.panic.take()
    }

    /// Makes the task unwind its stack (or drop its body if it never started) the next time it is
    /// switched into.
    pub(crate) fn cancel(&self) {
        self.cancelled.set(true);
    }

    fn core(&self) -> &Core {
        // Safety: the scheduler core outlives all of its tasks
        unsafe { self.owner.as_ref() }
    }

    #[track_caller]
    fn assert_current(&self, op: &str) {
        assert_eq!(
            self.core().current(),
            Some(TaskRef::from_task(self)),
            "Task::{op} must be called by the running task itself"
        );
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("status", &self.status.get())
            .field("context", &self.context)
            .field("stack", &self.stack)
            .finish_non_exhaustive()
    }
}

/// First (and only) Rust frame on every task stack.
///
/// Runs the task body and exits the task afterwards, so that falling off the end of the body has a
/// well-defined outcome. Unwinding must not cross this frame since there is nothing above it to
/// unwind into. An unwind started by [`Task::exit`] or by cancellation ends here, a panic escaping
/// the body is stashed on the task for the scheduler to rethrow.
pub(crate) unsafe extern "C" fn trampoline(arg: *mut ()) -> ! {
    // Safety: `arg` is the task pointer set up in `TaskBuilder::spawn`, the task is not released
    // before it exits.
    let task = unsafe { &*arg.cast::<Task>() };

    if let Some(work) = task.work.take() {
        let res = panic::catch_unwind(AssertUnwindSafe(|| {
            if task.cancelled.get() {
                // cancelled before it ever ran
                drop(work);
            } else {
                work(task);
            }
        }));

        match res {
            Ok(()) => {}
            Err(payload) if payload.is::<ExitUnwind>() => tracing::trace!("task stack unwound"),
            Err(payload) => {
                tracing::debug!("task panicked");
                task.panic.set(Some(payload));
            }
        }
    }

    task.finish()
}

// === impl TaskRef ===

impl TaskRef {
    /// Moves `task` into a fresh heap allocation.
    ///
    /// Unlike `Box::new` this reports allocation failure instead of aborting.
    pub(crate) fn try_new(task: Task) -> Result<Self, SpawnError> {
        let layout = Layout::new::<Task>();
        // Safety: `Task` is not zero-sized
        let ptr = unsafe { alloc::alloc(layout) }.cast::<Task>();
        let Some(ptr) = NonNull::new(ptr) else {
            // dropping `task` unmaps its stack again
            return Err(SpawnError::AllocationFailed);
        };
        // Safety: freshly allocated with the layout of `Task`
        unsafe { ptr.write(task) };
        Ok(Self(ptr))
    }

    pub(crate) fn from_task(task: &Task) -> Self {
        Self(NonNull::from(task))
    }

    pub(crate) fn as_ptr(self) -> *mut Task {
        self.0.as_ptr()
    }

    /// # Safety
    ///
    /// The task must not have been released yet.
    pub(crate) unsafe fn as_ref<'a>(self) -> &'a Task {
        // Safety: ensured by caller
        unsafe { self.0.as_ref() }
    }

    /// Frees the task control block and its stack.
    ///
    /// # Safety
    ///
    /// Control must not be inside the task, no other `TaskRef` to it may be used afterwards and the
    /// task must not have been released before.
    pub(crate) unsafe fn release(self) {
        // Safety: ensured by caller
        let task = unsafe { self.as_ref() };
        task.set_status(Status::Released);
        tracing::debug!(task.tid = task.id.as_u64(), task.name = ?task.name, "releasing task");
        // The stack is about to be unmapped, whatever state was saved on it is gone for good.
        task.context.clear();

        // Safety: allocated in `try_new` through the global allocator with the layout of `Task`,
        // which is exactly what `Box` expects.
        drop(unsafe { Box::from_raw(self.0.as_ptr()) });
    }
}

impl fmt::Debug for TaskRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("TaskRef").field(&self.0).finish()
    }
}
