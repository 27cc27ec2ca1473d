// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::config::Config;
use crate::error::SpawnError;
use crate::task::{Id, Status, Task, TaskBuilder, TaskRef};
use core::cell::{Cell, RefCell};
use core::fmt;
use core::marker::PhantomData;
use core::ptr::NonNull;
use std::collections::VecDeque;
use std::panic;
use std::process;
use std::thread;
use strand_context::Context;

/// A cooperative, single-threaded scheduler for stackful tasks.
///
/// Tasks are resumed in strict FIFO order: a task that yields goes to the back of the ready queue,
/// so tasks that all yield once per round are resumed round-robin in creation order.
///
/// The scheduler is bound to the thread that created it.
/// ```compile_fail
/// fn send<T: Send>() {}
/// send::<strand::Scheduler>();
/// ```
pub struct Scheduler {
    core: NonNull<Core>,
    _not_send: PhantomData<*mut ()>,
}

/// State shared between the scheduler and its tasks.
///
/// Tasks hold a raw back-reference to this, so it lives in its own heap allocation that doesn't
/// move when the [`Scheduler`] handle does.
pub(crate) struct Core {
    /// Saved state of `Scheduler::run` while a task is executing.
    home: Context,
    ready: RefCell<VecDeque<TaskRef>>,
    /// Number of tasks sitting in `ready`.
    count: Cell<usize>,
    /// Number of tasks spawned but not yet released.
    live: Cell<usize>,
    current: Cell<Option<TaskRef>>,
    running: Cell<bool>,
    config: Config,
}

/// Summary of a call to [`Scheduler::run`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RunStats {
    /// Number of times control was transferred into a task.
    pub switches: usize,
    /// Number of times a task handed control back by yielding.
    pub yields: usize,
    /// Number of tasks that exited and were released.
    pub exits: usize,
}

// === impl Scheduler ===

impl Scheduler {
    /// Creates a scheduler with the default [`Config`].
    #[must_use]
    pub fn open() -> Self {
        Self::new(Config::default())
    }

    /// Creates a scheduler with the given configuration.
    ///
    /// # Panics
    ///
    /// Panics if the configured default stack size is zero.
    #[must_use]
    pub fn new(config: Config) -> Self {
        assert!(config.default_stack_size > 0, "stack size must be non-zero");

        let core = Box::new(Core {
            home: Context::empty(),
            ready: RefCell::new(VecDeque::new()),
            count: Cell::new(0),
            live: Cell::new(0),
            current: Cell::new(None),
            running: Cell::new(false),
            config,
        });

        Self {
            core: NonNull::from(Box::leak(core)),
            _not_send: PhantomData,
        }
    }

    /// Returns the configuration this scheduler was created with.
    pub fn config(&self) -> &Config {
        self.core().config()
    }

    /// Returns a [`TaskBuilder`] for spawning a configured task.
    #[must_use]
    pub fn build_task(&self) -> TaskBuilder<'_> {
        TaskBuilder::new(self.core())
    }

    /// Spawns a task running `work` on a stack of the default size.
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

    /// Creates a task that calls `function(task, argument)` on a stack of `stack_size` bytes.
    ///
    /// # Errors
    ///
    /// See [`TaskBuilder::spawn`].
    ///
    /// # Panics
    ///
    /// Panics if `stack_size` is zero.
    #[track_caller]
    pub fn create<A>(
        &self,
        function: fn(&Task, A),
        argument: A,
        stack_size: usize,
    ) -> Result<Id, SpawnError>
    where
        A: 'static,
    {
        self.build_task()
            .stack_size(stack_size)
            .spawn(move |task| function(task, argument))
    }

    /// Runs tasks until the ready queue is empty.
    ///
    /// Blocks the calling thread until every task has exited. A task that never yields or exits
    /// keeps this function from ever returning.
    ///
    /// # Panics
    ///
    /// Panics if called from inside one of this scheduler's own tasks, and if control cannot be
    /// transferred into a task. If a task body panics, the task is released and the panic resumes
    /// from here. Tasks still in the ready queue at that point stay there until the next call to
    /// `run` or until the scheduler is shut down.
    pub fn run(&self) -> RunStats {
        let core = self.core();
        assert!(
            !core.running.replace(true),
            "Scheduler::run must not be called from inside a task"
        );
        let _running = RunningGuard(core);

        let mut stats = RunStats::default();

        while let Some(task) = core.pop() {
            stats.switches += 1;

            match core.resume(task) {
                // already re-enqueued by `Task::yield_now`
                Status::Ready => stats.yields += 1,
                Status::Exited => {
                    stats.exits += 1;
                    // Safety: the task has exited and control left its stack for good
                    let panic = unsafe { task.as_ref() }.take_panic();

                    // Safety: see above
                    unsafe { core.release(task) };

                    if let Some(payload) = panic {
                        panic::resume_unwind(payload);
                    }
                }
                status => unreachable!("task switched away while {status:?}"),
            }
        }

        tracing::debug!(?stats, "ready queue drained");
        stats
    }

    /// Releases every task still in the ready queue, then the scheduler itself.
    ///
    /// Tasks that were suspended mid-way are resumed one last time and unwound as if they had
    /// called [`Task::exit`], so the values on their stacks are dropped without running the rest
    /// of their body. Tasks that never ran just drop their body. Dropping the scheduler has the
    /// same effect.
    ///
    /// If the thread is already panicking, or panics abort, tasks are freed without unwinding and
    /// whatever lives on their stacks is leaked.
    pub fn shutdown(self) {
        tracing::debug!(remaining = self.count(), "shutting down scheduler");
    }

    /// Returns the number of tasks currently waiting in the ready queue.
    pub fn count(&self) -> usize {
        self.core().count.get()
    }

    /// Returns the number of tasks that have been spawned but not yet released.
    pub fn live(&self) -> usize {
        self.core().live.get()
    }

    /// Returns the IDs of all tasks in the ready queue, front to back.
    pub fn ready_tasks(&self) -> Vec<Id> {
        self.core().ready_tasks()
    }

    /// Returns the ID of the task that is currently running, if any.
    pub fn current(&self) -> Option<Id> {
        self.core().current_id()
    }

    fn core(&self) -> &Core {
        // Safety: the core is only freed when the scheduler is dropped
        unsafe { self.core.as_ref() }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::open()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        let core = self.core();

        if core.running.get() {
            // Freeing the core would pull the rug out from under the task we are executing on.
            tracing::error!("scheduler dropped from inside one of its own tasks");
            process::abort();
        }

        let unwind = cfg!(panic = "unwind") && !thread::panicking();
        let guard = unwind.then(|| {
            core.running.set(true);
            RunningGuard(core)
        });

        let mut released = 0_usize;
        while let Some(task) = core.pop() {
            if unwind {
                // Safety: tasks in the ready queue have not been released
                unsafe { task.as_ref() }.cancel();

                // Code running during the unwind may yield, in which case the task is back in
                // the queue and gets resumed again.
                if core.resume(task) == Status::Ready {
                    continue;
                }
                // Safety: exited tasks are only released below
                if unsafe { task.as_ref() }.take_panic().is_some() {
                    tracing::warn!("task panicked while being torn down");
                }
            }

            // Safety: control is not inside the task, either because it exited or because no
            // task is running
            unsafe { core.release(task) };
            released += 1;
        }

        let leaked = core.live.get();
        if leaked > 0 {
            tracing::warn!(leaked, "tasks outlived their scheduler");
        }
        tracing::debug!(released, "scheduler released");

        // the guard points into the core
        drop(guard);
        // Safety: allocated through `Box` in `new`, and nothing references it anymore
        drop(unsafe { Box::from_raw(self.core.as_ptr()) });
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let core = self.core();
        f.debug_struct("Scheduler")
            .field("ready", &core.ready_tasks())
            .field("live", &core.live.get())
            .field("current", &core.current_id())
            .field("running", &core.running.get())
            .field("config", &core.config)
            .finish()
    }
}

struct RunningGuard<'a>(&'a Core);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.current.set(None);
        self.0.running.set(false);
    }
}

// === impl Core ===

impl Core {
    pub(crate) fn config(&self) -> &Config {
        &self.config
    }

    pub(crate) fn home(&self) -> &Context {
        &self.home
    }

    pub(crate) fn current(&self) -> Option<TaskRef> {
        self.current.get()
    }

    /// Starts tracking a freshly spawned task and makes it ready.
    pub(crate) fn track(&self, task: TaskRef) {
        self.live.set(self.live.get() + 1);
        self.enqueue(task);
    }

    pub(crate) fn enqueue(&self, task: TaskRef) {
        self.ready.borrow_mut().push_back(task);
        self.count.set(self.count.get() + 1);
    }

    /// Undoes the most recent [`Core::enqueue`] of `task`.
    pub(crate) fn dequeue_last(&self, task: TaskRef) {
        let mut ready = self.ready.borrow_mut();
        if ready.back() == Some(&task) {
            ready.pop_back();
            self.count.set(self.count.get() - 1);
        }
    }

    /// Switches into `task` and returns its status once control is back.
    fn resume(&self, task: TaskRef) -> Status {
        // Safety: tasks handed to the scheduler have not been released
        let t = unsafe { task.as_ref() };
        debug_assert_eq!(t.status(), Status::Ready);

        t.set_status(Status::Running);
        self.current.set(Some(task));

        {
            let _enter = t.span().enter();
            tracing::trace!("switching into task");

            // Safety: the task stack is alive and its context was saved either by
            // `init_context` or by the task's last yield.
            if let Err(err) = unsafe { strand_context::swap(&self.home, t.context()) } {
                tracing::error!("failed to switch into task: {err}");
                panic!("failed to switch into task {}: {err}", t.id());
            }
        }

        self.current.set(None);
        t.status()
    }

    fn pop(&self) -> Option<TaskRef> {
        let task = self.ready.borrow_mut().pop_front()?;
        self.count.set(self.count.get() - 1);
        Some(task)
    }

    /// # Safety
    ///
    /// Same as [`TaskRef::release`], and the task must have been removed from the ready queue.
    unsafe fn release(&self, task: TaskRef) {
        self.live.set(self.live.get() - 1);
        // Safety: ensured by caller
        unsafe { task.release() };
    }

    fn ready_tasks(&self) -> Vec<Id> {
        self.ready
            .borrow()
            .iter()
            // Safety: tasks in the ready queue have not been released
            .map(|task| unsafe { task.as_ref() }.id())
            .collect()
    }

    fn current_id(&self) -> Option<Id> {
        // Safety: the current task is running and therefore not released
        self.current.get().map(|task| unsafe { task.as_ref() }.id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::panic::AssertUnwindSafe;
    use std::rc::Rc;
    use tracing_subscriber::EnvFilter;
    use tracing_subscriber::util::SubscriberInitExt;

    fn trace() -> tracing::subscriber::DefaultGuard {
        tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .set_default()
    }

    #[test]
    fn exit_without_yield() {
        let _trace = trace();
        let sched = Scheduler::open();
        let runs = Rc::new(Cell::new(0));

        let id = {
            let runs = runs.clone();
            sched
                .spawn(move |task| {
                    runs.set(runs.get() + 1);
                    task.exit().unwrap();
                })
                .unwrap()
        };

        assert_eq!(sched.ready_tasks(), [id]);
        assert_eq!(sched.count(), 1);

        let stats = sched.run();
        assert_eq!(runs.get(), 1);
        assert_eq!(
            stats,
            RunStats {
                switches: 1,
                yields: 0,
                exits: 1
            }
        );
        assert!(sched.ready_tasks().is_empty());
        assert_eq!(sched.count(), 0);
        assert_eq!(sched.live(), 0);
        // the body and its captures were dropped on the way out
        assert_eq!(Rc::strong_count(&runs), 1);
    }

    #[test]
    fn exit_drops_stack_values() {
        let _trace = trace();
        let sched = Scheduler::open();
        let captured = Rc::new(Cell::new(false));
        let local = Rc::new(Cell::new(false));

        {
            let captured = DropFlag(captured.clone());
            let local = local.clone();
            sched
                .spawn(move |task| {
                    let _captured = &captured;
                    let _local = DropFlag(local);
                    task.yield_now().unwrap();
                    task.exit().unwrap();
                })
                .unwrap();
        }

        let stats = sched.run();
        assert_eq!(stats.exits, 1);
        assert!(captured.get());
        assert!(local.get());
    }

    #[test]
    fn exit_releases_captured_scheduler() {
        let _trace = trace();
        let sched = Rc::new(Scheduler::open());

        {
            let inner = sched.clone();
            sched
                .spawn(move |task| {
                    assert_eq!(inner.live(), 1);
                    task.exit().unwrap();
                })
                .unwrap();
        }

        sched.run();
        assert_eq!(Rc::strong_count(&sched), 1);
    }

    #[test]
    fn exit_is_not_a_panic() {
        let _trace = trace();
        let sched = Scheduler::open();
        let after_exit = Rc::new(Cell::new(false));

        {
            let after_exit = after_exit.clone();
            sched
                .spawn(move |task| {
                    task.exit().unwrap();
                    after_exit.set(true);
                })
                .unwrap();
        }

        // `run` returns normally, the unwind ended at the task entry
        let stats = sched.run();
        assert_eq!(stats.exits, 1);
        assert!(!after_exit.get());
    }

    #[test]
    fn allocation_failure_enqueues_nothing() {
        let _trace = trace();
        let sched = Scheduler::open();
        let dropped = Rc::new(Cell::new(false));

        // overflows when rounded up to whole pages
        let flag = DropFlag(dropped.clone());
        let res = sched
            .build_task()
            .stack_size(usize::MAX - 4096)
            .spawn(move |_| drop(flag));
        assert_eq!(res, Err(SpawnError::AllocationFailed));
        assert!(dropped.get());

        // larger than any address space, the mapping itself fails
        let res = sched.build_task().stack_size(1 << 60).spawn(|_| {});
        assert_eq!(res, Err(SpawnError::AllocationFailed));

        assert_eq!(sched.count(), 0);
        assert_eq!(sched.live(), 0);
        assert!(sched.ready_tasks().is_empty());
        assert_eq!(sched.run(), RunStats::default());
    }

    #[test]
    fn body_return_is_implicit_exit() {
        let _trace = trace();
        let sched = Scheduler::open();
        let done = Rc::new(Cell::new(false));

        {
            let done = done.clone();
            sched
                .spawn(move |task| {
                    task.yield_now().unwrap();
                    done.set(true);
                })
                .unwrap();
        }

        let stats = sched.run();
        assert!(done.get());
        assert_eq!(stats.switches, 2);
        assert_eq!(stats.exits, 1);
        assert_eq!(sched.live(), 0);
    }

    #[test]
    fn status_and_bookkeeping_while_running() {
        let _trace = trace();
        let sched = Rc::new(Scheduler::open());
        let checked = Rc::new(Cell::new(0));

        for _ in 0..2 {
            let sched2 = sched.clone();
            let checked = checked.clone();
            sched
                .spawn(move |task| {
                    for _ in 0..3 {
                        // our own stack has not been released, and we are not in the ready queue
                        assert_eq!(task.status(), Status::Running);
                        assert_eq!(sched2.current(), Some(task.id()));
                        assert!(!sched2.ready_tasks().contains(&task.id()));
                        assert!(sched2.live() >= 1);

                        task.yield_now().unwrap();
                        checked.set(checked.get() + 1);
                    }
                })
                .unwrap();
        }

        assert_eq!(sched.live(), 2);
        sched.run();
        assert_eq!(checked.get(), 6);
        assert_eq!(sched.live(), 0);
        assert_eq!(sched.current(), None);
    }

    #[test]
    fn zero_stack_size_is_rejected() {
        fn noop(_task: &Task, _arg: ()) {}

        let sched = Scheduler::open();
        let res = panic::catch_unwind(AssertUnwindSafe(|| sched.create(noop, (), 0)));

        assert!(res.is_err());
        assert_eq!(sched.count(), 0);
        assert_eq!(sched.live(), 0);
    }

    #[test]
    fn tiny_stack_is_rounded_up() {
        fn touch(task: &Task, hits: Rc<Cell<u32>>) {
            hits.set(hits.get() + 1);
            task.yield_now().unwrap();
            hits.set(hits.get() + 1);
        }

        let sched = Scheduler::open();
        let hits = Rc::new(Cell::new(0));
        sched.create(touch, hits.clone(), 1).unwrap();

        sched.run();
        assert_eq!(hits.get(), 2);
    }

    #[test]
    fn tasks_can_spawn_tasks() {
        let _trace = trace();
        let sched = Scheduler::open();
        let log = Rc::new(RefCell::new(Vec::new()));

        {
            let log = log.clone();
            sched
                .build_task()
                .name("parent")
                .spawn(move |task| {
                    assert_eq!(task.name(), Some("parent"));
                    let child_log = log.clone();
                    task.build_task()
                        .name("child")
                        .spawn(move |child| {
                            assert_eq!(child.name(), Some("child"));
                            child_log.borrow_mut().push("child");
                        })
                        .unwrap();

                    log.borrow_mut().push("parent before yield");
                    task.yield_now().unwrap();
                    log.borrow_mut().push("parent after yield");
                })
                .unwrap();
        }

        let stats = sched.run();
        assert_eq!(
            *log.borrow(),
            ["parent before yield", "child", "parent after yield"]
        );
        assert_eq!(stats.exits, 2);
    }

    #[test]
    fn run_again_after_drain() {
        let sched = Scheduler::open();
        let hits = Rc::new(Cell::new(0));

        for _ in 0..2 {
            let hits = hits.clone();
            sched.spawn(move |_| hits.set(hits.get() + 1)).unwrap();
            assert_eq!(sched.run().exits, 1);
        }

        assert_eq!(hits.get(), 2);
    }

    #[test]
    fn suspension_at_depth() {
        fn descend(task: &Task, depth: u32, log: &RefCell<Vec<u32>>) {
            if depth == 0 {
                task.yield_now().unwrap();
                return;
            }
            // keep something live in every frame so the recursion is not flattened
            let marker = [depth; 8];
            descend(task, depth - 1, log);
            log.borrow_mut().push(marker[7]);
        }

        let sched = Scheduler::open();
        let log = Rc::new(RefCell::new(Vec::new()));
        {
            let log = log.clone();
            sched
                .build_task()
                .stack_size(256 * 1024)
                .spawn(move |task| descend(task, 64, &log))
                .unwrap();
        }

        sched.run();
        let expected: Vec<u32> = (1..=64).collect();
        assert_eq!(*log.borrow(), expected);
    }

    #[test]
    #[should_panic(expected = "boom")]
    fn task_panic_resumes_in_run() {
        let sched = Scheduler::open();
        sched.spawn(|_| panic!("boom")).unwrap();
        sched.run();
    }

    #[test]
    fn reentrant_run_is_rejected() {
        let sched = Rc::new(Scheduler::open());
        {
            let inner = sched.clone();
            sched
                .spawn(move |_| {
                    inner.run();
                })
                .unwrap();
        }

        let err = panic::catch_unwind(AssertUnwindSafe(|| sched.run())).unwrap_err();
        let msg = err.downcast_ref::<&str>().copied().unwrap_or_default();
        assert!(msg.contains("must not be called from inside a task"), "{msg}");
        assert_eq!(sched.live(), 0);
    }

    struct DropFlag(Rc<Cell<bool>>);

    impl Drop for DropFlag {
        fn drop(&mut self) {
            self.0.set(true);
        }
    }

    #[test]
    fn shutdown_releases_unstarted_tasks() {
        let _trace = trace();
        let sched = Scheduler::open();
        let dropped = Rc::new(Cell::new(false));

        {
            let flag = DropFlag(dropped.clone());
            sched
                .spawn(move |_| {
                    let _flag = &flag;
                    unreachable!("never runs");
                })
                .unwrap();
        }

        assert_eq!(sched.live(), 1);
        sched.shutdown();
        assert!(dropped.get());
    }

    #[test]
    fn shutdown_releases_suspended_tasks() {
        let _trace = trace();
        let sched = Scheduler::open();

        let dropped = Rc::new(Cell::new(false));

        // `a` gets suspended mid-way, then `b` panics and `run` unwinds, leaving `a` behind in
        // the ready queue.
        let flag = DropFlag(dropped.clone());
        let a = sched
            .spawn(move |task| {
                let _flag = flag;
                loop {
                    task.yield_now().unwrap();
                }
            })
            .unwrap();
        sched.spawn(|_| panic!("stop")).unwrap();

        assert!(panic::catch_unwind(AssertUnwindSafe(|| sched.run())).is_err());
        assert_eq!(sched.ready_tasks(), [a]);
        assert_eq!(sched.live(), 1);
        assert!(!dropped.get());

        sched.shutdown();
        assert!(dropped.get());
    }

    #[test]
    fn teardown_may_yield() {
        struct YieldOnDrop<'a>(&'a Task, Rc<Cell<u32>>);

        impl Drop for YieldOnDrop<'_> {
            fn drop(&mut self) {
                self.0.yield_now().unwrap();
                self.1.set(self.1.get() + 1);
            }
        }

        let _trace = trace();
        let sched = Scheduler::open();
        let finished = Rc::new(Cell::new(0));

        for _ in 0..2 {
            let finished = finished.clone();
            sched
                .spawn(move |task| {
                    let _guard = YieldOnDrop(task, finished);
                    loop {
                        task.yield_now().unwrap();
                    }
                })
                .unwrap();
        }
        // stops `run` while both tasks above are suspended
        sched.spawn(|_| panic!("stop")).unwrap();
        assert!(panic::catch_unwind(AssertUnwindSafe(|| sched.run())).is_err());
        assert_eq!(sched.count(), 2);

        sched.shutdown();
        assert_eq!(finished.get(), 2);
        assert_eq!(Rc::strong_count(&finished), 1);
    }

    #[test]
    fn shutdown_after_drain_releases_nothing() {
        let sched = Scheduler::open();
        for _ in 0..4 {
            sched.spawn(|task| task.yield_now().unwrap()).unwrap();
        }

        let stats = sched.run();
        assert_eq!(stats.switches, 8);
        assert_eq!(sched.live(), 0);
        assert_eq!(sched.count(), 0);
        sched.shutdown();
    }
}
