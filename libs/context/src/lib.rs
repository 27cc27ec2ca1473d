// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Symmetric stack switching for strand tasks.
//!
//! This crate is the only place in strand that touches raw stacks and registers. It exposes exactly
//! two operations:
//!
//! - [`init_context`] lays out an initial register frame on a [`Stack`] so that the first switch into
//!   the context starts executing an entry function on that stack.
//! - [`swap`] saves the callee-saved register state of the caller into one [`Context`] and restores
//!   another, transferring execution.
//!
//! Unlike asymmetric designs (where a coroutine can only ever return to whoever resumed it), any
//! suspended context may be switched into from any other context. The scheduler in the `strand`
//! crate uses this to bounce between its home context and task contexts.

mod arch;
mod error;
pub mod stack;
mod utils;

use core::cell::Cell;
use core::fmt;
use core::ptr;

pub use error::{InitError, SwapError};
pub use stack::{MIN_STACK_SIZE, STACK_ALIGNMENT, Stack, StackPointer, TaskStack};

/// Function executed the first time a freshly initialized [`Context`] is switched into.
///
/// The entry function runs on the new stack and must never return: there is no frame
/// to return to. It should instead [`swap`] away for the last time.
pub type Entry = unsafe extern "C" fn(arg: *mut ()) -> !;

/// Saved execution state of a suspended stack.
///
/// A context is either *suspended*, holding the stack pointer at which its callee-saved registers
/// were spilled, or *empty*. Empty contexts are either not initialized yet or currently executing:
/// switching into a context consumes its saved state, and switching away from it fills it in again.
/// This makes it impossible to resume the same saved state twice.
#[repr(transparent)]
#[derive(Default)]
pub struct Context(Cell<Option<StackPointer>>);

impl Context {
    /// Returns an empty context.
    ///
    /// The only useful thing to do with an empty context is to pass it as the `from` side of a
    /// [`swap`], which fills it with the state of the caller.
    pub const fn empty() -> Self {
        Self(Cell::new(None))
    }

    /// Returns `true` if this context holds saved state that can be switched into.
    pub fn is_suspended(&self) -> bool {
        self.0.get().is_some()
    }

    /// Discards the saved state without resuming it.
    ///
    /// Used when a suspended stack is torn down without ever running to completion. Nothing that
    /// currently lives on the stack will be dropped.
    pub fn clear(&self) {
        self.0.set(None);
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.get() {
            Some(sp) => f
                .debug_tuple("Context")
                .field(&format_args!("{:#x}", sp.get()))
                .finish(),
            None => f.write_str("Context(<empty>)"),
        }
    }
}

/// Initializes `ctx` so that it starts executing `entry(arg)` on `stack` when first switched into.
///
/// Any state previously saved in `ctx` is discarded.
///
/// # Errors
///
/// Returns [`InitError::Misaligned`] if the top of `stack` is not aligned to [`STACK_ALIGNMENT`],
/// and [`InitError::TooSmall`] if the stack cannot hold the initial register frame. `ctx` is left
/// untouched in both cases.
///
/// # Safety
///
/// The caller must keep `stack` alive and unmoved for as long as `ctx` (or any context derived from
/// switching away from it) may be switched into. `arg` must be valid for whatever `entry` does
/// with it.
pub unsafe fn init_context(
    ctx: &Context,
    stack: &dyn Stack,
    entry: Entry,
    arg: *mut (),
) -> Result<(), InitError> {
    let top = stack.top();
    if top.get() % STACK_ALIGNMENT != 0 {
        return Err(InitError::Misaligned);
    }
    let len = top.get().saturating_sub(stack.bottom().get());
    if len < arch::INITIAL_FRAME_SIZE {
        return Err(InitError::TooSmall);
    }

    // Safety: the stack is large enough and properly aligned (checked above)
    let sp = unsafe { arch::init_stack(top, entry, arg) };
    ctx.0.set(Some(sp));

    Ok(())
}

/// Saves the current execution state into `from` and resumes `to`.
///
/// From the caller's point of view this is a single blocking call: it returns only once some other
/// party switches back into `from`. `to` is left empty while its stack executes.
///
/// # Errors
///
/// Fails without switching if `to` is not suspended ([`SwapError::NotSuspended`]) or if `from` and
/// `to` are the same context ([`SwapError::SameContext`]).
///
/// # Safety
///
/// The stack that `to` was suspended on must still be alive. `from` must stay at the same address
/// until it is switched into again, since the other side writes back into it through a pointer.
pub unsafe fn swap(from: &Context, to: &Context) -> Result<(), SwapError> {
    if ptr::eq(from, to) {
        return Err(SwapError::SameContext);
    }
    let target = to.0.take().ok_or(SwapError::NotSuspended)?;

    // `Option<NonZeroUsize>` is guaranteed to have the layout of `usize`, with `None` as zero, so
    // the assembly can store the raw stack pointer straight into the cell.
    let slot = from.0.as_ptr().cast::<usize>();

    // Safety: `target` is the saved state of a live stack (ensured by caller) and `slot` is valid
    // for writes for as long as `from` lives.
    unsafe {
        arch::swap(slot, target.get());
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    struct Pair {
        home: Context,
        task: Context,
        log: RefCell<Vec<u32>>,
    }

    unsafe extern "C" fn ping(arg: *mut ()) -> ! {
        // Safety: the tests pass a pointer to a `Pair` that outlives the stack
        let pair = unsafe { &*arg.cast::<Pair>() };

        for i in 0..3 {
            pair.log.borrow_mut().push(i);
            // Safety: the test keeps the home stack alive
            unsafe { swap(&pair.task, &pair.home).unwrap() };
        }

        pair.log.borrow_mut().push(u32::MAX);
        // Safety: the test keeps the home stack alive
        unsafe { swap(&pair.task, &pair.home).unwrap() };
        unreachable!("finished context was resumed");
    }

    #[test]
    fn ping_pong() {
        let stack = TaskStack::new(16 * 1024).unwrap();
        let pair = Pair {
            home: Context::empty(),
            task: Context::empty(),
            log: RefCell::new(Vec::new()),
        };
        let arg = ptr::from_ref(&pair).cast_mut().cast();
        // Safety: the stack outlives the context
        unsafe { init_context(&pair.task, &stack, ping, arg).unwrap() };

        for expected in 1..=3 {
            assert!(pair.task.is_suspended());
            // Safety: every stack involved is still alive
            unsafe { swap(&pair.home, &pair.task).unwrap() };
            assert_eq!(pair.log.borrow().len(), expected);
            assert!(!pair.home.is_suspended());
        }

        // Safety: every stack involved is still alive
        unsafe { swap(&pair.home, &pair.task).unwrap() };
        assert_eq!(*pair.log.borrow(), [0, 1, 2, u32::MAX]);

        // the task never gets resumed again, forget its saved state before unmapping the stack
        pair.task.clear();
        drop(stack);
    }

    #[test]
    fn swap_into_empty_context() {
        let from = Context::empty();
        let to = Context::empty();

        // Safety: rejected before any stack is touched
        let res = unsafe { swap(&from, &to) };
        assert_eq!(res, Err(SwapError::NotSuspended));
        assert!(!from.is_suspended());
    }

    #[test]
    fn swap_into_self() {
        let stack = TaskStack::new(MIN_STACK_SIZE).unwrap();
        let ctx = Context::empty();
        // Safety: the stack outlives the context
        unsafe { init_context(&ctx, &stack, ping, ptr::null_mut()).unwrap() };

        // Safety: rejected before any stack is touched
        let res = unsafe { swap(&ctx, &ctx) };
        assert_eq!(res, Err(SwapError::SameContext));
        // a rejected swap must leave the saved state untouched
        assert!(ctx.is_suspended());
    }

    #[repr(C, align(16))]
    struct Aligned<const N: usize>([u8; N]);

    struct SliceStack<'a>(&'a [u8]);

    // Safety: the slice outlives every context the tests build on it
    unsafe impl Stack for SliceStack<'_> {
        fn top(&self) -> StackPointer {
            StackPointer::new(self.0.as_ptr_range().end as usize).unwrap()
        }

        fn bottom(&self) -> StackPointer {
            StackPointer::new(self.0.as_ptr() as usize).unwrap()
        }
    }

    #[test]
    fn init_rejects_small_stack() {
        let buf = Aligned([0u8; 16]);
        let stack = SliceStack(&buf.0);

        let ctx = Context::empty();

        // Safety: the stack outlives the context
        let res = unsafe { init_context(&ctx, &stack, ping, ptr::null_mut()) };
        assert_eq!(res, Err(InitError::TooSmall));
        assert!(!ctx.is_suspended());
    }

    #[test]
    fn init_rejects_misaligned_stack() {
        let buf = Aligned([0u8; 1024]);
        let stack = SliceStack(&buf.0[..1016]);

        let ctx = Context::empty();

        // Safety: the stack outlives the context
        let res = unsafe { init_context(&ctx, &stack, ping, ptr::null_mut()) };
        assert_eq!(res, Err(InitError::Misaligned));
    }

    #[test]
    fn init_on_borrowed_buffer() {
        let buf = Box::new(Aligned([0u8; 4096]));
        let stack = SliceStack(&buf.0);

        let ctx = Context::empty();

        // Safety: the stack outlives the context
        unsafe { init_context(&ctx, &stack, ping, ptr::null_mut()).unwrap() };
        assert!(ctx.is_suspended());
        ctx.clear();
        assert!(!ctx.is_suspended());
    }
}
