// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Memory that tasks execute on.

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        mod unix;
        pub use unix::TaskStack;
    } else {
        compile_error!("task stacks are only implemented for unix targets");
    }
}

/// An address on a stack. Stack addresses are never zero.
pub type StackPointer = core::num::NonZeroUsize;

/// Minimum size of a stack, excluding guard pages.
pub const MIN_STACK_SIZE: usize = 4096;

pub use crate::arch::STACK_ALIGNMENT;

/// A region of memory that a [`Context`](crate::Context) can execute on.
///
/// # Safety
///
/// Implementors must guarantee that the range `bottom()..top()` is valid for reads and writes for
/// as long as the stack is alive, and that the addresses returned never change.
pub unsafe trait Stack {
    /// Returns the highest address (start address) of the stack.
    ///
    /// This must be aligned to [`STACK_ALIGNMENT`].
    fn top(&self) -> StackPointer;

    /// Returns the lowest usable address (maximum limit) of the stack.
    ///
    /// Guard pages lie below this.
    fn bottom(&self) -> StackPointer;
}

// Safety: forwards to the underlying stack, which stays alive for the lifetime of the reference
unsafe impl<S: Stack + ?Sized> Stack for &S {
    #[inline]
    fn top(&self) -> StackPointer {
        (**self).top()
    }

    #[inline]
    fn bottom(&self) -> StackPointer {
        (**self).bottom()
    }
}
