// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! ## Stack layout
//!
//! A suspended stack holds a single 160 byte frame with every callee-saved register of AAPCS64.
//! The saved stack pointer points at the lowest slot.
//!
//! ```text
//! +--------------+
//! | Saved X30    |  <- where swap() returns to when resumed
//! +--------------+
//! | Saved X29    |
//! +--------------+
//! | Saved X28    |
//! ~ ...          ~
//! | Saved X19    |
//! +--------------+
//! | Saved D15    |
//! ~ ...          ~
//! | Saved D8     |
//! +--------------+  <- Saved stack pointer
//! ```
//!
//! A freshly initialized stack has the same shape directly below the stack top, with the
//! trampoline in X30, the entry argument in X19 and the entry function in X20. X29 is zero, which
//! terminates the frame pointer chain.

use crate::Entry;
use crate::stack::StackPointer;
use crate::utils::{push, push_zeroed};
use core::arch::naked_asm;

pub const STACK_ALIGNMENT: usize = 16;

pub const INITIAL_FRAME_SIZE: usize = 20 * size_of::<usize>();

/// # Safety
///
/// `top` must be aligned to [`STACK_ALIGNMENT`] and the [`INITIAL_FRAME_SIZE`] bytes below it must
/// be valid for writes.
#[inline]
pub unsafe fn init_stack(top: StackPointer, entry: Entry, arg: *mut ()) -> StackPointer {
    let mut sp = top.get();

    // Safety: ensured by caller
    unsafe {
        // X30
        push(&mut sp, trampoline as usize);
        // X29
        push(&mut sp, 0);
        // X21..X28
        push_zeroed(&mut sp, 8);
        // X20
        push(&mut sp, entry as usize);
        // X19
        push(&mut sp, arg as usize);
        // D8..D15
        push_zeroed(&mut sp, 8);

        debug_assert_eq!(top.get() - sp, INITIAL_FRAME_SIZE);
        StackPointer::new_unchecked(sp)
    }
}

/// Entered by the `ret` at the end of [`swap`] the first time a new stack is switched into.
#[unsafe(naked)]
unsafe extern "C" fn trampoline() -> ! {
    naked_asm! {
        ".cfi_startproc",
        // There is no caller to unwind into, mark the return address as undefined so that
        // backtraces stop here.
        ".cfi_undefined x30",
        "mov x0, x19",
        "blr x20",
        // The entry function never returns.
        "brk #0x1",
        ".cfi_endproc",
    }
}

/// # Safety
///
/// `from` must be valid for writes and `to` must be a stack pointer previously produced by
/// [`init_stack`] or stored by `swap` on a stack that is still alive.
#[unsafe(naked)]
pub unsafe extern "C" fn swap(from: *mut usize, to: usize) {
    naked_asm! {
        // Spill the callee-saved registers onto the current stack.
        "sub sp, sp, #160",
        "stp d8, d9, [sp, #0]",
        "stp d10, d11, [sp, #16]",
        "stp d12, d13, [sp, #32]",
        "stp d14, d15, [sp, #48]",
        "stp x19, x20, [sp, #64]",
        "stp x21, x22, [sp, #80]",
        "stp x23, x24, [sp, #96]",
        "stp x25, x26, [sp, #112]",
        "stp x27, x28, [sp, #128]",
        "stp x29, x30, [sp, #144]",

        // Publish our stack pointer through `from` (X0) and switch to `to` (X1).
        "mov x2, sp",
        "str x2, [x0]",
        "mov sp, x1",

        // Reload the state spilled by the target's previous swap() (or written by init_stack).
        "ldp d8, d9, [sp, #0]",
        "ldp d10, d11, [sp, #16]",
        "ldp d12, d13, [sp, #32]",
        "ldp d14, d15, [sp, #48]",
        "ldp x19, x20, [sp, #64]",
        "ldp x21, x22, [sp, #80]",
        "ldp x23, x24, [sp, #96]",
        "ldp x25, x26, [sp, #112]",
        "ldp x27, x28, [sp, #128]",
        "ldp x29, x30, [sp, #144]",
        "add sp, sp, #160",

        // Return into the target: either after its own call to swap() or into the trampoline.
        "ret",
    }
}
