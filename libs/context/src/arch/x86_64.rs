// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! ## Stack layout
//!
//! This is what a suspended stack looks like. The saved stack pointer points at the lowest slot.
//!
//! ```text
//! |              |
//! ~     ...      ~
//! +--------------+
//! | Return addr  |  <- where swap() returns to when resumed
//! +--------------+
//! | Saved RBP    |
//! +--------------+
//! | Saved RBX    |
//! +--------------+
//! | Saved R12    |
//! +--------------+
//! | Saved R13    |
//! +--------------+
//! | Saved R14    |
//! +--------------+
//! | Saved R15    |
//! +--------------+
//! | FPU CW|MXCSR |
//! +--------------+  <- Saved stack pointer
//! ```
//!
//! A freshly initialized stack has the same shape, with the trampoline as the return address, the
//! entry argument in RBX and the entry function in R12:
//!
//! ```text
//! +--------------+  <- Stack top
//! | 0            |
//! +--------------+
//! | 0            |  <- RSP when the trampoline starts executing
//! +--------------+
//! | trampoline   |
//! +--------------+
//! | RBP = 0      |
//! +--------------+
//! | RBX = arg    |
//! +--------------+
//! | R12 = entry  |
//! +--------------+
//! | R13..R15 = 0 |
//! ~              ~
//! +--------------+
//! | default CW   |
//! +--------------+  <- Initial stack pointer
//! ```

use crate::Entry;
use crate::stack::StackPointer;
use crate::utils::{push, push_zeroed};
use core::arch::naked_asm;

pub const STACK_ALIGNMENT: usize = 16;

pub const INITIAL_FRAME_SIZE: usize = 10 * size_of::<usize>();

/// Power-on values of the SSE and x87 control words: all exceptions masked, round to nearest,
/// 64-bit x87 precision.
const DEFAULT_MXCSR: usize = 0x1f80;
const DEFAULT_FPU_CW: usize = 0x037f;

/// # Safety
///
/// `top` must be aligned to [`STACK_ALIGNMENT`] and the [`INITIAL_FRAME_SIZE`] bytes below it must
/// be valid for writes.
#[inline]
pub unsafe fn init_stack(top: StackPointer, entry: Entry, arg: *mut ()) -> StackPointer {
    let mut sp = top.get();

    // Safety: ensured by caller
    unsafe {
        // Null frame record terminating the frame pointer chain. Also keeps RSP 16-byte aligned
        // once the trampoline has been "returned" into.
        push_zeroed(&mut sp, 2);

        push(&mut sp, trampoline as usize);
        // RBP
        push(&mut sp, 0);
        // RBX
        push(&mut sp, arg as usize);
        // R12
        push(&mut sp, entry as usize);
        // R13, R14, R15
        push_zeroed(&mut sp, 3);
        push(&mut sp, DEFAULT_MXCSR | (DEFAULT_FPU_CW << 32));

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
        ".cfi_undefined rip",
        "mov rdi, rbx",
        "call r12",
        // The entry function never returns.
        "ud2",
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
        // Spill the callee-saved registers of the System V ABI onto the current stack. MXCSR
        // and the x87 control word are callee-saved too.
        "push rbp",
        "push rbx",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        "sub rsp, 8",
        "stmxcsr [rsp]",
        "fnstcw [rsp + 4]",

        // Publish our stack pointer through `from` (RDI) and switch to `to` (RSI).
        "mov [rdi], rsp",
        "mov rsp, rsi",

        // Reload the state spilled by the target's previous swap() (or written by init_stack).
        "ldmxcsr [rsp]",
        "fldcw [rsp + 4]",
        "add rsp, 8",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop rbx",
        "pop rbp",

        // Return into the target: either after its own call to swap() or into the trampoline.
        "ret",
    }
}
