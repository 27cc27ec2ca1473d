// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! ## Stack layout
//!
//! A suspended stack holds a single 208 byte frame with every callee-saved register of the
//! LP64D calling convention. The saved stack pointer points at the lowest slot.
//!
//! ```text
//! +--------------+
//! | Padding      |
//! +--------------+
//! | Saved FS11   |
//! ~ ...          ~
//! | Saved FS0    |
//! +--------------+
//! | Saved S11    |
//! ~ ...          ~
//! | Saved S0     |
//! +--------------+
//! | Saved RA     |  <- where swap() returns to when resumed
//! +--------------+  <- Saved stack pointer
//! ```
//!
//! A freshly initialized stack has the same shape directly below the stack top, with the
//! trampoline in RA, the entry argument in S1 and the entry function in S2. S0 (the frame
//! pointer) is zero, which terminates the frame pointer chain.

use crate::Entry;
use crate::stack::StackPointer;
use crate::utils::{push, push_zeroed};
use core::arch::naked_asm;

pub const STACK_ALIGNMENT: usize = 16;

pub const INITIAL_FRAME_SIZE: usize = 26 * size_of::<usize>();

/// # Safety
///
/// `top` must be aligned to [`STACK_ALIGNMENT`] and the [`INITIAL_FRAME_SIZE`] bytes below it must
/// be valid for writes.
#[inline]
pub unsafe fn init_stack(top: StackPointer, entry: Entry, arg: *mut ()) -> StackPointer {
    let mut sp = top.get();

    // Safety: ensured by caller
    unsafe {
        // Padding, FS11..FS0, S11..S3
        push_zeroed(&mut sp, 1 + 12 + 9);
        // S2
        push(&mut sp, entry as usize);
        // S1
        push(&mut sp, arg as usize);
        // S0
        push(&mut sp, 0);
        // RA
        push(&mut sp, trampoline as usize);

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
        ".cfi_undefined ra",
        "mv a0, s1",
        "jalr s2",
        // The entry function never returns.
        "unimp",
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
        "addi sp, sp, -208",
        "sd ra, 0(sp)",
        "sd s0, 8(sp)",
        "sd s1, 16(sp)",
        "sd s2, 24(sp)",
        "sd s3, 32(sp)",
        "sd s4, 40(sp)",
        "sd s5, 48(sp)",
        "sd s6, 56(sp)",
        "sd s7, 64(sp)",
        "sd s8, 72(sp)",
        "sd s9, 80(sp)",
        "sd s10, 88(sp)",
        "sd s11, 96(sp)",
        "fsd fs0, 104(sp)",
        "fsd fs1, 112(sp)",
        "fsd fs2, 120(sp)",
        "fsd fs3, 128(sp)",
        "fsd fs4, 136(sp)",
        "fsd fs5, 144(sp)",
        "fsd fs6, 152(sp)",
        "fsd fs7, 160(sp)",
        "fsd fs8, 168(sp)",
        "fsd fs9, 176(sp)",
        "fsd fs10, 184(sp)",
        "fsd fs11, 192(sp)",

        // Publish our stack pointer through `from` (A0) and switch to `to` (A1).
        "sd sp, 0(a0)",
        "mv sp, a1",

        // Reload the state spilled by the target's previous swap() (or written by init_stack).
        "ld ra, 0(sp)",
        "ld s0, 8(sp)",
        "ld s1, 16(sp)",
        "ld s2, 24(sp)",
        "ld s3, 32(sp)",
        "ld s4, 40(sp)",
        "ld s5, 48(sp)",
        "ld s6, 56(sp)",
        "ld s7, 64(sp)",
        "ld s8, 72(sp)",
        "ld s9, 80(sp)",
        "ld s10, 88(sp)",
        "ld s11, 96(sp)",
        "fld fs0, 104(sp)",
        "fld fs1, 112(sp)",
        "fld fs2, 120(sp)",
        "fld fs3, 128(sp)",
        "fld fs4, 136(sp)",
        "fld fs5, 144(sp)",
        "fld fs6, 152(sp)",
        "fld fs7, 160(sp)",
        "fld fs8, 168(sp)",
        "fld fs9, 176(sp)",
        "fld fs10, 184(sp)",
        "fld fs11, 192(sp)",
        "addi sp, sp, 208",

        // Return into the target: either after its own call to swap() or into the trampoline.
        "ret",
    }
}
