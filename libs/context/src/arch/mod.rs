// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Every architecture module provides the same four items:
//!
//! - `STACK_ALIGNMENT`: required alignment of the stack pointer at a call boundary.
//! - `INITIAL_FRAME_SIZE`: bytes consumed by `init_stack` below the top of the stack.
//! - `init_stack(top, entry, arg)`: writes a register frame that `swap` will "restore" so that it
//!   returns into a trampoline which calls `entry(arg)`.
//! - `swap(from, to)`: spills the callee-saved registers onto the current stack, stores the stack
//!   pointer into `*from`, switches to `to` and reloads the registers spilled there.

cfg_if::cfg_if! {
    if #[cfg(all(target_arch = "riscv64", target_feature = "d"))] {
        mod riscv64;
        pub use riscv64::*;
    } else if #[cfg(target_arch = "aarch64")] {
        mod aarch64;
        pub use aarch64::*;
    } else if #[cfg(all(target_arch = "x86_64", not(windows)))] {
        mod x86_64;
        pub use x86_64::*;
    } else {
        compile_error!("Unsupported target architecture");
    }
}
