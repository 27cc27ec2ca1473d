// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

/// Pushes a word onto a downward growing stack.
///
/// # Safety
///
/// `*sp - size_of::<usize>()` must be valid for writes and aligned.
#[inline]
pub unsafe fn push(sp: &mut usize, val: usize) {
    *sp -= size_of::<usize>();
    // Safety: ensured by caller
    unsafe {
        (*sp as *mut usize).write(val);
    }
}

/// Pushes `n` zeroed words onto a downward growing stack.
///
/// # Safety
///
/// The `n` words below `*sp` must be valid for writes and aligned.
#[inline]
pub unsafe fn push_zeroed(sp: &mut usize, n: usize) {
    for _ in 0..n {
        // Safety: ensured by caller
        unsafe {
            push(sp, 0);
        }
    }
}
