// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! AArch64 (AAPCS64) context switch.
//!
//! Suspended frame, from the saved stack pointer upwards: x19..x28, x29,
//! x30 (return address), then d8..d15. 160 bytes, keeps sp 16-aligned.

use std::arch::naked_asm;

const FRAME_WORDS: usize = 20;

/// Save callee-saved state on the current stack, store the stack pointer in
/// `*save`, then restore the frame found at `load` and return into it.
#[unsafe(naked)]
pub(super) unsafe extern "C" fn switch_stack(_save: *mut usize, _load: usize) {
    naked_asm!(
        "sub sp, sp, #0xa0",
        "stp x19, x20, [sp, #0x00]",
        "stp x21, x22, [sp, #0x10]",
        "stp x23, x24, [sp, #0x20]",
        "stp x25, x26, [sp, #0x30]",
        "stp x27, x28, [sp, #0x40]",
        "stp x29, x30, [sp, #0x50]",
        "stp d8, d9, [sp, #0x60]",
        "stp d10, d11, [sp, #0x70]",
        "stp d12, d13, [sp, #0x80]",
        "stp d14, d15, [sp, #0x90]",
        "mov x9, sp",
        "str x9, [x0]",
        "mov sp, x1",
        "ldp x19, x20, [sp, #0x00]",
        "ldp x21, x22, [sp, #0x10]",
        "ldp x23, x24, [sp, #0x20]",
        "ldp x25, x26, [sp, #0x30]",
        "ldp x27, x28, [sp, #0x40]",
        "ldp x29, x30, [sp, #0x50]",
        "ldp d8, d9, [sp, #0x60]",
        "ldp d10, d11, [sp, #0x70]",
        "ldp d12, d13, [sp, #0x80]",
        "ldp d14, d15, [sp, #0x90]",
        "add sp, sp, #0xa0",
        "ret",
    );
}

/// First return target of a fresh fiber: `entry(arg)` from x19/x20.
#[unsafe(naked)]
unsafe extern "C" fn fiber_start() {
    naked_asm!("mov x0, x20", "blr x19", "brk #0");
}

/// Lay out an initial frame below `top` so that the first switch into it
/// returns into `fiber_start`.
pub(super) unsafe fn init_stack(top: usize, entry: usize, arg: usize) -> usize {
    let top = top & !15;
    let sp = top - FRAME_WORDS * 8;
    let frame = sp as *mut usize;
    let mut words = [0usize; FRAME_WORDS];
    words[0] = entry; // x19
    words[1] = arg; // x20
    words[10] = 0; // x29, terminates frame-pointer walks
    words[11] = fiber_start as *const () as usize; // x30
    unsafe {
        for (i, word) in words.into_iter().enumerate() {
            frame.add(i).write(word);
        }
    }
    sp
}
