// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! x86_64 System V context switch.
//!
//! Suspended frame, from the saved stack pointer upwards:
//!
//! ```text
//! sp + 0x00  mxcsr (u32) | x87 control word (u16)
//! sp + 0x08  r15
//! sp + 0x10  r14
//! sp + 0x18  r13
//! sp + 0x20  r12
//! sp + 0x28  rbx
//! sp + 0x30  rbp
//! sp + 0x38  return address
//! ```

use std::arch::naked_asm;

/// Default MXCSR (all exceptions masked) and x87 control word.
const INITIAL_FP_STATE: usize = 0x1F80 | (0x037F << 32);

const FRAME_WORDS: usize = 8;

/// Save callee-saved state on the current stack, store the stack pointer in
/// `*save`, then restore the frame found at `load` and return into it.
#[unsafe(naked)]
pub(super) unsafe extern "C" fn switch_stack(_save: *mut usize, _load: usize) {
    naked_asm!(
        "push rbp",
        "push rbx",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        "sub rsp, 8",
        "stmxcsr dword ptr [rsp]",
        "fnstcw word ptr [rsp + 4]",
        "mov [rdi], rsp",
        "mov rsp, rsi",
        "ldmxcsr dword ptr [rsp]",
        "fldcw word ptr [rsp + 4]",
        "add rsp, 8",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop rbx",
        "pop rbp",
        "ret",
    );
}

/// First return target of a fresh fiber: `entry(arg)` from r12/r13.
#[unsafe(naked)]
unsafe extern "C" fn fiber_start() {
    naked_asm!("mov rdi, r13", "call r12", "ud2");
}

/// Lay out an initial frame below `top` so that the first switch into it
/// lands in `fiber_start` with a 16-byte aligned stack.
pub(super) unsafe fn init_stack(top: usize, entry: usize, arg: usize) -> usize {
    let top = top & !15;
    let sp = top - FRAME_WORDS * 8;
    let frame = sp as *mut usize;
    let words: [usize; FRAME_WORDS] = [
        INITIAL_FP_STATE,
        0,     // r15
        0,     // r14
        arg,   // r13
        entry, // r12
        0,     // rbx
        0,     // rbp, terminates frame-pointer walks
        fiber_start as *const () as usize,
    ];
    unsafe {
        for (i, word) in words.into_iter().enumerate() {
            frame.add(i).write(word);
        }
    }
    sp
}
