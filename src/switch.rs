//! Raw stack/register context switching (x86_64, System V ABI).
//!
//! The original implementation switches user-thread stacks with
//! `getcontext`/`makecontext`/`setcontext`. Those have no stable Rust
//! equivalent (and are deprecated even in C), so the switch is
//! reimplemented directly with `core::arch::asm!`, in the same
//! save-callee-saved-registers-then-`ret` shape used by the hand-rolled
//! green-thread scheduler this module is grounded on.
//!
//! Only the seven registers the System V ABI guarantees are callee-saved
//! need to be preserved across a switch: `rsp`, `rbp`, `rbx`, `r12`-`r15`.
//! The return address is not stored as a separate field -- `call`
//! already pushed it onto the stack before `switch_context` runs, and
//! restoring `rsp` to a previously-saved value puts that same return
//! address back on top, so a plain `ret` resumes exactly where that
//! context last yielded. A context that has never run yet is primed with
//! a synthetic "return address" pointing at [`trampoline_entry`].

#![cfg(target_arch = "x86_64")]

use std::arch::asm;
use std::cell::Cell;

/// Saved callee-saved register set for one user thread.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Context {
    rsp: u64,
    rbp: u64,
    rbx: u64,
    r12: u64,
    r13: u64,
    r14: u64,
    r15: u64,
}

impl Default for Context {
    fn default() -> Self {
        Self {
            rsp: 0,
            rbp: 0,
            rbx: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,
        }
    }
}

thread_local! {
    /// Set by a dispatcher immediately before the first resume of a new
    /// user thread; read and cleared once by [`trampoline_entry`] on that
    /// same kernel thread. Thread-local (not a single global) because
    /// multiple dispatchers run this trampoline concurrently on separate
    /// kernel threads.
    static PENDING_ENTRY: Cell<Option<Box<dyn FnOnce() + Send + 'static>>> = const { Cell::new(None) };
}

/// Builds the initial context for a stack that has never run. `stack`
/// must remain allocated and untouched for as long as the context may be
/// resumed; ownership is the caller's (see `thread::Stack`).
///
/// # Safety
/// `stack` must point at a region of at least 64 bytes, 16-byte aligned
/// at its high end (true for any heap allocation on this platform), and
/// must outlive every resume of the returned context.
pub unsafe fn init_context(stack_top: *mut u8) -> Context {
    let aligned_top = (stack_top as usize) & !0xF;
    let slot_addr = aligned_top - 16;
    unsafe {
        (slot_addr as *mut u64).write(trampoline_entry as usize as u64);
    }
    Context {
        rsp: slot_addr as u64,
        ..Context::default()
    }
}

/// Stashes the thread's entry closure for [`trampoline_entry`] to pick up
/// on its first execution, which happens immediately after the next
/// [`switch_context`] call that resumes `ctx`.
pub fn set_pending_entry(entry: Box<dyn FnOnce() + Send + 'static>) {
    PENDING_ENTRY.with(|cell| cell.set(Some(entry)));
}

/// Saves the currently-executing context into `old` and resumes `new`.
/// Never returns directly to its caller in the usual sense: control comes
/// back out of this same call site only when some other party later
/// switches back into `old`.
///
/// # Safety
/// Both `old` and `new` must point at valid, live `Context` values, `new`
/// must have been produced by [`init_context`] or by a prior save through
/// this same function, and the stack `new` refers to must still be
/// allocated.
#[inline(never)]
pub unsafe fn switch_context(old: *mut Context, new: *const Context) {
    unsafe {
        asm!(
            "mov [{old} + 0],  rsp",
            "mov [{old} + 8],  rbp",
            "mov [{old} + 16], rbx",
            "mov [{old} + 24], r12",
            "mov [{old} + 32], r13",
            "mov [{old} + 40], r14",
            "mov [{old} + 48], r15",
            "mov rsp, [{new} + 0]",
            "mov rbp, [{new} + 8]",
            "mov rbx, [{new} + 16]",
            "mov r12, [{new} + 24]",
            "mov r13, [{new} + 32]",
            "mov r14, [{new} + 40]",
            "mov r15, [{new} + 48]",
            "ret",
            old = in(reg) old,
            new = in(reg) new,
            options(noreturn),
        );
    }
}

/// The first code a newly-created user thread stack ever runs. Reads its
/// entry closure out of [`PENDING_ENTRY`], runs it, and hands control to
/// the per-thread finish hook, which never returns (it always switches
/// away to either the dispatcher's idle stack or a sibling thread).
extern "C" fn trampoline_entry() -> ! {
    let entry = PENDING_ENTRY.with(|cell| cell.take());
    if let Some(entry) = entry {
        entry();
    }
    crate::thread::trampoline_finished();
}

#[cfg(test)]
mod tests {
    use super::*;

    // Context switching is exercised end to end by `dispatcher`'s and
    // `thread`'s own tests (spawning and running real user threads);
    // here we only check that a freshly-initialized context has the
    // alignment `trampoline_entry` requires on entry.
    #[test]
    fn init_context_aligns_the_synthetic_return_slot() {
        let mut stack = vec![0u8; 4096];
        let top = unsafe { stack.as_mut_ptr().add(stack.len()) };
        let ctx = unsafe { init_context(top) };
        assert_eq!(ctx.rsp % 16, 0);
        let stored = unsafe { (ctx.rsp as *const u64).read() };
        assert_eq!(stored, trampoline_entry as usize as u64);
    }
}
