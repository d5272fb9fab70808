//! The boundary to the arch/cpu collaborator: everything this crate needs
//! from the concrete microcontroller but does not implement itself.
//!
//! Stack-frame layout, the context-switch trap, and "am I in an ISR right
//! now" are all fundamentally target-specific; [`Port`] is the trait a board
//! support crate implements once per target. Interrupt masking is a
//! separate, narrower concern and is handled by the [`critical-section`]
//! crate instead of being folded into this trait, since `critical-section`
//! already is the ecosystem's answer to "give me a global, possibly
//! target-specific way to disable interrupts" and composes with the rest of
//! the embedded ecosystem a board might already be using it for.
//!
//! [`critical-section`]: https://docs.rs/critical-section

/// Per-target services the kernel needs but never implements itself.
///
/// A `Port` has no state of its own; every method is a free function in
/// disguise (hence `Self: Sized` and no `&self` receivers other than where a
/// value must flow through, such as [`Port::StackPointer`]).
pub trait Port {
    /// Whatever the target needs to resume a thread: typically just the
    /// saved stack pointer.
    type StackPointer: Copy;

    /// Forges an initial exception frame on `[stack_start, stack_start +
    /// stack_size)` such that, once restored, execution resumes at `entry`
    /// with `arg` available to it and interrupts enabled.
    ///
    /// # Safety
    /// `stack_start` must point to `stack_size` bytes of writable memory
    /// that nothing else references, and must remain valid for as long as
    /// the constructed stack pointer is used to resume execution.
    unsafe fn stack_init(
        entry: unsafe extern "C" fn(usize) -> !,
        arg: usize,
        stack_start: *mut u8,
        stack_size: usize,
    ) -> Self::StackPointer;

    /// Whether the calling code is currently executing in interrupt
    /// context.
    fn in_isr() -> bool;

    /// Requests that the highest-priority runnable thread be scheduled onto
    /// the CPU. Called from thread context; may or may not return
    /// immediately depending on whether the caller itself is preempted.
    fn yield_higher();

    /// Arms the deferred context-switch trap (e.g. a Cortex-M PendSV)
    /// without synchronously yielding. Called from ISR context to request a
    /// switch that will be honored at `end_of_isr`.
    fn trigger_pendsv();

    /// Restores `next`'s machine context and never returns to the caller.
    /// Used only when exiting the last thread's worth of execution, i.e.
    /// there is no "current" context left to eventually come back to.
    ///
    /// # Safety
    /// `next` must have been produced by [`Port::stack_init`] or by the
    /// port's own context-switch trap, and must reference a still-valid
    /// stack.
    unsafe fn switch_context_exit(next: Self::StackPointer) -> !;
}

/// An RAII proof that interrupts (or, more generally, preemption) are
/// disabled for as long as the guard is alive.
///
/// Every kernel entry point that touches scheduler state acquires one of
/// these around the critical part of the operation; dropping it restores
/// whatever state [`critical_section::acquire`] captured, including on an
/// early return or a `?`, so there is no path through a primitive that can
/// forget to turn interrupts back on.
pub struct IrqGuard(critical_section::RestoreState);

impl IrqGuard {
    /// Disables interrupts, returning a guard that restores them on drop.
    pub fn acquire() -> Self {
        // Safety: released by the `Drop` impl below, exactly once, without
        // being reordered past other critical sections (`critical_section`'s
        // own contract).
        Self(unsafe { critical_section::acquire() })
    }
}

impl Drop for IrqGuard {
    fn drop(&mut self) {
        // Safety: `self.0` was produced by the matching `acquire` above and
        // is released at most once.
        unsafe { critical_section::release(self.0) }
    }
}
