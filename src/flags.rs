//! Per-thread event flags: a 16-bit word each thread can wait on bits of.
//!
//! Setting a flag that a thread is blocked waiting on wakes it; setting any
//! other flag just leaves it set until the thread comes around to clear or
//! wait on it. [`crate::event`] reserves the top bit of this word for its own
//! use.

use crate::error::{FlagsWouldBlock, UnknownThread};
use crate::port::Port;
use crate::sched::{Inner, Kernel};
use crate::state::ThreadStatus;
use crate::task::{Pid, Tcb};

impl<P: Port + 'static, const PRIO: usize, const MAXTHREADS: usize> Kernel<P, PRIO, MAXTHREADS> {
    /// Sets `mask` bits on `pid`'s flag word, waking it if doing so satisfies
    /// whatever it is currently blocked waiting for. Safe to call from
    /// interrupt context; the actual context switch, if any, is deferred the
    /// same way any other ISR-context wakeup is.
    pub fn set_flags(&self, pid: Pid, mask: u16) -> Result<(), UnknownThread> {
        enum Step {
            Woken(u8),
            Unchanged,
        }

        let step = self.with_inner(|inner| -> Result<Step, UnknownThread> {
            let thread = inner.lookup(pid).ok_or(UnknownThread)?;
            thread.flags_word.set(thread.flags_word.get() | mask);
            Ok(if Self::wake_if_satisfied(inner, thread) {
                Step::Woken(thread.priority)
            } else {
                Step::Unchanged
            })
        })?;

        if let Step::Woken(priority) = step {
            self.context_switch(priority);
        }
        Ok(())
    }

    /// Clears `mask` bits on the calling thread's own flag word and returns
    /// the bits that were actually cleared.
    pub fn clear_flags(&self, mask: u16) -> u16 {
        self.with_inner(|inner| {
            let current = inner.active.expect("clear_flags called with no active thread");
            Self::clear_atomic(current, mask)
        })
    }

    /// Blocks until at least one bit in `mask` is set, then clears and
    /// returns the bits that matched.
    pub fn wait_any(&self, mask: u16) -> u16 {
        self.wait_any_blocked(mask);
        self.with_inner(|inner| {
            let current = inner.active.expect("wait_any called with no active thread");
            Self::clear_atomic(current, mask)
        })
    }

    /// Blocks until every bit in `mask` is set, then clears and returns it.
    pub fn wait_all(&self, mask: u16) -> u16 {
        enum Step {
            Ready,
            Blocked,
        }

        let step = self.with_inner(|inner| {
            let current = inner.active.expect("wait_all called with no active thread");
            if current.flags_word.get() & mask == mask {
                Step::Ready
            } else {
                current.waited_flags.set(mask);
                inner.set_status(current, ThreadStatus::FlagBlockedAll);
                Step::Blocked
            }
        });
        if let Step::Blocked = step {
            P::yield_higher();
        }

        self.with_inner(|inner| {
            let current = inner.active.expect("wait_all called with no active thread");
            Self::clear_atomic(current, mask)
        })
    }

    /// Blocks until at least one bit in `mask` is set, then clears and
    /// returns only the lowest set bit of the match.
    pub fn wait_one(&self, mask: u16) -> u16 {
        self.wait_any_blocked(mask);
        self.with_inner(|inner| {
            let current = inner.active.expect("wait_one called with no active thread");
            let set = current.flags_word.get() & mask;
            let isolated = set & set.wrapping_neg();
            Self::clear_atomic(current, isolated)
        })
    }

    /// Non-blocking form of [`Kernel::wait_any`]: fails instead of blocking
    /// if no bit in `mask` is currently set.
    pub fn try_wait_any(&self, mask: u16) -> Result<u16, FlagsWouldBlock> {
        self.with_inner(|inner| {
            let current = inner.active.expect("try_wait_any called with no active thread");
            if current.flags_word.get() & mask == 0 {
                return Err(FlagsWouldBlock);
            }
            Ok(Self::clear_atomic(current, mask))
        })
    }

    /// Non-blocking form of [`Kernel::wait_all`]: fails instead of blocking
    /// unless every bit in `mask` is currently set.
    pub fn try_wait_all(&self, mask: u16) -> Result<u16, FlagsWouldBlock> {
        self.with_inner(|inner| {
            let current = inner.active.expect("try_wait_all called with no active thread");
            if current.flags_word.get() & mask != mask {
                return Err(FlagsWouldBlock);
            }
            Ok(Self::clear_atomic(current, mask))
        })
    }

    fn wait_any_blocked(&self, mask: u16) {
        enum Step {
            Ready,
            Blocked,
        }

        let step = self.with_inner(|inner| {
            let current = inner.active.expect("wait called with no active thread");
            if current.flags_word.get() & mask != 0 {
                Step::Ready
            } else {
                current.waited_flags.set(mask);
                inner.set_status(current, ThreadStatus::FlagBlockedAny);
                Step::Blocked
            }
        });
        if let Step::Blocked = step {
            P::yield_higher();
        }
    }

    fn clear_atomic(thread: &Tcb<P>, mask: u16) -> u16 {
        let cleared = thread.flags_word.get() & mask;
        thread.flags_word.set(thread.flags_word.get() & !cleared);
        cleared
    }

    /// Whether setting a flag bit would satisfy `thread`'s current wait,
    /// and if so, admits it back onto its run queue.
    fn wake_if_satisfied(inner: &mut Inner<P, PRIO, MAXTHREADS>, thread: &'static Tcb<P>) -> bool {
        let mask = thread.waited_flags.get();
        let satisfied = match thread.status() {
            ThreadStatus::FlagBlockedAny => thread.flags_word.get() & mask != 0,
            ThreadStatus::FlagBlockedAll => thread.flags_word.get() & mask == mask,
            _ => false,
        };
        if satisfied {
            log::trace!("{} wakes on flags {:#06x}", thread.name, mask);
            inner.set_status(thread, ThreadStatus::Pending);
        }
        satisfied
    }
}
