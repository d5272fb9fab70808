//! A FIFO-by-priority mutual-exclusion lock.
//!
//! Unlike the algorithm this is grounded on, there is no priority-ceiling or
//! priority-inheritance protocol here: a lower-priority holder is never
//! boosted because a higher-priority thread is waiting. Waiters simply queue
//! by priority (ties broken FIFO, via [`SortedList`]) and are woken in that
//! order when the lock is released.

use core::cell::Cell;
use core::ptr::NonNull;

use crate::port::Port;
use crate::sched::{Inner, Kernel};
use crate::state::ThreadStatus;
use crate::task::{Pid, Tcb};
use crate::utils::SortedList;

/// The three states the original's `queue.next` sentinel encodes: null
/// (unlocked), a reused sentinel value (locked, nobody waiting), or a list
/// head (locked, waiters queued). Here the waiter list lives in its own
/// field, so this only needs to track which of the three states holds.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Lock {
    Unlocked,
    Locked,
    LockedWithWaiters,
}

pub struct Mutex<P: Port + 'static> {
    state: Cell<Lock>,
    waiters: SortedList<Tcb<P>>,
}

impl<P: Port + 'static> Mutex<P> {
    pub const fn new() -> Self {
        Self {
            state: Cell::new(Lock::Unlocked),
            waiters: SortedList::new(),
        }
    }

    pub fn is_locked(&self) -> bool {
        self.state.get() != Lock::Unlocked
    }

    /// The PID of the highest-priority thread currently waiting, if any.
    pub fn peek<const PRIO: usize, const MAXTHREADS: usize>(&self, kernel: &Kernel<P, PRIO, MAXTHREADS>) -> Option<Pid> {
        kernel.with_inner(|_inner| {
            if self.state.get() != Lock::LockedWithWaiters {
                return None;
            }
            // Safety: every linked waiter is a live `'static` `Tcb`.
            let head = unsafe { self.waiters.peek_front() }?;
            Some(unsafe { head.as_ref().pid })
        })
    }

    /// Locks, blocking the calling thread until the lock becomes available.
    pub fn lock<const PRIO: usize, const MAXTHREADS: usize>(&self, kernel: &Kernel<P, PRIO, MAXTHREADS>) {
        self.try_set_lock(kernel, true);
    }

    /// Locks without blocking. Returns whether the lock was acquired.
    pub fn try_lock<const PRIO: usize, const MAXTHREADS: usize>(&self, kernel: &Kernel<P, PRIO, MAXTHREADS>) -> bool {
        self.try_set_lock(kernel, false)
    }

    fn try_set_lock<const PRIO: usize, const MAXTHREADS: usize>(
        &self,
        kernel: &Kernel<P, PRIO, MAXTHREADS>,
        blocking: bool,
    ) -> bool {
        enum Step {
            Acquired,
            WouldBlock,
            Blocked,
        }

        let step = kernel.with_inner(|inner| match self.state.get() {
            Lock::Unlocked => {
                self.state.set(Lock::Locked);
                Step::Acquired
            }
            _ if !blocking => Step::WouldBlock,
            _ => {
                let current = inner.active.expect("lock() called with no active thread");
                log::trace!("{} contends a locked mutex", current.name);
                inner.set_status(current, ThreadStatus::MutexBlocked);
                // Safety: `current` is `'static` and, by invariant, not
                // linked in any other list right now.
                unsafe {
                    self.waiters.insert_by(NonNull::from(current), |t: &Tcb<P>| t.priority);
                }
                self.state.set(Lock::LockedWithWaiters);
                Step::Blocked
            }
        });

        match step {
            Step::Acquired => true,
            Step::WouldBlock => false,
            Step::Blocked => {
                P::yield_higher();
                true
            }
        }
    }

    /// Unlocks, waking and admitting the highest-priority waiter if any.
    pub fn unlock<const PRIO: usize, const MAXTHREADS: usize>(&self, kernel: &Kernel<P, PRIO, MAXTHREADS>) {
        let woken_priority = kernel.with_inner(|inner| self.unlock_locked(inner));
        if let Some(priority) = woken_priority {
            kernel.context_switch(priority);
        }
    }

    /// Atomically unlocks and puts the calling thread to sleep, as one
    /// continuous interrupt-disabled operation.
    ///
    /// This diverges from a literal reading of the algorithm it's grounded
    /// on, which restores interrupts between the unlock and the sleep (and
    /// `sleep` re-disables them): this version never gives an interrupt a
    /// window to run between "give up the lock" and "go to sleep".
    pub fn unlock_and_sleep<const PRIO: usize, const MAXTHREADS: usize>(&self, kernel: &Kernel<P, PRIO, MAXTHREADS>) {
        kernel.with_inner(|inner| {
            self.unlock_locked(inner);
            if let Some(active) = inner.active {
                inner.set_status(active, ThreadStatus::Sleeping);
            }
        });
        P::yield_higher();
    }

    fn unlock_locked<const PRIO: usize, const MAXTHREADS: usize>(&self, inner: &mut Inner<P, PRIO, MAXTHREADS>) -> Option<u8> {
        match self.state.get() {
            Lock::Unlocked => None,
            Lock::Locked => {
                self.state.set(Lock::Unlocked);
                None
            }
            Lock::LockedWithWaiters => {
                // Safety: every linked waiter is a live `'static` `Tcb`.
                let next = unsafe { self.waiters.pop_front() }.expect("LockedWithWaiters implies a waiter");
                // Safety: `next` came straight out of the waiter list.
                let thread = unsafe { &*next.as_ptr() };
                log::trace!("{} hands the mutex to waiting {}", inner.active.map_or("isr", |t| t.name), thread.name);
                inner.set_status(thread, ThreadStatus::Pending);
                self.state.set(if self.waiters.is_empty() {
                    Lock::Locked
                } else {
                    Lock::LockedWithWaiters
                });
                Some(thread.priority)
            }
        }
    }
}

impl<P: Port + 'static> Default for Mutex<P> {
    fn default() -> Self {
        Self::new()
    }
}
