//! Event queue: an intrusive FIFO of user-owned events, notified through a
//! reserved thread-flags bit.
//!
//! An [`Event`] is just a header — a queue link plus whatever payload the
//! caller puts in it — so posting one costs nothing but a pointer write.
//! [`EventQueue::wait`] is the usual consumer loop: pop if something is
//! already queued, otherwise block on [`FLAG_EVENT`] and try again.

use core::ptr::NonNull;

use crate::error::UnknownThread;
use crate::port::Port;
use crate::sched::Kernel;
use crate::task::Pid;
use crate::utils::{CircularList, Linked};

/// Reserved bit of the thread-flags word used to signal "an event queue you
/// wait on has something for you". Callers should not set or wait on this
/// bit directly; go through [`EventQueue`] instead.
pub const FLAG_EVENT: u16 = 1 << 15;

/// An intrusive queue node carrying a caller-defined `payload`.
///
/// The core only ever touches the link; `payload` is opaque to it.
pub struct Event<T> {
    link: core::cell::Cell<Option<NonNull<Event<T>>>>,
    pub payload: T,
}

impl<T> Event<T> {
    pub const fn new(payload: T) -> Self {
        Self {
            link: core::cell::Cell::new(None),
            payload,
        }
    }

    /// Whether this event is currently linked into some queue.
    pub fn is_queued(&self) -> bool {
        self.link.get().is_some()
    }

    /// Caller-side acknowledgement that this event is no longer linked into
    /// any queue (e.g. after handling one returned by [`EventQueue::get`],
    /// which already clears the link on pop, this is only needed if the
    /// event was otherwise removed from bookkeeping by hand).
    pub fn release(&self) {
        self.link.set(None);
    }
}

impl<T> Linked for Event<T> {
    fn link(&self) -> &core::cell::Cell<Option<NonNull<Self>>> {
        &self.link
    }
}

/// A FIFO of `&'static Event<T>`s, paired with a target thread notified via
/// [`FLAG_EVENT`] whenever something is posted.
pub struct EventQueue<T> {
    list: CircularList<Event<T>>,
}

impl<T> EventQueue<T> {
    pub const fn new() -> Self {
        Self { list: CircularList::new() }
    }

    pub fn pending<P: Port + 'static, const PRIO: usize, const MAXTHREADS: usize>(&self, kernel: &Kernel<P, PRIO, MAXTHREADS>) -> usize {
        kernel.with_inner(|_inner| unsafe { self.list.count() })
    }

    pub fn peek<P: Port + 'static, const PRIO: usize, const MAXTHREADS: usize>(
        &self,
        kernel: &Kernel<P, PRIO, MAXTHREADS>,
    ) -> Option<&'static Event<T>> {
        kernel
            .with_inner(|_inner| unsafe { self.list.head() })
            .map(|p| unsafe { &*p.as_ptr() })
    }

    /// Appends `event` to the tail (a no-op if it's already queued) and
    /// raises [`FLAG_EVENT`] on `target`.
    pub fn post<P: Port + 'static, const PRIO: usize, const MAXTHREADS: usize>(
        &self,
        event: &'static Event<T>,
        target: Pid,
        kernel: &Kernel<P, PRIO, MAXTHREADS>,
    ) -> Result<(), UnknownThread> {
        kernel.with_inner(|_inner| {
            if !event.is_queued() {
                // Safety: just checked it isn't linked anywhere, and
                // `event` is `'static`.
                unsafe { self.list.push_back(NonNull::from(event)) };
            }
        });
        log::trace!("posting an event to pid {}", target);
        kernel.set_flags(target, FLAG_EVENT)
    }

    /// Unlinks `event` from the queue, if it's in it.
    pub fn cancel<P: Port + 'static, const PRIO: usize, const MAXTHREADS: usize>(&self, event: &'static Event<T>, kernel: &Kernel<P, PRIO, MAXTHREADS>) {
        kernel.with_inner(|_inner| {
            // Safety: all linked events are `'static`.
            unsafe { self.list.remove(NonNull::from(event)) };
        });
    }

    /// Pops the head event without blocking, if any.
    pub fn get<P: Port + 'static, const PRIO: usize, const MAXTHREADS: usize>(
        &self,
        kernel: &Kernel<P, PRIO, MAXTHREADS>,
    ) -> Option<&'static Event<T>> {
        kernel
            .with_inner(|_inner| unsafe { self.list.pop_front() })
            .map(|p| unsafe { &*p.as_ptr() })
    }

    /// Pops the head event, blocking the caller on [`FLAG_EVENT`] until one
    /// is available.
    pub fn wait<P: Port + 'static, const PRIO: usize, const MAXTHREADS: usize>(&self, kernel: &Kernel<P, PRIO, MAXTHREADS>) -> &'static Event<T> {
        loop {
            if let Some(event) = self.get(kernel) {
                return event;
            }
            kernel.wait_any(FLAG_EVENT);
        }
    }
}

impl<T> Default for EventQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    //! Exercised end-to-end alongside the scheduler in `sched.rs`'s own
    //! test module, which has a `TestPort` to actually run threads against.
}
