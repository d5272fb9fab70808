//! Typed outcomes and errors.
//!
//! The reference implementation this crate is modeled on returns raw `1` /
//! `0` / `-1` integers from most entry points. Each call site here gets its
//! own small enum instead, following the narrow-enum-per-call-site style the
//! rest of this crate's dependency stack uses rather than one catch-all
//! error type; the three-way shape (succeeded / would block / hard error) is
//! preserved exactly.

/// [`Kernel::spawn`](crate::sched::Kernel::spawn) failure modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnError {
    /// `priority >= PRIORITY_LEVELS`.
    BadPriority,
    /// No PID in `1..=MAXTHREADS` is free.
    NoFreePid,
    /// The stack is too small to hold a [`Tcb`](crate::task::Tcb) plus at
    /// least one usable word after alignment.
    StackTooSmall,
}

/// [`Kernel::wakeup`](crate::sched::Kernel::wakeup) outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeupOutcome {
    /// The thread was sleeping and is now runnable.
    Woken,
    /// The thread existed but was not sleeping; no change was made.
    NotSleeping,
}

/// No thread exists with the given PID.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnknownThread;

/// [`Kernel::send`](crate::sched::Kernel::send)-family success outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Delivered directly into a receiver that was already blocked waiting.
    Delivered,
    /// Copied into the receiver's bounded queue without blocking.
    Enqueued,
    /// The call blocked and has since been woken by a matching `receive`.
    Blocked,
}

/// Failure modes shared by the message-passing entry points.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpcError {
    /// No thread exists with the given PID.
    UnknownThread,
    /// The target thread has no message queue installed.
    NoQueue,
    /// A non-blocking call could not complete immediately.
    WouldBlock,
    /// `reply` was called for a sender that is not currently
    /// `REPLY_BLOCKED`.
    NotReplyBlocked,
}

/// A non-blocking flags wait whose mask did not match immediately.
#[cfg(feature = "thread-flags")]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlagsWouldBlock;
