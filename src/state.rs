//! Thread status: the enum, its ordering invariant, and the context checks
//! primitives use to reject calls made from the wrong place.

use core::fmt;

/// A thread's place in its lifecycle.
///
/// The discriminants are declaration-ordered on purpose: every status below
/// [`Running`](ThreadStatus::Running) is "blocked" and every status from
/// `Running` up is "runnable" (see [`ThreadStatus::is_runnable`]). Nothing
/// in this crate compares two statuses for anything other than that split,
/// but the ordering has to hold for `>=` to mean what it says.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ThreadStatus {
    Stopped,
    Sleeping,
    MutexBlocked,
    ReceiveBlocked,
    SendBlocked,
    ReplyBlocked,
    FlagBlockedAny,
    FlagBlockedAll,
    /// Reserved for status-space compatibility with layered collaborators;
    /// the core itself never produces this.
    MboxBlocked,
    /// Reserved, see [`ThreadStatus::MboxBlocked`].
    CondBlocked,
    Running,
    Pending,
}

impl ThreadStatus {
    /// A thread is runnable iff it is linked into its priority's run queue,
    /// which happens exactly for [`Running`](Self::Running) and
    /// [`Pending`](Self::Pending).
    pub const fn is_runnable(self) -> bool {
        self as u8 >= Self::Running as u8
    }

    /// The fixed introspection label for this status.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Pending => "pending",
            Self::Stopped => "stopped",
            Self::Sleeping => "sleeping",
            Self::MutexBlocked => "bl mutex",
            Self::ReceiveBlocked => "bl rx",
            Self::SendBlocked => "bl send",
            Self::ReplyBlocked => "bl reply",
            Self::FlagBlockedAny => "bl flag",
            Self::FlagBlockedAll => "bl flags",
            Self::MboxBlocked | Self::CondBlocked => "unknown",
        }
    }
}

impl fmt::Display for ThreadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
