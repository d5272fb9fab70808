//! Thread control blocks and in-place stack construction.
//!
//! A [`Tcb`] lives at the top of the stack memory the caller hands to
//! [`Tcb::carve`] — there is no heap, so "creating a thread" means carving
//! a control block and an initial machine context out of a buffer the
//! caller already owns, per the scheduling model's no-dynamic-memory rule.

use core::cell::Cell;
use core::mem::size_of;
use core::ptr::NonNull;

use crate::error::SpawnError;
use crate::msg::Message;
use crate::port::Port;
use crate::state::ThreadStatus;
use crate::utils::{Cib, Linked, SortedList};

/// A thread identity, stable for the thread's lifetime. `0` is reserved for
/// "no thread" and [`PID_ISR`] is reserved for messages sent from interrupt
/// context.
pub type Pid = u8;

/// No thread / not applicable.
pub const PID_UNDEF: Pid = 0;
/// Sentinel sender identity used by [`crate::msg`]'s ISR-safe entry points.
pub const PID_ISR: Pid = Pid::MAX;

bitflags::bitflags! {
    /// Flags accepted by [`crate::sched::Kernel::spawn`].
    pub struct SpawnFlags: u8 {
        /// Start the thread `Sleeping` instead of `Pending`.
        const SLEEPING = 0b001;
        /// Don't yield even if the new thread outranks the caller.
        const WITHOUT_YIELD = 0b010;
        /// Paint the whole stack with self-addresses so free space can
        /// later be measured word-by-word, instead of a single guard word.
        const STACKMARKER = 0b100;
    }
}

/// Running totals kept for introspection; not read by the scheduler itself.
#[derive(Default, Debug)]
pub struct ScheduleStats {
    pub(crate) schedule_count: Cell<u32>,
}

impl ScheduleStats {
    pub fn schedule_count(&self) -> u32 {
        self.schedule_count.get()
    }
}

/// A thread's bounded, non-allocating inbox: a [`Cib`] over a
/// caller-supplied backing array of [`Message`]s.
#[derive(Debug)]
pub(crate) struct MsgQueue {
    cib: Cell<Cib>,
    slots: *mut Message,
}

impl MsgQueue {
    /// # Safety
    /// `slots` must point to `1 << size_exp` valid, writable `Message`
    /// slots, and must stay valid for the queue's lifetime.
    unsafe fn new(slots: *mut Message, size_exp: u32) -> Self {
        Self {
            cib: Cell::new(Cib::new(size_exp)),
            slots,
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.cib.get().is_empty()
    }

    pub(crate) fn is_full(&self) -> bool {
        self.cib.get().is_full()
    }

    /// Copies `msg` into the next free slot.
    pub(crate) fn push(&self, msg: Message) -> bool {
        let mut cib = self.cib.get();
        let Some(idx) = cib.put() else {
            return false;
        };
        self.cib.set(cib);
        // Safety: `idx < capacity`, and the caller guaranteed this many
        // writable slots when the queue was constructed.
        unsafe { self.slots.add(idx).write(msg) };
        true
    }

    /// Pops the oldest message, if any.
    pub(crate) fn pop(&self) -> Option<Message> {
        let mut cib = self.cib.get();
        let idx = cib.get()?;
        self.cib.set(cib);
        // Safety: see `push`.
        Some(unsafe { self.slots.add(idx).read() })
    }
}

/// A thread control block.
///
/// Every field other than `priority`, `pid`, and `name` is mutated only
/// while the caller holds the kernel's [`IrqGuard`](crate::port::IrqGuard),
/// mirroring the original implementation's "whole operation under
/// interrupt-disable" discipline.
#[derive(Debug)]
pub struct Tcb<P: Port + 'static> {
    pub(crate) stack_pointer: Cell<P::StackPointer>,
    pub(crate) status: Cell<ThreadStatus>,
    pub priority: u8,
    pub pid: Pid,
    pub name: &'static str,

    /// The single intrusive link reused for whichever list currently holds
    /// this thread: its run queue, a mutex's waiter list, or a peer's
    /// `msg_waiters`. A thread is never in more than one of these lists at
    /// once.
    pub(crate) link: Cell<Option<NonNull<Tcb<P>>>>,

    /// Opaque pointer to whatever this thread is blocked on: the message
    /// struct a `receive` wants filled, or the one a blocked `send`/`reply`
    /// still owns.
    pub(crate) wait_data: Cell<*mut Message>,

    /// Threads blocked trying to send a message to *this* thread, ordered
    /// by priority.
    pub(crate) msg_waiters: SortedList<Tcb<P>>,

    pub(crate) msg_queue: Option<MsgQueue>,

    #[cfg(feature = "thread-flags")]
    pub(crate) flags_word: Cell<u16>,
    /// The mask passed to whichever wait call is currently blocking this
    /// thread; which of [`ThreadStatus::FlagBlockedAny`] /
    /// [`ThreadStatus::FlagBlockedAll`] it's blocked under already says
    /// which wait kind this mask belongs to.
    #[cfg(feature = "thread-flags")]
    pub(crate) waited_flags: Cell<u16>,

    stack_start: *mut u8,
    stack_size: usize,
    stackmarker: bool,

    pub stats: ScheduleStats,
}

impl<P: Port + 'static> Linked for Tcb<P> {
    fn link(&self) -> &Cell<Option<NonNull<Self>>> {
        &self.link
    }
}

impl<P: Port + 'static> Tcb<P> {
    /// Carves a `Tcb` and an initial machine context out of `stack`,
    /// following the layout the whole crate assumes: the control block sits
    /// at the (8-byte-aligned) top, and everything below it down to
    /// `stack.as_ptr()` is the thread's usable stack.
    ///
    /// `msg_queue` optionally installs a bounded inbox: `(slots, size_exp)`
    /// gives a backing array of `1 << size_exp` message slots.
    ///
    /// # Safety
    /// - `stack` must not be referenced by anything else for as long as the
    ///   returned `Tcb` is alive.
    /// - If `msg_queue` is `Some((slots, size_exp))`, `slots` must point to
    ///   `1 << size_exp` valid, writable, otherwise-unreferenced `Message`
    ///   slots with the same lifetime as `stack`.
    /// - `entry` must be a valid entry point for `P::stack_init`.
    pub unsafe fn carve(
        stack: &'static mut [u8],
        entry: unsafe extern "C" fn(usize) -> !,
        arg: usize,
        name: &'static str,
        priority: u8,
        pid: Pid,
        flags: SpawnFlags,
        msg_queue: Option<(*mut Message, u32)>,
    ) -> Result<&'static mut Tcb<P>, SpawnError> {
        let stack_start = stack.as_mut_ptr();
        let stack_len = stack.len();
        let stack_end = stack_start as usize + stack_len;

        // Align the top down to 8 bytes before reserving the TCB.
        let aligned_end = stack_end & !0x7usize;

        let tcb_size = size_of::<Tcb<P>>() as isize;

        // Stage the computation in `isize` so an undersized stack fails
        // cleanly as a negative value instead of wrapping a `usize`
        // subtraction into a huge "available" size.
        let mut usable = aligned_end as isize - stack_start as isize - tcb_size;
        if usable < 0 {
            return Err(SpawnError::StackTooSmall);
        }
        usable &= !0x7isize;
        if usable == 0 {
            return Err(SpawnError::StackTooSmall);
        }
        let usable = usable as usize;

        let tcb_addr = aligned_end - tcb_size as usize;
        let usable_start = stack_start;

        let stackmarker = flags.contains(SpawnFlags::STACKMARKER);
        if stackmarker {
            let mut word = usable_start as usize;
            let end = usable_start as usize + usable;
            while word + size_of::<usize>() <= end {
                core::ptr::write_unaligned(word as *mut usize, word);
                word += size_of::<usize>();
            }
        } else {
            core::ptr::write_unaligned(usable_start as *mut usize, usable_start as usize);
        }

        let initial_status = if flags.contains(SpawnFlags::SLEEPING) {
            ThreadStatus::Sleeping
        } else {
            ThreadStatus::Pending
        };

        let stack_pointer = P::stack_init(entry, arg, usable_start, usable);

        let msg_queue = msg_queue.map(|(slots, size_exp)| MsgQueue::new(slots, size_exp));

        let tcb_ptr = tcb_addr as *mut Tcb<P>;
        tcb_ptr.write(Tcb {
            stack_pointer: Cell::new(stack_pointer),
            status: Cell::new(initial_status),
            priority,
            pid,
            name,
            link: Cell::new(None),
            wait_data: Cell::new(core::ptr::null_mut()),
            msg_waiters: SortedList::new(),
            msg_queue,
            #[cfg(feature = "thread-flags")]
            flags_word: Cell::new(0),
            #[cfg(feature = "thread-flags")]
            waited_flags: Cell::new(0),
            stack_start: usable_start,
            stack_size: usable,
            stackmarker,
            stats: ScheduleStats::default(),
        });

        Ok(&mut *tcb_ptr)
    }

    pub fn status(&self) -> ThreadStatus {
        self.status.get()
    }

    pub(crate) fn set_status_field(&self, status: ThreadStatus) {
        self.status.set(status);
    }

    /// Bytes of stack never touched since creation, if painted with
    /// [`SpawnFlags::STACKMARKER`]; `None` if only the single guard word was
    /// written.
    pub fn stack_free(&self) -> Option<usize> {
        if !self.stackmarker {
            return None;
        }
        let mut word = self.stack_start as usize;
        let end = self.stack_start as usize + self.stack_size;
        let mut free = 0;
        while word < end {
            // Safety: `[stack_start, stack_start + stack_size)` is this
            // thread's own usable stack, painted by `carve`.
            let value = unsafe { core::ptr::read_unaligned(word as *const usize) };
            if value != word {
                break;
            }
            free += size_of::<usize>();
            word += size_of::<usize>();
        }
        Some(free)
    }

    /// Whether the single guard word at the bottom of the usable stack has
    /// been overwritten. Always `false` when painted with
    /// [`SpawnFlags::STACKMARKER`] (use [`Tcb::stack_free`] instead).
    pub fn stack_overflowed(&self) -> bool {
        if self.stackmarker {
            return false;
        }
        // Safety: see `stack_free`.
        let guard = unsafe { core::ptr::read_unaligned(self.stack_start as *const usize) };
        guard != self.stack_start as usize
    }
}
