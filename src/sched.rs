//! The scheduler: thread table, per-priority run queues, and the
//! process-wide [`Kernel`] handle every primitive in this crate operates
//! through.
//!
//! There is no mutable global inside this crate. An embedding application
//! owns a `Kernel` value — typically as a `static` — and passes a reference
//! to it wherever a primitive is used, per the "process-wide, lazily
//! initialized state handle" shape this design favors over a
//! compile-time-registered singleton.

use core::cell::RefCell;
use core::ptr::NonNull;

use crate::error::{SpawnError, UnknownThread, WakeupOutcome};
use crate::msg::Message;
use crate::port::{IrqGuard, Port};
use crate::state::ThreadStatus;
use crate::task::{Pid, SpawnFlags, Tcb, PID_UNDEF};
use crate::utils::{CircularList, PrioBitmap, PriorityBitmap};

/// What, if anything, a kernel operation wants done once its critical
/// section has been released. Every primitive that may need to switch
/// threads follows the original's discipline of restoring interrupts
/// *before* poking the arch layer, instead of calling it while still
/// holding the lock.
pub(crate) enum PostAction {
    None,
    YieldHigher,
}

pub(crate) struct Inner<P: Port + 'static, const PRIO: usize, const MAXTHREADS: usize> {
    threads: [Option<&'static Tcb<P>>; MAXTHREADS],
    runqueue: [CircularList<Tcb<P>>; PRIO],
    bitmap: PriorityBitmap<PRIO>,
    pub(crate) active: Option<&'static Tcb<P>>,
    pub(crate) context_switch_request: bool,
}

impl<P: Port + 'static, const PRIO: usize, const MAXTHREADS: usize> Inner<P, PRIO, MAXTHREADS> {
    fn new() -> Self {
        Self {
            threads: [None; MAXTHREADS],
            runqueue: core::array::from_fn(|_| CircularList::new()),
            bitmap: PriorityBitmap::new(),
            active: None,
            context_switch_request: false,
        }
    }

    pub(crate) fn lookup(&self, pid: Pid) -> Option<&'static Tcb<P>> {
        if pid == PID_UNDEF || pid as usize > MAXTHREADS {
            return None;
        }
        self.threads[pid as usize - 1]
    }

    pub(crate) fn admit(&mut self, pid: Pid, tcb: &'static Tcb<P>) {
        self.threads[pid as usize - 1] = Some(tcb);
    }

    pub(crate) fn retire(&mut self, pid: Pid) {
        self.threads[pid as usize - 1] = None;
    }

    pub(crate) fn free_pid(&self) -> Option<Pid> {
        (1..=MAXTHREADS).find(|&p| self.threads[p - 1].is_none()).map(|p| p as Pid)
    }

    /// Links `tcb` into its priority's run queue and sets the bitmap bit.
    fn push_runnable(&mut self, tcb: &'static Tcb<P>) {
        let prio = tcb.priority as usize;
        // Safety: `tcb` is `'static` and was not already linked anywhere
        // else (callers only push a thread that is transitioning into a
        // runnable status, and invariant (3) holds throughout this crate).
        unsafe { self.runqueue[prio].push_back(NonNull::from(tcb)) };
        self.bitmap.set(prio);
    }

    /// Unlinks `tcb` from its priority's run queue, clearing the bitmap bit
    /// if that queue becomes empty.
    fn pop_runnable(&mut self, tcb: &'static Tcb<P>) {
        let prio = tcb.priority as usize;
        // Safety: `tcb` is currently linked in `runqueue[prio]` (callers
        // only pop a thread that is transitioning out of a runnable
        // status).
        unsafe {
            self.runqueue[prio].remove(NonNull::from(tcb));
            if self.runqueue[prio].is_empty() {
                self.bitmap.clear(prio);
            }
        }
    }

    /// The only legal way to change a thread's status: keeps the run queues
    /// and bitmap consistent with the new status (invariants 1 and 2).
    pub(crate) fn set_status(&mut self, tcb: &'static Tcb<P>, new: ThreadStatus) {
        let old = tcb.status();
        if old == new {
            return;
        }
        log::trace!("{} ({:?}) -> {:?}", tcb.name, old, new);
        match (old.is_runnable(), new.is_runnable()) {
            (false, true) => {
                tcb.set_status_field(new);
                self.push_runnable(tcb);
            }
            (true, false) => {
                self.pop_runnable(tcb);
                tcb.set_status_field(new);
            }
            _ => tcb.set_status_field(new),
        }
    }

    /// The highest-priority runnable thread, via the bitmap's O(1)
    /// lowest-set-bit scan.
    fn pick_next(&self) -> Option<&'static Tcb<P>> {
        let prio = self.bitmap.find_set()?;
        // Safety: the bitmap bit being set means `runqueue[prio]` is
        // non-empty and every node in it is a still-valid `'static` `Tcb`.
        let head = unsafe { self.runqueue[prio].head() }?;
        Some(unsafe { &*head.as_ptr() })
    }
}

/// The kernel's coordination engine: `PRIO` priority levels (`<= 32`), up to
/// `MAXTHREADS` threads, built on a `Port` for everything architecture
/// specific.
pub struct Kernel<P: Port + 'static, const PRIO: usize, const MAXTHREADS: usize> {
    inner: critical_section::Mutex<RefCell<Option<Inner<P, PRIO, MAXTHREADS>>>>,
}

// Safety: every access to `inner` goes through `with_inner`, which only ever
// runs with interrupts disabled (`IrqGuard`/`critical_section::Mutex`). On
// the single-core targets this crate runs on, that's the same exclusion
// `Sync` needs: no two cores, and no interrupt handler, can observe `Inner`
// concurrently with another access. `Inner` itself is `!Sync` only because
// it's built from `Cell`s and raw `&'static Tcb` references meant to be
// handed across an IRQ boundary, not because it's ever truly shared without
// that discipline already holding.
unsafe impl<P: Port + 'static, const PRIO: usize, const MAXTHREADS: usize> Sync for Kernel<P, PRIO, MAXTHREADS> {}

impl<P: Port + 'static, const PRIO: usize, const MAXTHREADS: usize> Kernel<P, PRIO, MAXTHREADS> {
    const _ASSERT_PRIO_FITS: () = assert!(PRIO <= 32, "PRIORITY_LEVELS must be <= 32");
    const _ASSERT_MAXTHREADS_FITS: () =
        assert!(MAXTHREADS < crate::task::PID_ISR as usize, "MAXTHREADS leaves no room for PID_ISR");

    /// Creates an uninitialized kernel. Cheap and `const`, so it can be
    /// stored directly in a `static`; the thread table and run queues are
    /// built lazily on first use.
    pub const fn new() -> Self {
        let () = Self::_ASSERT_PRIO_FITS;
        let () = Self::_ASSERT_MAXTHREADS_FITS;
        Self {
            inner: critical_section::Mutex::new(RefCell::new(None)),
        }
    }

    /// Runs `f` with exclusive, interrupt-disabled access to the kernel's
    /// state, initializing it first if this is the first call.
    pub(crate) fn with_inner<R>(&self, f: impl FnOnce(&mut Inner<P, PRIO, MAXTHREADS>) -> R) -> R {
        let _guard = IrqGuard::acquire();
        // Safety: `_guard` proves interrupts are disabled for exactly the
        // scope `cs` is used in below.
        let cs = unsafe { critical_section::CriticalSection::new() };
        let cell = self.inner.borrow(cs);
        let mut inner = cell.borrow_mut();
        let inner = inner.get_or_insert_with(Inner::new);
        f(inner)
    }

    pub(crate) fn run_post_action(&self, action: PostAction) {
        if let PostAction::YieldHigher = action {
            P::yield_higher();
        }
    }

    /// Requests that the highest-priority runnable thread take the CPU.
    /// From thread context this yields synchronously (the original's
    /// `ThreadScheduler::context_switch`); from an ISR it only arms the
    /// deferred switch honored by [`Kernel::end_of_isr`].
    pub(crate) fn context_switch(&self, candidate_priority: u8) {
        let action = self.with_inner(|inner| {
            let should_switch = match inner.active {
                None => true,
                Some(active) => {
                    !active.status().is_runnable() || (candidate_priority as usize) < active.priority as usize
                }
            };
            if !should_switch {
                return PostAction::None;
            }
            if P::in_isr() {
                inner.context_switch_request = true;
                PostAction::None
            } else {
                PostAction::YieldHigher
            }
        });
        self.run_post_action(action);
    }

    /// Carves a thread control block out of `stack` and admits it to the
    /// scheduler. Installs a bounded message queue when `msg_queue` is
    /// given: `(slots, size_exp)` is a backing array of `1 << size_exp`
    /// message slots.
    ///
    /// # Safety
    /// - `stack` must not be referenced by anything else for as long as the
    ///   thread lives.
    /// - If `msg_queue` is `Some((slots, size_exp))`, `slots` must point to
    ///   `1 << size_exp` valid, writable, otherwise-unreferenced `Message`
    ///   slots with the same lifetime as `stack`.
    /// - `entry` must be a valid entry point for the configured `Port`.
    pub unsafe fn spawn(
        &self,
        stack: &'static mut [u8],
        entry: unsafe extern "C" fn(usize) -> !,
        arg: usize,
        name: &'static str,
        priority: u8,
        flags: SpawnFlags,
        msg_queue: Option<(*mut Message, u32)>,
    ) -> Result<&'static Tcb<P>, SpawnError> {
        if priority as usize >= PRIO {
            return Err(SpawnError::BadPriority);
        }

        let (tcb, action) = self.with_inner(|inner| -> Result<_, SpawnError> {
            let pid = inner.free_pid().ok_or(SpawnError::NoFreePid)?;

            // Safety: delegated to this function's own safety contract.
            let tcb = Tcb::carve(stack, entry, arg, name, priority, pid, flags, msg_queue)?;
            let tcb: &'static Tcb<P> = tcb;
            inner.admit(pid, tcb);
            log::trace!("created {} (pid {}, priority {})", tcb.name, pid, priority);

            let action = if tcb.status() == ThreadStatus::Pending {
                inner.push_runnable(tcb);
                if flags.contains(SpawnFlags::WITHOUT_YIELD) {
                    PostAction::None
                } else {
                    match inner.active {
                        Some(active) if (priority as usize) >= active.priority as usize => PostAction::None,
                        _ if P::in_isr() => {
                            inner.context_switch_request = true;
                            PostAction::None
                        }
                        _ => PostAction::YieldHigher,
                    }
                }
            } else {
                PostAction::None
            };

            Ok((tcb, action))
        })?;

        self.run_post_action(action);
        Ok(tcb)
    }

    /// Picks the highest-priority runnable thread and makes it the active
    /// one. Called from the context-switch trap; the caller reads
    /// [`Kernel::active_stack_pointer`] afterward to know what to restore.
    pub fn run(&self) {
        self.with_inner(|inner| {
            inner.context_switch_request = false;
            let Some(next) = inner.pick_next() else {
                return;
            };
            if let Some(active) = inner.active {
                if core::ptr::eq(active, next) {
                    return;
                }
                if active.status() == ThreadStatus::Running {
                    inner.set_status(active, ThreadStatus::Pending);
                }
            }
            inner.set_status(next, ThreadStatus::Running);
            next.stats.schedule_count.set(next.stats.schedule_count.get() + 1);
            inner.active = Some(next);
        });
    }

    /// The active thread's saved machine context, for the context-switch
    /// trap to restore after calling [`Kernel::run`].
    pub fn active_stack_pointer(&self) -> Option<P::StackPointer> {
        self.with_inner(|inner| inner.active.map(|t| t.stack_pointer.get()))
    }

    pub fn active_pid(&self) -> Pid {
        self.with_inner(|inner| inner.active.map_or(PID_UNDEF, |t| t.pid))
    }

    pub fn thread(&self, pid: Pid) -> Option<&'static Tcb<P>> {
        self.with_inner(|inner| inner.lookup(pid))
    }

    /// Round-robins within the active thread's own priority level, then
    /// yields to whatever is now at the front (possibly the same thread, if
    /// it was alone at that priority).
    pub fn yield_now(&self) {
        self.with_inner(|inner| {
            if let Some(active) = inner.active {
                // Safety: the run queue's nodes are all live `'static`
                // `Tcb`s.
                unsafe { inner.runqueue[active.priority as usize].rotate() };
            }
        });
        P::yield_higher();
    }

    /// Puts the calling thread to sleep. A no-op in ISR context, since
    /// there is no "calling thread" there.
    pub fn sleep(&self) {
        if P::in_isr() {
            return;
        }
        self.with_inner(|inner| {
            if let Some(active) = inner.active {
                inner.set_status(active, ThreadStatus::Sleeping);
            }
        });
        P::yield_higher();
    }

    /// Wakes a sleeping thread. Mirrors the original's three-way return:
    /// woken, already-runnable (a no-op), or no such thread.
    pub fn wakeup(&self, pid: Pid) -> Result<WakeupOutcome, UnknownThread> {
        enum Woke {
            Yes(u8),
            No,
        }
        let woke = self.with_inner(|inner| -> Result<Woke, UnknownThread> {
            let tcb = inner.lookup(pid).ok_or(UnknownThread)?;
            if tcb.status() != ThreadStatus::Sleeping {
                return Ok(Woke::No);
            }
            inner.set_status(tcb, ThreadStatus::Pending);
            Ok(Woke::Yes(tcb.priority))
        })?;
        match woke {
            Woke::No => Ok(WakeupOutcome::NotSleeping),
            Woke::Yes(priority) => {
                self.context_switch(priority);
                Ok(WakeupOutcome::Woken)
            }
        }
    }

    /// Terminates a thread. If it was the active thread, picks a new one
    /// and yields to it; the caller must not assume control returns if it
    /// terminated itself this way (prefer [`Kernel::exit`] for that case,
    /// which never returns).
    pub fn terminate(&self, pid: Pid) -> Result<(), UnknownThread> {
        let was_active = self.with_inner(|inner| -> Result<bool, UnknownThread> {
            let tcb = inner.lookup(pid).ok_or(UnknownThread)?;
            inner.set_status(tcb, ThreadStatus::Stopped);
            inner.retire(pid);
            let was_active = inner.active.is_some_and(|a| a.pid == pid);
            if was_active {
                inner.active = None;
            }
            Ok(was_active)
        })?;
        if was_active {
            self.run();
            P::yield_higher();
        }
        Ok(())
    }

    /// Terminates the calling thread and switches away; never returns.
    pub fn exit(&self) -> ! {
        self.with_inner(|inner| {
            if let Some(active) = inner.active {
                inner.set_status(active, ThreadStatus::Stopped);
                inner.retire(active.pid);
            }
            inner.active = None;
        });
        self.run();
        match self.active_stack_pointer() {
            // Safety: this stack pointer was produced by `run()` picking a
            // live, previously-initialized thread.
            Some(sp) => unsafe { P::switch_context_exit(sp) },
            None => panic!("exit: no runnable thread left to switch to"),
        }
    }

    /// Honors a deferred context-switch request left by an ISR. Called from
    /// the port's interrupt epilogue.
    pub fn end_of_isr(&self) {
        let requested = self.with_inner(|inner| inner.context_switch_request);
        if requested {
            P::yield_higher();
        }
    }
}

impl<P: Port + 'static, const PRIO: usize, const MAXTHREADS: usize> Default for Kernel<P, PRIO, MAXTHREADS> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    //! Exercises the scheduler's bookkeeping directly rather than through a
    //! real context switch: `TestPort::yield_higher` just counts calls, and
    //! tests call [`Kernel::run`] themselves afterward the way a real
    //! context-switch trap would. This verifies the state machine (who's
    //! runnable, who gets picked, what a sleep/wakeup/terminate does to
    //! status) independently of any target's actual register-switching
    //! code, which lives in a board support crate this one doesn't depend on.

    use super::*;
    use crate::SendOutcome;
    use std::boxed::Box;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Debug)]
    struct TestPort;

    static IN_ISR: AtomicBool = AtomicBool::new(false);
    static YIELD_COUNT: AtomicUsize = AtomicUsize::new(0);

    impl Port for TestPort {
        type StackPointer = usize;

        unsafe fn stack_init(
            _entry: unsafe extern "C" fn(usize) -> !,
            _arg: usize,
            stack_start: *mut u8,
            _stack_size: usize,
        ) -> Self::StackPointer {
            stack_start as usize
        }

        fn in_isr() -> bool {
            IN_ISR.load(Ordering::SeqCst)
        }

        fn yield_higher() {
            YIELD_COUNT.fetch_add(1, Ordering::SeqCst);
        }

        fn trigger_pendsv() {
            YIELD_COUNT.fetch_add(1, Ordering::SeqCst);
        }

        unsafe fn switch_context_exit(_next: Self::StackPointer) -> ! {
            panic!("switch_context_exit called in a test");
        }
    }

    const STACK_SIZE: usize = 1024;

    unsafe extern "C" fn noop_entry(_arg: usize) -> ! {
        loop {}
    }

    fn new_kernel() -> Kernel<TestPort, 4, 8> {
        Kernel::new()
    }

    fn spawn(kernel: &Kernel<TestPort, 4, 8>, priority: u8, name: &'static str) -> &'static Tcb<TestPort> {
        let stack = Box::leak(Box::new([0u8; STACK_SIZE]));
        // Safety: `stack` is freshly leaked and referenced nowhere else;
        // `noop_entry` is a valid entry point for `TestPort`.
        unsafe {
            kernel
                .spawn(stack, noop_entry, 0, name, priority, SpawnFlags::WITHOUT_YIELD, None)
                .expect("spawn should succeed")
        }
    }

    /// Like [`spawn`] but installs a bounded message queue of `1 <<
    /// size_exp` slots.
    fn spawn_with_queue(kernel: &Kernel<TestPort, 4, 8>, priority: u8, name: &'static str, size_exp: u32) -> &'static Tcb<TestPort> {
        let stack = Box::leak(Box::new([0u8; STACK_SIZE]));
        let slots = Box::leak(Box::new([Message::empty(); 4]));
        // Safety: `stack` and `slots` are freshly leaked and referenced
        // nowhere else; `slots` holds at least `1 << size_exp` slots since
        // callers only ask for `size_exp <= 2`.
        unsafe {
            kernel
                .spawn(
                    stack,
                    noop_entry,
                    0,
                    name,
                    priority,
                    SpawnFlags::WITHOUT_YIELD,
                    Some((slots.as_mut_ptr(), size_exp)),
                )
                .expect("spawn should succeed")
        }
    }

    #[test]
    fn schedules_highest_priority_runnable_thread() {
        let kernel = new_kernel();
        let low = spawn(&kernel, 3, "low");
        let high = spawn(&kernel, 1, "high");
        kernel.run();
        assert_eq!(kernel.active_pid(), high.pid);
        kernel.terminate(high.pid).unwrap();
        kernel.run();
        assert_eq!(kernel.active_pid(), low.pid);
    }

    #[test]
    fn equal_priority_threads_round_robin() {
        let kernel = new_kernel();
        let a = spawn(&kernel, 2, "a");
        let b = spawn(&kernel, 2, "b");
        kernel.run();
        assert_eq!(kernel.active_pid(), a.pid);
        kernel.yield_now();
        kernel.run();
        assert_eq!(kernel.active_pid(), b.pid);
    }

    #[test]
    fn sleep_and_wakeup_round_trip() {
        let kernel = new_kernel();
        let t = spawn(&kernel, 1, "t");
        kernel.run();
        assert_eq!(kernel.active_pid(), t.pid);
        kernel.sleep();
        assert_eq!(t.status(), ThreadStatus::Sleeping);
        assert_eq!(kernel.wakeup(t.pid).unwrap(), WakeupOutcome::Woken);
        assert_eq!(t.status(), ThreadStatus::Pending);
        assert_eq!(kernel.wakeup(t.pid).unwrap(), WakeupOutcome::NotSleeping);
    }

    #[test]
    fn spawn_rejects_out_of_range_priority() {
        let kernel = new_kernel();
        let stack = Box::leak(Box::new([0u8; STACK_SIZE]));
        // Safety: leaked, unreferenced elsewhere.
        let err = unsafe {
            kernel
                .spawn(stack, noop_entry, 0, "bad", 9, SpawnFlags::empty(), None)
                .unwrap_err()
        };
        assert_eq!(err, SpawnError::BadPriority);
    }

    #[test]
    fn wakeup_unknown_thread_errors() {
        let kernel = new_kernel();
        assert_eq!(kernel.wakeup(42).unwrap_err(), UnknownThread);
    }

    #[test]
    fn terminate_switches_away_from_the_active_thread() {
        let kernel = new_kernel();
        let a = spawn(&kernel, 1, "a");
        let b = spawn(&kernel, 2, "b");
        kernel.run();
        assert_eq!(kernel.active_pid(), a.pid);
        kernel.terminate(a.pid).unwrap();
        assert_eq!(kernel.active_pid(), b.pid);
        assert!(kernel.thread(a.pid).is_none());
    }

    // --- Mutex --------------------------------------------------------
    //
    // Exercised here rather than in `mutex.rs` because that's where
    // `TestPort` lives.

    use crate::mutex::Mutex;

    #[test]
    fn mutex_contention_wakes_the_highest_priority_waiter() {
        let kernel = new_kernel();
        let mutex = Mutex::<TestPort>::new();

        let holder = spawn(&kernel, 3, "holder");
        kernel.run();
        assert_eq!(kernel.active_pid(), holder.pid);
        mutex.lock(&kernel);
        assert!(mutex.is_locked());

        // Higher priority than `holder`, so becomes active once runnable.
        let waiter = spawn(&kernel, 1, "waiter");
        kernel.run();
        assert_eq!(kernel.active_pid(), waiter.pid);

        mutex.lock(&kernel);
        assert_eq!(waiter.status(), ThreadStatus::MutexBlocked);
        assert_eq!(mutex.peek(&kernel), Some(waiter.pid));

        // What the real context-switch trap would do once `yield_higher`
        // actually suspended `waiter`: run whoever is left runnable.
        kernel.run();
        assert_eq!(kernel.active_pid(), holder.pid);

        mutex.unlock(&kernel);
        assert_eq!(waiter.status(), ThreadStatus::Pending);
        kernel.run();
        assert_eq!(kernel.active_pid(), waiter.pid);
        assert!(mutex.is_locked());
    }

    #[test]
    fn try_lock_does_not_block() {
        let kernel = new_kernel();
        let mutex = Mutex::<TestPort>::new();
        let holder = spawn(&kernel, 2, "holder");
        kernel.run();
        assert_eq!(kernel.active_pid(), holder.pid);
        assert!(mutex.try_lock(&kernel));
        assert!(!mutex.try_lock(&kernel));
        assert_eq!(holder.status(), ThreadStatus::Running);
    }

    // --- Messages -------------------------------------------------------

    use crate::error::IpcError;
    use crate::msg::Content;

    #[test]
    fn try_send_queues_when_receiver_is_not_waiting() {
        let kernel = new_kernel();
        let receiver = spawn_with_queue(&kernel, 2, "receiver", 2);
        let sender = spawn(&kernel, 1, "sender");
        kernel.run();
        assert_eq!(kernel.active_pid(), sender.pid);

        let msg = Message {
            sender: PID_UNDEF,
            msg_type: 3,
            content: Content { value: 9 },
        };
        assert_eq!(kernel.try_send(receiver.pid, msg).unwrap(), SendOutcome::Enqueued);

        kernel.terminate(sender.pid).unwrap();
        assert_eq!(kernel.active_pid(), receiver.pid);
        let received = kernel.receive(true).unwrap();
        assert_eq!(received.msg_type, 3);
        assert_eq!(unsafe { received.content.value }, 9);
    }

    #[test]
    fn try_send_fails_once_the_queue_is_full() {
        let kernel = new_kernel();
        let receiver = spawn_with_queue(&kernel, 2, "receiver", 0);
        let _sender = spawn(&kernel, 1, "sender");
        kernel.run();

        let msg = Message {
            sender: PID_UNDEF,
            msg_type: 1,
            content: Content { value: 1 },
        };
        assert_eq!(kernel.try_send(receiver.pid, msg).unwrap(), SendOutcome::Enqueued);
        assert_eq!(kernel.try_send(receiver.pid, msg).unwrap_err(), IpcError::WouldBlock);
    }

    #[test]
    fn send_delivers_directly_into_an_already_blocked_receiver() {
        let kernel = new_kernel();
        let receiver = spawn_with_queue(&kernel, 2, "receiver", 1);
        let sender = spawn(&kernel, 1, "sender");
        kernel.run();
        assert_eq!(kernel.active_pid(), sender.pid);

        // What `receiver` would look like after blocking inside its own
        // `receive(true)` call.
        let mut inbox = Message::empty();
        kernel.with_inner(|inner| {
            receiver.wait_data.set(&mut inbox as *mut Message);
            inner.set_status(receiver, ThreadStatus::ReceiveBlocked);
        });

        let msg = Message {
            sender: PID_UNDEF,
            msg_type: 7,
            content: Content { value: 42 },
        };
        let outcome = kernel.send(receiver.pid, msg).unwrap();
        assert_eq!(outcome, SendOutcome::Delivered);
        assert_eq!(receiver.status(), ThreadStatus::Pending);
        assert_eq!(inbox.msg_type, 7);
        assert_eq!(unsafe { inbox.content.value }, 42);
        assert_eq!(inbox.sender, sender.pid);
    }

    #[test]
    fn reply_writes_through_the_shared_envelope() {
        let kernel = new_kernel();
        let client = spawn_with_queue(&kernel, 2, "client", 1);
        let server = spawn(&kernel, 1, "server");
        kernel.run();
        assert_eq!(kernel.active_pid(), server.pid);

        // What `client` would look like after blocking inside its own
        // `send_receive` call, with `envelope` as its own stack-local reply
        // destination.
        let mut envelope = Message {
            sender: client.pid,
            msg_type: 1,
            content: Content { value: 0 },
        };
        kernel.with_inner(|inner| {
            client.wait_data.set(&mut envelope as *mut Message);
            inner.set_status(client, ThreadStatus::ReplyBlocked);
        });

        let reply_msg = Message {
            sender: PID_UNDEF,
            msg_type: 2,
            content: Content { value: 99 },
        };
        kernel.reply(&envelope, reply_msg).unwrap();

        assert_eq!(client.status(), ThreadStatus::Pending);
        assert_eq!(envelope.msg_type, 2);
        assert_eq!(unsafe { envelope.content.value }, 99);
        assert_eq!(envelope.sender, server.pid);
    }

    // --- Thread flags -----------------------------------------------------

    #[cfg(feature = "thread-flags")]
    #[test]
    fn set_flags_wakes_a_matching_flag_blocked_any_wait() {
        let kernel = new_kernel();
        let waiter = spawn(&kernel, 1, "waiter");
        kernel.run();
        kernel.with_inner(|inner| {
            waiter.waited_flags.set(0b0010);
            inner.set_status(waiter, ThreadStatus::FlagBlockedAny);
        });

        kernel.set_flags(waiter.pid, 0b0010).unwrap();
        assert_eq!(waiter.status(), ThreadStatus::Pending);
        assert_eq!(waiter.flags_word.get(), 0b0010);
    }

    #[cfg(feature = "thread-flags")]
    #[test]
    fn set_flags_does_not_wake_an_unrelated_wait() {
        let kernel = new_kernel();
        let waiter = spawn(&kernel, 1, "waiter");
        kernel.run();
        kernel.with_inner(|inner| {
            waiter.waited_flags.set(0b0001);
            inner.set_status(waiter, ThreadStatus::FlagBlockedAny);
        });

        kernel.set_flags(waiter.pid, 0b0010).unwrap();
        assert_eq!(waiter.status(), ThreadStatus::FlagBlockedAny);
    }

    #[cfg(feature = "thread-flags")]
    #[test]
    fn try_wait_any_does_not_block() {
        let kernel = new_kernel();
        let t = spawn(&kernel, 1, "t");
        kernel.run();
        assert!(kernel.try_wait_any(0b1).is_err());
        t.flags_word.set(0b1);
        assert_eq!(kernel.try_wait_any(0b1).unwrap(), 0b1);
        assert_eq!(t.flags_word.get(), 0);
    }

    #[cfg(feature = "thread-flags")]
    #[test]
    fn wait_one_isolates_the_lowest_set_bit() {
        let kernel = new_kernel();
        let t = spawn(&kernel, 1, "t");
        kernel.run();
        t.flags_word.set(0b0110);
        assert_eq!(kernel.wait_one(0b0110), 0b0010);
        assert_eq!(t.flags_word.get(), 0b0100);
    }

    // --- Event queue --------------------------------------------------

    #[cfg(feature = "thread-event")]
    use crate::event::{Event, EventQueue, FLAG_EVENT};

    #[cfg(feature = "thread-event")]
    #[test]
    fn event_queue_post_and_get_round_trip() {
        let kernel = new_kernel();
        let consumer = spawn(&kernel, 1, "consumer");
        kernel.run();

        let queue: EventQueue<u32> = EventQueue::new();
        let event = Box::leak(Box::new(Event::new(7u32)));
        assert!(queue.get(&kernel).is_none());

        queue.post(event, consumer.pid, &kernel).unwrap();
        assert_eq!(consumer.flags_word.get() & FLAG_EVENT, FLAG_EVENT);

        let popped = queue.get(&kernel).unwrap();
        assert_eq!(popped.payload, 7);
        assert!(!popped.is_queued());
        assert!(queue.get(&kernel).is_none());
    }

    #[cfg(feature = "thread-event")]
    #[test]
    fn event_queue_wait_drains_a_posted_event() {
        let kernel = new_kernel();
        let consumer = spawn(&kernel, 1, "consumer");
        kernel.run();

        let queue: EventQueue<u32> = EventQueue::new();
        let event = Box::leak(Box::new(Event::new(11u32)));
        queue.post(event, consumer.pid, &kernel).unwrap();

        let woken = queue.wait(&kernel);
        assert_eq!(woken.payload, 11);
    }
}
