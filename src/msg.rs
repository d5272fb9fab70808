//! Message passing: bounded queues plus direct rendezvous delivery when a
//! receiver is already waiting.
//!
//! A blocked `send`/`receive`/`reply` works by pointing the blocked thread's
//! [`Tcb::wait_data`](crate::task::Tcb) at a [`Message`] living on its own
//! (suspended) call stack, and having the peer that unblocks it write
//! straight through that pointer. The blocked call's stack frame is never
//! actually destroyed — a context switch suspends it in place — so the
//! pointer stays valid for as long as it's needed.

use core::ptr::NonNull;

use crate::error::{IpcError, SendOutcome};
use crate::port::Port;
use crate::sched::Kernel;
use crate::state::ThreadStatus;
use crate::task::{Pid, Tcb, PID_ISR, PID_UNDEF};

/// A fixed-size message: a 16-bit application-defined type tag plus a
/// pointer-or-integer payload, the same shape a C `union` would give.
#[derive(Clone, Copy)]
pub struct Message {
    pub sender: Pid,
    pub msg_type: u16,
    pub content: Content,
}

/// The payload slot: exactly one of `ptr` or `value` is meaningful, per
/// however the two ends of the conversation agreed to use `msg_type`.
#[derive(Clone, Copy)]
pub union Content {
    pub ptr: *mut (),
    pub value: u32,
}

impl Message {
    pub const fn empty() -> Self {
        Self {
            sender: PID_UNDEF,
            msg_type: 0,
            content: Content { value: 0 },
        }
    }

    pub fn is_from_isr(&self) -> bool {
        self.sender == PID_ISR
    }
}

impl Default for Message {
    fn default() -> Self {
        Self::empty()
    }
}

impl<P: Port + 'static, const PRIO: usize, const MAXTHREADS: usize> Kernel<P, PRIO, MAXTHREADS> {
    /// Sends `msg` to `target`, blocking until it is delivered or queued.
    /// Dispatches to [`Kernel::send_from_isr`] or
    /// [`Kernel::send_to_self_queue`] when called from those contexts.
    pub fn send(&self, target: Pid, msg: Message) -> Result<SendOutcome, IpcError> {
        self.send_impl(target, msg, true)
    }

    /// Like [`Kernel::send`], but returns [`IpcError::WouldBlock`] instead
    /// of blocking when the target isn't immediately ready.
    pub fn try_send(&self, target: Pid, msg: Message) -> Result<SendOutcome, IpcError> {
        self.send_impl(target, msg, false)
    }

    fn send_impl(&self, target: Pid, msg: Message, blocking: bool) -> Result<SendOutcome, IpcError> {
        if P::in_isr() {
            return self.send_from_isr(target, msg);
        }
        if self.active_pid() == target {
            return self.send_to_self_queue(msg);
        }
        let mut msg = msg;
        self.deliver_or_block(target, &mut msg, blocking)
    }

    /// Delivers `*msg` to `target`, blocking if it has to queue and the
    /// queue is full (or rendezvous and nobody's receiving yet).
    ///
    /// Takes `msg` by reference rather than by value so that
    /// [`Kernel::send_receive`] can point a thread's `wait_data` at its own
    /// envelope before calling this, and have the eventual `reply` land in
    /// the same storage regardless of which branch below is taken.
    fn deliver_or_block(&self, target: Pid, msg: &mut Message, blocking: bool) -> Result<SendOutcome, IpcError> {
        enum Step {
            Queued { sender_was_reply_blocked: bool },
            QueueFull,
            DeliveredDirect,
            Blocked,
        }

        msg.sender = self.active_pid();
        let msg_ptr = msg as *mut Message;

        let step = self.with_inner(|inner| -> Result<Step, IpcError> {
            let target_tcb = inner.lookup(target).ok_or(IpcError::UnknownThread)?;
            let current = inner.active.ok_or(IpcError::UnknownThread)?;

            if target_tcb.status() != ThreadStatus::ReceiveBlocked {
                let queue = target_tcb.msg_queue.as_ref().ok_or(IpcError::NoQueue)?;
                // Safety: `msg_ptr` is valid for the duration of this call.
                if queue.push(unsafe { *msg_ptr }) {
                    return Ok(Step::Queued {
                        sender_was_reply_blocked: current.status() == ThreadStatus::ReplyBlocked,
                    });
                }
                if !blocking {
                    return Ok(Step::QueueFull);
                }
                current.wait_data.set(msg_ptr);
                let new_status = if current.status() == ThreadStatus::ReplyBlocked {
                    ThreadStatus::ReplyBlocked
                } else {
                    ThreadStatus::SendBlocked
                };
                inner.set_status(current, new_status);
                // Safety: `current` is `'static` and, by invariant, not
                // linked in any other list right now.
                unsafe {
                    target_tcb
                        .msg_waiters
                        .insert_by(NonNull::from(current), |t: &Tcb<P>| t.priority);
                }
                Ok(Step::Blocked)
            } else {
                // Safety: `target_tcb` is `ReceiveBlocked`, so its
                // `wait_data` points at a live `Message` on its own
                // suspended stack. `msg_ptr` is valid for this call.
                unsafe {
                    *target_tcb.wait_data.get() = *msg_ptr;
                }
                log::trace!("{} delivers a message straight to waiting {}", current.name, target_tcb.name);
                inner.set_status(target_tcb, ThreadStatus::Pending);
                Ok(Step::DeliveredDirect)
            }
        })?;

        match step {
            Step::Queued { sender_was_reply_blocked } => {
                if sender_was_reply_blocked {
                    P::yield_higher();
                }
                Ok(SendOutcome::Enqueued)
            }
            Step::QueueFull => Err(IpcError::WouldBlock),
            Step::DeliveredDirect => {
                P::yield_higher();
                Ok(SendOutcome::Delivered)
            }
            Step::Blocked => {
                P::yield_higher();
                Ok(SendOutcome::Blocked)
            }
        }
    }

    /// Queues `msg` into the calling thread's own inbox. Never blocks.
    pub fn send_to_self_queue(&self, mut msg: Message) -> Result<SendOutcome, IpcError> {
        self.with_inner(|inner| {
            let current = inner.active.ok_or(IpcError::UnknownThread)?;
            msg.sender = current.pid;
            let queue = current.msg_queue.as_ref().ok_or(IpcError::NoQueue)?;
            if queue.push(msg) {
                Ok(SendOutcome::Enqueued)
            } else {
                Err(IpcError::WouldBlock)
            }
        })
    }

    /// ISR-safe, never-blocking send: delivers directly into a waiting
    /// receiver, otherwise enqueues, otherwise reports
    /// [`IpcError::WouldBlock`].
    pub fn send_from_isr(&self, target: Pid, mut msg: Message) -> Result<SendOutcome, IpcError> {
        msg.sender = PID_ISR;

        enum Step {
            Delivered(u8),
            Queued,
            QueueFull,
        }

        let step = self.with_inner(|inner| -> Result<Step, IpcError> {
            let target_tcb = inner.lookup(target).ok_or(IpcError::UnknownThread)?;
            if target_tcb.status() == ThreadStatus::ReceiveBlocked {
                // Safety: see `deliver_or_block`.
                unsafe { *target_tcb.wait_data.get() = msg };
                log::trace!("isr delivers a message straight to waiting {}", target_tcb.name);
                inner.set_status(target_tcb, ThreadStatus::Pending);
                Ok(Step::Delivered(target_tcb.priority))
            } else {
                let queue = target_tcb.msg_queue.as_ref().ok_or(IpcError::NoQueue)?;
                if queue.push(msg) {
                    Ok(Step::Queued)
                } else {
                    Ok(Step::QueueFull)
                }
            }
        })?;

        match step {
            Step::Delivered(priority) => {
                self.context_switch(priority);
                Ok(SendOutcome::Delivered)
            }
            Step::Queued => Ok(SendOutcome::Enqueued),
            Step::QueueFull => Err(IpcError::WouldBlock),
        }
    }

    /// Receives a message: from the calling thread's own queue if one is
    /// waiting there, otherwise from a blocked sender, otherwise (if
    /// `blocking`) by waiting for either.
    pub fn receive(&self, blocking: bool) -> Result<Message, IpcError> {
        let mut inbox = Message::empty();

        enum Step {
            FromQueue(Message),
            WouldBlock,
            FromWaiter(Message, Option<u8>),
            MustBlock,
        }

        let step = self.with_inner(|inner| -> Result<Step, IpcError> {
            let current = inner.active.ok_or(IpcError::NoQueue)?;
            let queue = current.msg_queue.as_ref().ok_or(IpcError::NoQueue)?;

            if let Some(msg) = queue.pop() {
                return Ok(Step::FromQueue(msg));
            }
            if !blocking && current.msg_waiters.is_empty() {
                return Ok(Step::WouldBlock);
            }

            current.wait_data.set(&mut inbox as *mut Message);

            // Safety: everything linked in `msg_waiters` is a live
            // `'static` thread blocked in `send`/`send_receive`.
            match unsafe { current.msg_waiters.pop_front() } {
                Some(sender_ptr) => {
                    let sender = unsafe { &*sender_ptr.as_ptr() };
                    // Safety: a thread in `msg_waiters` has `wait_data`
                    // pointing at a `Message` on its own suspended stack.
                    let msg = unsafe { *sender.wait_data.get() };
                    log::trace!("{} receives a message straight from blocked {}", current.name, sender.name);
                    let woken = if sender.status() != ThreadStatus::ReplyBlocked {
                        sender.wait_data.set(core::ptr::null_mut());
                        inner.set_status(sender, ThreadStatus::Pending);
                        Some(sender.priority)
                    } else {
                        None
                    };
                    Ok(Step::FromWaiter(msg, woken))
                }
                None => {
                    inner.set_status(current, ThreadStatus::ReceiveBlocked);
                    Ok(Step::MustBlock)
                }
            }
        })?;

        match step {
            Step::FromQueue(msg) => Ok(msg),
            Step::WouldBlock => Err(IpcError::WouldBlock),
            Step::FromWaiter(msg, woken) => {
                if let Some(priority) = woken {
                    self.context_switch(priority);
                }
                Ok(msg)
            }
            Step::MustBlock => {
                P::yield_higher();
                Ok(inbox)
            }
        }
    }

    /// Blocking `send` that also blocks on the reply: equivalent to putting
    /// the calling thread in `ReplyBlocked` before the underlying `send`, so
    /// a `send` that has to queue or rendezvous still leaves the thread
    /// waiting for [`Kernel::reply`] afterward rather than returning once
    /// delivered.
    pub fn send_receive(&self, target: Pid, msg: Message) -> Result<Message, IpcError> {
        if self.active_pid() == target {
            return Err(IpcError::UnknownThread);
        }
        // `envelope` is both the outgoing message and, once a later `reply`
        // overwrites it through `wait_data`, the returned reply — the two
        // ends share one slot exactly the way the blocked-sender trick
        // elsewhere in this module shares one.
        let mut envelope = msg;
        envelope.sender = self.active_pid();

        self.with_inner(|inner| -> Result<(), IpcError> {
            let current = inner.active.ok_or(IpcError::UnknownThread)?;
            inner.set_status(current, ThreadStatus::ReplyBlocked);
            current.wait_data.set(&mut envelope as *mut Message);
            Ok(())
        })?;

        self.deliver_or_block(target, &mut envelope, true)?;
        Ok(envelope)
    }

    /// Replies to whoever sent the message this [`Message::sender`] came
    /// from, waking it from [`Kernel::send_receive`].
    pub fn reply(&self, to: &Message, mut reply_msg: Message) -> Result<(), IpcError> {
        reply_msg.sender = self.active_pid();

        let priority = self.with_inner(|inner| -> Result<u8, IpcError> {
            let target = inner.lookup(to.sender).ok_or(IpcError::UnknownThread)?;
            if target.msg_queue.is_none() {
                return Err(IpcError::NoQueue);
            }
            if target.status() != ThreadStatus::ReplyBlocked {
                return Err(IpcError::NotReplyBlocked);
            }
            // Safety: `target` is `ReplyBlocked`, so its `wait_data` points
            // at the reply slot `send_receive` set up on its own suspended
            // stack.
            unsafe { *target.wait_data.get() = reply_msg };
            inner.set_status(target, ThreadStatus::Pending);
            Ok(target.priority)
        })?;

        self.context_switch(priority);
        Ok(())
    }

    /// ISR-safe reply: never blocks, defers the context switch instead of
    /// performing it inline.
    pub fn reply_in_isr(&self, to: &Message, mut reply_msg: Message) -> Result<(), IpcError> {
        reply_msg.sender = PID_ISR;

        self.with_inner(|inner| -> Result<(), IpcError> {
            let target = inner.lookup(to.sender).ok_or(IpcError::UnknownThread)?;
            if target.msg_queue.is_none() {
                return Err(IpcError::NoQueue);
            }
            if target.status() != ThreadStatus::ReplyBlocked {
                return Err(IpcError::NotReplyBlocked);
            }
            // Safety: see `reply`.
            unsafe { *target.wait_data.get() = reply_msg };
            inner.set_status(target, ThreadStatus::Pending);
            inner.context_switch_request = true;
            Ok(())
        })
    }
}
