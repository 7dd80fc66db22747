//! Per-actor mailboxes
//!
//! A mailbox is an unbounded lock-free FIFO of protocol messages plus the
//! status flags the dispatcher uses to guarantee that at most one thread is
//! draining it at any time. The global message bound lives in the
//! [`Dispatcher`](crate::dispatcher::Dispatcher), not here.

use crate::address::Address;
use crossbeam_queue::SegQueue;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Scheduling flags shared between a mailbox and the dispatcher
#[derive(Debug, Default)]
pub struct MailboxStatus {
    /// Set while the mailbox sits in the ready queue or is being drained
    scheduled: AtomicBool,
    /// User messages are held back while set
    suspended: AtomicBool,
    /// No further user messages are accepted
    closed: AtomicBool,
}

impl MailboxStatus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attempt to take the scheduling token; true if this caller won it
    pub fn try_schedule(&self) -> bool {
        self.scheduled
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Release the scheduling token
    pub fn unschedule(&self) {
        self.scheduled.store(false, Ordering::Release);
    }

    pub fn is_scheduled(&self) -> bool {
        self.scheduled.load(Ordering::Acquire)
    }

    pub fn suspend(&self) {
        self.suspended.store(true, Ordering::Release);
    }

    pub fn resume(&self) {
        self.suspended.store(false, Ordering::Release);
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::Acquire)
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Ordered queue of pending messages for one actor
pub struct Mailbox<M> {
    queue: SegQueue<M>,
    len: AtomicUsize,
    status: MailboxStatus,
}

impl<M> Mailbox<M> {
    pub fn new() -> Self {
        Self {
            queue: SegQueue::new(),
            len: AtomicUsize::new(0),
            status: MailboxStatus::new(),
        }
    }

    pub fn enqueue(&self, message: M) {
        self.len.fetch_add(1, Ordering::AcqRel);
        self.queue.push(message);
    }

    pub fn dequeue(&self) -> Option<M> {
        let message = self.queue.pop()?;
        self.len.fetch_sub(1, Ordering::AcqRel);
        Some(message)
    }

    /// Remove and return every queued message
    pub fn drain(&self) -> Vec<M> {
        std::iter::from_fn(|| self.dequeue()).collect()
    }

    pub fn status(&self) -> &MailboxStatus {
        &self.status
    }

    pub fn is_suspended(&self) -> bool {
        self.status.is_suspended()
    }

    pub fn is_closed(&self) -> bool {
        self.status.is_closed()
    }

    pub fn has_pending(&self) -> bool {
        !self.queue.is_empty()
    }

    pub fn pending(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }
}

impl<M> Default for Mailbox<M> {
    fn default() -> Self {
        Self::new()
    }
}

/// Something the dispatcher can run: a mailbox bound to its consumer
pub trait Dispatchable: Send + Sync + 'static {
    /// Address of the owning actor
    fn address(&self) -> &Address;

    fn status(&self) -> &MailboxStatus;

    /// Whether a dispatch would make progress
    fn is_runnable(&self) -> bool;

    /// Process system messages, then up to `throughput` user messages.
    ///
    /// Returns the number of user messages taken off the mailbox, whether
    /// they were delivered or dropped.
    fn dispatch(&self, throughput: usize) -> usize;
}

/// Access to the typed mailbox behind a [`Dispatchable`]
pub trait MailboxOwner<M>: Dispatchable {
    fn mailbox(&self) -> &Mailbox<M>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_order() {
        let mailbox = Mailbox::new();
        for i in 0..5 {
            mailbox.enqueue(i);
        }
        assert_eq!(mailbox.pending(), 5);
        assert!(mailbox.has_pending());
        assert_eq!(mailbox.dequeue(), Some(0));
        assert_eq!(mailbox.drain(), vec![1, 2, 3, 4]);
        assert_eq!(mailbox.pending(), 0);
        assert!(!mailbox.has_pending());
    }

    #[test]
    fn test_schedule_token_is_exclusive() {
        let status = MailboxStatus::new();
        assert!(status.try_schedule());
        assert!(!status.try_schedule());
        assert!(status.is_scheduled());
        status.unschedule();
        assert!(status.try_schedule());
    }

    #[test]
    fn test_suspend_and_close_flags() {
        let mailbox: Mailbox<()> = Mailbox::new();
        assert!(!mailbox.is_suspended());
        mailbox.status().suspend();
        assert!(mailbox.is_suspended());
        mailbox.status().resume();
        assert!(!mailbox.is_suspended());
        mailbox.status().close();
        assert!(mailbox.is_closed());
    }
}
