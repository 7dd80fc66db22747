//! Shared dispatcher thread pool
//!
//! All actors of a stage are multiplexed onto a fixed set of threads. Runnable
//! mailboxes are pushed into one lock-free ready queue; a mailbox enters the
//! queue only by winning its `scheduled` flag, so it is never present twice
//! and never drained by two threads at once. That single flag is what gives
//! every actor FIFO delivery and mutual exclusion.
//!
//! The ready queue itself is unbounded. The total number of undelivered user
//! messages is bounded by `queue_capacity` through an atomic budget that
//! senders reserve and workers release after delivery, so a worker re-queuing
//! a mailbox never waits on space.
//!
//! Sends and schedules hold an in-flight count while they enqueue. Workers
//! leave only once the dispatcher is closed, that count is zero and the ready
//! queue is empty, so a send that was accepted is always delivered.

use crate::{
    config::{BackpressureStrategy, DispatcherConfig},
    error::{ActorError, ActorResult},
    mailbox::{Dispatchable, MailboxOwner},
};
use crossbeam_queue::SegQueue;
use crossbeam_utils::Backoff;
use parking_lot::{Condvar, Mutex};
use std::cell::Cell;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

static NEXT_DISPATCHER_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// Id of the dispatcher owning the current thread, 0 if none
    static CURRENT_DISPATCHER: Cell<u64> = const { Cell::new(0) };
}

struct Shared {
    id: u64,
    name: String,
    config: DispatcherConfig,
    ready: SegQueue<Arc<dyn Dispatchable>>,
    pending: AtomicUsize,
    in_flight: AtomicUsize,
    closed: AtomicBool,
    idle_workers: AtomicUsize,
    idle_lock: Mutex<()>,
    wake: Condvar,
    space_lock: Mutex<()>,
    space: Condvar,
}

/// Fixed-size pool of dispatch threads
pub struct Dispatcher {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Dispatcher {
    /// Spawn `config.pool_size` dispatch threads named after `name`
    pub fn start(name: &str, config: DispatcherConfig) -> ActorResult<Self> {
        let shared = Arc::new(Shared {
            id: NEXT_DISPATCHER_ID.fetch_add(1, Ordering::Relaxed),
            name: name.to_string(),
            ready: SegQueue::new(),
            pending: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            idle_workers: AtomicUsize::new(0),
            idle_lock: Mutex::new(()),
            wake: Condvar::new(),
            space_lock: Mutex::new(()),
            space: Condvar::new(),
            config,
        });

        let mut workers = Vec::with_capacity(shared.config.pool_size);
        for index in 0..shared.config.pool_size {
            let worker_shared = shared.clone();
            let handle = thread::Builder::new()
                .name(format!("{name}-dispatcher-{index}"))
                .spawn(move || worker_shared.run())
                .map_err(|e| ActorError::Internal {
                    reason: format!("failed to spawn dispatcher thread: {e}"),
                })?;
            workers.push(handle);
        }

        debug!(
            dispatcher = %name,
            pool_size = shared.config.pool_size,
            queue_capacity = shared.config.queue_capacity,
            "Dispatcher started"
        );

        Ok(Self {
            shared,
            workers: Mutex::new(workers),
        })
    }

    /// Enqueue a user message for `target` and schedule it
    pub fn send<M, T>(&self, target: &Arc<T>, message: M) -> ActorResult<()>
    where
        T: MailboxOwner<M>,
    {
        let _gate = InFlight::enter(&self.shared);
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(ActorError::DispatcherClosed);
        }
        if target.mailbox().is_closed() {
            return Err(ActorError::ActorStopped {
                address: target.address().clone(),
            });
        }

        self.shared.reserve()?;
        target.mailbox().enqueue(message);
        self.execute(target.clone());
        Ok(())
    }

    /// Schedule `target` without enqueuing a user message
    pub fn schedule(&self, target: Arc<dyn Dispatchable>) {
        let _gate = InFlight::enter(&self.shared);
        if target.is_runnable() {
            self.execute(target);
        }
    }

    fn execute(&self, target: Arc<dyn Dispatchable>) {
        self.shared.execute(target);
    }

    /// Undelivered user messages across all mailboxes
    pub fn pending(&self) -> usize {
        self.shared.pending.load(Ordering::Acquire)
    }

    pub fn concurrency_capacity(&self) -> usize {
        self.shared.config.pool_size
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Whether the calling thread belongs to this dispatcher
    pub fn is_dispatcher_thread(&self) -> bool {
        CURRENT_DISPATCHER.with(|current| current.get() == self.shared.id)
    }

    /// Stop accepting sends and let the threads drain what is queued.
    ///
    /// Joins the threads unless called from one of them.
    pub fn close(&self) {
        self.shutdown(None);
    }

    /// Like [`Dispatcher::close`], but waits at most `timeout` for the threads.
    ///
    /// Threads still busy at the deadline are detached and finish their
    /// current mailbox on their own. Returns false if any thread was left
    /// running; repeated closes return true.
    pub fn close_within(&self, timeout: Duration) -> bool {
        self.shutdown(Some(Instant::now() + timeout))
    }

    fn shutdown(&self, deadline: Option<Instant>) -> bool {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return true;
        }
        {
            let _guard = self.shared.idle_lock.lock();
            self.shared.wake.notify_all();
        }
        {
            let _guard = self.shared.space_lock.lock();
            self.shared.space.notify_all();
        }

        let mut workers = std::mem::take(&mut *self.workers.lock());
        if self.is_dispatcher_thread() {
            debug!(dispatcher = %self.shared.name, "Dispatcher closed from its own thread");
            return false;
        }

        if let Some(deadline) = deadline {
            let backoff = Backoff::new();
            while workers.iter().any(|worker| !worker.is_finished()) {
                if Instant::now() >= deadline {
                    break;
                }
                if backoff.is_completed() {
                    thread::sleep(Duration::from_millis(1));
                } else {
                    backoff.snooze();
                }
            }
        }

        let mut detached = 0;
        for worker in workers.drain(..) {
            if deadline.is_some() && !worker.is_finished() {
                detached += 1;
                continue;
            }
            if worker.join().is_err() {
                warn!(dispatcher = %self.shared.name, "Dispatcher thread panicked");
            }
        }
        if detached > 0 {
            warn!(
                dispatcher = %self.shared.name,
                detached,
                "Dispatcher closed with threads still busy"
            );
            return false;
        }
        debug!(dispatcher = %self.shared.name, "Dispatcher closed");
        true
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.close();
    }
}

/// Marks a send or schedule in progress for the lifetime of the guard
struct InFlight<'a> {
    shared: &'a Shared,
}

impl<'a> InFlight<'a> {
    fn enter(shared: &'a Shared) -> Self {
        shared.in_flight.fetch_add(1, Ordering::SeqCst);
        Self { shared }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.shared.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Shared {
    /// Take one unit of the pending-message budget
    fn try_reserve(&self) -> bool {
        let capacity = self.config.queue_capacity;
        self.pending
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |pending| {
                (pending < capacity).then_some(pending + 1)
            })
            .is_ok()
    }

    fn reserve(&self) -> ActorResult<()> {
        if self.try_reserve() {
            return Ok(());
        }
        let overflow = ActorError::MailboxOverflow {
            capacity: self.config.queue_capacity,
        };
        if self.config.backpressure == BackpressureStrategy::Fail {
            return Err(overflow);
        }

        let deadline = Instant::now() + self.config.block_timeout;
        let mut guard = self.space_lock.lock();
        loop {
            if self.try_reserve() {
                return Ok(());
            }
            if self.closed.load(Ordering::Acquire) {
                return Err(ActorError::DispatcherClosed);
            }
            if self.space.wait_until(&mut guard, deadline).timed_out() {
                return if self.try_reserve() { Ok(()) } else { Err(overflow) };
            }
        }
    }

    fn release(&self, delivered: usize) {
        if delivered == 0 {
            return;
        }
        self.pending.fetch_sub(delivered, Ordering::AcqRel);
        if self.config.backpressure == BackpressureStrategy::Block {
            let _guard = self.space_lock.lock();
            self.space.notify_all();
        }
    }

    fn execute(&self, target: Arc<dyn Dispatchable>) {
        if !target.status().try_schedule() {
            return;
        }
        self.ready.push(target);
        if self.config.notify_on_send && self.idle_workers.load(Ordering::SeqCst) > 0 {
            let _guard = self.idle_lock.lock();
            self.wake.notify_one();
        }
    }

    /// Closed with no send in progress and nothing left to run
    fn is_drained(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
            && self.in_flight.load(Ordering::SeqCst) == 0
            && self.ready.is_empty()
    }

    fn run(self: Arc<Self>) {
        CURRENT_DISPATCHER.with(|current| current.set(self.id));
        trace!(dispatcher = %self.name, "Dispatcher thread running");

        let backoff = Backoff::new();
        let mut empty_polls = 0u32;
        loop {
            if let Some(target) = self.ready.pop() {
                empty_polls = 0;
                backoff.reset();
                let delivered = target.dispatch(self.config.throughput);
                self.release(delivered);
                target.status().unschedule();
                if target.is_runnable() {
                    self.execute(target);
                }
                continue;
            }

            if self.is_drained() {
                break;
            }

            if empty_polls < self.config.throttling_count {
                empty_polls += 1;
                backoff.snooze();
                continue;
            }

            let mut guard = self.idle_lock.lock();
            self.idle_workers.fetch_add(1, Ordering::SeqCst);
            if self.ready.is_empty() && !self.is_drained() {
                self.wake.wait_for(&mut guard, self.config.backoff_timeout);
            }
            self.idle_workers.fetch_sub(1, Ordering::SeqCst);
        }

        CURRENT_DISPATCHER.with(|current| current.set(0));
        trace!(dispatcher = %self.name, "Dispatcher thread exiting");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::{Address, AddressFactory};
    use crate::mailbox::{Mailbox, MailboxStatus};
    use std::time::Duration;

    /// Mailbox whose consumer records what it saw
    struct Recorder {
        address: Address,
        mailbox: Mailbox<u32>,
        seen: Mutex<Vec<u32>>,
        delay: Duration,
    }

    impl Recorder {
        fn new(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                address: AddressFactory::new().unique(),
                mailbox: Mailbox::new(),
                seen: Mutex::new(Vec::new()),
                delay,
            })
        }
    }

    impl Dispatchable for Recorder {
        fn address(&self) -> &Address {
            &self.address
        }

        fn status(&self) -> &MailboxStatus {
            self.mailbox.status()
        }

        fn is_runnable(&self) -> bool {
            self.mailbox.has_pending()
        }

        fn dispatch(&self, throughput: usize) -> usize {
            let mut delivered = 0;
            while delivered < throughput {
                let Some(value) = self.mailbox.dequeue() else { break };
                if !self.delay.is_zero() {
                    thread::sleep(self.delay);
                }
                self.seen.lock().push(value);
                delivered += 1;
            }
            delivered
        }
    }

    impl MailboxOwner<u32> for Recorder {
        fn mailbox(&self) -> &Mailbox<u32> {
            &self.mailbox
        }
    }

    /// Mailbox carrying only system work, never user messages
    struct Signal {
        address: Address,
        status: MailboxStatus,
        remaining: AtomicUsize,
    }

    impl Signal {
        fn new(signals: usize) -> Arc<Self> {
            Arc::new(Self {
                address: AddressFactory::new().unique(),
                status: MailboxStatus::new(),
                remaining: AtomicUsize::new(signals),
            })
        }
    }

    impl Dispatchable for Signal {
        fn address(&self) -> &Address {
            &self.address
        }

        fn status(&self) -> &MailboxStatus {
            &self.status
        }

        fn is_runnable(&self) -> bool {
            self.remaining.load(Ordering::SeqCst) > 0
        }

        fn dispatch(&self, _throughput: usize) -> usize {
            let _ = self
                .remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
            0
        }
    }

    fn config(pool_size: usize, capacity: usize) -> DispatcherConfig {
        DispatcherConfig {
            pool_size,
            queue_capacity: capacity,
            ..DispatcherConfig::default()
        }
    }

    #[test]
    fn test_delivers_in_order() {
        let dispatcher = Dispatcher::start("order", config(4, 1024)).unwrap();
        let recorder = Recorder::new(Duration::ZERO);
        for i in 0..500 {
            dispatcher.send(&recorder, i).unwrap();
        }
        dispatcher.close();
        assert_eq!(*recorder.seen.lock(), (0..500).collect::<Vec<_>>());
        assert_eq!(dispatcher.pending(), 0);
    }

    #[test]
    fn test_close_delivers_before_and_rejects_after() {
        let dispatcher = Dispatcher::start("close", config(1, 1024)).unwrap();
        let recorder = Recorder::new(Duration::from_millis(1));
        for i in 0..64 {
            dispatcher.send(&recorder, i).unwrap();
        }
        dispatcher.close();
        for i in 64..74 {
            assert!(matches!(
                dispatcher.send(&recorder, i),
                Err(ActorError::DispatcherClosed)
            ));
        }
        assert_eq!(*recorder.seen.lock(), (0..64).collect::<Vec<_>>());
    }

    #[test]
    fn test_overflow_fails_fast() {
        let dispatcher = Dispatcher::start("overflow", config(1, 4)).unwrap();
        let slow = Recorder::new(Duration::from_millis(50));
        let mut overflowed = false;
        for i in 0..32 {
            if let Err(err) = dispatcher.send(&slow, i) {
                assert!(matches!(err, ActorError::MailboxOverflow { capacity: 4 }));
                overflowed = true;
                break;
            }
        }
        assert!(overflowed);
        assert!(dispatcher.pending() <= 4);
        dispatcher.close();
    }

    #[test]
    fn test_block_waits_for_space() {
        let mut cfg = config(1, 2);
        cfg.backpressure = BackpressureStrategy::Block;
        cfg.block_timeout = Duration::from_secs(5);
        let dispatcher = Dispatcher::start("block", cfg).unwrap();
        let recorder = Recorder::new(Duration::from_millis(2));
        for i in 0..20 {
            dispatcher.send(&recorder, i).unwrap();
        }
        dispatcher.close();
        assert_eq!(recorder.seen.lock().len(), 20);
    }

    #[test]
    fn test_sends_racing_close_are_delivered_or_rejected() {
        for round in 0..200u64 {
            let dispatcher = Arc::new(Dispatcher::start("race", config(2, 1 << 16)).unwrap());
            let recorder = Recorder::new(Duration::ZERO);
            let sender = {
                let dispatcher = dispatcher.clone();
                let recorder = recorder.clone();
                thread::spawn(move || {
                    let mut accepted = 0;
                    for i in 0u32.. {
                        if dispatcher.send(&recorder, i).is_err() {
                            break;
                        }
                        accepted += 1;
                    }
                    accepted
                })
            };
            thread::sleep(Duration::from_micros(round % 40 * 10));
            dispatcher.close();
            let accepted = sender.join().unwrap();
            assert_eq!(
                recorder.seen.lock().len(),
                accepted,
                "round {round}: accepted sends were not delivered"
            );
            assert_eq!(dispatcher.pending(), 0);
        }
    }

    #[test]
    fn test_system_scheduling_beyond_capacity_never_wedges() {
        let mut cfg = config(1, 4);
        cfg.throughput = 1;
        let dispatcher = Dispatcher::start("wedge", cfg).unwrap();
        let slow = Recorder::new(Duration::from_millis(50));
        dispatcher.send(&slow, 1).unwrap();
        dispatcher.send(&slow, 2).unwrap();

        // far more runnable mailboxes than the user message budget
        let signals: Vec<_> = (0..32).map(|_| Signal::new(3)).collect();
        for signal in &signals {
            dispatcher.schedule(signal.clone());
        }

        dispatcher.close();
        assert_eq!(*slow.seen.lock(), vec![1, 2]);
        assert!(signals.iter().all(|signal| !signal.is_runnable()));
    }

    #[test]
    fn test_close_within_detaches_busy_threads() {
        let dispatcher = Dispatcher::start("bounded", config(1, 8)).unwrap();
        let slow = Recorder::new(Duration::from_millis(1500));
        dispatcher.send(&slow, 1).unwrap();
        thread::sleep(Duration::from_millis(50));

        let started = Instant::now();
        assert!(!dispatcher.close_within(Duration::from_millis(100)));
        assert!(started.elapsed() < Duration::from_millis(1000));
        assert!(dispatcher.is_closed());
    }

    #[test]
    fn test_close_within_joins_idle_threads() {
        let dispatcher = Dispatcher::start("idle", config(2, 8)).unwrap();
        let recorder = Recorder::new(Duration::ZERO);
        dispatcher.send(&recorder, 7).unwrap();
        assert!(dispatcher.close_within(Duration::from_secs(5)));
        assert_eq!(*recorder.seen.lock(), vec![7]);
    }

    #[test]
    fn test_dispatcher_thread_detection() {
        let dispatcher = Dispatcher::start("detect", config(1, 8)).unwrap();
        assert!(!dispatcher.is_dispatcher_thread());
        assert_eq!(dispatcher.concurrency_capacity(), 1);
        dispatcher.close();
        assert!(dispatcher.is_closed());
    }
}
