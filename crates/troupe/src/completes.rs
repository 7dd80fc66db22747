//! Eventual results
//!
//! A query to an actor carries a [`CompletesEventually`] that the actor
//! answers exactly once; the caller holds the matching [`Completes`], which
//! can be awaited, polled, or blocked on.

use crate::{
    address::{Address, AddressFactory},
    error::{ActorError, ActorResult},
};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::task::{Context, Poll};
use std::thread;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;

/// Create a connected producer/consumer pair tagged with `address`
pub fn pair<T>(address: Address) -> (CompletesEventually<T>, Completes<T>) {
    let (sender, receiver) = oneshot::channel();
    (
        CompletesEventually {
            address: address.clone(),
            sender,
        },
        Completes { address, receiver },
    )
}

/// Producer side of an eventual result
#[derive(Debug)]
pub struct CompletesEventually<T> {
    address: Address,
    sender: oneshot::Sender<ActorResult<T>>,
}

impl<T> CompletesEventually<T> {
    pub fn address(&self) -> &Address {
        &self.address
    }

    /// Deliver the outcome; returns false if the consumer is gone
    pub fn with(self, outcome: T) -> bool {
        self.sender.send(Ok(outcome)).is_ok()
    }

    /// Deliver a failure instead of an outcome
    pub fn fail(self, error: ActorError) -> bool {
        self.sender.send(Err(error)).is_ok()
    }

    /// Whether the consumer has dropped its end
    pub fn is_abandoned(&self) -> bool {
        self.sender.is_closed()
    }

    /// Give up without an outcome; the consumer sees `Unanswered`
    pub fn stop(self) {}
}

/// Consumer side of an eventual result
#[derive(Debug)]
pub struct Completes<T> {
    address: Address,
    receiver: oneshot::Receiver<ActorResult<T>>,
}

impl<T> Completes<T> {
    pub fn address(&self) -> &Address {
        &self.address
    }

    /// Take the outcome if it has arrived
    pub fn try_outcome(&mut self) -> Option<ActorResult<T>> {
        match self.receiver.try_recv() {
            Ok(outcome) => Some(outcome),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(ActorError::Unanswered)),
        }
    }

    /// Block the current thread until the outcome arrives.
    ///
    /// Must not be called from within an async runtime.
    pub fn outcome(self) -> ActorResult<T> {
        self.receiver
            .blocking_recv()
            .unwrap_or(Err(ActorError::Unanswered))
    }

    /// Block for at most `timeout`
    pub fn outcome_within(mut self, timeout: Duration) -> ActorResult<T> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(outcome) = self.try_outcome() {
                return outcome;
            }
            if Instant::now() >= deadline {
                return Err(ActorError::Timeout {
                    operation: format!("completes {}", self.address),
                    timeout,
                });
            }
            thread::sleep(Duration::from_millis(1));
        }
    }
}

impl<T> Future for Completes<T> {
    type Output = ActorResult<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(ActorError::Unanswered)))
    }
}

/// Hands out eventual results whose addresses rotate through a fixed pool
#[derive(Debug)]
pub struct PooledCompletesProvider {
    pool: Vec<Address>,
    next: AtomicUsize,
}

impl PooledCompletesProvider {
    pub fn new(factory: &AddressFactory, pool_size: usize) -> Self {
        let pool = (0..pool_size.max(1))
            .map(|index| factory.unique_with(format!("completes-{index}")))
            .collect();
        Self {
            pool,
            next: AtomicUsize::new(0),
        }
    }

    /// Next pool address, round-robin
    pub fn next_address(&self) -> Address {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.pool.len();
        self.pool[index].clone()
    }

    pub fn provide<T>(&self) -> (CompletesEventually<T>, Completes<T>) {
        pair(self.next_address())
    }

    pub fn pool_size(&self) -> usize {
        self.pool.len()
    }
}
