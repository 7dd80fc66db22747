//! Concurrent address directory
//!
//! The directory maps every live [`Address`] to the runtime entry of its
//! actor. It is partitioned into a fixed number of buckets, each guarded by
//! its own read/write lock, so registrations on different buckets never
//! contend.

use crate::{
    address::Address,
    error::{ActorError, ActorResult},
    lifecycle::{LifecycleState, SystemMessage},
    mailbox::Dispatchable,
    supervision::{FailureMark, Supervisor},
};
use parking_lot::RwLock;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

/// Type-erased view of a live actor, as stored in the directory
pub trait ActorEntry: Dispatchable {
    /// Address of the parent actor
    fn parent(&self) -> &Address;

    /// Type name of the protocol the actor accepts
    fn protocol_name(&self) -> &'static str;

    /// Type id of the protocol the actor accepts
    fn protocol_id(&self) -> TypeId;

    /// Current lifecycle state
    fn lifecycle(&self) -> LifecycleState;

    /// Whether the evictor may reclaim this actor
    fn is_evictable(&self) -> bool;

    /// Last time the actor finished handling a message
    fn last_active(&self) -> Instant;

    /// Undelivered user messages
    fn pending(&self) -> usize;

    /// Snapshot of child addresses in creation order
    fn children(&self) -> Vec<Address>;

    fn add_child(&self, child: Address);

    fn remove_child(&self, child: &Address);

    /// Enqueue a system message and schedule the actor
    fn system(&self, message: SystemMessage);

    /// Suspend user message delivery
    fn suspend(&self);

    /// Mark the actor as stopping; returns false if a stop was already requested
    fn request_stop(&self) -> bool;

    fn is_stop_requested(&self) -> bool;

    /// Claim the actor for eviction; fails if a message is being handled
    fn try_claim_eviction(&self) -> bool;

    /// Supervisor supplied at creation, if any
    fn supervisor(&self) -> Option<Arc<dyn Supervisor>>;

    /// Failure history of this actor
    fn failure_mark(&self) -> &FailureMark;

    /// Failure history shared by this actor's children
    fn children_failure_mark(&self) -> &FailureMark;

    /// A boxed `Arc<dyn ProtocolSink<P>>` for the actor's protocol
    fn protocol_sink(&self) -> Option<Box<dyn Any + Send>>;
}

/// Whether two trait objects point at the same allocation
pub(crate) fn same_entry(a: &Arc<dyn ActorEntry>, b: &Arc<dyn ActorEntry>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

/// Bucketed `Address -> T` map
pub struct Directory<T> {
    buckets: Vec<RwLock<HashMap<Address, T>>>,
    initial_capacity: usize,
}

impl<T: Clone> Directory<T> {
    /// Create a directory with `buckets` partitions of `initial_capacity` slots
    pub fn new(buckets: usize, initial_capacity: usize) -> Self {
        let buckets = buckets.max(1);
        Self {
            buckets: (0..buckets)
                .map(|_| RwLock::new(HashMap::with_capacity(initial_capacity)))
                .collect(),
            initial_capacity,
        }
    }

    fn bucket(&self, address: &Address) -> &RwLock<HashMap<Address, T>> {
        let index = (address.id() % self.buckets.len() as u64) as usize;
        &self.buckets[index]
    }

    /// Register `value` at `address`; fails if the address is taken
    pub fn register(&self, address: Address, value: T) -> ActorResult<()> {
        let mut bucket = self.bucket(&address).write();
        if bucket.contains_key(&address) {
            return Err(ActorError::AddressAlreadyRegistered { address });
        }
        bucket.insert(address, value);
        Ok(())
    }

    /// Remove whatever is registered at `address`
    pub fn remove(&self, address: &Address) -> Option<T> {
        self.bucket(address).write().remove(address)
    }

    /// Remove the entry at `address` only if `predicate` accepts it
    pub fn remove_if<F>(&self, address: &Address, predicate: F) -> Option<T>
    where
        F: FnOnce(&T) -> bool,
    {
        let mut bucket = self.bucket(address).write();
        match bucket.get(address) {
            Some(existing) if predicate(existing) => bucket.remove(address),
            _ => None,
        }
    }

    pub fn actor_of(&self, address: &Address) -> Option<T> {
        self.bucket(address).read().get(address).cloned()
    }

    pub fn is_registered(&self, address: &Address) -> bool {
        self.bucket(address).read().contains_key(address)
    }

    pub fn count(&self) -> usize {
        self.buckets.iter().map(|bucket| bucket.read().len()).sum()
    }

    /// Snapshot of all registered values
    pub fn all(&self) -> Vec<T> {
        self.buckets
            .iter()
            .flat_map(|bucket| bucket.read().values().cloned().collect::<Vec<_>>())
            .collect()
    }

    /// Fraction of the nominal capacity in use
    pub fn occupancy(&self) -> f64 {
        let nominal = self.buckets.len() * self.initial_capacity.max(1);
        self.count() as f64 / nominal as f64
    }

    /// Nominal capacity used by [`occupancy`](Self::occupancy)
    pub fn nominal_capacity(&self) -> usize {
        self.buckets.len() * self.initial_capacity.max(1)
    }
}
