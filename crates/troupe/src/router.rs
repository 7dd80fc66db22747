//! Routing a protocol across a pool of actors
//!
//! A [`Router`] is usually owned by a router actor: it keeps the current set
//! of routees and asks a [`RoutingStrategy`] which one receives each command
//! or query. [`RouterSpecification`] builds the initial pool as children of
//! the router actor.

use crate::{
    actor::{Actor, ActorRef, Context, Definition},
    address::Address,
    completes::{Completes, CompletesEventually},
    error::{ActorError, ActorResult},
};
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use std::fmt;
use tracing::trace;

/// One member of a router pool
pub struct Routee<P> {
    actor: ActorRef<P>,
}

impl<P: Send + 'static> Routee<P> {
    pub fn new(actor: ActorRef<P>) -> Self {
        Self { actor }
    }

    pub fn address(&self) -> &Address {
        self.actor.address()
    }

    pub fn actor(&self) -> &ActorRef<P> {
        &self.actor
    }

    /// Messages waiting in the routee's mailbox
    pub fn pending(&self) -> usize {
        self.actor.pending()
    }
}

impl<P> Clone for Routee<P> {
    fn clone(&self) -> Self {
        Self {
            actor: self.actor.clone(),
        }
    }
}

impl<P> fmt::Debug for Routee<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Routee({:?})", self.actor)
    }
}

/// Picks the routee for the next message
pub trait RoutingStrategy<P>: Send {
    /// Index into `routees` of the selected routee; `routees` is never empty
    fn select(&mut self, routees: &[Routee<P>]) -> usize;
}

/// Uniformly random selection.
///
/// Draws without replacement within each cycle over the current routee set,
/// so `n` consecutive selections cover all `n` routees. A change to the
/// routee set starts a new cycle.
pub struct RandomRouting {
    rng: StdRng,
    known: Vec<Address>,
    bag: Vec<usize>,
}

impl RandomRouting {
    pub fn new() -> Self {
        Self::from_rng(StdRng::from_entropy())
    }

    /// Deterministic selection for a given seed
    pub fn with_seed(seed: u64) -> Self {
        Self::from_rng(StdRng::seed_from_u64(seed))
    }

    fn from_rng(rng: StdRng) -> Self {
        Self {
            rng,
            known: Vec::new(),
            bag: Vec::new(),
        }
    }

    /// Replace the random source and start a new cycle
    pub fn reseed(&mut self, seed: u64) {
        self.rng = StdRng::seed_from_u64(seed);
        self.bag.clear();
    }
}

impl Default for RandomRouting {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: Send + 'static> RoutingStrategy<P> for RandomRouting {
    fn select(&mut self, routees: &[Routee<P>]) -> usize {
        let changed = self.known.len() != routees.len()
            || self
                .known
                .iter()
                .zip(routees)
                .any(|(known, routee)| known != routee.address());
        if changed {
            self.known = routees.iter().map(|r| r.address().clone()).collect();
            self.bag.clear();
        }
        if self.bag.is_empty() {
            self.bag = (0..routees.len()).collect();
            self.bag.shuffle(&mut self.rng);
        }
        self.bag.pop().unwrap_or(0)
    }
}

/// Cycles through the routees in subscription order
#[derive(Debug, Default)]
pub struct RoundRobinRouting {
    next: usize,
}

impl RoundRobinRouting {
    pub fn new() -> Self {
        Self::default()
    }
}

impl<P: Send + 'static> RoutingStrategy<P> for RoundRobinRouting {
    fn select(&mut self, routees: &[Routee<P>]) -> usize {
        let index = self.next % routees.len();
        self.next = self.next.wrapping_add(1);
        index
    }
}

/// Picks the routee with the fewest pending messages, earliest on ties
#[derive(Debug, Default)]
pub struct SmallestMailboxRouting;

impl<P: Send + 'static> RoutingStrategy<P> for SmallestMailboxRouting {
    fn select(&mut self, routees: &[Routee<P>]) -> usize {
        routees
            .iter()
            .enumerate()
            .min_by_key(|(_, routee)| routee.pending())
            .map(|(index, _)| index)
            .unwrap_or(0)
    }
}

/// Routee set plus selection strategy
pub struct Router<P> {
    routees: Vec<Routee<P>>,
    strategy: Box<dyn RoutingStrategy<P>>,
}

impl<P: Send + 'static> Router<P> {
    pub fn new(strategy: impl RoutingStrategy<P> + 'static) -> Self {
        Self {
            routees: Vec::new(),
            strategy: Box::new(strategy),
        }
    }

    pub fn with_routees(mut self, routees: impl IntoIterator<Item = Routee<P>>) -> Self {
        for routee in routees {
            self.subscribe(routee);
        }
        self
    }

    /// Add a routee; returns false if one with the same address is present
    pub fn subscribe(&mut self, routee: Routee<P>) -> bool {
        if self.routees.iter().any(|r| r.address() == routee.address()) {
            return false;
        }
        self.routees.push(routee);
        true
    }

    /// Remove the routee at `address`; returns false if absent
    pub fn unsubscribe(&mut self, address: &Address) -> bool {
        let before = self.routees.len();
        self.routees.retain(|r| r.address() != address);
        self.routees.len() != before
    }

    pub fn routees(&self) -> &[Routee<P>] {
        &self.routees
    }

    pub fn routee_count(&self) -> usize {
        self.routees.len()
    }

    fn select(&mut self) -> ActorResult<&Routee<P>> {
        if self.routees.is_empty() {
            return Err(ActorError::NoRoutees);
        }
        let index = self.strategy.select(&self.routees).min(self.routees.len() - 1);
        let routee = &self.routees[index];
        trace!(routee = %routee.address(), "Routee selected");
        Ok(routee)
    }

    /// Forward a fire-and-forget message to one routee
    pub fn route_command(&mut self, message: P) -> ActorResult<()> {
        self.select()?.actor.tell(message)
    }

    /// Forward a query to one routee and return the caller's eventual result
    pub fn route_query<T, F>(&mut self, make: F) -> ActorResult<Completes<T>>
    where
        F: FnOnce(CompletesEventually<T>) -> P,
    {
        self.select()?.actor.ask(make)
    }

    /// Forward a query carrying the original caller's reply handle
    pub fn route_query_with<T, F>(&mut self, reply: CompletesEventually<T>, make: F) -> ActorResult<()>
    where
        F: FnOnce(CompletesEventually<T>) -> P,
    {
        match self.select() {
            Ok(routee) => routee.actor.tell(make(reply)),
            Err(err) => {
                reply.fail(err.clone());
                Err(err)
            }
        }
    }

    /// Send a copy of `message` to every routee; returns how many accepted it
    pub fn broadcast(&self, message: P) -> ActorResult<usize>
    where
        P: Clone,
    {
        if self.routees.is_empty() {
            return Err(ActorError::NoRoutees);
        }
        Ok(self
            .routees
            .iter()
            .filter(|routee| routee.actor.tell(message.clone()).is_ok())
            .count())
    }
}

impl<P> fmt::Debug for Router<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Router")
            .field("routees", &self.routees.len())
            .finish()
    }
}

/// Initial pool of a router actor
pub struct RouterSpecification<A: Actor> {
    initial_pool_size: usize,
    routee_definition: Definition<A>,
}

impl<A: Actor> RouterSpecification<A> {
    /// `routee_definition` must not carry a fixed address
    pub fn new(initial_pool_size: usize, routee_definition: Definition<A>) -> Self {
        Self {
            initial_pool_size,
            routee_definition,
        }
    }

    pub fn initial_pool_size(&self) -> usize {
        self.initial_pool_size
    }

    /// Create the pool as children of the actor owning `ctx`
    pub fn create_routees<R: Actor>(&self, ctx: &Context<'_, R>) -> ActorResult<Vec<Routee<A::Protocol>>> {
        (0..self.initial_pool_size)
            .map(|_| {
                ctx.child_actor_for(self.routee_definition.clone())
                    .map(Routee::new)
            })
            .collect()
    }

    /// A router over a freshly created pool
    pub fn build<R: Actor>(
        &self,
        ctx: &Context<'_, R>,
        strategy: impl RoutingStrategy<A::Protocol> + 'static,
    ) -> ActorResult<Router<A::Protocol>> {
        Ok(Router::new(strategy).with_routees(self.create_routees(ctx)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::ProtocolSink;
    use crate::address::AddressFactory;
    use crate::completes;
    use parking_lot::Mutex;
    use std::collections::HashSet;
    use std::sync::Arc;

    /// Sink that records deliveries instead of dispatching them
    struct RecordingSink {
        address: Address,
        received: Mutex<Vec<u32>>,
    }

    impl ProtocolSink<u32> for RecordingSink {
        fn address(&self) -> &Address {
            &self.address
        }

        fn deliver(&self, message: u32) -> ActorResult<()> {
            self.received.lock().push(message);
            Ok(())
        }

        fn is_stopped(&self) -> bool {
            false
        }

        fn pending(&self) -> usize {
            self.received.lock().len()
        }

        fn completes_address(&self) -> Address {
            self.address.clone()
        }
    }

    fn sinks(count: usize) -> Vec<Arc<RecordingSink>> {
        let factory = AddressFactory::new();
        (0..count)
            .map(|_| {
                Arc::new(RecordingSink {
                    address: factory.unique(),
                    received: Mutex::new(Vec::new()),
                })
            })
            .collect()
    }

    fn routees(sinks: &[Arc<RecordingSink>]) -> Vec<Routee<u32>> {
        sinks
            .iter()
            .map(|sink| Routee::new(ActorRef::new(sink.clone())))
            .collect()
    }

    #[test]
    fn test_subscribe_is_idempotent() {
        let sinks = sinks(2);
        let mut router = Router::new(RoundRobinRouting::new()).with_routees(routees(&sinks));
        assert_eq!(router.routee_count(), 2);
        assert!(!router.subscribe(routees(&sinks)[0].clone()));
        assert!(router.unsubscribe(&sinks[0].address));
        assert!(!router.unsubscribe(&sinks[0].address));
        assert_eq!(router.routee_count(), 1);
    }

    #[test]
    fn test_round_robin() {
        let sinks = sinks(3);
        let mut router = Router::new(RoundRobinRouting::new()).with_routees(routees(&sinks));
        for i in 0..6 {
            router.route_command(i).unwrap();
        }
        assert_eq!(*sinks[0].received.lock(), vec![0, 3]);
        assert_eq!(*sinks[1].received.lock(), vec![1, 4]);
        assert_eq!(*sinks[2].received.lock(), vec![2, 5]);
    }

    #[test]
    fn test_random_covers_each_cycle() {
        let sinks = sinks(3);
        let routees = routees(&sinks);
        let mut strategy = RandomRouting::with_seed(7);
        for _ in 0..10 {
            let picked: HashSet<usize> = (0..3)
                .map(|_| RoutingStrategy::<u32>::select(&mut strategy, &routees))
                .collect();
            assert_eq!(picked.len(), 3);
        }
    }

    #[test]
    fn test_smallest_mailbox() {
        let sinks = sinks(3);
        sinks[0].received.lock().extend([1, 2]);
        sinks[2].received.lock().push(1);
        let mut router = Router::new(SmallestMailboxRouting).with_routees(routees(&sinks));
        router.route_command(9).unwrap();
        assert_eq!(*sinks[1].received.lock(), vec![9]);
    }

    #[test]
    fn test_empty_router() {
        let mut router: Router<u32> = Router::new(RoundRobinRouting::new());
        assert!(matches!(router.route_command(1), Err(ActorError::NoRoutees)));
        assert!(matches!(router.broadcast(1), Err(ActorError::NoRoutees)));

        let (reply, mut completes) = completes::pair::<u32>(Address::none());
        assert!(router.route_query_with(reply, |_| 1).is_err());
        assert!(matches!(completes.try_outcome(), Some(Err(ActorError::NoRoutees))));
    }

    #[test]
    fn test_broadcast() {
        let sinks = sinks(3);
        let router = Router::new(RoundRobinRouting::new()).with_routees(routees(&sinks));
        assert_eq!(router.broadcast(5).unwrap(), 3);
        assert!(sinks.iter().all(|sink| *sink.received.lock() == vec![5]));
    }
}
