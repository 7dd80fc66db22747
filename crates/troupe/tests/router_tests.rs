//! Router actors over pools of child routees

mod common;

use common::{test_stage, WAIT};
use std::collections::{HashMap, HashSet};
use std::thread;
use troupe::{
    Actor, ActorError, ActorRef, ActorResult, Address, CompletesEventually, Context, Definition,
    RandomRouting, RoundRobinRouting, Router, RouterSpecification, RoutingStrategy,
};

const ROUTEES: usize = 3;
const CLIENTS: usize = 3;
const ROUNDS: usize = 10;

enum WorkerProtocol {
    Which(CompletesEventually<Address>),
}

/// Routee answering with its own address
struct Worker;

impl Actor for Worker {
    type Protocol = WorkerProtocol;

    fn receive(&mut self, message: WorkerProtocol, ctx: &mut Context<'_, Self>) -> ActorResult<()> {
        match message {
            WorkerProtocol::Which(reply) => {
                reply.with(ctx.address().clone());
            }
        }
        Ok(())
    }
}

enum RouterProtocol {
    Query(CompletesEventually<Address>),
}

/// Owns a router over `pool_size` workers created at start
struct Pool<S> {
    pool_size: usize,
    strategy: fn() -> S,
    router: Option<Router<WorkerProtocol>>,
}

impl<S> Pool<S> {
    fn new(pool_size: usize, strategy: fn() -> S) -> Self {
        Self {
            pool_size,
            strategy,
            router: None,
        }
    }
}

fn seeded_random() -> RandomRouting {
    RandomRouting::with_seed(7)
}

impl<S> Actor for Pool<S>
where
    S: RoutingStrategy<WorkerProtocol> + 'static,
{
    type Protocol = RouterProtocol;

    fn before_start(&mut self, ctx: &mut Context<'_, Self>) -> ActorResult<()> {
        let specification = RouterSpecification::new(self.pool_size, Definition::new(|| Worker));
        self.router = Some(specification.build(ctx, (self.strategy)())?);
        Ok(())
    }

    fn receive(&mut self, message: RouterProtocol, ctx: &mut Context<'_, Self>) -> ActorResult<()> {
        let Some(router) = self.router.as_mut() else {
            return Err(ActorError::NoRoutees);
        };
        match message {
            RouterProtocol::Query(reply) => {
                if let Err(err) = router.route_query_with(reply, WorkerProtocol::Which) {
                    ctx.logger().debug(&format!("query not routed: {err}"));
                }
            }
        }
        Ok(())
    }
}

fn query(router: &ActorRef<RouterProtocol>) -> ActorResult<Address> {
    router.ask(RouterProtocol::Query)?.outcome_within(WAIT)
}

fn assert_rounds_cover_every_routee(answers: &[Address]) {
    for round in answers.chunks(ROUTEES) {
        let distinct: HashSet<_> = round.iter().collect();
        assert_eq!(distinct.len(), ROUTEES, "round {round:?} repeated a routee");
    }
}

#[test]
fn test_round_robin_pool_answers_each_round_once_per_routee() {
    let stage = test_stage("round-robin");
    let router = stage
        .create(Definition::new(|| Pool::new(ROUTEES, RoundRobinRouting::new)))
        .unwrap();

    let answers: Vec<_> = (0..ROUTEES * ROUNDS)
        .map(|_| query(&router).unwrap())
        .collect();

    assert_rounds_cover_every_routee(&answers);
    // routees are children of the router actor
    let distinct: HashSet<_> = answers.iter().collect();
    for address in distinct {
        assert!(stage.actor_of::<WorkerProtocol>(address).is_some());
    }
    stage.stop();
}

#[test]
fn test_random_pool_draws_without_replacement() {
    let stage = test_stage("random");
    let router = stage
        .create(Definition::new(|| Pool::new(ROUTEES, seeded_random)))
        .unwrap();

    let answers: Vec<_> = (0..ROUTEES * ROUNDS)
        .map(|_| query(&router).unwrap())
        .collect();

    assert_rounds_cover_every_routee(&answers);
    stage.stop();
}

#[test]
fn test_concurrent_clients_spread_evenly() {
    let stage = test_stage("clients");
    let router = stage
        .create(Definition::new(|| Pool::new(ROUTEES, RoundRobinRouting::new)))
        .unwrap();

    let clients: Vec<_> = (0..CLIENTS)
        .map(|_| {
            let router = router.clone();
            thread::spawn(move || {
                (0..ROUNDS)
                    .map(|_| query(&router).unwrap())
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    let mut per_routee: HashMap<Address, usize> = HashMap::new();
    for client in clients {
        for address in client.join().unwrap() {
            *per_routee.entry(address).or_default() += 1;
        }
    }

    assert_eq!(per_routee.len(), ROUTEES);
    assert!(per_routee.values().all(|count| *count == CLIENTS * ROUNDS / ROUTEES));
    stage.stop();
}

#[test]
fn test_empty_pool_fails_queries() {
    let stage = test_stage("empty-pool");
    let router = stage
        .create(Definition::new(|| Pool::new(0, RoundRobinRouting::new)))
        .unwrap();

    assert!(matches!(query(&router), Err(ActorError::NoRoutees)));
    stage.stop();
}
