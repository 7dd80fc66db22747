//! Troupe actor runtime
//!
//! Actors live inside a [`Stage`]. Each actor owns a mailbox that a shared
//! [`Dispatcher`](dispatcher::Dispatcher) drains on a fixed pool of worker
//! threads, one message at a time per actor. Actors form a supervision tree
//! rooted at the stage guardian; failures are reported to a [`Supervisor`]
//! that restarts, resumes, stops or escalates. Routers, asynchronous lookups
//! and directory eviction are built on top of the same primitives.

pub mod actor;
pub mod address;
pub(crate) mod cell;
pub mod completes;
pub mod config;
pub mod directory;
pub mod dispatcher;
pub mod error;
pub mod eviction;
pub mod lifecycle;
pub mod logging;
pub mod mailbox;
pub mod metrics;
pub mod router;
pub mod scanner;
pub mod scheduler;
pub mod stage;
pub mod supervision;
pub mod testing;

pub mod prelude;

// Re-exports for convenience
pub use actor::{Actor, ActorRef, Context, Definition, ProtocolSink, Recipe};
pub use address::{Address, AddressFactory};
pub use completes::{Completes, CompletesEventually};
pub use config::{BackpressureStrategy, DirectoryConfig, DispatcherConfig, StageConfig, Validate};
pub use error::{ActorError, ActorResult, ConfigError};
pub use eviction::DirectoryEvictionConfiguration;
pub use lifecycle::LifecycleState;
pub use logging::{Logger, NoOpLogger, TracingLogger};
pub use router::{
    RandomRouting, RoundRobinRouting, Routee, Router, RouterSpecification, RoutingStrategy,
    SmallestMailboxRouting,
};
pub use stage::{Stage, StageSupervised};
pub use supervision::{
    DefaultSupervisor, SupervisionScope, SupervisionStrategy, Supervised, Supervisor,
};
