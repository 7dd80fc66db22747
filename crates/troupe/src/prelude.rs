//! Prelude module for convenient imports when writing actors

pub use crate::actor::{Actor, ActorRef, Context, Definition};
pub use crate::address::Address;
pub use crate::completes::{Completes, CompletesEventually};
pub use crate::config::StageConfig;
pub use crate::error::{ActorError, ActorResult};
pub use crate::router::{
    RandomRouting, RoundRobinRouting, Routee, Router, RouterSpecification, SmallestMailboxRouting,
};
pub use crate::stage::Stage;
pub use crate::supervision::{
    DefaultSupervisor, SupervisionScope, SupervisionStrategy, Supervised, Supervisor,
};

pub use std::{sync::Arc, time::Duration};
pub use tracing::{debug, error, info, trace, warn};
