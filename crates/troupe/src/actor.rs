//! Core actor definitions and traits

use crate::{
    address::Address,
    cell::ActorCell,
    completes::{self, Completes, CompletesEventually},
    directory::ActorEntry,
    error::{ActorError, ActorResult},
    logging::Logger,
    stage::Stage,
    supervision::Supervisor,
};
use std::any::type_name;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// A unit of state that handles one message at a time.
///
/// Handlers run on dispatcher threads, never concurrently for the same actor.
/// Returning an error (or panicking) hands the actor to its supervisor.
pub trait Actor: Send + Sized + 'static {
    /// The message type this actor accepts
    type Protocol: Send + 'static;

    /// Handle one message
    fn receive(&mut self, message: Self::Protocol, ctx: &mut Context<'_, Self>) -> ActorResult<()>;

    /// Called once after registration, before any message is delivered.
    ///
    /// A failure here aborts the creation and unregisters the actor.
    fn before_start(&mut self, _ctx: &mut Context<'_, Self>) -> ActorResult<()> {
        Ok(())
    }

    /// Called once when the actor stops
    fn after_stop(&mut self, _ctx: &mut Context<'_, Self>) {}

    /// Called on the failed instance before it is replaced
    fn before_restart(&mut self, _cause: &ActorError, ctx: &mut Context<'_, Self>) {
        self.after_stop(ctx);
    }

    /// Called on the fresh instance after a restart
    fn after_restart(&mut self, _cause: &ActorError, ctx: &mut Context<'_, Self>) -> ActorResult<()> {
        self.before_start(ctx)
    }

    /// Called before delivery resumes with the current state
    fn before_resume(&mut self, _cause: &ActorError, _ctx: &mut Context<'_, Self>) {}
}

/// Runtime view handed to an actor's handlers
pub struct Context<'a, A: Actor> {
    cell: &'a Arc<ActorCell<A>>,
    stage: &'a Stage,
}

impl<'a, A: Actor> Context<'a, A> {
    pub(crate) fn new(cell: &'a Arc<ActorCell<A>>, stage: &'a Stage) -> Self {
        Self { cell, stage }
    }

    pub fn address(&self) -> &Address {
        self.cell.address()
    }

    pub fn parent(&self) -> &Address {
        self.cell.parent()
    }

    pub fn stage(&self) -> &Stage {
        self.stage
    }

    pub fn logger(&self) -> &Arc<dyn Logger> {
        self.cell.logger()
    }

    /// Handle to this actor
    pub fn self_ref(&self) -> ActorRef<A::Protocol> {
        ActorRef::new(self.cell.clone())
    }

    /// Addresses of live children in creation order
    pub fn children(&self) -> Vec<Address> {
        ActorEntry::children(self.cell.as_ref())
    }

    /// Create an actor whose parent is this actor
    pub fn child_actor_for<C: Actor>(
        &self,
        definition: Definition<C>,
    ) -> ActorResult<ActorRef<C::Protocol>> {
        self.stage()
            .create(definition.with_parent(self.address().clone()))
    }

    /// A fresh eventual result from the stage pool
    pub fn completes<T>(&self) -> (CompletesEventually<T>, Completes<T>) {
        self.stage().completes_provider().provide()
    }

    /// Stop this actor and its children
    pub fn stop(&self) {
        self.stage().stop_actor(self.address());
    }

    pub fn is_stopped(&self) -> bool {
        ActorEntry::is_stop_requested(self.cell.as_ref())
    }
}

/// Delivery endpoint behind an [`ActorRef`]
pub trait ProtocolSink<P>: Send + Sync {
    fn address(&self) -> &Address;

    fn deliver(&self, message: P) -> ActorResult<()>;

    fn is_stopped(&self) -> bool;

    fn pending(&self) -> usize;

    /// Address tagging eventual results created for queries to this actor
    fn completes_address(&self) -> Address;
}

/// Protocol-typed handle to an actor
pub struct ActorRef<P> {
    sink: Arc<dyn ProtocolSink<P>>,
}

impl<P: Send + 'static> ActorRef<P> {
    pub fn new(sink: Arc<dyn ProtocolSink<P>>) -> Self {
        Self { sink }
    }

    /// Recover a typed handle from a directory entry; `None` on protocol mismatch
    pub fn from_entry(entry: &Arc<dyn ActorEntry>) -> Option<Self> {
        entry
            .protocol_sink()?
            .downcast::<Arc<dyn ProtocolSink<P>>>()
            .ok()
            .map(|sink| Self { sink: *sink })
    }

    /// Like [`from_entry`](Self::from_entry) but reporting the mismatch
    pub(crate) fn try_from_entry(entry: &Arc<dyn ActorEntry>) -> ActorResult<Self> {
        Self::from_entry(entry).ok_or_else(|| ActorError::ProtocolMismatch {
            address: entry.address().clone(),
            expected: type_name::<P>(),
            found: entry.protocol_name(),
        })
    }

    /// Enqueue a message; never waits for the handler
    pub fn tell(&self, message: P) -> ActorResult<()> {
        self.sink.deliver(message)
    }

    /// Send a message carrying a reply handle and return the caller's side
    pub fn ask<T, F>(&self, make: F) -> ActorResult<Completes<T>>
    where
        F: FnOnce(CompletesEventually<T>) -> P,
    {
        let (eventually, completes) = completes::pair(self.sink.completes_address());
        self.tell(make(eventually))?;
        Ok(completes)
    }

    pub fn address(&self) -> &Address {
        self.sink.address()
    }

    pub fn is_stopped(&self) -> bool {
        self.sink.is_stopped()
    }

    /// Messages waiting in the actor's mailbox
    pub fn pending(&self) -> usize {
        self.sink.pending()
    }
}

impl<P> Clone for ActorRef<P> {
    fn clone(&self) -> Self {
        Self {
            sink: self.sink.clone(),
        }
    }
}

impl<P> PartialEq for ActorRef<P> {
    fn eq(&self, other: &Self) -> bool {
        self.sink.address() == other.sink.address()
    }
}

impl<P> Eq for ActorRef<P> {}

impl<P> Hash for ActorRef<P> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.sink.address().hash(state);
    }
}

impl<P> fmt::Debug for ActorRef<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ActorRef<{}>({})", type_name::<P>(), self.sink.address())
    }
}

/// Construction recipe of an actor, re-run on restart
pub type Recipe<A> = Arc<dyn Fn() -> ActorResult<A> + Send + Sync>;

/// Recipe plus creation options
pub struct Definition<A: Actor> {
    pub(crate) recipe: Recipe<A>,
    pub(crate) address: Option<Address>,
    pub(crate) name: Option<String>,
    pub(crate) parent: Option<Address>,
    pub(crate) supervisor: Option<Arc<dyn Supervisor>>,
    pub(crate) logger: Option<Arc<dyn Logger>>,
    pub(crate) evictable: bool,
}

impl<A: Actor> Definition<A> {
    /// Definition from an infallible constructor
    pub fn new<F>(recipe: F) -> Self
    where
        F: Fn() -> A + Send + Sync + 'static,
    {
        Self::try_new(move || Ok(recipe()))
    }

    /// Definition from a fallible constructor
    pub fn try_new<F>(recipe: F) -> Self
    where
        F: Fn() -> ActorResult<A> + Send + Sync + 'static,
    {
        Self {
            recipe: Arc::new(recipe),
            address: None,
            name: None,
            parent: None,
            supervisor: None,
            logger: None,
            evictable: true,
        }
    }

    /// Use a caller-chosen address
    pub fn with_address(mut self, address: Address) -> Self {
        self.address = Some(address);
        self
    }

    /// Name attached to a freshly allocated address
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_parent(mut self, parent: Address) -> Self {
        self.parent = Some(parent);
        self
    }

    /// Supervisor for this actor, overriding common and default supervisors
    pub fn supervised_by(mut self, supervisor: Arc<dyn Supervisor>) -> Self {
        self.supervisor = Some(supervisor);
        self
    }

    pub fn with_logger(mut self, logger: Arc<dyn Logger>) -> Self {
        self.logger = Some(logger);
        self
    }

    /// Exclude the actor from directory eviction
    pub fn not_evictable(mut self) -> Self {
        self.evictable = false;
        self
    }

    pub fn address(&self) -> Option<&Address> {
        self.address.as_ref()
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn is_evictable(&self) -> bool {
        self.evictable
    }

    /// Run the recipe once
    pub(crate) fn instantiate(&self) -> ActorResult<A> {
        (self.recipe)()
    }
}

impl<A: Actor> Clone for Definition<A> {
    fn clone(&self) -> Self {
        Self {
            recipe: self.recipe.clone(),
            address: self.address.clone(),
            name: self.name.clone(),
            parent: self.parent.clone(),
            supervisor: self.supervisor.clone(),
            logger: self.logger.clone(),
            evictable: self.evictable,
        }
    }
}

impl<A: Actor> fmt::Debug for Definition<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Definition")
            .field("actor", &type_name::<A>())
            .field("address", &self.address)
            .field("name", &self.name)
            .field("parent", &self.parent)
            .field("evictable", &self.evictable)
            .finish()
    }
}
