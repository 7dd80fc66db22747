//! Runtime cell binding an actor to its mailbox and lifecycle
//!
//! The cell owns the actor's state behind a mutex that is never contended:
//! only the thread holding the mailbox's scheduling token touches it. System
//! messages (stop, restart, resume) are queued separately from user messages
//! and always handled first.

use crate::{
    actor::{Actor, Context, Definition, ProtocolSink, Recipe},
    address::Address,
    directory::ActorEntry,
    error::{ActorError, ActorResult},
    lifecycle::{AtomicLifecycle, LifecycleState, SystemMessage},
    logging::Logger,
    mailbox::{Dispatchable, Mailbox, MailboxOwner, MailboxStatus},
    stage::{Stage, WeakStage},
    supervision::{FailureMark, Supervisor},
};
use crossbeam_queue::SegQueue;
use parking_lot::Mutex;
use std::any::{type_name, Any, TypeId};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;
use tracing::{debug, info, trace, warn};

pub(crate) struct ActorCell<A: Actor> {
    me: Weak<ActorCell<A>>,
    address: Address,
    parent: Address,
    stage: WeakStage,
    logger: Arc<dyn Logger>,
    mailbox: Mailbox<A::Protocol>,
    system: SegQueue<SystemMessage>,
    state: Mutex<Option<A>>,
    recipe: Recipe<A>,
    supervisor: Option<Arc<dyn Supervisor>>,
    children: Mutex<Vec<Address>>,
    lifecycle: AtomicLifecycle,
    /// Set while a user message handler is executing
    handling: AtomicBool,
    stop_requested: AtomicBool,
    last_active: Mutex<Instant>,
    last_cause: Mutex<Option<ActorError>>,
    failure_mark: FailureMark,
    children_failure_mark: FailureMark,
    evictable: bool,
}

/// Run an actor callback, turning a panic into an error
fn guarded<T>(f: impl FnOnce() -> ActorResult<T>) -> ActorResult<T> {
    panic::catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(|payload| Err(ActorError::from_panic(payload)))
}

impl<A: Actor> ActorCell<A> {
    /// Build a cell around a constructed actor.
    ///
    /// The cell starts out holding its own scheduling token, so nothing is
    /// dispatched until [`release`](Self::release) after the start hook.
    pub(crate) fn new(
        stage: WeakStage,
        address: Address,
        parent: Address,
        definition: &Definition<A>,
        logger: Arc<dyn Logger>,
        actor: A,
    ) -> Arc<Self> {
        let cell = Arc::new_cyclic(|me| Self {
            me: me.clone(),
            address,
            parent,
            stage,
            logger,
            mailbox: Mailbox::new(),
            system: SegQueue::new(),
            state: Mutex::new(Some(actor)),
            recipe: definition.recipe.clone(),
            supervisor: definition.supervisor.clone(),
            children: Mutex::new(Vec::new()),
            lifecycle: AtomicLifecycle::new(LifecycleState::BeforeStart),
            handling: AtomicBool::new(false),
            stop_requested: AtomicBool::new(false),
            last_active: Mutex::new(Instant::now()),
            last_cause: Mutex::new(None),
            failure_mark: FailureMark::new(),
            children_failure_mark: FailureMark::new(),
            evictable: definition.evictable,
        });
        cell.mailbox.status().try_schedule();
        cell
    }

    pub(crate) fn address(&self) -> &Address {
        &self.address
    }

    pub(crate) fn parent(&self) -> &Address {
        &self.parent
    }

    pub(crate) fn logger(&self) -> &Arc<dyn Logger> {
        &self.logger
    }

    /// Run the before-start hook on the calling thread.
    ///
    /// On failure the actor state is discarded so the stop that follows
    /// skips the stop hook.
    pub(crate) fn start(self: &Arc<Self>, stage: &Stage) -> ActorResult<()> {
        let outcome = {
            let mut state = self.state.lock();
            match state.as_mut() {
                Some(actor) => {
                    let mut ctx = Context::new(self, stage);
                    guarded(|| actor.before_start(&mut ctx))
                }
                None => Err(ActorError::ActorStopped {
                    address: self.address.clone(),
                }),
            }
        };

        match &outcome {
            Ok(()) => {
                let _ = self
                    .lifecycle
                    .transition(LifecycleState::BeforeStart, LifecycleState::Running);
            }
            Err(_) => {
                self.state.lock().take();
            }
        }
        outcome
    }

    /// Drop the constructed actor without running any hook
    pub(crate) fn abandon(&self) {
        self.state.lock().take();
    }

    /// Give up the scheduling token taken at construction
    pub(crate) fn release(self: &Arc<Self>, stage: &Stage) {
        self.mailbox.status().unschedule();
        stage.dispatcher().schedule(self.clone());
    }

    fn drain_dead_letters(&self, stage: Option<&Stage>) -> usize {
        let dropped = self.mailbox.drain().len();
        if dropped > 0 {
            if let Some(stage) = stage {
                stage.metrics().dead_letters.inc_by(dropped as u64);
            }
            debug!(address = %self.address, dropped, "Dropped messages of stopped actor");
        }
        dropped
    }

    /// Returns the number of user messages dropped
    fn handle_system(self: &Arc<Self>, stage: &Stage, message: SystemMessage) -> usize {
        trace!(address = %self.address, message = %message, "System message");
        match message {
            SystemMessage::Stop => self.handle_stop(stage),
            SystemMessage::Restart(cause) => {
                self.handle_restart(stage, cause);
                0
            }
            SystemMessage::Resume => {
                self.handle_resume(stage);
                0
            }
        }
    }

    fn handle_stop(self: &Arc<Self>, stage: &Stage) -> usize {
        if self.lifecycle.load() == LifecycleState::Stopped {
            return 0;
        }
        self.lifecycle.store(LifecycleState::Stopping);

        let actor = self.state.lock().take();
        if let Some(mut actor) = actor {
            let mut ctx = Context::new(self, stage);
            if let Err(err) = guarded(|| {
                actor.after_stop(&mut ctx);
                Ok(())
            }) {
                self.logger.error("after_stop failed", Some(&err));
            }
            drop(actor);
            stage.metrics().actors_stopped.inc();
        }

        self.mailbox.status().close();
        let dropped = self.drain_dead_letters(Some(stage));
        self.children.lock().clear();
        self.lifecycle.store(LifecycleState::Stopped);
        stage.actor_terminated();
        debug!(address = %self.address, "Actor stopped");
        dropped
    }

    fn handle_restart(self: &Arc<Self>, stage: &Stage, cause: ActorError) {
        if self.lifecycle.load().is_terminal() || self.is_stop_requested() {
            return;
        }
        self.lifecycle.store(LifecycleState::Restarting);
        *self.last_cause.lock() = Some(cause.clone());

        let previous = self.state.lock().take();
        if let Some(mut old) = previous {
            let mut ctx = Context::new(self, stage);
            if let Err(err) = guarded(|| {
                old.before_restart(&cause, &mut ctx);
                Ok(())
            }) {
                self.logger.error("before_restart failed", Some(&err));
            }
        }

        let rebuilt = guarded(|| (self.recipe)()).and_then(|mut fresh| {
            let mut ctx = Context::new(self, stage);
            guarded(|| fresh.after_restart(&cause, &mut ctx)).map(|()| fresh)
        });

        match rebuilt {
            Ok(fresh) => {
                *self.state.lock() = Some(fresh);
                self.lifecycle.store(LifecycleState::Running);
                self.mailbox.status().resume();
                stage.metrics().restarts.inc();
                info!(address = %self.address, cause = %cause, "Actor restarted");
            }
            Err(err) => {
                self.logger.error("Restart failed; stopping actor", Some(&err));
                stage.stop_entry(self.clone());
            }
        }
    }

    fn handle_resume(self: &Arc<Self>, stage: &Stage) {
        if self.lifecycle.load() == LifecycleState::Suspended {
            let cause = self
                .last_cause
                .lock()
                .clone()
                .unwrap_or(ActorError::Internal {
                    reason: "resumed without a recorded failure".to_string(),
                });
            {
                let mut state = self.state.lock();
                if let Some(actor) = state.as_mut() {
                    let mut ctx = Context::new(self, stage);
                    if let Err(err) = guarded(|| {
                        actor.before_resume(&cause, &mut ctx);
                        Ok(())
                    }) {
                        self.logger.error("before_resume failed", Some(&err));
                    }
                }
            }
            let _ = self
                .lifecycle
                .transition(LifecycleState::Suspended, LifecycleState::Running);
        }
        self.mailbox.status().resume();
    }

    /// Handle user messages until the budget, the mailbox or the actor runs out
    fn deliver_user_messages(self: &Arc<Self>, stage: &Stage, throughput: usize) -> usize {
        let mut handled = 0;
        while handled < throughput {
            if self.mailbox.is_suspended() || !self.system.is_empty() {
                break;
            }

            self.handling.store(true, Ordering::SeqCst);
            if self.lifecycle.load() != LifecycleState::Running {
                self.handling.store(false, Ordering::SeqCst);
                break;
            }
            let Some(message) = self.mailbox.dequeue() else {
                self.handling.store(false, Ordering::SeqCst);
                break;
            };
            handled += 1;

            let outcome = {
                let mut state = self.state.lock();
                match state.as_mut() {
                    Some(actor) => {
                        let mut ctx = Context::new(self, stage);
                        guarded(|| actor.receive(message, &mut ctx))
                    }
                    None => {
                        stage.metrics().dead_letters.inc();
                        Ok(())
                    }
                }
            };
            *self.last_active.lock() = Instant::now();
            self.handling.store(false, Ordering::SeqCst);
            stage.metrics().messages_delivered.inc();

            if let Err(cause) = outcome {
                stage.metrics().record_failure(&cause);
                stage.handle_failure(self.clone(), cause);
                break;
            }
        }
        handled
    }
}

impl<A: Actor> Dispatchable for ActorCell<A> {
    fn address(&self) -> &Address {
        &self.address
    }

    fn status(&self) -> &MailboxStatus {
        self.mailbox.status()
    }

    fn is_runnable(&self) -> bool {
        if !self.system.is_empty() {
            return true;
        }
        if !self.mailbox.has_pending() {
            return false;
        }
        self.mailbox.is_closed()
            || (!self.mailbox.is_suspended() && self.lifecycle.load() == LifecycleState::Running)
    }

    fn dispatch(&self, throughput: usize) -> usize {
        let Some(me) = self.me.upgrade() else {
            return 0;
        };
        let Some(stage) = self.stage.upgrade() else {
            // stage dropped without a stop
            self.mailbox.status().close();
            while self.system.pop().is_some() {}
            return self.drain_dead_letters(None);
        };

        let mut taken = 0;
        while let Some(message) = self.system.pop() {
            taken += me.handle_system(&stage, message);
        }
        if self.mailbox.is_closed() {
            return taken + self.drain_dead_letters(Some(&stage));
        }
        taken + me.deliver_user_messages(&stage, throughput)
    }
}

impl<A: Actor> MailboxOwner<A::Protocol> for ActorCell<A> {
    fn mailbox(&self) -> &Mailbox<A::Protocol> {
        &self.mailbox
    }
}

impl<A: Actor> ActorEntry for ActorCell<A> {
    fn parent(&self) -> &Address {
        &self.parent
    }

    fn protocol_name(&self) -> &'static str {
        type_name::<A::Protocol>()
    }

    fn protocol_id(&self) -> TypeId {
        TypeId::of::<A::Protocol>()
    }

    fn lifecycle(&self) -> LifecycleState {
        self.lifecycle.load()
    }

    fn is_evictable(&self) -> bool {
        self.evictable
    }

    fn last_active(&self) -> Instant {
        *self.last_active.lock()
    }

    fn pending(&self) -> usize {
        self.mailbox.pending()
    }

    fn children(&self) -> Vec<Address> {
        self.children.lock().clone()
    }

    fn add_child(&self, child: Address) {
        let mut children = self.children.lock();
        if !children.contains(&child) {
            children.push(child);
        }
    }

    fn remove_child(&self, child: &Address) {
        self.children.lock().retain(|existing| existing != child);
    }

    fn system(&self, message: SystemMessage) {
        self.system.push(message);
        if let (Some(me), Some(stage)) = (self.me.upgrade(), self.stage.upgrade()) {
            stage.dispatcher().schedule(me);
        }
    }

    fn suspend(&self) {
        self.mailbox.status().suspend();
        let _ = self
            .lifecycle
            .transition(LifecycleState::Running, LifecycleState::Suspended);
    }

    fn request_stop(&self) -> bool {
        !self.stop_requested.swap(true, Ordering::AcqRel)
    }

    fn is_stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::Acquire)
    }

    fn try_claim_eviction(&self) -> bool {
        if self.is_stop_requested() {
            return false;
        }
        if self
            .lifecycle
            .transition(LifecycleState::Running, LifecycleState::Stopping)
            .is_err()
        {
            return false;
        }
        if self.handling.load(Ordering::SeqCst) || self.mailbox.has_pending() {
            let _ = self
                .lifecycle
                .transition(LifecycleState::Stopping, LifecycleState::Running);
            if let (Some(me), Some(stage)) = (self.me.upgrade(), self.stage.upgrade()) {
                stage.dispatcher().schedule(me);
            }
            return false;
        }
        true
    }

    fn supervisor(&self) -> Option<Arc<dyn Supervisor>> {
        self.supervisor.clone()
    }

    fn failure_mark(&self) -> &FailureMark {
        &self.failure_mark
    }

    fn children_failure_mark(&self) -> &FailureMark {
        &self.children_failure_mark
    }

    fn protocol_sink(&self) -> Option<Box<dyn Any + Send>> {
        let me = self.me.upgrade()?;
        let sink: Arc<dyn ProtocolSink<A::Protocol>> = me;
        Some(Box::new(sink))
    }
}

impl<A: Actor> ProtocolSink<A::Protocol> for ActorCell<A> {
    fn address(&self) -> &Address {
        &self.address
    }

    fn deliver(&self, message: A::Protocol) -> ActorResult<()> {
        let stopped = || ActorError::ActorStopped {
            address: self.address.clone(),
        };
        let Some(stage) = self.stage.upgrade() else {
            return Err(stopped());
        };
        let me = match self.me.upgrade() {
            Some(me) if !self.is_stop_requested() => me,
            _ => {
                stage.metrics().dead_letters.inc();
                return Err(stopped());
            }
        };
        let result = stage.dispatcher().send(&me, message);
        match &result {
            Err(ActorError::MailboxOverflow { capacity }) => {
                stage.metrics().mailbox_overflows.inc();
                warn!(address = %self.address, capacity, "Mailbox overflow");
            }
            Err(ActorError::ActorStopped { .. }) => {
                stage.metrics().dead_letters.inc();
            }
            _ => {}
        }
        result
    }

    fn is_stopped(&self) -> bool {
        self.is_stop_requested() || self.mailbox.is_closed()
    }

    fn pending(&self) -> usize {
        self.mailbox.pending()
    }

    fn completes_address(&self) -> Address {
        self.stage
            .upgrade()
            .map(|stage| stage.completes_provider().next_address())
            .unwrap_or_else(Address::none)
    }
}
