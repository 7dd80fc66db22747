//! Stage: the actor lifecycle authority
//!
//! A stage owns the directory, the dispatcher, the scheduler and the
//! supervision defaults shared by its actors. Every actor of a stage descends
//! from a private guardian, so stopping the guardian stops everything.

use crate::{
    actor::{Actor, ActorRef, Context, Definition},
    address::{Address, AddressFactory},
    cell::ActorCell,
    completes::{Completes, PooledCompletesProvider},
    config::{StageConfig, Validate},
    directory::{same_entry, ActorEntry, Directory},
    dispatcher::Dispatcher,
    error::{ActorError, ActorResult},
    eviction::{DirectoryEvictionConfiguration, DirectoryEvictor, EvictionProbe},
    lifecycle::SystemMessage,
    logging::{Logger, TracingLogger},
    metrics::StageMetrics,
    scanner::{DirectoryScanner, ScanRequest},
    scheduler::{Cancellable, Scheduler},
    supervision::{DefaultSupervisor, SupervisionScope, Supervised, Supervisor},
};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::any::TypeId;
use std::convert::Infallible;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Attempts of the lookup-then-create loop before giving up on a racing address
const LOOKUP_OR_CREATE_ATTEMPTS: usize = 16;

/// Root of every actor hierarchy in a stage
struct Guardian;

impl Actor for Guardian {
    type Protocol = Infallible;

    fn receive(&mut self, message: Infallible, _ctx: &mut Context<'_, Self>) -> ActorResult<()> {
        match message {}
    }
}

struct StageInner {
    name: String,
    config: StageConfig,
    address_factory: AddressFactory,
    directory: Directory<Arc<dyn ActorEntry>>,
    dispatcher: Dispatcher,
    scheduler: Scheduler,
    completes: PooledCompletesProvider,
    common_supervisors: DashMap<TypeId, Arc<dyn Supervisor>>,
    default_supervisor: Arc<dyn Supervisor>,
    logger: Arc<dyn Logger>,
    metrics: StageMetrics,
    stopped: AtomicBool,
    /// Registered actors whose stop has not completed
    live: AtomicUsize,
    guardian: RwLock<Address>,
    scanner: Mutex<Option<ActorRef<ScanRequest>>>,
    eviction: Mutex<Option<Cancellable>>,
}

impl Drop for StageInner {
    fn drop(&mut self) {
        if !self.stopped.load(Ordering::Acquire) {
            debug!(stage = %self.name, "Stage dropped without stop; releasing threads");
        }
    }
}

/// Cheap clonable handle to a running stage
#[derive(Clone)]
pub struct Stage {
    inner: Arc<StageInner>,
}

/// Non-owning stage handle held by actor cells
#[derive(Clone)]
pub(crate) struct WeakStage {
    inner: Weak<StageInner>,
}

impl WeakStage {
    pub(crate) fn upgrade(&self) -> Option<Stage> {
        self.inner.upgrade().map(|inner| Stage { inner })
    }
}

impl Stage {
    /// Start a stage with the default `tracing` logger
    pub fn new(name: impl Into<String>, config: StageConfig) -> ActorResult<Self> {
        let name = name.into();
        let logger: Arc<dyn Logger> = Arc::new(TracingLogger::new(name.clone()));
        Self::with_logger(name, config, logger)
    }

    /// Start a stage with default configuration
    pub fn with_defaults(name: impl Into<String>) -> ActorResult<Self> {
        Self::new(name, StageConfig::default())
    }

    pub fn with_logger(
        name: impl Into<String>,
        config: StageConfig,
        logger: Arc<dyn Logger>,
    ) -> ActorResult<Self> {
        let name = name.into();
        config.validate()?;

        let metrics = StageMetrics::new(&name)?;
        let dispatcher = Dispatcher::start(&name, config.dispatcher.clone())?;
        let scheduler = Scheduler::new(&name)?;
        let address_factory = AddressFactory::new();
        let completes = PooledCompletesProvider::new(&address_factory, config.completes_pool_size);
        let default_supervisor: Arc<dyn Supervisor> =
            Arc::new(DefaultSupervisor::new(config.default_supervision.clone()));

        let stage = Stage {
            inner: Arc::new(StageInner {
                directory: Directory::new(
                    config.directory.buckets,
                    config.directory.initial_capacity,
                ),
                name: name.clone(),
                config,
                address_factory,
                dispatcher,
                scheduler,
                completes,
                common_supervisors: DashMap::new(),
                default_supervisor,
                logger,
                metrics,
                stopped: AtomicBool::new(false),
                live: AtomicUsize::new(0),
                guardian: RwLock::new(Address::none()),
                scanner: Mutex::new(None),
                eviction: Mutex::new(None),
            }),
        };

        let guardian = stage.create(
            Definition::new(|| Guardian)
                .named("guardian")
                .with_parent(Address::none())
                .not_evictable(),
        )?;
        *stage.inner.guardian.write() = guardian.address().clone();

        let scanner = stage.create(
            Definition::new(|| DirectoryScanner)
                .named("directory-scanner")
                .not_evictable(),
        )?;
        *stage.inner.scanner.lock() = Some(scanner);

        stage.start_eviction_if_configured(false)?;

        info!(
            stage = %name,
            pool_size = stage.inner.config.dispatcher.pool_size,
            "Stage started"
        );
        Ok(stage)
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn config(&self) -> &StageConfig {
        &self.inner.config
    }

    pub fn logger(&self) -> &Arc<dyn Logger> {
        &self.inner.logger
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.inner.scheduler
    }

    pub fn address_factory(&self) -> &AddressFactory {
        &self.inner.address_factory
    }

    pub fn metrics(&self) -> &StageMetrics {
        &self.inner.metrics
    }

    pub fn completes_provider(&self) -> &PooledCompletesProvider {
        &self.inner.completes
    }

    pub(crate) fn directory(&self) -> &Directory<Arc<dyn ActorEntry>> {
        &self.inner.directory
    }

    pub(crate) fn dispatcher(&self) -> &Dispatcher {
        &self.inner.dispatcher
    }

    pub(crate) fn downgrade(&self) -> WeakStage {
        WeakStage {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Called once by a registered actor when its stop completes
    pub(crate) fn actor_terminated(&self) {
        let _ = self
            .inner
            .live
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |live| live.checked_sub(1));
    }

    /// Actors registered and not yet through their stop hook
    pub fn live_count(&self) -> usize {
        self.inner.live.load(Ordering::Acquire)
    }

    /// Address of the guardian, parent of all root actors
    pub fn guardian_address(&self) -> Address {
        self.inner.guardian.read().clone()
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::Acquire)
    }

    /// Whether an evictor is running
    pub fn supports_evictions(&self) -> bool {
        self.inner.eviction.lock().is_some()
    }

    /// Number of registered actors, internal actors included
    pub fn count(&self) -> usize {
        self.inner.directory.count()
    }

    /// Create an actor from its definition
    pub fn create<A: Actor>(&self, definition: Definition<A>) -> ActorResult<ActorRef<A::Protocol>> {
        if self.is_stopped() {
            return Err(ActorError::StageStopped {
                stage: self.inner.name.clone(),
            });
        }

        let parent = definition
            .parent
            .clone()
            .unwrap_or_else(|| self.guardian_address());
        let parent_entry = if parent.is_none() {
            None
        } else {
            match self.inner.directory.actor_of(&parent) {
                Some(entry) if !entry.is_stop_requested() => Some(entry),
                _ => return Err(ActorError::ActorStopped { address: parent }),
            }
        };

        let address = match (&definition.address, &definition.name) {
            (Some(address), _) => address.clone(),
            (None, Some(name)) => self.inner.address_factory.unique_with(name.as_str()),
            (None, None) => self.inner.address_factory.unique(),
        };
        if self.inner.directory.is_registered(&address) {
            return Err(ActorError::AddressAlreadyRegistered { address });
        }

        let logger = definition
            .logger
            .clone()
            .unwrap_or_else(|| self.inner.logger.clone());

        let actor = panic::catch_unwind(AssertUnwindSafe(|| definition.instantiate()))
            .unwrap_or_else(|payload| Err(ActorError::from_panic(payload)))
            .map_err(|cause| {
                logger.error("Actor construction failed", Some(&cause));
                ActorError::ActorCreationFailed {
                    address: address.clone(),
                    reason: cause.to_string(),
                }
            })?;

        let cell = ActorCell::new(
            self.downgrade(),
            address.clone(),
            parent,
            &definition,
            logger.clone(),
            actor,
        );
        let entry: Arc<dyn ActorEntry> = cell.clone();
        self.inner.directory.register(address.clone(), entry.clone())?;
        self.inner.live.fetch_add(1, Ordering::AcqRel);
        self.inner.metrics.directory_size.inc();
        if let Some(parent_entry) = &parent_entry {
            parent_entry.add_child(address.clone());
            // a parent stopping concurrently may have missed the new child
            if parent_entry.is_stop_requested() {
                cell.abandon();
                self.stop_entry(entry);
                cell.release(self);
                return Err(ActorError::ActorStopped {
                    address: parent_entry.address().clone(),
                });
            }
        }

        let started = cell.start(self);
        if started.is_err() {
            self.stop_entry(entry);
        }
        cell.release(self);

        match started {
            Ok(()) => {
                self.inner.metrics.actors_created.inc();
                debug!(stage = %self.inner.name, address = %address, "Actor created");
                Ok(ActorRef::new(cell))
            }
            Err(cause) => {
                logger.error("Actor failed to start", Some(&cause));
                Err(ActorError::ActorCreationFailed {
                    address,
                    reason: cause.to_string(),
                })
            }
        }
    }

    /// Synchronous typed lookup
    pub fn actor_of<P: Send + 'static>(&self, address: &Address) -> Option<ActorRef<P>> {
        self.inner
            .directory
            .actor_of(address)
            .and_then(|entry| ActorRef::from_entry(&entry))
    }

    /// Return the actor at `address`, creating it from `definition` if absent
    pub fn lookup_or_create<A: Actor>(
        &self,
        definition: Definition<A>,
        address: Address,
    ) -> ActorResult<ActorRef<A::Protocol>> {
        let definition = definition.with_address(address.clone());
        let mut last_error = None;
        for _ in 0..LOOKUP_OR_CREATE_ATTEMPTS {
            if let Some(entry) = self.inner.directory.actor_of(&address) {
                return ActorRef::try_from_entry(&entry);
            }
            match self.create(definition.clone()) {
                Err(err @ ActorError::AddressAlreadyRegistered { .. }) => last_error = Some(err),
                other => return other,
            }
        }
        Err(last_error.unwrap_or(ActorError::AddressAlreadyRegistered { address }))
    }

    /// Look up `address` without blocking; `None` if absent or of another protocol
    pub fn resolve<P: Send + 'static>(&self, address: &Address) -> Completes<Option<ActorRef<P>>> {
        let (eventually, completes) = self.inner.completes.provide();
        self.scan(ScanRequest::new(address.clone(), move |_stage, entry| {
            eventually.with(entry.and_then(|entry| ActorRef::<P>::from_entry(&entry)));
        }));
        completes
    }

    /// Asynchronous [`lookup_or_create`](Self::lookup_or_create)
    pub fn resolve_or_create<A: Actor>(
        &self,
        definition: Definition<A>,
        address: Address,
    ) -> Completes<ActorRef<A::Protocol>> {
        let (eventually, completes) = self.inner.completes.provide();
        let target = address.clone();
        self.scan(ScanRequest::new(address, move |stage, entry| {
            let outcome = match entry {
                Some(entry) => ActorRef::try_from_entry(&entry),
                None => stage.lookup_or_create(definition, target),
            };
            match outcome {
                Ok(actor) => eventually.with(actor),
                Err(err) => eventually.fail(err),
            };
        }));
        completes
    }

    fn scan(&self, request: ScanRequest) {
        let scanner = self.inner.scanner.lock().clone();
        match scanner {
            Some(scanner) => {
                if let Err(err) = scanner.tell(request) {
                    warn!(stage = %self.inner.name, error = %err, "Directory scan rejected");
                }
            }
            None => debug!(stage = %self.inner.name, "Directory scanner unavailable"),
        }
    }

    /// Supervisor for every actor of protocol `P` without its own supervisor
    pub fn register_common_supervisor<P: 'static>(&self, supervisor: Arc<dyn Supervisor>) {
        self.inner
            .common_supervisors
            .insert(TypeId::of::<P>(), supervisor);
    }

    fn supervisor_for(&self, entry: &Arc<dyn ActorEntry>) -> Arc<dyn Supervisor> {
        entry
            .supervisor()
            .or_else(|| {
                self.inner
                    .common_supervisors
                    .get(&entry.protocol_id())
                    .map(|supervisor| supervisor.value().clone())
            })
            .unwrap_or_else(|| self.inner.default_supervisor.clone())
    }

    /// Suspend a failed actor and let its supervisor decide
    pub(crate) fn handle_failure(&self, entry: Arc<dyn ActorEntry>, cause: ActorError) {
        entry.suspend();
        self.inner.metrics.supervision_informed.inc();
        warn!(
            stage = %self.inner.name,
            address = %entry.address(),
            cause = %cause,
            "Actor failed; informing supervisor"
        );

        let supervisor = self.supervisor_for(&entry);
        let supervised = StageSupervised {
            stage: self.clone(),
            entry: entry.clone(),
            cause: cause.clone(),
            supervisor: supervisor.clone(),
        };
        if let Err(payload) =
            panic::catch_unwind(AssertUnwindSafe(|| supervisor.inform(&cause, &supervised)))
        {
            let err = ActorError::from_panic(payload);
            self.inner.logger.error("Supervisor panicked; stopping actor", Some(&err));
            self.stop_entry(entry);
        }
    }

    /// Stop the actor at `address` and its descendants
    pub fn stop_actor(&self, address: &Address) -> bool {
        match self.inner.directory.actor_of(address) {
            Some(entry) => self.stop_entry(entry),
            None => false,
        }
    }

    /// Depth-first stop: children first, then unregister, then the stop hook.
    ///
    /// Returns false if a stop was already requested.
    pub(crate) fn stop_entry(&self, entry: Arc<dyn ActorEntry>) -> bool {
        if !entry.request_stop() {
            return false;
        }
        for child in entry.children() {
            if let Some(child) = self.inner.directory.actor_of(&child) {
                self.stop_entry(child);
            }
        }
        self.unregister(&entry);
        if let Some(parent) = self.inner.directory.actor_of(entry.parent()) {
            parent.remove_child(entry.address());
        }
        entry.system(SystemMessage::Stop);
        true
    }

    fn unregister(&self, entry: &Arc<dyn ActorEntry>) {
        if self
            .inner
            .directory
            .remove_if(entry.address(), |existing| same_entry(existing, entry))
            .is_some()
        {
            self.inner.metrics.directory_size.dec();
        }
    }

    /// Start the evictor if the effective configuration enables it
    pub fn start_eviction_if_configured(&self, force: bool) -> ActorResult<bool> {
        let Some(config) =
            DirectoryEvictionConfiguration::effective(self.inner.config.eviction.as_ref(), force)
        else {
            return Ok(false);
        };
        if !config.enabled {
            return Ok(false);
        }
        if config.is_excluded(&self.inner.name) {
            info!(stage = %self.inner.name, "Eviction disabled for excluded stage");
            return Ok(false);
        }

        let mut eviction = self.inner.eviction.lock();
        if eviction.is_some() {
            return Ok(true);
        }

        let interval = config.lru_probe_interval;
        let threshold = config.lru_threshold;
        let mark = config.full_ratio_high_mark;
        let evictor = self.create(
            Definition::new(move || DirectoryEvictor::new(config.clone()))
                .named("directory-evictor")
                .not_evictable(),
        )?;
        let probe = self.inner.scheduler.schedule_recurring(
            move || {
                let _ = evictor.tell(EvictionProbe);
            },
            interval,
            interval,
        )?;
        *eviction = Some(probe);

        info!(
            stage = %self.inner.name,
            probe_interval_ms = interval.as_millis() as u64,
            threshold_ms = threshold.as_millis() as u64,
            high_mark = mark,
            "Directory eviction started"
        );
        Ok(true)
    }

    /// Stop every actor and release the stage's threads; repeated calls are no-ops
    pub fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(stage = %self.inner.name, actors = self.count(), "Stopping stage");

        if let Some(eviction) = self.inner.eviction.lock().take() {
            eviction.cancel();
        }

        let deadline = Instant::now() + self.stop_drain_budget();
        self.stop_actor(&self.guardian_address());

        // a handler stopping its own stage cannot wait on its own thread
        let on_dispatcher = self.inner.dispatcher.is_dispatcher_thread();
        if !on_dispatcher {
            let interval = self.inner.config.stop_drain_interval;
            while self.live_count() > 0 && Instant::now() < deadline {
                thread::sleep(interval.min(deadline.saturating_duration_since(Instant::now())));
            }
        }

        let stragglers = self.inner.directory.all();
        if !stragglers.is_empty() {
            warn!(
                stage = %self.inner.name,
                stragglers = stragglers.len(),
                "Stopping actors left after drain"
            );
            for entry in stragglers {
                if !self.stop_entry(entry.clone()) {
                    self.unregister(&entry);
                }
            }
        }

        self.inner.scanner.lock().take();
        self.inner.scheduler.close();
        let remaining = deadline.saturating_duration_since(Instant::now());
        if !self.inner.dispatcher.close_within(remaining) && !on_dispatcher {
            warn!(
                stage = %self.inner.name,
                live = self.live_count(),
                "Stage stopped with handlers still running"
            );
        }
        info!(stage = %self.inner.name, "Stage stopped");
    }

    /// Log every live actor through the stage logger when debug is enabled
    pub fn dump(&self) {
        let logger = &self.inner.logger;
        if !logger.is_enabled() {
            return;
        }
        logger.debug(&format!(
            "Stage {} has {} actors",
            self.inner.name,
            self.count()
        ));
        for entry in self.inner.directory.all() {
            logger.debug(&format!(
                "{} parent={} protocol={} state={} pending={} children={}",
                entry.address(),
                entry.parent(),
                entry.protocol_name(),
                entry.lifecycle(),
                entry.pending(),
                entry.children().len()
            ));
        }
    }

    /// Time a stop waits at most for stragglers
    pub fn stop_drain_budget(&self) -> Duration {
        self.inner.config.stop_drain_interval * self.inner.config.stop_drain_retries
    }
}

impl fmt::Debug for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stage")
            .field("name", &self.inner.name)
            .field("actors", &self.count())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

/// A failed actor as presented to its supervisor
pub struct StageSupervised {
    stage: Stage,
    entry: Arc<dyn ActorEntry>,
    cause: ActorError,
    supervisor: Arc<dyn Supervisor>,
}

impl StageSupervised {
    fn parent_entry(&self) -> Option<Arc<dyn ActorEntry>> {
        self.stage.inner.directory.actor_of(self.entry.parent())
    }

    /// The failing actor, or it and its siblings
    fn targets(&self, scope: SupervisionScope) -> Vec<Arc<dyn ActorEntry>> {
        match (scope, self.parent_entry()) {
            (SupervisionScope::All, Some(parent)) => {
                let mut targets: Vec<_> = parent
                    .children()
                    .iter()
                    .filter_map(|child| self.stage.inner.directory.actor_of(child))
                    .collect();
                if !targets.iter().any(|target| same_entry(target, &self.entry)) {
                    targets.push(self.entry.clone());
                }
                targets
            }
            _ => vec![self.entry.clone()],
        }
    }
}

impl Supervised for StageSupervised {
    fn address(&self) -> &Address {
        self.entry.address()
    }

    fn cause(&self) -> &ActorError {
        &self.cause
    }

    fn restart_within(&self, period: Duration, intensity: u32, scope: SupervisionScope) {
        let exceeded = match (scope, self.parent_entry()) {
            (SupervisionScope::All, Some(parent)) => parent
                .children_failure_mark()
                .failed_with_excessive_failures(period, intensity),
            _ => self
                .entry
                .failure_mark()
                .failed_with_excessive_failures(period, intensity),
        };

        if exceeded {
            info!(
                address = %self.entry.address(),
                intensity,
                period_ms = period.as_millis() as u64,
                "Restart intensity exceeded; stopping"
            );
            self.stop(scope);
            return;
        }

        for target in self.targets(scope) {
            target.system(SystemMessage::Restart(self.cause.clone()));
        }
    }

    fn resume(&self) {
        self.entry.system(SystemMessage::Resume);
    }

    fn stop(&self, scope: SupervisionScope) {
        for target in self.targets(scope) {
            self.stage.stop_entry(target);
        }
    }

    fn escalate(&self) {
        let parent = self.parent_entry();
        self.stage.stop_entry(self.entry.clone());
        match parent {
            Some(parent) if *parent.address() != self.stage.guardian_address() => {
                error!(
                    child = %self.entry.address(),
                    parent = %parent.address(),
                    "Escalating failure to parent"
                );
                self.stage.handle_failure(
                    parent,
                    ActorError::Escalated {
                        child: self.entry.address().clone(),
                        cause: Box::new(self.cause.clone()),
                    },
                );
            }
            _ => debug!(address = %self.entry.address(), "Escalation reached the guardian"),
        }
    }

    fn suspend(&self) {
        self.entry.suspend();
    }

    fn supervisor(&self) -> Arc<dyn Supervisor> {
        self.supervisor.clone()
    }
}
