use crate::concurrency::{completion, panic_message, CancelToken, WaitError, WorkerPool};
use crate::config::{EngineConfig, InstallMode};
use crate::events::{ListenerId, TransitionListener, TransitionListeners, TransitionScope};
use crate::lifecycle::{self, validate_transition};
use crate::CoreError;
use lifeline_model::{
    ProjectId, Transition, TransitionError, UnitDescriptor, UnitId, UnitNode, UnitState,
};
use lifeline_registry::{ExternalUnit, Registry};
use lifeline_wiring::{
    CandidateGroups, ContentStream, DuplicateFilter, LocationResolver, RefreshEvent,
    RefreshListener, StartOptions, StopOptions, UnitHandle, WiringEngine, WiringError,
};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Outcome of a batch resolve. Units the engine left unresolved carry a
/// sticky `Error` on their node; the call itself still succeeds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ResolveReport {
    pub resolved: Vec<UnitId>,
    pub unresolved: Vec<UnitId>,
}

impl ResolveReport {
    pub fn is_complete(&self) -> bool {
        self.unresolved.is_empty()
    }
}

/// Outcome of a refresh, as reported by the engine's completion event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RefreshReport {
    pub refreshed: Vec<UnitId>,
    pub failed: BTreeMap<UnitId, String>,
}

/// Central API for moving Lifeline units through their lifecycle.
///
/// Every command validates its precondition against the registry, calls the
/// wiring engine, then commits or rolls back the affected nodes and emits one
/// transition event per node. Start and stop may be bounded by a timeout, in
/// which case the engine call runs on the worker pool.
pub struct Engine {
    registry: Arc<Registry>,
    wiring: Option<Arc<dyn WiringEngine>>,
    filter: Option<Arc<dyn DuplicateFilter>>,
    locations: Arc<dyn LocationResolver>,
    listeners: TransitionListeners,
    /// Unit whose start/stop/update/uninstall is in flight. Left set when an
    /// operation may still be running on the engine side.
    current_unit: Mutex<Option<UnitId>>,
    workers: WorkerPool,
    config: EngineConfig,
}

/// A state-changing call about to be issued for one node.
struct StateChange<'a> {
    node: &'a UnitNode,
    unit: UnitId,
    transition: Transition,
    post: UnitState,
}

/// Clears the duplicate filter's declarations when dropped.
struct DeclaredGroups<'a>(Option<&'a dyn DuplicateFilter>);

impl Drop for DeclaredGroups<'_> {
    fn drop(&mut self) {
        if let Some(filter) = self.0 {
            filter.clear();
        }
    }
}

impl Engine {
    /// Create an engine without a wiring engine attached. Commands that need
    /// one fail with `EngineUnavailable` until [`Engine::with_wiring`] is used.
    pub fn new(
        locations: Arc<dyn LocationResolver>,
        config: EngineConfig,
    ) -> Result<Self, CoreError> {
        config.validate()?;
        let workers = WorkerPool::new(config.worker_threads)?;
        Ok(Self {
            registry: Arc::new(Registry::new()),
            wiring: None,
            filter: None,
            locations,
            listeners: TransitionListeners::default(),
            current_unit: Mutex::new(None),
            workers,
            config,
        })
    }

    #[must_use]
    pub fn with_wiring(mut self, wiring: Arc<dyn WiringEngine>) -> Self {
        self.wiring = Some(wiring);
        self
    }

    #[must_use]
    pub fn with_duplicate_filter(mut self, filter: Arc<dyn DuplicateFilter>) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // --- registration ---

    /// Register `project`, filling in the descriptor from the wiring engine
    /// when the unit is known to it.
    pub fn register_unit(
        &self,
        project: &ProjectId,
        unit: Option<UnitId>,
        activated: bool,
    ) -> Result<UnitNode, CoreError> {
        let mut node = self.registry.register(project, unit, activated)?;
        let handle = unit.and_then(|id| self.wiring.as_ref().and_then(|w| w.unit(id)));
        if let Some(handle) = handle {
            self.registry
                .set_descriptor(project, handle.descriptor.clone())?;
            node.descriptor = Some(handle.descriptor);
        }
        Ok(node)
    }

    pub fn unregister_unit(&self, project: &ProjectId) -> Option<UnitId> {
        self.registry.unregister(project)
    }

    /// Record the name and version a project declares before it is installed.
    pub fn declare_descriptor(
        &self,
        project: &ProjectId,
        descriptor: UnitDescriptor,
    ) -> Result<(), CoreError> {
        self.registry.set_descriptor(project, descriptor)?;
        Ok(())
    }

    pub fn node(&self, project: &ProjectId) -> Option<UnitNode> {
        self.registry.lookup(project)
    }

    pub fn node_of_unit(&self, unit: UnitId) -> Option<UnitNode> {
        self.registry.lookup_by_unit_id(unit)
    }

    pub fn nodes(&self) -> Vec<UnitNode> {
        self.registry.nodes()
    }

    /// State as shown to users, capped at `Installed` for deactivated projects.
    pub fn reported_state(&self, project: &ProjectId) -> Option<UnitState> {
        self.registry.lookup(project).map(|node| node.reported_state())
    }

    /// Toggle whether `project` takes part in the managed workspace. Returns
    /// the previous flag.
    pub fn set_activated(&self, project: &ProjectId, activated: bool) -> Result<bool, CoreError> {
        let transition = if activated {
            Transition::Activate
        } else {
            Transition::Deactivate
        };
        let previous = self.registry.set_activated(project, activated)?;
        self.begin(project, transition);
        if let Some(node) = self.registry.lookup(project) {
            let mut scope = self.scope(&node, transition);
            scope.committed(node.current_state);
        }
        Ok(previous)
    }

    /// Adopt a unit that was installed or changed behind the core's back.
    pub fn record_external(&self, project: &ProjectId, unit: UnitId) -> Result<UnitNode, CoreError> {
        let wiring = self.wiring()?;
        let handle = wiring.unit(unit).ok_or_else(|| {
            CoreError::InvalidArgument(format!("unit {unit} is not known to the wiring engine"))
        })?;
        let state = engine_state(wiring.as_ref(), unit).unwrap_or(UnitState::Installed);
        let activated = self
            .registry
            .lookup(project)
            .map_or(self.config.activate_on_register, |node| node.activated);

        let node = self.registry.register(project, Some(unit), activated)?;
        let mut scope = self.scope(&node, Transition::External);
        let node = self.registry.update(project, |node| {
            lifecycle::begin(node, Transition::External);
            node.descriptor = Some(handle.descriptor);
            lifecycle::commit(node, state);
            node.clone()
        })?;
        scope.committed(state);
        debug!("recorded external change of {project}: {unit} is {state}");
        Ok(node)
    }

    pub fn clear_error(&self, project: &ProjectId) -> Result<(), CoreError> {
        self.registry
            .update(project, |node| node.transition_error = TransitionError::NoError)?;
        Ok(())
    }

    pub fn current_unit(&self) -> Option<UnitId> {
        *self.current_unit.lock()
    }

    /// Forget the in-flight marker after an operator dealt with a unit that
    /// was left mid-transition.
    pub fn clear_current_unit(&self) -> Option<UnitId> {
        self.current_unit.lock().take()
    }

    pub fn on_transition(&self, listener: TransitionListener) -> ListenerId {
        self.listeners.subscribe(listener)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.listeners.unsubscribe(id)
    }

    // --- duplicate detection ---

    pub fn find_duplicates(
        &self,
        candidates: &[ProjectId],
        scope: &[ProjectId],
    ) -> BTreeMap<ProjectId, ProjectId> {
        self.registry.find_duplicates(candidates, scope)
    }

    /// Match candidates against engine units no other registered project owns.
    pub fn find_external_duplicates(
        &self,
        candidates: &[ProjectId],
        disjoint: bool,
    ) -> Result<BTreeMap<ProjectId, ExternalUnit>, CoreError> {
        let wiring = self.wiring()?;
        let candidate_set: HashSet<&ProjectId> = candidates.iter().collect();
        let external: Vec<ExternalUnit> = wiring
            .units()
            .into_iter()
            .filter(|handle| {
                self.registry
                    .project_of(handle.id)
                    .map_or(true, |owner| candidate_set.contains(&owner))
            })
            .map(|handle| ExternalUnit::new(handle.id, handle.descriptor))
            .collect();
        Ok(self
            .registry
            .find_external_duplicates(candidates, &external, disjoint))
    }

    // --- lifecycle commands ---

    /// Install the unit built from `project`, registering the project first
    /// if needed.
    pub fn install(&self, project: &ProjectId) -> Result<UnitHandle, CoreError> {
        if project.is_blank() {
            return Err(CoreError::InvalidArgument(
                "project identity must not be blank".to_owned(),
            ));
        }
        let wiring = self.wiring()?;
        let existing = self.registry.lookup(project);
        let pre = existing
            .as_ref()
            .map_or(UnitState::StateLess, |node| node.current_state);
        let post = validate_transition(pre, Transition::Install)?;
        let path = self.locate(project)?;

        let activated = existing
            .as_ref()
            .map_or(self.config.activate_on_register, |node| node.activated);
        let node = match existing {
            Some(node) => node,
            None => self.registry.register(project, None, activated)?,
        };
        self.begin(project, Transition::Install);
        let mut scope = self.scope(&node, Transition::Install);

        info!("installing {project} from {}", path.display());
        let result = self.open_location(&path).and_then(|(location, content)| {
            wiring
                .install(&location, content)
                .map_err(|e| CoreError::from_engine(Transition::Install, e))
        });

        match result {
            Ok(handle) => {
                self.registry.register(project, Some(handle.id), activated)?;
                let descriptor = handle.descriptor.clone();
                self.registry.update(project, |node| {
                    node.descriptor = Some(descriptor);
                    lifecycle::commit(node, post);
                })?;
                scope.set_unit(Some(handle.id));
                scope.committed(post);
                info!("installed {project} as {}", handle.id);
                Ok(handle)
            }
            Err(err) => {
                warn!("install of {project} failed: {err}");
                self.rollback(&mut scope, project, pre, None, err.kind().transition_error());
                Err(err)
            }
        }
    }

    /// Resolve a batch of units. Same-key units in the batch are declared to
    /// the duplicate filter first.
    pub fn resolve(&self, units: &[UnitId]) -> Result<ResolveReport, CoreError> {
        let wiring = self.wiring()?;
        if units.is_empty() {
            return Ok(ResolveReport::default());
        }
        let units = dedup(units);

        let mut targets: Vec<(UnitId, UnitNode)> = Vec::new();
        for &unit in &units {
            match self.registry.lookup_by_unit_id(unit) {
                Some(node) => {
                    validate_transition(node.current_state, Transition::Resolve)?;
                    targets.push((unit, node));
                }
                None => debug!("resolving unregistered unit {unit}"),
            }
        }

        let declared = self.declare(candidate_groups(targets.iter().map(|(id, node)| (*id, node))));
        for (_, node) in &targets {
            self.begin(&node.project, Transition::Resolve);
        }
        let mut scopes: Vec<TransitionScope<'_>> = targets
            .iter()
            .map(|(_, node)| self.scope(node, Transition::Resolve))
            .collect();

        info!("resolving {} unit(s)", units.len());
        let result = wiring.resolve(&units);
        drop(declared);

        if let Err(e) = result {
            let err = CoreError::from_engine(Transition::Resolve, e);
            let error = err.kind().transition_error();
            for ((unit, node), scope) in targets.iter().zip(scopes.iter_mut()) {
                let actual = engine_state(wiring.as_ref(), *unit);
                self.rollback(scope, &node.project, node.current_state, actual, error);
            }
            warn!("resolve failed: {err}");
            return Err(err);
        }

        let mut report = ResolveReport::default();
        for ((unit, node), scope) in targets.iter().zip(scopes.iter_mut()) {
            match engine_state(wiring.as_ref(), *unit) {
                Some(state) if state.is_beyond_installed() => {
                    self.commit(scope, &node.project, state);
                    report.resolved.push(*unit);
                }
                actual => {
                    self.rollback(
                        scope,
                        &node.project,
                        node.current_state,
                        actual,
                        TransitionError::Error,
                    );
                    report.unresolved.push(*unit);
                }
            }
        }
        for unit in units.iter().filter(|u| !targets.iter().any(|(id, _)| id == *u)) {
            match engine_state(wiring.as_ref(), *unit) {
                Some(state) if state.is_beyond_installed() => report.resolved.push(*unit),
                _ => report.unresolved.push(*unit),
            }
        }
        if !report.is_complete() {
            warn!("{} unit(s) left unresolved", report.unresolved.len());
        }
        Ok(report)
    }

    /// Refresh `units` and wait for the engine's completion callback. An
    /// empty list refreshes whatever the engine has pending removal.
    pub fn refresh(&self, units: &[UnitId]) -> Result<RefreshReport, CoreError> {
        self.refresh_cancellable(units, &CancelToken::new())
    }

    pub fn refresh_cancellable(
        &self,
        units: &[UnitId],
        cancel: &CancelToken,
    ) -> Result<RefreshReport, CoreError> {
        let wiring = self.wiring()?;
        let units = dedup(units);
        let requested: Vec<UnitNode> = units
            .iter()
            .filter_map(|id| self.registry.lookup_by_unit_id(*id))
            .collect();
        for node in &requested {
            self.begin(&node.project, Transition::Refresh);
        }

        let (signal, waiter) = completion::<RefreshEvent>();
        let registry = Arc::clone(&self.registry);
        let listener: RefreshListener = Arc::new(move |event: RefreshEvent| {
            let first = signal.complete_with(|| {
                for id in event.errors.keys() {
                    registry.update_by_unit_id(*id, |node| {
                        node.transition_error = TransitionError::Error;
                    });
                }
                event
            });
            if !first {
                warn!("ignoring repeated refresh completion");
            }
        });

        info!("refreshing {} unit(s)", units.len());
        if let Err(e) = wiring.refresh(&units, listener) {
            let err = CoreError::from_engine(Transition::Refresh, e);
            for node in &requested {
                let mut scope = self.scope(node, Transition::Refresh);
                let actual = node.unit_id.and_then(|id| engine_state(wiring.as_ref(), id));
                self.rollback(
                    &mut scope,
                    &node.project,
                    node.current_state,
                    actual,
                    err.kind().transition_error(),
                );
            }
            return Err(err);
        }

        let limit = self.config.refresh_timeout();
        match waiter.wait(limit, self.config.poll_interval(), cancel) {
            Ok(event) => Ok(self.finish_refresh(wiring.as_ref(), &requested, event)),
            Err(wait) => {
                let err = match wait {
                    WaitError::TimedOut => CoreError::RefreshTimeout {
                        timeout: limit.unwrap_or_default(),
                    },
                    WaitError::Interrupted => CoreError::Interrupted(Transition::Refresh),
                    WaitError::WorkerTerminated(reason) => CoreError::Incomplete {
                        transition: Transition::Refresh,
                        reason,
                    },
                };
                warn!("refresh abandoned: {err}");
                for node in &requested {
                    let mut scope = self.scope(node, Transition::Refresh);
                    self.rollback(
                        &mut scope,
                        &node.project,
                        node.current_state,
                        None,
                        err.kind().transition_error(),
                    );
                }
                Err(err)
            }
        }
    }

    fn finish_refresh(
        &self,
        wiring: &dyn WiringEngine,
        requested: &[UnitNode],
        event: RefreshEvent,
    ) -> RefreshReport {
        let pre_states: HashMap<UnitId, UnitState> = requested
            .iter()
            .filter_map(|node| node.unit_id.map(|id| (id, node.current_state)))
            .collect();
        let mut ids: Vec<UnitId> = requested.iter().filter_map(|node| node.unit_id).collect();
        for id in &event.refreshed {
            if !ids.contains(id) {
                ids.push(*id);
            }
        }

        for id in ids {
            let Some(node) = self.registry.lookup_by_unit_id(id) else {
                continue;
            };
            let pre = match pre_states.get(&id) {
                Some(state) => *state,
                None => {
                    self.begin(&node.project, Transition::Refresh);
                    node.current_state
                }
            };
            let mut scope = self.scope(&node, Transition::Refresh);
            if event.errors.contains_key(&id) {
                let actual = engine_state(wiring, id);
                self.rollback(&mut scope, &node.project, pre, actual, TransitionError::Error);
            } else {
                let post = validate_transition(pre, Transition::Refresh).unwrap_or(UnitState::Installed);
                self.commit(&mut scope, &node.project, post);
            }
        }

        RefreshReport {
            refreshed: event.refreshed,
            failed: event.errors,
        }
    }

    /// Start `unit`. With a timeout (or a configured default) the call runs on
    /// the worker pool and gives up waiting after that long.
    pub fn start(
        &self,
        unit: UnitId,
        options: StartOptions,
        timeout: Option<Duration>,
    ) -> Result<(), CoreError> {
        self.start_cancellable(unit, options, timeout, &CancelToken::new())
    }

    pub fn start_cancellable(
        &self,
        unit: UnitId,
        options: StartOptions,
        timeout: Option<Duration>,
        cancel: &CancelToken,
    ) -> Result<(), CoreError> {
        let wiring = self.wiring()?;
        let node = self.node_for_unit(unit)?;
        let post = validate_transition(node.current_state, Transition::Start)?;
        info!("starting {} ({unit})", node.project);
        let change = StateChange {
            node: &node,
            unit,
            transition: Transition::Start,
            post,
        };
        self.run_state_change(&wiring, &change, timeout, cancel, move |w| {
            w.start(unit, options)
        })
    }

    pub fn stop(
        &self,
        unit: UnitId,
        transient: bool,
        timeout: Option<Duration>,
    ) -> Result<(), CoreError> {
        self.stop_cancellable(unit, transient, timeout, &CancelToken::new())
    }

    pub fn stop_cancellable(
        &self,
        unit: UnitId,
        transient: bool,
        timeout: Option<Duration>,
        cancel: &CancelToken,
    ) -> Result<(), CoreError> {
        let wiring = self.wiring()?;
        let node = self.node_for_unit(unit)?;
        let post = validate_transition(node.current_state, Transition::Stop)?;
        info!("stopping {} ({unit})", node.project);
        let change = StateChange {
            node: &node,
            unit,
            transition: Transition::Stop,
            post,
        };
        self.run_state_change(&wiring, &change, timeout, cancel, move |w| {
            w.stop(unit, StopOptions { transient })
        })
    }

    fn run_state_change<F>(
        &self,
        wiring: &Arc<dyn WiringEngine>,
        change: &StateChange<'_>,
        timeout: Option<Duration>,
        cancel: &CancelToken,
        call: F,
    ) -> Result<(), CoreError>
    where
        F: FnOnce(&dyn WiringEngine) -> Result<(), WiringError> + Send + 'static,
    {
        let timeout = timeout.or_else(|| self.config.state_change_timeout());
        let project = &change.node.project;
        let pre = change.node.current_state;

        self.mark_current(change.unit);
        self.begin(project, change.transition);
        let mut scope = self.scope(change.node, change.transition);

        let outcome = match timeout {
            Some(limit) => {
                let worker_wiring = Arc::clone(wiring);
                self.workers.run_bounded(
                    limit,
                    self.config.poll_interval(),
                    cancel,
                    move || call(worker_wiring.as_ref()),
                )
            }
            None => catch_unwind(AssertUnwindSafe(|| call(wiring.as_ref())))
                .map_err(|payload| WaitError::WorkerTerminated(panic_message(&*payload))),
        };

        let err = match outcome {
            Ok(Ok(())) => {
                self.commit(&mut scope, project, change.post);
                self.release_current(change.unit);
                return Ok(());
            }
            Ok(Err(e)) => CoreError::from_engine(change.transition, e),
            Err(WaitError::TimedOut) => CoreError::StateChangeTimeout {
                unit: change.unit,
                transition: change.transition,
                timeout: timeout.unwrap_or_default(),
            },
            Err(WaitError::Interrupted) => CoreError::Interrupted(change.transition),
            Err(WaitError::WorkerTerminated(reason)) => CoreError::Incomplete {
                transition: change.transition,
                reason,
            },
        };

        let kind = err.kind();
        // An engine still working on the unit may block state queries.
        let actual = if kind.leaves_unit_busy() {
            None
        } else {
            engine_state(wiring.as_ref(), change.unit)
        };
        self.rollback(&mut scope, project, pre, actual, kind.transition_error());
        if !kind.leaves_unit_busy() {
            self.release_current(change.unit);
        }
        warn!("{} of {project} failed: {err}", change.transition);
        Err(err)
    }

    /// Update `unit` in place from its project's content.
    pub fn update(&self, unit: UnitId) -> Result<(), CoreError> {
        let wiring = self.wiring()?;
        let node = self.node_for_unit(unit)?;
        let pre = node.current_state;
        let post = validate_transition(pre, Transition::Update)?;
        let project = node.project.clone();
        let source = match self.config.install_mode {
            InstallMode::Reference => None,
            InstallMode::ByValue => Some(self.locate(&project)?),
        };

        self.mark_current(unit);
        self.begin(&project, Transition::Update);
        let mut scope = self.scope(&node, Transition::Update);

        let mut groups = CandidateGroups::new();
        groups.insert(unit, vec![unit]);
        let declared = self.declare(groups);
        info!("updating {project} ({unit})");
        let result = source.as_deref().map(open_content).transpose().and_then(|content| {
            wiring
                .update(unit, content)
                .map_err(|e| CoreError::from_engine(Transition::Update, e))
        });
        drop(declared);

        match result {
            Ok(()) => {
                let descriptor = wiring.unit(unit).map(|handle| handle.descriptor);
                if let Err(e) = self.registry.update(&project, |node| {
                    if descriptor.is_some() {
                        node.descriptor = descriptor;
                    }
                }) {
                    warn!("cannot refresh descriptor of {project}: {e}");
                }
                self.commit(&mut scope, &project, post);
                self.release_current(unit);
                Ok(())
            }
            Err(err) => {
                let kind = err.kind();
                let actual = engine_state(wiring.as_ref(), unit);
                self.rollback(&mut scope, &project, pre, actual, kind.transition_error());
                if !kind.leaves_unit_busy() {
                    self.release_current(unit);
                }
                warn!("update of {project} failed: {err}");
                Err(err)
            }
        }
    }

    /// Uninstall `unit`. A unit no project owns is still uninstalled through
    /// the engine, and the call then reports it as unregistered.
    pub fn uninstall(&self, unit: UnitId, unregister: bool) -> Result<(), CoreError> {
        let wiring = self.wiring()?;
        let Some(node) = self.registry.lookup_by_unit_id(unit) else {
            return self.force_uninstall(wiring.as_ref(), unit);
        };
        let pre = node.current_state;
        let post = validate_transition(pre, Transition::Uninstall)?;
        let project = node.project.clone();

        self.mark_current(unit);
        self.begin(&project, Transition::Uninstall);
        let mut scope = self.scope(&node, Transition::Uninstall);

        info!("uninstalling {project} ({unit})");
        match wiring.uninstall(unit) {
            Ok(()) => {
                if let Err(e) = self.registry.update(&project, |node| {
                    lifecycle::commit(node, post);
                    node.unit_id = None;
                }) {
                    warn!("cannot record uninstall of {project}: {e}");
                }
                scope.committed(post);
                self.release_current(unit);
                if unregister {
                    self.registry.unregister(&project);
                }
                Ok(())
            }
            Err(e) => {
                let err = CoreError::from_engine(Transition::Uninstall, e);
                let actual = engine_state(wiring.as_ref(), unit);
                self.rollback(&mut scope, &project, pre, actual, err.kind().transition_error());
                self.release_current(unit);
                warn!("uninstall of {project} failed: {err}");
                Err(err)
            }
        }
    }

    fn force_uninstall(&self, wiring: &dyn WiringEngine, unit: UnitId) -> Result<(), CoreError> {
        warn!("unit {unit} has no registered project; uninstalling it anyway");
        let pre = engine_state(wiring, unit).unwrap_or(UnitState::StateLess);
        let mut scope =
            TransitionScope::new(&self.listeners, None, Some(unit), Transition::Uninstall, pre);
        match wiring.uninstall(unit) {
            Ok(()) => {
                scope.committed(UnitState::Uninstalled);
                Err(CoreError::UnitUnregistered(unit))
            }
            Err(e) => {
                let err = CoreError::from_engine(Transition::Uninstall, e);
                scope.rolled_back(err.kind().transition_error(), pre);
                Err(err)
            }
        }
    }

    /// Units transitively depending on `units`. Units the engine rejects as
    /// unknown yield an empty result.
    pub fn dependency_closure(&self, units: &[UnitId]) -> Result<Vec<UnitId>, CoreError> {
        let wiring = self.wiring()?;
        match wiring.dependency_closure(units) {
            Ok(closure) => Ok(closure),
            Err(e) if e.is_rejected_argument() => {
                debug!("dependency closure rejected: {e}");
                Ok(Vec::new())
            }
            Err(e) => Err(CoreError::from_engine(Transition::NoTransition, e)),
        }
    }

    pub fn removal_pending(&self) -> Result<Vec<UnitId>, CoreError> {
        let wiring = self.wiring()?;
        match wiring.removal_pending() {
            Ok(units) => Ok(units),
            Err(e) if e.is_rejected_argument() => {
                debug!("removal-pending query rejected: {e}");
                Ok(Vec::new())
            }
            Err(e) => Err(CoreError::from_engine(Transition::NoTransition, e)),
        }
    }

    // --- helpers ---

    fn wiring(&self) -> Result<Arc<dyn WiringEngine>, CoreError> {
        self.wiring.clone().ok_or(CoreError::EngineUnavailable)
    }

    fn node_for_unit(&self, unit: UnitId) -> Result<UnitNode, CoreError> {
        self.registry
            .lookup_by_unit_id(unit)
            .ok_or(CoreError::UnitUnregistered(unit))
    }

    fn scope(&self, node: &UnitNode, transition: Transition) -> TransitionScope<'_> {
        let mut scope = TransitionScope::new(
            &self.listeners,
            Some(node.project.clone()),
            node.unit_id,
            transition,
            node.current_state,
        );
        scope.set_activated(node.activated);
        scope
    }

    fn begin(&self, project: &ProjectId, transition: Transition) {
        if let Err(e) = self
            .registry
            .update(project, |node| lifecycle::begin(node, transition))
        {
            warn!("cannot record {transition} on {project}: {e}");
        }
    }

    fn commit(&self, scope: &mut TransitionScope<'_>, project: &ProjectId, post: UnitState) {
        if let Err(e) = self
            .registry
            .update(project, |node| lifecycle::commit(node, post))
        {
            warn!("cannot commit {project}: {e}");
        }
        scope.committed(post);
    }

    fn rollback(
        &self,
        scope: &mut TransitionScope<'_>,
        project: &ProjectId,
        pre: UnitState,
        actual: Option<UnitState>,
        error: TransitionError,
    ) {
        let state = self
            .registry
            .update(project, |node| {
                lifecycle::rollback(node, pre, actual, error);
                node.current_state
            })
            .unwrap_or_else(|e| {
                warn!("cannot roll back {project}: {e}");
                actual.unwrap_or(pre)
            });
        scope.rolled_back(error, state);
    }

    fn mark_current(&self, unit: UnitId) {
        *self.current_unit.lock() = Some(unit);
    }

    fn release_current(&self, unit: UnitId) {
        let mut current = self.current_unit.lock();
        if *current == Some(unit) {
            *current = None;
        }
    }

    fn declare(&self, groups: CandidateGroups) -> DeclaredGroups<'_> {
        let filter = self.filter.as_deref();
        if let Some(filter) = filter {
            filter.declare(groups);
        }
        DeclaredGroups(filter)
    }

    fn locate(&self, project: &ProjectId) -> Result<PathBuf, CoreError> {
        self.locations
            .locate(project)
            .map_err(|e| CoreError::LocationUnresolved {
                project: project.clone(),
                reason: e.to_string(),
            })
    }

    fn open_location(&self, path: &Path) -> Result<(String, Option<ContentStream>), CoreError> {
        match self.config.install_mode {
            InstallMode::Reference => Ok((format!("reference:file:{}", path.display()), None)),
            InstallMode::ByValue => Ok((format!("file:{}", path.display()), Some(open_content(path)?))),
        }
    }
}

fn open_content(path: &Path) -> Result<ContentStream, CoreError> {
    Ok(Box::new(std::fs::File::open(path)?))
}

fn engine_state(wiring: &dyn WiringEngine, unit: UnitId) -> Option<UnitState> {
    wiring.state(unit).ok().map(UnitState::from)
}

fn dedup(units: &[UnitId]) -> Vec<UnitId> {
    let mut seen = HashSet::new();
    units.iter().copied().filter(|id| seen.insert(*id)).collect()
}

/// Group batch members by symbolic key; each member maps to every member
/// sharing its key, itself included.
fn candidate_groups<'a>(members: impl Iterator<Item = (UnitId, &'a UnitNode)>) -> CandidateGroups {
    let mut by_key: BTreeMap<String, Vec<UnitId>> = BTreeMap::new();
    for (id, node) in members {
        if let Some(key) = node.key().filter(|key| !key.is_empty()) {
            by_key.entry(key).or_default().push(id);
        }
    }
    let mut groups = CandidateGroups::new();
    for ids in by_key.values() {
        for id in ids {
            groups.insert(*id, ids.clone());
        }
    }
    groups
}
