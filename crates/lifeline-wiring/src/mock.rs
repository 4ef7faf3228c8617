use crate::engine::{
    ContentStream, RefreshEvent, RefreshListener, StartOptions, StateCode, StopOptions,
    UnitHandle, WiringEngine,
};
use crate::WiringError;
use crossbeam_channel::{bounded, Receiver, Sender};
use lifeline_model::{UnitDescriptor, UnitId};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Engine operations a fault can be attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Resolve,
    Refresh,
    Start,
    Stop,
    Update,
    Uninstall,
}

/// Scripted misbehaviour for one unit and operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    Duplicate,
    Activator(String),
    StateChange(String),
    /// The unit is left mid-transition and the call reports a terminated worker.
    ThreadTerminated(String),
    Unresolved(String),
    Failed(String),
    /// The calling thread panics.
    Panic(String),
    /// Block until [`MockWiringEngine::release_hangs`], then behave normally.
    Hang,
}

/// How the engine delivers refresh completion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RefreshMode {
    /// Invoke the listener on the caller's thread before `refresh` returns.
    #[default]
    Immediate,
    /// Invoke the listener from another thread after a delay.
    Background { delay_ms: u64 },
    /// Invoke the listener twice from another thread.
    Twice,
    /// Never invoke the listener.
    Never,
}

struct CatalogEntry {
    descriptor: UnitDescriptor,
    requires: Vec<String>,
}

struct MockUnit {
    handle: UnitHandle,
    state: StateCode,
    requires: Vec<String>,
}

impl MockUnit {
    fn live(&self) -> bool {
        self.state != StateCode::Uninstalled
    }
}

#[derive(Default)]
struct MockState {
    next_id: u64,
    catalog: HashMap<PathBuf, CatalogEntry>,
    units: BTreeMap<UnitId, MockUnit>,
    faults: HashMap<(UnitId, Op), Fault>,
    install_faults: HashMap<PathBuf, Fault>,
    pending_updates: HashMap<UnitId, UnitDescriptor>,
    removal_pending: BTreeSet<UnitId>,
    refresh_mode: RefreshMode,
    calls: Vec<String>,
}

impl MockState {
    fn requirements_met(&self, unit: &MockUnit) -> bool {
        unit.requires.iter().all(|name| {
            self.units
                .values()
                .any(|u| u.live() && u.handle.descriptor.name == *name)
        })
    }

    fn try_resolve(&mut self, id: UnitId) -> bool {
        let Some(unit) = self.units.get(&id) else {
            return false;
        };
        let current = unit.state;
        match current {
            StateCode::Installed => {
                if self.faults.contains_key(&(id, Op::Resolve)) || !self.requirements_met(unit) {
                    return false;
                }
                if let Some(unit) = self.units.get_mut(&id) {
                    unit.state = StateCode::Resolved;
                }
                true
            }
            StateCode::Uninstalled => false,
            _ => true,
        }
    }

    fn dependents_closure(&self, roots: &[UnitId]) -> BTreeSet<UnitId> {
        let mut seen: BTreeSet<UnitId> = BTreeSet::new();
        let mut queue: VecDeque<UnitId> = roots.iter().copied().collect();
        while let Some(id) = queue.pop_front() {
            if !seen.insert(id) {
                continue;
            }
            let Some(unit) = self.units.get(&id) else {
                continue;
            };
            let name = &unit.handle.descriptor.name;
            for (other_id, other) in &self.units {
                if other.requires.iter().any(|r| r == name) && !seen.contains(other_id) {
                    queue.push_back(*other_id);
                }
            }
        }
        seen
    }

    fn is_required(&self, id: UnitId) -> bool {
        let Some(unit) = self.units.get(&id) else {
            return false;
        };
        let name = &unit.handle.descriptor.name;
        self.units
            .iter()
            .any(|(other_id, other)| *other_id != id && other.live() && other.requires.contains(name))
    }
}

/// In-memory wiring engine with scriptable faults, hangs and refresh
/// delivery modes.
pub struct MockWiringEngine {
    state: Mutex<MockState>,
    gate: Mutex<(Sender<()>, Receiver<()>)>,
}

impl Default for MockWiringEngine {
    fn default() -> Self {
        Self {
            state: Mutex::new(MockState {
                next_id: 1,
                ..MockState::default()
            }),
            gate: Mutex::new(bounded(0)),
        }
    }
}

fn location_path(location: &str) -> Result<PathBuf, WiringError> {
    let rest = location.strip_prefix("reference:").unwrap_or(location);
    let path = rest
        .strip_prefix("file:")
        .ok_or_else(|| WiringError::InvalidArgument(format!("unsupported location: {location}")))?;
    Ok(PathBuf::from(path))
}

impl MockWiringEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make a unit with the given name and version installable from `path`.
    pub fn provide(&self, path: impl AsRef<Path>, name: &str, version: &str) {
        self.provide_with_requires(path, name, version, &[]);
    }

    /// Like [`MockWiringEngine::provide`]; the unit only resolves while units
    /// with each of the `requires` names are installed.
    pub fn provide_with_requires(
        &self,
        path: impl AsRef<Path>,
        name: &str,
        version: &str,
        requires: &[&str],
    ) {
        self.state.lock().catalog.insert(
            path.as_ref().to_path_buf(),
            CatalogEntry {
                descriptor: UnitDescriptor::new(name, version),
                requires: requires.iter().map(|r| (*r).to_owned()).collect(),
            },
        );
    }

    pub fn fail(&self, unit: UnitId, op: Op, fault: Fault) {
        self.state.lock().faults.insert((unit, op), fault);
    }

    pub fn fail_install(&self, path: impl AsRef<Path>, fault: Fault) {
        self.state
            .lock()
            .install_faults
            .insert(path.as_ref().to_path_buf(), fault);
    }

    pub fn clear_faults(&self) {
        let mut state = self.state.lock();
        state.faults.clear();
        state.install_faults.clear();
    }

    /// The next update of `unit` replaces its descriptor with `descriptor`.
    pub fn stage_update(&self, unit: UnitId, descriptor: UnitDescriptor) {
        self.state.lock().pending_updates.insert(unit, descriptor);
    }

    pub fn set_refresh_mode(&self, mode: RefreshMode) {
        self.state.lock().refresh_mode = mode;
    }

    /// Force a unit into a state, as if the engine changed it on its own.
    pub fn force_state(&self, unit: UnitId, code: StateCode) {
        if let Some(u) = self.state.lock().units.get_mut(&unit) {
            u.state = code;
        }
    }

    /// Wake every call blocked on a [`Fault::Hang`].
    pub fn release_hangs(&self) {
        *self.gate.lock() = bounded(0);
    }

    /// Operations received so far, formatted as `"<op> <unit>"`.
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().calls.clone()
    }

    fn record(&self, call: String) {
        debug!("mock wiring engine: {call}");
        self.state.lock().calls.push(call);
    }

    fn hang(&self) {
        let rx = self.gate.lock().1.clone();
        // Returns once `release_hangs` drops the sender.
        let _ = rx.recv();
    }

    /// Apply a scripted fault before the operation runs. `Ok(())` means the
    /// operation should proceed normally.
    fn check_fault(&self, unit: UnitId, op: Op) -> Result<(), WiringError> {
        let fault = self.state.lock().faults.get(&(unit, op)).cloned();
        match fault {
            None => Ok(()),
            Some(Fault::Hang) => {
                self.hang();
                Ok(())
            }
            Some(Fault::Panic(msg)) => panic!("{msg}"),
            Some(Fault::Duplicate) => {
                let state = self.state.lock();
                let descriptor = state
                    .units
                    .get(&unit)
                    .map(|u| u.handle.descriptor.clone())
                    .unwrap_or_else(|| UnitDescriptor::new("", ""));
                Err(WiringError::DuplicateUnit {
                    name: descriptor.name,
                    version: descriptor.version,
                })
            }
            Some(Fault::Activator(reason)) => {
                let mut state = self.state.lock();
                state.try_resolve(unit);
                if let Some(u) = state.units.get_mut(&unit) {
                    if u.state != StateCode::Installed {
                        u.state = StateCode::Resolved;
                    }
                }
                Err(WiringError::Activator { unit, reason })
            }
            Some(Fault::StateChange(reason)) => Err(WiringError::StateChange { unit, reason }),
            Some(Fault::ThreadTerminated(reason)) => {
                if let Some(u) = self.state.lock().units.get_mut(&unit) {
                    u.state = match op {
                        Op::Stop => StateCode::Stopping,
                        _ => StateCode::Starting,
                    };
                }
                Err(WiringError::ThreadTerminated { unit, reason })
            }
            Some(Fault::Unresolved(reason)) => Err(WiringError::Unresolved { unit, reason }),
            Some(Fault::Failed(reason)) => Err(WiringError::Failed(reason)),
        }
    }

    fn known(&self, unit: UnitId) -> Result<(), WiringError> {
        if self.state.lock().units.contains_key(&unit) {
            Ok(())
        } else {
            Err(WiringError::UnknownUnit(unit))
        }
    }
}

impl WiringEngine for MockWiringEngine {
    fn install(
        &self,
        location: &str,
        content: Option<ContentStream>,
    ) -> Result<UnitHandle, WiringError> {
        self.record(format!("install {location}"));
        let path = location_path(location)?;
        if let Some(mut stream) = content {
            let mut buf = Vec::new();
            stream.read_to_end(&mut buf)?;
        }

        let mut state = self.state.lock();
        if let Some(fault) = state.install_faults.get(&path).cloned() {
            return Err(match fault {
                Fault::Duplicate => {
                    let d = state
                        .catalog
                        .get(&path)
                        .map(|e| e.descriptor.clone())
                        .unwrap_or_else(|| UnitDescriptor::new("", ""));
                    WiringError::DuplicateUnit {
                        name: d.name,
                        version: d.version,
                    }
                }
                other => WiringError::Failed(format!("install of {location} failed: {other:?}")),
            });
        }

        let entry = state
            .catalog
            .get(&path)
            .ok_or_else(|| WiringError::Failed(format!("nothing to install at {location}")))?;
        let descriptor = entry.descriptor.clone();
        let requires = entry.requires.clone();

        if let Some(existing) = state
            .units
            .values()
            .find(|u| u.live() && u.handle.descriptor == descriptor)
        {
            if location_path(&existing.handle.location).ok().as_deref() == Some(path.as_path()) {
                return Ok(existing.handle.clone());
            }
            return Err(WiringError::DuplicateUnit {
                name: descriptor.name,
                version: descriptor.version,
            });
        }

        let id = UnitId::new(state.next_id);
        state.next_id += 1;
        let handle = UnitHandle {
            id,
            descriptor,
            location: location.to_owned(),
        };
        state.units.insert(
            id,
            MockUnit {
                handle: handle.clone(),
                state: StateCode::Installed,
                requires,
            },
        );
        Ok(handle)
    }

    fn resolve(&self, units: &[UnitId]) -> Result<bool, WiringError> {
        self.record(format!("resolve {units:?}"));
        let mut state = self.state.lock();
        let targets: Vec<UnitId> = if units.is_empty() {
            state.units.keys().copied().collect()
        } else {
            units.to_vec()
        };
        let mut all = true;
        for id in targets {
            if !state.units.contains_key(&id) {
                continue;
            }
            all &= state.try_resolve(id);
        }
        Ok(all)
    }

    fn refresh(&self, units: &[UnitId], listener: RefreshListener) -> Result<(), WiringError> {
        self.record(format!("refresh {units:?}"));
        let (event, mode) = {
            let mut state = self.state.lock();
            let roots: Vec<UnitId> = if units.is_empty() {
                state.removal_pending.iter().copied().collect()
            } else {
                units.to_vec()
            };
            let affected = state.dependents_closure(&roots);
            let mut event = RefreshEvent::default();
            for id in affected {
                state.removal_pending.remove(&id);
                if let Some(Fault::Failed(reason) | Fault::Unresolved(reason)) =
                    state.faults.get(&(id, Op::Refresh)).cloned()
                {
                    event.errors.insert(id, reason);
                }
                let purge = match state.units.get_mut(&id) {
                    Some(unit) if unit.live() => {
                        unit.state = StateCode::Installed;
                        false
                    }
                    Some(_) => true,
                    None => continue,
                };
                if purge {
                    state.units.remove(&id);
                }
                event.refreshed.push(id);
            }
            (event, state.refresh_mode)
        };

        match mode {
            RefreshMode::Immediate => listener(event),
            RefreshMode::Background { delay_ms } => {
                std::thread::spawn(move || {
                    std::thread::sleep(Duration::from_millis(delay_ms));
                    listener(event);
                });
            }
            RefreshMode::Twice => {
                std::thread::spawn(move || {
                    listener(event.clone());
                    listener(event);
                });
            }
            RefreshMode::Never => {}
        }
        Ok(())
    }

    fn start(&self, unit: UnitId, options: StartOptions) -> Result<(), WiringError> {
        self.record(format!("start {unit}"));
        self.known(unit)?;
        self.check_fault(unit, Op::Start)?;
        let mut state = self.state.lock();
        if !state.try_resolve(unit) {
            return Err(WiringError::Unresolved {
                unit,
                reason: "unsatisfied requirements".to_owned(),
            });
        }
        if let Some(u) = state.units.get_mut(&unit) {
            u.state = StateCode::Active;
        }
        debug!("started {unit} (transient: {})", options.transient);
        Ok(())
    }

    fn stop(&self, unit: UnitId, options: StopOptions) -> Result<(), WiringError> {
        self.record(format!("stop {unit}"));
        self.known(unit)?;
        self.check_fault(unit, Op::Stop)?;
        let mut state = self.state.lock();
        if let Some(u) = state.units.get_mut(&unit) {
            match u.state {
                StateCode::Active | StateCode::Starting | StateCode::Stopping => {
                    u.state = StateCode::Resolved;
                }
                StateCode::Uninstalled => {
                    return Err(WiringError::Failed(format!("unit {unit} is uninstalled")));
                }
                StateCode::Installed | StateCode::Resolved => {}
            }
        }
        debug!("stopped {unit} (transient: {})", options.transient);
        Ok(())
    }

    fn update(&self, unit: UnitId, content: Option<ContentStream>) -> Result<(), WiringError> {
        self.record(format!("update {unit}"));
        self.known(unit)?;
        if let Some(mut stream) = content {
            let mut buf = Vec::new();
            stream.read_to_end(&mut buf)?;
        }
        self.check_fault(unit, Op::Update)?;

        let mut state = self.state.lock();
        if let Some(next) = state.pending_updates.get(&unit).cloned() {
            let collides = state.units.iter().any(|(id, u)| {
                *id != unit
                    && u.handle.descriptor == next
                    && matches!(
                        u.state,
                        StateCode::Resolved | StateCode::Active | StateCode::Starting
                    )
            });
            if collides {
                return Err(WiringError::DuplicateUnit {
                    name: next.name,
                    version: next.version,
                });
            }
            state.pending_updates.remove(&unit);
            if let Some(u) = state.units.get_mut(&unit) {
                u.handle.descriptor = next;
            }
        }
        if state.is_required(unit) {
            state.removal_pending.insert(unit);
        }
        if let Some(u) = state.units.get_mut(&unit) {
            u.state = StateCode::Installed;
        }
        Ok(())
    }

    fn uninstall(&self, unit: UnitId) -> Result<(), WiringError> {
        self.record(format!("uninstall {unit}"));
        self.known(unit)?;
        self.check_fault(unit, Op::Uninstall)?;
        let mut state = self.state.lock();
        if state.is_required(unit) {
            state.removal_pending.insert(unit);
        }
        match state.units.get_mut(&unit) {
            Some(u) if u.live() => {
                u.state = StateCode::Uninstalled;
                Ok(())
            }
            _ => Err(WiringError::Failed(format!(
                "unit {unit} is already uninstalled"
            ))),
        }
    }

    fn dependency_closure(&self, units: &[UnitId]) -> Result<Vec<UnitId>, WiringError> {
        let state = self.state.lock();
        if let Some(unknown) = units.iter().find(|id| !state.units.contains_key(id)) {
            return Err(WiringError::InvalidArgument(format!(
                "unit {unknown} was not installed by this engine"
            )));
        }
        Ok(state.dependents_closure(units).into_iter().collect())
    }

    fn removal_pending(&self) -> Result<Vec<UnitId>, WiringError> {
        Ok(self.state.lock().removal_pending.iter().copied().collect())
    }

    fn state(&self, unit: UnitId) -> Result<StateCode, WiringError> {
        self.state
            .lock()
            .units
            .get(&unit)
            .map(|u| u.state)
            .ok_or(WiringError::UnknownUnit(unit))
    }

    fn unit(&self, unit: UnitId) -> Option<UnitHandle> {
        self.state
            .lock()
            .units
            .get(&unit)
            .map(|u| u.handle.clone())
    }

    fn units(&self) -> Vec<UnitHandle> {
        self.state
            .lock()
            .units
            .values()
            .filter(|u| u.live())
            .map(|u| u.handle.clone())
            .collect()
    }
}
