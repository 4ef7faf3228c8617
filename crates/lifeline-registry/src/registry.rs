use crate::RegistryError;
use lifeline_model::{
    symbolic_key, ProjectId, Transition, UnitDescriptor, UnitId, UnitNode, UnitState,
};
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, trace};

#[derive(Default)]
pub(crate) struct Indexes {
    pub(crate) nodes: HashMap<ProjectId, UnitNode>,
    by_unit: HashMap<UnitId, ProjectId>,
    by_key: HashMap<String, BTreeSet<ProjectId>>,
}

impl Indexes {
    fn unindex(&mut self, node: &UnitNode) {
        if let Some(id) = node.unit_id {
            if self.by_unit.get(&id) == Some(&node.project) {
                self.by_unit.remove(&id);
            }
        }
        if let Some(key) = node.key() {
            if let Some(set) = self.by_key.get_mut(&key) {
                set.remove(&node.project);
                if set.is_empty() {
                    self.by_key.remove(&key);
                }
            }
        }
    }

    fn index(&mut self, node: &UnitNode) {
        if let Some(id) = node.unit_id {
            if let Some(previous) = self.by_unit.insert(id, node.project.clone()) {
                if previous != node.project {
                    // The engine reused an id; the older node no longer owns it.
                    debug!("unit {id} moved from project {previous} to {}", node.project);
                    if let Some(stale) = self.nodes.get_mut(&previous) {
                        stale.unit_id = None;
                        if stale.current_state.is_installed() {
                            stale.current_state = UnitState::Uninstalled;
                        }
                    }
                }
            }
        }
        if let Some(key) = node.key() {
            self.by_key
                .entry(key)
                .or_default()
                .insert(node.project.clone());
        }
    }

    fn project_for_unit(&self, id: UnitId) -> Option<&ProjectId> {
        self.by_unit.get(&id)
    }
}

/// Thread-safe store of unit nodes keyed by project.
///
/// Every accessor hands out clones, so readers never observe a node while it
/// is being mutated and may iterate freely during a write.
#[derive(Default)]
pub struct Registry {
    inner: RwLock<Indexes>,
}

fn check_project(project: &ProjectId) -> Result<(), RegistryError> {
    if project.is_blank() {
        return Err(RegistryError::InvalidArgument(
            "project identity must not be blank".to_owned(),
        ));
    }
    Ok(())
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a node for `project`, or update the unit id and activation flag
    /// of the existing one. Pending transitions and the sticky error survive
    /// an update.
    pub fn register(
        &self,
        project: &ProjectId,
        unit_id: Option<UnitId>,
        activated: bool,
    ) -> Result<UnitNode, RegistryError> {
        check_project(project)?;
        let mut inner = self.inner.write();
        let mut node = match inner.nodes.remove(project) {
            Some(existing) => {
                inner.unindex(&existing);
                existing
            }
            None => {
                debug!("registering project {project}");
                UnitNode::new(project.clone(), None, activated)
            }
        };

        match unit_id {
            Some(_) if !node.current_state.is_installed() => {
                node.current_state = UnitState::Installed;
            }
            None if node.unit_id.is_some() && node.current_state.is_installed() => {
                node.current_state = UnitState::Uninstalled;
            }
            _ => {}
        }
        node.unit_id = unit_id;
        node.activated = activated;

        inner.index(&node);
        inner.nodes.insert(project.clone(), node.clone());
        Ok(node)
    }

    /// Record the symbolic name and version of a registered project.
    pub fn set_descriptor(
        &self,
        project: &ProjectId,
        descriptor: UnitDescriptor,
    ) -> Result<(), RegistryError> {
        self.update(project, |node| node.descriptor = Some(descriptor))
    }

    /// Remove the node for `project`, returning its unit id if it had one.
    pub fn unregister(&self, project: &ProjectId) -> Option<UnitId> {
        let mut inner = self.inner.write();
        let node = inner.nodes.remove(project)?;
        inner.unindex(&node);
        debug!("unregistered project {project}");
        node.unit_id
    }

    pub fn lookup(&self, project: &ProjectId) -> Option<UnitNode> {
        self.inner.read().nodes.get(project).cloned()
    }

    pub fn lookup_by_unit_id(&self, id: UnitId) -> Option<UnitNode> {
        let inner = self.inner.read();
        let project = inner.project_for_unit(id)?;
        inner
            .nodes
            .get(project)
            .filter(|node| node.unit_id == Some(id))
            .cloned()
    }

    /// First node (in project order) whose symbolic key is `name + version`.
    pub fn lookup_by_key(&self, name: &str, version: &str) -> Option<UnitNode> {
        let key = symbolic_key(Some(name), Some(version));
        let inner = self.inner.read();
        inner
            .by_key
            .get(&key)
            .and_then(|set| set.iter().next())
            .and_then(|project| inner.nodes.get(project))
            .cloned()
    }

    pub fn project_of(&self, id: UnitId) -> Option<ProjectId> {
        self.inner.read().project_for_unit(id).cloned()
    }

    pub fn contains(&self, project: &ProjectId) -> bool {
        self.inner.read().nodes.contains_key(project)
    }

    pub fn len(&self) -> usize {
        self.inner.read().nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().nodes.is_empty()
    }

    /// Snapshot of every node, ordered by project.
    pub fn nodes(&self) -> Vec<UnitNode> {
        let mut nodes: Vec<UnitNode> = self.inner.read().nodes.values().cloned().collect();
        nodes.sort_by(|a, b| a.project.cmp(&b.project));
        nodes
    }

    /// Mutate a node in place. The secondary indexes are rebuilt for the node
    /// afterwards, so `f` may change the unit id or descriptor.
    pub fn update<R>(
        &self,
        project: &ProjectId,
        f: impl FnOnce(&mut UnitNode) -> R,
    ) -> Result<R, RegistryError> {
        let mut inner = self.inner.write();
        let mut node = inner
            .nodes
            .remove(project)
            .ok_or_else(|| RegistryError::NotRegistered(project.clone()))?;
        inner.unindex(&node);
        let out = f(&mut node);
        node.project = project.clone();
        trace!(
            "node {project}: state={} last={} error={}",
            node.current_state,
            node.last_transition,
            node.transition_error
        );
        inner.index(&node);
        inner.nodes.insert(project.clone(), node);
        Ok(out)
    }

    /// Like [`Registry::update`], addressing the node through its unit id.
    /// Returns `None` when no registered node owns the id.
    pub fn update_by_unit_id<R>(&self, id: UnitId, f: impl FnOnce(&mut UnitNode) -> R) -> Option<R> {
        let project = self.project_of(id)?;
        self.update(&project, f).ok()
    }

    /// Toggle participation in the managed workspace. Returns the previous
    /// flag.
    pub fn set_activated(&self, project: &ProjectId, activated: bool) -> Result<bool, RegistryError> {
        self.update(project, |node| std::mem::replace(&mut node.activated, activated))
    }

    pub fn is_activated(&self, project: &ProjectId) -> bool {
        self.inner
            .read()
            .nodes
            .get(project)
            .is_some_and(|node| node.activated)
    }

    /// Whether `kind` is queued for `project`; `consume` removes it.
    /// Unregistered projects have nothing pending.
    pub fn has_pending(&self, project: &ProjectId, kind: Transition, consume: bool) -> bool {
        if !consume {
            return self
                .inner
                .read()
                .nodes
                .get(project)
                .is_some_and(|node| node.pending.contains(&kind));
        }
        self.inner
            .write()
            .nodes
            .get_mut(project)
            .is_some_and(|node| node.has_pending(kind, true))
    }

    pub fn add_pending(&self, project: &ProjectId, kind: Transition) -> Result<bool, RegistryError> {
        self.update(project, |node| node.add_pending(kind))
    }

    pub fn remove_pending(&self, project: &ProjectId, kind: Transition) -> Result<bool, RegistryError> {
        self.update(project, |node| node.remove_pending(kind))
    }

    pub fn all_pending(&self, project: &ProjectId) -> BTreeSet<Transition> {
        self.inner
            .read()
            .nodes
            .get(project)
            .map(|node| node.pending.clone())
            .unwrap_or_default()
    }

    pub(crate) fn read_indexes(&self) -> parking_lot::RwLockReadGuard<'_, Indexes> {
        self.inner.read()
    }
}
