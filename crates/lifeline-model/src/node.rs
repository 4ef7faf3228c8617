use crate::key::UnitDescriptor;
use crate::state::{Transition, TransitionError, UnitState};
use crate::types::{ProjectId, UnitId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Registry record for one project and the unit built from it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UnitNode {
    pub project: ProjectId,
    /// Assigned by the wiring engine on install, cleared on uninstall.
    pub unit_id: Option<UnitId>,
    pub activated: bool,
    pub current_state: UnitState,
    pub last_transition: Transition,
    pub transition_error: TransitionError,
    #[serde(default)]
    pub pending: BTreeSet<Transition>,
    /// Name and version, known once the project declared them or the engine
    /// reported them on install.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub descriptor: Option<UnitDescriptor>,
}

impl UnitNode {
    pub fn new(project: ProjectId, unit_id: Option<UnitId>, activated: bool) -> Self {
        let current_state = if unit_id.is_some() {
            UnitState::Installed
        } else {
            UnitState::StateLess
        };
        Self {
            project,
            unit_id,
            activated,
            current_state,
            last_transition: Transition::NoTransition,
            transition_error: TransitionError::NoError,
            pending: BTreeSet::new(),
            descriptor: None,
        }
    }

    /// Symbolic key, when the descriptor is known.
    pub fn key(&self) -> Option<String> {
        self.descriptor.as_ref().map(UnitDescriptor::key)
    }

    pub fn name(&self) -> Option<&str> {
        self.descriptor.as_ref().map(|d| d.name.as_str())
    }

    /// State as shown to users: deactivated units are only ever install
    /// candidates, so anything past `Installed` is capped.
    pub fn reported_state(&self) -> UnitState {
        self.current_state.reported(self.activated)
    }

    pub fn has_error(&self) -> bool {
        self.transition_error.is_error()
    }

    /// Returns whether `kind` is pending; removes it when `consume` is set.
    pub fn has_pending(&mut self, kind: Transition, consume: bool) -> bool {
        if consume {
            self.pending.remove(&kind)
        } else {
            self.pending.contains(&kind)
        }
    }

    pub fn add_pending(&mut self, kind: Transition) -> bool {
        self.pending.insert(kind)
    }

    pub fn remove_pending(&mut self, kind: Transition) -> bool {
        self.pending.remove(&kind)
    }
}
