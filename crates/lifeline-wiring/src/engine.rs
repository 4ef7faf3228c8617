use crate::WiringError;
use lifeline_model::{UnitDescriptor, UnitId, UnitState};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Read;
use std::sync::Arc;

/// Low-level state the wiring engine reports for a unit.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum StateCode {
    Uninstalled,
    Installed,
    Resolved,
    Starting,
    Stopping,
    Active,
}

impl From<StateCode> for UnitState {
    fn from(code: StateCode) -> Self {
        match code {
            StateCode::Uninstalled => UnitState::Uninstalled,
            StateCode::Installed => UnitState::Installed,
            StateCode::Resolved => UnitState::Resolved,
            StateCode::Starting => UnitState::Starting,
            StateCode::Stopping => UnitState::Stopping,
            StateCode::Active => UnitState::Active,
        }
    }
}

/// A unit as the engine knows it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UnitHandle {
    pub id: UnitId,
    pub descriptor: UnitDescriptor,
    pub location: String,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StartOptions {
    /// Do not record the start as persistent autostart state.
    pub transient: bool,
    /// Honour the unit's declared lazy activation policy.
    pub activation_policy: bool,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StopOptions {
    pub transient: bool,
}

/// Completion notice for a refresh request. Units listed in `errors` hit an
/// engine-level error while being refreshed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefreshEvent {
    pub refreshed: Vec<UnitId>,
    pub errors: BTreeMap<UnitId, String>,
}

/// Callback the engine invokes when a refresh completes, possibly on another
/// thread. A well-behaved engine invokes it exactly once per request.
pub type RefreshListener = Arc<dyn Fn(RefreshEvent) + Send + Sync>;

/// Content of a unit passed by value instead of by reference to its location.
pub type ContentStream = Box<dyn Read + Send>;

/// The external module system that resolves, loads and runs units.
pub trait WiringEngine: Send + Sync {
    fn install(
        &self,
        location: &str,
        content: Option<ContentStream>,
    ) -> Result<UnitHandle, WiringError>;

    /// Resolve the given units. `Ok(false)` means at least one unit stayed
    /// unresolved; callers query [`WiringEngine::state`] per unit to find out which.
    fn resolve(&self, units: &[UnitId]) -> Result<bool, WiringError>;

    /// Start an asynchronous refresh and report completion through `listener`.
    fn refresh(&self, units: &[UnitId], listener: RefreshListener) -> Result<(), WiringError>;

    fn start(&self, unit: UnitId, options: StartOptions) -> Result<(), WiringError>;

    fn stop(&self, unit: UnitId, options: StopOptions) -> Result<(), WiringError>;

    fn update(&self, unit: UnitId, content: Option<ContentStream>) -> Result<(), WiringError>;

    fn uninstall(&self, unit: UnitId) -> Result<(), WiringError>;

    /// Units transitively depending on `units`, the given units included.
    fn dependency_closure(&self, units: &[UnitId]) -> Result<Vec<UnitId>, WiringError>;

    /// Uninstalled or updated units whose old wiring is still in use.
    fn removal_pending(&self) -> Result<Vec<UnitId>, WiringError>;

    fn state(&self, unit: UnitId) -> Result<StateCode, WiringError>;

    fn unit(&self, unit: UnitId) -> Option<UnitHandle>;

    fn units(&self) -> Vec<UnitHandle>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_codes_map_to_unit_states() {
        assert_eq!(UnitState::from(StateCode::Resolved), UnitState::Resolved);
        assert_eq!(
            UnitState::from(StateCode::Uninstalled),
            UnitState::Uninstalled
        );
        assert_eq!(UnitState::from(StateCode::Active), UnitState::Active);
    }

    #[test]
    fn default_options_are_persistent() {
        assert!(!StartOptions::default().transient);
        assert!(!StopOptions::default().transient);
    }
}
