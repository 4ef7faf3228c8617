use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a managed unit, tracked independently of the wiring
/// engine so the registry stays consistent while the engine is unreachable.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum UnitState {
    /// Known to the registry but never installed.
    #[default]
    StateLess,
    Installed,
    Resolved,
    Starting,
    Active,
    Stopping,
    Uninstalled,
}

impl UnitState {
    /// States in which the engine holds a live unit for the node.
    pub fn is_installed(self) -> bool {
        !matches!(self, UnitState::StateLess | UnitState::Uninstalled)
    }

    /// States that count as "module state" beyond plain installation.
    pub fn is_beyond_installed(self) -> bool {
        matches!(
            self,
            UnitState::Resolved | UnitState::Starting | UnitState::Active | UnitState::Stopping
        )
    }

    /// The state shown to users: a deactivated unit never reports more than
    /// `Installed`.
    pub fn reported(self, activated: bool) -> UnitState {
        if !activated && self.is_beyond_installed() {
            UnitState::Installed
        } else {
            self
        }
    }
}

impl fmt::Display for UnitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnitState::StateLess => write!(f, "stateless"),
            UnitState::Installed => write!(f, "installed"),
            UnitState::Resolved => write!(f, "resolved"),
            UnitState::Starting => write!(f, "starting"),
            UnitState::Active => write!(f, "active"),
            UnitState::Stopping => write!(f, "stopping"),
            UnitState::Uninstalled => write!(f, "uninstalled"),
        }
    }
}

/// A named lifecycle operation. Also used as the element type of a node's
/// pending-transition set.
#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
#[serde(rename_all = "kebab-case")]
pub enum Transition {
    #[default]
    NoTransition,
    Install,
    Resolve,
    Start,
    Stop,
    Update,
    Refresh,
    Uninstall,
    Build,
    Activate,
    Deactivate,
    /// A state change the wiring engine performed on its own.
    External,
}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Transition::NoTransition => "no-transition",
            Transition::Install => "install",
            Transition::Resolve => "resolve",
            Transition::Start => "start",
            Transition::Stop => "stop",
            Transition::Update => "update",
            Transition::Refresh => "refresh",
            Transition::Uninstall => "uninstall",
            Transition::Build => "build",
            Transition::Activate => "activate",
            Transition::Deactivate => "deactivate",
            Transition::External => "external",
        };
        f.write_str(s)
    }
}

/// Sticky failure marker stored on a node. Set by a rollback, cleared by the
/// next clean commit or by an explicit reset.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum TransitionError {
    #[default]
    NoError,
    Exception,
    StateChange,
    Incomplete,
    Duplicate,
    Dependency,
    Cycle,
    Build,
    WorkspaceDuplicate,
    Error,
}

impl TransitionError {
    pub fn is_error(self) -> bool {
        self != TransitionError::NoError
    }
}

impl fmt::Display for TransitionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransitionError::NoError => "none",
            TransitionError::Exception => "exception",
            TransitionError::StateChange => "state-change",
            TransitionError::Incomplete => "incomplete",
            TransitionError::Duplicate => "duplicate",
            TransitionError::Dependency => "dependency",
            TransitionError::Cycle => "cycle",
            TransitionError::Build => "build",
            TransitionError::WorkspaceDuplicate => "workspace-duplicate",
            TransitionError::Error => "error",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn installed_states() {
        assert!(!UnitState::StateLess.is_installed());
        assert!(!UnitState::Uninstalled.is_installed());
        assert!(UnitState::Installed.is_installed());
        assert!(UnitState::Active.is_installed());
    }

    #[test]
    fn beyond_installed() {
        assert!(!UnitState::Installed.is_beyond_installed());
        assert!(UnitState::Resolved.is_beyond_installed());
        assert!(UnitState::Stopping.is_beyond_installed());
    }

    #[test]
    fn deactivated_reports_at_most_installed() {
        assert_eq!(UnitState::Active.reported(false), UnitState::Installed);
        assert_eq!(UnitState::Active.reported(true), UnitState::Active);
        assert_eq!(UnitState::Uninstalled.reported(false), UnitState::Uninstalled);
    }

    #[test]
    fn serde_names_are_kebab_case() {
        assert_eq!(
            serde_json::to_string(&UnitState::StateLess).unwrap(),
            "\"state-less\""
        );
        assert_eq!(
            serde_json::to_string(&Transition::NoTransition).unwrap(),
            "\"no-transition\""
        );
        assert_eq!(
            serde_json::to_string(&TransitionError::WorkspaceDuplicate).unwrap(),
            "\"workspace-duplicate\""
        );
    }

    #[test]
    fn defaults() {
        assert_eq!(UnitState::default(), UnitState::StateLess);
        assert_eq!(Transition::default(), Transition::NoTransition);
        assert!(!TransitionError::default().is_error());
    }
}
