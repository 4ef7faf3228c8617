//! Mapping from engine failures to the error kinds the core reports.

use lifeline_model::{Transition, TransitionError};
use lifeline_wiring::WiringError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Failure classification shared by the engine commands, their callers and
/// the transition error recorded on a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    InvalidArgument,
    IllegalState,
    LocationUnresolved,
    DuplicateUnit,
    ActivatorError,
    StateChangeTimeout,
    StateChangeInProgress,
    Incomplete,
    DependencyError,
    EngineUnavailable,
    UnitUnregistered,
    Interrupted,
    Exception,
    Config,
}

impl ErrorKind {
    /// Sticky error recorded on a node when a transition fails this way.
    pub fn transition_error(self) -> TransitionError {
        match self {
            ErrorKind::DuplicateUnit => TransitionError::Duplicate,
            ErrorKind::StateChangeTimeout
            | ErrorKind::StateChangeInProgress
            | ErrorKind::Interrupted => TransitionError::StateChange,
            ErrorKind::Incomplete => TransitionError::Incomplete,
            ErrorKind::DependencyError => TransitionError::Dependency,
            ErrorKind::ActivatorError | ErrorKind::Exception => TransitionError::Exception,
            ErrorKind::InvalidArgument
            | ErrorKind::IllegalState
            | ErrorKind::LocationUnresolved
            | ErrorKind::EngineUnavailable
            | ErrorKind::UnitUnregistered
            | ErrorKind::Config => TransitionError::Error,
        }
    }

    /// Whether the unit may still be mid-transition after a failure of this kind.
    pub fn leaves_unit_busy(self) -> bool {
        matches!(
            self,
            ErrorKind::StateChangeTimeout
                | ErrorKind::StateChangeInProgress
                | ErrorKind::Interrupted
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::InvalidArgument => "invalid-argument",
            ErrorKind::IllegalState => "illegal-state",
            ErrorKind::LocationUnresolved => "location-unresolved",
            ErrorKind::DuplicateUnit => "duplicate-unit",
            ErrorKind::ActivatorError => "activator-error",
            ErrorKind::StateChangeTimeout => "state-change-timeout",
            ErrorKind::StateChangeInProgress => "state-change-in-progress",
            ErrorKind::Incomplete => "incomplete",
            ErrorKind::DependencyError => "dependency-error",
            ErrorKind::EngineUnavailable => "engine-unavailable",
            ErrorKind::UnitUnregistered => "unit-unregistered",
            ErrorKind::Interrupted => "interrupted",
            ErrorKind::Exception => "exception",
            ErrorKind::Config => "config",
        };
        f.write_str(s)
    }
}

/// Classify an engine failure raised while performing `transition`.
///
/// Install, update and uninstall only distinguish naming collisions from
/// everything else. Start and stop additionally separate activator failures,
/// threads that died mid-transition, and units that are still busy changing
/// state. Resolve and refresh separate unsatisfied dependencies.
pub fn classify(transition: Transition, err: &WiringError) -> ErrorKind {
    match (transition, err) {
        (_, WiringError::DuplicateUnit { .. }) => ErrorKind::DuplicateUnit,
        (Transition::Start | Transition::Stop, WiringError::Activator { .. }) => {
            ErrorKind::ActivatorError
        }
        (Transition::Start | Transition::Stop, WiringError::ThreadTerminated { .. }) => {
            ErrorKind::Incomplete
        }
        (Transition::Start | Transition::Stop, WiringError::StateChange { .. }) => {
            ErrorKind::StateChangeInProgress
        }
        (
            Transition::Start | Transition::Resolve | Transition::Refresh,
            WiringError::Unresolved { .. },
        ) => ErrorKind::DependencyError,
        _ => ErrorKind::Exception,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lifeline_model::UnitId;

    fn unit() -> UnitId {
        UnitId::new(7)
    }

    #[test]
    fn duplicate_is_recognised_everywhere() {
        let err = WiringError::DuplicateUnit {
            name: "a".to_owned(),
            version: "1".to_owned(),
        };
        for t in [Transition::Install, Transition::Update, Transition::Start] {
            assert_eq!(classify(t, &err), ErrorKind::DuplicateUnit);
        }
    }

    #[test]
    fn start_stop_failures() {
        let activator = WiringError::Activator {
            unit: unit(),
            reason: "boom".to_owned(),
        };
        let terminated = WiringError::ThreadTerminated {
            unit: unit(),
            reason: "killed".to_owned(),
        };
        let busy = WiringError::StateChange {
            unit: unit(),
            reason: "lock".to_owned(),
        };
        assert_eq!(classify(Transition::Start, &activator), ErrorKind::ActivatorError);
        assert_eq!(classify(Transition::Stop, &terminated), ErrorKind::Incomplete);
        assert_eq!(
            classify(Transition::Start, &busy),
            ErrorKind::StateChangeInProgress
        );
    }

    #[test]
    fn install_only_separates_duplicates() {
        let activator = WiringError::Activator {
            unit: unit(),
            reason: "boom".to_owned(),
        };
        assert_eq!(classify(Transition::Install, &activator), ErrorKind::Exception);
        let io = WiringError::Io(std::io::Error::new(std::io::ErrorKind::NotFound, "gone"));
        assert_eq!(classify(Transition::Install, &io), ErrorKind::Exception);
    }

    #[test]
    fn unresolved_is_dependency_error() {
        let err = WiringError::Unresolved {
            unit: unit(),
            reason: "missing api".to_owned(),
        };
        assert_eq!(classify(Transition::Start, &err), ErrorKind::DependencyError);
        assert_eq!(classify(Transition::Resolve, &err), ErrorKind::DependencyError);
        assert_eq!(classify(Transition::Uninstall, &err), ErrorKind::Exception);
    }

    #[test]
    fn kinds_map_to_sticky_errors() {
        assert_eq!(
            ErrorKind::DuplicateUnit.transition_error(),
            TransitionError::Duplicate
        );
        assert_eq!(
            ErrorKind::StateChangeTimeout.transition_error(),
            TransitionError::StateChange
        );
        assert_eq!(
            ErrorKind::ActivatorError.transition_error(),
            TransitionError::Exception
        );
        assert!(ErrorKind::StateChangeInProgress.leaves_unit_busy());
        assert!(!ErrorKind::Incomplete.leaves_unit_busy());
    }
}
