//! Collaborator contracts consumed by the Lifeline core.
//!
//! The core never manipulates units itself. It talks to a `WiringEngine`
//! (install, resolve, refresh, start, stop, update, uninstall, queries), tells
//! a `DuplicateFilter` which instances may coexist before a resolve or update,
//! and asks a `LocationResolver` where a project lives. `MockWiringEngine` is a
//! scriptable in-memory engine used by the tests and the CLI simulator.

pub mod engine;
pub mod filter;
pub mod locate;
pub mod mock;

pub use engine::{
    ContentStream, RefreshEvent, RefreshListener, StartOptions, StateCode, StopOptions, UnitHandle, WiringEngine,
};
pub use filter::{CandidateGroups, DuplicateFilter, RecordingFilter};
pub use locate::{LocationError, LocationResolver, StaticLocationResolver};
pub use mock::{Fault, MockWiringEngine, Op, RefreshMode};

use lifeline_model::UnitId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WiringError {
    #[error("wiring I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("a unit named '{name}' with version '{version}' is already installed")]
    DuplicateUnit { name: String, version: String },
    #[error("activator of unit {unit} failed: {reason}")]
    Activator { unit: UnitId, reason: String },
    #[error("unit {unit} is already changing state: {reason}")]
    StateChange { unit: UnitId, reason: String },
    #[error("worker running unit {unit} terminated abnormally: {reason}")]
    ThreadTerminated { unit: UnitId, reason: String },
    #[error("unit {unit} could not be resolved: {reason}")]
    Unresolved { unit: UnitId, reason: String },
    #[error("unknown unit: {0}")]
    UnknownUnit(UnitId),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("wiring engine failure: {0}")]
    Failed(String),
}

impl WiringError {
    /// Errors the engine documents as benign for argument-checking queries.
    pub fn is_rejected_argument(&self) -> bool {
        matches!(
            self,
            WiringError::InvalidArgument(_) | WiringError::UnknownUnit(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wiring_error_display_duplicate() {
        let e = WiringError::DuplicateUnit {
            name: "api".to_owned(),
            version: "1.0".to_owned(),
        };
        let msg = e.to_string();
        assert!(msg.contains("api"));
        assert!(msg.contains("1.0"));
    }

    #[test]
    fn wiring_error_display_activator() {
        let e = WiringError::Activator {
            unit: UnitId::new(4),
            reason: "boom".to_owned(),
        };
        assert!(e.to_string().contains("#4"));
        assert!(e.to_string().contains("boom"));
    }

    #[test]
    fn rejected_arguments() {
        assert!(WiringError::UnknownUnit(UnitId::new(1)).is_rejected_argument());
        assert!(WiringError::InvalidArgument("x".to_owned()).is_rejected_argument());
        assert!(!WiringError::Failed("x".to_owned()).is_rejected_argument());
    }
}
