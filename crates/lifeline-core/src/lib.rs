//! Lifecycle transition engine for Lifeline managed units.
//!
//! This crate ties the registry and the wiring-engine contracts together into
//! the `Engine`, the central API for installing, resolving, refreshing,
//! starting, stopping, updating and uninstalling units. It also provides the
//! per-transition state machine, the classification of engine failures,
//! transition-event delivery, and the worker pool and completion signal used
//! to wait on blocking or callback-driven engine calls.

pub mod classify;
pub mod concurrency;
pub mod config;
pub mod engine;
pub mod events;
pub mod lifecycle;

pub use classify::{classify, ErrorKind};
pub use concurrency::{install_signal_handler, shutdown_requested, CancelToken, WorkerPool};
pub use config::{EngineConfig, InstallMode};
pub use engine::{Engine, RefreshReport, ResolveReport};
pub use events::{EventRecorder, ListenerId, TransitionEvent, TransitionListener, TransitionOutcome};
pub use lifecycle::validate_transition;

use lifeline_model::{ProjectId, Transition, UnitId, UnitState};
use lifeline_registry::RegistryError;
use lifeline_wiring::WiringError;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("illegal state: cannot {transition} a unit in state {state}")]
    IllegalState {
        transition: Transition,
        state: UnitState,
    },
    #[error("cannot resolve location of project '{project}': {reason}")]
    LocationUnresolved { project: ProjectId, reason: String },
    #[error("duplicate unit during {transition}: {source}")]
    DuplicateUnit {
        transition: Transition,
        source: WiringError,
    },
    #[error("activator failed during {transition}: {source}")]
    Activator {
        transition: Transition,
        source: WiringError,
    },
    #[error("{transition} of unit {unit} did not complete within {timeout:?}; it may still be changing state")]
    StateChangeTimeout {
        unit: UnitId,
        transition: Transition,
        timeout: Duration,
    },
    #[error("refresh did not complete within {timeout:?}")]
    RefreshTimeout { timeout: Duration },
    #[error("unit is still changing state during {transition}: {source}")]
    StateChangeInProgress {
        transition: Transition,
        source: WiringError,
    },
    #[error("{transition} aborted mid-flight and needs manual recovery: {reason}")]
    Incomplete {
        transition: Transition,
        reason: String,
    },
    #[error("dependency error during {transition}: {source}")]
    Dependency {
        transition: Transition,
        source: WiringError,
    },
    #[error("wiring engine is not available")]
    EngineUnavailable,
    #[error("unit {0} is not registered")]
    UnitUnregistered(UnitId),
    #[error("interrupted while waiting for {0}")]
    Interrupted(Transition),
    #[error("{transition} failed: {source}")]
    Engine {
        transition: Transition,
        source: WiringError,
    },
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("configuration error: {0}")]
    Config(String),
}

impl CoreError {
    /// Error kind as seen by callers that do not care about payloads.
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoreError::InvalidArgument(_)
            | CoreError::Registry(RegistryError::InvalidArgument(_)) => ErrorKind::InvalidArgument,
            CoreError::IllegalState { .. } => ErrorKind::IllegalState,
            CoreError::LocationUnresolved { .. } => ErrorKind::LocationUnresolved,
            CoreError::DuplicateUnit { .. } => ErrorKind::DuplicateUnit,
            CoreError::Activator { .. } => ErrorKind::ActivatorError,
            CoreError::StateChangeTimeout { .. } | CoreError::RefreshTimeout { .. } => {
                ErrorKind::StateChangeTimeout
            }
            CoreError::StateChangeInProgress { .. } => ErrorKind::StateChangeInProgress,
            CoreError::Incomplete { .. } => ErrorKind::Incomplete,
            CoreError::Dependency { .. } => ErrorKind::DependencyError,
            CoreError::EngineUnavailable => ErrorKind::EngineUnavailable,
            CoreError::UnitUnregistered(_) | CoreError::Registry(RegistryError::NotRegistered(_)) => {
                ErrorKind::UnitUnregistered
            }
            CoreError::Interrupted(_) => ErrorKind::Interrupted,
            CoreError::Engine { .. } | CoreError::Io(_) => ErrorKind::Exception,
            CoreError::Config(_) => ErrorKind::Config,
        }
    }

    /// Wrap an engine failure in the variant its classification calls for.
    pub fn from_engine(transition: Transition, source: WiringError) -> Self {
        match classify(transition, &source) {
            ErrorKind::DuplicateUnit => CoreError::DuplicateUnit { transition, source },
            ErrorKind::ActivatorError => CoreError::Activator { transition, source },
            ErrorKind::StateChangeInProgress => {
                CoreError::StateChangeInProgress { transition, source }
            }
            ErrorKind::Incomplete => CoreError::Incomplete {
                transition,
                reason: source.to_string(),
            },
            ErrorKind::DependencyError => CoreError::Dependency { transition, source },
            _ => CoreError::Engine { transition, source },
        }
    }
}
