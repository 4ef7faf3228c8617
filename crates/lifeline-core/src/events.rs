//! Transition events delivered to observers after each lifecycle operation.

use chrono::{DateTime, Utc};
use lifeline_model::{ProjectId, Transition, TransitionError, UnitId, UnitState};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "kebab-case")]
pub enum TransitionOutcome {
    Committed,
    RolledBack { error: TransitionError },
}

impl TransitionOutcome {
    pub fn is_committed(self) -> bool {
        matches!(self, TransitionOutcome::Committed)
    }
}

/// One finished transition attempt on one unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransitionEvent {
    /// Monotonic per-engine sequence number.
    pub seq: u64,
    pub project: Option<ProjectId>,
    pub unit: Option<UnitId>,
    pub transition: Transition,
    pub outcome: TransitionOutcome,
    /// Node state after the commit or rollback, as reported to users.
    pub state: UnitState,
    pub at: DateTime<Utc>,
}

pub type TransitionListener = Arc<dyn Fn(&TransitionEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

#[derive(Default)]
pub(crate) struct TransitionListeners {
    next_id: AtomicU64,
    next_seq: AtomicU64,
    listeners: RwLock<Vec<(ListenerId, TransitionListener)>>,
}

impl TransitionListeners {
    pub(crate) fn subscribe(&self, listener: TransitionListener) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.listeners.write().push((id, listener));
        id
    }

    pub(crate) fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    pub(crate) fn emit(
        &self,
        project: Option<ProjectId>,
        unit: Option<UnitId>,
        transition: Transition,
        outcome: TransitionOutcome,
        state: UnitState,
    ) {
        let event = TransitionEvent {
            seq: self.next_seq.fetch_add(1, Ordering::SeqCst),
            project,
            unit,
            transition,
            outcome,
            state,
            at: Utc::now(),
        };
        debug!(
            "{} {} on {}: {:?}",
            event.transition,
            if outcome.is_committed() { "committed" } else { "rolled back" },
            event
                .project
                .as_ref()
                .map_or("<unregistered>", ProjectId::as_str),
            event.outcome
        );
        // Listeners run outside the lock so they may subscribe or unsubscribe.
        let snapshot: Vec<TransitionListener> = self
            .listeners
            .read()
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        for listener in snapshot {
            listener(&event);
        }
    }
}

/// Emits exactly one event for a transition attempt when dropped, whether
/// the attempt committed, rolled back, or unwound.
pub(crate) struct TransitionScope<'a> {
    listeners: &'a TransitionListeners,
    project: Option<ProjectId>,
    unit: Option<UnitId>,
    transition: Transition,
    pre: UnitState,
    activated: bool,
    finished: Option<(TransitionOutcome, UnitState)>,
}

impl<'a> TransitionScope<'a> {
    pub(crate) fn new(
        listeners: &'a TransitionListeners,
        project: Option<ProjectId>,
        unit: Option<UnitId>,
        transition: Transition,
        pre: UnitState,
    ) -> Self {
        Self {
            listeners,
            project,
            unit,
            transition,
            pre,
            activated: true,
            finished: None,
        }
    }

    /// Cap the emitted state for a deactivated node.
    pub(crate) fn set_activated(&mut self, activated: bool) {
        self.activated = activated;
    }

    pub(crate) fn set_unit(&mut self, unit: Option<UnitId>) {
        self.unit = unit;
    }

    pub(crate) fn committed(&mut self, state: UnitState) {
        self.finished = Some((TransitionOutcome::Committed, state));
    }

    pub(crate) fn rolled_back(&mut self, error: TransitionError, state: UnitState) {
        self.finished = Some((TransitionOutcome::RolledBack { error }, state));
    }
}

impl Drop for TransitionScope<'_> {
    fn drop(&mut self) {
        let (outcome, state) = self.finished.take().unwrap_or((
            TransitionOutcome::RolledBack {
                error: TransitionError::Exception,
            },
            self.pre,
        ));
        self.listeners.emit(
            self.project.take(),
            self.unit,
            self.transition,
            outcome,
            state.reported(self.activated),
        );
    }
}

/// Listener that keeps every event it sees, for tests and reporting.
#[derive(Clone, Default)]
pub struct EventRecorder {
    events: Arc<Mutex<Vec<TransitionEvent>>>,
}

impl EventRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn listener(&self) -> TransitionListener {
        let events = Arc::clone(&self.events);
        Arc::new(move |event: &TransitionEvent| events.lock().push(event.clone()))
    }

    pub fn events(&self) -> Vec<TransitionEvent> {
        self.events.lock().clone()
    }

    pub fn count(&self, transition: Transition) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| e.transition == transition)
            .count()
    }

    pub fn last(&self) -> Option<TransitionEvent> {
        self.events.lock().last().cloned()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}
