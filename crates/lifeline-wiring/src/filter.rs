use lifeline_model::UnitId;
use parking_lot::Mutex;
use std::collections::BTreeMap;

/// Unit mapped to the instances it is a singleton candidate against.
pub type CandidateGroups = BTreeMap<UnitId, Vec<UnitId>>;

/// Hook through which the core tells the engine which instances of a
/// symbolic name may coexist before a resolve or update.
pub trait DuplicateFilter: Send + Sync {
    fn declare(&self, groups: CandidateGroups);

    fn clear(&self);
}

/// Filter that only remembers what it was told. Used when no engine-side
/// hook exists and by tests asserting on declarations.
#[derive(Default)]
pub struct RecordingFilter {
    current: Mutex<CandidateGroups>,
    history: Mutex<Vec<CandidateGroups>>,
}

impl RecordingFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> CandidateGroups {
        self.current.lock().clone()
    }

    pub fn history(&self) -> Vec<CandidateGroups> {
        self.history.lock().clone()
    }
}

impl DuplicateFilter for RecordingFilter {
    fn declare(&self, groups: CandidateGroups) {
        self.history.lock().push(groups.clone());
        *self.current.lock() = groups;
    }

    fn clear(&self) {
        self.current.lock().clear();
    }
}
