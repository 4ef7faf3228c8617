//! Naming-collision detection among registered projects and against units the
//! wiring engine knows about but no project owns.

use crate::registry::Registry;
use lifeline_model::{ProjectId, UnitDescriptor, UnitId, UnitNode};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::debug;

/// A unit installed in the wiring engine, described by its identity and
/// symbolic name/version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalUnit {
    pub id: UnitId,
    pub descriptor: UnitDescriptor,
}

impl ExternalUnit {
    pub fn new(id: UnitId, descriptor: UnitDescriptor) -> Self {
        Self { id, descriptor }
    }
}

impl Registry {
    /// Map each colliding candidate to the project it collides with.
    ///
    /// Candidates are compared by symbolic key in order: the first holder of a
    /// key is the reference and every later candidate with that key maps to
    /// it, so a pair is reported once and never in both directions. Projects
    /// in `scope` that are not candidates are then checked against the
    /// remaining first holders. Projects without a known descriptor are
    /// skipped.
    pub fn find_duplicates(
        &self,
        candidates: &[ProjectId],
        scope: &[ProjectId],
    ) -> BTreeMap<ProjectId, ProjectId> {
        let inner = self.read_indexes();
        let key_of = |project: &ProjectId| {
            inner
                .nodes
                .get(project)
                .and_then(UnitNode::key)
                .filter(|key| !key.is_empty())
        };

        let mut first_by_key: HashMap<String, &ProjectId> = HashMap::new();
        let mut duplicates = BTreeMap::new();
        for candidate in candidates {
            let Some(key) = key_of(candidate) else {
                continue;
            };
            match first_by_key.get(&key) {
                Some(first) if *first != candidate => {
                    duplicates.insert(candidate.clone(), (*first).clone());
                }
                Some(_) => {}
                None => {
                    first_by_key.insert(key, candidate);
                }
            }
        }

        let candidate_set: HashSet<&ProjectId> = candidates.iter().collect();
        for other in scope.iter().filter(|s| !candidate_set.contains(s)) {
            let Some(key) = key_of(other) else {
                continue;
            };
            if let Some(first) = first_by_key.get(&key) {
                duplicates
                    .entry((*first).clone())
                    .or_insert_with(|| other.clone());
            }
        }

        if !duplicates.is_empty() {
            debug!("found {} duplicate candidate(s)", duplicates.len());
        }
        duplicates
    }

    /// Map each candidate to an external unit carrying the same symbolic
    /// name. With `disjoint`, external units that are the candidates' own
    /// installed units are removed first, so a project never collides with
    /// itself.
    pub fn find_external_duplicates(
        &self,
        candidates: &[ProjectId],
        external: &[ExternalUnit],
        disjoint: bool,
    ) -> BTreeMap<ProjectId, ExternalUnit> {
        let inner = self.read_indexes();
        let nodes: Vec<&UnitNode> = candidates
            .iter()
            .filter_map(|project| inner.nodes.get(project))
            .collect();

        let own: HashSet<UnitId> = nodes.iter().filter_map(|node| node.unit_id).collect();
        let pool: Vec<&ExternalUnit> = external
            .iter()
            .filter(|unit| !disjoint || !own.contains(&unit.id))
            .collect();

        let mut duplicates = BTreeMap::new();
        for node in nodes {
            let Some(name) = node.name() else {
                continue;
            };
            if let Some(unit) = pool.iter().find(|unit| unit.descriptor.name == name) {
                duplicates.insert(node.project.clone(), (*unit).clone());
            }
        }
        duplicates
    }
}
