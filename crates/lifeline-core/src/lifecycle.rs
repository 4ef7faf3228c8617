use crate::CoreError;
use lifeline_model::{Transition, TransitionError, UnitNode, UnitState};

/// Check that `transition` may run from `from` and return the state the
/// node is in once it commits.
pub fn validate_transition(from: UnitState, transition: Transition) -> Result<UnitState, CoreError> {
    use UnitState::{Active, Installed, Resolved, StateLess, Starting, Stopping, Uninstalled};

    let post = match (transition, from) {
        (Transition::Install, StateLess | Uninstalled) => Some(Installed),
        (Transition::Resolve, Installed) => Some(Resolved),
        // Already resolved: nothing to do, the state stays.
        (Transition::Resolve, Resolved | Starting | Active | Stopping) => Some(from),
        (Transition::Start, Installed | Resolved | Starting | Active) => Some(Active),
        (Transition::Stop, Active | Starting) => Some(Resolved),
        (Transition::Update, Installed | Resolved) => Some(Installed),
        // An uninstalled node has no unit to re-resolve.
        (Transition::Refresh, Uninstalled) => Some(Uninstalled),
        (Transition::Refresh, _) => Some(Installed),
        (Transition::Uninstall, StateLess | Installed | Resolved | Starting | Active | Stopping) => {
            Some(Uninstalled)
        }
        (
            Transition::NoTransition
            | Transition::Build
            | Transition::Activate
            | Transition::Deactivate
            | Transition::External,
            _,
        ) => Some(from),
        _ => None,
    };

    post.ok_or(CoreError::IllegalState {
        transition,
        state: from,
    })
}

/// Record that `transition` is being attempted on `node`.
pub fn begin(node: &mut UnitNode, transition: Transition) {
    node.last_transition = transition;
}

/// Make `post` the node's state and clear any sticky error.
pub fn commit(node: &mut UnitNode, post: UnitState) {
    node.current_state = post;
    node.transition_error = TransitionError::NoError;
}

/// Record a failed transition. The node takes the state the engine actually
/// reports, or its pre-transition state when the engine cannot tell.
pub fn rollback(
    node: &mut UnitNode,
    pre: UnitState,
    actual: Option<UnitState>,
    error: TransitionError,
) {
    node.current_state = actual.unwrap_or(pre);
    node.transition_error = error;
}
