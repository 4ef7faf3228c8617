//! Data model for Lifeline managed units.
//!
//! This crate defines the vocabulary shared by every other layer: project and
//! unit identities (`ProjectId`, `UnitId`), the lifecycle states a unit moves
//! through (`UnitState`), the operations that move it (`Transition`), the
//! sticky failure marker (`TransitionError`), the per-project record
//! (`UnitNode`), and the symbolic key used for duplicate detection.

pub mod key;
pub mod node;
pub mod state;
pub mod types;

pub use key::{symbolic_key, UnitDescriptor};
pub use node::UnitNode;
pub use state::{Transition, TransitionError, UnitState};
pub use types::{ProjectId, UnitId};
