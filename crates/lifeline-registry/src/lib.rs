//! Unit registry for Lifeline.
//!
//! The `Registry` maps each project to exactly one `UnitNode` and keeps two
//! secondary indexes (unit id, symbolic key) in step with it. Reads are safe
//! from any thread; writes are expected from the single lifecycle operation
//! in flight. Duplicate detection among candidate projects and against
//! external units lives in `duplicates`.

pub mod duplicates;
pub mod registry;

pub use duplicates::ExternalUnit;
pub use registry::Registry;

use lifeline_model::ProjectId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("project not registered: {0}")]
    NotRegistered(ProjectId),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_error_display_invalid_argument() {
        let e = RegistryError::InvalidArgument("project id is blank".to_owned());
        assert!(e.to_string().contains("invalid argument"));
        assert!(e.to_string().contains("blank"));
    }

    #[test]
    fn registry_error_display_not_registered() {
        let e = RegistryError::NotRegistered(ProjectId::new("api"));
        assert!(e.to_string().contains("api"));
    }
}
