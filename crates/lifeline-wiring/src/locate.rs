use lifeline_model::ProjectId;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LocationError {
    #[error("no location known for project '{0}'")]
    NotFound(ProjectId),
    #[error("location of project '{project}' is not absolute: {path}")]
    NotAbsolute { project: ProjectId, path: String },
}

/// Owner of the project abstraction: tells where a project's unit content
/// lives on disk.
pub trait LocationResolver: Send + Sync {
    fn locate(&self, project: &ProjectId) -> Result<PathBuf, LocationError>;
}

/// Resolver backed by an explicit project-to-path table.
#[derive(Default)]
pub struct StaticLocationResolver {
    paths: RwLock<HashMap<ProjectId, PathBuf>>,
}

impl StaticLocationResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, project: ProjectId, path: impl AsRef<Path>) {
        self.paths.write().insert(project, path.as_ref().to_path_buf());
    }

    pub fn remove(&self, project: &ProjectId) -> Option<PathBuf> {
        self.paths.write().remove(project)
    }
}

impl LocationResolver for StaticLocationResolver {
    fn locate(&self, project: &ProjectId) -> Result<PathBuf, LocationError> {
        let path = self
            .paths
            .read()
            .get(project)
            .cloned()
            .ok_or_else(|| LocationError::NotFound(project.clone()))?;
        if !path.is_absolute() {
            return Err(LocationError::NotAbsolute {
                project: project.clone(),
                path: path.display().to_string(),
            });
        }
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_known_absolute_paths() {
        let resolver = StaticLocationResolver::new();
        resolver.insert(ProjectId::new("api"), "/work/api");
        assert_eq!(
            resolver.locate(&ProjectId::new("api")).unwrap(),
            PathBuf::from("/work/api")
        );
    }

    #[test]
    fn unknown_project_is_not_found() {
        let resolver = StaticLocationResolver::new();
        let err = resolver.locate(&ProjectId::new("ghost")).unwrap_err();
        assert!(matches!(err, LocationError::NotFound(_)));
    }

    #[test]
    fn relative_path_is_rejected() {
        let resolver = StaticLocationResolver::new();
        resolver.insert(ProjectId::new("rel"), "work/rel");
        let err = resolver.locate(&ProjectId::new("rel")).unwrap_err();
        assert!(matches!(err, LocationError::NotAbsolute { .. }));
    }
}
