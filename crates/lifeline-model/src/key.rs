use serde::{Deserialize, Serialize};

/// Build the symbolic key of a unit: name and version concatenated with no
/// separator. Missing parts contribute nothing, so `symbolic_key(None, None)`
/// is the empty string. The exact shape is persisted by collaborators and
/// must not change.
pub fn symbolic_key(name: Option<&str>, version: Option<&str>) -> String {
    let name = name.unwrap_or("");
    let version = version.unwrap_or("");
    let mut key = String::with_capacity(name.len() + version.len());
    key.push_str(name);
    key.push_str(version);
    key
}

/// Symbolic name and version of a unit as declared by its project or reported
/// by the wiring engine.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UnitDescriptor {
    pub name: String,
    pub version: String,
}

impl UnitDescriptor {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }

    pub fn key(&self) -> String {
        symbolic_key(Some(&self.name), Some(&self.version))
    }
}
