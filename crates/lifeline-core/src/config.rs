use crate::CoreError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// How install hands a unit's content to the wiring engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InstallMode {
    /// Pass a `reference:file:` location; the engine reads the project in place.
    #[default]
    Reference,
    /// Open the project location and stream it to the engine.
    ByValue,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Default bound for start and stop when the caller passes none.
    pub state_change_timeout_ms: Option<u64>,
    /// Bound on the wait for a refresh to complete. Unset waits forever.
    pub refresh_timeout_ms: Option<u64>,
    pub worker_threads: usize,
    /// How often a blocked caller checks for cancellation.
    pub poll_interval_ms: u64,
    pub install_mode: InstallMode,
    /// Activation flag given to projects registered implicitly by install.
    pub activate_on_register: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            state_change_timeout_ms: None,
            refresh_timeout_ms: None,
            worker_threads: 2,
            poll_interval_ms: 50,
            install_mode: InstallMode::Reference,
            activate_on_register: false,
        }
    }
}

impl EngineConfig {
    pub fn state_change_timeout(&self) -> Option<Duration> {
        self.state_change_timeout_ms.map(Duration::from_millis)
    }

    pub fn refresh_timeout(&self) -> Option<Duration> {
        self.refresh_timeout_ms.map(Duration::from_millis)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        if self.worker_threads == 0 {
            return Err(CoreError::Config(
                "worker_threads must be at least 1".to_owned(),
            ));
        }
        if self.poll_interval_ms == 0 {
            return Err(CoreError::Config(
                "poll_interval_ms must be greater than 0".to_owned(),
            ));
        }
        if self.state_change_timeout_ms == Some(0) {
            return Err(CoreError::Config(
                "state_change_timeout_ms must be greater than 0".to_owned(),
            ));
        }
        if self.refresh_timeout_ms == Some(0) {
            return Err(CoreError::Config(
                "refresh_timeout_ms must be greater than 0".to_owned(),
            ));
        }
        Ok(())
    }

    pub fn from_toml_str(content: &str) -> Result<Self, CoreError> {
        let config: Self = toml::from_str(content)
            .map_err(|e| CoreError::Config(format!("invalid engine config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, CoreError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Load from `$LIFELINE_CONFIG` or `~/.config/lifeline/engine.toml`,
    /// falling back to defaults when neither exists.
    pub fn load_default() -> Result<Self, CoreError> {
        match default_config_path() {
            Some(path) if path.exists() => {
                debug!("loading engine config from {}", path.display());
                Self::load(&path)
            }
            _ => Ok(Self::default()),
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), CoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = self.to_toml()?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String, CoreError> {
        toml::to_string_pretty(self)
            .map_err(|e| CoreError::Config(format!("cannot serialize engine config: {e}")))
    }
}

pub fn default_config_path() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("LIFELINE_CONFIG") {
        return Some(PathBuf::from(path));
    }
    let home = std::env::var("HOME").ok()?;
    Some(PathBuf::from(home).join(".config/lifeline/engine.toml"))
}
