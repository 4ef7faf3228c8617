//! Session plans: the units a simulated workspace provides and the steps to
//! replay against it.

use lifeline_core::{EngineConfig, ErrorKind};
use lifeline_wiring::{Fault, Op};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PlanError {
    #[error("plan error: cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("plan error: {0}")]
    Parse(String),
    #[error("plan error: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Plan {
    /// Overrides the engine configuration for this session.
    #[serde(default)]
    pub engine: Option<EngineConfig>,
    #[serde(default, rename = "unit")]
    pub units: Vec<UnitSpec>,
    #[serde(default, rename = "step")]
    pub steps: Vec<Step>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UnitSpec {
    pub project: String,
    pub name: String,
    pub version: String,
    /// Defaults to `/workspace/<project>`.
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default)]
    pub requires: Vec<String>,
    #[serde(default = "default_true")]
    pub activated: bool,
}

fn default_true() -> bool {
    true
}

impl UnitSpec {
    pub fn location(&self) -> PathBuf {
        self.path
            .clone()
            .unwrap_or_else(|| PathBuf::from("/workspace").join(&self.project))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StepOp {
    Install,
    Resolve,
    Refresh,
    Start,
    Stop,
    Update,
    Uninstall,
    Unregister,
    Activate,
    Deactivate,
    /// Script a fault in the simulated engine.
    Inject,
    ClearFaults,
    /// Make the next update of a unit change its version.
    StageUpdate,
    /// Let calls blocked on a `hang` fault continue.
    Release,
    ClearMarker,
}

impl StepOp {
    pub fn as_str(self) -> &'static str {
        match self {
            StepOp::Install => "install",
            StepOp::Resolve => "resolve",
            StepOp::Refresh => "refresh",
            StepOp::Start => "start",
            StepOp::Stop => "stop",
            StepOp::Update => "update",
            StepOp::Uninstall => "uninstall",
            StepOp::Unregister => "unregister",
            StepOp::Activate => "activate",
            StepOp::Deactivate => "deactivate",
            StepOp::Inject => "inject",
            StepOp::ClearFaults => "clear-faults",
            StepOp::StageUpdate => "stage-update",
            StepOp::Release => "release",
            StepOp::ClearMarker => "clear-marker",
        }
    }

    /// Whether the step acts on a list of projects. Refresh may take none.
    fn needs_projects(self) -> bool {
        !matches!(
            self,
            StepOp::Refresh | StepOp::ClearFaults | StepOp::Release | StepOp::ClearMarker
        )
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Step {
    pub op: StepOp,
    #[serde(default)]
    pub project: Option<String>,
    #[serde(default)]
    pub projects: Vec<String>,
    /// Error kind the step is expected to fail with.
    #[serde(default)]
    pub expect: Option<ErrorKind>,
    #[serde(default)]
    pub fault: Option<FaultSpec>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub transient: bool,
    #[serde(default)]
    pub unregister: bool,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl Step {
    /// `project` and `projects` combined, in plan order.
    pub fn targets(&self) -> Vec<String> {
        self.project
            .iter()
            .chain(self.projects.iter())
            .cloned()
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FaultOp {
    Resolve,
    Refresh,
    Start,
    Stop,
    Update,
    Uninstall,
}

impl From<FaultOp> for Op {
    fn from(op: FaultOp) -> Self {
        match op {
            FaultOp::Resolve => Op::Resolve,
            FaultOp::Refresh => Op::Refresh,
            FaultOp::Start => Op::Start,
            FaultOp::Stop => Op::Stop,
            FaultOp::Update => Op::Update,
            FaultOp::Uninstall => Op::Uninstall,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FaultKind {
    Duplicate,
    Activator,
    StateChange,
    ThreadTerminated,
    Unresolved,
    Failed,
    Panic,
    Hang,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FaultSpec {
    pub on: FaultOp,
    pub kind: FaultKind,
    #[serde(default)]
    pub reason: String,
}

impl FaultSpec {
    pub fn to_fault(&self) -> Fault {
        let reason = if self.reason.is_empty() {
            "injected".to_owned()
        } else {
            self.reason.clone()
        };
        match self.kind {
            FaultKind::Duplicate => Fault::Duplicate,
            FaultKind::Activator => Fault::Activator(reason),
            FaultKind::StateChange => Fault::StateChange(reason),
            FaultKind::ThreadTerminated => Fault::ThreadTerminated(reason),
            FaultKind::Unresolved => Fault::Unresolved(reason),
            FaultKind::Failed => Fault::Failed(reason),
            FaultKind::Panic => Fault::Panic(reason),
            FaultKind::Hang => Fault::Hang,
        }
    }
}

impl Plan {
    pub fn load(path: &Path) -> Result<Self, PlanError> {
        let content = std::fs::read_to_string(path).map_err(|source| PlanError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, PlanError> {
        let plan: Self = toml::from_str(content).map_err(|e| PlanError::Parse(e.to_string()))?;
        plan.validate()?;
        Ok(plan)
    }

    fn validate(&self) -> Result<(), PlanError> {
        if let Some(config) = &self.engine {
            config
                .validate()
                .map_err(|e| PlanError::Invalid(e.to_string()))?;
        }

        let mut known = HashSet::new();
        for unit in &self.units {
            if unit.project.trim().is_empty() {
                return Err(PlanError::Invalid("unit with blank project".to_owned()));
            }
            if !known.insert(unit.project.as_str()) {
                return Err(PlanError::Invalid(format!(
                    "project '{}' is declared twice",
                    unit.project
                )));
            }
            if !unit.location().is_absolute() {
                return Err(PlanError::Invalid(format!(
                    "path of project '{}' must be absolute",
                    unit.project
                )));
            }
        }

        for (index, step) in self.steps.iter().enumerate() {
            let n = index + 1;
            let targets = step.targets();
            if step.op.needs_projects() && targets.is_empty() {
                return Err(PlanError::Invalid(format!(
                    "step {n} ({}) names no project",
                    step.op.as_str()
                )));
            }
            if let Some(unknown) = targets.iter().find(|t| !known.contains(t.as_str())) {
                return Err(PlanError::Invalid(format!(
                    "step {n} refers to undeclared project '{unknown}'"
                )));
            }
            if step.op == StepOp::Inject && step.fault.is_none() {
                return Err(PlanError::Invalid(format!("step {n} (inject) has no fault")));
            }
            if step.op == StepOp::StageUpdate && step.version.is_none() {
                return Err(PlanError::Invalid(format!(
                    "step {n} (stage-update) has no version"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[engine]
state_change_timeout_ms = 200

[[unit]]
project = "api"
name = "api"
version = "1.0"

[[unit]]
project = "web"
name = "web"
version = "1.0"
path = "/srv/web"
requires = ["api"]
activated = false

[[step]]
op = "install"
projects = ["api", "web"]

[[step]]
op = "inject"
project = "web"
fault = { on = "start", kind = "activator", reason = "bad config" }

[[step]]
op = "start"
project = "web"
expect = "activator-error"

[[step]]
op = "refresh"
"#;

    #[test]
    fn parse_sample_plan() {
        let plan = Plan::parse(SAMPLE).unwrap();
        assert_eq!(plan.units.len(), 2);
        assert_eq!(plan.units[0].location(), PathBuf::from("/workspace/api"));
        assert!(plan.units[0].activated);
        assert!(!plan.units[1].activated);
        assert_eq!(plan.steps.len(), 4);
        assert_eq!(plan.steps[0].targets(), vec!["api", "web"]);
        assert_eq!(plan.steps[2].expect, Some(ErrorKind::ActivatorError));
        assert_eq!(
            plan.steps[1].fault.as_ref().unwrap().to_fault(),
            Fault::Activator("bad config".to_owned())
        );
        assert_eq!(
            plan.engine.as_ref().unwrap().state_change_timeout_ms,
            Some(200)
        );
    }

    #[test]
    fn undeclared_project_rejected() {
        let err = Plan::parse(
            r#"
[[step]]
op = "install"
project = "ghost"
"#,
        )
        .unwrap_err();
        assert!(err.to_string().starts_with("plan error:"));
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn step_without_project_rejected() {
        let err = Plan::parse("[[step]]\nop = \"start\"\n").unwrap_err();
        assert!(err.to_string().contains("names no project"));
    }

    #[test]
    fn inject_requires_fault() {
        let err = Plan::parse(
            r#"
[[unit]]
project = "a"
name = "a"
version = "1"

[[step]]
op = "inject"
project = "a"
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("no fault"));
    }

    #[test]
    fn relative_path_rejected() {
        let err = Plan::parse(
            r#"
[[unit]]
project = "a"
name = "a"
version = "1"
path = "relative/a"
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("absolute"));
    }

    #[test]
    fn unknown_op_is_parse_error() {
        let err = Plan::parse("[[step]]\nop = \"explode\"\n").unwrap_err();
        assert!(matches!(err, PlanError::Parse(_)));
    }

    #[test]
    fn duplicate_declaration_rejected() {
        let err = Plan::parse(
            r#"
[[unit]]
project = "a"
name = "a"
version = "1"

[[unit]]
project = "a"
name = "b"
version = "1"
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("declared twice"));
    }
}
