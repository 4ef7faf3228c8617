use super::{colorize_error, colorize_state, json_pretty, EXIT_FAILURE, EXIT_SUCCESS};
use crate::plan::{Plan, Step, StepOp, UnitSpec};
use lifeline_core::{
    shutdown_requested, CoreError, Engine, EngineConfig, ErrorKind, EventRecorder,
    TransitionEvent, TransitionOutcome,
};
use lifeline_model::{
    ProjectId, Transition, TransitionError, UnitDescriptor, UnitId, UnitNode, UnitState,
};
use lifeline_wiring::{MockWiringEngine, RecordingFilter, StartOptions, StaticLocationResolver};
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Serialize)]
pub struct StepReport {
    pub index: usize,
    pub op: &'static str,
    pub projects: Vec<String>,
    /// The step behaved as the plan expected.
    pub passed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<ErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected: Option<ErrorKind>,
    pub events: Vec<TransitionEvent>,
}

/// A registry node as shown to users. `state` is the reported state, so a
/// deactivated unit never shows beyond installed.
#[derive(Debug, Serialize)]
pub struct NodeReport {
    pub project: ProjectId,
    pub unit_id: Option<UnitId>,
    pub activated: bool,
    pub state: UnitState,
    pub last_transition: Transition,
    pub transition_error: TransitionError,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub descriptor: Option<UnitDescriptor>,
}

impl From<UnitNode> for NodeReport {
    fn from(node: UnitNode) -> Self {
        Self {
            state: node.reported_state(),
            project: node.project,
            unit_id: node.unit_id,
            activated: node.activated,
            last_transition: node.last_transition,
            transition_error: node.transition_error,
            descriptor: node.descriptor,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct SessionReport {
    pub steps: Vec<StepReport>,
    pub nodes: Vec<NodeReport>,
    pub interrupted: bool,
}

impl SessionReport {
    pub fn passed(&self) -> bool {
        !self.interrupted && self.steps.iter().all(|step| step.passed)
    }
}

/// A simulated workspace: the plan's units provided by an in-memory wiring
/// engine, all registered with a fresh lifecycle engine.
struct Session {
    engine: Engine,
    mock: Arc<MockWiringEngine>,
    events: EventRecorder,
    units: HashMap<String, UnitSpec>,
}

impl Session {
    fn new(plan: &Plan, config: EngineConfig) -> Result<Self, String> {
        let locations = Arc::new(StaticLocationResolver::new());
        let mock = Arc::new(MockWiringEngine::new());
        for unit in &plan.units {
            let path = unit.location();
            locations.insert(ProjectId::new(&unit.project), &path);
            let requires: Vec<&str> = unit.requires.iter().map(String::as_str).collect();
            mock.provide_with_requires(&path, &unit.name, &unit.version, &requires);
        }

        let engine = Engine::new(locations, config)
            .map_err(|e| e.to_string())?
            .with_wiring(mock.clone())
            .with_duplicate_filter(Arc::new(RecordingFilter::new()));
        let events = EventRecorder::new();
        engine.on_transition(events.listener());

        for unit in &plan.units {
            let project = ProjectId::new(&unit.project);
            engine
                .register_unit(&project, None, unit.activated)
                .and_then(|_| {
                    engine.declare_descriptor(
                        &project,
                        UnitDescriptor::new(&unit.name, &unit.version),
                    )
                })
                .map_err(|e| e.to_string())?;
        }

        Ok(Self {
            engine,
            mock,
            events,
            units: plan
                .units
                .iter()
                .map(|unit| (unit.project.clone(), unit.clone()))
                .collect(),
        })
    }

    fn unit_ids(&self, projects: &[ProjectId]) -> Result<Vec<UnitId>, CoreError> {
        projects
            .iter()
            .map(|project| {
                self.engine
                    .node(project)
                    .and_then(|node| node.unit_id)
                    .ok_or_else(|| {
                        CoreError::InvalidArgument(format!("project '{project}' has no installed unit"))
                    })
            })
            .collect()
    }

    fn execute(&self, step: &Step) -> Result<Option<String>, CoreError> {
        let projects: Vec<ProjectId> = step.targets().into_iter().map(ProjectId::new).collect();
        let timeout = step.timeout_ms.map(Duration::from_millis);

        match step.op {
            StepOp::Install => {
                let mut installed = Vec::new();
                for project in &projects {
                    installed.push(self.engine.install(project)?.id.to_string());
                }
                Ok(Some(format!("installed as {}", installed.join(", "))))
            }
            StepOp::Resolve => {
                let report = self.engine.resolve(&self.unit_ids(&projects)?)?;
                Ok(Some(format!(
                    "{} resolved, {} unresolved",
                    report.resolved.len(),
                    report.unresolved.len()
                )))
            }
            StepOp::Refresh => {
                let report = self.engine.refresh(&self.unit_ids(&projects)?)?;
                Ok(Some(format!(
                    "{} refreshed, {} failed",
                    report.refreshed.len(),
                    report.failed.len()
                )))
            }
            StepOp::Start => {
                let options = StartOptions {
                    transient: step.transient,
                    activation_policy: false,
                };
                for unit in self.unit_ids(&projects)? {
                    self.engine.start(unit, options, timeout)?;
                }
                Ok(None)
            }
            StepOp::Stop => {
                for unit in self.unit_ids(&projects)? {
                    self.engine.stop(unit, step.transient, timeout)?;
                }
                Ok(None)
            }
            StepOp::Update => {
                for unit in self.unit_ids(&projects)? {
                    self.engine.update(unit)?;
                }
                Ok(None)
            }
            StepOp::Uninstall => {
                for unit in self.unit_ids(&projects)? {
                    self.engine.uninstall(unit, step.unregister)?;
                }
                Ok(None)
            }
            StepOp::Unregister => {
                let mut removed = 0;
                for project in &projects {
                    if self.engine.registry().contains(project) {
                        self.engine.unregister_unit(project);
                        removed += 1;
                    }
                }
                Ok(Some(format!("{removed} project(s) unregistered")))
            }
            StepOp::Activate | StepOp::Deactivate => {
                for project in &projects {
                    self.engine
                        .set_activated(project, step.op == StepOp::Activate)?;
                }
                Ok(None)
            }
            StepOp::Inject => {
                let Some(spec) = &step.fault else {
                    return Err(CoreError::InvalidArgument("inject step has no fault".to_owned()));
                };
                for unit in self.unit_ids(&projects)? {
                    self.mock.fail(unit, spec.on.into(), spec.to_fault());
                }
                Ok(None)
            }
            StepOp::ClearFaults => {
                self.mock.clear_faults();
                Ok(None)
            }
            StepOp::StageUpdate => {
                let version = step.version.as_deref().unwrap_or_default();
                for project in &projects {
                    let unit = self.unit_ids(std::slice::from_ref(project))?[0];
                    let name = self
                        .units
                        .get(project.as_str())
                        .map_or(project.as_str(), |spec| spec.name.as_str());
                    self.mock
                        .stage_update(unit, UnitDescriptor::new(name, version));
                }
                Ok(None)
            }
            StepOp::Release => {
                self.mock.release_hangs();
                Ok(None)
            }
            StepOp::ClearMarker => Ok(self
                .engine
                .clear_current_unit()
                .map(|unit| format!("cleared marker of {unit}"))),
        }
    }
}

/// Replay every step of `plan` and collect what happened.
pub fn execute_plan(plan: &Plan, config: EngineConfig) -> Result<SessionReport, String> {
    let session = Session::new(plan, config)?;
    let mut steps = Vec::with_capacity(plan.steps.len());
    let mut interrupted = false;

    for (index, step) in plan.steps.iter().enumerate() {
        if shutdown_requested() {
            interrupted = true;
            break;
        }
        debug!("step {}: {}", index + 1, step.op.as_str());
        session.events.clear();
        let outcome = session.execute(step);
        let passed = match (&outcome, step.expect) {
            (Ok(_), None) => true,
            (Err(e), Some(kind)) => e.kind() == kind,
            _ => false,
        };
        let (detail, error, kind) = match outcome {
            Ok(detail) => (detail, None, None),
            Err(e) => (None, Some(e.to_string()), Some(e.kind())),
        };
        steps.push(StepReport {
            index: index + 1,
            op: step.op.as_str(),
            projects: step.targets(),
            passed,
            detail,
            error,
            kind,
            expected: step.expect,
            events: session.events.events(),
        });
    }

    Ok(SessionReport {
        steps,
        nodes: session
            .engine
            .nodes()
            .into_iter()
            .map(NodeReport::from)
            .collect(),
        interrupted,
    })
}

pub fn run(plan_path: &Path, config_path: Option<&Path>, json: bool) -> Result<u8, String> {
    let plan = Plan::load(plan_path).map_err(|e| e.to_string())?;
    let config = match (&plan.engine, config_path) {
        (Some(config), _) => config.clone(),
        (None, Some(path)) => EngineConfig::load(path).map_err(|e| e.to_string())?,
        (None, None) => EngineConfig::load_default().map_err(|e| e.to_string())?,
    };

    let report = execute_plan(&plan, config)?;
    if json {
        println!("{}", json_pretty(&report)?);
    } else {
        print_report(&report);
    }
    Ok(if report.passed() {
        EXIT_SUCCESS
    } else {
        EXIT_FAILURE
    })
}

fn print_report(report: &SessionReport) {
    use console::Style;

    for step in &report.steps {
        let mark = if step.passed {
            Style::new().green().apply_to("✓")
        } else {
            Style::new().red().apply_to("✗")
        };
        let targets = if step.projects.is_empty() {
            String::new()
        } else {
            format!(" {}", step.projects.join(", "))
        };
        match (&step.error, &step.detail) {
            (Some(error), _) => println!("{mark} {}{targets}: {error}", step.op),
            (None, Some(detail)) => println!("{mark} {}{targets}: {detail}", step.op),
            (None, None) => println!("{mark} {}{targets}", step.op),
        }
        if !step.passed {
            match step.expected {
                Some(kind) => println!("    expected failure: {kind}"),
                None => println!("    expected success"),
            }
        }
        for event in &step.events {
            let subject = event.project.as_ref().map_or_else(
                || event.unit.map_or_else(|| "-".to_owned(), |u| u.to_string()),
                ToString::to_string,
            );
            let outcome = match event.outcome {
                TransitionOutcome::Committed => "committed".to_owned(),
                TransitionOutcome::RolledBack { error } => {
                    format!("rolled back ({})", colorize_error(error))
                }
            };
            println!(
                "    #{} {} {subject} {outcome} -> {}",
                event.seq,
                event.transition,
                colorize_state(event.state)
            );
        }
    }
    if report.interrupted {
        println!("session interrupted");
    }

    println!();
    if report.nodes.is_empty() {
        println!("no projects registered");
        return;
    }
    println!(
        "{:<16} {:<8} {:<12} {:<12} ERROR",
        "PROJECT", "UNIT", "STATE", "LAST"
    );
    for node in &report.nodes {
        let unit = node.unit_id.map_or_else(|| "-".to_owned(), |u| u.to_string());
        println!(
            "{:<16} {:<8} {:<12} {:<12} {}",
            node.project,
            unit,
            colorize_state(node.state),
            node.last_transition,
            colorize_error(node.transition_error)
        );
    }
}
