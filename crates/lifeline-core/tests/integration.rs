use lifeline_core::{Engine, EngineConfig, ErrorKind, EventRecorder, InstallMode, TransitionOutcome};
use lifeline_model::{ProjectId, Transition, TransitionError, UnitDescriptor, UnitState};
use lifeline_wiring::{
    Fault, MockWiringEngine, Op, RecordingFilter, StartOptions, StateCode,
    StaticLocationResolver, WiringEngine,
};
use std::fs;
use std::sync::Arc;

fn p(s: &str) -> ProjectId {
    ProjectId::new(s)
}

fn setup(
    config: EngineConfig,
    units: &[(&str, &str, &str, &[&str])],
) -> (Engine, Arc<MockWiringEngine>, EventRecorder) {
    let locations = Arc::new(StaticLocationResolver::new());
    let mock = Arc::new(MockWiringEngine::new());
    for (project, name, version, requires) in units {
        let path = format!("/workspace/{project}");
        locations.insert(p(project), &path);
        mock.provide_with_requires(&path, name, version, requires);
    }
    let engine = Engine::new(locations, config)
        .unwrap()
        .with_wiring(mock.clone())
        .with_duplicate_filter(Arc::new(RecordingFilter::new()));
    let events = EventRecorder::new();
    engine.on_transition(events.listener());
    (engine, mock, events)
}

// register -> install -> resolve -> update rejected as duplicate
#[test]
fn install_resolve_update_duplicate_scenario() {
    let (engine, mock, events) = setup(EngineConfig::default(), &[("billing", "billing", "2.1", &[])]);

    engine.register_unit(&p("billing"), None, false).unwrap();
    let node = engine.node(&p("billing")).unwrap();
    assert_eq!(node.current_state, UnitState::StateLess);

    let h1 = engine.install(&p("billing")).unwrap();
    let node = engine.node(&p("billing")).unwrap();
    assert_eq!(node.unit_id, Some(h1.id));
    assert_eq!(node.current_state, UnitState::Installed);
    assert_eq!(node.transition_error, TransitionError::NoError);

    let report = engine.resolve(&[h1.id]).unwrap();
    assert!(report.is_complete());
    assert_eq!(engine.node(&p("billing")).unwrap().current_state, UnitState::Resolved);

    mock.fail(h1.id, Op::Update, Fault::Duplicate);
    events.clear();
    let err = engine.update(h1.id).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DuplicateUnit);

    let node = engine.node(&p("billing")).unwrap();
    assert_eq!(node.current_state, UnitState::Resolved);
    assert_eq!(node.transition_error, TransitionError::Duplicate);
    assert_eq!(node.last_transition, Transition::Update);

    let delivered = events.events();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].transition, Transition::Update);
    assert_eq!(
        delivered[0].outcome,
        TransitionOutcome::RolledBack {
            error: TransitionError::Duplicate
        }
    );
}

#[test]
fn update_to_colliding_descriptor_keeps_state() {
    let (engine, mock, _) = setup(
        EngineConfig::default(),
        &[("a", "shared", "1", &[]), ("b", "other", "1", &[])],
    );
    let a = engine.install(&p("a")).unwrap().id;
    let b = engine.install(&p("b")).unwrap().id;
    engine.resolve(&[a, b]).unwrap();

    mock.stage_update(b, UnitDescriptor::new("shared", "1"));
    let err = engine.update(b).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DuplicateUnit);
    let node = engine.node(&p("b")).unwrap();
    assert_eq!(node.current_state, UnitState::Resolved);
    assert_eq!(node.name(), Some("other"));
}

#[test]
fn successful_update_refreshes_descriptor() {
    let (engine, mock, _) = setup(EngineConfig::default(), &[("a", "a", "1", &[])]);
    let a = engine.install(&p("a")).unwrap().id;
    engine.resolve(&[a]).unwrap();
    mock.stage_update(a, UnitDescriptor::new("a", "2"));
    engine.update(a).unwrap();
    let node = engine.node(&p("a")).unwrap();
    assert_eq!(node.current_state, UnitState::Installed);
    assert_eq!(node.key().as_deref(), Some("a2"));
    assert_eq!(engine.current_unit(), None);
}

#[test]
fn by_value_install_streams_project_content() {
    let dir = tempfile::tempdir().unwrap();
    let artifact = dir.path().join("ledger.unit");
    fs::write(&artifact, b"unit payload").unwrap();

    let locations = Arc::new(StaticLocationResolver::new());
    locations.insert(p("ledger"), &artifact);
    let mock = Arc::new(MockWiringEngine::new());
    mock.provide(&artifact, "ledger", "1.0");
    let engine = Engine::new(
        locations,
        EngineConfig {
            install_mode: InstallMode::ByValue,
            ..EngineConfig::default()
        },
    )
    .unwrap()
    .with_wiring(mock.clone());

    engine.install(&p("ledger")).unwrap();
    let calls = mock.calls();
    assert_eq!(calls.len(), 1);
    assert!(calls[0].starts_with("install file:"), "{}", calls[0]);
}

#[test]
fn by_value_install_of_missing_file_rolls_back() {
    let dir = tempfile::tempdir().unwrap();
    let locations = Arc::new(StaticLocationResolver::new());
    locations.insert(p("gone"), dir.path().join("missing.unit"));
    let engine = Engine::new(
        locations,
        EngineConfig {
            install_mode: InstallMode::ByValue,
            ..EngineConfig::default()
        },
    )
    .unwrap()
    .with_wiring(Arc::new(MockWiringEngine::new()));

    let err = engine.install(&p("gone")).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Exception);
    let node = engine.node(&p("gone")).unwrap();
    assert_eq!(node.current_state, UnitState::StateLess);
    assert_eq!(node.transition_error, TransitionError::Exception);
}

#[test]
fn uninstall_then_refresh_purges_dependents() {
    let (engine, _mock, events) = setup(
        EngineConfig::default(),
        &[("api", "api", "1", &[]), ("web", "web", "1", &["api"])],
    );
    let api = engine.install(&p("api")).unwrap().id;
    let web = engine.install(&p("web")).unwrap().id;
    engine.start(api, StartOptions::default(), None).unwrap();
    engine.start(web, StartOptions::default(), None).unwrap();

    engine.uninstall(api, false).unwrap();
    let node = engine.node(&p("api")).unwrap();
    assert_eq!(node.current_state, UnitState::Uninstalled);
    assert_eq!(node.unit_id, None);
    assert!(engine.node_of_unit(api).is_none());

    assert_eq!(engine.removal_pending().unwrap(), vec![api]);
    let closure = engine.dependency_closure(&[api]).unwrap();
    assert!(closure.contains(&web));

    events.clear();
    let report = engine.refresh(&[]).unwrap();
    assert!(report.refreshed.contains(&api));
    assert!(report.refreshed.contains(&web));
    assert_eq!(engine.node(&p("web")).unwrap().current_state, UnitState::Installed);
    let api_node = engine.node(&p("api")).unwrap();
    assert_eq!(api_node.current_state, UnitState::Uninstalled);
    assert_eq!(api_node.unit_id, None);
    assert_eq!(events.count(Transition::Refresh), 1);
    assert!(engine.removal_pending().unwrap().is_empty());
}

#[test]
fn uninstall_can_unregister() {
    let (engine, _, events) = setup(EngineConfig::default(), &[("a", "a", "1", &[])]);
    let a = engine.install(&p("a")).unwrap().id;
    engine.uninstall(a, true).unwrap();
    assert!(engine.node(&p("a")).is_none());
    let event = events.last().unwrap();
    assert_eq!(event.transition, Transition::Uninstall);
    assert_eq!(event.project, Some(p("a")));
    assert_eq!(event.state, UnitState::Uninstalled);
}

#[test]
fn uninstall_of_unowned_unit_still_reaches_engine() {
    let (engine, mock, events) = setup(EngineConfig::default(), &[("a", "a", "1", &[])]);
    let stray = mock.install("file:/workspace/a", None).unwrap().id;
    let err = engine.uninstall(stray, false).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UnitUnregistered);
    assert_eq!(
        mock.state(stray).unwrap(),
        lifeline_wiring::StateCode::Uninstalled
    );
    let event = events.last().unwrap();
    assert_eq!(event.project, None);
    assert_eq!(event.unit, Some(stray));
}

#[test]
fn reinstall_after_uninstall() {
    let (engine, _, _) = setup(EngineConfig::default(), &[("a", "a", "1", &[])]);
    let first = engine.install(&p("a")).unwrap().id;
    engine.uninstall(first, false).unwrap();
    let second = engine.install(&p("a")).unwrap().id;
    assert_ne!(first, second);
    let node = engine.node(&p("a")).unwrap();
    assert_eq!(node.unit_id, Some(second));
    assert_eq!(node.current_state, UnitState::Installed);
}

#[test]
fn external_duplicates_ignore_own_unit_when_disjoint() {
    let (engine, mock, _) = setup(
        EngineConfig::default(),
        &[("a", "shared", "1", &[]), ("foreign", "shared", "2", &[])],
    );
    engine.install(&p("a")).unwrap();
    assert!(engine
        .find_external_duplicates(&[p("a")], true)
        .unwrap()
        .is_empty());

    let foreign = mock.install("file:/workspace/foreign", None).unwrap().id;
    let dups = engine.find_external_duplicates(&[p("a")], true).unwrap();
    assert_eq!(dups.get(&p("a")).map(|u| u.id), Some(foreign));
}

#[test]
fn declared_duplicates_are_found() {
    let (engine, _, _) = setup(EngineConfig::default(), &[]);
    for project in ["a", "b"] {
        engine.register_unit(&p(project), None, true).unwrap();
        engine
            .declare_descriptor(&p(project), UnitDescriptor::new("x", "1"))
            .unwrap();
    }
    let dups = engine.find_duplicates(&[p("a"), p("b")], &[]);
    assert_eq!(dups.len(), 1);
}

#[test]
fn activate_on_register_applies_to_implicit_registration() {
    let (engine, _, _) = setup(
        EngineConfig {
            activate_on_register: true,
            ..EngineConfig::default()
        },
        &[("a", "a", "1", &[])],
    );
    engine.install(&p("a")).unwrap();
    assert!(engine.registry().is_activated(&p("a")));
}

#[test]
fn events_serialize_to_json() {
    let (engine, _, events) = setup(EngineConfig::default(), &[("a", "a", "1", &[])]);
    engine.install(&p("a")).unwrap();
    let json = serde_json::to_value(events.last().unwrap()).unwrap();
    assert_eq!(json["transition"], "install");
    assert_eq!(json["outcome"]["result"], "committed");
    assert_eq!(json["state"], "installed");
}

#[test]
fn external_state_change_is_recorded() {
    let (engine, mock, events) = setup(EngineConfig::default(), &[("api", "api", "1", &[])]);
    let id = engine.install(&p("api")).unwrap().id;

    mock.force_state(id, StateCode::Active);
    let node = engine.record_external(&p("api"), id).unwrap();
    assert_eq!(node.current_state, UnitState::Active);
    assert_eq!(node.last_transition, Transition::External);
    let event = events.last().unwrap();
    assert_eq!(event.transition, Transition::External);
    assert!(event.outcome.is_committed());

    // A deactivated project is still reported as installed.
    engine.set_activated(&p("api"), false).unwrap();
    assert_eq!(engine.reported_state(&p("api")), Some(UnitState::Installed));
    assert_eq!(events.last().unwrap().state, UnitState::Installed);
}
