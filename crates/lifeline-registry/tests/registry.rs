use lifeline_model::{ProjectId, Transition, UnitDescriptor, UnitId};
use lifeline_registry::Registry;
use proptest::prelude::*;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

/// Registry operations driven by the property test below.
#[derive(Debug, Clone)]
enum Op {
    Register {
        project: u8,
        unit: Option<u64>,
        activated: bool,
    },
    Unregister(u8),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        2 => (0u8..12, proptest::option::of(0u64..20), any::<bool>()).prop_map(
            |(project, unit, activated)| Op::Register {
                project,
                unit,
                activated,
            }
        ),
        1 => (0u8..12).prop_map(Op::Unregister),
    ]
}

fn project(n: u8) -> ProjectId {
    ProjectId::new(format!("p{n}"))
}

proptest! {
    #[test]
    fn one_node_per_project_across_register_unregister_sequences(
        ops in prop::collection::vec(op_strategy(), 1..200)
    ) {
        let reg = Registry::new();
        let mut model: HashMap<ProjectId, Option<UnitId>> = HashMap::new();

        for op in &ops {
            match *op {
                Op::Register { project: n, unit, activated } => {
                    let unit = unit.map(UnitId::new);
                    reg.register(&project(n), unit, activated).unwrap();
                    if let Some(id) = unit {
                        // A reused id is taken away from whichever project held it.
                        for held in model.values_mut() {
                            if *held == Some(id) {
                                *held = None;
                            }
                        }
                    }
                    model.insert(project(n), unit);
                }
                Op::Unregister(n) => {
                    let removed = reg.unregister(&project(n));
                    prop_assert_eq!(removed, model.remove(&project(n)).flatten());
                }
            }

            prop_assert_eq!(reg.len(), model.len());
            for node in reg.nodes() {
                prop_assert_eq!(model.get(&node.project), Some(&node.unit_id));
                prop_assert_eq!(node.unit_id.is_some(), node.current_state.is_installed());
            }
            for raw in 0..20 {
                let id = UnitId::new(raw);
                if let Some(node) = reg.lookup_by_unit_id(id) {
                    prop_assert_eq!(node.unit_id, Some(id));
                }
            }
        }
    }
}

#[test]
fn indexes_agree_for_every_node() {
    let reg = Registry::new();
    for i in 0..50_u64 {
        let project = ProjectId::new(format!("proj-{i}"));
        reg.register(&project, Some(UnitId::new(i)), i % 2 == 0)
            .unwrap();
        reg.set_descriptor(&project, UnitDescriptor::new(format!("unit.{i}"), "1.0.0"))
            .unwrap();
    }

    for node in reg.nodes() {
        let by_id = reg.lookup_by_unit_id(node.unit_id.unwrap()).unwrap();
        assert_eq!(by_id, node);
        let d = node.descriptor.clone().unwrap();
        let by_key = reg.lookup_by_key(&d.name, &d.version).unwrap();
        assert_eq!(by_key, node);
    }
}

#[test]
fn concurrent_readers_during_writes() {
    let reg = Arc::new(Registry::new());
    let done = Arc::new(AtomicBool::new(false));

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let reg = Arc::clone(&reg);
            let done = Arc::clone(&done);
            thread::spawn(move || {
                let mut seen = 0_usize;
                while !done.load(Ordering::SeqCst) {
                    for node in reg.nodes() {
                        if let Some(id) = node.unit_id {
                            if let Some(found) = reg.lookup_by_unit_id(id) {
                                assert_eq!(found.unit_id, Some(id));
                            }
                        }
                        seen += 1;
                    }
                }
                seen
            })
        })
        .collect();

    for round in 0..200_u64 {
        let project = ProjectId::new(format!("w{}", round % 10));
        reg.register(&project, Some(UnitId::new(round)), true)
            .unwrap();
        reg.add_pending(&project, Transition::Update).unwrap();
        if round % 3 == 0 {
            reg.unregister(&project);
        }
    }
    done.store(true, Ordering::SeqCst);

    for reader in readers {
        reader.join().unwrap();
    }
}
