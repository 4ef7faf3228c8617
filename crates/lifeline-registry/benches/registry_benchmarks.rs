use criterion::{criterion_group, criterion_main, Criterion};
use lifeline_model::{ProjectId, UnitDescriptor, UnitId};
use lifeline_registry::Registry;

fn populated(count: u64) -> (Registry, Vec<ProjectId>) {
    let reg = Registry::new();
    let mut projects = Vec::new();
    for i in 0..count {
        let project = ProjectId::new(format!("project-{i}"));
        reg.register(&project, Some(UnitId::new(i)), true).unwrap();
        // Every tenth project collides with its neighbour.
        let name = format!("unit.{}", i - i % 10 / 9);
        reg.set_descriptor(&project, UnitDescriptor::new(name, "1.0.0"))
            .unwrap();
        projects.push(project);
    }
    (reg, projects)
}

fn bench_lookup(c: &mut Criterion) {
    let (reg, _) = populated(1_000);
    c.bench_function("registry_lookup_by_unit_id_1000", |b| {
        b.iter(|| {
            for i in 0..1_000 {
                let _ = reg.lookup_by_unit_id(UnitId::new(i));
            }
        });
    });
}

fn bench_find_duplicates(c: &mut Criterion) {
    let (reg, projects) = populated(1_000);
    c.bench_function("registry_find_duplicates_1000", |b| {
        b.iter(|| reg.find_duplicates(&projects, &projects));
    });
}

criterion_group!(benches, bench_lookup, bench_find_duplicates);
criterion_main!(benches);
