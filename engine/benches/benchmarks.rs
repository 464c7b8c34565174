//! Performance benchmarks for rebound-engine

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use rebound_engine::{
    plan_reorder, Change, ChangeEvent, CollectionStore, Entity, EntityId, ViewSnapshot,
};
use serde_json::{json, Value};

fn populated(n: usize) -> CollectionStore<Value> {
    CollectionStore::with_entities(
        (0..n)
            .map(|i| {
                Entity::new(format!("task_{}", i), json!({"title": format!("Task {}", i)}), 1000)
                    .with_position(i as i64)
            })
            .collect(),
    )
}

fn bench_store_operations(c: &mut Criterion) {
    let mut group = c.benchmark_group("store_operations");

    group.bench_function("apply_insert", |b| {
        let mut store: CollectionStore<Value> = CollectionStore::new();
        let mut id = 0u64;

        b.iter(|| {
            id += 1;
            let entity = Entity::new(format!("task_{}", id), json!({"title": "Task"}), 1000)
                .with_position(id as i64);
            store.apply(black_box(Change::Insert(entity)))
        })
    });

    group.bench_function("get_entity", |b| {
        let store = populated(1000);
        b.iter(|| store.get(black_box("task_500")))
    });

    group.bench_function("update_then_rollback", |b| {
        let mut store = populated(1000);
        let patch = json!({"title": "Edited"}).as_object().cloned().unwrap();

        b.iter(|| {
            let op = store
                .begin_update(black_box("task_500"), patch.clone(), 2000)
                .unwrap();
            store.rollback(op)
        })
    });

    group.bench_function("create_then_confirm", |b| {
        let mut store = populated(1000);
        let mut id = 0u64;

        b.iter(|| {
            id += 1;
            let op = store
                .begin_create(Entity::new(format!("local:{}", id), json!({"title": "New"}), 1000))
                .unwrap();
            store.confirm_create(
                op,
                Entity::new(format!("srv_{}", id), json!({"title": "New"}), 1001),
            )
        })
    });

    group.finish();
}

fn bench_merge(c: &mut Criterion) {
    let mut group = c.benchmark_group("merge");

    for pending in [0usize, 10, 100] {
        group.bench_with_input(
            BenchmarkId::new("update_event", pending),
            &pending,
            |b, &pending| {
                let mut store = populated(1000);
                let patch = json!({"done": true}).as_object().cloned().unwrap();
                for i in 0..pending {
                    let _ = store.begin_update(&format!("task_{}", i), patch.clone(), 2000);
                }
                let event = ChangeEvent::Update {
                    entity: Entity::new("task_999", json!({"title": "Remote"}), 3000)
                        .with_position(999),
                };

                b.iter(|| store.merge(black_box(event.clone())))
            },
        );
    }

    group.finish();
}

fn bench_reorder(c: &mut Criterion) {
    let mut group = c.benchmark_group("reorder");

    for size in [10usize, 100, 1000] {
        group.bench_with_input(BenchmarkId::new("plan_reverse", size), &size, |b, &size| {
            let store = populated(size);
            let order: Vec<EntityId> = store.ids().into_iter().rev().collect();

            b.iter(|| plan_reorder(&store, black_box(&order)))
        });

        group.bench_with_input(
            BenchmarkId::new("apply_and_rollback", size),
            &size,
            |b, &size| {
                let mut store = populated(size);
                let order: Vec<EntityId> = store.ids().into_iter().rev().collect();

                b.iter(|| {
                    let plan = plan_reorder(&store, &order).unwrap();
                    if let Some(op) = store.begin_reorder(plan) {
                        store.rollback(op);
                    }
                })
            },
        );
    }

    group.finish();
}

fn bench_snapshot(c: &mut Criterion) {
    let mut group = c.benchmark_group("snapshot");

    for size in [100usize, 1000] {
        group.bench_with_input(BenchmarkId::new("capture", size), &size, |b, &size| {
            let store = populated(size);
            b.iter(|| ViewSnapshot::capture(black_box(&store), None))
        });

        group.bench_with_input(BenchmarkId::new("hydrate", size), &size, |b, &size| {
            let rows = populated(size).entities().to_vec();
            b.iter(|| CollectionStore::with_entities(black_box(rows.clone())))
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_store_operations,
    bench_merge,
    bench_reorder,
    bench_snapshot,
);
criterion_main!(benches);
