use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use std::hint::black_box;

use larder::{Module, Store};
use serde_json::{json, Value};

fn counter() -> Module {
    Module::new()
        .state(json!({ "count": 0 }))
        .mutation("increment", |state, _| {
            state["count"] = json!(state["count"].as_i64().unwrap_or(0) + 1);
        })
        .getter("doubled", |ctx| {
            json!(ctx.state()["count"].as_i64().unwrap_or(0) * 2)
        })
        .action_sync("increment_later", |ctx, _| {
            ctx.commit("increment", Value::Null);
            Ok(Value::Null)
        })
}

fn store_creation_benchmark(c: &mut Criterion) {
    c.bench_function("store_creation", |b| {
        b.iter(|| black_box(Store::new(counter()).unwrap()));
    });
}

fn commit_benchmark(c: &mut Criterion) {
    let store = Store::new(counter()).unwrap();

    c.bench_function("commit", |b| {
        b.iter(|| store.commit(black_box("increment"), Value::Null));
    });
}

fn cached_getter_benchmark(c: &mut Criterion) {
    let store = Store::new(counter()).unwrap();
    let getters = store.getters();

    c.bench_function("cached_getter_read", |b| {
        b.iter(|| black_box(getters.get("doubled")));
    });
}

fn dispatch_benchmark(c: &mut Criterion) {
    let store = Store::new(counter()).unwrap();

    c.bench_function("dispatch", |b| {
        b.iter(|| {
            futures::executor::block_on(store.dispatch(black_box("increment_later"), Value::Null))
                .unwrap()
        });
    });
}

fn namespaced_commit_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("namespaced_commit");

    for depth in [1, 4, 16].iter() {
        let mut module = counter().namespaced(true);
        for _ in 1..*depth {
            module = Module::new().namespaced(true).module("m", module);
        }
        let store = Store::new(Module::new().module("m", module)).unwrap();
        let kind = format!("{}increment", "m/".repeat(*depth));

        group.bench_with_input(BenchmarkId::from_parameter(depth), depth, |b, _| {
            b.iter(|| store.commit(black_box(&kind), Value::Null));
        });
    }
    group.finish();
}

fn store_subscribe_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("store_subscribe");

    for subscriber_count in [1, 10, 100].iter() {
        let store = Store::new(counter()).unwrap();

        for _ in 0..*subscriber_count {
            store.subscribe(|_, _| {
                // Empty subscriber
            });
        }

        group.bench_with_input(
            BenchmarkId::from_parameter(subscriber_count),
            subscriber_count,
            |b, _| {
                b.iter(|| store.commit("increment", black_box(Value::Null)));
            },
        );
    }
    group.finish();
}

criterion_group!(
    benches,
    store_creation_benchmark,
    commit_benchmark,
    cached_getter_benchmark,
    dispatch_benchmark,
    namespaced_commit_benchmark,
    store_subscribe_benchmark,
);
criterion_main!(benches);
