//! Counter store: mutations, a getter, a watcher and a subscriber plugin

use larder::{Module, Store, StoreOptions};
use serde_json::{json, Value};
use tracing_subscriber::EnvFilter;

fn count_of(state: &Value) -> i64 {
    state["count"].as_i64().unwrap_or(0)
}

fn counter() -> Module {
    Module::new()
        .state(json!({ "count": 0, "history": [0] }))
        .mutation("increment", |state, payload| {
            let count = count_of(state) + payload.as_i64().unwrap_or(1);
            state["count"] = json!(count);
            if let Some(history) = state["history"].as_array_mut() {
                history.push(json!(count));
            }
        })
        .mutation("reset", |state, _| {
            state["count"] = json!(0);
            if let Some(history) = state["history"].as_array_mut() {
                history.push(json!(0));
            }
        })
        .getter("doubled", |ctx| json!(count_of(&ctx.state()) * 2))
        .getter("is_even", |ctx| json!(count_of(&ctx.state()) % 2 == 0))
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    println!("=== Counter ===\n");

    let options = StoreOptions::default().strict(true).plugin(|store: &Store| {
        store.subscribe(|mutation, state| {
            println!(
                "   [{}] payload: {}, count: {}",
                mutation.kind,
                mutation.payload,
                count_of(state)
            );
        });
    });
    let store = Store::with_options(counter(), options)?;

    let _watch = store.watch(
        |_, getters| getters.get("doubled").unwrap_or_default(),
        |new, old| println!("   doubled: {old} -> {new}"),
    );

    println!("1. Incrementing");
    store.commit("increment", Value::Null);
    store.commit("increment", json!(5));

    println!("\n2. Reading getters");
    let getters = store.getters();
    println!("   doubled = {}", getters.get("doubled").unwrap_or_default());
    println!("   is_even = {}", getters.get("is_even").unwrap_or_default());

    println!("\n3. Writing outside a mutation");
    match store.state_tree().set(&["count".to_string()], json!(100)) {
        Ok(()) => println!("   accepted (developer mode is off)"),
        Err(err) => println!("   rejected: {err}"),
    }

    println!("\n4. Resetting");
    store.commit("reset", Value::Null);
    println!("   history = {}", store.state()["history"]);

    Ok(())
}
