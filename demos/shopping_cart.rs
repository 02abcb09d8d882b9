//! Shopping cart: namespaced modules, async actions and dynamic registration

use std::time::Duration;

use futures::FutureExt;
use larder::{ActionError, ActionSubscriber, Module, Store};
use serde_json::{json, Value};
use tracing_subscriber::EnvFilter;

fn products() -> Module {
    Module::new()
        .namespaced(true)
        .state(json!({ "all": [
            { "id": 1, "title": "Kettle", "price": 30, "inventory": 2 },
            { "id": 2, "title": "Teapot", "price": 45, "inventory": 0 },
        ] }))
        .mutation("decrement_inventory", |state, id| {
            if let Some(all) = state["all"].as_array_mut() {
                for product in all.iter_mut().filter(|p| &p["id"] == id) {
                    let left = product["inventory"].as_i64().unwrap_or(0) - 1;
                    product["inventory"] = json!(left);
                }
            }
        })
}

fn cart() -> Module {
    Module::new()
        .namespaced(true)
        .state_fn(|| json!({ "items": [], "status": null }))
        .mutation("push_item", |state, id| {
            if let Some(items) = state["items"].as_array_mut() {
                items.push(id.clone());
            }
        })
        .mutation("set_status", |state, status| state["status"] = status.clone())
        .getter("count", |ctx| {
            json!(ctx.state()["items"].as_array().map_or(0, Vec::len))
        })
        .action("add", |ctx, id| {
            async move {
                let in_stock = ctx.root_state()["products"]["all"]
                    .as_array()
                    .and_then(|all| all.iter().find(|p| p["id"] == id))
                    .and_then(|p| p["inventory"].as_i64())
                    .unwrap_or(0)
                    > 0;
                if !in_stock {
                    return Err(ActionError::msg(format!("product {id} is out of stock")));
                }
                ctx.commit("push_item", id.clone());
                ctx.dispatch("reserve", id).await
            }
            .boxed()
        })
        .action("reserve", |ctx, id| {
            async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                ctx.store().commit("products/decrement_inventory", id);
                Ok(Value::Null)
            }
            .boxed()
        })
        .action_sync("checkout", |ctx, _| {
            ctx.commit("set_status", json!("successful"));
            Ok(ctx.getters().get("count").unwrap_or_default())
        })
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    println!("=== Shopping Cart ===\n");

    let store = Store::new(Module::new().module("products", products()))?;
    store.subscribe_action(
        ActionSubscriber::new()
            .on_before(|action, _| println!("   -> {} {}", action.kind, action.payload))
            .on_error(|action, _, err| println!("   !! {} failed: {err}", action.kind)),
    );

    println!("1. Registering the cart module");
    store.register_module("cart", cart())?;
    println!("   has cart: {}", store.has_module("cart"));

    println!("\n2. Adding products");
    store.dispatch("cart/add", json!(1)).await?;
    if let Err(err) = store.dispatch("cart/add", json!(2)).await {
        println!("   could not add: {err}");
    }
    println!("   items = {}", store.state()["cart"]["items"]);
    println!("   inventory = {}", store.state()["products"]["all"][0]["inventory"]);

    println!("\n3. Checking out");
    let count = store.dispatch("cart/checkout", Value::Null).await?;
    println!("   {} item(s), status {}", count, store.state()["cart"]["status"]);

    println!("\n4. Unregistering the cart module");
    store.unregister_module("cart")?;
    println!("   has cart: {}", store.has_module("cart"));
    println!("   state = {}", store.state());

    Ok(())
}
