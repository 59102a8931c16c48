//! # Products Service
//!
//! The standard CRUD actions over the `products` collection plus two stock
//! adjustments:
//!
//! | Action | REST | Params |
//! |--------|------|--------|
//! | `products.increaseQuantity` | `PUT /:id/quantity/increase` | `id: string`, `value: positive integer` |
//! | `products.decreaseQuantity` | `PUT /:id/quantity/decrease` | `id: string`, `value: positive integer` |
//!
//! Stock never goes below zero: a decrease larger than the current quantity
//! fails validation on `value` and leaves the product untouched. Every change
//! evicts the `products.*` cache entries.
//!
//! ```rust
//! use service_framework::cache::MemoryCacher;
//! use service_framework::store::MemoryStore;
//! use std::sync::Arc;
//! use storefront::products::{products_service, ProductsSettings};
//!
//! #[tokio::main]
//! async fn main() {
//!     let (store, client) = MemoryStore::new("products", 10);
//!     tokio::spawn(store.run());
//!
//!     let products = products_service(Arc::new(client), Arc::new(MemoryCacher::new()), &ProductsSettings::default());
//!     assert!(products.schema.action_names().contains(&"products.decreaseQuantity"));
//! }
//! ```

use crate::model::{seed_products, PRODUCT_FIELDS};
use serde_json::{json, Value};
use service_framework::action::{handler_fn, ActionDescriptor};
use service_framework::cache::Cacher;
use service_framework::db::{DbService, DbServiceBuilder};
use service_framework::store::{EntityStore, StoreAdapter};
use service_framework::validator::{ParamRule, ParamSchema, Params};
use service_framework::ServiceError;
use std::sync::Arc;
use tracing::debug;

pub const SERVICE: &str = "products";

#[derive(Debug, Clone)]
pub struct ProductsSettings {
    /// Seed the collection when it is empty at start.
    pub seed: bool,
    pub node_id: String,
}

impl Default for ProductsSettings {
    fn default() -> Self {
        Self {
            seed: true,
            node_id: "local".to_string(),
        }
    }
}

pub fn products_service(
    adapter: Arc<dyn StoreAdapter>,
    cacher: Arc<dyn Cacher>,
    settings: &ProductsSettings,
) -> DbService {
    with_stock_actions(products_db(adapter, cacher, settings).build())
}

/// The CRUD part of the service, open for extra listeners before it is built.
pub fn products_db(
    adapter: Arc<dyn StoreAdapter>,
    cacher: Arc<dyn Cacher>,
    settings: &ProductsSettings,
) -> DbServiceBuilder {
    let builder = DbService::builder(SERVICE, "products", adapter)
        .fields(PRODUCT_FIELDS)
        .non_negative(["quantity"])
        .node_id(&settings.node_id)
        .cacher(cacher)
        .create_params(
            ParamSchema::new()
                .field("name", ParamRule::string())
                .field("price", ParamRule::number().min(0.0).optional())
                .field("quantity", ParamRule::number().integer().min(0.0).default(json!(0))),
        )
        .update_params(
            ParamSchema::new()
                .field("name", ParamRule::string().optional())
                .field("price", ParamRule::number().min(0.0).optional())
                .field("quantity", ParamRule::number().integer().min(0.0).optional()),
        );
    if settings.seed {
        builder.seed(seed_products())
    } else {
        builder
    }
}

/// Adds `increaseQuantity` and `decreaseQuantity` on top of the CRUD actions.
pub fn with_stock_actions(db: DbService) -> DbService {
    let store = db.store;
    let schema = db
        .schema
        .action(quantity_action("increaseQuantity", "PUT /:id/quantity/increase", &store, 1))
        .action(quantity_action("decreaseQuantity", "PUT /:id/quantity/decrease", &store, -1));
    DbService { store, schema }
}

fn quantity_action(name: &str, route: &str, store: &EntityStore, sign: i64) -> ActionDescriptor {
    let store = store.clone();
    ActionDescriptor::new(
        name,
        handler_fn(move |ctx, params| {
            let store = store.clone();
            async move {
                let (id, value) = quantity_params(&params)?;
                debug!(%id, delta = sign * value, "Changing quantity");
                let product = store
                    .adjust(&ctx.call, &id, "quantity", sign * value, "value")
                    .await?;
                Ok::<_, ServiceError>(product.into_value())
            }
        }),
    )
    .params(
        ParamSchema::new()
            .field("id", ParamRule::string())
            .field("value", ParamRule::number().integer().positive()),
    )
    .rest(route)
}

fn quantity_params(params: &Params) -> Result<(String, i64), ServiceError> {
    let id = params.get("id").and_then(Value::as_str);
    let value = params
        .get("value")
        .and_then(|v| v.as_i64().or_else(|| v.as_f64().map(|f| f as i64)));
    match (id, value) {
        (Some(id), Some(value)) => Ok((id.to_string(), value)),
        _ => Err(ServiceError::Handler("'id' and 'value' are required".into())),
    }
}
