//! # Database Service Composition
//!
//! [`DbServiceBuilder`] turns a collection into a ready-made service:
//!
//! | Action | REST | Cached |
//! |--------|------|--------|
//! | `<svc>.create` | `POST /` | no |
//! | `<svc>.list` | `GET /` | yes |
//! | `<svc>.find` | | yes |
//! | `<svc>.count` | | yes |
//! | `<svc>.get` | `GET /:id` | yes, keyed on `id` |
//! | `<svc>.update` | `PUT /:id` | no |
//! | `<svc>.remove` | `DELETE /:id` | no |
//!
//! plus a [`CacheInvalidator`] for the service namespace when a cacher is
//! given, and a [`Seeder`] start hook when a seed set is given. The built
//! [`DbService`] exposes the [`EntityStore`] so the owning service can add its
//! own actions on top.
//!
//! ```rust
//! use service_framework::db::DbService;
//! use service_framework::store::MemoryStore;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let (store, client) = MemoryStore::new("products", 10);
//!     tokio::spawn(store.run());
//!
//!     let db = DbService::builder("products", "products", Arc::new(client))
//!         .fields(["id", "name", "quantity", "price"])
//!         .build();
//!     assert!(db.schema.action_names().contains(&"products.list"));
//! }
//! ```

use crate::action::{handler_fn, ActionDescriptor};
use crate::cache::{CacheInvalidator, Cacher};
use crate::error::ServiceError;
use crate::seeder::Seeder;
use crate::service::ServiceSchema;
use crate::store::{EntityListener, EntityStore, Filter, Record, StoreAdapter, StoreSettings};
use crate::validator::{ParamRule, ParamSchema, Params};
use serde_json::{json, Value};
use std::sync::Arc;

const DEFAULT_PAGE_SIZE: usize = 10;

pub struct DbServiceBuilder {
    service: String,
    settings: StoreSettings,
    adapter: Arc<dyn StoreAdapter>,
    cacher: Option<Arc<dyn Cacher>>,
    listeners: Vec<Arc<dyn EntityListener>>,
    seed: Vec<Record>,
    create_params: ParamSchema,
    update_params: ParamSchema,
}

/// The store and the CRUD service built over it.
#[derive(Debug, Clone)]
pub struct DbService {
    pub store: EntityStore,
    pub schema: ServiceSchema,
}

impl DbService {
    pub fn builder(
        service: impl Into<String>,
        collection: impl Into<String>,
        adapter: Arc<dyn StoreAdapter>,
    ) -> DbServiceBuilder {
        let service = service.into();
        DbServiceBuilder {
            settings: StoreSettings::new(service.clone(), collection),
            service,
            adapter,
            cacher: None,
            listeners: Vec::new(),
            seed: Vec::new(),
            create_params: ParamSchema::new(),
            update_params: ParamSchema::new(),
        }
    }
}

impl DbServiceBuilder {
    /// Fields exposed to callers.
    pub fn fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.settings.fields = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn non_negative<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.settings.non_negative = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn node_id(mut self, node_id: impl Into<String>) -> Self {
        self.settings.node_id = node_id.into();
        self
    }

    /// Evicts `<service>.*` from `cacher` after every mutation.
    pub fn cacher(mut self, cacher: Arc<dyn Cacher>) -> Self {
        self.cacher = Some(cacher);
        self
    }

    pub fn listener(mut self, listener: Arc<dyn EntityListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    /// Inserted at start when the collection is empty.
    pub fn seed(mut self, seed: Vec<Record>) -> Self {
        self.seed = seed;
        self
    }

    pub fn create_params(mut self, params: ParamSchema) -> Self {
        self.create_params = params;
        self
    }

    /// Rules for patch fields of `update`, on top of `id`.
    pub fn update_params(mut self, params: ParamSchema) -> Self {
        self.update_params = params;
        self
    }

    pub fn build(self) -> DbService {
        let mut schema = ServiceSchema::new(&self.service);
        let mut listeners = self.listeners;

        if let Some(cacher) = self.cacher {
            let invalidator = Arc::new(CacheInvalidator::new(&self.service, cacher));
            listeners.push(invalidator.clone());
            schema = schema.invalidator(invalidator);
        }
        if !self.seed.is_empty() {
            schema = schema.started(Arc::new(Seeder::new(
                &self.settings.collection,
                self.adapter.clone(),
                self.seed,
            )));
        }

        let store = EntityStore::new(self.settings, self.adapter, listeners);
        let schema = crud_actions(schema, &store, self.create_params, self.update_params);
        DbService { store, schema }
    }
}

fn crud_actions(
    schema: ServiceSchema,
    store: &EntityStore,
    create: ParamSchema,
    update: ParamSchema,
) -> ServiceSchema {
    let query_params = ParamSchema::new()
        .field("sort", ParamRule::string().optional())
        .field("query", ParamRule::object().optional());
    let id_param = ParamSchema::new().field("id", ParamRule::string().convert());

    schema
        .action(
            ActionDescriptor::new("create", {
                let store = store.clone();
                handler_fn(move |ctx, params| {
                    let store = store.clone();
                    async move {
                        let out = store.create(&ctx.call, params).await?.into_value();
                        Ok::<_, ServiceError>(out)
                    }
                })
            })
            .params(create)
            .rest("POST /"),
        )
        .action(
            ActionDescriptor::new("list", {
                let store = store.clone();
                handler_fn(move |_ctx, params| list(store.clone(), params))
            })
            .params(
                ParamSchema::new()
                    .field("page", page_rule(1))
                    .field("pageSize", page_rule(DEFAULT_PAGE_SIZE))
                    .merge(query_params.clone()),
            )
            .rest("GET /")
            .cached(),
        )
        .action(
            ActionDescriptor::new("find", {
                let store = store.clone();
                handler_fn(move |_ctx, params| {
                    let store = store.clone();
                    async move {
                        let mut filter = filter(&params);
                        if let Some(limit) = usize_param(&params, "limit") {
                            filter = filter.limit(limit);
                        }
                        if let Some(offset) = usize_param(&params, "offset") {
                            filter = filter.offset(offset);
                        }
                        Ok::<_, ServiceError>(json!(store.find(filter).await?))
                    }
                })
            })
            .params(
                ParamSchema::new()
                    .field("limit", ParamRule::number().convert().integer().min(0.0).optional())
                    .field("offset", ParamRule::number().convert().integer().min(0.0).optional())
                    .merge(query_params.clone()),
            )
            .cached(),
        )
        .action(
            ActionDescriptor::new("count", {
                let store = store.clone();
                handler_fn(move |_ctx, params| {
                    let store = store.clone();
                    async move {
                        let out = json!(store.count(filter(&params).query).await?);
                        Ok::<_, ServiceError>(out)
                    }
                })
            })
            .params(ParamSchema::new().field("query", ParamRule::object().optional()))
            .cached(),
        )
        .action(
            ActionDescriptor::new("get", {
                let store = store.clone();
                handler_fn(move |_ctx, params| {
                    let store = store.clone();
                    async move {
                        let out = store.get(&id_of(&params)?).await?.into_value();
                        Ok::<_, ServiceError>(out)
                    }
                })
            })
            .params(id_param.clone())
            .rest("GET /:id")
            .cache_keys(["id"]),
        )
        .action(
            ActionDescriptor::new("update", {
                let store = store.clone();
                handler_fn(move |ctx, mut params| {
                    let store = store.clone();
                    async move {
                        let id = id_of(&params)?;
                        params.remove("id");
                        let out = store.update(&ctx.call, &id, params).await?.into_value();
                        Ok::<_, ServiceError>(out)
                    }
                })
            })
            .params(update.merge(id_param.clone()))
            .rest("PUT /:id"),
        )
        .action(
            ActionDescriptor::new("remove", {
                let store = store.clone();
                handler_fn(move |ctx, params| {
                    let store = store.clone();
                    async move {
                        let out = store.remove(&ctx.call, &id_of(&params)?).await?.into_value();
                        Ok::<_, ServiceError>(out)
                    }
                })
            })
            .params(id_param)
            .rest("DELETE /:id"),
        )
}

async fn list(store: EntityStore, params: Params) -> Result<Value, ServiceError> {
    let page = usize_param(&params, "page").unwrap_or(1).max(1);
    let page_size = usize_param(&params, "pageSize")
        .unwrap_or(DEFAULT_PAGE_SIZE)
        .max(1);

    let filter = filter(&params);
    let total = store.count(filter.query.clone()).await?;
    let rows = store
        .find(filter.offset((page - 1) * page_size).limit(page_size))
        .await?;

    Ok(json!({
        "rows": rows,
        "total": total,
        "page": page,
        "pageSize": page_size,
        "totalPages": total.div_ceil(page_size),
    }))
}

fn page_rule(default: usize) -> ParamRule {
    ParamRule::number()
        .convert()
        .integer()
        .positive()
        .default(json!(default))
}

fn filter(params: &Params) -> Filter {
    let mut filter = Filter::new();
    if let Some(Value::Object(query)) = params.get("query") {
        filter = filter.query(query.clone());
    }
    if let Some(Value::String(sort)) = params.get("sort") {
        filter = filter.sort(sort.clone());
    }
    filter
}

fn usize_param(params: &Params, name: &str) -> Option<usize> {
    let value = params.get(name)?;
    value
        .as_u64()
        .or_else(|| value.as_f64().filter(|n| *n >= 0.0).map(|n| n as u64))
        .and_then(|n| usize::try_from(n).ok())
}

fn id_of(params: &Params) -> Result<String, ServiceError> {
    match params.get("id") {
        Some(Value::String(id)) => Ok(id.clone()),
        Some(other) => Ok(other.to_string()),
        None => Err(ServiceError::Handler("missing 'id' parameter".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::RecordingCacher;
    use crate::store::MemoryStore;

    fn memory() -> Arc<dyn StoreAdapter> {
        let (store, client) = MemoryStore::new("products", 10);
        tokio::spawn(store.run());
        Arc::new(client)
    }

    fn record(value: Value) -> Record {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_builds_crud_actions_with_hints() {
        let db = DbService::builder("products", "products", memory()).build();

        assert_eq!(
            db.schema.action_names(),
            vec![
                "products.create",
                "products.list",
                "products.find",
                "products.count",
                "products.get",
                "products.update",
                "products.remove",
            ]
        );
        let get = &db.schema.actions[4];
        assert_eq!(get.hints.rest.as_deref(), Some("GET /:id"));
        assert_eq!(get.cache.as_ref().and_then(|c| c.keys.clone()), Some(vec!["id".into()]));
        assert!(db.schema.actions[0].cache.is_none());
        assert!(db.schema.started.is_empty());
        assert!(db.schema.invalidators.is_empty());
    }

    #[tokio::test]
    async fn test_cacher_and_seed_add_invalidator_and_start_hook() {
        let cacher = Arc::new(RecordingCacher::new());
        let db = DbService::builder("products", "products", memory())
            .cacher(cacher.clone())
            .seed(vec![record(json!({ "name": "iPhone 11 Pro" }))])
            .build();

        assert_eq!(db.schema.invalidators.len(), 1);
        assert_eq!(db.schema.started.len(), 1);
        assert_eq!(db.schema.started[0].name(), "products");

        db.store
            .create(&Default::default(), record(json!({ "name": "x" })))
            .await
            .unwrap();
        assert_eq!(cacher.cleaned(), vec!["products.*".to_string()]);
    }

    #[tokio::test]
    async fn test_list_pages() {
        let db = DbService::builder("products", "products", memory()).build();
        for n in 0..5 {
            db.store
                .create(&Default::default(), record(json!({ "n": n })))
                .await
                .unwrap();
        }

        let out = list(db.store.clone(), record(json!({ "page": 2, "pageSize": 2, "sort": "n" })))
            .await
            .unwrap();
        assert_eq!(out["total"], 5);
        assert_eq!(out["totalPages"], 3);
        assert_eq!(out["rows"][0]["n"], 2);
        assert_eq!(out["rows"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn test_id_param() {
        assert_eq!(id_of(&record(json!({ "id": "7" }))).unwrap(), "7");
        assert_eq!(id_of(&record(json!({ "id": 7 }))).unwrap(), "7");
        assert!(id_of(&Params::new()).is_err());
    }
}
