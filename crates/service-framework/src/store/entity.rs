//! # Entity Store
//!
//! CRUD facade over a [`StoreAdapter`]. It is the only place that translates
//! between raw adapter records and entity shape:
//!
//! - `_id` is exposed under the configured id field (`id` by default)
//! - when a field whitelist is set, every other field is stripped
//!
//! Every successful mutation notifies the registered [`EntityListener`]s with
//! an [`EntityChangedEvent`] before the call returns. The mutation and its
//! notification run together in a spawned task, so a caller that gives up
//! (timeout, dropped future) cannot leave a mutation without its event.

use super::adapter::{Filter, Record, StoreAdapter, ID_FIELD};
use crate::context::CallContext;
use crate::error::{ServiceError, ValidationError, ValidationFailure};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Create,
    Update,
    Remove,
}

/// A record in entity shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Entity(pub Record);

impl Entity {
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    pub fn id(&self, id_field: &str) -> Option<&str> {
        self.0.get(id_field).and_then(Value::as_str)
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }
}

/// Raised once per successful mutation.
#[derive(Debug, Clone)]
pub struct EntityChangedEvent {
    pub operation: Operation,
    pub namespace: String,
    /// New state; `None` after a remove.
    pub entity: Option<Entity>,
    /// State before the mutation; `None` for a create.
    pub previous: Option<Entity>,
    pub context: CallContext,
    pub options: Map<String, Value>,
}

#[async_trait]
pub trait EntityListener: Send + Sync {
    /// Failures are the listener's to report; a mutation never fails because
    /// of a listener.
    async fn entity_changed(&self, event: &EntityChangedEvent);
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoreSettings {
    pub collection: String,
    /// Cache and event namespace, usually the service name.
    pub namespace: String,
    pub id_field: String,
    /// Fields exposed to callers; empty exposes everything.
    pub fields: Vec<String>,
    /// Numeric fields that may never go below zero.
    pub non_negative: Vec<String>,
    /// Reported in validation failures raised by the store.
    pub node_id: String,
}

impl StoreSettings {
    pub fn new(namespace: impl Into<String>, collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            namespace: namespace.into(),
            id_field: "id".to_string(),
            fields: Vec::new(),
            non_negative: Vec::new(),
            node_id: "local".to_string(),
        }
    }
}

struct Inner {
    settings: StoreSettings,
    adapter: Arc<dyn StoreAdapter>,
    listeners: Vec<Arc<dyn EntityListener>>,
    /// Serializes read-modify-write adjustments.
    adjust_lock: Mutex<()>,
}

#[derive(Clone)]
pub struct EntityStore {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for EntityStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityStore")
            .field("settings", &self.inner.settings)
            .field("listeners", &self.inner.listeners.len())
            .finish_non_exhaustive()
    }
}

impl EntityStore {
    pub fn new(
        settings: StoreSettings,
        adapter: Arc<dyn StoreAdapter>,
        listeners: Vec<Arc<dyn EntityListener>>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                settings,
                adapter,
                listeners,
                adjust_lock: Mutex::new(()),
            }),
        }
    }

    pub fn settings(&self) -> &StoreSettings {
        &self.inner.settings
    }

    pub fn namespace(&self) -> &str {
        &self.inner.settings.namespace
    }

    pub fn adapter(&self) -> Arc<dyn StoreAdapter> {
        self.inner.adapter.clone()
    }

    #[instrument(skip(self, ctx, params), fields(namespace = %self.namespace()))]
    pub async fn create(
        &self,
        ctx: &CallContext,
        mut params: Record,
    ) -> Result<Entity, ServiceError> {
        params.remove(ID_FIELD);
        params.remove(&self.inner.settings.id_field);
        self.inner.check_non_negative(ctx, &params)?;

        self.run_mutation(ctx, Map::new(), move |inner| async move {
            let saved = inner.adapter.insert(params).await?;
            Ok::<_, ServiceError>((Operation::Create, Some(inner.transform(saved)), None))
        })
        .await
    }

    pub async fn find_by_id(&self, id: &str) -> Result<Option<Entity>, ServiceError> {
        let record = self.inner.adapter.find_by_id(id).await?;
        Ok(record.map(|r| self.inner.transform(r)))
    }

    /// Like [`EntityStore::find_by_id`] but a missing entity is an error.
    pub async fn get(&self, id: &str) -> Result<Entity, ServiceError> {
        self.find_by_id(id)
            .await?
            .ok_or_else(|| ServiceError::EntityNotFound(id.to_string()))
    }

    pub async fn find(&self, filter: Filter) -> Result<Vec<Entity>, ServiceError> {
        let rows = self.inner.adapter.find(filter).await?;
        Ok(rows.into_iter().map(|r| self.inner.transform(r)).collect())
    }

    pub async fn count(&self, query: Record) -> Result<usize, ServiceError> {
        Ok(self.inner.adapter.count(query).await?)
    }

    pub async fn update(
        &self,
        ctx: &CallContext,
        id: &str,
        patch: Record,
    ) -> Result<Entity, ServiceError> {
        self.update_with_options(ctx, id, patch, Map::new()).await
    }

    /// Merges `patch` into the entity. `options` travel with the event.
    #[instrument(skip(self, ctx, patch, options), fields(namespace = %self.namespace()))]
    pub async fn update_with_options(
        &self,
        ctx: &CallContext,
        id: &str,
        mut patch: Record,
        options: Map<String, Value>,
    ) -> Result<Entity, ServiceError> {
        patch.remove(ID_FIELD);
        patch.remove(&self.inner.settings.id_field);
        self.inner.check_non_negative(ctx, &patch)?;

        let id = id.to_string();
        self.run_mutation(ctx, options, move |inner| async move {
            let previous = inner
                .adapter
                .find_by_id(&id)
                .await?
                .ok_or_else(|| ServiceError::EntityNotFound(id.clone()))?;
            let updated = inner
                .adapter
                .update_by_id(&id, patch)
                .await?
                .ok_or_else(|| ServiceError::EntityNotFound(id.clone()))?;
            Ok::<_, ServiceError>((
                Operation::Update,
                Some(inner.transform(updated)),
                Some(inner.transform(previous)),
            ))
        })
        .await
    }

    /// Removes the entity, returning its last state.
    #[instrument(skip(self, ctx), fields(namespace = %self.namespace()))]
    pub async fn remove(&self, ctx: &CallContext, id: &str) -> Result<Entity, ServiceError> {
        let id = id.to_string();
        self.run_mutation(ctx, Map::new(), move |inner| async move {
            let removed = inner
                .adapter
                .remove_by_id(&id)
                .await?
                .ok_or_else(|| ServiceError::EntityNotFound(id.clone()))?;
            Ok::<_, ServiceError>((Operation::Remove, None, Some(inner.transform(removed))))
        })
        .await
    }

    /// Adds `delta` to a numeric field.
    ///
    /// The new value is computed and checked before the update is issued: a
    /// result below zero on a non-negative field fails with a
    /// [`ValidationError`] on `param` and the stored entity is untouched.
    /// Adjustments on one store are serialized so concurrent deltas are not
    /// lost.
    #[instrument(skip(self, ctx), fields(namespace = %self.namespace()))]
    pub async fn adjust(
        &self,
        ctx: &CallContext,
        id: &str,
        field: &str,
        delta: i64,
        param: &str,
    ) -> Result<Entity, ServiceError> {
        let _guard = self.inner.adjust_lock.lock().await;

        let current = self.get(id).await?;
        let value = match current.get(field) {
            None | Some(Value::Null) => 0,
            Some(v) => v.as_i64().ok_or_else(|| {
                ServiceError::Handler(format!("field '{field}' of '{id}' is not an integer"))
            })?,
        };
        let next = value.saturating_add(delta);

        if next < 0 && self.inner.is_non_negative(field) {
            return Err(ValidationError::single(
                self.inner.action_name(ctx),
                &self.inner.settings.node_id,
                param,
                "numberNonNegative",
                format!("The '{param}' field must not exceed the current {field} ({value})."),
                Value::from(delta.unsigned_abs()),
            )
            .into());
        }

        let mut patch = Record::new();
        patch.insert(field.to_string(), Value::from(next));
        debug!(%id, field, from = value, to = next, "Adjusting");
        self.update(ctx, id, patch).await
    }

    async fn run_mutation<F, Fut>(
        &self,
        ctx: &CallContext,
        options: Map<String, Value>,
        mutation: F,
    ) -> Result<Entity, ServiceError>
    where
        F: FnOnce(Arc<Inner>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(Operation, Option<Entity>, Option<Entity>), ServiceError>>
            + Send
            + 'static,
    {
        let inner = self.inner.clone();
        let context = ctx.clone();
        tokio::spawn(async move {
            let (operation, entity, previous) = mutation(inner.clone()).await?;
            let result = entity.clone().or_else(|| previous.clone());
            inner
                .notify(EntityChangedEvent {
                    operation,
                    namespace: inner.settings.namespace.clone(),
                    entity,
                    previous,
                    context,
                    options,
                })
                .await;
            result.ok_or_else(|| ServiceError::Handler("mutation produced no entity".into()))
        })
        .await
        .map_err(|e| ServiceError::Handler(format!("store task failed: {e}")))?
    }
}

impl Inner {
    /// Raw record to entity shape.
    fn transform(&self, mut record: Record) -> Entity {
        if let Some(id) = record.remove(ID_FIELD) {
            record.insert(self.settings.id_field.clone(), id);
        }
        if !self.settings.fields.is_empty() {
            record.retain(|field, _| self.settings.fields.iter().any(|f| f == field));
        }
        Entity(record)
    }

    fn is_non_negative(&self, field: &str) -> bool {
        self.settings.non_negative.iter().any(|f| f == field)
    }

    fn action_name(&self, ctx: &CallContext) -> String {
        ctx.action
            .clone()
            .unwrap_or_else(|| format!("{}.update", self.settings.namespace))
    }

    fn check_non_negative(&self, ctx: &CallContext, patch: &Record) -> Result<(), ValidationError> {
        let failures: Vec<_> = self
            .settings
            .non_negative
            .iter()
            .filter_map(|field| patch.get(field).map(|value| (field, value)))
            .filter(|(_, value)| value.as_f64().is_some_and(|n| n < 0.0))
            .map(|(field, value)| ValidationFailure {
                kind: "numberNonNegative".to_string(),
                field: field.clone(),
                message: format!("The '{field}' field must not be negative."),
                actual: value.clone(),
                action: self.action_name(ctx),
                node_id: self.settings.node_id.clone(),
            })
            .collect();

        if failures.is_empty() {
            Ok(())
        } else {
            Err(ValidationError::new(self.action_name(ctx), failures))
        }
    }

    async fn notify(&self, event: EntityChangedEvent) {
        info!(
            namespace = %event.namespace,
            operation = ?event.operation,
            listeners = self.listeners.len(),
            "Entity changed"
        );
        for listener in &self.listeners {
            listener.entity_changed(&event).await;
        }
    }
}
