//! # Actions
//!
//! An [`ActionDescriptor`] bundles everything the registry needs to serve one
//! named action: its parameter schema, its handler, gateway hints, an
//! optional cache policy and its dispatch mode.
//!
//! Handlers receive an explicit [`ActionContext`] instead of reaching for
//! shared state: the call context, the event bus, the channel runtime and the
//! tracing span of the call.

use crate::channel::ChannelRuntime;
use crate::context::CallContext;
use crate::error::{ServiceError, ValidationError};
use crate::events::EventBus;
use crate::validator::{ParamSchema, Params};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use tracing::Span;
use uuid::Uuid;

/// Explicit per-call context handed to every handler.
#[derive(Debug, Clone)]
pub struct ActionContext {
    pub call: CallContext,
    pub action: String,
    pub node_id: String,
    pub events: EventBus,
    pub channels: ChannelRuntime,
    pub span: Span,
}

impl ActionContext {
    /// Emits a domain event correlated with this call.
    pub fn emit(&self, name: impl Into<String>, payload: Value) -> usize {
        self.events.emit(name, payload, Some(self.call.correlation()))
    }

    /// Publishes deferred work carrying this call's correlation.
    pub async fn send_to_channel(&self, topic: &str, payload: Params) -> Result<Uuid, ServiceError> {
        Ok(self.channels.publish(topic, payload, &self.call).await?)
    }

    /// A single-field validation failure attributed to this action.
    pub fn validation_error(
        &self,
        field: &str,
        kind: &str,
        message: impl Into<String>,
        actual: Value,
    ) -> ServiceError {
        ValidationError::single(&self.action, &self.node_id, field, kind, message, actual).into()
    }
}

#[async_trait]
pub trait ActionHandler: Send + Sync {
    async fn handle(&self, ctx: ActionContext, params: Params) -> Result<Value, ServiceError>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> ActionHandler for FnHandler<F>
where
    F: Fn(ActionContext, Params) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, ServiceError>> + Send + 'static,
{
    async fn handle(&self, ctx: ActionContext, params: Params) -> Result<Value, ServiceError> {
        (self.0)(ctx, params).await
    }
}

/// Wraps an async closure as a handler.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn ActionHandler>
where
    F: Fn(ActionContext, Params) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, ServiceError>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// GraphQL binding hint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GraphqlHint {
    Query(String),
    Mutation(String),
}

/// Routing metadata consumed verbatim by a gateway.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TransportHints {
    /// e.g. `"PUT /:id/quantity/increase"`.
    pub rest: Option<String>,
    pub graphql: Option<GraphqlHint>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CachePolicy {
    /// Parameters making up the key; `None` uses all of them.
    pub keys: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    /// The handler does the work before returning.
    Immediate,
    /// The handler publishes to `topic` and acknowledges.
    Deferred { topic: String },
}

#[derive(Clone)]
pub struct ActionDescriptor {
    pub name: String,
    pub params: ParamSchema,
    pub handler: Arc<dyn ActionHandler>,
    pub hints: TransportHints,
    pub cache: Option<CachePolicy>,
    pub dispatch: Dispatch,
}

impl std::fmt::Debug for ActionDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionDescriptor")
            .field("name", &self.name)
            .field("params", &self.params)
            .field("hints", &self.hints)
            .field("cache", &self.cache)
            .field("dispatch", &self.dispatch)
            .finish_non_exhaustive()
    }
}

impl ActionDescriptor {
    pub fn new(name: impl Into<String>, handler: Arc<dyn ActionHandler>) -> Self {
        Self {
            name: name.into(),
            params: ParamSchema::new(),
            handler,
            hints: TransportHints::default(),
            cache: None,
            dispatch: Dispatch::Immediate,
        }
    }

    /// An action that validates, publishes its parameters to `topic` and
    /// returns `true` without waiting for the work.
    pub fn deferred(name: impl Into<String>, topic: impl Into<String>) -> Self {
        let topic = topic.into();
        let handler = PublishHandler {
            topic: topic.clone(),
            fields: ParamSchema::new(),
        };
        let mut descriptor = Self::new(name, Arc::new(handler));
        descriptor.dispatch = Dispatch::Deferred { topic };
        descriptor
    }

    /// For a deferred action the published payload is narrowed to these fields.
    pub fn params(mut self, params: ParamSchema) -> Self {
        if let Dispatch::Deferred { topic } = &self.dispatch {
            self.handler = Arc::new(PublishHandler {
                topic: topic.clone(),
                fields: params.clone(),
            });
        }
        self.params = params;
        self
    }

    pub fn rest(mut self, route: impl Into<String>) -> Self {
        self.hints.rest = Some(route.into());
        self
    }

    pub fn graphql(mut self, hint: GraphqlHint) -> Self {
        self.hints.graphql = Some(hint);
        self
    }

    pub fn cached(mut self) -> Self {
        self.cache = Some(CachePolicy::default());
        self
    }

    pub fn cache_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.cache = Some(CachePolicy {
            keys: Some(keys.into_iter().map(Into::into).collect()),
        });
        self
    }

    pub fn is_deferred(&self) -> bool {
        matches!(self.dispatch, Dispatch::Deferred { .. })
    }
}

struct PublishHandler {
    topic: String,
    /// Empty publishes every parameter.
    fields: ParamSchema,
}

#[async_trait]
impl ActionHandler for PublishHandler {
    async fn handle(&self, ctx: ActionContext, params: Params) -> Result<Value, ServiceError> {
        let payload = if self.fields.is_empty() {
            params
        } else {
            self.fields.project(&params)
        };
        let message_id = ctx.send_to_channel(&self.topic, payload).await?;
        tracing::debug!(topic = %self.topic, %message_id, "Accepted for deferred processing");
        Ok(Value::Bool(true))
    }
}
