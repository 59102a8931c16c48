//! # Action Registry
//!
//! Synchronous entry point for request/response calls:
//!
//! 1. look up the descriptor (unknown names fail before any validation)
//! 2. validate the raw parameters against the full schema
//! 3. serve a cached result, or run the handler under the call timeout
//!
//! The registry is immutable once built and holds no per-call state, so one
//! instance serves every concurrent call.

use crate::action::{ActionContext, ActionDescriptor};
use crate::cache::{CacheKeyBuilder, Cacher};
use crate::channel::ChannelRuntime;
use crate::context::CallContext;
use crate::error::ServiceError;
use crate::events::EventBus;
use crate::validator::{validate, Params};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info_span, warn, Instrument};

/// Runtime services every handler gets through its [`ActionContext`].
#[derive(Debug, Clone)]
pub struct RuntimeHandles {
    pub node_id: String,
    pub events: EventBus,
    pub channels: ChannelRuntime,
}

pub struct ActionRegistry {
    actions: BTreeMap<String, ActionDescriptor>,
    runtime: RuntimeHandles,
    cacher: Option<Arc<dyn Cacher>>,
    keys: CacheKeyBuilder,
    default_timeout: Option<Duration>,
}

impl ActionRegistry {
    pub fn new(runtime: RuntimeHandles) -> Self {
        Self {
            actions: BTreeMap::new(),
            runtime,
            cacher: None,
            keys: CacheKeyBuilder::default(),
            default_timeout: None,
        }
    }

    pub fn with_cacher(mut self, cacher: Arc<dyn Cacher>, keys: CacheKeyBuilder) -> Self {
        self.cacher = Some(cacher);
        self.keys = keys;
        self
    }

    /// Timeout for calls whose context sets none.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn register(&mut self, descriptor: ActionDescriptor) -> Result<(), ServiceError> {
        if self.actions.contains_key(&descriptor.name) {
            return Err(ServiceError::DuplicateAction(descriptor.name));
        }
        debug!(action = %descriptor.name, deferred = descriptor.is_deferred(), "Registered");
        self.actions.insert(descriptor.name.clone(), descriptor);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&ActionDescriptor> {
        self.actions.get(name)
    }

    /// Descriptors in name order, for gateways.
    pub fn descriptors(&self) -> impl Iterator<Item = &ActionDescriptor> {
        self.actions.values()
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub async fn invoke(
        &self,
        name: &str,
        raw: Params,
        ctx: CallContext,
    ) -> Result<Value, ServiceError> {
        let Some(descriptor) = self.actions.get(name) else {
            warn!(action = name, "Action not found");
            return Err(ServiceError::ActionNotFound(name.to_string()));
        };

        let params = validate(&descriptor.params, raw, name, &self.runtime.node_id)
            .inspect_err(|e| debug!(action = name, failed = e.failures.len(), "Validation failed"))?;

        let span = info_span!("action", name, request_id = %ctx.request_id);
        let timeout = ctx.timeout.or(self.default_timeout);
        let action_ctx = ActionContext {
            call: ctx.with_action(name),
            action: name.to_string(),
            node_id: self.runtime.node_id.clone(),
            events: self.runtime.events.clone(),
            channels: self.runtime.channels.clone(),
            span: span.clone(),
        };

        let call = self.dispatch(descriptor, action_ctx, params).instrument(span);
        match timeout {
            Some(limit) => tokio::time::timeout(limit, call).await.map_err(|_| {
                warn!(action = name, ?limit, "Action timed out");
                ServiceError::Timeout(limit)
            })?,
            None => call.await,
        }
    }

    async fn dispatch(
        &self,
        descriptor: &ActionDescriptor,
        ctx: ActionContext,
        params: Params,
    ) -> Result<Value, ServiceError> {
        let (Some(policy), Some(cacher)) = (&descriptor.cache, &self.cacher) else {
            return descriptor.handler.handle(ctx, params).await;
        };

        let key = self.keys.key(&descriptor.name, &params, policy.keys.as_deref());
        match cacher.get(&key).await {
            Ok(Some(hit)) => {
                debug!(%key, "Cache hit");
                return Ok(hit);
            }
            Ok(None) => {}
            Err(e) => warn!(%key, error = %e, "Cache read failed"),
        }

        let epoch = cacher.epoch();
        let result = descriptor.handler.handle(ctx, params).await?;
        if let Err(e) = cacher.set(&key, result.clone(), epoch).await {
            warn!(%key, error = %e, "Cache write failed");
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::handler_fn;
    use crate::cache::MemoryCacher;
    use crate::config::ChannelConfig;
    use crate::validator::{into_params, ParamRule, ParamSchema};
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn registry() -> ActionRegistry {
        let events = EventBus::default();
        ActionRegistry::new(RuntimeHandles {
            node_id: "node-1".into(),
            channels: ChannelRuntime::new(ChannelConfig::default(), events.clone()),
            events,
        })
    }

    fn counting(calls: Arc<AtomicU32>) -> ActionDescriptor {
        ActionDescriptor::new(
            "products.get",
            handler_fn(move |_ctx, params| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(json!({ "id": params["id"] }))
                }
            }),
        )
        .params(ParamSchema::new().field("id", ParamRule::string()))
    }

    #[tokio::test]
    async fn test_unknown_action_is_not_found() {
        let err = registry()
            .invoke("products.nope", Params::new(), CallContext::new())
            .await
            .unwrap_err();
        assert_eq!(err, ServiceError::ActionNotFound("products.nope".into()));
    }

    #[tokio::test]
    async fn test_invalid_params_never_reach_handler() {
        let calls = Arc::new(AtomicU32::new(0));
        let mut registry = registry();
        registry.register(counting(calls.clone())).unwrap();

        let err = registry
            .invoke("products.get", Params::new(), CallContext::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Validation(v) if v.has_field("id")));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_duplicate_registration_is_rejected() {
        let mut registry = registry();
        registry.register(counting(Arc::default())).unwrap();
        assert_eq!(
            registry.register(counting(Arc::default())),
            Err(ServiceError::DuplicateAction("products.get".into()))
        );
    }

    #[tokio::test]
    async fn test_cached_action_reads_through() {
        let calls = Arc::new(AtomicU32::new(0));
        let cacher = Arc::new(MemoryCacher::new());
        let mut registry = registry().with_cacher(cacher.clone(), CacheKeyBuilder::default());
        registry.register(counting(calls.clone()).cache_keys(["id"])).unwrap();

        for _ in 0..2 {
            let out = registry
                .invoke("products.get", into_params(json!({ "id": "1" })), CallContext::new())
                .await
                .unwrap();
            assert_eq!(out["id"], "1");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        cacher.clean("products.*").await.unwrap();
        registry
            .invoke("products.get", into_params(json!({ "id": "1" })), CallContext::new())
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_call_timeout() {
        let mut registry = registry();
        registry
            .register(ActionDescriptor::new(
                "slow.call",
                handler_fn(|_ctx, _params| async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok(Value::Null)
                }),
            ))
            .unwrap();

        let ctx = CallContext::new().with_timeout(Duration::from_millis(10));
        let err = registry.invoke("slow.call", Params::new(), ctx).await.unwrap_err();
        assert_eq!(err, ServiceError::Timeout(Duration::from_millis(10)));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_handler_sees_action_context() {
        let mut registry = registry();
        registry
            .register(ActionDescriptor::new(
                "greeter.whoami",
                handler_fn(|ctx, _params| async move {
                    Ok(json!({ "action": ctx.action, "node": ctx.node_id, "call": ctx.call.action }))
                }),
            ))
            .unwrap();

        let out = registry
            .invoke("greeter.whoami", Params::new(), CallContext::new())
            .await
            .unwrap();
        assert_eq!(
            out,
            json!({ "action": "greeter.whoami", "node": "node-1", "call": "greeter.whoami" })
        );
    }
}
