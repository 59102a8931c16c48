//! # Service Broker
//!
//! Wires services into a running node and owns its lifecycle.
//!
//! ## Startup Order
//!
//! [`BrokerBuilder::start`] runs these steps in order:
//!
//! 1. **Runtime**: create the event bus and the channel runtime.
//! 2. **Registry**: register every action. Duplicate names abort startup.
//! 3. **Start hooks**: run each service's hooks (seeding) in service order.
//!    A failing hook aborts startup, so no call is served against a store
//!    that never came up.
//! 4. **Channels**: subscribe every channel handler. Messages published by a
//!    start hook wait in the topic queue until here.
//!
//! ## Shutdown
//!
//! [`ServiceBroker::shutdown`] stops accepting channel messages, lets
//! consumers drain their queues and waits for in-flight deliveries.
//!
//! ```rust
//! use serde_json::json;
//! use service_framework::action::{handler_fn, ActionDescriptor};
//! use service_framework::broker::BrokerBuilder;
//! use service_framework::config::BrokerConfig;
//! use service_framework::context::CallContext;
//! use service_framework::service::ServiceSchema;
//!
//! #[tokio::main]
//! async fn main() {
//!     let greeter = ServiceSchema::new("greeter").action(ActionDescriptor::new(
//!         "hello",
//!         handler_fn(|_ctx, _params| async { Ok(json!("Hello")) }),
//!     ));
//!     let broker = BrokerBuilder::new(BrokerConfig::default())
//!         .service(greeter)
//!         .start()
//!         .await
//!         .unwrap();
//!
//!     let out = broker.call("greeter.hello", Default::default(), CallContext::new()).await;
//!     assert_eq!(out.unwrap(), json!("Hello"));
//!     broker.shutdown().await;
//! }
//! ```

use crate::cache::{CacheInvalidator, CacheKeyBuilder, Cacher};
use crate::channel::{ChannelRuntime, DeliveryStatsSnapshot};
use crate::config::BrokerConfig;
use crate::context::CallContext;
use crate::error::ServiceError;
use crate::events::{DomainEvent, EventBus};
use crate::registry::{ActionRegistry, RuntimeHandles};
use crate::service::ServiceSchema;
use crate::store::Record;
use crate::validator::Params;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info, instrument};
use uuid::Uuid;

pub struct BrokerBuilder {
    config: BrokerConfig,
    cacher: Option<Arc<dyn Cacher>>,
    services: Vec<ServiceSchema>,
}

impl BrokerBuilder {
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            config,
            cacher: None,
            services: Vec::new(),
        }
    }

    /// Cache for actions marked cacheable; ignored when `cache.enabled` is off.
    pub fn cacher(mut self, cacher: Arc<dyn Cacher>) -> Self {
        self.cacher = Some(cacher);
        self
    }

    pub fn service(mut self, service: ServiceSchema) -> Self {
        self.services.push(service);
        self
    }

    #[instrument(skip(self), fields(node_id = %self.config.node_id))]
    pub async fn start(self) -> Result<ServiceBroker, ServiceError> {
        let node_id = self.config.node_id.clone();
        let events = EventBus::default();
        let channels = ChannelRuntime::new(self.config.channels.clone(), events.clone());

        let mut registry = ActionRegistry::new(RuntimeHandles {
            node_id: node_id.clone(),
            events: events.clone(),
            channels: channels.clone(),
        })
        .with_timeout(self.config.request_timeout());
        if let (true, Some(cacher)) = (self.config.cache.enabled, self.cacher) {
            registry = registry.with_cacher(cacher, CacheKeyBuilder::new(self.config.cache.max_key_length));
        }

        let mut invalidators = Vec::new();
        for service in &self.services {
            for action in &service.actions {
                registry.register(action.clone())?;
            }
            invalidators.extend(service.invalidators.iter().cloned());
        }

        for service in &self.services {
            for hook in &service.started {
                info!(service = %service.name, hook = hook.name(), "Running start hook");
                hook.started().await.inspect_err(|e| {
                    error!(service = %service.name, hook = hook.name(), error = %e, "Start hook failed");
                })?;
            }
        }

        for service in &self.services {
            for sub in &service.channels {
                channels.subscribe(&sub.topic, &sub.group, sub.handler.clone())?;
            }
            info!(service = %service.name, actions = service.actions.len(), "Service started");
        }

        info!(actions = registry.len(), "Broker started");
        Ok(ServiceBroker {
            node_id,
            registry: Arc::new(registry),
            events,
            channels,
            invalidators,
        })
    }
}

/// Operator view of a running node.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BrokerHealth {
    pub node_id: String,
    pub actions: usize,
    pub deliveries: DeliveryStatsSnapshot,
    pub dead_letters: usize,
    pub cache_invalidation_failures: u64,
}

#[derive(Clone)]
pub struct ServiceBroker {
    node_id: String,
    registry: Arc<ActionRegistry>,
    events: EventBus,
    channels: ChannelRuntime,
    invalidators: Vec<Arc<CacheInvalidator>>,
}

impl std::fmt::Debug for ServiceBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceBroker")
            .field("node_id", &self.node_id)
            .field("actions", &self.registry.len())
            .finish_non_exhaustive()
    }
}

impl ServiceBroker {
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn registry(&self) -> &ActionRegistry {
        &self.registry
    }

    pub fn channels(&self) -> &ChannelRuntime {
        &self.channels
    }

    /// Request/response call through validation, cache and timeout.
    pub async fn call(
        &self,
        action: &str,
        params: Params,
        ctx: CallContext,
    ) -> Result<Value, ServiceError> {
        self.registry.invoke(action, params, ctx).await
    }

    pub fn emit(&self, name: impl Into<String>, payload: Value, ctx: Option<&CallContext>) -> usize {
        self.events
            .emit(name, payload, ctx.map(CallContext::correlation))
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<DomainEvent> {
        self.events.subscribe()
    }

    pub async fn send_to_channel(
        &self,
        topic: &str,
        payload: Record,
        ctx: &CallContext,
    ) -> Result<Uuid, ServiceError> {
        Ok(self.channels.publish(topic, payload, ctx).await?)
    }

    /// Runs a topic's handler directly, once, without queueing or retries.
    pub async fn emit_local_channel_handler(
        &self,
        topic: &str,
        payload: Record,
        ctx: &CallContext,
    ) -> Result<(), ServiceError> {
        self.channels.invoke_local(topic, payload, ctx).await
    }

    pub fn health(&self) -> BrokerHealth {
        BrokerHealth {
            node_id: self.node_id.clone(),
            actions: self.registry.len(),
            deliveries: self.channels.stats(),
            dead_letters: self.channels.dead_letters().len(),
            cache_invalidation_failures: self.invalidators.iter().map(|i| i.failures()).sum(),
        }
    }

    pub async fn shutdown(&self) {
        info!(node_id = %self.node_id, "Broker stopping");
        self.channels.shutdown().await;
        info!(health = ?self.health(), "Broker stopped");
    }
}
