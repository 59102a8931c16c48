//! # Service Definitions
//!
//! A [`ServiceSchema`] is a plain value describing one service: its actions,
//! channel subscriptions, start hooks and cache invalidators. Services are
//! built by ordinary factory functions taking their configuration and are
//! handed to the broker, which owns registration order and lifecycle.
//!
//! ```rust
//! use serde_json::json;
//! use service_framework::action::{handler_fn, ActionDescriptor};
//! use service_framework::service::ServiceSchema;
//!
//! let greeter = ServiceSchema::new("greeter").action(
//!     ActionDescriptor::new("hello", handler_fn(|_ctx, _params| async { Ok(json!("hi")) }))
//!         .rest("GET /hello"),
//! );
//! assert_eq!(greeter.actions[0].name, "greeter.hello");
//! ```

use crate::action::ActionDescriptor;
use crate::cache::CacheInvalidator;
use crate::channel::ChannelHandler;
use crate::seeder::StartHook;
use std::sync::Arc;

/// A channel handler bound to a topic and consumer group.
#[derive(Clone)]
pub struct ChannelSubscription {
    pub topic: String,
    pub group: String,
    pub handler: Arc<dyn ChannelHandler>,
}

impl std::fmt::Debug for ChannelSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelSubscription")
            .field("topic", &self.topic)
            .field("group", &self.group)
            .finish_non_exhaustive()
    }
}

#[derive(Clone)]
pub struct ServiceSchema {
    pub name: String,
    pub actions: Vec<ActionDescriptor>,
    pub channels: Vec<ChannelSubscription>,
    pub started: Vec<Arc<dyn StartHook>>,
    pub invalidators: Vec<Arc<CacheInvalidator>>,
}

impl std::fmt::Debug for ServiceSchema {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceSchema")
            .field("name", &self.name)
            .field("actions", &self.action_names())
            .field("channels", &self.channels)
            .field("started", &self.started.len())
            .field("invalidators", &self.invalidators.len())
            .finish()
    }
}

impl ServiceSchema {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            actions: Vec::new(),
            channels: Vec::new(),
            started: Vec::new(),
            invalidators: Vec::new(),
        }
    }

    /// Adds an action, qualifying its name as `<service>.<action>`.
    pub fn action(mut self, mut descriptor: ActionDescriptor) -> Self {
        descriptor.name = format!("{}.{}", self.name, descriptor.name);
        self.actions.push(descriptor);
        self
    }

    pub fn channel(
        mut self,
        topic: impl Into<String>,
        group: impl Into<String>,
        handler: Arc<dyn ChannelHandler>,
    ) -> Self {
        self.channels.push(ChannelSubscription {
            topic: topic.into(),
            group: group.into(),
            handler,
        });
        self
    }

    /// Runs before the broker serves any call.
    pub fn started(mut self, hook: Arc<dyn StartHook>) -> Self {
        self.started.push(hook);
        self
    }

    /// Tracked for operator health reporting.
    pub fn invalidator(mut self, invalidator: Arc<CacheInvalidator>) -> Self {
        self.invalidators.push(invalidator);
        self
    }

    /// Appends everything another schema defines, keeping its qualified names.
    pub fn merge(mut self, other: ServiceSchema) -> Self {
        self.actions.extend(other.actions);
        self.channels.extend(other.channels);
        self.started.extend(other.started);
        self.invalidators.extend(other.invalidators);
        self
    }

    pub fn action_names(&self) -> Vec<&str> {
        self.actions.iter().map(|a| a.name.as_str()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::handler_fn;
    use serde_json::Value;

    fn noop(name: &str) -> ActionDescriptor {
        ActionDescriptor::new(name, handler_fn(|_ctx, _params| async { Ok(Value::Null) }))
    }

    #[test]
    fn test_actions_are_qualified_by_service() {
        let schema = ServiceSchema::new("products")
            .action(noop("increaseQuantity"))
            .action(noop("decreaseQuantity"));
        assert_eq!(
            schema.action_names(),
            vec!["products.increaseQuantity", "products.decreaseQuantity"]
        );
    }

    #[test]
    fn test_merge_keeps_qualified_names() {
        let crud = ServiceSchema::new("products").action(noop("get"));
        let schema = ServiceSchema::new("products").action(noop("hello")).merge(crud);
        assert_eq!(schema.action_names(), vec!["products.hello", "products.get"]);
    }
}
