//! # Service Framework
//!
//! Building blocks for a service node: named actions called request/response,
//! deferred work over topic channels, and entity stores whose mutations keep a
//! read-through cache honest.
//!
//! ## Architecture Overview
//!
//! ```text
//!  caller ──► ServiceBroker::call ──► ActionRegistry ──► validator ──► cache? ──► ActionHandler
//!                                                                                   │
//!                        ┌───────────────────────────────────────────────────────────┤
//!                        ▼                                                           ▼
//!              ChannelRuntime::publish                                       EntityStore ──► StoreAdapter
//!                        │                                                           │
//!                        ▼                                                           ▼
//!              topic queue ──► ChannelHandler                          EntityChangedEvent ──► CacheInvalidator
//! ```
//!
//! The framework separates concerns into layers:
//!
//! 1. **Definition** ([`service`], [`action`], [`db`]): services are plain
//!    values built by factory functions from configuration. Nothing is
//!    registered implicitly.
//! 2. **Dispatch** ([`registry`], [`validator`], [`channel`]): validation
//!    always precedes the handler; deferred work is acknowledged before it
//!    runs and redelivered on transient failure.
//! 3. **State** ([`store`], [`cache`], [`seeder`]): the adapter owns
//!    representation, the [`EntityStore`] owns entity shape and change
//!    notification.
//!
//! ## Explicit Context
//!
//! Handlers never reach for ambient state. An action handler gets an
//! [`ActionContext`](action::ActionContext) holding the call context, the
//! event bus, the channel runtime and its tracing span; a channel handler gets
//! a [`DeliveryContext`](channel::DeliveryContext) correlated with the
//! publishing call.
//!
//! ## Concurrency Model
//!
//! - Each store collection runs in its own Tokio task and processes requests
//!   sequentially ([`store::MemoryStore`]).
//! - Each channel topic has one consumer running up to `max_in_flight`
//!   deliveries at once.
//! - A mutation and its change notification run in one spawned task, so a
//!   caller that gives up cannot split them.
//!
//! ## Errors
//!
//! Every failure is a typed [`ServiceError`]. [`ServiceError::is_retryable`]
//! drives channel redelivery and [`ServiceError::to_payload`] produces the
//! gateway-facing `{kind, message, code, fields}` shape.
//!
//! ## Testing
//!
//! The [`mock`] module scripts store replies (including outages) and records
//! cache evictions, so lifecycle and invalidation paths can be tested without
//! a real backend.

pub mod action;
pub mod broker;
pub mod cache;
pub mod channel;
pub mod config;
pub mod context;
pub mod db;
pub mod error;
pub mod events;
pub mod mock;
pub mod registry;
pub mod seeder;
pub mod service;
pub mod store;
pub mod tracing;
pub mod validator;

// Re-export core types for convenience
pub use action::{ActionContext, ActionDescriptor, ActionHandler};
pub use broker::{BrokerBuilder, BrokerHealth, ServiceBroker};
pub use context::CallContext;
pub use error::{
    CacheError, ChannelError, ServiceError, StoreError, ValidationError, ValidationFailure,
};
pub use service::ServiceSchema;
pub use store::{EntityStore, StoreAdapter};
pub use validator::{ParamRule, ParamSchema, Params};
