//! # Framework Errors
//!
//! This module defines the error types shared by every layer of a service node.
//! By centralizing error definitions, actions, channel handlers and the entity
//! store all speak the same taxonomy, and the gateway receives one payload shape.
//!
//! | Error | Retried | Surfaced as |
//! |-------|---------|-------------|
//! | [`ValidationError`] | never | `ValidationError` with per-field failures |
//! | [`ServiceError::ActionNotFound`] / [`ServiceError::EntityNotFound`] | never | `NotFoundError` |
//! | [`ServiceError::Unauthorized`] / [`ServiceError::Forbidden`] | never | unchanged |
//! | [`ServiceError::TransientStore`] | by the transport, with backoff | `TransientStoreError` |
//! | [`CacheError`] | never | operator log record only |

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// A single rejected parameter.
///
/// Serializes with the same keys a gateway expects (`type`, `nodeID`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationFailure {
    #[serde(rename = "type")]
    pub kind: String,
    pub field: String,
    pub message: String,
    pub actual: Value,
    pub action: String,
    #[serde(rename = "nodeID")]
    pub node_id: String,
}

/// Every failure collected for one call, reported together.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("Parameters validation error on '{action}' ({count} failed)", count = .failures.len())]
pub struct ValidationError {
    pub action: String,
    pub failures: Vec<ValidationFailure>,
}

impl ValidationError {
    pub fn new(action: impl Into<String>, failures: Vec<ValidationFailure>) -> Self {
        Self {
            action: action.into(),
            failures,
        }
    }

    /// Builds a single-failure error raised by domain logic after the schema passed.
    pub fn single(
        action: impl Into<String>,
        node_id: impl Into<String>,
        field: impl Into<String>,
        kind: impl Into<String>,
        message: impl Into<String>,
        actual: Value,
    ) -> Self {
        let action = action.into();
        let failure = ValidationFailure {
            kind: kind.into(),
            field: field.into(),
            message: message.into(),
            actual,
            action: action.clone(),
            node_id: node_id.into(),
        };
        Self::new(action, vec![failure])
    }

    pub fn field_names(&self) -> Vec<&str> {
        self.failures.iter().map(|f| f.field.as_str()).collect()
    }

    pub fn has_field(&self, field: &str) -> bool {
        self.failures.iter().any(|f| f.field == field)
    }
}

/// Errors raised by a storage adapter.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),
    #[error("Store operation timed out")]
    Timeout,
    #[error("Store closed")]
    Closed,
    #[error("Store dropped response channel")]
    Dropped,
    #[error("Duplicate identifier: {0}")]
    DuplicateId(String),
    #[error("Invalid record: {0}")]
    InvalidRecord(String),
}

impl StoreError {
    /// Connectivity problems worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Timeout)
    }
}

/// Errors raised by a cache backend.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CacheError {
    #[error("Cache backend failure: {0}")]
    Backend(String),
    #[error("Cache lock poisoned")]
    Poisoned,
}

/// Errors raised by the channel runtime.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ChannelError {
    #[error("Channel runtime is shut down")]
    Closed,
    #[error("Topic '{0}' queue is closed")]
    TopicClosed(String),
    #[error("No handler subscribed to '{0}'")]
    NoHandler(String),
    #[error("Topic '{0}' already has a consumer")]
    DuplicateSubscription(String),
}

/// The typed error returned to every caller of an action or channel handler.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ServiceError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("Action '{0}' is not found")]
    ActionNotFound(String),
    #[error("Action '{0}' is already registered")]
    DuplicateAction(String),
    #[error("Entity not found: {0}")]
    EntityNotFound(String),
    #[error("Unauthorized: {0}")]
    Unauthorized(String),
    #[error("Forbidden: {0}")]
    Forbidden(String),
    #[error("Transient store error: {0}")]
    TransientStore(StoreError),
    #[error("Store error: {0}")]
    Store(StoreError),
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error("{0}")]
    Handler(String),
}

impl From<StoreError> for ServiceError {
    fn from(e: StoreError) -> Self {
        if e.is_transient() {
            Self::TransientStore(e)
        } else {
            Self::Store(e)
        }
    }
}

impl ServiceError {
    /// Whether a channel transport should redeliver after this error.
    ///
    /// Bad input and missing entities will fail the same way on every attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::TransientStore(_) | Self::Timeout(_) | Self::Channel(_) | Self::Handler(_)
        )
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "ValidationError",
            Self::ActionNotFound(_) | Self::EntityNotFound(_) => "NotFoundError",
            Self::DuplicateAction(_) => "ServiceSchemaError",
            Self::Unauthorized(_) => "UnauthorizedError",
            Self::Forbidden(_) => "ForbiddenError",
            Self::TransientStore(_) => "TransientStoreError",
            Self::Store(_) => "StoreError",
            Self::Timeout(_) => "RequestTimeoutError",
            Self::Channel(_) => "ChannelError",
            Self::Handler(_) => "ServiceError",
        }
    }

    /// HTTP-ish status hint for the gateway.
    pub fn code(&self) -> u16 {
        match self {
            Self::Validation(_) => 422,
            Self::ActionNotFound(_) | Self::EntityNotFound(_) => 404,
            Self::Unauthorized(_) => 401,
            Self::Forbidden(_) => 403,
            Self::TransientStore(_) | Self::Channel(_) => 503,
            Self::Timeout(_) => 504,
            Self::DuplicateAction(_) | Self::Store(_) | Self::Handler(_) => 500,
        }
    }

    pub fn to_payload(&self) -> ErrorPayload {
        let fields = match self {
            Self::Validation(v) => v.failures.clone(),
            _ => Vec::new(),
        };
        ErrorPayload {
            kind: self.kind().to_string(),
            message: self.to_string(),
            code: self.code(),
            fields,
        }
    }
}

/// Serializable error body handed to the gateway collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    pub kind: String,
    pub message: String,
    pub code: u16,
    pub fields: Vec<ValidationFailure>,
}
