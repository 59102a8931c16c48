//! # Call Context
//!
//! Every action call and every channel delivery carries a [`CallContext`]. The
//! gateway fills in `meta` (authenticated user, user agent, ...); the core only
//! propagates it. Deliveries get a fresh context derived from the publisher's
//! [`Correlation`], so a request chain can be followed across the async hop.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;
use uuid::Uuid;

/// Opaque per-call context.
#[derive(Debug, Clone, PartialEq)]
pub struct CallContext {
    pub request_id: Uuid,
    /// Shared by every call in one request chain.
    pub correlation_id: Uuid,
    pub parent_id: Option<Uuid>,
    pub caller: Option<String>,
    /// Action or topic currently executing under this context.
    pub action: Option<String>,
    pub level: u32,
    pub meta: Map<String, Value>,
    pub timeout: Option<Duration>,
}

impl Default for CallContext {
    fn default() -> Self {
        Self::new()
    }
}

impl CallContext {
    pub fn new() -> Self {
        let request_id = Uuid::new_v4();
        Self {
            request_id,
            correlation_id: request_id,
            parent_id: None,
            caller: None,
            action: None,
            level: 1,
            meta: Map::new(),
            timeout: None,
        }
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: Value) -> Self {
        self.meta.insert(key.into(), value);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_caller(mut self, caller: impl Into<String>) -> Self {
        self.caller = Some(caller.into());
        self
    }

    pub fn with_action(mut self, action: impl Into<String>) -> Self {
        self.action = Some(action.into());
        self
    }

    /// Child context for a nested call made on behalf of this one.
    pub fn derive(&self, caller: impl Into<String>) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            correlation_id: self.correlation_id,
            parent_id: Some(self.request_id),
            caller: Some(caller.into()),
            action: None,
            level: self.level + 1,
            meta: self.meta.clone(),
            timeout: None,
        }
    }

    pub fn correlation(&self) -> Correlation {
        Correlation {
            correlation_id: self.correlation_id,
            parent_id: Some(self.request_id),
            level: self.level,
            meta: self.meta.clone(),
        }
    }

    /// Fresh context for work resumed from a serialized [`Correlation`].
    pub fn from_correlation(correlation: &Correlation, caller: impl Into<String>) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            correlation_id: correlation.correlation_id,
            parent_id: correlation.parent_id,
            caller: Some(caller.into()),
            action: None,
            level: correlation.level + 1,
            meta: correlation.meta.clone(),
            timeout: None,
        }
    }
}

/// The part of a [`CallContext`] that travels with channel messages and events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Correlation {
    pub correlation_id: Uuid,
    pub parent_id: Option<Uuid>,
    pub level: u32,
    pub meta: Map<String, Value>,
}
