//! # Cache
//!
//! Read-through cache for action results. Keys are
//! `"<action>:<fingerprint>"`, and since action names are namespaced by
//! service (`products.get`), every key of a service starts with
//! `"<service>."`. Handlers only read through; evictions come from the
//! [`CacheInvalidator`].
//!
//! A read that raced with an eviction must not repopulate the cache with the
//! pre-eviction value. [`Cacher::epoch`] is bumped by every `clean`; a read
//! captures the epoch before querying the store and `set` drops the value if
//! the epoch has moved since.

pub mod invalidator;

pub use invalidator::CacheInvalidator;

use crate::error::CacheError;
use async_trait::async_trait;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use tracing::debug;

#[async_trait]
pub trait Cacher: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>, CacheError>;

    /// Stores `value` unless a `clean` happened after `epoch` was read.
    /// Returns whether the value was stored.
    async fn set(&self, key: &str, value: Value, epoch: u64) -> Result<bool, CacheError>;

    /// Evicts every key matching `pattern` (exact, or prefix when it ends in `*`).
    async fn clean(&self, pattern: &str) -> Result<usize, CacheError>;

    fn epoch(&self) -> u64;
}

/// `true` when `key` matches a clean pattern.
pub fn matches_pattern(pattern: &str, key: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => key.starts_with(prefix),
        None => key == pattern,
    }
}

#[derive(Debug, Default)]
pub struct MemoryCacher {
    entries: RwLock<HashMap<String, Value>>,
    epoch: AtomicU64,
}

impl MemoryCacher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl Cacher for MemoryCacher {
    async fn get(&self, key: &str) -> Result<Option<Value>, CacheError> {
        let entries = self.entries.read().map_err(|_| CacheError::Poisoned)?;
        Ok(entries.get(key).cloned())
    }

    async fn set(&self, key: &str, value: Value, epoch: u64) -> Result<bool, CacheError> {
        let mut entries = self.entries.write().map_err(|_| CacheError::Poisoned)?;
        if self.epoch.load(Ordering::Acquire) != epoch {
            debug!(key, "Skipping stale cache write");
            return Ok(false);
        }
        entries.insert(key.to_string(), value);
        Ok(true)
    }

    async fn clean(&self, pattern: &str) -> Result<usize, CacheError> {
        let mut entries = self.entries.write().map_err(|_| CacheError::Poisoned)?;
        self.epoch.fetch_add(1, Ordering::AcqRel);
        let before = entries.len();
        entries.retain(|key, _| !matches_pattern(pattern, key));
        Ok(before - entries.len())
    }

    fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }
}

/// Builds deterministic cache keys from an action name and its parameters.
#[derive(Debug, Clone, Default)]
pub struct CacheKeyBuilder {
    max_key_length: Option<usize>,
}

impl CacheKeyBuilder {
    pub fn new(max_key_length: Option<usize>) -> Self {
        Self { max_key_length }
    }

    /// `keys` restricts the fingerprint to those parameters, in order.
    pub fn key(
        &self,
        action: &str,
        params: &serde_json::Map<String, Value>,
        keys: Option<&[String]>,
    ) -> String {
        let fingerprint = match keys {
            Some(keys) => keys
                .iter()
                .map(|k| match params.get(k) {
                    Some(Value::String(s)) => s.clone(),
                    Some(v) => v.to_string(),
                    None => String::new(),
                })
                .collect::<Vec<_>>()
                .join("|"),
            // serde_json maps iterate in key order, so this is stable.
            None => Value::Object(params.clone()).to_string(),
        };

        match self.max_key_length {
            Some(max) if action.len() + 1 + fingerprint.len() > max => {
                format!("{action}:{:x}", Sha256::digest(fingerprint.as_bytes()))
            }
            _ => format!("{action}:{fingerprint}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params(value: Value) -> serde_json::Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_clean_evicts_namespace_only() {
        let cacher = MemoryCacher::new();
        cacher.set("products.get:1", json!(1), 0).await.unwrap();
        cacher.set("products.list:{}", json!([]), 0).await.unwrap();
        cacher.set("greeter.hello:{}", json!("hi"), 0).await.unwrap();

        assert_eq!(cacher.clean("products.*").await.unwrap(), 2);
        assert_eq!(cacher.get("products.get:1").await.unwrap(), None);
        assert_eq!(cacher.get("greeter.hello:{}").await.unwrap(), Some(json!("hi")));
    }

    #[tokio::test]
    async fn test_stale_write_after_clean_is_dropped() {
        let cacher = MemoryCacher::new();
        let epoch = cacher.epoch();
        cacher.clean("products.*").await.unwrap();

        assert!(!cacher.set("products.get:1", json!(1), epoch).await.unwrap());
        assert!(cacher.is_empty());
        assert!(cacher.set("products.get:1", json!(1), cacher.epoch()).await.unwrap());
    }

    #[test]
    fn test_key_is_order_independent() {
        let builder = CacheKeyBuilder::default();
        let a = builder.key("products.list", &params(json!({ "page": 1, "pageSize": 10 })), None);
        let b = builder.key("products.list", &params(json!({ "pageSize": 10, "page": 1 })), None);
        assert_eq!(a, b);
        assert!(a.starts_with("products."));
    }

    #[test]
    fn test_key_with_selected_params() {
        let builder = CacheKeyBuilder::default();
        let keys = vec!["id".to_string()];
        let key = builder.key("products.get", &params(json!({ "id": "5", "x": 1 })), Some(&keys));
        assert_eq!(key, "products.get:5");
    }

    #[test]
    fn test_long_fingerprint_is_hashed() {
        let builder = CacheKeyBuilder::new(Some(32));
        let key = builder.key("products.find", &params(json!({ "query": "x".repeat(100) })), None);
        assert!(key.starts_with("products.find:"));
        assert_eq!(key.len(), "products.find:".len() + 64);
    }

    #[test]
    fn test_pattern_matching() {
        assert!(matches_pattern("products.*", "products.get:1"));
        assert!(!matches_pattern("products.*", "productsx.get:1"));
        assert!(matches_pattern("products.get:1", "products.get:1"));
    }
}
