//! # Storage Adapter Boundary
//!
//! The capability interface every backing store exposes: CRUD, count and
//! bulk insert over raw records keyed by a string identifier in `_id`. The
//! adapter owns representation and consistency; the entity store above it
//! owns translation into entity shape.

use crate::error::StoreError;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::time::Duration;

/// A raw adapter record.
pub type Record = Map<String, Value>;

/// Field holding the adapter-level identifier.
pub const ID_FIELD: &str = "_id";

/// Query shape shared by `find` and `list`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    /// Field equality conditions, all of which must hold.
    pub query: Record,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
    /// Field name, prefixed with `-` for descending order.
    pub sort: Option<String>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn query(mut self, query: Record) -> Self {
        self.query = query;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn sort(mut self, sort: impl Into<String>) -> Self {
        self.sort = Some(sort.into());
        self
    }

    pub fn matches(&self, record: &Record) -> bool {
        self.query
            .iter()
            .all(|(field, expected)| record.get(field) == Some(expected))
    }

    /// Applies sort, offset and limit to already matched records.
    pub fn apply(&self, mut records: Vec<Record>) -> Vec<Record> {
        if let Some(sort) = &self.sort {
            let (field, descending) = match sort.strip_prefix('-') {
                Some(field) => (field, true),
                None => (sort.as_str(), false),
            };
            records.sort_by(|a, b| {
                let ordering = compare(a.get(field), b.get(field));
                if descending {
                    ordering.reverse()
                } else {
                    ordering
                }
            });
        }
        records
            .into_iter()
            .skip(self.offset.unwrap_or(0))
            .take(self.limit.unwrap_or(usize::MAX))
            .collect()
    }
}

fn compare(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (Some(Value::Number(x)), Some(Value::Number(y))) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        (Some(_), None) => Ordering::Greater,
        (None, Some(_)) => Ordering::Less,
        _ => Ordering::Equal,
    }
}

/// How long to wait between attempts to reach an unavailable store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Total attempts allowed; `None` keeps trying.
    pub max_attempts: Option<u32>,
    pub backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: None,
            backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(10),
        }
    }
}

impl ReconnectPolicy {
    /// Exponential delay after `failed` consecutive failures, capped at `max_backoff`.
    pub fn delay(&self, failed: u32) -> Duration {
        let factor = 1u32 << failed.saturating_sub(1).min(16);
        self.backoff.saturating_mul(factor).min(self.max_backoff)
    }

    /// Whether another attempt may follow `failed` consecutive failures.
    pub fn allows(&self, failed: u32) -> bool {
        self.max_attempts.map_or(true, |max| failed < max)
    }
}

#[async_trait]
pub trait StoreAdapter: Send + Sync {
    /// Resolves once the backing store is reachable.
    async fn connect(&self) -> Result<(), StoreError>;

    async fn count(&self, query: Record) -> Result<usize, StoreError>;

    async fn find(&self, filter: Filter) -> Result<Vec<Record>, StoreError>;

    async fn find_by_id(&self, id: &str) -> Result<Option<Record>, StoreError>;

    /// Inserts one record, assigning `_id` when absent.
    async fn insert(&self, record: Record) -> Result<Record, StoreError>;

    /// Bulk insert in a single round trip.
    async fn insert_many(&self, records: Vec<Record>) -> Result<Vec<Record>, StoreError>;

    /// Merges `patch` into the record. `None` when the id is unknown.
    async fn update_by_id(&self, id: &str, patch: Record) -> Result<Option<Record>, StoreError>;

    async fn remove_by_id(&self, id: &str) -> Result<Option<Record>, StoreError>;

    fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: Value) -> Record {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_filter_sort_and_page() {
        let records = vec![
            record(json!({ "name": "b", "price": 999 })),
            record(json!({ "name": "a", "price": 679 })),
            record(json!({ "name": "c", "price": 704 })),
        ];

        let page = Filter::new().sort("-price").offset(1).limit(1).apply(records);
        assert_eq!(page.len(), 1);
        assert_eq!(page[0]["price"], 704);
    }

    #[test]
    fn test_filter_matches_on_equality() {
        let filter = Filter::new().query(record(json!({ "name": "a" })));
        assert!(filter.matches(&record(json!({ "name": "a", "price": 1 }))));
        assert!(!filter.matches(&record(json!({ "name": "b" }))));
    }

    #[test]
    fn test_reconnect_policy_backoff() {
        let policy = ReconnectPolicy {
            max_attempts: Some(3),
            backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(250),
        };
        assert_eq!(policy.delay(1), Duration::from_millis(100));
        assert_eq!(policy.delay(2), Duration::from_millis(200));
        assert_eq!(policy.delay(5), Duration::from_millis(250));
        assert!(policy.allows(2));
        assert!(!policy.allows(3));
        assert!(ReconnectPolicy::default().allows(u32::MAX));
    }
}
