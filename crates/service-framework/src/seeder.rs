//! # Seeder
//!
//! Populates an empty collection once per process start. The broker runs it
//! as a start hook, so no action is served until it has finished:
//!
//! 1. wait for the adapter to connect
//! 2. `count()`; transient failures are retried per the adapter's
//!    [`ReconnectPolicy`](crate::store::ReconnectPolicy)
//! 3. when the count is zero, insert the seed set with one bulk insert
//!
//! Concurrent processes starting against the same empty store may both seed;
//! the once-guard only covers this process.

use crate::error::{ServiceError, StoreError};
use crate::store::{Record, StoreAdapter};
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{info, instrument, warn};

/// Work run by the broker after registration and before serving calls.
#[async_trait]
pub trait StartHook: Send + Sync {
    fn name(&self) -> &str;

    async fn started(&self) -> Result<(), ServiceError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeedOutcome {
    Seeded { inserted: usize, total: usize },
    Skipped { existing: usize },
}

pub struct Seeder {
    collection: String,
    adapter: Arc<dyn StoreAdapter>,
    seed: Vec<Record>,
    outcome: OnceCell<SeedOutcome>,
}

impl std::fmt::Debug for Seeder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Seeder")
            .field("collection", &self.collection)
            .field("seed", &self.seed.len())
            .field("outcome", &self.outcome.get())
            .finish_non_exhaustive()
    }
}

impl Seeder {
    pub fn new(
        collection: impl Into<String>,
        adapter: Arc<dyn StoreAdapter>,
        seed: Vec<Record>,
    ) -> Self {
        Self {
            collection: collection.into(),
            adapter,
            seed,
            outcome: OnceCell::new(),
        }
    }

    /// Seeds at most once; later calls return the first outcome.
    pub async fn run(&self) -> Result<SeedOutcome, ServiceError> {
        self.outcome.get_or_try_init(|| self.seed_once()).await.copied()
    }

    #[instrument(skip(self), fields(collection = %self.collection))]
    async fn seed_once(&self) -> Result<SeedOutcome, ServiceError> {
        self.retrying("connect", || self.adapter.connect()).await?;

        let existing = self
            .retrying("count", || self.adapter.count(Record::new()))
            .await?;
        if existing > 0 {
            return Ok(SeedOutcome::Skipped { existing });
        }

        info!(
            "The '{}' collection is empty. Seeding the collection...",
            self.collection
        );
        let inserted = self.adapter.insert_many(self.seed.clone()).await?.len();
        let total = self
            .retrying("count", || self.adapter.count(Record::new()))
            .await?;
        info!("Seeding is done. Number of records: {total}");

        Ok(SeedOutcome::Seeded { inserted, total })
    }

    async fn retrying<T, F, Fut>(&self, operation: &str, mut call: F) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let policy = self.adapter.reconnect_policy();
        let mut failed = 0;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() => {
                    failed += 1;
                    if !policy.allows(failed) {
                        warn!(operation, attempts = failed, error = %e, "Store still unavailable, giving up");
                        return Err(e);
                    }
                    let delay = policy.delay(failed);
                    warn!(operation, attempt = failed, ?delay, error = %e, "Store unavailable, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[async_trait]
impl StartHook for Seeder {
    fn name(&self) -> &str {
        &self.collection
    }

    async fn started(&self) -> Result<(), ServiceError> {
        self.run().await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockAdapter;
    use crate::store::{MemoryStore, ReconnectPolicy, StoreClient};
    use serde_json::json;
    use std::time::Duration;

    fn seed() -> Vec<Record> {
        vec![
            json!({ "name": "iPhone 11 Pro", "quantity": 25 }).as_object().cloned().unwrap(),
            json!({ "name": "Huawei P30 Pro", "quantity": 15 }).as_object().cloned().unwrap(),
        ]
    }

    fn quick(adapter: StoreClient, max_attempts: Option<u32>) -> Arc<dyn StoreAdapter> {
        Arc::new(adapter.with_reconnect_policy(ReconnectPolicy {
            max_attempts,
            backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
        }))
    }

    #[tokio::test]
    async fn test_empty_collection_is_seeded_with_one_bulk_insert() {
        let mock = MockAdapter::new();
        mock.expect_connect().return_ok(());
        mock.expect_count().return_ok(0);
        mock.expect_insert_many().return_ok(seed());
        mock.expect_count().return_ok(2);

        let seeder = Seeder::new("products", quick(mock.adapter(), None), seed());
        let outcome = seeder.run().await.unwrap();

        assert_eq!(outcome, SeedOutcome::Seeded { inserted: 2, total: 2 });
        assert_eq!(mock.calls("insert_many"), 1);
        mock.verify();
    }

    #[tokio::test]
    async fn test_populated_collection_is_left_alone() {
        let mock = MockAdapter::new();
        mock.expect_connect().return_ok(());
        mock.expect_count().return_ok(3);

        let seeder = Seeder::new("products", quick(mock.adapter(), None), seed());
        assert_eq!(seeder.run().await.unwrap(), SeedOutcome::Skipped { existing: 3 });
        assert_eq!(mock.calls("insert_many"), 0);
        mock.verify();
    }

    #[tokio::test]
    async fn test_transient_count_failure_is_retried() {
        let mock = MockAdapter::new();
        mock.expect_connect().return_err(StoreError::Unavailable("refused".into()));
        mock.expect_connect().return_ok(());
        mock.expect_count().return_err(StoreError::Timeout);
        mock.expect_count().return_ok(1);

        let seeder = Seeder::new("products", quick(mock.adapter(), None), seed());
        assert_eq!(seeder.run().await.unwrap(), SeedOutcome::Skipped { existing: 1 });
        mock.verify();
    }

    #[tokio::test]
    async fn test_gives_up_when_policy_is_exhausted() {
        let mock = MockAdapter::new();
        mock.expect_connect().return_err(StoreError::Unavailable("refused".into()));
        mock.expect_connect().return_err(StoreError::Unavailable("refused".into()));

        let seeder = Seeder::new("products", quick(mock.adapter(), Some(2)), seed());
        let err = seeder.run().await.unwrap_err();
        assert!(matches!(err, ServiceError::TransientStore(StoreError::Unavailable(_))));
        mock.verify();
    }

    #[tokio::test]
    async fn test_runs_once_per_process() {
        let (store, client) = MemoryStore::new("products", 10);
        tokio::spawn(store.run());

        let seeder = Seeder::new("products", Arc::new(client.clone()), seed());
        seeder.started().await.unwrap();
        seeder.started().await.unwrap();

        assert_eq!(client.count(Record::new()).await.unwrap(), 2);
    }
}
