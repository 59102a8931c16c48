//! # Mocks & Testing Guide
//!
//! Test doubles for the two collaborators whose failures are hard to provoke
//! for real: the storage adapter and the cache.
//!
//! | Double | Stands in for | Use it to |
//! |--------|---------------|-----------|
//! | [`MockAdapter`] | any [`StoreAdapter`] | script replies, inject `Unavailable`/`Timeout`, assert call sequences |
//! | [`create_mock_adapter`] + `expect_*` fns | any [`StoreAdapter`] | inspect request payloads and answer by hand |
//! | [`RecordingCacher`] | any [`Cacher`] | assert clean patterns, inject eviction failures |
//!
//! ## Scripted adapter
//!
//! ```rust
//! use service_framework::mock::MockAdapter;
//! use service_framework::store::{Record, StoreAdapter};
//! use service_framework::StoreError;
//!
//! #[tokio::main]
//! async fn main() {
//!     let mock = MockAdapter::new();
//!     mock.expect_count().return_err(StoreError::Unavailable("connection refused".into()));
//!     mock.expect_count().return_ok(0);
//!
//!     let adapter = mock.adapter();
//!     assert!(adapter.count(Record::new()).await.is_err());
//!     assert_eq!(adapter.count(Record::new()).await.unwrap(), 0);
//!     mock.verify();
//! }
//! ```
//!
//! A request that does not match the next expectation gets no reply (the
//! caller sees [`StoreError::Dropped`]) and makes [`MockAdapter::verify`] fail.
//!
//! ## Hand-answered adapter
//!
//! ```rust
//! use service_framework::mock::{create_mock_adapter, expect_insert_many};
//! use service_framework::store::StoreAdapter;
//!
//! #[tokio::main]
//! async fn main() {
//!     let (adapter, mut requests) = create_mock_adapter(10);
//!     let task = tokio::spawn(async move { adapter.insert_many(vec![Default::default()]).await });
//!
//!     let (records, respond_to) = expect_insert_many(&mut requests).await.unwrap();
//!     assert_eq!(records.len(), 1);
//!     respond_to.send(Ok(records)).unwrap();
//!     assert_eq!(task.await.unwrap().unwrap().len(), 1);
//! }
//! ```

use crate::cache::{Cacher, MemoryCacher};
use crate::error::{CacheError, StoreError};
use crate::store::message::{Response, StoreRequest};
use crate::store::{Record, StoreAdapter, StoreClient};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// =============================================================================
// EXPECTATION BUILDER API
// =============================================================================

#[derive(Debug)]
enum Expectation {
    Connect(Result<(), StoreError>),
    Count(Result<usize, StoreError>),
    Find(Result<Vec<Record>, StoreError>),
    FindById(Result<Option<Record>, StoreError>),
    Insert(Result<Record, StoreError>),
    InsertMany(Result<Vec<Record>, StoreError>),
    Update(Result<Option<Record>, StoreError>),
    Remove(Result<Option<Record>, StoreError>),
}

type Expectations = Arc<Mutex<VecDeque<Expectation>>>;

/// A store adapter answering from a queue of scripted replies.
pub struct MockAdapter {
    client: StoreClient,
    expectations: Expectations,
    requests: Arc<Mutex<Vec<&'static str>>>,
    unexpected: Arc<Mutex<Vec<String>>>,
    _handle: tokio::task::JoinHandle<()>,
}

impl Default for MockAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl MockAdapter {
    /// Must be called inside a Tokio runtime.
    pub fn new() -> Self {
        let (sender, mut receiver) = mpsc::channel::<StoreRequest>(100);
        let expectations: Expectations = Arc::default();
        let requests: Arc<Mutex<Vec<&'static str>>> = Arc::default();
        let unexpected: Arc<Mutex<Vec<String>>> = Arc::default();

        let handle = {
            let expectations = expectations.clone();
            let requests = requests.clone();
            let unexpected = unexpected.clone();
            tokio::spawn(async move {
                while let Some(request) = receiver.recv().await {
                    let operation = request.operation();
                    lock(&requests).push(operation);
                    let expectation = lock(&expectations).pop_front();

                    match (request, expectation) {
                        (StoreRequest::Ping { respond_to }, Some(Expectation::Connect(r))) => {
                            let _ = respond_to.send(r);
                        }
                        (StoreRequest::Count { respond_to, .. }, Some(Expectation::Count(r))) => {
                            let _ = respond_to.send(r);
                        }
                        (StoreRequest::Find { respond_to, .. }, Some(Expectation::Find(r))) => {
                            let _ = respond_to.send(r);
                        }
                        (
                            StoreRequest::FindById { respond_to, .. },
                            Some(Expectation::FindById(r)),
                        ) => {
                            let _ = respond_to.send(r);
                        }
                        (StoreRequest::Insert { respond_to, .. }, Some(Expectation::Insert(r))) => {
                            let _ = respond_to.send(r);
                        }
                        (
                            StoreRequest::InsertMany { respond_to, .. },
                            Some(Expectation::InsertMany(r)),
                        ) => {
                            let _ = respond_to.send(r);
                        }
                        (StoreRequest::Update { respond_to, .. }, Some(Expectation::Update(r))) => {
                            let _ = respond_to.send(r);
                        }
                        (StoreRequest::Remove { respond_to, .. }, Some(Expectation::Remove(r))) => {
                            let _ = respond_to.send(r);
                        }
                        (_, expectation) => {
                            lock(&unexpected).push(format!(
                                "unexpected {operation} (next expectation: {expectation:?})"
                            ));
                        }
                    }
                }
            })
        };

        Self {
            client: StoreClient::new(sender),
            expectations,
            requests,
            unexpected,
            _handle: handle,
        }
    }

    /// The adapter handed to the code under test.
    pub fn adapter(&self) -> StoreClient {
        self.client.clone()
    }

    pub fn expect_connect(&self) -> ExpectationBuilder<()> {
        self.builder(Expectation::Connect)
    }

    pub fn expect_count(&self) -> ExpectationBuilder<usize> {
        self.builder(Expectation::Count)
    }

    pub fn expect_find(&self) -> ExpectationBuilder<Vec<Record>> {
        self.builder(Expectation::Find)
    }

    pub fn expect_find_by_id(&self) -> ExpectationBuilder<Option<Record>> {
        self.builder(Expectation::FindById)
    }

    pub fn expect_insert(&self) -> ExpectationBuilder<Record> {
        self.builder(Expectation::Insert)
    }

    pub fn expect_insert_many(&self) -> ExpectationBuilder<Vec<Record>> {
        self.builder(Expectation::InsertMany)
    }

    pub fn expect_update(&self) -> ExpectationBuilder<Option<Record>> {
        self.builder(Expectation::Update)
    }

    pub fn expect_remove(&self) -> ExpectationBuilder<Option<Record>> {
        self.builder(Expectation::Remove)
    }

    /// Operations received so far, in order.
    pub fn requests(&self) -> Vec<&'static str> {
        lock(&self.requests).clone()
    }

    /// How many times `operation` (e.g. `"insert_many"`) was requested.
    pub fn calls(&self, operation: &str) -> usize {
        lock(&self.requests).iter().filter(|op| **op == operation).count()
    }

    /// Panics if an expectation is left over or a request was unexpected.
    pub fn verify(&self) {
        let unexpected = lock(&self.unexpected);
        if !unexpected.is_empty() {
            panic!("Unexpected requests: {unexpected:?}");
        }
        let remaining = lock(&self.expectations);
        if !remaining.is_empty() {
            panic!("Not all expectations were met. {} remaining", remaining.len());
        }
    }

    fn builder<T>(&self, wrap: fn(Result<T, StoreError>) -> Expectation) -> ExpectationBuilder<T> {
        ExpectationBuilder {
            expectations: self.expectations.clone(),
            wrap,
        }
    }
}

/// Completes one scripted expectation.
pub struct ExpectationBuilder<T> {
    expectations: Expectations,
    wrap: fn(Result<T, StoreError>) -> Expectation,
}

impl<T> ExpectationBuilder<T> {
    pub fn return_ok(self, value: T) {
        lock(&self.expectations).push_back((self.wrap)(Ok(value)));
    }

    pub fn return_err(self, error: StoreError) {
        lock(&self.expectations).push_back((self.wrap)(Err(error)));
    }
}

// =============================================================================
// RECEIVER HELPERS
// =============================================================================

/// Creates an adapter whose requests arrive on the returned receiver.
pub fn create_mock_adapter(buffer_size: usize) -> (StoreClient, mpsc::Receiver<StoreRequest>) {
    let (sender, receiver) = mpsc::channel(buffer_size);
    (StoreClient::new(sender), receiver)
}

/// Next request, if it is a connect.
pub async fn expect_connect(receiver: &mut mpsc::Receiver<StoreRequest>) -> Option<Response<()>> {
    match receiver.recv().await {
        Some(StoreRequest::Ping { respond_to }) => Some(respond_to),
        _ => None,
    }
}

/// Next request, if it is a count.
pub async fn expect_count(
    receiver: &mut mpsc::Receiver<StoreRequest>,
) -> Option<(Record, Response<usize>)> {
    match receiver.recv().await {
        Some(StoreRequest::Count { query, respond_to }) => Some((query, respond_to)),
        _ => None,
    }
}

/// Next request, if it is a bulk insert.
pub async fn expect_insert_many(
    receiver: &mut mpsc::Receiver<StoreRequest>,
) -> Option<(Vec<Record>, Response<Vec<Record>>)> {
    match receiver.recv().await {
        Some(StoreRequest::InsertMany {
            records,
            respond_to,
        }) => Some((records, respond_to)),
        _ => None,
    }
}

/// Next request, if it is an update.
pub async fn expect_update(
    receiver: &mut mpsc::Receiver<StoreRequest>,
) -> Option<(String, Record, Response<Option<Record>>)> {
    match receiver.recv().await {
        Some(StoreRequest::Update {
            id,
            patch,
            respond_to,
        }) => Some((id, patch, respond_to)),
        _ => None,
    }
}

// =============================================================================
// CACHE
// =============================================================================

/// A working in-memory cache that also records every clean pattern.
#[derive(Debug, Default)]
pub struct RecordingCacher {
    inner: MemoryCacher,
    cleaned: Mutex<Vec<String>>,
    fail_clean: bool,
}

impl RecordingCacher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every `clean` fails after being recorded.
    pub fn failing() -> Self {
        Self {
            fail_clean: true,
            ..Self::default()
        }
    }

    pub fn cleaned(&self) -> Vec<String> {
        lock(&self.cleaned).clone()
    }
}

#[async_trait]
impl Cacher for RecordingCacher {
    async fn get(&self, key: &str) -> Result<Option<Value>, CacheError> {
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: Value, epoch: u64) -> Result<bool, CacheError> {
        self.inner.set(key, value, epoch).await
    }

    async fn clean(&self, pattern: &str) -> Result<usize, CacheError> {
        lock(&self.cleaned).push(pattern.to_string());
        if self.fail_clean {
            return Err(CacheError::Backend("injected clean failure".into()));
        }
        self.inner.clean(pattern).await
    }

    fn epoch(&self) -> u64 {
        self.inner.epoch()
    }
}
