//! # Store Client
//!
//! Cheap-to-clone handle implementing [`StoreAdapter`] by forwarding each call
//! to the task that owns the collection.

use super::adapter::{Filter, Record, ReconnectPolicy, StoreAdapter};
use super::message::{Response, StoreRequest};
use crate::error::StoreError;
use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

#[derive(Clone, Debug)]
pub struct StoreClient {
    sender: mpsc::Sender<StoreRequest>,
    policy: ReconnectPolicy,
}

impl StoreClient {
    pub fn new(sender: mpsc::Sender<StoreRequest>) -> Self {
        Self {
            sender,
            policy: ReconnectPolicy::default(),
        }
    }

    pub fn with_reconnect_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.policy = policy;
        self
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(Response<T>) -> StoreRequest,
    ) -> Result<T, StoreError> {
        let (respond_to, response) = oneshot::channel();
        self.sender
            .send(build(respond_to))
            .await
            .map_err(|_| StoreError::Closed)?;
        response.await.map_err(|_| StoreError::Dropped)?
    }
}

#[async_trait]
impl StoreAdapter for StoreClient {
    async fn connect(&self) -> Result<(), StoreError> {
        self.request(|respond_to| StoreRequest::Ping { respond_to })
            .await
    }

    async fn count(&self, query: Record) -> Result<usize, StoreError> {
        self.request(|respond_to| StoreRequest::Count { query, respond_to })
            .await
    }

    async fn find(&self, filter: Filter) -> Result<Vec<Record>, StoreError> {
        self.request(|respond_to| StoreRequest::Find { filter, respond_to })
            .await
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<Record>, StoreError> {
        let id = id.to_string();
        self.request(|respond_to| StoreRequest::FindById { id, respond_to })
            .await
    }

    async fn insert(&self, record: Record) -> Result<Record, StoreError> {
        self.request(|respond_to| StoreRequest::Insert { record, respond_to })
            .await
    }

    async fn insert_many(&self, records: Vec<Record>) -> Result<Vec<Record>, StoreError> {
        self.request(|respond_to| StoreRequest::InsertMany {
            records,
            respond_to,
        })
        .await
    }

    async fn update_by_id(&self, id: &str, patch: Record) -> Result<Option<Record>, StoreError> {
        let id = id.to_string();
        self.request(|respond_to| StoreRequest::Update {
            id,
            patch,
            respond_to,
        })
        .await
    }

    async fn remove_by_id(&self, id: &str) -> Result<Option<Record>, StoreError> {
        let id = id.to_string();
        self.request(|respond_to| StoreRequest::Remove { id, respond_to })
            .await
    }

    fn reconnect_policy(&self) -> ReconnectPolicy {
        self.policy
    }
}
